//! shtest: functional tests for command-line sessions
//!
//! A session script interleaves shell commands with their expected output,
//! in the style of Mercurial's unified test format:
//!
//! ```text
//! A test that greets the world.
//!
//!   $ echo hello
//!   hello
//!   $ cat missing.txt
//!   cat: missing.txt: No such file or directory (glob)
//!   [1]
//! ```
//!
//! Every command block runs through one shell session; the merged output is
//! re-associated with its block via salted in-band markers, and compared
//! against the expected text with an alignment that understands trailing
//! line annotations:
//!
//! | Annotation | Meaning |
//! |------------|---------|
//! | `(re)` | the line is a regular expression matching the whole output line |
//! | `(glob)` | `*` and `?` wildcards, everything else literal |
//! | `(esc)` | backslash escapes are decoded before comparison |
//!
//! Nonzero exit codes render as `[<code>]` lines and diff like any other
//! output; a session exit code of 80 skips the whole test.
//!
//! # Library usage
//!
//! ```rust,ignore
//! let outcome = shtest::run_lines("  $ echo hi\n  hi\n", &shtest::TestConfig::default())?;
//! assert!(outcome.is_pass());
//! ```

mod diff;
mod error;
mod report;
mod runner;
mod script;
mod session;

pub use diff::{lines_match, unified_diff};
pub use error::{ErrorKind, RunError};
pub use report::{
    ConsoleOptions, ConsoleReporter, Counts, PatchMerge, Reporter, TestReport, XunitReporter,
};
pub use runner::{
    discover, run_file, run_lines, Outcome, RunContext, TestCase, TestConfig, TEST_EXTENSION,
};
pub use script::{CommandBlock, LineRole, Script, ScriptLine};
pub use session::{run_session, SessionConfig, SessionOutput, SKIP_EXIT_CODE};
