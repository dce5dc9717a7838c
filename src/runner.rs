//! Test discovery, isolation, and the per-test pipeline
//!
//! Discovery enumerates `.t` files from the given paths and builds one
//! [`TestCase`] per surviving file. Running a case is lazy: nothing executes
//! until [`TestCase::run`], which gives the test a private working directory
//! under the run's temp root, drives segmenter → session → diff, and returns
//! the [`Outcome`]. Discovery itself never spawns anything.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::diff::unified_diff;
use crate::error::RunError;
use crate::script::Script;
use crate::session::{run_debug, run_session, SessionConfig, SessionOutput};

/// Extension a file must carry to be collected from a directory walk.
pub const TEST_EXTENSION: &str = "t";

/// Per-run test settings.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Shell argv; must be non-empty. The script is fed to `argv + ["-"]`.
    pub shell: Vec<String>,
    /// Indentation width for command and expected-output lines.
    pub indent: usize,
    /// Pin locale, timezone, and terminal variables for determinism.
    pub clean_env: bool,
    /// Context lines around each diff hunk.
    pub context: usize,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            shell: vec!["/bin/sh".into()],
            indent: 2,
            clean_env: true,
            context: 3,
        }
    }
}

/// Everything shared by the tests of one run.
#[derive(Debug)]
pub struct RunContext {
    /// Root under which each test gets its own working directory.
    pub tmpdir: PathBuf,
    pub config: TestConfig,
}

/// Result of one test: what was expected, what happened, and the difference.
#[derive(Debug)]
pub enum Outcome {
    /// Zero-byte test file; nothing was executed.
    Empty,
    /// The session exited with the skip code.
    Skipped { expected: Vec<String> },
    /// The session ran to completion.
    Completed {
        expected: Vec<String>,
        actual: Vec<String>,
        diff: Vec<String>,
    },
}

impl Outcome {
    pub fn is_skip(&self) -> bool {
        !matches!(self, Outcome::Completed { .. })
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Outcome::Completed { diff, .. } if !diff.is_empty())
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Completed { diff, .. } if diff.is_empty())
    }
}

/// One discovered test file.
#[derive(Debug)]
pub struct TestCase {
    /// Path as discovered, used for display and for the `.err` sibling.
    pub path: PathBuf,
    /// Canonical absolute path, used for deduplication and reading.
    pub abspath: PathBuf,
    /// Isolation directory name; unique even across duplicate basenames.
    pub name: String,
    empty: bool,
}

impl TestCase {
    /// Run this test in a fresh working directory under the run's temp root.
    ///
    /// Invoked at most once per case; the isolation directory is created
    /// here, and the previous working directory is restored on every exit
    /// path.
    pub fn run(&self, ctx: &RunContext) -> Result<Outcome, RunError> {
        if self.empty {
            return Ok(Outcome::Empty);
        }
        let testdir = ctx.tmpdir.join(&self.name);
        fs::create_dir(&testdir)?;
        let _guard = WorkDir::enter(&testdir)?;
        run_file(&self.abspath, &self.path, &ctx.config)
    }

    /// Debug-mode variant of [`TestCase::run`]: same isolation, but the
    /// script's commands write straight to the terminal.
    pub fn debug(&self, ctx: &RunContext) -> Result<(), RunError> {
        if self.empty {
            return Ok(());
        }
        let testdir = ctx.tmpdir.join(&self.name);
        fs::create_dir(&testdir)?;
        let _guard = WorkDir::enter(&testdir)?;
        let source = fs::read_to_string(&self.abspath)?;
        let script = Script::parse(&source, ctx.config.indent);
        let env = file_env(&self.abspath);
        run_debug(&script, &session_config(&ctx.config, env)?)
    }
}

/// Scoped working-directory change, restored on drop.
struct WorkDir {
    previous: PathBuf,
}

impl WorkDir {
    fn enter(dir: &Path) -> Result<Self, RunError> {
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self { previous })
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.previous);
    }
}

/// Enumerate test files and build their cases.
///
/// Directories are walked recursively in sorted order, skipping hidden
/// subdirectories and hidden files; explicit file arguments are taken as-is.
/// Duplicate paths collapse to their first appearance, and a basename seen
/// twice gets a discovery-order suffix so every case owns a distinct
/// isolation directory.
pub fn discover(paths: &[PathBuf]) -> Result<Vec<TestCase>, RunError> {
    let mut found: Vec<PathBuf> = Vec::new();
    for path in paths {
        if path.is_dir() {
            let walker = WalkDir::new(path)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
            for entry in walker {
                let entry = entry.map_err(|e| RunError::setup(e.to_string()))?;
                if entry.file_type().is_file() && has_test_extension(entry.path()) {
                    found.push(entry.path().to_path_buf());
                }
            }
        } else {
            found.push(path.clone());
        }
    }

    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut basenames: HashSet<String> = HashSet::new();
    let mut tests = Vec::new();
    for (i, path) in found.iter().enumerate() {
        let abspath = path
            .canonicalize()
            .map_err(|e| RunError::setup(e.to_string()).with_path(path.clone()))?;
        if !seen.insert(abspath.clone()) {
            continue;
        }
        let basename = abspath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = if basenames.insert(basename.clone()) {
            basename
        } else {
            format!("{}-{}", basename, i)
        };
        let empty = fs::metadata(&abspath)?.len() == 0;
        tests.push(TestCase {
            path: path.clone(),
            abspath,
            name,
            empty,
        });
    }
    Ok(tests)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn has_test_extension(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == TEST_EXTENSION)
}

/// Run script text through the session and diff engines.
///
/// The in-memory entry point: no file identity, so the diff headers are
/// empty and TESTDIR/TESTFILE are not set.
pub fn run_lines(source: &str, config: &TestConfig) -> Result<Outcome, RunError> {
    run_inner(source, None, Vec::new(), config)
}

/// Run the test file at `abspath`, using `display` for diff headers and the
/// `.err` sibling identity.
pub fn run_file(abspath: &Path, display: &Path, config: &TestConfig) -> Result<Outcome, RunError> {
    let source = fs::read_to_string(abspath)
        .map_err(|e| RunError::from(e).with_path(abspath.to_path_buf()))?;
    run_inner(&source, Some(display), file_env(abspath), config)
}

/// TESTDIR and TESTFILE for a file-based run.
fn file_env(abspath: &Path) -> Vec<(String, String)> {
    let mut env = Vec::new();
    if let Some(dir) = abspath.parent() {
        env.push(("TESTDIR".to_string(), dir.display().to_string()));
    }
    if let Some(name) = abspath.file_name() {
        env.push(("TESTFILE".to_string(), name.to_string_lossy().into_owned()));
    }
    env
}

fn run_inner(
    source: &str,
    display: Option<&Path>,
    extra_env: Vec<(String, String)>,
    config: &TestConfig,
) -> Result<Outcome, RunError> {
    let script = Script::parse(source, config.indent);
    let session = session_config(config, extra_env)?;

    match run_session(&script, &session)? {
        SessionOutput::Skipped => Ok(Outcome::Skipped {
            expected: script.reference(),
        }),
        SessionOutput::Lines(actual) => {
            let (from, to) = match display {
                Some(p) => (p.display().to_string(), format!("{}.err", p.display())),
                None => (String::new(), String::new()),
            };
            let expected = script.reference();
            let diff = unified_diff(&expected, &actual, &from, &to, config.context);
            Ok(Outcome::Completed {
                expected,
                actual,
                diff,
            })
        }
    }
}

/// Build the session environment: the process environment, optionally
/// sanitized for determinism, plus the identifying variables.
fn session_config(
    config: &TestConfig,
    extra_env: Vec<(String, String)>,
) -> Result<SessionConfig, RunError> {
    let shell = config
        .shell
        .first()
        .ok_or_else(|| RunError::setup("no shell configured"))?;

    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    if config.clean_env {
        for name in ["LANG", "LC_ALL", "LANGUAGE"] {
            env.insert(name.to_string(), "C".to_string());
        }
        env.insert("TZ".to_string(), "GMT".to_string());
        env.insert("CDPATH".to_string(), String::new());
        env.insert("COLUMNS".to_string(), "80".to_string());
        env.insert("GREP_OPTIONS".to_string(), String::new());
    }
    env.insert("TESTSHELL".to_string(), shell.clone());
    for (key, value) in extra_env {
        env.insert(key, value);
    }

    Ok(SessionConfig {
        shell: config.shell.clone(),
        env: env.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn discover_walks_sorted_and_skips_hidden() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("b.t"), "  $ true\n");
        touch(&root.path().join("a.t"), "  $ true\n");
        touch(&root.path().join("notes.txt"), "not a test\n");
        touch(&root.path().join(".hidden/inner.t"), "  $ true\n");
        touch(&root.path().join(".skipped.t"), "  $ true\n");
        touch(&root.path().join("sub/c.t"), "  $ true\n");

        let tests = discover(&[root.path().to_path_buf()]).unwrap();
        let names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a.t", "b.t", "c.t"]);
    }

    #[test]
    fn discover_deduplicates_by_canonical_path() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("x.t");
        touch(&file, "  $ true\n");

        let tests = discover(&[file.clone(), file.clone()]).unwrap();
        assert_eq!(tests.len(), 1);
    }

    #[test]
    fn discover_suffixes_duplicate_basenames() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("one/run.t"), "  $ true\n");
        touch(&root.path().join("two/run.t"), "  $ true\n");

        let tests = discover(&[root.path().to_path_buf()]).unwrap();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].name, "run.t");
        assert_eq!(tests[1].name, "run.t-1");
        assert_ne!(tests[0].name, tests[1].name);
    }

    #[test]
    fn discover_missing_path_is_setup_error() {
        let err = discover(&[PathBuf::from("/definitely/not/here.t")]).unwrap_err();
        assert!(err.is_setup());
    }

    #[test]
    fn empty_file_short_circuits_without_a_shell() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("empty.t");
        touch(&file, "");

        let tests = discover(&[file]).unwrap();
        let ctx = RunContext {
            tmpdir: root.path().to_path_buf(),
            config: TestConfig {
                // a missing shell proves nothing was spawned
                shell: vec!["/nonexistent/shell-binary".into()],
                ..TestConfig::default()
            },
        };
        let outcome = tests[0].run(&ctx).unwrap();
        assert!(matches!(outcome, Outcome::Empty));
        assert!(outcome.is_skip());
    }

    #[test]
    #[cfg(unix)]
    fn run_lines_passing_script() {
        let outcome = run_lines("  $ echo hi\n  hi\n", &TestConfig::default()).unwrap();
        assert!(outcome.is_pass());
        match outcome {
            Outcome::Completed {
                expected, actual, ..
            } => {
                assert_eq!(expected, vec!["  $ echo hi", "  hi"]);
                assert_eq!(actual, vec!["  $ echo hi", "  hi"]);
            }
            _ => panic!("expected a completed outcome"),
        }
    }

    #[test]
    #[cfg(unix)]
    fn run_lines_failing_script_diffs() {
        let outcome = run_lines("  $ echo hi\n  bye\n", &TestConfig::default()).unwrap();
        assert!(outcome.is_fail());
        match outcome {
            Outcome::Completed { diff, .. } => {
                assert!(diff.contains(&"-  bye".to_string()));
                assert!(diff.contains(&"+  hi".to_string()));
            }
            _ => panic!("expected a completed outcome"),
        }
    }

    #[test]
    #[cfg(unix)]
    fn run_lines_skip_exit_code() {
        let outcome = run_lines("  $ exit 80\n", &TestConfig::default()).unwrap();
        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert!(outcome.is_skip());
        assert!(!outcome.is_fail());
    }

    #[test]
    #[cfg(unix)]
    fn run_file_exposes_test_identity() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("ident.t");
        touch(&file, "  $ echo $TESTFILE\n  ident.t\n");

        let outcome = run_file(&file, &file, &TestConfig::default()).unwrap();
        assert!(outcome.is_pass());
    }

    #[test]
    #[cfg(unix)]
    fn clean_env_pins_locale_and_timezone() {
        let outcome = run_lines(
            "  $ echo $LANG $TZ $COLUMNS\n  C GMT 80\n",
            &TestConfig::default(),
        )
        .unwrap();
        assert!(outcome.is_pass());
    }

    #[test]
    #[cfg(unix)]
    fn isolation_directories_are_distinct_for_duplicate_basenames() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("one/pwd.t"), "  $ echo ran\n  ran\n");
        touch(&root.path().join("two/pwd.t"), "  $ echo ran\n  ran\n");
        let tmp = tempfile::tempdir().unwrap();

        let tests = discover(&[root.path().to_path_buf()]).unwrap();
        let ctx = RunContext {
            tmpdir: tmp.path().to_path_buf(),
            config: TestConfig::default(),
        };
        let before = std::env::current_dir().unwrap();
        for test in &tests {
            assert!(test.run(&ctx).unwrap().is_pass());
        }
        assert_eq!(std::env::current_dir().unwrap(), before);
        assert!(tmp.path().join("pwd.t").is_dir());
        assert!(tmp.path().join("pwd.t-1").is_dir());
    }
}
