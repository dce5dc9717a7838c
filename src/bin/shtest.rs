//! shtest CLI
//!
//! Run shell session test scripts and report the results.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;

use shtest::{
    discover, ConsoleOptions, ConsoleReporter, Counts, PatchMerge, Reporter, RunContext,
    TestConfig, TestReport, XunitReporter,
};

#[derive(Parser, Debug)]
#[command(name = "shtest")]
#[command(version)]
#[command(about = "Run shell session test scripts")]
struct Cli {
    /// Test files or directories to run
    #[arg(required = true, value_name = "TESTS")]
    paths: Vec<PathBuf>,

    /// Don't print diffs
    #[arg(short, long, conflicts_with = "interactive")]
    quiet: bool,

    /// Show filenames and test status
    #[arg(short, long)]
    verbose: bool,

    /// Interactively merge changed test output
    #[arg(short, long)]
    interactive: bool,

    /// Write script output directly to the terminal
    #[arg(short, long, conflicts_with_all = ["quiet", "interactive", "verbose", "xunit_file"])]
    debug: bool,

    /// Answer yes to all questions
    #[arg(short = 'y', long, conflicts_with = "no")]
    yes: bool,

    /// Answer no to all questions
    #[arg(short = 'n', long)]
    no: bool,

    /// Don't reset common environment variables
    #[arg(short = 'E', long)]
    preserve_env: bool,

    /// Don't write .err files on test failures
    #[arg(long)]
    no_err_files: bool,

    /// Keep temporary directories
    #[arg(long)]
    keep_tmpdir: bool,

    /// Shell to run tests in
    #[arg(long, default_value = "/bin/sh", value_name = "PATH")]
    shell: PathBuf,

    /// Arguments to invoke the shell with
    #[arg(long, value_name = "OPTS")]
    shell_opts: Option<String>,

    /// Number of spaces to use for indentation
    #[arg(long, default_value_t = 2, value_name = "NUM")]
    indent: usize,

    /// Path to write xUnit XML output
    #[arg(long, value_name = "PATH")]
    xunit_file: Option<PathBuf>,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
fn install_interrupt_flag() {
    extern "C" fn on_sigint(_signal: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}

#[cfg(not(unix))]
fn install_interrupt_flag() {}

fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(failed) => {
            if failed {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("shtest: {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    // Setup phase: everything here is fatal before any test runs.
    let shell = which::which(&cli.shell)
        .with_context(|| format!("shell not found: {}", cli.shell.display()))?;
    let mut shell_argv = vec![shell.to_string_lossy().into_owned()];
    if let Some(ref opts) = cli.shell_opts {
        shell_argv.extend(opts.split_whitespace().map(String::from));
    }

    let patch = if cli.interactive {
        let command = which::which("patch").context("patch(1) required for -i")?;
        Some(PatchMerge {
            command,
            answer: if cli.yes {
                Some(true)
            } else if cli.no {
                Some(false)
            } else {
                None
            },
        })
    } else {
        None
    };

    for path in &cli.paths {
        if !path.exists() {
            anyhow::bail!("no such file: {}", path.display());
        }
    }

    let tmproot = tempfile::Builder::new()
        .prefix("shtests-")
        .tempdir()
        .context("failed to create temporary directory")?;
    let proctmp = tmproot.path().join("tmp");
    std::fs::create_dir(&proctmp)?;
    std::env::set_var("SHTESTTMP", tmproot.path());
    for name in ["TMPDIR", "TEMP", "TMP"] {
        std::env::set_var(name, &proctmp);
    }

    let tests = discover(&cli.paths)?;
    if tests.is_empty() {
        anyhow::bail!("no tests found");
    }

    let ctx = RunContext {
        tmpdir: tmproot.path().to_path_buf(),
        config: TestConfig {
            shell: shell_argv,
            indent: cli.indent,
            clean_env: !cli.preserve_env,
            context: 3,
        },
    };

    install_interrupt_flag();

    let failed = if cli.debug {
        for test in &tests {
            if interrupted() {
                break;
            }
            test.debug(&ctx)?;
        }
        false
    } else {
        let mut reporters: Vec<Box<dyn Reporter>> =
            vec![Box::new(ConsoleReporter::new(ConsoleOptions {
                quiet: cli.quiet,
                verbose: cli.verbose,
                no_err_files: cli.no_err_files,
                patch,
            }))];
        if let Some(ref xunit_path) = cli.xunit_file {
            reporters.push(Box::new(XunitReporter::new(xunit_path.clone())));
        }

        let mut counts = Counts::default();
        for test in &tests {
            if interrupted() {
                break;
            }
            let started = Instant::now();
            let outcome = test.run(&ctx)?;
            counts.record(&outcome);
            let report = TestReport {
                path: &test.path,
                outcome: &outcome,
                elapsed: started.elapsed(),
            };
            for reporter in reporters.iter_mut() {
                reporter.report(&report)?;
            }
        }
        for reporter in reporters.iter_mut() {
            reporter.finish(&counts)?;
        }
        counts.failed > 0
    };

    if cli.keep_tmpdir {
        println!("# Kept temporary directory: {}", tmproot.keep().display());
    }
    Ok(failed)
}
