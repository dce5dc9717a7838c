//! Result pipeline
//!
//! Observers for finished tests. The driver invokes each test's run callable
//! exactly once and hands the immutable [`Outcome`] to every registered
//! [`Reporter`] in declared order (console first, structured report after).
//! Reporters perform side effects only; the verdict and the aggregate counts
//! belong to the driver.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::RunError;
use crate::runner::Outcome;

/// Aggregate counters, owned by the driver and shared with reporters
/// read-only at finish time.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counts {
    pub total: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Counts {
    pub fn record(&mut self, outcome: &Outcome) {
        self.total += 1;
        if outcome.is_skip() {
            self.skipped += 1;
        } else if outcome.is_fail() {
            self.failed += 1;
        }
    }
}

/// One finished test, as seen by reporters.
#[derive(Debug)]
pub struct TestReport<'a> {
    pub path: &'a Path,
    pub outcome: &'a Outcome,
    pub elapsed: Duration,
}

/// A pass-through observer of test outcomes.
pub trait Reporter {
    /// Observe one finished test.
    fn report(&mut self, test: &TestReport<'_>) -> Result<(), RunError>;

    /// Called once after the last test.
    fn finish(&mut self, counts: &Counts) -> Result<(), RunError>;
}

/// Interactive merge settings for the console reporter.
#[derive(Debug, Clone)]
pub struct PatchMerge {
    /// The external patch-applying command; invoked as `<command> -p0` with
    /// the diff on stdin.
    pub command: PathBuf,
    /// Preset answer for the acceptance prompt (`--yes` / `--no`).
    pub answer: Option<bool>,
}

/// Console output options.
#[derive(Debug, Clone, Default)]
pub struct ConsoleOptions {
    /// Suppress diff printing.
    pub quiet: bool,
    /// Print one status line per test instead of progress dots.
    pub verbose: bool,
    /// Skip writing `.err` artifacts on failure.
    pub no_err_files: bool,
    /// Offer to merge changed output back into the test file.
    pub patch: Option<PatchMerge>,
}

/// Prints progress, writes/removes `.err` artifacts, and optionally merges
/// accepted changes back into the test file.
pub struct ConsoleReporter {
    options: ConsoleOptions,
}

impl ConsoleReporter {
    pub fn new(options: ConsoleOptions) -> Self {
        Self { options }
    }

    fn status(&self, progress: &str, verbose_word: &str, path: &Path) {
        if self.options.verbose {
            println!("{}: {}", path.display(), verbose_word);
        } else {
            print!("{}", progress);
        }
        let _ = io::stdout().flush();
    }

    fn on_failure(&self, path: &Path, actual: &[String], diff: &[String]) -> Result<(), RunError> {
        self.status("!", "failed", path);

        let err_path = PathBuf::from(format!("{}.err", path.display()));
        if !self.options.no_err_files {
            let mut body = String::new();
            for line in actual {
                body.push_str(line);
                body.push('\n');
            }
            fs::write(&err_path, body)?;
        }

        if self.options.quiet {
            return Ok(());
        }
        if !self.options.verbose {
            println!();
        }
        for line in diff {
            println!("{}", line);
        }
        let _ = io::stdout().flush();

        if let Some(ref merge) = self.options.patch {
            if prompt_accept(merge.answer)? {
                if apply_patch(&merge.command, diff)? {
                    println!("{}: merged output", path.display());
                    if !self.options.no_err_files {
                        let _ = fs::remove_file(&err_path);
                    }
                } else {
                    println!("{}: merge failed", path.display());
                }
            }
        }
        Ok(())
    }
}

impl Reporter for ConsoleReporter {
    fn report(&mut self, test: &TestReport<'_>) -> Result<(), RunError> {
        match test.outcome {
            Outcome::Empty => self.status("s", "empty", test.path),
            Outcome::Skipped { .. } => self.status("s", "skipped", test.path),
            Outcome::Completed { actual, diff, .. } => {
                if diff.is_empty() {
                    self.status(".", "passed", test.path);
                    let err_path = PathBuf::from(format!("{}.err", test.path.display()));
                    if err_path.exists() {
                        fs::remove_file(&err_path)?;
                    }
                } else {
                    self.on_failure(test.path, actual, diff)?;
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, counts: &Counts) -> Result<(), RunError> {
        if counts.total > 0 {
            if !self.options.verbose {
                println!();
            }
            println!(
                "# Ran {} tests, {} skipped, {} failed.",
                counts.total, counts.skipped, counts.failed
            );
        }
        Ok(())
    }
}

/// Ask for acceptance on stdout/stdin. An uppercase letter in the answer set
/// is the default; invalid input re-asks.
fn prompt_accept(preset: Option<bool>) -> Result<bool, RunError> {
    loop {
        print!("Accept this change? [yN] ");
        io::stdout().flush()?;
        if let Some(answer) = preset {
            println!("{}", if answer { "y" } else { "n" });
            return Ok(answer);
        }
        let mut input = String::new();
        if io::stdin().lock().read_line(&mut input)? == 0 {
            return Ok(false);
        }
        match input.trim().to_lowercase().as_str() {
            "" | "n" => return Ok(false),
            "y" => return Ok(true),
            _ => continue,
        }
    }
}

/// Feed the diff to `<command> -p0`. Returns whether the patch applied.
fn apply_patch(command: &Path, diff: &[String]) -> Result<bool, RunError> {
    let mut child = Command::new(command)
        .arg("-p0")
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| RunError::shell(format!("failed to spawn {}: {}", command.display(), e)))?;
    if let Some(mut stdin) = child.stdin.take() {
        for line in diff {
            stdin.write_all(line.as_bytes())?;
            stdin.write_all(b"\n")?;
        }
    }
    let status = child.wait()?;
    Ok(status.success())
}

/// Accumulates one record per test and writes an xUnit XML file after the
/// last test. Write errors propagate; an unwritable report is fatal.
pub struct XunitReporter {
    path: PathBuf,
    suite_started: std::time::Instant,
    timestamp: String,
    testcases: Vec<String>,
}

impl XunitReporter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            suite_started: std::time::Instant::now(),
            timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
            testcases: Vec::new(),
        }
    }
}

impl Reporter for XunitReporter {
    fn report(&mut self, test: &TestReport<'_>) -> Result<(), RunError> {
        let classname = test.path.display().to_string();
        let name = test
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| classname.clone());
        let seconds = test.elapsed.as_secs_f64();

        let record = match test.outcome {
            Outcome::Empty | Outcome::Skipped { .. } => format!(
                "  <testcase classname={} name={} time=\"{:.6}\">\n    <skipped/>\n  </testcase>\n",
                quote_attr(&classname),
                quote_attr(&name),
                seconds
            ),
            Outcome::Completed { diff, .. } if !diff.is_empty() => {
                let mut body = String::new();
                for line in diff {
                    body.push_str(line);
                    body.push('\n');
                }
                format!(
                    "  <testcase classname={} name={} time=\"{:.6}\">\n    <failure>{}</failure>\n  </testcase>\n",
                    quote_attr(&classname),
                    quote_attr(&name),
                    seconds,
                    cdata(&body)
                )
            }
            Outcome::Completed { .. } => format!(
                "  <testcase classname={} name={} time=\"{:.6}\"/>\n",
                quote_attr(&classname),
                quote_attr(&name),
                seconds
            ),
        };
        self.testcases.push(record);
        Ok(())
    }

    fn finish(&mut self, counts: &Counts) -> Result<(), RunError> {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let mut xml = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
             <testsuite name=\"shtest\"\n\
             \x20          tests=\"{}\"\n\
             \x20          failures=\"{}\"\n\
             \x20          skipped=\"{}\"\n\
             \x20          timestamp={}\n\
             \x20          hostname={}\n\
             \x20          time=\"{:.6}\">\n",
            counts.total,
            counts.failed,
            counts.skipped,
            quote_attr(&self.timestamp),
            quote_attr(&hostname),
            self.suite_started.elapsed().as_secs_f64()
        );
        for testcase in &self.testcases {
            xml.push_str(testcase);
        }
        xml.push_str("</testsuite>\n");
        fs::write(&self.path, xml)?;
        Ok(())
    }
}

/// Characters permitted in XML 1.0 documents.
fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\t' | '\n' | '\r'
        | '\u{20}'..='\u{d7ff}'
        | '\u{e000}'..='\u{fffd}'
        | '\u{10000}'..='\u{10ffff}')
}

/// Escape a string as an XML CDATA block. Characters XML cannot represent
/// become U+FFFD, and an embedded `]]>` splits the block.
fn cdata(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if is_xml_char(c) { c } else { '\u{fffd}' })
        .collect();
    format!(
        "<![CDATA[{}]]>",
        cleaned.replace("]]>", "]]>]]&gt;<![CDATA[")
    )
}

/// Escape a string for use as a quoted XML attribute value.
fn quote_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\t' => out.push_str("&#9;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '"' => out.push_str("&quot;"),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c if is_xml_char(c) => out.push(c),
            _ => out.push('\u{fffd}'),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_record_all_verdicts() {
        let mut counts = Counts::default();
        counts.record(&Outcome::Empty);
        counts.record(&Outcome::Skipped { expected: vec![] });
        counts.record(&Outcome::Completed {
            expected: vec![],
            actual: vec![],
            diff: vec![],
        });
        counts.record(&Outcome::Completed {
            expected: vec![],
            actual: vec![],
            diff: vec!["--- a".into()],
        });
        assert_eq!(counts.total, 4);
        assert_eq!(counts.skipped, 2);
        assert_eq!(counts.failed, 1);
    }

    #[test]
    fn quote_attr_escapes_markup() {
        assert_eq!(quote_attr("a<b>&\"c\""), "\"a&lt;b&gt;&amp;&quot;c&quot;\"");
        assert_eq!(quote_attr("tab\there"), "\"tab&#9;here\"");
    }

    #[test]
    fn quote_attr_replaces_invalid_chars() {
        assert_eq!(quote_attr("a\u{0}b"), "\"a\u{fffd}b\"");
    }

    #[test]
    fn cdata_splits_terminator() {
        assert_eq!(
            cdata("x]]>y"),
            "<![CDATA[x]]>]]&gt;<![CDATA[y]]>"
        );
    }

    #[test]
    fn cdata_replaces_invalid_chars() {
        assert_eq!(cdata("a\u{8}b"), "<![CDATA[a\u{fffd}b]]>");
    }

    #[test]
    fn xunit_report_accumulates_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let xml_path = dir.path().join("report.xml");
        let mut reporter = XunitReporter::new(xml_path.clone());

        let pass = Outcome::Completed {
            expected: vec![],
            actual: vec![],
            diff: vec![],
        };
        let fail = Outcome::Completed {
            expected: vec![],
            actual: vec![],
            diff: vec!["--- a.t".into(), "+++ a.t.err".into(), "@@ -1,1 +1,1 @@".into()],
        };
        let skip = Outcome::Skipped { expected: vec![] };

        let mut counts = Counts::default();
        for (path, outcome) in [("a.t", &pass), ("b.t", &fail), ("c.t", &skip)] {
            counts.record(outcome);
            reporter
                .report(&TestReport {
                    path: Path::new(path),
                    outcome,
                    elapsed: Duration::from_millis(10),
                })
                .unwrap();
        }
        reporter.finish(&counts).unwrap();

        let xml = fs::read_to_string(&xml_path).unwrap();
        assert!(xml.contains("tests=\"3\""));
        assert!(xml.contains("failures=\"1\""));
        assert!(xml.contains("skipped=\"1\""));
        assert!(xml.contains("<skipped/>"));
        assert!(xml.contains("<failure><![CDATA[--- a.t"));
        assert!(xml.contains("classname=\"b.t\""));
    }

    #[test]
    fn err_artifact_written_on_failure_and_removed_on_pass() {
        let dir = tempfile::tempdir().unwrap();
        let test_path = dir.path().join("sample.t");
        fs::write(&test_path, "  $ echo hi\n  bye\n").unwrap();
        let err_path = dir.path().join("sample.t.err");

        let mut reporter = ConsoleReporter::new(ConsoleOptions {
            quiet: true,
            ..ConsoleOptions::default()
        });

        let fail = Outcome::Completed {
            expected: vec!["  $ echo hi".into(), "  bye".into()],
            actual: vec!["  $ echo hi".into(), "  hi".into()],
            diff: vec!["--- sample.t".into()],
        };
        reporter
            .report(&TestReport {
                path: &test_path,
                outcome: &fail,
                elapsed: Duration::ZERO,
            })
            .unwrap();
        assert_eq!(
            fs::read_to_string(&err_path).unwrap(),
            "  $ echo hi\n  hi\n"
        );

        let pass = Outcome::Completed {
            expected: vec![],
            actual: vec![],
            diff: vec![],
        };
        reporter
            .report(&TestReport {
                path: &test_path,
                outcome: &pass,
                elapsed: Duration::ZERO,
            })
            .unwrap();
        assert!(!err_path.exists());
    }

    #[test]
    fn no_err_files_suppresses_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let test_path = dir.path().join("quiet.t");
        let mut reporter = ConsoleReporter::new(ConsoleOptions {
            quiet: true,
            no_err_files: true,
            ..ConsoleOptions::default()
        });
        let fail = Outcome::Completed {
            expected: vec![],
            actual: vec!["  out".into()],
            diff: vec!["--- quiet.t".into()],
        };
        reporter
            .report(&TestReport {
                path: &test_path,
                outcome: &fail,
                elapsed: Duration::ZERO,
            })
            .unwrap();
        assert!(!dir.path().join("quiet.t.err").exists());
    }
}
