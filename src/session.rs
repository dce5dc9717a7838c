//! Shell session execution
//!
//! Runs every command block of a script through a single shell invocation and
//! recovers per-block output and exit status from the one merged stdio
//! stream. Block boundaries travel in-band: each block's command text is
//! preceded by an `echo <salt> <index> $?` line whose `$?` reports the
//! *previous* block's exit status, and one trailing marker closes the tail.
//! The salt is a run-unique random token, so a marker line in the captured
//! stream can be attributed to the protocol rather than to test output.
//!
//! stdout and stderr share one pipe; their relative order for a single
//! command is whatever the kernel delivered. The reassociation scan requires
//! one linear stream.

use std::io::{self, Read, Write};
use std::process::{Command, Stdio};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::RunError;
use crate::script::{LineRole, Script};

/// Session exit code that marks the whole test as skipped.
pub const SKIP_EXIT_CODE: i32 = 80;

/// What came back from a shell session.
#[derive(Debug)]
pub enum SessionOutput {
    /// Reassembled actual-output lines, mirroring the script's shape.
    Lines(Vec<String>),
    /// The session exited with [`SKIP_EXIT_CODE`].
    Skipped,
}

/// Shell invocation settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shell argv; the instrumented script is fed to `argv + ["-"]` on stdin.
    pub shell: Vec<String>,
    /// Full environment for the shell process.
    pub env: Vec<(String, String)>,
}

/// Execute a script's command blocks and reassemble their output.
///
/// Spawning the shell is the only hard error; everything a command does,
/// including failing, is data for the diff.
pub fn run_session(script: &Script, config: &SessionConfig) -> Result<SessionOutput, RunError> {
    if config.shell.is_empty() {
        return Err(RunError::setup("no shell configured"));
    }
    let salt = new_salt();
    let (stdin_data, replay) = instrument(script, &salt);
    let (output, exit_code) = execute(config, stdin_data)?;
    if exit_code == SKIP_EXIT_CODE {
        return Ok(SessionOutput::Skipped);
    }
    Ok(SessionOutput::Lines(reassemble(
        &output,
        &salt,
        script.indent(),
        replay,
    )))
}

/// Feed the bare command text to the shell with inherited stdio. No capture,
/// no markers, no comparison.
pub fn run_debug(script: &Script, config: &SessionConfig) -> Result<(), RunError> {
    if config.shell.is_empty() {
        return Err(RunError::setup("no shell configured"));
    }
    let marker_len = script.marker_len();
    let mut stdin_data = String::new();
    for line in script.lines() {
        if matches!(line.role, LineRole::Command | LineRole::Continuation) {
            stdin_data.push_str(&line.text[marker_len..]);
            stdin_data.push('\n');
        }
    }

    let mut command = shell_command(config);
    command.stdin(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|e| spawn_error(&config.shell, &e))?;
    let mut child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| RunError::shell("child stdin not captured"))?;
    child_stdin.write_all(stdin_data.as_bytes())?;
    drop(child_stdin);
    child.wait()?;
    Ok(())
}

fn new_salt() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("SHTEST{}", suffix)
}

fn shell_command(config: &SessionConfig) -> Command {
    let mut command = Command::new(&config.shell[0]);
    command.args(&config.shell[1..]).arg("-").env_clear();
    for (key, value) in &config.env {
        command.env(key, value);
    }
    command
}

fn spawn_error(shell: &[String], err: &io::Error) -> RunError {
    RunError::shell(format!("failed to spawn {}: {}", shell[0], err))
}

/// Build the instrumented stdin and the replay buckets.
///
/// `replay[k]` holds the authored lines to splice into the actual output
/// when the stream transitions into block `k`: the literal text and command
/// lines between block `k-1`'s expected output and block `k`'s. Bucket 0 is
/// the script head, bucket `nblocks` the tail. Expected-output lines are
/// absent on purpose; the captured stream replaces them.
fn instrument(script: &Script, salt: &str) -> (String, Vec<Vec<String>>) {
    let marker_len = script.marker_len();
    let mut stdin = String::new();
    let mut replay: Vec<Vec<String>> = vec![Vec::new()];
    let mut blocks = 0usize;

    for line in script.lines() {
        match line.role {
            LineRole::Command => {
                replay[blocks].push(line.text.clone());
                stdin.push_str(&format!("echo {} {} $?\n", salt, blocks));
                stdin.push_str(&line.text[marker_len..]);
                stdin.push('\n');
                blocks += 1;
                replay.push(Vec::new());
            }
            LineRole::Continuation => {
                replay[blocks.saturating_sub(1)].push(line.text.clone());
                stdin.push_str(&line.text[marker_len..]);
                stdin.push('\n');
            }
            LineRole::Expected => {}
            LineRole::Literal => replay[blocks].push(line.text.clone()),
        }
    }
    stdin.push_str(&format!("echo {} {} $?\n", salt, blocks));
    (stdin, replay)
}

/// Spawn the shell, feed it the instrumented script, and capture stdout with
/// stderr merged into the same pipe. Returns the raw bytes and the session's
/// exit code.
fn execute(config: &SessionConfig, stdin_data: String) -> Result<(Vec<u8>, i32), RunError> {
    let (mut reader, writer) = io::pipe()?;
    let writer_err = writer.try_clone()?;

    let mut command = shell_command(config);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::from(writer))
        .stderr(Stdio::from(writer_err));

    let mut child = command
        .spawn()
        .map_err(|e| spawn_error(&config.shell, &e))?;
    // The builder keeps its copies of the pipe writers; drop them so the
    // reader sees EOF once the child exits.
    drop(command);

    let mut child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| RunError::shell("child stdin not captured"))?;
    let feeder = std::thread::spawn(move || {
        let _ = child_stdin.write_all(stdin_data.as_bytes());
    });

    let mut output = Vec::new();
    reader.read_to_end(&mut output)?;
    let status = child.wait()?;
    let _ = feeder.join();

    Ok((output, status.code().unwrap_or(-1)))
}

/// Scan the merged stream for salt markers and rebuild per-block output.
fn reassemble(output: &[u8], salt: &str, indent: &str, mut replay: Vec<Vec<String>>) -> Vec<String> {
    let mut actual: Vec<String> = Vec::new();
    let mut pos = 0usize;

    for (chunk, had_newline) in byte_lines(output) {
        let marker = find_salt(chunk, salt.as_bytes())
            .and_then(|at| parse_marker(&chunk[at + salt.len()..]).map(|m| (at, m)));
        match marker {
            Some((at, (next_block, exit_code))) => {
                if at > 0 {
                    // output that ran straight into the marker had no newline
                    actual.push(render_output_line(&chunk[..at], indent, false));
                }
                if exit_code != 0 {
                    actual.push(format!("{}[{}]", indent, exit_code));
                }
                if let Some(bucket) = replay.get_mut(pos) {
                    actual.append(bucket);
                }
                pos = next_block + 1;
            }
            None => actual.push(render_output_line(chunk, indent, had_newline)),
        }
    }
    if let Some(bucket) = replay.get_mut(pos) {
        actual.append(bucket);
    }
    actual
}

/// Split captured bytes into lines, reporting whether each had its newline.
fn byte_lines(output: &[u8]) -> impl Iterator<Item = (&[u8], bool)> {
    let mut rest = output;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match rest.iter().position(|&b| b == b'\n') {
            Some(at) => {
                let (line, tail) = rest.split_at(at);
                rest = &tail[1..];
                Some((line, true))
            }
            None => {
                let line = rest;
                rest = &[];
                Some((line, false))
            }
        }
    })
}

fn find_salt(line: &[u8], salt: &[u8]) -> Option<usize> {
    line.windows(salt.len()).position(|window| window == salt)
}

/// Parse the `<index> <exit-code>` fields following the salt. A line that
/// happens to contain the salt but not the fields is demoted to plain output
/// by the caller; per-test conditions never abort the run.
fn parse_marker(rest: &[u8]) -> Option<(usize, i32)> {
    let text = std::str::from_utf8(rest).ok()?;
    let mut fields = text.split_whitespace();
    let next_block = fields.next()?.parse().ok()?;
    let exit_code = fields.next()?.parse().ok()?;
    Some((next_block, exit_code))
}

/// Format one captured output line: indent it, tag a missing newline, and
/// escape bytes that would not print.
fn render_output_line(data: &[u8], indent: &str, had_newline: bool) -> String {
    let mut bytes = data.to_vec();
    if !had_newline {
        bytes.extend_from_slice(b" (no-eol)");
    }
    if needs_escape(&bytes) {
        format!("{}{} (esc)", indent, escape_bytes(&bytes))
    } else {
        format!("{}{}", indent, String::from_utf8_lossy(&bytes))
    }
}

fn needs_escape(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .any(|&b| matches!(b, 0x00..=0x09 | 0x0b..=0x1f | 0x7f..=0xff))
}

/// Rewrite a byte line into printable ASCII. `\\`, `\r`, and `\t` keep their
/// mnemonic forms; everything else non-printable becomes `\xNN`.
fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        match b {
            b'\\' => out.push_str(r"\\"),
            b'\r' => out.push_str(r"\r"),
            b'\t' => out.push_str(r"\t"),
            0x00..=0x1f | 0x7f..=0xff => out.push_str(&format!(r"\x{:02x}", b)),
            _ => out.push(b as char),
        }
    }
    out
}
