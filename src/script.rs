//! Session script model
//!
//! A session script interleaves shell commands with the output they are
//! expected to produce. Classification is purely positional: a line starting
//! with the configured indent followed by `$ ` opens a command block, indent
//! plus `> ` continues the open block's command text, any other line at the
//! base indentation is expected output, and unindented lines are literal text
//! (header comments before or between blocks).
//!
//! The parsed structure is immutable; later stages read it but never rewrite
//! it.

/// Role of one script line, decided by its prefix alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRole {
    /// `indent + "$ "` — opens a new command block
    Command,
    /// `indent + "> "` — continues the open block's command text
    Continuation,
    /// Any other line at the base indentation — expected output
    Expected,
    /// Unindented literal text
    Literal,
}

/// One authored line, stored without its trailing newline.
#[derive(Debug, Clone)]
pub struct ScriptLine {
    pub text: String,
    pub role: LineRole,
}

/// A command with the expected output that follows it.
#[derive(Debug, Clone)]
pub struct CommandBlock {
    /// Ordinal in appearance order
    pub index: usize,
    /// Shell text, one entry per command/continuation line, markers stripped
    pub command: Vec<String>,
    /// Expected output lines as authored, indent and annotations included
    pub expected: Vec<String>,
}

/// A parsed session script.
#[derive(Debug, Clone)]
pub struct Script {
    indent: String,
    lines: Vec<ScriptLine>,
    blocks: Vec<CommandBlock>,
}

impl Script {
    /// Parse script text with the given indentation width.
    ///
    /// A script with zero command blocks is valid; it is pure literal text
    /// with nothing to execute.
    pub fn parse(source: &str, indent_width: usize) -> Script {
        let indent = " ".repeat(indent_width);
        let cmd_marker = format!("{}$ ", indent);
        let con_marker = format!("{}> ", indent);

        let mut lines: Vec<ScriptLine> = Vec::new();
        let mut blocks: Vec<CommandBlock> = Vec::new();

        for raw in source.split_inclusive('\n') {
            let text = raw.strip_suffix('\n').unwrap_or(raw).to_string();
            let role = if text.starts_with(&cmd_marker) {
                blocks.push(CommandBlock {
                    index: blocks.len(),
                    command: vec![text[cmd_marker.len()..].to_string()],
                    expected: Vec::new(),
                });
                LineRole::Command
            } else if text.starts_with(&con_marker) {
                if let Some(block) = blocks.last_mut() {
                    block.command.push(text[con_marker.len()..].to_string());
                }
                LineRole::Continuation
            } else if text.starts_with(&indent) {
                if let Some(block) = blocks.last_mut() {
                    block.expected.push(text.clone());
                }
                LineRole::Expected
            } else {
                LineRole::Literal
            };
            lines.push(ScriptLine { text, role });
        }

        Script {
            indent,
            lines,
            blocks,
        }
    }

    /// The indentation prefix every command and expected-output line carries.
    pub fn indent(&self) -> &str {
        &self.indent
    }

    /// Width of the `$ ` / `> ` marker including the indent prefix.
    pub fn marker_len(&self) -> usize {
        self.indent.len() + 2
    }

    pub fn lines(&self) -> &[ScriptLine] {
        &self.lines
    }

    pub fn blocks(&self) -> &[CommandBlock] {
        &self.blocks
    }

    /// True when the script contains no command blocks.
    pub fn has_no_commands(&self) -> bool {
        self.blocks.is_empty()
    }

    /// All lines as authored — the expected side of the comparison.
    pub fn reference(&self) -> Vec<String> {
        self.lines.iter().map(|l| l.text.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_block() {
        let script = Script::parse("  $ echo hi\n  hi\n", 2);
        assert_eq!(script.blocks().len(), 1);
        assert_eq!(script.blocks()[0].command, vec!["echo hi"]);
        assert_eq!(script.blocks()[0].expected, vec!["  hi"]);
    }

    #[test]
    fn parse_continuation_joins_block() {
        let script = Script::parse("  $ if true; then\n  >   echo yes\n  > fi\n  yes\n", 2);
        assert_eq!(script.blocks().len(), 1);
        assert_eq!(
            script.blocks()[0].command,
            vec!["if true; then", "  echo yes", "fi"]
        );
        assert_eq!(script.blocks()[0].expected, vec!["  yes"]);
    }

    #[test]
    fn parse_header_comment_is_literal() {
        let script = Script::parse("A header comment.\n\n  $ true\n", 2);
        let roles: Vec<LineRole> = script.lines().iter().map(|l| l.role).collect();
        assert_eq!(
            roles,
            vec![LineRole::Literal, LineRole::Literal, LineRole::Command]
        );
        assert_eq!(script.blocks().len(), 1);
    }

    #[test]
    fn parse_blocks_keep_appearance_order() {
        let script = Script::parse("  $ first\n  out\n  $ second\n", 2);
        let indices: Vec<usize> = script.blocks().iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(script.blocks()[1].command, vec!["second"]);
        assert!(script.blocks()[1].expected.is_empty());
    }

    #[test]
    fn parse_no_commands_is_valid() {
        let script = Script::parse("Just some prose.\nMore prose.\n", 2);
        assert!(script.has_no_commands());
        assert_eq!(script.reference().len(), 2);
    }

    #[test]
    fn parse_empty_source() {
        let script = Script::parse("", 2);
        assert!(script.has_no_commands());
        assert!(script.lines().is_empty());
    }

    #[test]
    fn parse_missing_final_newline() {
        let script = Script::parse("  $ echo hi\n  hi", 2);
        assert_eq!(script.blocks()[0].expected, vec!["  hi"]);
    }

    #[test]
    fn bare_dollar_without_space_is_output() {
        let script = Script::parse("  $ true\n  $\n", 2);
        assert_eq!(script.blocks().len(), 1);
        assert_eq!(script.blocks()[0].expected, vec!["  $"]);
    }

    #[test]
    fn custom_indent_width() {
        let script = Script::parse("    $ echo hi\n    hi\n", 4);
        assert_eq!(script.blocks().len(), 1);
        assert_eq!(script.blocks()[0].command, vec!["echo hi"]);
    }

    #[test]
    fn annotations_survive_in_expected_text() {
        let script = Script::parse("  $ echo hi\n  [a-z]{2} (re)\n", 2);
        assert_eq!(script.blocks()[0].expected, vec!["  [a-z]{2} (re)"]);
    }
}
