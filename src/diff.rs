//! Annotated unified diffs
//!
//! Aligns expected output against actual output while treating lines that
//! carry a `(re)`, `(glob)`, or `(esc)` annotation as equal to non-identical
//! actual lines. The alignment consults an equivalence test instead of
//! rewriting either sequence, so a line that ends up unmatched always renders
//! exactly as authored, and a line matched through a predicate never shows up
//! in the diff at all.

use similar::algorithms::{myers, Capture, Replace};
use similar::{group_diff_ops, DiffTag};

const RE_TAG: &str = " (re)";
const GLOB_TAG: &str = " (glob)";
const ESC_TAG: &str = " (esc)";

/// Match a `(re)` pattern against a whole line. Invalid patterns never match.
fn regex_matches(pattern: &str, actual: &str) -> bool {
    let anchored = format!(r"\A(?:{})\z", pattern);
    regex::Regex::new(&anchored)
        .map(|re| re.is_match(actual))
        .unwrap_or(false)
}

/// Match a `(glob)` pattern against a whole line.
///
/// Only `*` and `?` are special; both, and the backslash itself, can be
/// escaped with a backslash. Everything else matches literally.
fn glob_matches(pattern: &str, actual: &str) -> bool {
    let mut translated = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some('*') | Some('?') | Some('\\')) => {
                translated.push('\\');
                if let Some(escaped) = chars.next() {
                    translated.push(escaped);
                }
            }
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            _ => {
                let mut buf = [0u8; 4];
                translated.push_str(&regex::escape(c.encode_utf8(&mut buf)));
            }
        }
    }
    regex_matches(&translated, actual)
}

/// Decode backslash escapes into raw bytes: the C-style set, `\xNN`, and
/// octal `\NNN`. Unknown escapes are kept verbatim.
fn unescape(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 == bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += 1;
        match bytes[i] {
            b'\\' => {
                out.push(b'\\');
                i += 1;
            }
            b'\'' => {
                out.push(b'\'');
                i += 1;
            }
            b'"' => {
                out.push(b'"');
                i += 1;
            }
            b'a' => {
                out.push(0x07);
                i += 1;
            }
            b'b' => {
                out.push(0x08);
                i += 1;
            }
            b'f' => {
                out.push(0x0c);
                i += 1;
            }
            b'n' => {
                out.push(b'\n');
                i += 1;
            }
            b'r' => {
                out.push(b'\r');
                i += 1;
            }
            b't' => {
                out.push(b'\t');
                i += 1;
            }
            b'v' => {
                out.push(0x0b);
                i += 1;
            }
            b'x' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'\\');
                        out.push(b'x');
                        i += 1;
                    }
                }
            }
            b'0'..=b'7' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while digits < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                    value = value * 8 + u32::from(bytes[i] - b'0');
                    i += 1;
                    digits += 1;
                }
                out.push(value as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
                i += 1;
            }
        }
    }
    out
}

/// Escape-decoded comparison. Either side may carry the `(esc)` tag; the
/// expected side is decoded first and compared against the raw actual line,
/// then against the decoded actual line.
fn esc_eq(expected: &str, actual: &str) -> bool {
    let decoded = match expected.strip_suffix(ESC_TAG) {
        Some(stripped) => unescape(stripped),
        None => expected.as_bytes().to_vec(),
    };
    if decoded == actual.as_bytes() {
        return true;
    }
    match actual.strip_suffix(ESC_TAG) {
        Some(stripped) => decoded == unescape(stripped),
        None => false,
    }
}

/// Line equivalence used by the alignment: literal equality first, then the
/// predicate selected by the expected line's trailing annotation. A tag that
/// does not name a known predicate participates only via literal equality.
pub fn lines_match(expected: &str, actual: &str) -> bool {
    if expected == actual {
        return true;
    }
    if esc_eq(expected, actual) {
        return true;
    }
    if let Some(pattern) = expected.strip_suffix(GLOB_TAG) {
        if glob_matches(pattern, actual) {
            return true;
        }
    }
    if let Some(pattern) = expected.strip_suffix(RE_TAG) {
        return regex_matches(pattern, actual);
    }
    false
}

// The Myers pass compares Old[i] against New[j] through PartialEq. These
// wrappers route that comparison through lines_match() so annotated lines
// pair up during alignment while both input sequences stay untouched.
struct RefLine<'a>(&'a str);
struct OutLine<'a>(&'a str);

impl PartialEq<OutLine<'_>> for RefLine<'_> {
    fn eq(&self, other: &OutLine<'_>) -> bool {
        lines_match(self.0, other.0)
    }
}

impl PartialEq<RefLine<'_>> for OutLine<'_> {
    fn eq(&self, other: &RefLine<'_>) -> bool {
        lines_match(other.0, self.0)
    }
}

/// Render a unified diff between expected and actual lines.
///
/// Returns an empty vector when the sequences are equivalent under the
/// annotation predicates. Repeated calls on the same pair produce identical
/// output.
pub fn unified_diff(
    expected: &[String],
    actual: &[String],
    from_path: &str,
    to_path: &str,
    context: usize,
) -> Vec<String> {
    let old: Vec<RefLine<'_>> = expected.iter().map(|l| RefLine(l)).collect();
    let new: Vec<OutLine<'_>> = actual.iter().map(|l| OutLine(l)).collect();

    let mut hook = Replace::new(Capture::new());
    // the capture hook's error type is Infallible
    myers::diff(&mut hook, &old, 0..old.len(), &new, 0..new.len()).unwrap();
    let groups = group_diff_ops(hook.into_inner().into_ops(), context);
    if groups.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    out.push(format!("--- {}", from_path));
    out.push(format!("+++ {}", to_path));
    for group in groups {
        let (_, first_old, first_new) = group[0].as_tag_tuple();
        let (_, last_old, last_new) = group[group.len() - 1].as_tag_tuple();
        out.push(format!(
            "@@ -{},{} +{},{} @@",
            first_old.start + 1,
            last_old.end - first_old.start,
            first_new.start + 1,
            last_new.end - first_new.start,
        ));
        for op in &group {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            match tag {
                DiffTag::Equal => {
                    for line in &expected[old_range] {
                        out.push(format!(" {}", line));
                    }
                }
                DiffTag::Delete => {
                    for line in &expected[old_range] {
                        out.push(format!("-{}", line));
                    }
                }
                DiffTag::Insert => {
                    for line in &actual[new_range] {
                        out.push(format!("+{}", line));
                    }
                }
                DiffTag::Replace => {
                    for line in &expected[old_range] {
                        out.push(format!("-{}", line));
                    }
                    for line in &actual[new_range] {
                        out.push(format!("+{}", line));
                    }
                }
            }
        }
    }
    out
}
