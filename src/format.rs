//! Incremental text formatting for streamed chat answers.
//!
//! The formatter is pure and deterministic: it is re-applied to the full
//! accumulated text on every streamed delta, so earlier break decisions can
//! be revised as more text arrives (an overwrite-in-place render, not an
//! append-only one).

/// Sentence-terminal marks that force a line break (。 ！ ？).
pub const DEFAULT_BREAK_MARKS: [char; 3] = ['\u{3002}', '\u{FF01}', '\u{FF1F}'];

/// Leading glyphs that start a list item when followed by whitespace.
const BULLET_GLYPHS: [char; 5] = ['-', '\u{30FB}', '\u{2022}', '*', '+'];

const LIST_OPEN: &str = "<ul class=\"message-list\">";
const LIST_CLOSE: &str = "</ul>";
const BREAK: &str = "<br>";

/// Escape characters with special meaning in HTML. Must run before any
/// markup is inserted; the source text is untrusted remote output.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Converts raw accumulated answer text into display HTML.
///
/// The full variant additionally wraps bullet lines in `<ul>` blocks; the
/// minimal variant stops after break normalization.
#[derive(Debug, Clone)]
pub struct TextFormatter {
    break_marks: Vec<char>,
    list_blocks: bool,
}

impl TextFormatter {
    pub fn full() -> Self {
        Self {
            break_marks: DEFAULT_BREAK_MARKS.to_vec(),
            list_blocks: true,
        }
    }

    pub fn minimal() -> Self {
        Self {
            break_marks: DEFAULT_BREAK_MARKS.to_vec(),
            list_blocks: false,
        }
    }

    /// Replace the punctuation set that triggers line breaks.
    pub fn with_break_marks(mut self, marks: &[char]) -> Self {
        self.break_marks = marks.to_vec();
        self
    }

    pub fn format(&self, text: &str) -> String {
        let escaped = escape_html(text);
        let broken = self.insert_breaks(&escaped);
        let collapsed = collapse_breaks(&broken);
        if self.list_blocks {
            wrap_list_blocks(&collapsed)
        } else {
            collapsed
        }
    }

    /// Break after each terminal mark (consuming any whitespace that
    /// follows it), and turn remaining literal newlines into breaks.
    fn insert_breaks(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if self.break_marks.contains(&c) {
                out.push(c);
                out.push_str(BREAK);
                while chars.peek().is_some_and(|n| n.is_whitespace()) {
                    chars.next();
                }
            } else if c == '\n' {
                out.push_str(BREAK);
            } else {
                out.push(c);
            }
        }
        out
    }
}

/// Collapse runs of three or more `<br>` (possibly whitespace-separated)
/// down to exactly two, normalizing paragraph gaps.
fn collapse_breaks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(BREAK) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let mut count = 0;
        let mut end = 0;
        loop {
            if !rest[end..].starts_with(BREAK) {
                break;
            }
            count += 1;
            end += BREAK.len();
            let after = &rest[end..];
            let ws = after.len() - after.trim_start().len();
            if after[ws..].starts_with(BREAK) {
                end += ws;
            }
        }

        if count >= 3 {
            out.push_str(BREAK);
            out.push_str(BREAK);
        } else {
            out.push_str(&rest[..end]);
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

/// Returns the item content when a line starts with a bullet glyph plus
/// whitespace, with the glyph and leading whitespace stripped.
fn strip_bullet(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let mut chars = trimmed.chars();
    let first = chars.next()?;
    if !BULLET_GLYPHS.contains(&first) {
        return None;
    }
    let rest = chars.as_str();
    let stripped = rest.trim_start();
    if stripped.len() == rest.len() {
        // Glyph must be followed by whitespace ("-item" is prose).
        return None;
    }
    Some(stripped)
}

/// Wrap consecutive bullet lines in a single list container. Blank lines
/// are dropped; the container never has a `<br>` touching either border.
fn wrap_list_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_list = false;
    let mut pending_break = false;
    for line in text.split(BREAK) {
        if let Some(item) = strip_bullet(line) {
            if !in_list {
                out.push_str(LIST_OPEN);
                in_list = true;
                pending_break = false;
            }
            out.push_str("<li>");
            out.push_str(item);
            out.push_str("</li>");
        } else {
            if in_list {
                out.push_str(LIST_CLOSE);
                in_list = false;
                pending_break = false;
            }
            if line.trim().is_empty() {
                continue;
            }
            if pending_break {
                out.push_str(BREAK);
            }
            out.push_str(line);
            pending_break = true;
        }
    }
    if in_list {
        out.push_str(LIST_CLOSE);
    }
    out
}
