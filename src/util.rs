//! Position and character-range utilities
//!
//! Helpers for turning byte offsets within the input into human-readable
//! line and column numbers, plus a few string helpers used when building
//! regular expressions out of character sets.
//!
//! Lines and columns are 1-based. Columns count characters, not bytes.

/// Fast conversion from byte offsets to line/column positions.
///
/// Used when many offsets in the same text need to be resolved (error
/// rendering, scanning reports). One-off conversions can use [`lineno`] and
/// [`col`] directly.
pub struct SourceLocation<'a> {
    source: &'a str,
    /// Byte offsets where each line starts
    line_starts: Vec<usize>,
}

impl<'a> SourceLocation<'a> {
    /// Create a new SourceLocation from source text
    pub fn new(source: &'a str) -> Self {
        let mut line_starts = vec![0];

        for (byte_pos, ch) in source.char_indices() {
            if ch == '\n' {
                line_starts.push(byte_pos + 1);
            }
        }

        Self {
            source,
            line_starts,
        }
    }

    /// 1-based line number containing `loc`
    pub fn lineno(&self, loc: usize) -> usize {
        let loc = floor_char_boundary(self.source, loc);
        match self.line_starts.binary_search(&loc) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// 1-based character column of `loc`
    pub fn col(&self, loc: usize) -> usize {
        let loc = floor_char_boundary(self.source, loc);
        let line_start = self.line_starts[self.lineno(loc) - 1];
        self.source[line_start..loc].chars().count() + 1
    }

    /// Get the total number of lines in the source
    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Get the byte offset for the start of a 1-based line
    pub fn line_start(&self, lineno: usize) -> Option<usize> {
        lineno
            .checked_sub(1)
            .and_then(|i| self.line_starts.get(i).copied())
    }
}

/// Clamp `loc` into `text` and move it back onto a char boundary.
pub fn floor_char_boundary(text: &str, loc: usize) -> usize {
    let mut loc = loc.min(text.len());
    while !text.is_char_boundary(loc) {
        loc -= 1;
    }
    loc
}

/// Byte offset of the character following the one at `loc`.
///
/// At or past the end of `text` this returns `text.len() + 1` so that
/// scanning loops advancing by one character terminate.
pub fn next_char_boundary(text: &str, loc: usize) -> usize {
    match text.get(loc..).and_then(|rest| rest.chars().next()) {
        Some(c) => loc + c.len_utf8(),
        None => text.len() + 1,
    }
}

/// 1-based line number of `loc` within `text`.
pub fn lineno(loc: usize, text: &str) -> usize {
    let loc = floor_char_boundary(text, loc);
    text.as_bytes()[..loc].iter().filter(|b| **b == b'\n').count() + 1
}

/// 1-based character column of `loc` within `text`.
///
/// A location just after a newline is column 1, and so is offset 0.
pub fn col(loc: usize, text: &str) -> usize {
    let loc = floor_char_boundary(text, loc);
    let line_start = text[..loc].rfind('\n').map(|i| i + 1).unwrap_or(0);
    text[line_start..loc].chars().count() + 1
}

/// The full line of `text` containing `loc`, without its newline.
pub fn line(loc: usize, text: &str) -> &str {
    let loc = floor_char_boundary(text, loc);
    let start = text[..loc].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let end = text[loc..].find('\n').map(|i| loc + i).unwrap_or(text.len());
    &text[start..end]
}

/// Expand tab characters to spaces using 8-column tab stops.
pub fn expand_tabs(text: &str) -> String {
    if !text.contains('\t') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len() + 16);
    let mut column = 0usize;
    for c in text.chars() {
        match c {
            '\t' => {
                let pad = 8 - column % 8;
                out.extend(std::iter::repeat(' ').take(pad));
                column += pad;
            }
            '\n' | '\r' => {
                out.push(c);
                column = 0;
            }
            _ => {
                out.push(c);
                column += 1;
            }
        }
    }
    out
}

/// Escape a character for use inside a regex `[...]` class.
pub fn escape_range_char(c: char) -> String {
    match c {
        '\\' | '^' | '-' | '[' | ']' | '&' | '~' => format!("\\{}", c),
        '\n' => "\\n".to_string(),
        '\t' => "\\t".to_string(),
        '\r' => "\\r".to_string(),
        _ => c.to_string(),
    }
}

/// Collapse a set of characters into compact ranges, e.g. `"abcdxyz"` to
/// `"a-dx-z"`.
///
/// Duplicates are removed and the result is sorted by code point. Runs of
/// three or more consecutive characters become `first-last`; shorter runs are
/// written out. With `escape` set, characters are escaped for a regex class.
pub fn collapse_ranges(chars: impl IntoIterator<Item = char>, escape: bool) -> String {
    let mut sorted: Vec<char> = chars.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let render = |c: char| {
        if escape {
            escape_range_char(c)
        } else {
            c.to_string()
        }
    };

    let mut out = String::new();
    let mut i = 0;
    while i < sorted.len() {
        let first = sorted[i];
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1] as u32 == sorted[j] as u32 + 1 {
            j += 1;
        }
        let last = sorted[j];
        match j - i {
            0 => out.push_str(&render(first)),
            1 => {
                out.push_str(&render(first));
                out.push_str(&render(last));
            }
            _ => {
                out.push_str(&render(first));
                out.push('-');
                out.push_str(&render(last));
            }
        }
        i = j + 1;
    }
    out
}

/// Python-style quoted representation used in display names and messages.
pub fn quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}
