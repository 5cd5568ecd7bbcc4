//! Failure signals and error types
//!
//! Three layers:
//!
//! - [`Failure`]: the value a matcher returns when it cannot match. Cheap to
//!   build; its message is rendered only when the failure escapes to a caller.
//! - [`ParseError`]: the clean external error returned by the entry points,
//!   owning the (normalized) input so line and column can be computed lazily.
//! - [`GrammarError`]: construction-time misuse of the builder API.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::grammar::ExprId;
use crate::util::{col, line, lineno, quoted};

/// How far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Ordinary mismatch; choices and repetitions catch it
    Backtrackable,
    /// Stops all backtracking
    Fatal,
    /// Raised after a sequence passed its commit marker
    SyntaxStop,
}

impl FailureKind {
    pub fn is_fatal(self) -> bool {
        !matches!(self, FailureKind::Backtrackable)
    }

    pub fn label(self) -> &'static str {
        match self {
            FailureKind::Backtrackable => "ParseError",
            FailureKind::Fatal => "FatalError",
            FailureKind::SyntaxStop => "SyntaxError",
        }
    }
}

/// Message carried by a [`Failure`], rendered on demand.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FailureMsg {
    /// `{prefix}{display name of the referenced expression}`
    Named(&'static str, ExprId),
    /// `Expected {display name of the failing expression}{suffix}`
    ExpectedWith(&'static str),
    Text(Cow<'static, str>),
}

/// Internal match failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: FailureKind,
    pub loc: usize,
    pub(crate) msg: FailureMsg,
    pub expr: Option<ExprId>,
    /// Matcher stack at the innermost failure, recorded on request
    pub(crate) trace: Option<Arc<[ExprId]>>,
}

impl Failure {
    pub(crate) fn expected(loc: usize, expr: ExprId) -> Self {
        Self {
            kind: FailureKind::Backtrackable,
            loc,
            msg: FailureMsg::Named("Expected ", expr),
            expr: Some(expr),
            trace: None,
        }
    }

    pub(crate) fn expected_with(loc: usize, expr: ExprId, suffix: &'static str) -> Self {
        Self {
            msg: FailureMsg::ExpectedWith(suffix),
            ..Self::expected(loc, expr)
        }
    }

    pub(crate) fn named(loc: usize, expr: ExprId, prefix: &'static str, subject: ExprId) -> Self {
        Self {
            msg: FailureMsg::Named(prefix, subject),
            ..Self::expected(loc, expr)
        }
    }

    pub(crate) fn text(loc: usize, expr: Option<ExprId>, msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: FailureKind::Backtrackable,
            loc,
            msg: FailureMsg::Text(msg.into()),
            expr,
            trace: None,
        }
    }

    /// Same failure, reported as "Expected {expr}".
    pub(crate) fn expecting(mut self, expr: ExprId) -> Self {
        self.msg = FailureMsg::Named("Expected ", expr);
        self.expr = Some(expr);
        self
    }

    pub(crate) fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_backtrackable(&self) -> bool {
        self.kind == FailureKind::Backtrackable
    }

    /// Render the message, resolving display names through `name_of`.
    pub(crate) fn render_message(&self, name_of: impl Fn(ExprId) -> String) -> String {
        match &self.msg {
            FailureMsg::Named(prefix, subject) => format!("{}{}", prefix, name_of(*subject)),
            FailureMsg::ExpectedWith(suffix) => {
                let name = self.expr.map(&name_of).unwrap_or_default();
                format!("Expected {}{}", name, suffix)
            }
            FailureMsg::Text(text) => text.to_string(),
        }
    }
}

static FOUND_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[A-Za-z0-9_\p{L}]{1,16}|.|\n)").expect("valid found-word regex"));

/// Error returned by the parsing entry points.
#[derive(Debug, Clone)]
pub struct ParseError {
    input: Arc<str>,
    loc: usize,
    kind: FailureKind,
    msg: String,
    /// `Kind - display name` frames, outermost first
    frames: Vec<String>,
}

impl ParseError {
    pub(crate) fn new(
        input: Arc<str>,
        loc: usize,
        kind: FailureKind,
        msg: String,
        frames: Vec<String>,
    ) -> Self {
        Self {
            input,
            loc,
            kind,
            msg,
            frames,
        }
    }

    pub fn loc(&self) -> usize {
        self.loc
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// The text that was being parsed (after tab expansion).
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn lineno(&self) -> usize {
        lineno(self.loc, &self.input)
    }

    pub fn col(&self) -> usize {
        col(self.loc, &self.input)
    }

    pub fn line(&self) -> &str {
        line(self.loc, &self.input)
    }

    /// What was found at the failure location, if the input is not empty.
    pub fn found(&self) -> Option<String> {
        if self.input.is_empty() {
            return None;
        }
        if self.loc >= self.input.len() {
            return Some("end of text".to_string());
        }
        let rest = self.input.get(self.loc..)?;
        let word = FOUND_WORD
            .find(rest)
            .map(|m| m.as_str())
            .unwrap_or_else(|| &rest[..rest.chars().next().map_or(0, char::len_utf8)]);
        Some(quoted(word))
    }

    /// The failing line with `>!<` inserted at the failure column.
    pub fn marked_input_line(&self) -> String {
        self.marked_input_line_with(">!<")
    }

    pub fn marked_input_line_with(&self, marker: &str) -> String {
        let text = self.line();
        let split = text
            .char_indices()
            .nth(self.col() - 1)
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        format!("{}{}{}", &text[..split], marker, &text[split..]).trim().to_string()
    }

    /// Multi-line report: the failing line, a caret, the error, then the
    /// matcher frames active at the failure (innermost last, at most `depth`).
    pub fn explain(&self, depth: usize) -> String {
        let mut out = vec![
            self.line().to_string(),
            format!("{}^", " ".repeat(self.col() - 1)),
            format!("{}: {}", self.kind.label(), self),
        ];
        let skip = self.frames.len().saturating_sub(depth);
        out.extend(self.frames.iter().skip(skip).cloned());
        out.join("\n")
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)?;
        if let Some(found) = self.found() {
            write!(f, ", found {}", found)?;
        }
        write!(
            f,
            "  (at char {}), (line:{}, col:{})",
            self.loc,
            self.lineno(),
            self.col()
        )
    }
}

impl std::error::Error for ParseError {}

/// Misuse of the grammar construction or configuration API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrammarError {
    #[error("cannot define a zero-length literal; use Empty instead")]
    EmptyLiteral,

    #[error("{0}: character set must not be empty")]
    EmptyCharSet(&'static str),

    #[error("invalid length bounds for {kind}: min={min}, max={max}")]
    InvalidWordBounds {
        kind: &'static str,
        min: usize,
        max: usize,
    },

    #[error("invalid regular expression {pattern:?}: {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("quote string must not be empty")]
    EmptyQuoteChar,

    #[error("invalid Each expression: {0}")]
    InvalidEach(String),

    #[error("packrat caching and bounded left recursion cannot both be enabled")]
    IncompatibleCaching,

    #[error("Forward expression {0} was never assigned a value")]
    UnassignedForward(String),

    #[error("left recursion detected in {0}; enable bounded left recursion to support it")]
    LeftRecursion(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("expression id {0} does not belong to this grammar")]
    UnknownExpr(u32),

    #[error("{0} is not a {1} expression")]
    WrongKind(String, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_at(input: &str, loc: usize, msg: &str) -> ParseError {
        ParseError::new(
            Arc::from(input),
            loc,
            FailureKind::Backtrackable,
            msg.to_string(),
            vec![],
        )
    }

    #[test]
    fn test_display_reports_found_word() {
        let err = error_at("ab xyz", 3, "Expected 'b'");
        assert_eq!(
            err.to_string(),
            "Expected 'b', found 'xyz'  (at char 3), (line:1, col:4)"
        );
    }

    #[test]
    fn test_display_at_end_of_text() {
        let err = error_at("ab", 2, "Expected 'c'");
        assert_eq!(
            err.to_string(),
            "Expected 'c', found end of text  (at char 2), (line:1, col:3)"
        );
    }

    #[test]
    fn test_found_single_punctuation() {
        let err = error_at("a+b", 1, "Expected W:(0-9)");
        assert_eq!(err.found().as_deref(), Some("'+'"));
    }

    #[test]
    fn test_empty_input_has_no_found_phrase() {
        let err = error_at("", 0, "Expected 'a'");
        assert_eq!(err.to_string(), "Expected 'a'  (at char 0), (line:1, col:1)");
    }

    #[test]
    fn test_marked_input_line() {
        let err = error_at("first\nsecond line", 9, "Expected x");
        assert_eq!(err.lineno(), 2);
        assert_eq!(err.marked_input_line(), "sec>!<ond line");
    }

    #[test]
    fn test_explain_layout() {
        let err = ParseError::new(
            Arc::from("1 + x"),
            4,
            FailureKind::Backtrackable,
            "Expected W:(0-9)".to_string(),
            vec!["And - {W:(0-9) '+' W:(0-9)}".to_string(), "Word - W:(0-9)".to_string()],
        );
        let explained = err.explain(1);
        let lines: Vec<&str> = explained.lines().collect();
        assert_eq!(lines[0], "1 + x");
        assert_eq!(lines[1], "    ^");
        assert!(lines[2].starts_with("ParseError: Expected W:(0-9), found 'x'"));
        assert_eq!(lines[3], "Word - W:(0-9)");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(!FailureKind::Backtrackable.is_fatal());
        assert!(FailureKind::Fatal.is_fatal());
        assert!(FailureKind::SyntaxStop.is_fatal());
    }
}
