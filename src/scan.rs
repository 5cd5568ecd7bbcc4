//! Top-level entry points: whole-input parsing and scanning for matches
//! anywhere in a text.
//!
//! Every call builds a fresh [`SessionState`], so packrat and recursion memo
//! entries from an earlier input never leak into the next one.

use std::sync::Arc;

use tracing::debug;

use crate::engine::{Matcher, SessionState};
use crate::error::{Failure, FailureKind, ParseError};
use crate::grammar::{ExprId, Grammar};
use crate::results::{ParseResults, Token};
use crate::util::{expand_tabs, next_char_boundary};

impl Grammar {
    fn session(&self) -> SessionState {
        let config = self.config();
        debug!(
            packrat = config.packrat.is_some(),
            left_recursion = config.left_recursion.is_some(),
            "session caches reset"
        );
        SessionState::new(config)
    }

    fn normalize(&self, root: ExprId, text: &str, keep_tabs: bool) -> Arc<str> {
        if keep_tabs || self.config().keep_tabs || self.node(root).keep_tabs {
            Arc::from(text)
        } else {
            Arc::from(expand_tabs(text))
        }
    }

    pub(crate) fn to_parse_error(&self, input: Arc<str>, failure: Failure) -> ParseError {
        let msg = failure.render_message(|id| self.display_name(id));
        let frames = failure
            .trace
            .iter()
            .flat_map(|trace| trace.iter())
            .map(|&id| format!("{} - {}", self.node(id).kind.label(), self.display_name(id)))
            .collect();
        let loc = failure.loc.min(input.len());
        ParseError::new(input, loc, failure.kind, msg, frames)
    }

    fn unknown_root(&self, root: ExprId, input: Arc<str>) -> Option<ParseError> {
        self.check(root)
            .err()
            .map(|e| ParseError::new(input, 0, FailureKind::Fatal, e.to_string(), Vec::new()))
    }

    /// Match `root` once at the start of `text`.
    ///
    /// With `parse_all`, only trailing whitespace and ignorables may follow
    /// the match.
    pub fn parse_string(&self, root: ExprId, text: &str, parse_all: bool) -> Result<ParseResults, ParseError> {
        let input = self.normalize(root, text, false);
        if let Some(err) = self.unknown_root(root, input.clone()) {
            return Err(err);
        }
        let mut state = self.session();
        let outcome = {
            let mut m = Matcher::new(self, &input, &mut state);
            m.parse(root, 0, true, true).and_then(|(end, toks)| {
                if !parse_all {
                    return Ok(toks);
                }
                let end = m.pre_parse(root, end)?;
                let end = m.skip_chars(self.default_whitespace(), end);
                if end < input.len() {
                    return Err(Failure::text(end, None, "Expected end of text"));
                }
                Ok(toks)
            })
        };
        self.record_stats(state.stats());
        outcome.map_err(|f| self.to_parse_error(input, f))
    }

    /// Whether `root` matches `text`, optionally requiring the whole text.
    pub fn matches(&self, root: ExprId, text: &str, parse_all: bool) -> bool {
        self.parse_string(root, text, parse_all).is_ok()
    }

    /// Lazily find every non-overlapping match of `root` in `text`.
    pub fn scan_string<'g>(&'g self, root: ExprId, text: &str) -> ScanIter<'g> {
        self.scan_string_with(root, text, usize::MAX, false)
    }

    /// Like [`Grammar::scan_string`], stopping after `max_matches`; with
    /// `overlap` the search resumes one character after each match start.
    pub fn scan_string_with<'g>(&'g self, root: ExprId, text: &str, max_matches: usize, overlap: bool) -> ScanIter<'g> {
        ScanIter::new(self, root, self.normalize(root, text, false), max_matches, overlap)
    }

    /// All matches of `root` in `text`, each as one nested result.
    pub fn search_string(&self, root: ExprId, text: &str, max_matches: usize) -> Result<ParseResults, ParseError> {
        let mut scan = self.scan_string_with(root, text, max_matches, false);
        let found: ParseResults = scan.by_ref().map(|(toks, _, _)| Token::Nested(toks)).collect();
        match scan.take_error() {
            Some(err) => Err(err),
            None => Ok(found),
        }
    }

    /// Replace every match of `root` in `text` with its (action-transformed)
    /// tokens, keeping the text between matches.
    pub fn transform_string(&self, root: ExprId, text: &str) -> Result<String, ParseError> {
        let mut scan = ScanIter::new(self, root, self.normalize(root, text, true), usize::MAX, false);
        let input = scan.text.clone();
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for (toks, start, end) in scan.by_ref() {
            out.push_str(&input[last..start]);
            out.extend(toks.as_string_list(""));
            last = end;
        }
        if let Some(err) = scan.take_error() {
            return Err(err);
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    /// Lazily split `text` around matches of `root`, at most `max_split` times.
    pub fn split<'g>(&'g self, root: ExprId, text: &str, max_split: usize, include_separators: bool) -> SplitIter<'g> {
        SplitIter {
            scan: ScanIter::new(self, root, self.normalize(root, text, true), max_split, false),
            last: 0,
            pending: None,
            finished: false,
            include_separators,
        }
    }
}

/// Iterator over `(tokens, start, end)` for each match found by a scan.
///
/// A fatal failure ends the iteration; retrieve it with
/// [`ScanIter::take_error`].
#[derive(Debug)]
pub struct ScanIter<'g> {
    g: &'g Grammar,
    root: ExprId,
    text: Arc<str>,
    state: SessionState,
    loc: usize,
    matches: usize,
    max_matches: usize,
    overlap: bool,
    done: bool,
    error: Option<ParseError>,
}

impl<'g> ScanIter<'g> {
    fn new(g: &'g Grammar, root: ExprId, text: Arc<str>, max_matches: usize, overlap: bool) -> Self {
        let error = g.unknown_root(root, text.clone());
        Self {
            g,
            root,
            state: g.session(),
            text,
            loc: 0,
            matches: 0,
            max_matches,
            overlap,
            done: error.is_some(),
            error,
        }
    }

    /// The text being scanned (tabs expanded unless kept).
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The fatal failure that ended the scan, if any.
    pub fn take_error(&mut self) -> Option<ParseError> {
        self.error.take()
    }
}

impl Iterator for ScanIter<'_> {
    type Item = (ParseResults, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let g = self.g;
        let root = self.root;
        let text: &str = &self.text;
        let mut found = None;
        let mut fatal = None;
        {
            let mut m = Matcher::new(g, text, &mut self.state);
            while self.loc <= text.len() && self.matches < self.max_matches {
                let pre = match m.pre_parse(root, self.loc) {
                    Ok(pre) => pre,
                    Err(f) => {
                        fatal = Some(f);
                        break;
                    }
                };
                match m.parse(root, pre, true, false) {
                    Ok((end, toks)) if end > self.loc => {
                        self.matches += 1;
                        self.loc = if self.overlap { next_char_boundary(text, pre) } else { end };
                        found = Some((toks, pre, end));
                        break;
                    }
                    Ok(_) => self.loc = next_char_boundary(text, pre),
                    Err(f) if f.is_backtrackable() => self.loc = next_char_boundary(text, pre),
                    Err(f) => {
                        fatal = Some(f);
                        break;
                    }
                }
            }
        }
        g.record_stats(self.state.stats());
        if let Some(f) = fatal {
            self.error = Some(g.to_parse_error(self.text.clone(), f));
        }
        if found.is_none() {
            self.done = true;
        }
        found
    }
}

/// Iterator over the text pieces between matches (and optionally the
/// separators themselves).
#[derive(Debug)]
pub struct SplitIter<'g> {
    scan: ScanIter<'g>,
    last: usize,
    pending: Option<String>,
    finished: bool,
    include_separators: bool,
}

impl SplitIter<'_> {
    /// The fatal failure that cut the split short, if any.
    pub fn take_error(&mut self) -> Option<ParseError> {
        self.scan.take_error()
    }
}

impl Iterator for SplitIter<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if let Some(sep) = self.pending.take() {
            return Some(sep);
        }
        if self.finished {
            return None;
        }
        match self.scan.next() {
            Some((toks, start, end)) => {
                let piece = self.scan.text[self.last..start].to_string();
                if self.include_separators {
                    self.pending = Some(toks.first().map(|t| t.to_string()).unwrap_or_default());
                }
                self.last = end;
                Some(piece)
            }
            None => {
                self.finished = true;
                Some(self.scan.text[self.last..].to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::upcase_tokens;
    use crate::chars::{ALPHAS, NUMS};
    use crate::cache::CacheStats;
    use crate::config::CacheLimit;

    fn numbers() -> (Grammar, ExprId) {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        (g, num)
    }

    #[test]
    fn test_parse_string_prefix_and_full() {
        let (g, num) = numbers();
        let r = g.parse_string(num, "12 abc", false).unwrap();
        assert_eq!(r.as_string_list(""), vec!["12"]);
        let err = g.parse_string(num, "12 abc", true).unwrap_err();
        assert_eq!(err.message(), "Expected end of text");
        assert_eq!(err.loc(), 3);
        assert!(g.parse_string(num, "12  \n", true).is_ok());
    }

    #[test]
    fn test_parse_error_display() {
        let mut g = Grammar::new();
        let a = g.literal("a").unwrap();
        let b = g.literal("b").unwrap();
        let ab = g.and(vec![a, b]);
        let err = g.parse_string(ab, "ac", false).unwrap_err();
        assert_eq!(err.loc(), 1);
        assert_eq!(err.to_string(), "Expected 'b', found 'c'  (at char 1), (line:1, col:2)");
    }

    #[test]
    fn test_unknown_root_is_reported() {
        let (g, _) = numbers();
        let err = g.parse_string(ExprId(99), "1", false).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Fatal);
    }

    #[test]
    fn test_tabs_are_expanded_for_columns() {
        let mut g = Grammar::new();
        let word = g.word(ALPHAS).unwrap();
        let num = g.word(NUMS).unwrap();
        let pair = g.and(vec![word, num]);
        let err = g.parse_string(pair, "ab\tcd", false).unwrap_err();
        assert_eq!(err.col(), 9);
        let tabbed = g.parse_with_tabs(pair);
        let err = g.parse_string(tabbed, "ab\tcd", false).unwrap_err();
        assert_eq!(err.col(), 4);
    }

    #[test]
    fn test_explain_frames_are_recorded() {
        let mut g = Grammar::new();
        g.set_record_explain(true);
        let num = g.word(NUMS).unwrap();
        let plus = g.literal("+").unwrap();
        let sum = g.and(vec![num, plus, num]);
        let err = g.parse_string(sum, "1 + x", false).unwrap_err();
        assert_eq!(
            err.frames(),
            ["And - {W:(0-9) '+' W:(0-9)}".to_string(), "Word - W:(0-9)".to_string()]
        );
    }

    #[test]
    fn test_scan_string_positions() {
        let (g, num) = numbers();
        let found: Vec<(String, usize, usize)> = g
            .scan_string(num, "a 12 b 345")
            .map(|(t, s, e)| (t.as_string_list("").concat(), s, e))
            .collect();
        assert_eq!(found, vec![("12".to_string(), 2, 4), ("345".to_string(), 7, 10)]);
    }

    #[test]
    fn test_scan_string_limits_and_overlap() {
        let (g, num) = numbers();
        assert_eq!(g.scan_string_with(num, "1 2 3", 2, false).count(), 2);
        let overlapping: Vec<String> = g
            .scan_string_with(num, "123", usize::MAX, true)
            .map(|(t, _, _)| t.as_string_list("").concat())
            .collect();
        assert_eq!(overlapping, vec!["123", "23", "3"]);
    }

    #[test]
    fn test_scan_stops_on_fatal() {
        let mut g = Grammar::new();
        let kw = g.keyword("let").unwrap();
        let ident = g.word(ALPHAS).unwrap();
        let stmt = g.commit(kw, ident);
        let mut scan = g.scan_string(stmt, "let a let 5 let b");
        assert_eq!(scan.by_ref().count(), 1);
        let err = scan.take_error().unwrap();
        assert_eq!(err.kind(), FailureKind::SyntaxStop);
        assert_eq!(err.loc(), 10);
    }

    #[test]
    fn test_search_string_nests_each_match() {
        let (g, num) = numbers();
        let found = g.search_string(num, "x1 y22 z333", usize::MAX).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found.to_string(), "[['1'], ['22'], ['333']]");
    }

    #[test]
    fn test_transform_string_splices_tokens() {
        let mut g = Grammar::new();
        let word = g.word(ALPHAS).unwrap();
        let shout = g.add_action(word, upcase_tokens());
        let out = g.transform_string(shout, "ab 12\tcd!").unwrap();
        assert_eq!(out, "AB 12\tCD!");
    }

    #[test]
    fn test_split_around_separators() {
        let mut g = Grammar::new();
        let comma = g.literal(",").unwrap();
        let pieces: Vec<String> = g.split(comma, "a,b,,c", usize::MAX, false).collect();
        assert_eq!(pieces, vec!["a", "b", "", "c"]);
        let pieces: Vec<String> = g.split(comma, "a,b,c", 1, true).collect();
        assert_eq!(pieces, vec!["a", ",", "b,c"]);
    }

    #[test]
    fn test_matches() {
        let (g, num) = numbers();
        assert!(g.matches(num, "42", true));
        assert!(!g.matches(num, "42x", true));
        assert!(g.matches(num, "42x", false));
    }

    #[test]
    fn test_cache_stats_reset_per_parse() {
        let mut g = Grammar::new();
        g.enable_packrat(CacheLimit::Bounded(128)).unwrap();
        let num = g.word(NUMS).unwrap();
        let plus = g.literal("+").unwrap();
        let minus = g.literal("-").unwrap();
        let add = g.and(vec![num, plus, num]);
        let sub = g.and(vec![num, minus, num]);
        let expr = g.match_first(vec![add, sub]);
        g.parse_string(expr, "1-2", true).unwrap();
        let first = g.last_cache_stats();
        assert!(first.hits > 0);
        g.parse_string(expr, "1-2", true).unwrap();
        assert_eq!(g.last_cache_stats(), first);
        assert!(first.entries > 0);
    }

    #[test]
    fn test_cache_stats_report_table_size() {
        let mut g = Grammar::new();
        g.enable_packrat(CacheLimit::Bounded(2)).unwrap();
        let num = g.word(NUMS).unwrap();
        let nums = g.one_or_more(num);
        g.parse_string(nums, "1 2 3 4 5", true).unwrap();
        assert_eq!(g.last_cache_stats().entries, 2);

        let (plain, num) = numbers();
        plain.parse_string(num, "7", true).unwrap();
        assert_eq!(plain.last_cache_stats(), CacheStats::default());
    }
}
