//! Matching engine core
//!
//! A [`Matcher`] runs one grammar over one input string. Every match attempt
//! goes through [`Matcher::parse`], which layers, in order:
//!
//! 1. the deadline check,
//! 2. the packrat cache (when enabled),
//! 3. pre-parsing (ignorable expressions, then whitespace),
//! 4. the node's own matching logic (see `primitives` and `combinators`),
//! 5. post-processing for converter nodes (`Group`, `Combine`, `Dict`, ...),
//! 6. results-name binding,
//! 7. actions and conditions.
//!
//! Per-parse state (caches, counters, the explain stack) lives in
//! [`SessionState`] so a [`Grammar`] can be shared between threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::actions::{ActionContext, ActionError, Hook, Replacement};
use crate::cache::{CacheStats, Outcome, PackratCache, RecursionMemo};
use crate::chars::CharSet;
use crate::config::EngineConfig;
use crate::error::{Failure, FailureKind};
use crate::grammar::{ExprId, Grammar, NodeKind, Prepared};
use crate::results::{ParseResults, Token};
use crate::util::{col, lineno};

/// Operations between two deadline checks.
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

/// Mutable state owned by a single parse or scan.
#[derive(Debug)]
pub(crate) struct SessionState {
    packrat: Option<PackratCache>,
    pub(crate) memo: Option<RecursionMemo>,
    pub(crate) stats: CacheStats,
    ops: u64,
    deadline: Option<Instant>,
    expired: bool,
    stack: Vec<ExprId>,
    record_explain: bool,
}

impl SessionState {
    pub fn new(config: &EngineConfig) -> Self {
        let deadline = (config.timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(config.timeout_ms));
        Self {
            packrat: config.packrat.map(PackratCache::new),
            memo: config.left_recursion.map(RecursionMemo::new),
            stats: CacheStats::default(),
            ops: 0,
            deadline,
            expired: false,
            stack: Vec::new(),
            record_explain: config.record_explain,
        }
    }

    /// Hit/miss counters plus the current size of whichever memo table is active.
    pub fn stats(&self) -> CacheStats {
        let packrat = self.packrat.as_ref().map_or(0, |p| p.len());
        let memo = self.memo.as_ref().map_or(0, |m| m.len());
        CacheStats {
            entries: packrat + memo,
            ..self.stats
        }
    }

    /// Uncached state sharing this session's deadline, for sub-parses over a slice.
    fn detached(&self) -> Self {
        Self {
            packrat: None,
            memo: None,
            stats: CacheStats::default(),
            ops: 0,
            deadline: self.deadline,
            expired: self.expired,
            stack: Vec::new(),
            record_explain: false,
        }
    }
}

/// Converter output: `wrapped` results hold a single nested token that is
/// itself the value bound to a results name.
pub(crate) struct Shaped {
    pub toks: ParseResults,
    pub wrapped: bool,
}

impl Shaped {
    fn plain(toks: ParseResults) -> Self {
        Self { toks, wrapped: false }
    }

    fn wrap(inner: ParseResults) -> Self {
        Self {
            toks: ParseResults::single(Token::Nested(inner)),
            wrapped: true,
        }
    }
}

pub(crate) struct Matcher<'a, 's> {
    pub g: &'a Grammar,
    pub plan: &'a Prepared,
    pub input: &'a str,
    pub state: &'s mut SessionState,
}

impl<'a, 's> Matcher<'a, 's> {
    pub fn new(g: &'a Grammar, input: &'a str, state: &'s mut SessionState) -> Self {
        Self {
            g,
            plan: g.prepared(),
            input,
            state,
        }
    }

    /// Match `id` at `loc`.
    pub fn parse(&mut self, id: ExprId, loc: usize, do_actions: bool, pre_parse: bool) -> Outcome {
        self.tick(loc)?;
        if self.state.packrat.is_none() {
            return self.parse_no_cache(id, loc, do_actions, pre_parse);
        }
        let key = (id, loc, pre_parse, do_actions);
        if let Some(hit) = self.state.packrat.as_ref().and_then(|c| c.get(&key)) {
            let hit = hit.clone();
            self.state.stats.hits += 1;
            return hit;
        }
        self.state.stats.misses += 1;
        let outcome = self.parse_no_cache(id, loc, do_actions, pre_parse);
        if let Some(cache) = self.state.packrat.as_mut() {
            cache.insert(key, outcome.clone());
        }
        outcome
    }

    /// Match without running actions; returns the end location.
    pub fn try_parse(&mut self, id: ExprId, loc: usize, raise_fatal: bool) -> Result<usize, Failure> {
        match self.parse(id, loc, false, true) {
            Ok((end, _)) => Ok(end),
            Err(f) if !raise_fatal && f.kind.is_fatal() => Err(f.with_kind(FailureKind::Backtrackable)),
            Err(f) => Err(f),
        }
    }

    /// Whether `id` would match at `loc`; fatal failures count as "no".
    pub fn can_parse_next(&mut self, id: ExprId, loc: usize, do_actions: bool) -> bool {
        self.parse(id, loc, do_actions, true).is_ok()
    }

    fn tick(&mut self, loc: usize) -> Result<(), Failure> {
        let state = &mut *self.state;
        state.ops += 1;
        if !state.expired && state.ops % DEADLINE_CHECK_INTERVAL == 0 {
            state.expired = state.deadline.is_some_and(|d| Instant::now() >= d);
        }
        if state.expired {
            return Err(Failure::text(loc, None, "parse deadline exceeded").with_kind(FailureKind::Fatal));
        }
        Ok(())
    }

    fn parse_no_cache(&mut self, id: ExprId, loc: usize, do_actions: bool, pre_parse: bool) -> Outcome {
        let g = self.g;
        let node = g.node(id);
        let pre_loc = if pre_parse && node.call_preparse {
            self.pre_parse(id, loc)?
        } else {
            loc
        };
        if node.debug {
            debug!(
                expr = %g.display_name(id),
                loc = pre_loc,
                line = lineno(pre_loc, self.input),
                col = col(pre_loc, self.input),
                "match attempt"
            );
        }

        self.state.stack.push(id);
        let result = self.parse_impl(id, pre_loc, do_actions);
        let (end, toks) = match result {
            Ok(found) => {
                self.state.stack.pop();
                found
            }
            Err(mut failure) => {
                if self.state.record_explain && failure.trace.is_none() {
                    failure.trace = Some(Arc::from(self.state.stack.as_slice()));
                }
                self.state.stack.pop();
                if node.debug {
                    debug!(expr = %g.display_name(id), loc = failure.loc, "match failed");
                }
                return Err(failure);
            }
        };

        let shaped = self.post_parse(id, toks);
        let save_list = self.plan.save_list[id.index()];
        let mut ret = self.bind_name(id, shaped, save_list);
        if !node.hooks.is_empty() && (do_actions || node.call_during_try) {
            ret = self.run_hooks(id, pre_loc, end, ret)?;
        }
        if node.debug {
            debug!(expr = %g.display_name(id), end, tokens = %ret, "matched");
        }
        Ok((end, ret))
    }

    fn parse_impl(&mut self, id: ExprId, loc: usize, do_actions: bool) -> Outcome {
        let g = self.g;
        match &g.node(id).kind {
            NodeKind::And(_)
            | NodeKind::MatchFirst(_)
            | NodeKind::Or(_)
            | NodeKind::Each(_)
            | NodeKind::Repeat { .. }
            | NodeKind::Opt { .. }
            | NodeKind::FollowedBy(_)
            | NodeKind::NotAny(_)
            | NodeKind::PrecededBy { .. }
            | NodeKind::Group(_)
            | NodeKind::Suppress(_)
            | NodeKind::Combine { .. }
            | NodeKind::Dict(_)
            | NodeKind::Forward(_)
            | NodeKind::SkipTo { .. } => self.parse_combinator(id, loc, do_actions),
            _ => self.parse_terminal(id, loc),
        }
    }

    // ----- pre-parsing ----------------------------------------------------

    pub(crate) fn pre_parse(&mut self, id: ExprId, loc: usize) -> Result<usize, Failure> {
        let g = self.g;
        let node = g.node(id);
        match node.kind {
            NodeKind::LineStart => self.pre_parse_line_start(id, loc),
            NodeKind::GoToColumn(column) => {
                if col(loc, self.input) == column {
                    return Ok(loc);
                }
                let mut loc = self.skip_ignorables(&node.ignore_exprs, loc)?;
                while let Some(c) = self.input[loc..].chars().next() {
                    if !c.is_whitespace() || col(loc, self.input) == column {
                        break;
                    }
                    loc += c.len_utf8();
                }
                Ok(loc)
            }
            _ => {
                let loc = self.skip_ignorables(&node.ignore_exprs, loc)?;
                if node.skip_whitespace {
                    Ok(self.skip_chars(g.whitespace_of(id), loc))
                } else {
                    Ok(loc)
                }
            }
        }
    }

    fn pre_parse_line_start(&mut self, id: ExprId, loc: usize) -> Result<usize, Failure> {
        if loc == 0 {
            return Ok(loc);
        }
        let g = self.g;
        let node = g.node(id);
        let ws = g.whitespace_of(id);
        let mut inline = ws.clone();
        inline.remove('\n');
        let mut loc = self.skip_ignorables(&node.ignore_exprs, loc)?;
        loc = self.skip_chars(&inline, loc);
        if ws.contains('\n') {
            while self.input[loc..].starts_with('\n') {
                loc = self.skip_chars(&inline, loc + 1);
            }
        }
        Ok(loc)
    }

    pub(crate) fn skip_chars(&self, chars: &CharSet, mut loc: usize) -> usize {
        while let Some(c) = self.input.get(loc..).and_then(|rest| rest.chars().next()) {
            if !chars.contains(c) {
                break;
            }
            loc += c.len_utf8();
        }
        loc
    }

    /// Repeatedly match the ignorable expressions until none advances.
    pub(crate) fn skip_ignorables(&mut self, ignore: &[ExprId], mut loc: usize) -> Result<usize, Failure> {
        if ignore.is_empty() {
            return Ok(loc);
        }
        loop {
            let last = loc;
            for &ig in ignore {
                loop {
                    match self.parse(ig, loc, true, true) {
                        Ok((end, _)) if end > loc => loc = end,
                        Ok(_) => break,
                        Err(f) if f.is_backtrackable() => break,
                        Err(f) => return Err(f),
                    }
                }
            }
            if loc == last {
                return Ok(loc);
            }
        }
    }

    // ----- post-processing ------------------------------------------------

    fn post_parse(&self, id: ExprId, mut toks: ParseResults) -> Shaped {
        let node = self.g.node(id);
        let named = node.results_name.is_some();
        match &node.kind {
            NodeKind::Group(_) => Shaped::wrap(toks),
            NodeKind::Suppress(_) => Shaped::plain(ParseResults::new()),
            NodeKind::Combine { join, .. } => {
                let joined: String = toks.as_string_list(join).concat();
                toks.clear_tokens();
                toks.push(Token::Str(joined));
                if named && toks.has_names() {
                    Shaped::wrap(toks)
                } else {
                    Shaped::plain(toks)
                }
            }
            NodeKind::Dict(_) => {
                let mut entries = Vec::new();
                for (i, tok) in toks.iter().enumerate() {
                    let Token::Nested(group) = tok else {
                        continue;
                    };
                    if group.is_empty() {
                        continue;
                    }
                    let key = group[0].to_string();
                    let value = if group.len() == 1 {
                        Token::Str(String::new())
                    } else if group.len() == 2 && !group[1].is_nested() {
                        group[1].clone()
                    } else {
                        let mut rest = group.clone();
                        rest.remove(0);
                        if rest.len() != 1 || rest.has_names() {
                            Token::Nested(rest)
                        } else {
                            rest[0].clone()
                        }
                    };
                    entries.push((key, value, i));
                }
                for (key, value, pos) in entries {
                    toks.add_named(&key, value, pos);
                }
                if named {
                    Shaped::wrap(toks)
                } else {
                    Shaped::plain(toks)
                }
            }
            NodeKind::PrecededBy { .. } => {
                toks.clear_tokens();
                Shaped::plain(toks)
            }
            _ => Shaped::plain(toks),
        }
    }

    fn bind_name(&self, id: ExprId, shaped: Shaped, as_list: bool) -> ParseResults {
        let node = self.g.node(id);
        match &node.results_name {
            Some(name) => {
                let bind = as_list
                    && (!shaped.toks.is_empty()
                        || matches!(
                            node.kind,
                            NodeKind::Repeat { .. } | NodeKind::And(_) | NodeKind::Each(_) | NodeKind::Dict(_)
                        ));
                bind_results_name(name, node.list_all, shaped, as_list, bind)
            }
            None => shaped.toks,
        }
    }

    fn run_hooks(&mut self, id: ExprId, start: usize, end: usize, mut ret: ParseResults) -> Result<ParseResults, Failure> {
        let g = self.g;
        let node = g.node(id);
        let ctx = ActionContext {
            input: self.input,
            start,
            end,
        };
        let save_list = self.plan.save_list[id.index()];
        for hook in &node.hooks {
            match hook {
                Hook::Condition(cond) => {
                    cond.check(&ctx, &ret).map_err(|e| action_failure(id, start, e))?;
                }
                Hook::Action(action) => match action.call(&ctx, &mut ret).map_err(|e| action_failure(id, start, e))? {
                    None => {}
                    Some(Replacement::Results(r)) => {
                        ret = self.bind_name(id, Shaped::plain(r), save_list);
                    }
                    Some(Replacement::Token(t)) => {
                        ret = self.bind_name(id, Shaped::plain(ParseResults::single(t)), false);
                    }
                },
            }
        }
        Ok(ret)
    }

    /// Fresh uncached session for a sub-parse over a slice of the input.
    pub(crate) fn sub_session(&self) -> SessionState {
        self.state.detached()
    }
}

/// Bind `name` on freshly produced results.
///
/// `as_list` binds the whole token list (or the wrapped nested value) as one
/// nested result; otherwise the first token is bound. `bind` gates list-mode
/// binding of empty results.
pub(crate) fn bind_results_name(name: &str, list_all: bool, shaped: Shaped, as_list: bool, bind: bool) -> ParseResults {
    let Shaped { mut toks, wrapped } = shaped;
    if list_all {
        toks.mark_accumulating(name);
    }
    if as_list {
        if !bind {
            return toks;
        }
        let value = if wrapped {
            match toks.get_mut(0) {
                Some(Token::Nested(inner)) => {
                    inner.set_own_name(name);
                    Token::Nested(inner.clone())
                }
                Some(other) => other.clone(),
                None => return toks,
            }
        } else {
            let mut copy = ParseResults::from_tokens(toks.tokens().to_vec());
            copy.set_own_name(name);
            Token::Nested(copy)
        };
        toks.add_named(name, value, 0);
    } else {
        if wrapped {
            if let Some(Token::Nested(inner)) = toks.get_mut(0) {
                inner.set_own_name(name);
            }
        }
        if let Some(first) = toks.first().cloned() {
            toks.add_named(name, first, 0);
        }
    }
    toks
}

fn action_failure(id: ExprId, loc: usize, err: ActionError) -> Failure {
    let kind = if err.fatal {
        FailureKind::Fatal
    } else {
        FailureKind::Backtrackable
    };
    Failure::text(loc, Some(id), err.message).with_kind(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Condition, ParseAction};
    use crate::chars::{ALPHAS, NUMS};
    use crate::config::CacheLimit;

    fn run(g: &Grammar, root: ExprId, input: &str) -> Outcome {
        let mut state = SessionState::new(g.config());
        let mut m = Matcher::new(g, input, &mut state);
        m.parse(root, 0, true, true)
    }

    #[test]
    fn test_whitespace_is_skipped_before_tokens() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let (end, toks) = run(&g, num, "   42 rest").unwrap();
        assert_eq!(end, 5);
        assert_eq!(toks.first_str(), Some("42"));
    }

    #[test]
    fn test_ignorables_are_skipped() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let comment = g.regex(r"#[^\n]*").unwrap();
        g.ignore(num, comment);
        let (end, toks) = run(&g, num, "# note\n  # more\n 7").unwrap();
        assert_eq!(toks.first_str(), Some("7"));
        assert_eq!(end, 18);
    }

    #[test]
    fn test_results_name_binds_first_token() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let value = g.named(num, "value");
        let (_, toks) = run(&g, value, "12").unwrap();
        assert_eq!(toks.get_named("value"), Some(&Token::from("12")));
    }

    #[test]
    fn test_group_binds_nested_value() {
        let mut g = Grammar::new();
        let word = g.word(ALPHAS).unwrap();
        let many = g.one_or_more(word);
        let group = g.group(many);
        let named = g.named(group, "words");
        let (_, toks) = run(&g, named, "a b c").unwrap();
        assert_eq!(toks.len(), 1);
        let Some(Token::Nested(inner)) = toks.get_named("words") else {
            panic!("expected nested binding");
        };
        assert_eq!(inner.len(), 3);
        assert_eq!(inner.get_name(), Some("words"));
    }

    #[test]
    fn test_action_replacement_is_rebound() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let value = g.named(num, "n");
        g.add_action(value, crate::actions::convert_to_integer());
        let (_, toks) = run(&g, value, "31").unwrap();
        assert_eq!(toks[0], Token::Int(31));
        assert_eq!(toks.get_named("n"), Some(&Token::Int(31)));
    }

    #[test]
    fn test_condition_failure_is_backtrackable() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        g.add_condition(num, Condition::on_tokens(|t| t.first_str() == Some("1")).with_message("must be one"));
        let err = run(&g, num, "  2").unwrap_err();
        assert_eq!(err.kind, FailureKind::Backtrackable);
        assert_eq!(err.loc, 2);
        assert_eq!(err.render_message(|_| String::new()), "must be one");
    }

    #[test]
    fn test_actions_skipped_during_lookahead() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        g.add_action(num, ParseAction::new(|_, _| Err(ActionError::fatal("boom"))));
        let ahead = g.followed_by(num);
        let mut state = SessionState::new(g.config());
        let mut m = Matcher::new(&g, "5", &mut state);
        assert!(m.parse(ahead, 0, false, true).is_ok());
        assert!(m.parse(ahead, 0, true, true).is_err());
    }

    #[test]
    fn test_packrat_counts_hits() {
        let mut g = Grammar::new();
        g.enable_packrat(CacheLimit::Unbounded).unwrap();
        let num = g.word(NUMS).unwrap();
        let plus = g.literal("+").unwrap();
        let minus = g.literal("-").unwrap();
        let sum = g.and(vec![num, plus, num]);
        let diff = g.and(vec![num, minus, num]);
        let alt = g.match_first(vec![sum, diff]);
        let mut state = SessionState::new(g.config());
        let mut m = Matcher::new(&g, "1-2", &mut state);
        let (end, _) = m.parse(alt, 0, true, true).unwrap();
        assert_eq!(end, 3);
        assert!(state.stats.hits >= 1);
    }

    #[test]
    fn test_expired_deadline_is_fatal() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let mut state = SessionState::new(g.config());
        state.expired = true;
        let mut m = Matcher::new(&g, "1", &mut state);
        let err = m.parse(num, 0, true, true).unwrap_err();
        assert_eq!(err.kind, FailureKind::Fatal);
    }
}
