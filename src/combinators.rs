//! Combinator matchers: sequences, choices, repetition, lookaround,
//! converters, skipping and recursive `Forward` references.

use tracing::warn;

use crate::cache::{MemoEntry, Outcome, RecursionKey};
use crate::engine::{bind_results_name, Matcher, Shaped};
use crate::error::{Failure, FailureKind};
use crate::grammar::{EachEntry, ExprId, NodeKind};
use crate::results::ParseResults;
use crate::util::{floor_char_boundary, next_char_boundary};

impl<'a, 's> Matcher<'a, 's> {
    pub(crate) fn parse_combinator(&mut self, id: ExprId, loc: usize, do_actions: bool) -> Outcome {
        let g = self.g;
        match &g.node(id).kind {
            NodeKind::And(_) => self.parse_and(id, loc, do_actions),
            NodeKind::MatchFirst(_) => self.parse_match_first(id, loc, do_actions),
            NodeKind::Or(_) => self.parse_or(id, loc, do_actions),
            NodeKind::Each(_) => self.parse_each(id, loc, do_actions),
            NodeKind::Repeat { expr, min, stop_on } => self.parse_repeat(id, *expr, *min, *stop_on, loc, do_actions),
            NodeKind::Opt { expr, default } => match self.parse(*expr, loc, do_actions, false) {
                Err(f) if f.is_backtrackable() => {
                    let toks = match default {
                        Some(value) => {
                            let mut toks = ParseResults::single(value.clone());
                            if let Some(name) = &g.node(*expr).results_name {
                                toks.add_named(name, value.clone(), 0);
                            }
                            toks
                        }
                        None => ParseResults::new(),
                    };
                    Ok((loc, toks))
                }
                other => other,
            },
            NodeKind::FollowedBy(expr) => {
                let (_, mut toks) = self.parse(*expr, loc, do_actions, true)?;
                toks.clear_tokens();
                Ok((loc, toks))
            }
            NodeKind::NotAny(expr) => {
                if self.can_parse_next(*expr, loc, do_actions) {
                    Err(Failure::named(loc, id, "Found unwanted token, ", *expr))
                } else {
                    Ok((loc, ParseResults::new()))
                }
            }
            NodeKind::PrecededBy { expr, retreat, exact } => {
                self.parse_preceded_by(id, *expr, *retreat, *exact, loc, do_actions)
            }
            NodeKind::Group(expr) | NodeKind::Suppress(expr) | NodeKind::Dict(expr) | NodeKind::Combine { expr, .. } => {
                self.parse_enhanced(id, *expr, loc, do_actions)
            }
            NodeKind::Forward(None) => {
                warn!(loc, "Forward expression was never assigned a value");
                Err(Failure::text(loc, Some(id), "Forward expression was never assigned a value"))
            }
            NodeKind::Forward(Some(target)) => {
                if self.state.memo.is_some() {
                    self.parse_recursive(id, *target, loc, do_actions)
                } else {
                    self.parse_enhanced(id, *target, loc, do_actions)
                }
            }
            NodeKind::SkipTo {
                target,
                include,
                ignore,
                fail_on,
            } => self.parse_skip_to(id, *target, *include, ignore, *fail_on, loc, do_actions),
            _ => self.parse_terminal(id, loc),
        }
    }

    /// Delegate to the wrapped expression; a custom name replaces the message.
    fn parse_enhanced(&mut self, id: ExprId, expr: ExprId, loc: usize, do_actions: bool) -> Outcome {
        let named = self.g.node(id).custom_name.is_some();
        match self.parse(expr, loc, do_actions, false) {
            Err(f) if named && f.kind != FailureKind::SyntaxStop => Err(f.expecting(id)),
            other => other,
        }
    }

    fn parse_and(&mut self, id: ExprId, loc: usize, do_actions: bool) -> Outcome {
        let g = self.g;
        let plan = self.plan;
        let exprs = &plan.flat[id.index()];
        let Some((&first, rest)) = exprs.split_first() else {
            return Ok((loc, ParseResults::new()));
        };
        let (mut loc, mut results) = self.parse(first, loc, do_actions, false)?;
        let mut committed = false;
        for &expr in rest {
            if matches!(g.node(expr).kind, NodeKind::ErrorStop) {
                committed = true;
                continue;
            }
            match self.parse(expr, loc, do_actions, true) {
                Ok((end, toks)) => {
                    loc = end;
                    results.merge(toks);
                }
                Err(f) if committed && f.kind != FailureKind::SyntaxStop => {
                    return Err(f.with_kind(FailureKind::SyntaxStop));
                }
                Err(f) => return Err(f),
            }
        }
        Ok((loc, results))
    }

    fn parse_match_first(&mut self, id: ExprId, loc: usize, do_actions: bool) -> Outcome {
        let plan = self.plan;
        let exprs = &plan.flat[id.index()];
        let mut farthest: Option<Failure> = None;
        for &expr in exprs {
            match self.parse(expr, loc, do_actions, true) {
                Ok(found) => return Ok(found),
                Err(f) if f.kind.is_fatal() => return Err(f),
                Err(f) => {
                    if farthest.as_ref().map_or(true, |best| f.loc > best.loc) {
                        farthest = Some(f);
                    }
                }
            }
        }
        Err(self.choice_failure(id, loc, farthest))
    }

    fn choice_failure(&self, id: ExprId, loc: usize, farthest: Option<Failure>) -> Failure {
        match farthest {
            // every alternative failed right here: report the choice as a whole
            Some(f) if f.loc == loc => f.expecting(id),
            Some(f) => f,
            None => Failure::text(loc, Some(id), "no defined alternatives to match"),
        }
    }

    fn pick_fatal(&self, mut fatals: Vec<(Failure, ExprId)>) -> Option<Failure> {
        fatals.sort_by(|a, b| b.0.loc.cmp(&a.0.loc));
        if fatals.len() > 1 && fatals[0].0.loc == fatals[1].0.loc {
            let g = self.g;
            fatals.sort_by_key(|(f, e)| (std::cmp::Reverse(f.loc), std::cmp::Reverse(g.display_name(*e).len())));
        }
        fatals.into_iter().next().map(|(f, _)| f)
    }

    fn parse_or(&mut self, id: ExprId, loc: usize, do_actions: bool) -> Outcome {
        let g = self.g;
        let plan = self.plan;
        let exprs = &plan.flat[id.index()];
        let loc = if exprs.iter().all(|&e| g.node(e).call_preparse) {
            self.pre_parse(id, loc)?
        } else {
            loc
        };

        let mut matches: Vec<(usize, ExprId)> = Vec::new();
        let mut fatals: Vec<(Failure, ExprId)> = Vec::new();
        let mut farthest: Option<Failure> = None;
        for &expr in exprs {
            match self.try_parse(expr, loc, true) {
                Ok(end) => matches.push((end, expr)),
                Err(f) if f.kind.is_fatal() => {
                    fatals.push((f, expr));
                    farthest = None;
                }
                Err(f) => {
                    if fatals.is_empty() && farthest.as_ref().map_or(true, |best| f.loc > best.loc) {
                        farthest = Some(f);
                    }
                }
            }
        }

        if !matches.is_empty() {
            matches.sort_by(|a, b| b.0.cmp(&a.0));
            if !do_actions {
                return self.parse(matches[0].1, loc, false, true);
            }
            // actions may change how much an alternative matches: re-run longest first
            let mut longest: Option<(usize, ParseResults)> = None;
            for (trial_end, expr) in matches {
                if longest.as_ref().is_some_and(|(end, _)| trial_end <= *end) {
                    break;
                }
                match self.parse(expr, loc, true, true) {
                    Ok((end, toks)) => {
                        if end >= trial_end {
                            return Ok((end, toks));
                        }
                        if longest.as_ref().map_or(true, |(best, _)| end > *best) {
                            longest = Some((end, toks));
                        }
                    }
                    Err(f) if f.kind.is_fatal() => return Err(f),
                    Err(f) => {
                        if farthest.as_ref().map_or(true, |best| f.loc > best.loc) {
                            farthest = Some(f);
                        }
                    }
                }
            }
            if let Some(found) = longest {
                return Ok(found);
            }
        }

        if let Some(fatal) = self.pick_fatal(fatals) {
            return Err(fatal);
        }
        Err(self.choice_failure(id, loc, farthest))
    }

    fn parse_each(&mut self, id: ExprId, loc: usize, do_actions: bool) -> Outcome {
        let g = self.g;
        let prepared = self.plan;
        let Some(plan) = prepared.each.get(&id) else {
            return Err(Failure::text(loc, Some(id), "Each expression was not prepared"));
        };
        let mut required: Vec<&EachEntry> = plan.required.iter().collect();
        let mut optional: Vec<&EachEntry> = plan.optionals.iter().collect();
        let mut order: Vec<&EachEntry> = Vec::new();
        let mut fatals: Vec<(Failure, ExprId)> = Vec::new();
        let mut at = loc;

        loop {
            let candidates: Vec<(usize, &EachEntry)> = required
                .iter()
                .map(|e| (0, *e))
                .chain(optional.iter().map(|e| (1, *e)))
                .chain(plan.multis.iter().map(|e| (2, e)))
                .collect();
            let before = (at, required.len(), optional.len());
            let mut failed = 0;
            for &(slot, entry) in &candidates {
                match self.try_parse(entry.probe, at, true) {
                    Ok(end) => {
                        at = end;
                        order.push(entry);
                        match slot {
                            0 => required.retain(|e| !std::ptr::eq(*e, entry)),
                            1 => optional.retain(|e| !std::ptr::eq(*e, entry)),
                            _ => {}
                        }
                    }
                    Err(f) => {
                        if f.kind.is_fatal() {
                            fatals.push((f, entry.probe));
                        }
                        failed += 1;
                    }
                }
            }
            if failed == candidates.len() || before == (at, required.len(), optional.len()) {
                break;
            }
        }

        if let Some(fatal) = self.pick_fatal(fatals) {
            return Err(fatal);
        }
        if !required.is_empty() {
            let missing: Vec<String> = required.iter().map(|e| g.display_name(e.probe)).collect();
            return Err(Failure::text(
                loc,
                Some(id),
                format!("Missing one or more required elements ({})", missing.join(", ")),
            ));
        }
        // unmatched options still contribute their defaults
        for entry in &plan.optionals {
            let unmatched = optional.iter().any(|e| std::ptr::eq(*e, entry));
            if unmatched && matches!(g.node(entry.reparse).kind, NodeKind::Opt { .. }) {
                order.push(entry);
            }
        }

        let mut at = loc;
        let mut total = ParseResults::new();
        for entry in order {
            let (end, toks) = self.parse(entry.reparse, at, do_actions, true)?;
            at = end;
            let toks = match &entry.rename {
                Some(name) => {
                    let wrapped = matches!(g.node(entry.reparse).kind, NodeKind::Group(_));
                    let as_list = prepared.save_list[entry.reparse.index()];
                    bind_results_name(name, true, Shaped { toks, wrapped }, as_list, true)
                }
                None => toks,
            };
            total.merge(toks);
        }
        Ok((at, total))
    }

    fn repeat_once(&mut self, id: ExprId, expr: ExprId, stop_on: Option<ExprId>, loc: usize, do_actions: bool) -> Outcome {
        if let Some(stop) = stop_on {
            if self.can_parse_next(stop, loc, do_actions) {
                return Err(Failure::named(loc, id, "Found unwanted token, ", stop));
            }
        }
        self.parse(expr, loc, do_actions, true)
    }

    fn parse_repeat(
        &mut self,
        id: ExprId,
        expr: ExprId,
        min: usize,
        stop_on: Option<ExprId>,
        loc: usize,
        do_actions: bool,
    ) -> Outcome {
        let (mut loc, mut tokens) = match self.repeat_once(id, expr, stop_on, loc, do_actions) {
            Ok(found) => found,
            Err(f) if min == 0 && f.is_backtrackable() => return Ok((loc, ParseResults::new())),
            Err(f) => return Err(f),
        };
        let g = self.g;
        let ignore = &g.node(id).ignore_exprs;
        loop {
            if let Some(stop) = stop_on {
                if self.can_parse_next(stop, loc, do_actions) {
                    break;
                }
            }
            let pre = self.skip_ignorables(ignore, loc)?;
            match self.parse(expr, pre, do_actions, true) {
                Ok((end, toks)) => {
                    let advanced = end > loc;
                    loc = end;
                    tokens.merge(toks);
                    if !advanced {
                        break;
                    }
                }
                Err(f) if f.is_backtrackable() => break,
                Err(f) => return Err(f),
            }
        }
        Ok((loc, tokens))
    }

    fn parse_preceded_by(
        &mut self,
        id: ExprId,
        expr: ExprId,
        retreat: usize,
        exact: bool,
        loc: usize,
        do_actions: bool,
    ) -> Outcome {
        let g = self.g;
        let input = self.input;
        let not_preceded = || Failure::named(loc, id, "not preceded by ", expr);
        if exact {
            if loc < retreat || !input.is_char_boundary(loc - retreat) {
                return Err(not_preceded());
            }
            let (end, toks) = self.parse(expr, loc - retreat, do_actions, true)?;
            return if end == loc { Ok((loc, toks)) } else { Err(not_preceded()) };
        }

        let window = floor_char_boundary(input, loc.saturating_sub(retreat));
        let slice = &input[window..loc];
        let mut sub = self.sub_session();
        let mut m = Matcher::new(g, slice, &mut sub);
        for offset in 1..=slice.len() {
            let at = slice.len() - offset;
            if !slice.is_char_boundary(at) {
                continue;
            }
            if let Ok((end, toks)) = m.parse(expr, at, do_actions, true) {
                if m.skip_chars(g.default_whitespace(), end) == slice.len() {
                    return Ok((loc, toks));
                }
            }
        }
        Err(not_preceded())
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_skip_to(
        &mut self,
        id: ExprId,
        target: ExprId,
        include: bool,
        ignore: &[ExprId],
        fail_on: Option<ExprId>,
        loc: usize,
        do_actions: bool,
    ) -> Outcome {
        let input = self.input;
        let mut at = loc;
        loop {
            if at > input.len() {
                return Err(Failure::expected(loc, id));
            }
            if let Some(fail) = fail_on {
                if self.can_parse_next(fail, at, false) {
                    return Err(Failure::named(at, id, "Found unwanted token, ", fail));
                }
            }
            at = self.skip_ignorables(ignore, at)?;
            match self.parse(target, at, false, false) {
                Ok(_) => break,
                Err(f) if f.is_backtrackable() => at = next_char_boundary(input, at),
                Err(f) => return Err(f),
            }
        }
        let mut results = ParseResults::single(&input[loc..at]);
        let mut end = at;
        if include {
            let (matched_end, matched) = self.parse(target, at, do_actions, false)?;
            end = matched_end;
            results.merge(matched);
        }
        Ok((end, results))
    }

    // ----- bounded left recursion -----------------------------------------

    fn memo_get(&mut self, key: &RecursionKey) -> Option<MemoEntry> {
        self.state.memo.as_mut().and_then(|m| m.get(key).cloned())
    }

    fn memo_set(&mut self, key: RecursionKey, entry: MemoEntry) {
        if let Some(memo) = self.state.memo.as_mut() {
            memo.set(key, entry);
        }
    }

    fn memo_delete(&mut self, key: &RecursionKey) {
        if let Some(memo) = self.state.memo.as_mut() {
            memo.delete(key);
        }
    }

    /// Grow the match of a left-recursive `Forward` from a failing seed until
    /// it stops getting longer.
    fn parse_recursive(&mut self, id: ExprId, target: ExprId, loc: usize, do_actions: bool) -> Outcome {
        if let Some(entry) = self.memo_get(&(loc, id, do_actions)) {
            return memo_outcome(entry);
        }
        let act_key = (loc, id, true);
        let peek_key = (loc, id, false);
        let seed: MemoEntry = (
            loc as isize - 1,
            Err(Failure::text(loc, Some(id), "Forward recursion without base case")),
        );
        self.memo_set(peek_key, seed.clone());
        if do_actions {
            self.memo_set(act_key, seed.clone());
        }
        let (mut prev_end, mut prev_peek) = seed;
        loop {
            let (new_end, new_peek) = match self.parse_enhanced(id, target, loc, false) {
                Ok((end, toks)) => (end as isize, Ok(toks)),
                Err(f) if f.is_backtrackable() => {
                    if prev_peek.is_err() {
                        return Err(f);
                    }
                    (prev_end, prev_peek.clone())
                }
                Err(f) => return Err(f),
            };
            if new_end <= prev_end {
                if do_actions {
                    let best = self.memo_get(&act_key).unwrap_or((prev_end, prev_peek));
                    self.memo_set(peek_key, best.clone());
                    self.memo_delete(&peek_key);
                    self.memo_delete(&act_key);
                    return memo_outcome(best);
                }
                self.memo_delete(&peek_key);
                return memo_outcome((prev_end, prev_peek));
            }
            if do_actions {
                match self.parse_enhanced(id, target, loc, true) {
                    Ok((end, toks)) => self.memo_set(act_key, (end as isize, Ok(toks))),
                    Err(f) if f.is_backtrackable() => {
                        self.memo_set(peek_key, (new_end, Err(f.clone())));
                        self.memo_set(act_key, (new_end, Err(f.clone())));
                        return Err(f);
                    }
                    Err(f) => return Err(f),
                }
            }
            prev_end = new_end;
            prev_peek = new_peek;
            self.memo_set(peek_key, (prev_end, prev_peek.clone()));
        }
    }
}

fn memo_outcome((end, result): MemoEntry) -> Outcome {
    result.map(|toks| (end.max(0) as usize, toks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chars::{ALPHAS, NUMS};
    use crate::config::CacheLimit;
    use crate::engine::SessionState;
    use crate::grammar::{Grammar, SkipToOptions};
    use crate::results::Token;

    fn run(g: &Grammar, id: ExprId, input: &str) -> Outcome {
        let mut state = SessionState::new(g.config());
        Matcher::new(g, input, &mut state).parse(id, 0, true, true)
    }

    fn strings(g: &Grammar, id: ExprId, input: &str) -> Vec<String> {
        run(g, id, input).map(|(_, r)| r.as_string_list("")).unwrap_or_default()
    }

    fn message(g: &Grammar, f: &Failure) -> String {
        f.render_message(|i| g.display_name(i))
    }

    #[test]
    fn test_sequence_concatenates_tokens() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let plus = g.literal("+").unwrap();
        let sum = g.and(vec![num, plus, num]);
        assert_eq!(strings(&g, sum, "1 + 22"), vec!["1", "+", "22"]);
    }

    #[test]
    fn test_match_first_takes_first_success() {
        let mut g = Grammar::new();
        let a = g.literal("a").unwrap();
        let ab = g.literal("ab").unwrap();
        let first = g.match_first(vec![a, ab]);
        assert_eq!(strings(&g, first, "ab"), vec!["a"]);
        let longest = g.or(vec![a, ab]);
        assert_eq!(strings(&g, longest, "ab"), vec!["ab"]);
    }

    #[test]
    fn test_wrapper_keeps_child_message_unless_named() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let grouped = g.group(num);
        let err = run(&g, grouped, "x").unwrap_err();
        assert_eq!(message(&g, &err), "Expected W:(0-9)");

        let grouped = g.group(num);
        g.set_name(grouped, "digits");
        let err = run(&g, grouped, "x").unwrap_err();
        assert_eq!(message(&g, &err), "Expected digits");
    }

    #[test]
    fn test_choice_failure_names_the_choice() {
        let mut g = Grammar::new();
        let a = g.literal("a").unwrap();
        let b = g.literal("b").unwrap();
        let alt = g.match_first(vec![a, b]);
        let err = run(&g, alt, "c").unwrap_err();
        assert_eq!(message(&g, &err), "Expected {'a' | 'b'}");

        let num = g.word(NUMS).unwrap();
        let seq = g.and(vec![a, num]);
        let alt = g.match_first(vec![seq, b]);
        let err = run(&g, alt, "a x").unwrap_err();
        assert_eq!(err.loc, 2);
        assert_eq!(message(&g, &err), "Expected W:(0-9)");
    }

    #[test]
    fn test_commit_turns_failure_into_syntax_stop() {
        let mut g = Grammar::new();
        let kw = g.keyword("let").unwrap();
        let ident = g.word(ALPHAS).unwrap();
        let stmt = g.commit(kw, ident);
        let num = g.word(NUMS).unwrap();
        let alt = g.match_first(vec![stmt, num]);
        let err = run(&g, alt, "let 5").unwrap_err();
        assert_eq!(err.kind, FailureKind::SyntaxStop);
        assert_eq!(err.loc, 4);
    }

    #[test]
    fn test_or_fatal_only_when_nothing_matches() {
        let mut g = Grammar::new();
        let kw = g.keyword("let").unwrap();
        let ident = g.word(ALPHAS).unwrap();
        let stmt = g.commit(kw, ident);
        let any = g.regex(r"let \d").unwrap();
        let alt = g.or(vec![stmt, any]);
        assert_eq!(strings(&g, alt, "let 5"), vec!["let 5"]);
        let err = run(&g, alt, "let !").unwrap_err();
        assert_eq!(err.kind, FailureKind::SyntaxStop);
    }

    #[test]
    fn test_each_any_order() {
        let mut g = Grammar::new();
        let color = g.regex("red|blue").unwrap();
        let color = g.named(color, "color");
        let size = g.regex("small|large").unwrap();
        let size = g.named(size, "size");
        let both = g.each(vec![color, size]).unwrap();
        let (_, r) = run(&g, both, "large red").unwrap();
        assert_eq!(r.as_string_list(""), vec!["large", "red"]);
        assert_eq!(r.get_named("color"), Some(&Token::from("red")));

        let err = run(&g, both, "red").unwrap_err();
        assert_eq!(
            message(&g, &err),
            format!("Missing one or more required elements ({})", g.display_name(size))
        );
    }

    #[test]
    fn test_each_optional_default() {
        let mut g = Grammar::new();
        let name = g.word(ALPHAS).unwrap();
        let name = g.named(name, "name");
        let num = g.word(NUMS).unwrap();
        let count = g.opt_default(num, Token::Int(1));
        let count = g.named(count, "count");
        let both = g.each(vec![name, count]).unwrap();
        let (_, r) = run(&g, both, "abc").unwrap();
        assert_eq!(r.get_named("count"), Some(&Token::Int(1)));
        let (_, r) = run(&g, both, "7 abc").unwrap();
        assert_eq!(r.get_named("count"), Some(&Token::from("7")));
    }

    #[test]
    fn test_each_repeated_children_accumulate() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let nums = g.zero_or_more(num);
        let nums = g.named(nums, "nums");
        let word = g.word(ALPHAS).unwrap();
        let both = g.each(vec![word, nums]).unwrap();
        let (_, r) = run(&g, both, "1 abc 2 3").unwrap();
        assert_eq!(r.as_string_list(""), vec!["1", "abc", "2", "3"]);
        let Some(Token::Nested(all)) = r.lookup("nums") else {
            panic!("expected accumulated names");
        };
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_repeat_with_stop_on() {
        let mut g = Grammar::new();
        let word = g.word(ALPHAS).unwrap();
        let end = g.keyword("end").unwrap();
        let body = g.one_or_more_until(word, end);
        let block = g.and(vec![body, end]);
        assert_eq!(strings(&g, block, "a b c end"), vec!["a", "b", "c", "end"]);
        let err = run(&g, body, "end").unwrap_err();
        assert_eq!(message(&g, &err), "Found unwanted token, 'end'");
    }

    #[test]
    fn test_zero_width_repeat_terminates() {
        let mut g = Grammar::new();
        let empty = g.empty();
        let many = g.zero_or_more(empty);
        let (end, r) = run(&g, many, "abc").unwrap();
        assert_eq!(end, 0);
        assert!(r.is_empty());
    }

    #[test]
    fn test_optional_returns_default() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let opt = g.opt_default(num, "0");
        assert_eq!(strings(&g, opt, "x"), vec!["0"]);
        let bare = g.opt(num);
        let (end, r) = run(&g, bare, "x").unwrap();
        assert_eq!((end, r.len()), (0, 0));
    }

    #[test]
    fn test_lookahead_does_not_consume() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let ahead = g.followed_by(num);
        assert_eq!(run(&g, ahead, "12").unwrap().0, 0);
        let not = g.not_any(num);
        assert!(run(&g, not, "12").is_err());
        assert_eq!(run(&g, not, "ab").unwrap().0, 0);
    }

    #[test]
    fn test_preceded_by() {
        let mut g = Grammar::new();
        let dollar = g.literal("$").unwrap();
        let behind = g.preceded_by(dollar, 0);
        let num = g.word(NUMS).unwrap();
        let price = g.and(vec![behind, num]);
        let skip = g.literal("$").unwrap();
        let text = g.and(vec![skip, price]);
        assert_eq!(strings(&g, text, "$42"), vec!["$", "42"]);

        let ident = g.word(ALPHAS).unwrap();
        let after_word = g.preceded_by(ident, 10);
        let eq = g.literal("=").unwrap();
        let assign = g.and(vec![ident, after_word, eq]);
        assert_eq!(strings(&g, assign, "abc ="), vec!["abc", "="]);
    }

    #[test]
    fn test_group_and_suppress() {
        let mut g = Grammar::new();
        let lpar = g.literal("(").unwrap();
        let lpar = g.suppress(lpar);
        let rpar = g.literal(")").unwrap();
        let rpar = g.suppress(rpar);
        let num = g.word(NUMS).unwrap();
        let nums = g.one_or_more(num);
        let inner = g.and(vec![lpar, nums, rpar]);
        let group = g.group(inner);
        let (_, r) = run(&g, group, "(1 2)").unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r.to_string(), "[['1', '2']]");
    }

    #[test]
    fn test_combine_requires_adjacency() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let dot = g.literal(".").unwrap();
        let real = g.and(vec![num, dot, num]);
        let real = g.combine(real);
        assert_eq!(strings(&g, real, " 3.14"), vec!["3.14"]);
        assert!(run(&g, real, "3. 14").is_err());
    }

    #[test]
    fn test_dict_binds_keys() {
        let mut g = Grammar::new();
        let key = g.word(ALPHAS).unwrap();
        let colon = g.literal(":").unwrap();
        let colon = g.suppress(colon);
        let value = g.word(NUMS).unwrap();
        let entry = g.and(vec![key, colon, value]);
        let entry = g.group(entry);
        let entries = g.one_or_more(entry);
        let table = g.dict(entries);
        let (_, r) = run(&g, table, "a: 1 b: 2").unwrap();
        assert_eq!(r.get_named("b"), Some(&Token::from("2")));
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_skip_to() {
        let mut g = Grammar::new();
        let semi = g.literal(";").unwrap();
        let skip = g.skip_to(semi);
        assert_eq!(strings(&g, skip, "abc ;"), vec!["abc "]);

        let with = g.skip_to_with(semi, SkipToOptions { include: true, ..SkipToOptions::default() });
        let (end, r) = run(&g, with, "x;y").unwrap();
        assert_eq!(end, 2);
        assert_eq!(r.as_string_list(""), vec!["x", ";"]);

        let hash = g.literal("#").unwrap();
        let guarded = g.skip_to_with(semi, SkipToOptions { fail_on: Some(hash), ..SkipToOptions::default() });
        let err = run(&g, guarded, "ab#cd;").unwrap_err();
        assert_eq!(err.loc, 2);
        assert!(run(&g, skip, "no end").is_err());
    }

    #[test]
    fn test_skip_to_ignores_quoted_targets() {
        let mut g = Grammar::new();
        let semi = g.literal(";").unwrap();
        let quoted = g.quoted_string("\"").unwrap();
        let skip = g.skip_to_with(semi, SkipToOptions { ignore: Some(quoted), ..SkipToOptions::default() });
        assert_eq!(strings(&g, skip, r#"a "b;c" d;"#), vec![r#"a "b;c" d"#]);
    }

    #[test]
    fn test_unassigned_forward_fails() {
        let mut g = Grammar::new();
        let fwd = g.forward();
        let err = run(&g, fwd, "x").unwrap_err();
        assert_eq!(message(&g, &err), "Forward expression was never assigned a value");
    }

    #[test]
    fn test_left_recursion_grows_seed() {
        let mut g = Grammar::new();
        g.enable_left_recursion(CacheLimit::Unbounded).unwrap();
        let expr = g.forward();
        let plus = g.literal("+").unwrap();
        let num = g.word(NUMS).unwrap();
        let sum = g.and(vec![expr, plus, num]);
        let body = g.match_first(vec![sum, num]);
        g.set_forward(expr, body).unwrap();
        let (end, r) = run(&g, expr, "1+2+3").unwrap();
        assert_eq!(end, 5);
        assert_eq!(r.as_string_list(""), vec!["1", "+", "2", "+", "3"]);
    }

    #[test]
    fn test_left_recursion_without_base_case() {
        let mut g = Grammar::new();
        g.enable_left_recursion(CacheLimit::Bounded(16)).unwrap();
        let expr = g.forward();
        let plus = g.literal("+").unwrap();
        let sum = g.and(vec![expr, plus]);
        g.set_forward(expr, sum).unwrap();
        let err = run(&g, expr, "+").unwrap_err();
        assert_eq!(message(&g, &err), "Forward recursion without base case");
    }
}
