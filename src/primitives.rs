//! Terminal matchers: literals, keywords, character runs, regexes, quoted
//! strings, approximate matches and position assertions.
//!
//! Terminals never recurse into the engine except through the regex engine;
//! they report failures at the position they stopped scanning.

use regex_automata::{Anchored, Input, PatternID};

use crate::cache::Outcome;
use crate::chars::CharSet;
use crate::engine::Matcher;
use crate::error::Failure;
use crate::grammar::{ExprId, NodeKind, QuoteSpec, RegexMode, RegexSpec, WordSpec};
use crate::results::{ParseResults, RegexMatch, Token};
use crate::util::col;

/// Result of scanning a run of characters.
struct Run {
    end: usize,
    count: usize,
}

impl<'a, 's> Matcher<'a, 's> {
    pub(crate) fn parse_terminal(&mut self, id: ExprId, loc: usize) -> Outcome {
        let g = self.g;
        let input = self.input;
        match &g.node(id).kind {
            NodeKind::Empty | NodeKind::ErrorStop => Ok((loc, ParseResults::new())),
            NodeKind::NoMatch => Err(Failure::text(loc, Some(id), "Unmatchable token")),
            NodeKind::Literal { text, caseless } => {
                match match_prefix(input, loc, text, *caseless) {
                    Some(end) => Ok((end, ParseResults::single(text.as_str()))),
                    None => Err(Failure::expected(loc, id)),
                }
            }
            NodeKind::Keyword {
                text,
                caseless,
                ident_chars,
            } => self.parse_keyword(id, loc, text, *caseless, ident_chars),
            NodeKind::Word(spec) => self.parse_word(id, loc, spec),
            NodeKind::CharsNotIn { not_chars, min, max } => {
                let run = scan_run(input, loc, |c| !not_chars.contains(c), |c| !not_chars.contains(c), *max);
                if run.count == 0 || run.count < *min {
                    return Err(Failure::expected(run.end, id));
                }
                Ok((run.end, ParseResults::single(&input[loc..run.end])))
            }
            NodeKind::White { set, min, max, .. } => {
                let run = scan_run(input, loc, |c| set.contains(c), |c| set.contains(c), *max);
                if run.count == 0 || run.count < *min {
                    return Err(Failure::expected(run.end, id));
                }
                Ok((run.end, ParseResults::single(&input[loc..run.end])))
            }
            NodeKind::Regex(spec) => self.parse_regex(id, loc, spec),
            NodeKind::QuotedString(spec) => match spec.re.search(&Input::new(input).range(loc..).anchored(Anchored::Yes)) {
                Some(m) => {
                    let end = m.end();
                    let raw = &input[loc..end];
                    let text = if spec.unquote { unquote(raw, spec) } else { raw.to_string() };
                    Ok((end, ParseResults::single(text)))
                }
                None => Err(Failure::expected(loc, id)),
            },
            NodeKind::CloseMatch {
                text,
                max_mismatches,
                caseless,
            } => parse_close_match(input, loc, text, *max_mismatches, *caseless).ok_or_else(|| Failure::expected(loc, id)),
            NodeKind::LineStart => {
                if col(loc, input) == 1 {
                    Ok((loc, ParseResults::new()))
                } else {
                    Err(Failure::expected(loc, id))
                }
            }
            NodeKind::LineEnd => {
                if loc >= input.len() {
                    Ok((input.len(), ParseResults::new()))
                } else if input[loc..].starts_with('\n') {
                    Ok((loc + 1, ParseResults::single("\n")))
                } else {
                    Err(Failure::expected(loc, id))
                }
            }
            NodeKind::StringStart => {
                if loc == 0 || loc == self.pre_parse(id, 0)? {
                    Ok((loc, ParseResults::new()))
                } else {
                    Err(Failure::expected(loc, id))
                }
            }
            NodeKind::StringEnd => {
                if loc >= input.len() {
                    Ok((input.len(), ParseResults::new()))
                } else {
                    Err(Failure::expected(loc, id))
                }
            }
            NodeKind::WordStart(chars) => {
                let ok = loc == 0
                    || (!prev_char(input, loc).is_some_and(|c| chars.contains(c))
                        && next_char(input, loc).is_some_and(|c| chars.contains(c)));
                if ok {
                    Ok((loc, ParseResults::new()))
                } else {
                    Err(Failure::expected(loc, id))
                }
            }
            NodeKind::WordEnd(chars) => {
                let ok = input.is_empty()
                    || loc >= input.len()
                    || (!next_char(input, loc).is_some_and(|c| chars.contains(c))
                        && prev_char(input, loc).is_some_and(|c| chars.contains(c)));
                if ok {
                    Ok((loc, ParseResults::new()))
                } else {
                    Err(Failure::expected(loc, id))
                }
            }
            NodeKind::GoToColumn(column) => {
                let here = col(loc, input);
                if here > *column {
                    return Err(Failure::text(loc, Some(id), "Text not in expected column"));
                }
                let end = input[loc..]
                    .char_indices()
                    .nth(column - here)
                    .map(|(i, _)| loc + i)
                    .unwrap_or(input.len());
                Ok((end, ParseResults::single(&input[loc..end])))
            }
            kind => Err(Failure::text(
                loc,
                Some(id),
                format!("{} is not a terminal expression", kind.label()),
            )),
        }
    }

    fn parse_keyword(&mut self, id: ExprId, loc: usize, text: &str, caseless: bool, ident: &CharSet) -> Outcome {
        let input = self.input;
        let Some(end) = match_prefix(input, loc, text, caseless) else {
            return Err(Failure::expected(loc, id));
        };
        let is_ident = |c: char| {
            if caseless {
                c.to_uppercase().all(|u| ident.contains(u))
            } else {
                ident.contains(c)
            }
        };
        if let Some(prev) = prev_char(input, loc) {
            if is_ident(prev) {
                return Err(Failure::expected_with(
                    loc - prev.len_utf8(),
                    id,
                    ", keyword was immediately preceded by keyword character",
                ));
            }
        }
        if next_char(input, end).is_some_and(is_ident) {
            return Err(Failure::expected_with(
                end,
                id,
                ", keyword was immediately followed by keyword character",
            ));
        }
        Ok((end, ParseResults::single(text)))
    }

    fn parse_word(&mut self, id: ExprId, loc: usize, spec: &WordSpec) -> Outcome {
        let input = self.input;
        let fail = |at: usize| {
            if spec.as_keyword {
                Failure::expected_with(at, id, " as a keyword")
            } else {
                Failure::expected(at, id)
            }
        };
        if let Some(fast) = &spec.fast {
            let search = Input::new(input).range(loc..).anchored(Anchored::Yes);
            return match fast.search(&search) {
                Some(m) => Ok((m.end(), ParseResults::single(&input[loc..m.end()]))),
                None => Err(fail(loc)),
            };
        }
        if !next_char(input, loc).is_some_and(|c| spec.init.contains(c)) {
            return Err(fail(loc));
        }
        let run = scan_run(input, loc, |c| spec.init.contains(c), |c| spec.body.contains(c), spec.max);
        let end = run.end;
        let follows_body = next_char(input, end).is_some_and(|c| spec.body.contains(c));
        let too_short = run.count < spec.min;
        let too_long = spec.max.is_some() && follows_body;
        let glued = spec.as_keyword
            && (prev_char(input, loc).is_some_and(|c| spec.body.contains(c)) || follows_body);
        if too_short || too_long || glued {
            return Err(fail(end));
        }
        Ok((end, ParseResults::single(&input[loc..end])))
    }

    fn parse_regex(&mut self, id: ExprId, loc: usize, spec: &RegexSpec) -> Outcome {
        let input = self.input;
        let search = Input::new(input).range(loc..).anchored(Anchored::Yes);
        let mut caps = spec.re.create_captures();
        spec.re.search_captures(&search, &mut caps);
        let Some(whole) = caps.get_match() else {
            return Err(Failure::expected(loc, id));
        };
        let end = whole.end();
        let matched = &input[loc..end];
        let group_text = |i: usize| caps.get_group(i).map(|span| input[span.start..span.end].to_string());
        let names: Vec<(usize, String)> = spec
            .re
            .group_info()
            .pattern_names(PatternID::ZERO)
            .enumerate()
            .filter_map(|(i, name)| name.map(|n| (i, n.to_string())))
            .collect();
        let results = match spec.mode {
            RegexMode::Text => {
                let mut results = ParseResults::single(matched);
                for (i, name) in &names {
                    if let Some(text) = group_text(*i) {
                        results.add_named(name, text, 0);
                    }
                }
                results
            }
            RegexMode::GroupList => (1..caps.group_len())
                .map(|i| Token::Str(group_text(i).unwrap_or_default()))
                .collect(),
            RegexMode::Match => {
                let named = names.iter().map(|(i, name)| (name.clone(), group_text(*i))).collect();
                ParseResults::single(Token::Match(RegexMatch {
                    text: matched.to_string(),
                    start: loc,
                    end,
                    groups: (1..caps.group_len()).map(group_text).collect(),
                    named,
                }))
            }
        };
        Ok((end, results))
    }
}

fn next_char(input: &str, loc: usize) -> Option<char> {
    input.get(loc..).and_then(|rest| rest.chars().next())
}

fn prev_char(input: &str, loc: usize) -> Option<char> {
    input.get(..loc).and_then(|head| head.chars().next_back())
}

/// End of `text` matched at `loc`, comparing by upper case when `caseless`.
fn match_prefix(input: &str, loc: usize, text: &str, caseless: bool) -> Option<usize> {
    let rest = input.get(loc..)?;
    if !caseless {
        return rest.starts_with(text).then(|| loc + text.len());
    }
    let n = text.chars().count();
    let len = rest.char_indices().nth(n).map(|(i, _)| i).unwrap_or(rest.len());
    if rest[..len].chars().count() != n {
        return None;
    }
    (rest[..len].to_uppercase() == text.to_uppercase()).then(|| loc + len)
}

/// Scan one `first` character then `body` characters, up to `max` in total.
fn scan_run(
    input: &str,
    loc: usize,
    first: impl Fn(char) -> bool,
    body: impl Fn(char) -> bool,
    max: Option<usize>,
) -> Run {
    let mut end = loc;
    let mut count = 0;
    for c in input[loc..].chars() {
        if max.is_some_and(|m| count >= m) {
            break;
        }
        let ok = if count == 0 { first(c) } else { body(c) };
        if !ok {
            break;
        }
        end += c.len_utf8();
        count += 1;
    }
    Run { end, count }
}

/// Strip the delimiters and resolve escapes.
fn unquote(raw: &str, spec: &QuoteSpec) -> String {
    let inner = &raw[spec.quote.len()..raw.len() - spec.end_quote.len()];
    let mut out = match &spec.unescape {
        Some(re) => {
            let mut out = String::with_capacity(inner.len());
            for caps in re.captures_iter(inner) {
                if let Some(ws) = caps.name("ws") {
                    out.push(match ws.as_str() {
                        "\\t" => '\t',
                        "\\n" => '\n',
                        "\\f" => '\u{c}',
                        _ => '\r',
                    });
                } else if let Some(esc) = caps.name("esc").and_then(|m| m.as_str().chars().last()) {
                    out.push(esc);
                } else {
                    out.push_str(&caps[0]);
                }
            }
            out
        }
        None => inner.to_string(),
    };
    if let Some(esc_quote) = &spec.esc_quote {
        out = out.replace(esc_quote.as_str(), &spec.end_quote);
    }
    out
}

fn parse_close_match(input: &str, loc: usize, text: &str, max_mismatches: usize, caseless: bool) -> Option<(usize, ParseResults)> {
    let rest = input.get(loc..)?;
    let n = text.chars().count();
    if rest.chars().take(n).count() < n {
        return None;
    }
    let mut mismatches = Vec::new();
    let mut end = loc;
    for (i, (src, want)) in rest.chars().zip(text.chars()).enumerate() {
        let same = if caseless {
            src.to_lowercase().eq(want.to_lowercase())
        } else {
            src == want
        };
        if !same {
            mismatches.push(Token::Int(i as i64));
            if mismatches.len() > max_mismatches {
                return None;
            }
        }
        end += src.len_utf8();
    }
    let mut results = ParseResults::single(&input[loc..end]);
    results.add_named("original", text, 0);
    results.add_named("mismatches", Token::Nested(ParseResults::from_tokens(mismatches)), 0);
    Some((end, results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chars::{ALPHAS, ALPHANUMS, NUMS};
    use crate::engine::SessionState;
    use crate::grammar::{Grammar, QuoteOptions, WordOptions};
    use rstest::rstest;

    fn run(g: &Grammar, id: ExprId, input: &str) -> Outcome {
        let mut state = SessionState::new(g.config());
        Matcher::new(g, input, &mut state).parse(id, 0, true, true)
    }

    fn text_of(g: &Grammar, id: ExprId, input: &str) -> Option<String> {
        run(g, id, input).ok().and_then(|(_, r)| r.first_str().map(str::to_string))
    }

    #[rstest]
    #[case("if x", Some("if"))]
    #[case("ifx", None)]
    #[case("  if(", Some("if"))]
    #[case("IF x", None)]
    fn test_keyword_boundaries(#[case] input: &str, #[case] expected: Option<&str>) {
        let mut g = Grammar::new();
        let kw = g.keyword("if").unwrap();
        assert_eq!(text_of(&g, kw, input).as_deref(), expected);
    }

    #[test]
    fn test_keyword_failure_messages() {
        let mut g = Grammar::new();
        let kw = g.keyword("if").unwrap();
        let err = run(&g, kw, "ifx").unwrap_err();
        assert_eq!(err.loc, 2);
        assert_eq!(
            err.render_message(|i| g.display_name(i)),
            "Expected 'if', keyword was immediately followed by keyword character"
        );
    }

    #[test]
    fn test_caseless_keyword_returns_defined_text() {
        let mut g = Grammar::new();
        let kw = g.caseless_keyword("Select").unwrap();
        assert_eq!(text_of(&g, kw, "SELECT *").as_deref(), Some("Select"));
        assert_eq!(text_of(&g, kw, "selectx"), None);
    }

    #[test]
    fn test_caseless_literal() {
        let mut g = Grammar::new();
        let lit = g.caseless_literal("CMD").unwrap();
        assert_eq!(text_of(&g, lit, "cmd").as_deref(), Some("CMD"));
        assert_eq!(text_of(&g, lit, "cm"), None);
    }

    #[test]
    fn test_word_with_body_chars() {
        let mut g = Grammar::new();
        let ident = g.word2(ALPHAS, ALPHANUMS).unwrap();
        assert_eq!(text_of(&g, ident, "abc123 x").as_deref(), Some("abc123"));
        assert_eq!(text_of(&g, ident, "1abc"), None);
    }

    #[test]
    fn test_word_length_limits() {
        let mut g = Grammar::new();
        let two = g
            .word_with(NUMS, WordOptions { exact: 2, ..WordOptions::default() })
            .unwrap();
        assert_eq!(text_of(&g, two, "12").as_deref(), Some("12"));
        assert_eq!(text_of(&g, two, "123"), None);
        let err = run(&g, two, "1").unwrap_err();
        assert_eq!(err.loc, 1);
    }

    #[test]
    fn test_word_as_keyword() {
        let mut g = Grammar::new();
        let w = g
            .word_with(ALPHAS, WordOptions { as_keyword: true, ..WordOptions::default() })
            .unwrap();
        assert_eq!(text_of(&g, w, "abc def").as_deref(), Some("abc"));
        let err = run(&g, w, "12").unwrap_err();
        assert!(err.render_message(|i| g.display_name(i)).ends_with(" as a keyword"));
    }

    #[test]
    fn test_chars_not_in() {
        let mut g = Grammar::new();
        let field = g.chars_not_in(",", 1, 0).unwrap();
        assert_eq!(text_of(&g, field, "ab c,d").as_deref(), Some("ab c"));
        assert!(run(&g, field, ",").is_err());
    }

    #[test]
    fn test_white_is_significant() {
        let mut g = Grammar::new();
        let tab = g.white("\t", 1, 0).unwrap();
        assert_eq!(text_of(&g, tab, "  \t\tx").as_deref(), Some("\t\t"));
        assert_eq!(g.display_name(tab), "<TAB>");
    }

    #[test]
    fn test_regex_named_groups() {
        let mut g = Grammar::new();
        let date = g.regex(r"(?P<year>\d{4})-(?P<month>\d\d)").unwrap();
        let (end, r) = run(&g, date, "2024-05!").unwrap();
        assert_eq!(end, 7);
        assert_eq!(r.first_str(), Some("2024-05"));
        assert_eq!(r.get_named("month"), Some(&Token::from("05")));
    }

    #[test]
    fn test_regex_modes() {
        let mut g = Grammar::new();
        let groups = g.regex_with(r"(\w+)=(\d+)?", RegexMode::GroupList).unwrap();
        let (_, r) = run(&g, groups, "key=").unwrap();
        assert_eq!(r.as_string_list(""), vec!["key", ""]);

        let raw = g.regex_with(r"(\w+)", RegexMode::Match).unwrap();
        let (_, r) = run(&g, raw, "  word").unwrap();
        let Some(Token::Match(m)) = r.first() else {
            panic!("expected match token");
        };
        assert_eq!((m.start, m.end), (2, 6));
        assert_eq!(m.group(1), Some("word"));
    }

    #[test]
    fn test_regex_is_anchored() {
        let mut g = Grammar::new();
        let re = g.regex(r"\d+").unwrap();
        assert!(run(&g, re, "a1").is_err());
    }

    #[test]
    fn test_quoted_string_escapes() {
        let mut g = Grammar::new();
        let mut opts = QuoteOptions::new("\"");
        opts.esc_char = Some('\\');
        let q = g.quoted_string_with(opts).unwrap();
        assert_eq!(text_of(&g, q, r#""a \"b\" c" rest"#).as_deref(), Some(r#"a "b" c"#));
        assert_eq!(text_of(&g, q, "\"tab\\there\"").as_deref(), Some("tab\there"));
        assert_eq!(text_of(&g, q, "\"open\nclose\""), None);
    }

    #[test]
    fn test_quoted_string_doubled_quote() {
        let mut g = Grammar::new();
        let mut opts = QuoteOptions::new("'");
        opts.esc_quote = Some("''".to_string());
        let q = g.quoted_string_with(opts).unwrap();
        assert_eq!(text_of(&g, q, "'it''s'").as_deref(), Some("it's"));
        let (end, _) = run(&g, q, "'ab''").unwrap();
        assert_eq!(end, 4);
    }

    #[test]
    fn test_quoted_string_multichar_delimiters() {
        let mut g = Grammar::new();
        let mut opts = QuoteOptions::new("{{");
        opts.end_quote_char = Some("}}".to_string());
        opts.multiline = true;
        let q = g.quoted_string_with(opts).unwrap();
        assert_eq!(text_of(&g, q, "{{a}b\n}}").as_deref(), Some("a}b\n"));
    }

    #[test]
    fn test_quoted_string_escaped_line_break() {
        let mut g = Grammar::new();
        let mut opts = QuoteOptions::new("\"");
        opts.esc_char = Some('\\');
        let q = g.quoted_string_with(opts).unwrap();
        assert_eq!(text_of(&g, q, "\"a\\\rb\"").as_deref(), Some("a\rb"));
        assert_eq!(text_of(&g, q, "\"a\\\nb\""), None);
    }

    #[test]
    fn test_quoted_string_unterminated_doubled_quote() {
        let mut g = Grammar::new();
        let mut opts = QuoteOptions::new("\"");
        opts.esc_quote = Some("\"\"".to_string());
        let q = g.quoted_string_with(opts).unwrap();
        assert_eq!(text_of(&g, q, r#""a""b""#).as_deref(), Some(r#"a"b"#));
        let (end, r) = run(&g, q, r#""ab"""#).unwrap();
        assert_eq!((end, r.first_str()), (4, Some("ab")));
        assert_eq!(text_of(&g, q, r#""""#).as_deref(), Some(""));
        assert_eq!(text_of(&g, q, r#""abc"#), None);
    }

    #[test]
    fn test_quoted_string_multiline() {
        let text = "\"line one\nline two\" tail";
        let mut g = Grammar::new();
        let single = g.quoted_string("\"").unwrap();
        assert_eq!(text_of(&g, single, text), None);

        let mut opts = QuoteOptions::new("\"");
        opts.multiline = true;
        opts.esc_char = Some('\\');
        let multi = g.quoted_string_with(opts).unwrap();
        assert_eq!(text_of(&g, multi, text).as_deref(), Some("line one\nline two"));
        assert_eq!(text_of(&g, multi, "\"a\\\nb\"").as_deref(), Some("a\nb"));
    }

    #[test]
    fn test_quoted_string_bracket_delimiters() {
        let mut g = Grammar::new();
        let mut opts = QuoteOptions::new("[");
        opts.end_quote_char = Some("]".to_string());
        let q = g.quoted_string_with(opts).unwrap();
        assert_eq!(text_of(&g, q, "[a^b-c] rest").as_deref(), Some("a^b-c"));
    }

    #[test]
    fn test_string_start_skips_ignorables() {
        let mut g = Grammar::new();
        let start = g.string_start();
        let word = g.word(ALPHAS).unwrap();
        let seq = g.and(vec![start, word]);
        let comment = g.c_style_comment().unwrap();
        g.ignore(seq, comment);
        let (_, r) = run(&g, seq, "/* header */ abc").unwrap();
        assert_eq!(r.first_str(), Some("abc"));
    }

    #[test]
    fn test_close_match_near_end_of_input() {
        let mut g = Grammar::new();
        let cm = g.close_match("abcd", 1, false).unwrap();
        assert!(run(&g, cm, "abc").is_err());
        let (end, _) = run(&g, cm, "abxd and more text").unwrap();
        assert_eq!(end, 4);
    }

    #[test]
    fn test_close_match() {
        let mut g = Grammar::new();
        let cm = g.close_match("ATCATCGAATGGA", 2, false).unwrap();
        let (_, r) = run(&g, cm, "ATCAXCGAAXGGA").unwrap();
        assert_eq!(r.first_str(), Some("ATCAXCGAAXGGA"));
        let Some(Token::Nested(mismatches)) = r.get_named("mismatches") else {
            panic!("expected mismatch list");
        };
        assert_eq!(mismatches.tokens(), &[Token::Int(4), Token::Int(9)]);
        assert!(run(&g, cm, "ATCAXCGAAXGGX").is_err());
    }

    #[test]
    fn test_position_matchers() {
        let mut g = Grammar::new();
        let end = g.string_end();
        assert_eq!(run(&g, end, "   ").unwrap().0, 3);
        assert!(run(&g, end, "  x").is_err());

        let eol = g.line_end();
        let (loc, r) = run(&g, eol, "  \nnext").unwrap();
        assert_eq!(loc, 3);
        assert_eq!(r.first_str(), Some("\n"));

        let start = g.line_start();
        assert!(run(&g, start, "abc").is_ok());
    }

    #[test]
    fn test_go_to_column() {
        let mut g = Grammar::new();
        let to5 = g.go_to_column(5);
        let (end, r) = run(&g, to5, "    cd").unwrap();
        assert_eq!(end, 4);
        assert_eq!(r.first_str(), Some(""));
        let (end, r) = run(&g, to5, "ab  cd").unwrap();
        assert_eq!(end, 4);
        assert_eq!(r.first_str(), Some("ab  "));
        let mut g = Grammar::new();
        let to2 = g.go_to_column(2);
        let abc = g.literal("abc").unwrap();
        let seq = g.and(vec![abc, to2]);
        let err = run(&g, seq, "abc").unwrap_err();
        assert_eq!(err.render_message(|_| String::new()), "Text not in expected column");
    }

    #[test]
    fn test_no_match_message() {
        let mut g = Grammar::new();
        let never = g.no_match();
        let err = run(&g, never, "x").unwrap_err();
        assert_eq!(err.render_message(|_| String::new()), "Unmatchable token");
    }
}
