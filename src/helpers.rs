//! Ready-made grammar fragments built from the primitives and combinators.

use std::collections::HashMap;

use tracing::warn;

use crate::actions::{ParseAction, Replacement};
use crate::chars::CharSet;
use crate::error::GrammarError;
use crate::grammar::{ExprId, Grammar};
use crate::results::Token;

const DBL_QUOTED: &str = r#""(?:[^"\n\r\\]|""|(?:\\(?:[^x]|x[0-9a-fA-F]+)))*""#;
const SGL_QUOTED: &str = r"'(?:[^'\n\r\\]|''|(?:\\(?:[^x]|x[0-9a-fA-F]+)))*'";

/// Options for [`Grammar::delimited_list_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedListOptions {
    pub delim: String,
    /// Return the whole list, delimiters included, as one string
    pub combine: bool,
    pub min: usize,
    /// Upper bound on the number of elements; `None` for unbounded
    pub max: Option<usize>,
    pub allow_trailing_delim: bool,
}

impl Default for DelimitedListOptions {
    fn default() -> Self {
        Self {
            delim: ",".to_string(),
            combine: false,
            min: 1,
            max: None,
            allow_trailing_delim: false,
        }
    }
}

/// Reorder so no symbol is shadowed by an earlier prefix of it, dropping duplicates.
fn longest_first(mut symbols: Vec<String>, caseless: bool) -> Vec<String> {
    let fold = |s: &str| if caseless { s.to_lowercase() } else { s.to_string() };
    let mut i = 0;
    while i + 1 < symbols.len() {
        let cur = fold(&symbols[i]);
        let mut changed = false;
        for j in i + 1..symbols.len() {
            let other = fold(&symbols[j]);
            if other == cur {
                symbols.remove(j);
                changed = true;
                break;
            }
            if other.starts_with(&cur) {
                let longer = symbols.remove(j);
                symbols.insert(i, longer);
                changed = true;
                break;
            }
        }
        if !changed {
            i += 1;
        }
    }
    symbols
}

impl Grammar {
    /// Match any of the whitespace-separated `symbols`, longest first where
    /// one is a prefix of another.
    ///
    /// Caseless matches return the symbol as written here, not as found.
    pub fn one_of(&mut self, symbols: &str, caseless: bool, as_keyword: bool) -> Result<ExprId, GrammarError> {
        let symbols: Vec<String> = symbols.split_whitespace().map(str::to_string).collect();
        if symbols.is_empty() {
            warn!("one_of called with no symbols");
            return Ok(self.no_match());
        }
        let symbols = longest_first(symbols, caseless);

        let mut pattern = if symbols.iter().all(|s| s.chars().count() == 1) {
            format!("[{}]", CharSet::new(&symbols.concat()).to_regex_class())
        } else {
            symbols.iter().map(|s| regex::escape(s)).collect::<Vec<_>>().join("|")
        };
        if as_keyword {
            pattern = format!(r"\b(?:{})\b", pattern);
        }
        if caseless {
            pattern = format!("(?i:{})", pattern);
        }
        let id = self.regex(&pattern)?;
        self.set_name(id, &symbols.join(" | "));
        if caseless {
            let canonical: HashMap<String, String> = symbols.iter().map(|s| (s.to_lowercase(), s.clone())).collect();
            self.add_action(
                id,
                ParseAction::new(move |_, toks| {
                    let found = toks.first_str().and_then(|t| canonical.get(&t.to_lowercase()));
                    Ok(found.map(|s| Replacement::Token(Token::Str(s.clone()))))
                }),
            );
        }
        Ok(id)
    }

    /// `expr` repeated, separated by `delim`; delimiters are suppressed.
    pub fn delimited_list(&mut self, expr: ExprId, delim: &str) -> Result<ExprId, GrammarError> {
        self.delimited_list_with(
            expr,
            DelimitedListOptions {
                delim: delim.to_string(),
                ..DelimitedListOptions::default()
            },
        )
    }

    pub fn delimited_list_with(&mut self, expr: ExprId, opts: DelimitedListOptions) -> Result<ExprId, GrammarError> {
        self.check(expr)?;
        if opts.min == 0 || opts.max.is_some_and(|max| max < opts.min) {
            return Err(GrammarError::InvalidWordBounds {
                kind: "delimited_list",
                min: opts.min,
                max: opts.max.unwrap_or(0),
            });
        }
        let delim = self.literal(&opts.delim)?;
        let item = self.display_name(expr);
        let name = format!("{} [{} {}]...", item, self.display_name(delim), item);

        let sep = if opts.combine { delim } else { self.suppress(delim) };
        let pair = self.and(vec![sep, expr]);
        let mut parts = vec![expr];
        parts.extend(std::iter::repeat(pair).take(opts.min - 1));
        match opts.max {
            None => parts.push(self.zero_or_more(pair)),
            Some(max) if max > opts.min => parts.push(self.optional_chain(pair, max - opts.min)),
            Some(_) => {}
        }
        if opts.allow_trailing_delim {
            parts.push(self.opt(sep));
        }
        let mut list = self.and(parts);
        if opts.combine {
            list = self.combine(list);
        }
        Ok(self.set_name(list, &name))
    }

    /// `Opt(expr + Opt(expr + ...))`, `depth` levels deep.
    fn optional_chain(&mut self, expr: ExprId, depth: usize) -> ExprId {
        let mut tail = self.opt(expr);
        for _ in 1..depth {
            let seq = self.and(vec![expr, tail]);
            tail = self.opt(seq);
        }
        tail
    }

    /// `Dict(OneOrMore(Group(key + value)))`
    pub fn dict_of(&mut self, key: ExprId, value: ExprId) -> ExprId {
        let entry = self.and(vec![key, value]);
        let entry = self.group(entry);
        let entries = self.one_or_more(entry);
        self.dict(entries)
    }

    /// Double-quoted string, quotes included.
    pub fn dbl_quoted_string(&mut self) -> Result<ExprId, GrammarError> {
        let id = self.regex(DBL_QUOTED)?;
        Ok(self.set_name(id, "string enclosed in double quotes"))
    }

    /// Single-quoted string, quotes included.
    pub fn sgl_quoted_string(&mut self) -> Result<ExprId, GrammarError> {
        let id = self.regex(SGL_QUOTED)?;
        Ok(self.set_name(id, "string enclosed in single quotes"))
    }

    /// Single- or double-quoted string, quotes included.
    pub fn any_quoted_string(&mut self) -> Result<ExprId, GrammarError> {
        let id = self.regex(&format!("{}|{}", DBL_QUOTED, SGL_QUOTED))?;
        Ok(self.set_name(id, "quoted string, starting with ' or \" ending with ' or \""))
    }

    pub fn c_style_comment(&mut self) -> Result<ExprId, GrammarError> {
        let id = self.regex(r"/\*[^*]*\*+(?:[^/*][^*]*\*+)*/")?;
        Ok(self.set_name(id, "C style comment"))
    }

    /// `/* ... */` or `// ...` to the end of the line.
    pub fn cpp_style_comment(&mut self) -> Result<ExprId, GrammarError> {
        let id = self.regex(r"/\*[^*]*\*+(?:[^/*][^*]*\*+)*/|//(?:\\\n|[^\n])*")?;
        Ok(self.set_name(id, "C++ style comment"))
    }

    pub fn python_style_comment(&mut self) -> Result<ExprId, GrammarError> {
        let id = self.regex(r"#.*")?;
        Ok(self.set_name(id, "Python style comment"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chars::{ALPHAS, NUMS};

    fn strings(g: &Grammar, id: ExprId, input: &str) -> Vec<String> {
        g.parse_string(id, input, false).unwrap().as_string_list("")
    }

    #[test]
    fn test_longest_first_ordering() {
        let ordered = longest_first(vec!["<".into(), "<=".into(), ">".into(), ">=".into(), "<".into()], false);
        assert_eq!(ordered, vec!["<=", "<", ">=", ">"]);
    }

    #[test]
    fn test_one_of_prefers_longer_symbols() {
        let mut g = Grammar::new();
        let op = g.one_of("< <= > >=", false, false).unwrap();
        assert_eq!(g.display_name(op), "<= | < | >= | >");
        assert_eq!(strings(&g, op, "<= 3"), vec!["<="]);
        assert_eq!(strings(&g, op, ">3"), vec![">"]);
    }

    #[test]
    fn test_one_of_single_chars() {
        let mut g = Grammar::new();
        let op = g.one_of("+ - * /", false, false).unwrap();
        assert_eq!(strings(&g, op, "*"), vec!["*"]);
        assert!(g.parse_string(op, "x", false).is_err());
    }

    #[test]
    fn test_one_of_caseless_returns_defined_text() {
        let mut g = Grammar::new();
        let kw = g.one_of("select FROM Select", true, false).unwrap();
        assert_eq!(g.display_name(kw), "select | FROM");
        assert_eq!(strings(&g, kw, "SELECT"), vec!["select"]);
        assert_eq!(strings(&g, kw, "from"), vec!["FROM"]);
    }

    #[test]
    fn test_one_of_as_keyword() {
        let mut g = Grammar::new();
        let kw = g.one_of("if in", false, true).unwrap();
        assert!(g.parse_string(kw, "inside", false).is_err());
        assert_eq!(strings(&g, kw, "in x"), vec!["in"]);
    }

    #[test]
    fn test_one_of_empty_never_matches() {
        let mut g = Grammar::new();
        let none = g.one_of("  ", false, false).unwrap();
        assert!(g.parse_string(none, "", false).is_err());
    }

    #[test]
    fn test_delimited_list() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let list = g.delimited_list(num, ",").unwrap();
        assert_eq!(g.display_name(list), "W:(0-9) [',' W:(0-9)]...");
        assert_eq!(strings(&g, list, "1, 2,3"), vec!["1", "2", "3"]);
        assert!(g.parse_string(list, "1,2,", true).is_err());
    }

    #[test]
    fn test_delimited_list_bounds_and_trailing() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let opts = DelimitedListOptions {
            min: 2,
            max: Some(3),
            allow_trailing_delim: true,
            ..DelimitedListOptions::default()
        };
        let list = g.delimited_list_with(num, opts).unwrap();
        assert!(g.parse_string(list, "1", false).is_err());
        assert_eq!(strings(&g, list, "1,2,3,4"), vec!["1", "2", "3"]);
        assert!(g.parse_string(list, "1,2,", true).is_ok());

        let bad = DelimitedListOptions {
            min: 0,
            ..DelimitedListOptions::default()
        };
        assert!(g.delimited_list_with(num, bad).is_err());
    }

    #[test]
    fn test_delimited_list_combined() {
        let mut g = Grammar::new();
        let word = g.word(ALPHAS).unwrap();
        let dotted = g
            .delimited_list_with(
                word,
                DelimitedListOptions {
                    delim: ".".to_string(),
                    combine: true,
                    ..DelimitedListOptions::default()
                },
            )
            .unwrap();
        assert_eq!(strings(&g, dotted, "os.path.join"), vec!["os.path.join"]);
    }

    #[test]
    fn test_dict_of() {
        let mut g = Grammar::new();
        let key = g.word(ALPHAS).unwrap();
        let num = g.word(NUMS).unwrap();
        let table = g.dict_of(key, num);
        let r = g.parse_string(table, "a 1 b 2", true).unwrap();
        assert_eq!(r.get_named("a"), Some(&Token::from("1")));
        assert_eq!(r.get_named("b"), Some(&Token::from("2")));
    }

    #[test]
    fn test_quoted_string_presets() {
        let mut g = Grammar::new();
        let dbl = g.dbl_quoted_string().unwrap();
        assert_eq!(strings(&g, dbl, r#""a\"b" rest"#), vec![r#""a\"b""#]);
        let sgl = g.sgl_quoted_string().unwrap();
        assert_eq!(strings(&g, sgl, "'it''s'"), vec!["'it''s'"]);
        let any = g.any_quoted_string().unwrap();
        assert_eq!(strings(&g, any, "'x'"), vec!["'x'"]);
        assert!(g.parse_string(dbl, "\"open\nline\"", false).is_err());
    }

    #[test]
    fn test_comments() {
        let mut g = Grammar::new();
        let c = g.c_style_comment().unwrap();
        assert_eq!(strings(&g, c, "/* a * b **/ x"), vec!["/* a * b **/"]);
        let cpp = g.cpp_style_comment().unwrap();
        assert_eq!(strings(&g, cpp, "// note\nx"), vec!["// note"]);
        let py = g.python_style_comment().unwrap();
        assert_eq!(strings(&g, py, "# hi\nx = 1"), vec!["# hi"]);
    }

    #[test]
    fn test_comments_as_ignorables() {
        let mut g = Grammar::new();
        let num = g.word(NUMS).unwrap();
        let nums = g.one_or_more(num);
        let comment = g.python_style_comment().unwrap();
        let nums = g.ignore(nums, comment);
        assert_eq!(strings(&g, nums, "1 # one\n2"), vec!["1", "2"]);
    }
}
