//! Parse results: an ordered token list with multi-valued named captures
//!
//! [`ParseResults`] is what every matcher produces. It behaves as a list (the
//! captured tokens in input order) and as a mapping from results names to one
//! or more captured values at the same time.
//!
//! ## Named captures
//!
//! Each name maps to a list of `(value, position)` entries, where `position`
//! is the index in the token list the value was captured at. Lookups return
//! the last entry unless the name was bound with the "keep all matches" mode,
//! in which case [`ParseResults::lookup`] returns every value.
//!
//! Merging two results (`+` / `+=`) concatenates the token lists and appends
//! the second operand's named entries with their positions shifted by the
//! first operand's length. Values are merged by value: mutating a nested
//! result after it was merged does not change the parent.

use std::fmt;
use std::ops::{Add, AddAssign, Index};

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// A single captured value.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Nested(ParseResults),
    Match(RegexMatch),
}

/// A raw regular-expression match, produced by regex matchers in match mode.
#[derive(Debug, Clone, PartialEq)]
pub struct RegexMatch {
    pub text: String,
    pub start: usize,
    pub end: usize,
    /// Positional groups (excluding group 0); `None` for groups that did not take part
    pub groups: Vec<Option<String>>,
    pub named: Vec<(String, Option<String>)>,
}

impl RegexMatch {
    pub fn group(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return Some(&self.text);
        }
        self.groups.get(index - 1).and_then(|g| g.as_deref())
    }

    pub fn named_group(&self, name: &str) -> Option<&str> {
        self.named
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }
}

impl Token {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Token::Str(s) => Some(s),
            Token::Match(m) => Some(&m.text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Token::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Token::Float(f) => Some(*f),
            Token::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_results(&self) -> Option<&ParseResults> {
        match self {
            Token::Nested(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_results_mut(&mut self) -> Option<&mut ParseResults> {
        match self {
            Token::Nested(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_nested(&self) -> bool {
        matches!(self, Token::Nested(_))
    }

    /// JSON form; nested results become a dict when they carry names.
    pub fn to_json(&self) -> Value {
        match self {
            Token::Str(s) => Value::String(s.clone()),
            Token::Int(i) => Value::from(*i),
            Token::Float(f) => Value::from(*f),
            Token::Bool(b) => Value::Bool(*b),
            Token::Nested(r) => r.to_json(),
            Token::Match(m) => Value::String(m.text.clone()),
        }
    }

    fn to_list_json(&self) -> Value {
        match self {
            Token::Nested(r) => Value::Array(r.as_list()),
            other => other.to_json(),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Str(s) => write!(f, "{}", s),
            Token::Int(i) => write!(f, "{}", i),
            Token::Float(x) => write!(f, "{}", x),
            Token::Bool(b) => write!(f, "{}", b),
            Token::Nested(r) => write!(f, "{}", r),
            Token::Match(m) => write!(f, "{}", m.text),
        }
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Token::Str(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Token::Str(s)
    }
}

impl From<i64> for Token {
    fn from(i: i64) -> Self {
        Token::Int(i)
    }
}

impl From<f64> for Token {
    fn from(x: f64) -> Self {
        Token::Float(x)
    }
}

impl From<bool> for Token {
    fn from(b: bool) -> Self {
        Token::Bool(b)
    }
}

impl From<ParseResults> for Token {
    fn from(r: ParseResults) -> Self {
        Token::Nested(r)
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct NamedCapture {
    name: String,
    entries: Vec<(Token, usize)>,
}

/// Hybrid ordered-list / multi-map parse result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseResults {
    toks: Vec<Token>,
    names: Vec<NamedCapture>,
    /// Names bound in keep-all-matches mode
    accumulate: Vec<String>,
    /// The results name this value was bound under, if any
    name: Option<String>,
}

impl ParseResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tokens(toks: Vec<Token>) -> Self {
        Self {
            toks,
            ..Self::default()
        }
    }

    pub fn single(tok: impl Into<Token>) -> Self {
        Self::from_tokens(vec![tok.into()])
    }

    pub fn len(&self) -> usize {
        self.toks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toks.is_empty()
    }

    /// True when there are neither tokens nor names.
    pub fn is_blank(&self) -> bool {
        self.toks.is_empty() && self.names.is_empty()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.toks
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Token> {
        self.toks.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Token> {
        self.toks.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Token> {
        self.toks.get_mut(index)
    }

    pub fn first(&self) -> Option<&Token> {
        self.toks.first()
    }

    /// String form of the first token, if it has one.
    pub fn first_str(&self) -> Option<&str> {
        self.toks.first().and_then(Token::as_str)
    }

    pub fn push(&mut self, tok: impl Into<Token>) {
        self.toks.push(tok.into());
    }

    pub fn extend(&mut self, toks: impl IntoIterator<Item = Token>) {
        self.toks.extend(toks);
    }

    /// Insert a token, shifting named positions at or after `index`.
    pub fn insert(&mut self, index: usize, tok: impl Into<Token>) {
        let index = index.min(self.toks.len());
        self.toks.insert(index, tok.into());
        for capture in &mut self.names {
            for (_, pos) in &mut capture.entries {
                if *pos >= index {
                    *pos += 1;
                }
            }
        }
    }

    /// Remove the token at `index`; named entries keep their values.
    pub fn remove(&mut self, index: usize) -> Option<Token> {
        if index >= self.toks.len() {
            return None;
        }
        let removed = self.toks.remove(index);
        self.shift_positions_after_removal(&[index]);
        Some(removed)
    }

    pub fn pop(&mut self) -> Option<Token> {
        match self.toks.len() {
            0 => None,
            n => self.remove(n - 1),
        }
    }

    /// Keep the first `len` tokens; named captures survive.
    pub fn truncate_tokens(&mut self, len: usize) {
        if len >= self.toks.len() {
            return;
        }
        let removed: Vec<usize> = (len..self.toks.len()).collect();
        self.toks.truncate(len);
        self.shift_positions_after_removal(&removed);
    }

    /// Drop all tokens while keeping named captures.
    pub fn clear_tokens(&mut self) {
        self.truncate_tokens(0);
    }

    /// Drop tokens and names.
    pub fn clear(&mut self) {
        self.toks.clear();
        self.names.clear();
        self.accumulate.clear();
    }

    fn shift_positions_after_removal(&mut self, removed: &[usize]) {
        for capture in &mut self.names {
            for (_, pos) in &mut capture.entries {
                let before = removed.iter().filter(|j| **j < *pos).count();
                *pos -= before;
            }
        }
    }

    // ----- named captures -------------------------------------------------

    fn capture(&self, name: &str) -> Option<&NamedCapture> {
        self.names.iter().find(|c| c.name == name)
    }

    fn capture_mut(&mut self, name: &str) -> &mut NamedCapture {
        match self.names.iter().position(|c| c.name == name) {
            Some(i) => &mut self.names[i],
            None => {
                self.names.push(NamedCapture {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                let last = self.names.len() - 1;
                &mut self.names[last]
            }
        }
    }

    /// Most recent value bound to `name`.
    pub fn get_named(&self, name: &str) -> Option<&Token> {
        self.capture(name)
            .and_then(|c| c.entries.last())
            .map(|(tok, _)| tok)
    }

    pub fn named_mut(&mut self, name: &str) -> Option<&mut Token> {
        self.names
            .iter_mut()
            .find(|c| c.name == name)
            .and_then(|c| c.entries.last_mut())
            .map(|(tok, _)| tok)
    }

    /// Every value bound to `name`, oldest first.
    pub fn get_all(&self, name: &str) -> Vec<&Token> {
        self.capture(name)
            .map(|c| c.entries.iter().map(|(tok, _)| tok).collect())
            .unwrap_or_default()
    }

    /// Lookup honouring the binding mode: names bound in keep-all mode return
    /// every value as a nested result, others return the last value.
    pub fn lookup(&self, name: &str) -> Option<Token> {
        let capture = self.capture(name)?;
        if self.accumulate.iter().any(|n| n == name) {
            let values = capture.entries.iter().map(|(tok, _)| tok.clone()).collect();
            Some(Token::Nested(ParseResults::from_tokens(values)))
        } else {
            capture.entries.last().map(|(tok, _)| tok.clone())
        }
    }

    /// Lookup returning an empty string token when the name is unset.
    pub fn attr(&self, name: &str) -> Token {
        self.lookup(name).unwrap_or_else(|| Token::Str(String::new()))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.capture(name).is_some()
    }

    pub fn has_names(&self) -> bool {
        !self.names.is_empty()
    }

    /// Names in the order they were first bound.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|c| c.name.as_str())
    }

    /// Bind `name` to `tok`, replacing any earlier values.
    pub fn insert_name(&mut self, name: &str, tok: impl Into<Token>) {
        let capture = self.capture_mut(name);
        capture.entries.clear();
        capture.entries.push((tok.into(), 0));
    }

    /// Append a value for `name` at token position `pos`.
    pub fn add_named(&mut self, name: &str, tok: impl Into<Token>, pos: usize) {
        self.capture_mut(name).entries.push((tok.into(), pos));
    }

    pub fn remove_name(&mut self, name: &str) -> Option<Token> {
        let index = self.names.iter().position(|c| c.name == name)?;
        let capture = self.names.remove(index);
        self.accumulate.retain(|n| n != name);
        capture.entries.into_iter().last().map(|(tok, _)| tok)
    }

    /// Mark `name` as keep-all-matches for lookups.
    pub fn mark_accumulating(&mut self, name: &str) {
        if !self.accumulate.iter().any(|n| n == name) {
            self.accumulate.push(name.to_string());
        }
    }

    pub(crate) fn set_own_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    /// The results name this value is known by.
    ///
    /// Set when the value itself was bound as a named group; otherwise a
    /// result holding exactly one token and one name, bound at position 0,
    /// reports that name.
    pub fn get_name(&self) -> Option<&str> {
        if let Some(name) = &self.name {
            return Some(name);
        }
        if self.toks.len() == 1 && self.names.len() == 1 {
            let capture = &self.names[0];
            if capture.entries.len() == 1 && capture.entries[0].1 == 0 {
                return Some(&capture.name);
            }
        }
        None
    }

    // ----- structural combination -----------------------------------------

    /// Append `other`, shifting its named positions past our tokens.
    pub fn merge(&mut self, other: ParseResults) {
        if other.is_blank() {
            return;
        }
        let offset = self.toks.len();
        for capture in other.names {
            let target = self.capture_mut(&capture.name);
            target
                .entries
                .extend(capture.entries.into_iter().map(|(tok, pos)| (tok, pos + offset)));
        }
        self.toks.extend(other.toks);
        for name in other.accumulate {
            self.mark_accumulating(&name);
        }
    }

    /// Tokens flattened to strings, `sep` placed between top-level items.
    pub fn as_string_list(&self, sep: &str) -> Vec<String> {
        let mut out = Vec::new();
        for tok in &self.toks {
            if !out.is_empty() && !sep.is_empty() {
                out.push(sep.to_string());
            }
            match tok {
                Token::Nested(r) => out.extend(r.as_string_list("")),
                other => out.push(other.to_string()),
            }
        }
        out
    }

    /// Nested list form, dropping names.
    pub fn as_list(&self) -> Vec<Value> {
        self.toks.iter().map(Token::to_list_json).collect()
    }

    /// Named captures as a dict; nested results with names become dicts.
    pub fn as_dict(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for capture in &self.names {
            if let Some(tok) = self.lookup(&capture.name) {
                map.insert(capture.name.clone(), tok.to_json());
            }
        }
        map
    }

    /// Dict form when names are present, list form otherwise.
    pub fn to_json(&self) -> Value {
        if self.has_names() {
            Value::Object(self.as_dict())
        } else {
            Value::Array(self.as_list())
        }
    }

    /// Indented, human-readable tree of tokens and named values.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        out.push_str(&format!("{}", self));
        let mut names: Vec<&NamedCapture> = self.names.iter().collect();
        names.sort_by(|a, b| a.name.cmp(&b.name));
        for capture in names {
            let Some(value) = self.lookup(&capture.name) else {
                continue;
            };
            out.push('\n');
            out.push_str(&format!("{}- {}: ", indent, capture.name));
            match &value {
                Token::Nested(r) if r.has_names() => {
                    r.dump_into(out, depth + 1);
                }
                other => out.push_str(&format_token(other)),
            }
        }
        if !self.has_names() {
            for (i, tok) in self.toks.iter().enumerate() {
                if let Token::Nested(r) = tok {
                    if r.has_names() {
                        out.push('\n');
                        out.push_str(&format!("{}[{}]:\n{}  ", indent, i, indent));
                        r.dump_into(out, depth + 1);
                    }
                }
            }
        }
    }
}

fn format_token(tok: &Token) -> String {
    match tok {
        Token::Str(s) => crate::util::quoted(s),
        Token::Nested(r) => r.to_string(),
        other => other.to_string(),
    }
}

impl fmt::Display for ParseResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, tok) in self.toks.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", format_token(tok))?;
        }
        write!(f, "]")
    }
}

impl From<Vec<Token>> for ParseResults {
    fn from(toks: Vec<Token>) -> Self {
        Self::from_tokens(toks)
    }
}

impl FromIterator<Token> for ParseResults {
    fn from_iter<I: IntoIterator<Item = Token>>(iter: I) -> Self {
        Self::from_tokens(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ParseResults {
    type Item = &'a Token;
    type IntoIter = std::slice::Iter<'a, Token>;

    fn into_iter(self) -> Self::IntoIter {
        self.toks.iter()
    }
}

impl IntoIterator for ParseResults {
    type Item = Token;
    type IntoIter = std::vec::IntoIter<Token>;

    fn into_iter(self) -> Self::IntoIter {
        self.toks.into_iter()
    }
}

impl Index<usize> for ParseResults {
    type Output = Token;

    fn index(&self, index: usize) -> &Token {
        &self.toks[index]
    }
}

impl Index<&str> for ParseResults {
    type Output = Token;

    fn index(&self, name: &str) -> &Token {
        match self.get_named(name) {
            Some(tok) => tok,
            None => panic!("no results name '{}'", name),
        }
    }
}

impl AddAssign for ParseResults {
    fn add_assign(&mut self, other: ParseResults) {
        self.merge(other);
    }
}

impl Add for ParseResults {
    type Output = ParseResults;

    fn add(mut self, other: ParseResults) -> ParseResults {
        self.merge(other);
        self
    }
}

impl Serialize for ParseResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
