//! Grammar arena and construction API
//!
//! A [`Grammar`] owns every matcher node in a flat arena; nodes refer to their
//! children by [`ExprId`]. Recursive rules are expressed with `Forward` nodes
//! whose target is filled in after construction with [`Grammar::set_forward`],
//! so there are no ownership cycles.
//!
//! ## Preparation
//!
//! Before the first match the grammar is prepared ("streamlined") once:
//! nested unnamed, action-free sequences and choices of the same kind are
//! collapsed into flat child lists, and the derived flags (may match empty,
//! bind names as a list) are computed to a fixpoint so that recursion through
//! `Forward` nodes is handled. Any mutation through `&mut self` drops the
//! prepared plan; it is rebuilt lazily on the next parse.
//!
//! ## Copy semantics
//!
//! The same node is commonly reused at several grammar positions, so the
//! setters that change how a node behaves as a grammar element
//! ([`Grammar::named`], [`Grammar::leave_whitespace`]) return copies. The
//! remaining setters (`set_name`, `add_action`, `ignore`, ...) modify the node
//! in place.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use regex_automata::meta;
use tracing::debug;

use crate::actions::{Condition, Hook, ParseAction};
use crate::cache::CacheStats;
use crate::chars::{CharSet, KNOWN_WHITESPACE, PRINTABLES};
use crate::config::{global_defaults, CacheLimit, EngineConfig};
use crate::error::GrammarError;
use crate::results::Token;
use crate::util::{escape_range_char, quoted};

/// Handle to a node in a [`Grammar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub(crate) u32);

impl ExprId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Options for [`Grammar::word_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordOptions {
    /// Characters allowed after the first one; defaults to the initial set
    pub body_chars: Option<String>,
    pub min: usize,
    /// Maximum length, 0 for unbounded
    pub max: usize,
    /// Exact length, 0 for none; overrides `min` and `max`
    pub exact: usize,
    /// Require keyword boundaries on both sides
    pub as_keyword: bool,
    /// Characters removed from both sets
    pub exclude_chars: Option<String>,
}

impl Default for WordOptions {
    fn default() -> Self {
        Self {
            body_chars: None,
            min: 1,
            max: 0,
            exact: 0,
            as_keyword: false,
            exclude_chars: None,
        }
    }
}

/// What a regex matcher returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegexMode {
    /// The matched text, with named groups bound as results names
    #[default]
    Text,
    /// One token per positional group (unmatched groups become "")
    GroupList,
    /// A single [`Token::Match`]
    Match,
}

/// Options for [`Grammar::quoted_string_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteOptions {
    pub quote_char: String,
    /// Defaults to `quote_char`
    pub end_quote_char: Option<String>,
    pub esc_char: Option<char>,
    /// Sequence standing for an embedded end quote, e.g. `""`
    pub esc_quote: Option<String>,
    pub multiline: bool,
    pub unquote_results: bool,
    /// Turn `\t`, `\n`, `\f`, `\r` into the real characters when unquoting
    pub convert_whitespace_escapes: bool,
}

impl QuoteOptions {
    pub fn new(quote_char: impl Into<String>) -> Self {
        Self {
            quote_char: quote_char.into(),
            end_quote_char: None,
            esc_char: None,
            esc_quote: None,
            multiline: false,
            unquote_results: true,
            convert_whitespace_escapes: true,
        }
    }
}

/// Options for [`Grammar::skip_to_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipToOptions {
    /// Also consume and return the target match
    pub include: bool,
    /// Skipped over while scanning, e.g. quoted strings containing the target
    pub ignore: Option<ExprId>,
    /// Scanning fails if this matches before the target
    pub fail_on: Option<ExprId>,
}

#[derive(Debug, Clone)]
pub(crate) struct WordSpec {
    pub init: CharSet,
    pub body: CharSet,
    pub min: usize,
    pub max: Option<usize>,
    pub as_keyword: bool,
    /// Anchored regex equivalent, used when it cannot change the outcome
    pub fast: Option<meta::Regex>,
}

#[derive(Debug, Clone)]
pub(crate) struct RegexSpec {
    pub pattern: String,
    pub re: meta::Regex,
    pub mode: RegexMode,
}

#[derive(Debug, Clone)]
pub(crate) struct QuoteSpec {
    pub quote: String,
    pub end_quote: String,
    pub esc_quote: Option<String>,
    pub unquote: bool,
    /// Anchored pattern for the whole quoted string, delimiters included
    pub re: meta::Regex,
    /// Splits the unquoted body into whitespace escapes, escaped characters
    /// and plain characters
    pub unescape: Option<regex::Regex>,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    Empty,
    NoMatch,
    Literal { text: String, caseless: bool },
    Keyword { text: String, caseless: bool, ident_chars: CharSet },
    Word(Box<WordSpec>),
    CharsNotIn { not_chars: CharSet, min: usize, max: Option<usize> },
    White { chars: String, set: CharSet, min: usize, max: Option<usize> },
    Regex(Box<RegexSpec>),
    QuotedString(Box<QuoteSpec>),
    CloseMatch { text: String, max_mismatches: usize, caseless: bool },
    LineStart,
    LineEnd,
    StringStart,
    StringEnd,
    WordStart(CharSet),
    WordEnd(CharSet),
    GoToColumn(usize),
    SkipTo { target: ExprId, include: bool, ignore: Vec<ExprId>, fail_on: Option<ExprId> },
    And(Vec<ExprId>),
    /// Commit marker inside an `And`
    ErrorStop,
    MatchFirst(Vec<ExprId>),
    Or(Vec<ExprId>),
    Each(Vec<ExprId>),
    Repeat { expr: ExprId, min: usize, stop_on: Option<ExprId> },
    Opt { expr: ExprId, default: Option<Token> },
    FollowedBy(ExprId),
    NotAny(ExprId),
    PrecededBy { expr: ExprId, retreat: usize, exact: bool },
    Group(ExprId),
    Suppress(ExprId),
    Combine { expr: ExprId, join: String, adjacent: bool },
    Dict(ExprId),
    Forward(Option<ExprId>),
}

impl NodeKind {
    /// Short kind name used in explain frames and debug output.
    pub(crate) fn label(&self) -> &'static str {
        match self {
            NodeKind::Empty => "Empty",
            NodeKind::NoMatch => "NoMatch",
            NodeKind::Literal { caseless: false, .. } => "Literal",
            NodeKind::Literal { caseless: true, .. } => "CaselessLiteral",
            NodeKind::Keyword { caseless: false, .. } => "Keyword",
            NodeKind::Keyword { caseless: true, .. } => "CaselessKeyword",
            NodeKind::Word(_) => "Word",
            NodeKind::CharsNotIn { .. } => "CharsNotIn",
            NodeKind::White { .. } => "White",
            NodeKind::Regex(_) => "Regex",
            NodeKind::QuotedString(_) => "QuotedString",
            NodeKind::CloseMatch { .. } => "CloseMatch",
            NodeKind::LineStart => "LineStart",
            NodeKind::LineEnd => "LineEnd",
            NodeKind::StringStart => "StringStart",
            NodeKind::StringEnd => "StringEnd",
            NodeKind::WordStart(_) => "WordStart",
            NodeKind::WordEnd(_) => "WordEnd",
            NodeKind::GoToColumn(_) => "GoToColumn",
            NodeKind::SkipTo { .. } => "SkipTo",
            NodeKind::And(_) => "And",
            NodeKind::ErrorStop => "ErrorStop",
            NodeKind::MatchFirst(_) => "MatchFirst",
            NodeKind::Or(_) => "Or",
            NodeKind::Each(_) => "Each",
            NodeKind::Repeat { min: 0, .. } => "ZeroOrMore",
            NodeKind::Repeat { .. } => "OneOrMore",
            NodeKind::Opt { .. } => "Opt",
            NodeKind::FollowedBy(_) => "FollowedBy",
            NodeKind::NotAny(_) => "NotAny",
            NodeKind::PrecededBy { .. } => "PrecededBy",
            NodeKind::Group(_) => "Group",
            NodeKind::Suppress(_) => "Suppress",
            NodeKind::Combine { .. } => "Combine",
            NodeKind::Dict(_) => "Dict",
            NodeKind::Forward(_) => "Forward",
        }
    }

    /// Ordered sub-expressions, as declared (before flattening).
    pub(crate) fn children(&self) -> Vec<ExprId> {
        match self {
            NodeKind::And(c) | NodeKind::MatchFirst(c) | NodeKind::Or(c) | NodeKind::Each(c) => {
                c.clone()
            }
            NodeKind::Repeat { expr, .. }
            | NodeKind::Opt { expr, .. }
            | NodeKind::PrecededBy { expr, .. }
            | NodeKind::Combine { expr, .. }
            | NodeKind::FollowedBy(expr)
            | NodeKind::NotAny(expr)
            | NodeKind::Group(expr)
            | NodeKind::Suppress(expr)
            | NodeKind::Dict(expr) => vec![*expr],
            NodeKind::SkipTo { target, .. } => vec![*target],
            NodeKind::Forward(target) => target.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    fn is_expression(&self) -> bool {
        matches!(
            self,
            NodeKind::And(_) | NodeKind::MatchFirst(_) | NodeKind::Or(_) | NodeKind::Each(_)
        )
    }

    fn same_expression_kind(&self, other: &NodeKind) -> bool {
        matches!(
            (self, other),
            (NodeKind::And(_), NodeKind::And(_))
                | (NodeKind::MatchFirst(_), NodeKind::MatchFirst(_))
                | (NodeKind::Or(_), NodeKind::Or(_))
                | (NodeKind::Each(_), NodeKind::Each(_))
        )
    }

    fn child_slot(&mut self) -> Option<&mut ExprId> {
        match self {
            NodeKind::Repeat { expr, .. }
            | NodeKind::Opt { expr, .. }
            | NodeKind::PrecededBy { expr, .. }
            | NodeKind::Combine { expr, .. }
            | NodeKind::FollowedBy(expr)
            | NodeKind::NotAny(expr)
            | NodeKind::Group(expr)
            | NodeKind::Suppress(expr)
            | NodeKind::Dict(expr) => Some(expr),
            NodeKind::SkipTo { target, .. } => Some(target),
            _ => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<ExprId>> {
        match self {
            NodeKind::And(c) | NodeKind::MatchFirst(c) | NodeKind::Or(c) | NodeKind::Each(c) => {
                Some(c)
            }
            _ => None,
        }
    }

    fn is_position(&self) -> bool {
        matches!(
            self,
            NodeKind::LineStart
                | NodeKind::LineEnd
                | NodeKind::StringStart
                | NodeKind::StringEnd
                | NodeKind::WordStart(_)
                | NodeKind::WordEnd(_)
                | NodeKind::GoToColumn(_)
        )
    }
}

/// One matcher node with its per-node settings.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub kind: NodeKind,
    pub custom_name: Option<String>,
    pub results_name: Option<String>,
    /// Results name binds every match instead of the last one
    pub list_all: bool,
    pub hooks: Vec<Hook>,
    pub call_during_try: bool,
    pub skip_whitespace: bool,
    /// `None` uses the grammar's default whitespace characters
    pub whitespace: Option<CharSet>,
    pub call_preparse: bool,
    pub ignore_exprs: Vec<ExprId>,
    pub keep_tabs: bool,
    pub debug: bool,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            custom_name: None,
            results_name: None,
            list_all: false,
            hooks: Vec::new(),
            call_during_try: false,
            skip_whitespace: true,
            whitespace: None,
            call_preparse: true,
            ignore_exprs: Vec::new(),
            keep_tabs: false,
            debug: false,
        }
    }
}

/// Entry of an `Each` matching plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EachEntry {
    /// Expression tried while searching for an order
    pub probe: ExprId,
    /// Expression re-parsed once the order is known
    pub reparse: ExprId,
    /// Results name bound (keep-all mode) after re-parsing repeated children
    pub rename: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct EachPlan {
    pub required: Vec<EachEntry>,
    pub optionals: Vec<EachEntry>,
    pub multis: Vec<EachEntry>,
}

/// Derived, read-only data computed once before matching.
#[derive(Debug, Default)]
pub(crate) struct Prepared {
    /// Flattened children of sequence and choice nodes
    pub flat: Vec<Vec<ExprId>>,
    pub may_empty: Vec<bool>,
    pub save_list: Vec<bool>,
    pub each: HashMap<ExprId, EachPlan>,
}

/// Arena of matcher nodes plus the engine configuration used to run them.
#[derive(Debug)]
pub struct Grammar {
    nodes: Vec<Node>,
    config: EngineConfig,
    default_ws: CharSet,
    keyword_chars: CharSet,
    prepared: OnceCell<Prepared>,
    last_stats: Mutex<CacheStats>,
}

impl Default for Grammar {
    fn default() -> Self {
        Self::new()
    }
}

impl Grammar {
    /// New grammar using a snapshot of the process-wide defaults.
    pub fn new() -> Self {
        Self::from_valid_config(global_defaults())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, GrammarError> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: EngineConfig) -> Self {
        Self {
            nodes: Vec::new(),
            default_ws: CharSet::new(&config.default_whitespace_chars),
            keyword_chars: CharSet::new(&config.default_keyword_chars),
            config,
            prepared: OnceCell::new(),
            last_stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn node(&self, id: ExprId) -> &Node {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: ExprId) -> &mut Node {
        self.prepared = OnceCell::new();
        &mut self.nodes[id.index()]
    }

    pub(crate) fn default_whitespace(&self) -> &CharSet {
        &self.default_ws
    }

    /// Whitespace characters node `id` skips.
    pub(crate) fn whitespace_of(&self, id: ExprId) -> &CharSet {
        self.node(id).whitespace.as_ref().unwrap_or(&self.default_ws)
    }

    pub(crate) fn check(&self, id: ExprId) -> Result<(), GrammarError> {
        if id.index() < self.nodes.len() {
            Ok(())
        } else {
            Err(GrammarError::UnknownExpr(id.0))
        }
    }

    fn push(&mut self, node: Node) -> ExprId {
        self.prepared = OnceCell::new();
        self.nodes.push(node);
        ExprId((self.nodes.len() - 1) as u32)
    }

    // ----- configuration toggles ------------------------------------------

    pub fn enable_packrat(&mut self, limit: CacheLimit) -> Result<(), GrammarError> {
        self.config = self.config.clone().with_packrat(limit)?;
        debug!(?limit, "packrat caching enabled");
        Ok(())
    }

    pub fn disable_packrat(&mut self) {
        self.config.packrat = None;
    }

    pub fn enable_left_recursion(&mut self, limit: CacheLimit) -> Result<(), GrammarError> {
        self.config = self.config.clone().with_left_recursion(limit)?;
        debug!(?limit, "bounded left recursion enabled");
        Ok(())
    }

    pub fn disable_left_recursion(&mut self) {
        self.config.left_recursion = None;
    }

    /// Change the whitespace skipped by every node without explicit characters.
    pub fn set_default_whitespace_chars(&mut self, chars: &str) {
        self.config.default_whitespace_chars = chars.to_string();
        self.default_ws = CharSet::new(chars);
    }

    /// Keyword boundary characters for keywords created afterwards.
    pub fn set_default_keyword_chars(&mut self, chars: &str) -> Result<(), GrammarError> {
        if chars.is_empty() {
            return Err(GrammarError::EmptyCharSet("keyword characters"));
        }
        self.config.default_keyword_chars = chars.to_string();
        self.keyword_chars = CharSet::new(chars);
        Ok(())
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: u64) {
        self.config.timeout_ms = timeout_ms;
    }

    pub fn set_record_explain(&mut self, record: bool) {
        self.config.record_explain = record;
    }

    /// Packrat hit/miss counts and memo size of the most recent parse or scan.
    pub fn last_cache_stats(&self) -> CacheStats {
        match self.last_stats.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn record_stats(&self, stats: CacheStats) {
        match self.last_stats.lock() {
            Ok(mut guard) => *guard = stats,
            Err(poisoned) => *poisoned.into_inner() = stats,
        }
    }

    // ----- primitives -----------------------------------------------------

    /// Always matches, consuming nothing.
    pub fn empty(&mut self) -> ExprId {
        self.push(Node::new(NodeKind::Empty))
    }

    /// Never matches.
    pub fn no_match(&mut self) -> ExprId {
        self.push(Node::new(NodeKind::NoMatch))
    }

    pub fn literal(&mut self, text: &str) -> Result<ExprId, GrammarError> {
        if text.is_empty() {
            return Err(GrammarError::EmptyLiteral);
        }
        Ok(self.push(Node::new(NodeKind::Literal {
            text: text.to_string(),
            caseless: false,
        })))
    }

    /// Case-insensitive literal; returns the text as defined, not as found.
    pub fn caseless_literal(&mut self, text: &str) -> Result<ExprId, GrammarError> {
        if text.is_empty() {
            return Err(GrammarError::EmptyLiteral);
        }
        Ok(self.push(Node::new(NodeKind::Literal {
            text: text.to_string(),
            caseless: true,
        })))
    }

    pub fn keyword(&mut self, text: &str) -> Result<ExprId, GrammarError> {
        let chars = self.keyword_chars.clone();
        self.keyword_with(text, chars, false)
    }

    pub fn caseless_keyword(&mut self, text: &str) -> Result<ExprId, GrammarError> {
        let chars = self.keyword_chars.clone();
        self.keyword_with(text, chars, true)
    }

    /// Keyword with an explicit identifier character set.
    pub fn keyword_with(
        &mut self,
        text: &str,
        ident_chars: impl Into<CharSet>,
        caseless: bool,
    ) -> Result<ExprId, GrammarError> {
        if text.is_empty() {
            return Err(GrammarError::EmptyLiteral);
        }
        let ident_chars: CharSet = ident_chars.into();
        let ident_chars = if caseless {
            ident_chars.to_uppercase()
        } else {
            ident_chars
        };
        Ok(self.push(Node::new(NodeKind::Keyword {
            text: text.to_string(),
            caseless,
            ident_chars,
        })))
    }

    /// Word whose characters all come from `chars`.
    pub fn word(&mut self, chars: &str) -> Result<ExprId, GrammarError> {
        self.word_with(chars, WordOptions::default())
    }

    /// Word starting with a char from `init_chars`, continuing with `body_chars`.
    pub fn word2(&mut self, init_chars: &str, body_chars: &str) -> Result<ExprId, GrammarError> {
        self.word_with(
            init_chars,
            WordOptions {
                body_chars: Some(body_chars.to_string()),
                ..WordOptions::default()
            },
        )
    }

    pub fn word_with(&mut self, init_chars: &str, opts: WordOptions) -> Result<ExprId, GrammarError> {
        let exclude = opts.exclude_chars.as_deref().map(CharSet::new).unwrap_or_default();
        let init = CharSet::new(init_chars).difference(&exclude);
        if init.is_empty() {
            return Err(GrammarError::EmptyCharSet("Word initial characters"));
        }
        let body = match &opts.body_chars {
            Some(b) if !b.is_empty() => CharSet::new(b).difference(&exclude),
            _ => init.clone(),
        };
        if opts.min < 1 {
            return Err(GrammarError::InvalidWordBounds {
                kind: "Word",
                min: opts.min,
                max: opts.max,
            });
        }
        if opts.max > 0 && opts.min > opts.max {
            return Err(GrammarError::InvalidWordBounds {
                kind: "Word",
                min: opts.min,
                max: opts.max,
            });
        }
        let (min, max) = if opts.exact > 0 {
            (opts.exact, Some(opts.exact))
        } else {
            (opts.min, (opts.max > 0).then_some(opts.max))
        };
        let fast = if max.is_none() && min == 1 && !opts.as_keyword {
            let pattern = format!("[{}][{}]*", init.to_regex_class(), body.to_regex_class());
            meta::Regex::new(&pattern).ok()
        } else {
            None
        };
        Ok(self.push(Node::new(NodeKind::Word(Box::new(WordSpec {
            init,
            body,
            min,
            max,
            as_keyword: opts.as_keyword,
            fast,
        })))))
    }

    /// A single character from `chars`.
    pub fn char(&mut self, chars: &str) -> Result<ExprId, GrammarError> {
        self.word_with(
            chars,
            WordOptions {
                exact: 1,
                ..WordOptions::default()
            },
        )
    }

    /// Run of characters not in `not_chars`; `max` of 0 means unbounded.
    pub fn chars_not_in(&mut self, not_chars: &str, min: usize, max: usize) -> Result<ExprId, GrammarError> {
        if not_chars.is_empty() {
            return Err(GrammarError::EmptyCharSet("CharsNotIn"));
        }
        if min < 1 || (max > 0 && min > max) {
            return Err(GrammarError::InvalidWordBounds {
                kind: "CharsNotIn",
                min,
                max,
            });
        }
        Ok(self.push(Node::new(NodeKind::CharsNotIn {
            not_chars: CharSet::new(not_chars),
            min,
            max: (max > 0).then_some(max),
        })))
    }

    /// Significant whitespace; skips only the whitespace it does not match.
    pub fn white(&mut self, chars: &str, min: usize, max: usize) -> Result<ExprId, GrammarError> {
        let set = CharSet::new(chars);
        if set.is_empty() {
            return Err(GrammarError::EmptyCharSet("White"));
        }
        if min < 1 || (max > 0 && min > max) {
            return Err(GrammarError::InvalidWordBounds {
                kind: "White",
                min,
                max,
            });
        }
        let skipped = CharSet::new(KNOWN_WHITESPACE).difference(&set);
        let mut node = Node::new(NodeKind::White {
            chars: chars.to_string(),
            set,
            min,
            max: (max > 0).then_some(max),
        });
        node.whitespace = Some(skipped);
        Ok(self.push(node))
    }

    pub fn regex(&mut self, pattern: &str) -> Result<ExprId, GrammarError> {
        self.regex_with(pattern, RegexMode::Text)
    }

    pub fn regex_with(&mut self, pattern: &str, mode: RegexMode) -> Result<ExprId, GrammarError> {
        if pattern.is_empty() {
            return Err(GrammarError::InvalidRegex {
                pattern: String::new(),
                reason: "empty pattern; use Empty instead".to_string(),
            });
        }
        let re = meta::Regex::new(pattern).map_err(|e| GrammarError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.push(Node::new(NodeKind::Regex(Box::new(RegexSpec {
            pattern: pattern.to_string(),
            re,
            mode,
        })))))
    }

    /// Attach a substitution (`$1`-style references) to a text-mode regex.
    pub fn regex_sub(&mut self, id: ExprId, replacement: &str) -> Result<ExprId, GrammarError> {
        self.check(id)?;
        let pattern = match &self.node(id).kind {
            NodeKind::Regex(spec) if spec.mode == RegexMode::Text => spec.pattern.clone(),
            _ => return Err(GrammarError::WrongKind(self.display_name(id), "text-mode Regex")),
        };
        let re = regex::Regex::new(&pattern).map_err(|e| GrammarError::InvalidRegex {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        self.add_action(id, crate::actions::substitute(re, replacement));
        Ok(id)
    }

    pub fn quoted_string(&mut self, quote_char: &str) -> Result<ExprId, GrammarError> {
        self.quoted_string_with(QuoteOptions::new(quote_char))
    }

    pub fn quoted_string_with(&mut self, opts: QuoteOptions) -> Result<ExprId, GrammarError> {
        let quote = opts.quote_char.trim().to_string();
        if quote.is_empty() {
            return Err(GrammarError::EmptyQuoteChar);
        }
        let end_quote = match opts.end_quote_char {
            Some(end) => {
                let end = end.trim().to_string();
                if end.is_empty() {
                    return Err(GrammarError::EmptyQuoteChar);
                }
                end
            }
            None => quote.clone(),
        };
        let esc_quote = opts.esc_quote.filter(|q| !q.is_empty());
        let pattern = quoted_string_pattern(&quote, &end_quote, opts.esc_char, esc_quote.as_deref(), opts.multiline);
        debug!(pattern = %pattern, "compiled quoted string");
        let re = meta::Regex::new(&pattern).map_err(|e| GrammarError::InvalidRegex {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        let unescape = match unescape_pattern(opts.esc_char, opts.convert_whitespace_escapes, opts.multiline) {
            Some(pattern) => Some(regex::Regex::new(&pattern).map_err(|e| GrammarError::InvalidRegex {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };
        Ok(self.push(Node::new(NodeKind::QuotedString(Box::new(QuoteSpec {
            quote,
            end_quote,
            esc_quote,
            unquote: opts.unquote_results,
            re,
            unescape,
        })))))
    }

    /// Fixed-length match tolerating up to `max_mismatches` differing characters.
    pub fn close_match(&mut self, text: &str, max_mismatches: usize, caseless: bool) -> Result<ExprId, GrammarError> {
        if text.is_empty() {
            return Err(GrammarError::EmptyLiteral);
        }
        Ok(self.push(Node::new(NodeKind::CloseMatch {
            text: text.to_string(),
            max_mismatches,
            caseless,
        })))
    }

    pub fn line_start(&mut self) -> ExprId {
        let mut node = Node::new(NodeKind::LineStart);
        node.skip_whitespace = false;
        self.push(node)
    }

    pub fn line_end(&mut self) -> ExprId {
        let mut node = Node::new(NodeKind::LineEnd);
        let mut ws = self.default_ws.clone();
        ws.remove('\n');
        node.whitespace = Some(ws);
        self.push(node)
    }

    pub fn string_start(&mut self) -> ExprId {
        self.push(Node::new(NodeKind::StringStart))
    }

    pub fn string_end(&mut self) -> ExprId {
        self.push(Node::new(NodeKind::StringEnd))
    }

    /// Position at the start of a word; `word_chars` defaults to printables.
    pub fn word_start(&mut self, word_chars: Option<&str>) -> ExprId {
        let chars = CharSet::new(word_chars.unwrap_or(PRINTABLES));
        self.push(Node::new(NodeKind::WordStart(chars)))
    }

    pub fn word_end(&mut self, word_chars: Option<&str>) -> ExprId {
        let chars = CharSet::new(word_chars.unwrap_or(PRINTABLES));
        let mut node = Node::new(NodeKind::WordEnd(chars));
        node.skip_whitespace = false;
        self.push(node)
    }

    /// Advance over whitespace to a 1-based column.
    pub fn go_to_column(&mut self, column: usize) -> ExprId {
        self.push(Node::new(NodeKind::GoToColumn(column)))
    }

    pub fn skip_to(&mut self, target: ExprId) -> ExprId {
        self.skip_to_with(target, SkipToOptions::default())
    }

    pub fn skip_to_with(&mut self, target: ExprId, opts: SkipToOptions) -> ExprId {
        let mut ignore = self.node(target).ignore_exprs.clone();
        if let Some(extra) = opts.ignore {
            let sup = self.as_suppress(extra);
            ignore.push(sup);
        }
        let node = self.enhance_node(
            NodeKind::SkipTo {
                target,
                include: opts.include,
                ignore,
                fail_on: opts.fail_on,
            },
            target,
        );
        self.push(node)
    }

    // ----- combinators ----------------------------------------------------

    /// Sequence: all children in order.
    pub fn and(&mut self, exprs: Vec<ExprId>) -> ExprId {
        let mut node = Node::new(NodeKind::And(Vec::new()));
        if let Some(&first) = exprs.first() {
            let first = self.node(first);
            if matches!(first.kind, NodeKind::White { .. }) {
                node.skip_whitespace = false;
            } else {
                node.skip_whitespace = first.skip_whitespace;
                node.whitespace = first.whitespace.clone();
            }
        }
        node.kind = NodeKind::And(exprs);
        self.push(node)
    }

    /// `a - b`: after `a` matches, a failure of `b` stops all backtracking.
    pub fn commit(&mut self, before: ExprId, after: ExprId) -> ExprId {
        let mut stop = Node::new(NodeKind::ErrorStop);
        stop.skip_whitespace = false;
        let stop = self.push(stop);
        self.and(vec![before, stop, after])
    }

    /// Ordered choice: first alternative that matches.
    pub fn match_first(&mut self, exprs: Vec<ExprId>) -> ExprId {
        let node = self.choice_node(&exprs, NodeKind::MatchFirst(exprs.clone()));
        self.push(node)
    }

    /// Longest-match choice.
    pub fn or(&mut self, exprs: Vec<ExprId>) -> ExprId {
        let node = self.choice_node(&exprs, NodeKind::Or(exprs.clone()));
        self.push(node)
    }

    /// All children, in any order, each at most once.
    pub fn each(&mut self, exprs: Vec<ExprId>) -> Result<ExprId, GrammarError> {
        for (i, a) in exprs.iter().enumerate() {
            if exprs[..i].contains(a) {
                return Err(GrammarError::InvalidEach(format!(
                    "{} appears more than once",
                    self.display_name(*a)
                )));
            }
        }
        let mut node = Node::new(NodeKind::Each(exprs));
        node.call_preparse = false;
        Ok(self.push(node))
    }

    fn choice_node(&self, exprs: &[ExprId], kind: NodeKind) -> Node {
        let mut node = Node::new(kind);
        node.call_preparse = false;
        node.skip_whitespace = exprs.iter().all(|&e| {
            let child = self.node(e);
            child.skip_whitespace && !matches!(child.kind, NodeKind::White { .. })
        });
        node
    }

    fn enhance_node(&self, kind: NodeKind, child: ExprId) -> Node {
        let child = self.node(child);
        let mut node = Node::new(kind);
        node.skip_whitespace = child.skip_whitespace;
        node.whitespace = child.whitespace.clone();
        node.call_preparse = child.call_preparse;
        node.ignore_exprs = child.ignore_exprs.clone();
        node
    }

    pub fn zero_or_more(&mut self, expr: ExprId) -> ExprId {
        self.repeat(expr, 0, None)
    }

    pub fn one_or_more(&mut self, expr: ExprId) -> ExprId {
        self.repeat(expr, 1, None)
    }

    /// Repetition that stops before `stop_on` would match.
    pub fn zero_or_more_until(&mut self, expr: ExprId, stop_on: ExprId) -> ExprId {
        self.repeat(expr, 0, Some(stop_on))
    }

    pub fn one_or_more_until(&mut self, expr: ExprId, stop_on: ExprId) -> ExprId {
        self.repeat(expr, 1, Some(stop_on))
    }

    fn repeat(&mut self, expr: ExprId, min: usize, stop_on: Option<ExprId>) -> ExprId {
        let node = self.enhance_node(NodeKind::Repeat { expr, min, stop_on }, expr);
        self.push(node)
    }

    pub fn opt(&mut self, expr: ExprId) -> ExprId {
        let node = self.enhance_node(NodeKind::Opt { expr, default: None }, expr);
        self.push(node)
    }

    /// Optional with a value returned (and named) when `expr` does not match.
    pub fn opt_default(&mut self, expr: ExprId, default: impl Into<Token>) -> ExprId {
        let node = self.enhance_node(
            NodeKind::Opt {
                expr,
                default: Some(default.into()),
            },
            expr,
        );
        self.push(node)
    }

    pub fn followed_by(&mut self, expr: ExprId) -> ExprId {
        let node = self.enhance_node(NodeKind::FollowedBy(expr), expr);
        self.push(node)
    }

    pub fn not_any(&mut self, expr: ExprId) -> ExprId {
        let mut node = self.enhance_node(NodeKind::NotAny(expr), expr);
        node.skip_whitespace = false;
        self.push(node)
    }

    /// Lookbehind; `retreat` bounds the search window for variable-length expressions.
    pub fn preceded_by(&mut self, expr: ExprId, retreat: usize) -> ExprId {
        let (retreat, exact) = match &self.node(expr).kind {
            NodeKind::Literal { text, .. } | NodeKind::Keyword { text, .. } => (text.len(), true),
            NodeKind::Word(spec) if spec.max.is_some() => (spec.max.unwrap_or(0), true),
            NodeKind::CharsNotIn { max: Some(max), .. } => (*max, true),
            kind if kind.is_position() => (0, true),
            _ => (retreat, false),
        };
        let inner = self.leave_whitespace(expr, true);
        let mut node = self.enhance_node(
            NodeKind::PrecededBy {
                expr: inner,
                retreat,
                exact,
            },
            inner,
        );
        node.skip_whitespace = false;
        self.push(node)
    }

    /// Wrap the child's tokens in one nested result.
    pub fn group(&mut self, expr: ExprId) -> ExprId {
        let node = self.enhance_node(NodeKind::Group(expr), expr);
        self.push(node)
    }

    /// Match but contribute no tokens and no names.
    pub fn suppress(&mut self, expr: ExprId) -> ExprId {
        let node = self.enhance_node(NodeKind::Suppress(expr), expr);
        self.push(node)
    }

    /// Join all tokens into one string; the subtree may not skip whitespace.
    pub fn combine(&mut self, expr: ExprId) -> ExprId {
        self.combine_with(expr, "", true)
    }

    pub fn combine_with(&mut self, expr: ExprId, join: &str, adjacent: bool) -> ExprId {
        let node = self.enhance_node(
            NodeKind::Combine {
                expr,
                join: join.to_string(),
                adjacent,
            },
            expr,
        );
        let id = self.push(node);
        if adjacent {
            self.leave_whitespace_in_place(id, true);
        }
        self.nodes[id.index()].skip_whitespace = true;
        id
    }

    /// Turn repeated `Group(key, values...)` matches into named entries.
    pub fn dict(&mut self, expr: ExprId) -> ExprId {
        let node = self.enhance_node(NodeKind::Dict(expr), expr);
        self.push(node)
    }

    /// Placeholder for a recursive rule; assign it with [`Grammar::set_forward`].
    pub fn forward(&mut self) -> ExprId {
        self.push(Node::new(NodeKind::Forward(None)))
    }

    pub fn set_forward(&mut self, fwd: ExprId, target: ExprId) -> Result<(), GrammarError> {
        self.check(fwd)?;
        self.check(target)?;
        if !matches!(self.node(fwd).kind, NodeKind::Forward(_)) {
            return Err(GrammarError::WrongKind(self.display_name(fwd), "Forward"));
        }
        let source = self.node(target).clone();
        let node = self.node_mut(fwd);
        node.kind = NodeKind::Forward(Some(target));
        node.skip_whitespace = source.skip_whitespace;
        node.whitespace = source.whitespace;
        node.call_preparse = source.call_preparse;
        for ig in source.ignore_exprs {
            if !node.ignore_exprs.contains(&ig) {
                node.ignore_exprs.push(ig);
            }
        }
        Ok(())
    }

    // ----- copies and per-node settings -----------------------------------

    /// Independent copy; sequences and choices copy their children too.
    pub fn copy(&mut self, id: ExprId) -> ExprId {
        let mut node = self.node(id).clone();
        if let NodeKind::Forward(None) = node.kind {
            // a later set_forward on the original must reach the copy
            node.kind = NodeKind::Forward(Some(id));
        } else if node.kind.is_expression() {
            let copies: Vec<ExprId> = node.kind.children().into_iter().map(|c| self.copy(c)).collect();
            if let Some(slot) = node.kind.children_mut() {
                *slot = copies;
            }
        }
        self.push(node)
    }

    /// Copy of `id` bound to a results name. A trailing `*` keeps all matches.
    pub fn named(&mut self, id: ExprId, name: &str) -> ExprId {
        match name.strip_suffix('*') {
            Some(base) => self.named_with(id, base, true),
            None => self.named_with(id, name, false),
        }
    }

    /// Copy of `id` whose results name accumulates every match.
    pub fn named_all(&mut self, id: ExprId, name: &str) -> ExprId {
        self.named_with(id, name, true)
    }

    fn named_with(&mut self, id: ExprId, name: &str, list_all: bool) -> ExprId {
        let copy = self.copy(id);
        let node = self.node_mut(copy);
        node.results_name = (!name.is_empty()).then(|| name.to_string());
        node.list_all = list_all;
        copy
    }

    /// Display name used in error messages.
    pub fn set_name(&mut self, id: ExprId, name: &str) -> ExprId {
        self.node_mut(id).custom_name = Some(name.to_string());
        id
    }

    pub fn results_name(&self, id: ExprId) -> Option<&str> {
        self.node(id).results_name.as_deref()
    }

    pub fn add_action(&mut self, id: ExprId, action: ParseAction) -> ExprId {
        self.node_mut(id).hooks.push(Hook::Action(action));
        id
    }

    /// Replace every action and condition with `action`.
    pub fn set_action(&mut self, id: ExprId, action: ParseAction) -> ExprId {
        let node = self.node_mut(id);
        node.hooks.clear();
        node.hooks.push(Hook::Action(action));
        id
    }

    pub fn add_condition(&mut self, id: ExprId, condition: Condition) -> ExprId {
        self.node_mut(id).hooks.push(Hook::Condition(condition));
        id
    }

    /// Run actions during lookahead and trial parses as well.
    pub fn set_call_during_try(&mut self, id: ExprId, on: bool) -> ExprId {
        self.node_mut(id).call_during_try = on;
        id
    }

    pub fn set_debug(&mut self, id: ExprId, on: bool) -> ExprId {
        self.node_mut(id).debug = on;
        id
    }

    /// Parse input with tabs as-is when `id` is the root.
    pub fn parse_with_tabs(&mut self, id: ExprId) -> ExprId {
        self.node_mut(id).keep_tabs = true;
        id
    }

    pub fn set_whitespace_chars(&mut self, id: ExprId, chars: &str) -> ExprId {
        let node = self.node_mut(id);
        node.skip_whitespace = true;
        node.whitespace = Some(CharSet::new(chars));
        id
    }

    /// Copy of `id` that does not skip leading whitespace; with `recursive`
    /// the copy's subtree (down to `Forward` nodes) is copied and changed too.
    pub fn leave_whitespace(&mut self, id: ExprId, recursive: bool) -> ExprId {
        let copy = self.copy(id);
        self.leave_whitespace_in_place(copy, recursive);
        copy
    }

    fn leave_whitespace_in_place(&mut self, id: ExprId, recursive: bool) {
        self.node_mut(id).skip_whitespace = false;
        if !recursive {
            return;
        }
        let kind = self.node(id).kind.clone();
        if kind.is_expression() {
            let copies: Vec<ExprId> = kind
                .children()
                .into_iter()
                .map(|c| {
                    let copy = self.copy(c);
                    self.leave_whitespace_in_place(copy, true);
                    copy
                })
                .collect();
            if let Some(slot) = self.node_mut(id).kind.children_mut() {
                *slot = copies;
            }
        } else if let Some(child) = kind.children().first().copied() {
            if matches!(kind, NodeKind::Forward(_)) {
                return;
            }
            let copy = self.copy(child);
            self.leave_whitespace_in_place(copy, true);
            if let Some(slot) = self.node_mut(id).kind.child_slot() {
                *slot = copy;
            }
        }
    }

    fn as_suppress(&mut self, id: ExprId) -> ExprId {
        if matches!(self.node(id).kind, NodeKind::Suppress(_)) {
            id
        } else {
            let copy = self.copy(id);
            self.suppress(copy)
        }
    }

    /// Skip `other` (e.g. comments) before every match attempt in `id`'s subtree.
    pub fn ignore(&mut self, id: ExprId, other: ExprId) -> ExprId {
        let sup = self.as_suppress(other);
        self.propagate_ignore(id, sup);
        id
    }

    fn propagate_ignore(&mut self, id: ExprId, sup: ExprId) {
        if self.node(id).ignore_exprs.contains(&sup) {
            return;
        }
        let node = self.node_mut(id);
        node.ignore_exprs.push(sup);
        if let NodeKind::SkipTo { ignore, .. } = &mut node.kind {
            ignore.push(sup);
            return;
        }
        let kind = self.node(id).kind.clone();
        match kind {
            NodeKind::Combine { adjacent: true, .. } => {}
            kind => {
                for child in kind.children() {
                    self.propagate_ignore(child, sup);
                }
            }
        }
    }

    // ----- preparation ----------------------------------------------------

    pub(crate) fn prepared(&self) -> &Prepared {
        self.prepared.get_or_init(|| self.build_plan())
    }

    fn collapsible(&self, parent: &NodeKind, child: ExprId) -> bool {
        let node = self.node(child);
        if !parent.same_expression_kind(&node.kind) {
            return false;
        }
        if !node.hooks.is_empty() || node.results_name.is_some() || node.debug {
            return false;
        }
        match &node.kind {
            NodeKind::And(c) => !c.iter().any(|&e| matches!(self.node(e).kind, NodeKind::ErrorStop)),
            _ => true,
        }
    }

    /// Children of a sequence or choice after collapsing nested same-kind nodes.
    pub(crate) fn flat_children(&self, id: ExprId) -> Vec<ExprId> {
        let kind = &self.node(id).kind;
        let mut exprs = kind.children();
        if !kind.is_expression() || exprs.len() != 2 {
            return exprs;
        }
        if self.collapsible(kind, exprs[0]) {
            let mut merged = self.flat_children(exprs[0]);
            merged.push(exprs[1]);
            exprs = merged;
        }
        if let Some(&last) = exprs.last() {
            if self.collapsible(kind, last) {
                exprs.pop();
                exprs.extend(self.flat_children(last));
            }
        }
        exprs
    }

    fn build_plan(&self) -> Prepared {
        let n = self.nodes.len();
        let flat: Vec<Vec<ExprId>> = (0..n)
            .map(|i| {
                let id = ExprId(i as u32);
                if self.node(id).kind.is_expression() {
                    self.flat_children(id)
                } else {
                    Vec::new()
                }
            })
            .collect();

        let mut may_empty = vec![false; n];
        let mut save_list = vec![false; n];
        loop {
            let mut changed = false;
            for i in 0..n {
                let node = &self.nodes[i];
                let empty = self.derive_may_empty(&node.kind, &flat[i], &may_empty);
                let list = self.derive_save_list(&node.kind, &flat[i], &save_list);
                if empty != may_empty[i] || list != save_list[i] {
                    may_empty[i] = empty;
                    save_list[i] = list;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut each = HashMap::new();
        for i in 0..n {
            if let NodeKind::Each(_) = self.nodes[i].kind {
                each.insert(ExprId(i as u32), self.each_plan(&flat[i], &may_empty));
            }
        }
        debug!(nodes = n, each_nodes = each.len(), "grammar prepared");
        Prepared {
            flat,
            may_empty,
            save_list,
            each,
        }
    }

    fn derive_may_empty(&self, kind: &NodeKind, flat: &[ExprId], known: &[bool]) -> bool {
        let of = |e: &ExprId| known[e.index()];
        match kind {
            NodeKind::Empty | NodeKind::NoMatch | NodeKind::ErrorStop => true,
            NodeKind::Regex(spec) => spec.re.is_match(""),
            NodeKind::SkipTo { .. } => true,
            k if k.is_position() => true,
            NodeKind::And(_) | NodeKind::Each(_) => flat.iter().all(of),
            NodeKind::MatchFirst(_) | NodeKind::Or(_) => flat.is_empty() || flat.iter().any(of),
            NodeKind::Repeat { min: 0, .. } | NodeKind::Opt { .. } => true,
            NodeKind::FollowedBy(_) | NodeKind::NotAny(_) | NodeKind::PrecededBy { .. } => true,
            NodeKind::Repeat { expr, .. }
            | NodeKind::Group(expr)
            | NodeKind::Suppress(expr)
            | NodeKind::Combine { expr, .. }
            | NodeKind::Dict(expr) => of(expr),
            NodeKind::Forward(target) => target.as_ref().map(of).unwrap_or(false),
            _ => false,
        }
    }

    fn derive_save_list(&self, kind: &NodeKind, flat: &[ExprId], known: &[bool]) -> bool {
        let of = |e: &ExprId| known[e.index()];
        match kind {
            NodeKind::And(_)
            | NodeKind::Each(_)
            | NodeKind::Group(_)
            | NodeKind::Dict(_)
            | NodeKind::Repeat { .. } => true,
            NodeKind::MatchFirst(_) | NodeKind::Or(_) => flat.iter().any(of),
            NodeKind::Opt { expr, .. }
            | NodeKind::FollowedBy(expr)
            | NodeKind::NotAny(expr)
            | NodeKind::PrecededBy { expr, .. }
            | NodeKind::Suppress(expr)
            | NodeKind::Combine { expr, .. } => of(expr),
            NodeKind::Forward(target) => target.as_ref().map(of).unwrap_or(false),
            _ => false,
        }
    }

    fn each_plan(&self, children: &[ExprId], may_empty: &[bool]) -> EachPlan {
        let mut plan = EachPlan::default();
        let mut implicit_optionals = Vec::new();
        let mut repeated_required = Vec::new();
        for &child in children {
            let node = self.node(child);
            let plain = EachEntry {
                probe: child,
                reparse: child,
                rename: None,
            };
            match &node.kind {
                NodeKind::Opt { expr, .. } => {
                    plan.optionals.push(EachEntry {
                        probe: *expr,
                        reparse: child,
                        rename: None,
                    });
                }
                NodeKind::Repeat { expr, min, .. } => {
                    let entry = EachEntry {
                        probe: *expr,
                        reparse: *expr,
                        rename: node.results_name.clone(),
                    };
                    if *min > 0 {
                        repeated_required.push(entry.clone());
                        if may_empty[child.index()] {
                            implicit_optionals.push(plain);
                        }
                    }
                    plan.multis.push(entry);
                }
                kind => {
                    if may_empty[child.index()] && !matches!(kind, NodeKind::Regex(_)) {
                        implicit_optionals.push(plain.clone());
                    }
                    plan.required.push(plain);
                }
            }
        }
        plan.optionals.extend(implicit_optionals);
        plan.required.extend(repeated_required);
        plan
    }

    // ----- inspection -----------------------------------------------------

    /// Name used for `id` in messages: the custom name or a generated one.
    pub fn display_name(&self, id: ExprId) -> String {
        if id.index() >= self.nodes.len() {
            return format!("<unknown expr {}>", id.0);
        }
        let mut active = Vec::new();
        self.name_of(id, &mut active)
    }

    fn name_of(&self, id: ExprId, active: &mut Vec<ExprId>) -> String {
        let node = self.node(id);
        if let Some(name) = &node.custom_name {
            return name.clone();
        }
        if active.contains(&id) {
            return "...".to_string();
        }
        active.push(id);
        let name = self.default_name(id, active);
        active.pop();
        name
    }

    fn join_names(&self, id: ExprId, sep: &str, active: &mut Vec<ExprId>) -> String {
        let names: Vec<String> = self
            .flat_children(id)
            .into_iter()
            .map(|c| self.name_of(c, active))
            .collect();
        format!("{{{}}}", names.join(sep))
    }

    fn default_name(&self, id: ExprId, active: &mut Vec<ExprId>) -> String {
        match &self.node(id).kind {
            NodeKind::Empty => "Empty".to_string(),
            NodeKind::NoMatch => "NoMatch".to_string(),
            NodeKind::ErrorStop => "-".to_string(),
            NodeKind::Literal { text, .. } | NodeKind::Keyword { text, .. } => quoted(text),
            NodeKind::Word(spec) => word_name(spec),
            NodeKind::CharsNotIn { not_chars, .. } => format!("!W:({})", not_chars.to_display()),
            NodeKind::White { chars, .. } => chars.chars().map(white_name).collect(),
            NodeKind::Regex(spec) => format!("Re:({})", quoted(&spec.pattern).replace("\\\\", "\\")),
            NodeKind::QuotedString(spec) => {
                if spec.quote == spec.end_quote {
                    format!("string enclosed in {}", quoted(&spec.quote))
                } else {
                    format!(
                        "quoted string, starting with {} ending with {}",
                        spec.quote, spec.end_quote
                    )
                }
            }
            NodeKind::CloseMatch { text, .. } => format!("CloseMatch:{}", quoted(text)),
            NodeKind::LineStart => "start of line".to_string(),
            NodeKind::LineEnd => "end of line".to_string(),
            NodeKind::StringStart => "start of text".to_string(),
            NodeKind::StringEnd => "end of text".to_string(),
            NodeKind::WordStart(_) => "WordStart".to_string(),
            NodeKind::WordEnd(_) => "WordEnd".to_string(),
            NodeKind::GoToColumn(col) => format!("GoToColumn({})", col),
            NodeKind::And(_) => self.join_names(id, " ", active),
            NodeKind::MatchFirst(_) => self.join_names(id, " | ", active),
            NodeKind::Or(_) => self.join_names(id, " ^ ", active),
            NodeKind::Each(_) => self.join_names(id, " & ", active),
            NodeKind::Opt { expr, .. } => {
                let mut inner = self.name_of(*expr, active);
                while inner.len() > 1 && inner.starts_with('{') && inner.ends_with('}') {
                    inner = inner[1..inner.len() - 1].to_string();
                }
                format!("[{}]", inner)
            }
            NodeKind::Repeat { expr, min: 0, .. } => format!("[{}]...", self.name_of(*expr, active)),
            NodeKind::Repeat { expr, .. } => format!("{{{}}}...", self.name_of(*expr, active)),
            NodeKind::NotAny(expr) => format!("~{{{}}}", self.name_of(*expr, active)),
            NodeKind::Forward(None) => "Forward: None".to_string(),
            NodeKind::Forward(Some(target)) => {
                let mut inner = self.name_of(*target, active);
                if inner.len() > 1000 {
                    let cut = crate::util::floor_char_boundary(&inner, 1000);
                    inner.truncate(cut);
                }
                format!("Forward: {}", inner)
            }
            kind => {
                let child = kind.children().first().copied();
                let inner = child.map(|c| self.name_of(c, active)).unwrap_or_default();
                format!("{}:({})", kind.label(), inner)
            }
        }
    }

    /// Check for unassigned `Forward` nodes and, unless bounded left recursion
    /// is enabled, left-recursive rules reachable from `root`.
    pub fn validate(&self, root: ExprId) -> Result<(), GrammarError> {
        self.check(root)?;
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            let node = self.node(id);
            if let NodeKind::Forward(None) = node.kind {
                return Err(GrammarError::UnassignedForward(self.display_name(id)));
            }
            stack.extend(node.kind.children());
            stack.extend(node.ignore_exprs.iter().copied());
            if let NodeKind::Repeat { stop_on: Some(s), .. } = node.kind {
                stack.push(s);
            }
        }
        if self.config.left_recursion.is_none() {
            let plan = self.prepared();
            for (i, reached) in seen.iter().enumerate() {
                let id = ExprId(i as u32);
                if *reached && self.left_reaches(id, id, plan) {
                    return Err(GrammarError::LeftRecursion(self.display_name(id)));
                }
            }
        }
        Ok(())
    }

    /// Whether `start` can reach `goal` without consuming input.
    fn left_reaches(&self, start: ExprId, goal: ExprId, plan: &Prepared) -> bool {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = self.leftmost(start, plan);
        while let Some(id) = stack.pop() {
            if id == goal {
                return true;
            }
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            stack.extend(self.leftmost(id, plan));
        }
        false
    }

    fn leftmost(&self, id: ExprId, plan: &Prepared) -> Vec<ExprId> {
        match &self.node(id).kind {
            NodeKind::And(_) => {
                let mut out = Vec::new();
                for &c in &plan.flat[id.index()] {
                    out.push(c);
                    if !plan.may_empty[c.index()] {
                        break;
                    }
                }
                out
            }
            NodeKind::MatchFirst(_) | NodeKind::Or(_) | NodeKind::Each(_) => plan.flat[id.index()].clone(),
            NodeKind::SkipTo { .. } | NodeKind::PrecededBy { .. } => Vec::new(),
            kind => kind.children(),
        }
    }
}

/// `quote (esc_quote | esc . | body-char)* end_quote`
///
/// Alternation order makes an escaped quote win over closing the string,
/// with backtracking to the earlier close when the string never ends.
/// Multi-character end quotes are matched lazily, closing at the first
/// reachable occurrence.
fn quoted_string_pattern(
    quote: &str,
    end_quote: &str,
    esc_char: Option<char>,
    esc_quote: Option<&str>,
    multiline: bool,
) -> String {
    let mut inner = Vec::new();
    if let Some(esc_quote) = esc_quote {
        inner.push(format!("(?:{})", regex::escape(esc_quote)));
    }
    if let Some(esc) = esc_char {
        inner.push(format!("(?:{}.)", regex::escape(&esc.to_string())));
    }
    let mut excluded = String::new();
    let multi_end = end_quote.chars().nth(1).is_some();
    if let Some(first) = end_quote.chars().next().filter(|_| !multi_end) {
        excluded.push_str(&escape_range_char(first));
    }
    if !multiline {
        excluded.push_str("\\n\\r");
    }
    if let Some(esc) = esc_char {
        excluded.push_str(&escape_range_char(esc));
    }
    if excluded.is_empty() {
        inner.push("(?:.)".to_string());
    } else {
        inner.push(format!("(?:[^{}])", excluded));
    }
    format!(
        "{}{}(?:{})*{}{}",
        if multiline { "(?s)" } else { "" },
        regex::escape(quote),
        inner.join("|"),
        if multi_end { "?" } else { "" },
        regex::escape(end_quote),
    )
}

/// Tokenizer for unquoting: `\t`-style escapes, then `esc` + char, then any char.
fn unescape_pattern(esc_char: Option<char>, convert_ws: bool, multiline: bool) -> Option<String> {
    if esc_char.is_none() && !convert_ws {
        return None;
    }
    let mut alts = Vec::new();
    if convert_ws {
        alts.push(r"(?P<ws>\\[tnfr])".to_string());
    }
    if let Some(esc) = esc_char {
        alts.push(format!("(?P<esc>{}.)", regex::escape(&esc.to_string())));
    }
    alts.push(r"(?s:.)".to_string());
    Some(format!("{}{}", if multiline { "(?s)" } else { "" }, alts.join("|")))
}

fn word_name(spec: &WordSpec) -> String {
    let base = if spec.init != spec.body {
        format!("W:({}, {})", spec.init.to_display(), spec.body.to_display())
    } else {
        format!("W:({})", spec.init.to_display())
    };
    match (spec.min, spec.max) {
        (1, None) => base,
        (min, Some(max)) if min == max => {
            if min == 1 {
                base[2..].to_string()
            } else {
                format!("{}{{{}}}", base, min)
            }
        }
        (min, None) => format!("{}{{{},...}}", base, min),
        (min, Some(max)) => format!("{}{{{},{}}}", base, min, max),
    }
}

fn white_name(c: char) -> &'static str {
    match c {
        ' ' => "<SP>",
        '\t' => "<TAB>",
        '\n' => "<LF>",
        '\r' => "<CR>",
        '\u{c}' => "<FF>",
        '\u{b}' => "<VT>",
        '\u{a0}' => "<NBSP>",
        _ => "<WS>",
    }
}
