//! Parse actions and conditions
//!
//! Actions run after a matcher succeeds, in registration order. Each receives
//! the match context and the results built so far; it may edit the results in
//! place, return a [`Replacement`] that is used for the remaining actions and
//! the final return value, or fail with an [`ActionError`].
//!
//! Conditions are boolean predicates registered in the same ordered list; a
//! false condition fails the match (backtrackable unless marked fatal).

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::results::{ParseResults, Token};

/// Where the match that triggered an action took place.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub input: &'a str,
    /// Offset after leading whitespace was skipped
    pub start: usize,
    pub end: usize,
}

impl<'a> ActionContext<'a> {
    /// The matched text.
    pub fn matched(&self) -> &'a str {
        self.input.get(self.start..self.end).unwrap_or("")
    }
}

/// Value returned by an action to replace the results.
#[derive(Debug, Clone, PartialEq)]
pub enum Replacement {
    Results(ParseResults),
    Token(Token),
}

impl From<ParseResults> for Replacement {
    fn from(r: ParseResults) -> Self {
        Replacement::Results(r)
    }
}

impl From<Token> for Replacement {
    fn from(t: Token) -> Self {
        Replacement::Token(t)
    }
}

/// Failure raised from inside an action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ActionError {
    pub message: String,
    /// Stop all backtracking instead of letting alternatives be tried
    pub fatal: bool,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

pub type ActionResult = Result<Option<Replacement>, ActionError>;

type ActionFn = dyn Fn(&ActionContext<'_>, &mut ParseResults) -> ActionResult + Send + Sync;
type PredicateFn = dyn Fn(&ActionContext<'_>, &ParseResults) -> bool + Send + Sync;

/// A transform attached to a matcher.
#[derive(Clone)]
pub struct ParseAction {
    f: Arc<ActionFn>,
}

impl ParseAction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ActionContext<'_>, &mut ParseResults) -> ActionResult + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Action that edits the results in place.
    pub fn inspect<F>(f: F) -> Self
    where
        F: Fn(&mut ParseResults) + Send + Sync + 'static,
    {
        Self::new(move |_, toks| {
            f(toks);
            Ok(None)
        })
    }

    /// Action that always replaces the results.
    pub fn map<F, R>(f: F) -> Self
    where
        F: Fn(&ParseResults) -> R + Send + Sync + 'static,
        R: Into<Replacement>,
    {
        Self::new(move |_, toks| Ok(Some(f(toks).into())))
    }

    pub(crate) fn call(&self, ctx: &ActionContext<'_>, toks: &mut ParseResults) -> ActionResult {
        (self.f)(ctx, toks)
    }
}

impl fmt::Debug for ParseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParseAction")
    }
}

/// A validation predicate attached to a matcher.
#[derive(Clone)]
pub struct Condition {
    pred: Arc<PredicateFn>,
    message: Option<String>,
    fatal: bool,
}

impl Condition {
    pub fn new<F>(pred: F) -> Self
    where
        F: Fn(&ActionContext<'_>, &ParseResults) -> bool + Send + Sync + 'static,
    {
        Self {
            pred: Arc::new(pred),
            message: None,
            fatal: false,
        }
    }

    /// Condition over the tokens only.
    pub fn on_tokens<F>(pred: F) -> Self
    where
        F: Fn(&ParseResults) -> bool + Send + Sync + 'static,
    {
        Self::new(move |_, toks| pred(toks))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub(crate) fn check(&self, ctx: &ActionContext<'_>, toks: &ParseResults) -> Result<(), ActionError> {
        if (self.pred)(ctx, toks) {
            return Ok(());
        }
        let message = self
            .message
            .clone()
            .unwrap_or_else(|| "failed user-defined condition".to_string());
        Err(ActionError {
            message,
            fatal: self.fatal,
        })
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("message", &self.message)
            .field("fatal", &self.fatal)
            .finish()
    }
}

/// Entry in a matcher's ordered post-match pipeline.
#[derive(Debug, Clone)]
pub(crate) enum Hook {
    Action(ParseAction),
    Condition(Condition),
}

// ----- stock actions --------------------------------------------------------

/// Replace the matched tokens with a constant.
pub fn replace_with(value: impl Into<Token>) -> ParseAction {
    let value = value.into();
    ParseAction::map(move |_| ParseResults::single(value.clone()))
}

/// Strip the first and last character of the first token.
pub fn remove_quotes() -> ParseAction {
    ParseAction::new(|_, toks| {
        let Some(text) = toks.first_str() else {
            return Ok(None);
        };
        let mut chars = text.chars();
        chars.next();
        chars.next_back();
        Ok(Some(Replacement::Token(Token::Str(chars.as_str().to_string()))))
    })
}

/// Apply `f` to every token.
pub fn token_map<F>(f: F) -> ParseAction
where
    F: Fn(&Token) -> Result<Token, ActionError> + Send + Sync + 'static,
{
    ParseAction::new(move |_, toks| {
        let mapped = toks.iter().map(&f).collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Replacement::Results(ParseResults::from_tokens(mapped))))
    })
}

fn map_strings(f: fn(&str) -> String) -> ParseAction {
    token_map(move |tok| {
        Ok(match tok.as_str() {
            Some(s) => Token::Str(f(s)),
            None => tok.clone(),
        })
    })
}

pub fn upcase_tokens() -> ParseAction {
    map_strings(str::to_uppercase)
}

pub fn downcase_tokens() -> ParseAction {
    map_strings(str::to_lowercase)
}

/// Convert every string token to `Token::Int`.
pub fn convert_to_integer() -> ParseAction {
    token_map(|tok| match tok {
        Token::Int(_) => Ok(tok.clone()),
        other => {
            let text = other.to_string();
            text.trim()
                .parse::<i64>()
                .map(Token::Int)
                .map_err(|e| ActionError::new(format!("invalid integer {:?}: {}", text, e)))
        }
    })
}

/// Convert every string token to `Token::Float`.
pub fn convert_to_float() -> ParseAction {
    token_map(|tok| match tok {
        Token::Float(_) => Ok(tok.clone()),
        other => {
            let text = other.to_string();
            text.trim()
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|e| ActionError::new(format!("invalid number {:?}: {}", text, e)))
        }
    })
}

/// Rewrite the first token with a regex substitution (`$1` style groups).
pub fn substitute(pattern: Regex, replacement: impl Into<String>) -> ParseAction {
    let replacement = replacement.into();
    ParseAction::new(move |_, toks| {
        let Some(text) = toks.first_str() else {
            return Ok(None);
        };
        let replaced = pattern.replace_all(text, replacement.as_str()).into_owned();
        Ok(Some(Replacement::Token(Token::Str(replaced))))
    })
}
