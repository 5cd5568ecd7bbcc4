//! # parsley
//!
//! Recursive-descent parsing combinators in the style of PEG grammars.
//!
//! Grammars are built in a [`Grammar`] arena: every builder call returns an
//! [`ExprId`] handle that later combinators refer to, and recursive rules are
//! tied together through [`Grammar::forward`] / [`Grammar::set_forward`].
//! Matching produces [`ParseResults`], a token list that also carries named
//! captures.
//!
//! ## Layout
//!
//! - [`grammar`]: node arena, builder API, streamlining and validation
//! - `engine`, `primitives`, `combinators`: the matching engine
//! - `cache`: packrat cache and the bounded left-recursion memo
//! - [`scan`]: `parse_string`, `scan_string`, `search_string`,
//!   `transform_string` and `split`
//! - [`results`], [`actions`], [`error`], [`config`]: supporting types
//! - [`helpers`]: stock fragments (`one_of`, `delimited_list`, comments, ...)
//!
//! Each parse runs in its own session, so a finished [`Grammar`] can be
//! shared between threads.

pub mod actions;
mod cache;
pub mod chars;
mod combinators;
pub mod config;
mod engine;
pub mod error;
pub mod grammar;
pub mod helpers;
mod primitives;
pub mod results;
pub mod scan;
pub mod util;

pub use actions::{ActionContext, ActionError, Condition, ParseAction, Replacement};
pub use cache::CacheStats;
pub use config::{CacheLimit, EngineConfig};
pub use error::{FailureKind, GrammarError, ParseError};
pub use grammar::{ExprId, Grammar, QuoteOptions, RegexMode, SkipToOptions, WordOptions};
pub use helpers::DelimitedListOptions;
pub use results::{ParseResults, RegexMatch, Token};
pub use scan::{ScanIter, SplitIter};
