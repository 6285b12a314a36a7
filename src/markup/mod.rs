//! Markup parsing: html5ever token events, a recovering tree builder and
//! structural queries.

mod node;
mod parser;
mod query;
mod tokenizer;

pub use node::{Element, MarkupNode, NodeKind};
pub use parser::MarkupParser;
pub use query::{find_captures, find_element, find_nodes, MatchCriterion};
pub use tokenizer::{tokenize, MarkupEvent};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarkupError {
    #[error("unbalanced tree: {0}")]
    UnbalancedTree(String),

    #[error("expected exactly 1 match, found {count}")]
    AmbiguousMatch { count: usize },

    #[error("attribute '{name}' appears more than once on <{tag}>")]
    DuplicateAttribute { tag: String, name: String },

    #[error("parser is already closed")]
    AlreadyClosed,
}

pub type MarkupResult<T> = Result<T, MarkupError>;
