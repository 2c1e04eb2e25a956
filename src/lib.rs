//! An incremental, error-recovering GLR parsing runtime.
//!
//! The engine accepts a compiled parse table (a [`Language`]), a source text,
//! and optionally the tree produced by a previous parse, and builds a concrete
//! syntax tree that covers the input exactly even when the input is malformed.
//! Reparsing after an edit reuses unchanged subtrees, so the cost of a reparse
//! is proportional to the size of the edit rather than the size of the file.
//!
//! Ambiguity is handled with a graph-structured stack: several parse branches
//! ("versions") advance in lock step, merge when they converge, and are pruned
//! by an error-cost comparison with dynamic-precedence tie-breaks.

// Tier 0 — pure leaf utilities
pub mod error_costs;
mod length;
mod point;
mod ranges;
mod unicode;

// Tier 1 — the parse-table contract and the lexer it drives
mod language;
mod lexer;

// Tier 2 — the core data structure
mod subtree;

// Tier 3 — parse-time machinery
mod reduce_action;
mod reusable_node;
mod stack;

// Tier 4 — the engine
mod parser;
mod tree;

pub use language::{
    ExternalScanner, ExternalScannerDef, Language, LanguageBuilder, LanguageError, LexerMode,
    ParseAction, ScannerError, StateId, Symbol, SymbolMetadata, EOF_SYMBOL, ERROR_REPEAT_SYMBOL,
    ERROR_SYMBOL, LANGUAGE_VERSION, LEX_STATE_NONE, MIN_COMPATIBLE_LANGUAGE_VERSION,
};
pub use length::Length;
pub use lexer::{IncludedRangesError, InputEncoding, LexerRef, LogType, Logger, TextInput};
pub use parser::{ParseError, ParseOptions, ParseState, Parser};
pub use point::{InputEdit, Point};
pub use ranges::Range;
pub use subtree::Subtree;
pub use tree::Tree;
