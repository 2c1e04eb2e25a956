//! The finished product of a parse: a root subtree, the language that built
//! it, and the included ranges that were in effect.

use crate::language::Language;
use crate::point::InputEdit;
use crate::ranges::{edit_range, Range};
use crate::subtree::{self, Subtree};

pub struct Tree {
    root: Subtree,
    language: Language,
    included_ranges: Vec<Range>,
}

impl Tree {
    pub(crate) fn new(root: Subtree, language: Language, included_ranges: Vec<Range>) -> Self {
        Tree {
            root,
            language,
            included_ranges,
        }
    }

    pub fn root(&self) -> &Subtree {
        &self.root
    }

    pub(crate) fn root_subtree(&self) -> Subtree {
        self.root.clone()
    }

    pub fn language(&self) -> &Language {
        &self.language
    }

    pub fn included_ranges(&self) -> &[Range] {
        &self.included_ranges
    }

    /// Adjust the tree for a change to its source text. Call once per edit
    /// before passing the tree back to [`crate::Parser::parse`]; reuse relies
    /// on the `has_changes` marks this leaves behind.
    pub fn edit(&mut self, edit: &InputEdit) {
        for range in &mut self.included_ranges {
            edit_range(range, edit);
        }
        subtree::edit(&mut self.root, edit);
    }

    /// Render the tree's visible structure as an s-expression.
    pub fn to_sexp(&self) -> String {
        self.root.to_sexp(&self.language)
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tree({})", self.to_sexp())
    }
}
