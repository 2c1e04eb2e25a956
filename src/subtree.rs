//! The refcounted, immutable syntax-tree node and its factory.
//!
//! A [`Subtree`] is a cheap-to-clone shared handle. Nodes are immutable once
//! built; copy-on-write mutation is available only through an exclusive
//! handle, which exists exactly when the reference count is one. The
//! [`SubtreePool`] is the sole constructor of nodes: leaves from the lexer,
//! error leaves for unrecognized bytes, missing leaves inserted by recovery,
//! interior nodes from reductions, and error nodes wrapping skipped content.

use std::fmt;
use std::fmt::Write as _;
use std::rc::Rc;

use crate::error_costs::{
    ERROR_COST_PER_MISSING_TREE, ERROR_COST_PER_RECOVERY, ERROR_COST_PER_SKIPPED_CHAR,
    ERROR_COST_PER_SKIPPED_LINE, ERROR_COST_PER_SKIPPED_TREE,
};
use crate::language::{Language, StateId, Symbol, EOF_SYMBOL, ERROR_REPEAT_SYMBOL, ERROR_SYMBOL};
use crate::length::Length;
use crate::point::InputEdit;

/// Parse state recorded on fragile nodes and nodes produced during
/// ambiguity; such nodes are never reused incrementally.
pub(crate) const TREE_STATE_NONE: StateId = u16::MAX;

#[derive(Clone)]
pub(crate) struct InteriorData {
    pub(crate) children: Vec<Subtree>,
    pub(crate) visible_child_count: u32,
    pub(crate) named_child_count: u32,
    pub(crate) visible_descendant_count: u32,
    pub(crate) dynamic_precedence: i32,
    pub(crate) repeat_depth: u16,
    pub(crate) production_id: u16,
    pub(crate) first_leaf_symbol: Symbol,
    pub(crate) first_leaf_parse_state: StateId,
}

#[derive(Clone)]
pub(crate) enum SubtreeBody {
    Leaf {
        /// The character that triggered an error leaf; zero otherwise.
        lookahead_char: i32,
        /// Serialized external-scanner state captured after this token.
        external_state: Option<Rc<[u8]>>,
    },
    Interior(InteriorData),
}

#[derive(Clone)]
pub(crate) struct SubtreeData {
    pub(crate) symbol: Symbol,
    pub(crate) parse_state: StateId,
    pub(crate) padding: Length,
    pub(crate) size: Length,
    pub(crate) lookahead_bytes: u32,
    pub(crate) error_cost: u32,
    pub(crate) visible: bool,
    pub(crate) named: bool,
    pub(crate) extra: bool,
    pub(crate) fragile_left: bool,
    pub(crate) fragile_right: bool,
    pub(crate) has_changes: bool,
    pub(crate) has_external_tokens: bool,
    pub(crate) has_external_scanner_state_change: bool,
    pub(crate) is_missing: bool,
    pub(crate) is_keyword: bool,
    pub(crate) body: SubtreeBody,
}

// Trees can be deep; stealing the children of uniquely-owned descendants
// keeps destruction iterative.
impl Drop for SubtreeData {
    fn drop(&mut self) {
        let SubtreeBody::Interior(interior) = &mut self.body else {
            return;
        };
        let mut pending = std::mem::take(&mut interior.children);
        while let Some(mut tree) = pending.pop() {
            if let Some(data) = Rc::get_mut(&mut tree.data) {
                if let SubtreeBody::Interior(interior) = &mut data.body {
                    pending.append(&mut interior.children);
                }
            }
        }
    }
}

/// A shared handle to an immutable syntax-tree node.
#[derive(Clone)]
pub struct Subtree {
    pub(crate) data: Rc<SubtreeData>,
}

impl Subtree {
    pub fn symbol(&self) -> Symbol {
        self.data.symbol
    }

    pub fn padding(&self) -> Length {
        self.data.padding
    }

    pub fn size(&self) -> Length {
        self.data.size
    }

    pub fn total_size(&self) -> Length {
        self.data.padding + self.data.size
    }

    pub fn total_bytes(&self) -> u32 {
        self.total_size().bytes
    }

    pub fn lookahead_bytes(&self) -> u32 {
        self.data.lookahead_bytes
    }

    pub fn error_cost(&self) -> u32 {
        self.data.error_cost
    }

    pub fn parse_state(&self) -> StateId {
        self.data.parse_state
    }

    pub fn children(&self) -> &[Subtree] {
        match &self.data.body {
            SubtreeBody::Leaf { .. } => &[],
            SubtreeBody::Interior(interior) => &interior.children,
        }
    }

    pub fn child_count(&self) -> usize {
        self.children().len()
    }

    pub fn visible(&self) -> bool {
        self.data.visible
    }

    pub fn named(&self) -> bool {
        self.data.named
    }

    pub fn extra(&self) -> bool {
        self.data.extra
    }

    pub fn has_changes(&self) -> bool {
        self.data.has_changes
    }

    pub fn is_missing(&self) -> bool {
        self.data.is_missing
    }

    pub fn is_keyword(&self) -> bool {
        self.data.is_keyword
    }

    pub fn is_error(&self) -> bool {
        self.data.symbol == ERROR_SYMBOL
    }

    pub fn is_eof(&self) -> bool {
        self.data.symbol == EOF_SYMBOL
    }

    pub fn is_fragile(&self) -> bool {
        self.data.fragile_left || self.data.fragile_right
    }

    pub fn has_external_tokens(&self) -> bool {
        self.data.has_external_tokens
    }

    pub fn has_external_scanner_state_change(&self) -> bool {
        self.data.has_external_scanner_state_change
    }

    pub fn dynamic_precedence(&self) -> i32 {
        match &self.data.body {
            SubtreeBody::Leaf { .. } => 0,
            SubtreeBody::Interior(interior) => interior.dynamic_precedence,
        }
    }

    pub fn production_id(&self) -> u16 {
        match &self.data.body {
            SubtreeBody::Leaf { .. } => 0,
            SubtreeBody::Interior(interior) => interior.production_id,
        }
    }

    pub fn repeat_depth(&self) -> u32 {
        match &self.data.body {
            SubtreeBody::Leaf { .. } => 0,
            SubtreeBody::Interior(interior) => u32::from(interior.repeat_depth),
        }
    }

    pub(crate) fn visible_descendant_count(&self) -> u32 {
        match &self.data.body {
            SubtreeBody::Leaf { .. } => 0,
            SubtreeBody::Interior(interior) => interior.visible_descendant_count,
        }
    }

    pub(crate) fn visible_child_count(&self) -> u32 {
        match &self.data.body {
            SubtreeBody::Leaf { .. } => 0,
            SubtreeBody::Interior(interior) => interior.visible_child_count,
        }
    }

    /// The symbol of the first leaf under this node.
    pub(crate) fn leaf_symbol(&self) -> Symbol {
        match &self.data.body {
            SubtreeBody::Leaf { .. } => self.data.symbol,
            SubtreeBody::Interior(interior) => interior.first_leaf_symbol,
        }
    }

    /// The parse state in which the first leaf under this node was created.
    pub(crate) fn leaf_parse_state(&self) -> StateId {
        match &self.data.body {
            SubtreeBody::Leaf { .. } => self.data.parse_state,
            SubtreeBody::Interior(interior) => interior.first_leaf_parse_state,
        }
    }

    pub(crate) fn lookahead_char(&self) -> i32 {
        match &self.data.body {
            SubtreeBody::Leaf { lookahead_char, .. } => *lookahead_char,
            SubtreeBody::Interior(_) => 0,
        }
    }

    /// Serialized external-scanner state attached to this leaf, empty if none.
    pub(crate) fn external_scanner_state(&self) -> &[u8] {
        match &self.data.body {
            SubtreeBody::Leaf {
                external_state: Some(state),
                ..
            } => state,
            _ => &[],
        }
    }

    /// Do two handles point at the same node?
    pub fn ptr_eq(&self, other: &Subtree) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// Structural equality: same symbols, spans, and child structure,
    /// ignoring sharing and internal bookkeeping.
    pub fn structure_eq(&self, other: &Subtree) -> bool {
        let mut pending = vec![(self.clone(), other.clone())];
        while let Some((a, b)) = pending.pop() {
            if a.ptr_eq(&b) {
                continue;
            }
            if a.symbol() != b.symbol()
                || a.padding() != b.padding()
                || a.size() != b.size()
                || a.is_missing() != b.is_missing()
                || a.child_count() != b.child_count()
            {
                return false;
            }
            pending.extend(
                a.children()
                    .iter()
                    .cloned()
                    .zip(b.children().iter().cloned()),
            );
        }
        true
    }

    pub(crate) fn ref_count(&self) -> usize {
        Rc::strong_count(&self.data)
    }

    /// Copy-on-write access: clones the node first if the handle is shared.
    pub(crate) fn make_mut(&mut self) -> &mut SubtreeData {
        Rc::make_mut(&mut self.data)
    }

    /// Exclusive access to a child slot; `None` if this node is shared.
    pub(crate) fn child_mut(&mut self, index: usize) -> Option<&mut Subtree> {
        let data = Rc::get_mut(&mut self.data)?;
        match &mut data.body {
            SubtreeBody::Leaf { .. } => None,
            SubtreeBody::Interior(interior) => interior.children.get_mut(index),
        }
    }

    /// Rewrite a leaf's symbol in place (keyword fallback), refreshing the
    /// visibility metadata that depends on it.
    pub(crate) fn set_symbol(&mut self, symbol: Symbol, language: &Language) {
        let metadata = language.symbol_metadata(symbol);
        let data = self.make_mut();
        data.symbol = symbol;
        data.visible = metadata.visible;
        data.named = metadata.named;
    }

    /// Attach serialized external-scanner state to a leaf.
    pub(crate) fn set_external_state(&mut self, bytes: &[u8], changed: bool) {
        let data = self.make_mut();
        data.has_external_scanner_state_change = changed;
        if let SubtreeBody::Leaf { external_state, .. } = &mut data.body {
            *external_state = if bytes.is_empty() {
                None
            } else {
                Some(bytes.into())
            };
        }
    }

    /// Fold a production's own dynamic precedence into this node.
    pub(crate) fn add_dynamic_precedence(&mut self, value: i32) {
        if value == 0 {
            return;
        }
        if let SubtreeBody::Interior(interior) = &mut self.make_mut().body {
            interior.dynamic_precedence += value;
        }
    }

    /// The last token under this node that carried external-scanner state.
    pub(crate) fn last_external_token(&self) -> Option<Subtree> {
        if !self.has_external_tokens() {
            return None;
        }
        let mut tree = self.clone();
        while tree.child_count() > 0 {
            let next = tree
                .children()
                .iter()
                .rev()
                .find(|child| child.has_external_tokens())
                .cloned();
            match next {
                Some(child) => tree = child,
                None => break,
            }
        }
        Some(tree)
    }

    /// Render the visible structure of this subtree as an s-expression.
    pub fn to_sexp(&self, language: &Language) -> String {
        let mut text = String::new();
        write_sexp(&mut text, self, language);
        text
    }
}

impl fmt::Debug for Subtree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subtree")
            .field("symbol", &self.data.symbol)
            .field("padding", &self.data.padding.bytes)
            .field("size", &self.data.size.bytes)
            .field("child_count", &self.child_count())
            .finish()
    }
}

fn write_sexp(text: &mut String, tree: &Subtree, language: &Language) {
    if tree.visible() && tree.named() {
        if !text.is_empty() && !text.ends_with('(') {
            text.push(' ');
        }
        if tree.is_missing() {
            let _ = write!(text, "(MISSING {})", language.symbol_name(tree.symbol()));
            return;
        }
        if tree.is_error() && tree.child_count() == 0 {
            match char::from_u32(tree.lookahead_char() as u32) {
                Some(character) if tree.lookahead_char() > 0 => {
                    let _ = write!(text, "(UNEXPECTED {character:?})");
                }
                _ => text.push_str("(UNEXPECTED)"),
            }
            return;
        }
        let _ = write!(text, "({}", language.symbol_name(tree.symbol()));
        for child in tree.children() {
            write_sexp(text, child, language);
        }
        text.push(')');
    } else {
        for child in tree.children() {
            write_sexp(text, child, language);
        }
    }
}

/// Strip trailing extras (whitespace, comments) off a child list, returning
/// them in source order so they can be re-pushed above the new parent.
pub(crate) fn remove_trailing_extras(children: &mut Vec<Subtree>) -> Vec<Subtree> {
    let mut extras = Vec::new();
    while children.last().is_some_and(Subtree::extra) {
        if let Some(tree) = children.pop() {
            extras.push(tree);
        }
    }
    extras.reverse();
    extras
}

/// Dump a subtree in DOT format for debugging.
pub(crate) fn print_dot_graph(
    tree: &Subtree,
    language: &Language,
    out: &mut dyn std::io::Write,
) {
    use std::io::Write as _;
    let _ = writeln!(out, "digraph tree {{");
    let _ = writeln!(out, "edge [arrowhead=none]");
    let mut next_id = 0usize;
    write_dot_node(tree, language, out, &mut next_id, 0);
    let _ = writeln!(out, "}}");
}

fn write_dot_node(
    tree: &Subtree,
    language: &Language,
    out: &mut dyn std::io::Write,
    next_id: &mut usize,
    byte_offset: u32,
) -> usize {
    use std::io::Write as _;
    let id = *next_id;
    *next_id += 1;
    let start = byte_offset + tree.padding().bytes;
    let _ = writeln!(
        out,
        "tree_{id} [label=\"{}\", tooltip=\"range: {} - {}\nstate: {}\nerror-cost: {}\"]",
        language.symbol_name(tree.symbol()),
        start,
        start + tree.size().bytes,
        tree.parse_state(),
        tree.error_cost(),
    );
    let mut offset = byte_offset;
    for child in tree.children() {
        let child_id = write_dot_node(child, language, out, next_id, offset);
        let _ = writeln!(out, "tree_{id} -> tree_{child_id}");
        offset += child.total_bytes();
    }
    id
}

/// Are two optional external-scanner states byte-identical? Absent state
/// compares equal to empty state.
pub(crate) fn external_scanner_state_eq(a: Option<&Subtree>, b: Option<&Subtree>) -> bool {
    let a_state = a.map_or(&[] as &[u8], |tree| tree.external_scanner_state());
    let b_state = b.map_or(&[] as &[u8], |tree| tree.external_scanner_state());
    a_state == b_state
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// The factory for all subtree nodes. Deallocation follows ownership: the
/// last handle to drop frees the node.
pub(crate) struct SubtreePool {
    placeholder: Subtree,
}

impl SubtreePool {
    pub(crate) fn new() -> Self {
        SubtreePool {
            placeholder: Subtree {
                data: Rc::new(SubtreeData {
                    symbol: EOF_SYMBOL,
                    parse_state: 0,
                    padding: Length::ZERO,
                    size: Length::ZERO,
                    lookahead_bytes: 0,
                    error_cost: 0,
                    visible: false,
                    named: false,
                    extra: false,
                    fragile_left: false,
                    fragile_right: false,
                    has_changes: false,
                    has_external_tokens: false,
                    has_external_scanner_state_change: false,
                    is_missing: false,
                    is_keyword: false,
                    body: SubtreeBody::Leaf {
                        lookahead_char: 0,
                        external_state: None,
                    },
                }),
            },
        }
    }

    /// A throwaway node used to momentarily fill a child slot during
    /// restructuring. Never observable from outside.
    pub(crate) fn placeholder(&self) -> Subtree {
        self.placeholder.clone()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_leaf(
        &self,
        symbol: Symbol,
        padding: Length,
        size: Length,
        lookahead_bytes: u32,
        parse_state: StateId,
        has_external_tokens: bool,
        is_keyword: bool,
        language: &Language,
    ) -> Subtree {
        let metadata = language.symbol_metadata(symbol);
        let error_cost = if symbol == ERROR_SYMBOL {
            ERROR_COST_PER_SKIPPED_TREE
                + ERROR_COST_PER_SKIPPED_CHAR * size.bytes
                + ERROR_COST_PER_SKIPPED_LINE * size.extent.row
        } else {
            0
        };
        Subtree {
            data: Rc::new(SubtreeData {
                symbol,
                parse_state,
                padding,
                size,
                lookahead_bytes,
                error_cost,
                visible: metadata.visible,
                named: metadata.named,
                // The EOF token rides along as an extra so that acceptance
                // folds it into the root without ever selecting it.
                extra: symbol == EOF_SYMBOL,
                fragile_left: false,
                fragile_right: false,
                has_changes: false,
                has_external_tokens,
                has_external_scanner_state_change: false,
                is_missing: false,
                is_keyword,
                body: SubtreeBody::Leaf {
                    lookahead_char: 0,
                    external_state: None,
                },
            }),
        }
    }

    /// A leaf covering bytes the lexer had to skip, remembering the first
    /// character that failed to start a token.
    pub(crate) fn new_error_leaf(
        &self,
        lookahead_char: i32,
        padding: Length,
        size: Length,
        lookahead_bytes: u32,
        parse_state: StateId,
        language: &Language,
    ) -> Subtree {
        let mut result = self.new_leaf(
            ERROR_SYMBOL,
            padding,
            size,
            lookahead_bytes,
            parse_state,
            false,
            false,
            language,
        );
        let data = result.make_mut();
        data.fragile_left = true;
        data.fragile_right = true;
        data.body = SubtreeBody::Leaf {
            lookahead_char,
            external_state: None,
        };
        result
    }

    /// A zero-width leaf standing in for a token the input is missing.
    pub(crate) fn new_missing_leaf(
        &self,
        symbol: Symbol,
        padding: Length,
        lookahead_bytes: u32,
        language: &Language,
    ) -> Subtree {
        let mut result = self.new_leaf(
            symbol,
            padding,
            Length::ZERO,
            lookahead_bytes,
            0,
            false,
            false,
            language,
        );
        let data = result.make_mut();
        data.is_missing = true;
        data.error_cost = ERROR_COST_PER_MISSING_TREE + ERROR_COST_PER_RECOVERY;
        result
    }

    pub(crate) fn new_node(
        &self,
        symbol: Symbol,
        children: Vec<Subtree>,
        production_id: u16,
        language: &Language,
    ) -> Subtree {
        let metadata = language.symbol_metadata(symbol);
        let fragile = symbol == ERROR_SYMBOL || symbol == ERROR_REPEAT_SYMBOL;
        let mut data = SubtreeData {
            symbol,
            parse_state: 0,
            padding: Length::ZERO,
            size: Length::ZERO,
            lookahead_bytes: 0,
            error_cost: 0,
            visible: metadata.visible,
            named: metadata.named,
            extra: false,
            fragile_left: fragile,
            fragile_right: fragile,
            has_changes: false,
            has_external_tokens: false,
            has_external_scanner_state_change: false,
            is_missing: false,
            is_keyword: false,
            body: SubtreeBody::Interior(InteriorData {
                children,
                visible_child_count: 0,
                named_child_count: 0,
                visible_descendant_count: 0,
                dynamic_precedence: 0,
                repeat_depth: 0,
                production_id,
                first_leaf_symbol: 0,
                first_leaf_parse_state: 0,
            }),
        };
        summarize_children(&mut data);
        Subtree {
            data: Rc::new(data),
        }
    }

    /// An ERROR node wrapping the subtrees consumed by recovery.
    pub(crate) fn new_error_node(
        &self,
        children: Vec<Subtree>,
        extra: bool,
        language: &Language,
    ) -> Subtree {
        let mut result = self.new_node(ERROR_SYMBOL, children, 0, language);
        result.make_mut().extra = extra;
        result
    }
}

/// Recompute every derived field of an interior node from its children.
pub(crate) fn summarize_children(data: &mut SubtreeData) {
    let is_error_node = data.symbol == ERROR_SYMBOL || data.symbol == ERROR_REPEAT_SYMBOL;
    let SubtreeBody::Interior(interior) = &mut data.body else {
        return;
    };

    let mut padding = Length::ZERO;
    let mut size = Length::ZERO;
    let mut lookahead_end_byte = 0;
    let mut error_cost = 0;
    let mut dynamic_precedence = 0;
    let mut visible_child_count = 0;
    let mut named_child_count = 0;
    let mut visible_descendant_count = 0;
    let mut has_external_tokens = false;
    let mut has_external_scanner_state_change = false;
    let mut fragile_left = data.fragile_left;
    let mut fragile_right = data.fragile_right;
    let mut parse_state_none = false;

    for (i, child) in interior.children.iter().enumerate() {
        if i == 0 {
            padding = child.padding();
            size = child.size();
        } else {
            size = size + child.total_size();
        }

        let child_lookahead_end_byte = padding.bytes + size.bytes + child.lookahead_bytes();
        if child_lookahead_end_byte > lookahead_end_byte {
            lookahead_end_byte = child_lookahead_end_byte;
        }

        if child.symbol() != ERROR_REPEAT_SYMBOL {
            error_cost += child.error_cost();
        }

        if is_error_node
            && !child.extra()
            && !(child.is_error() && child.child_count() == 0)
        {
            if child.visible() {
                error_cost += ERROR_COST_PER_SKIPPED_TREE;
            } else if child.child_count() > 0 {
                error_cost += ERROR_COST_PER_SKIPPED_TREE * child.visible_child_count();
            }
        }

        dynamic_precedence += child.dynamic_precedence();
        visible_descendant_count += child.visible_descendant_count();

        if child.visible() {
            visible_descendant_count += 1;
            visible_child_count += 1;
            if child.named() {
                named_child_count += 1;
            }
        } else if child.child_count() > 0 {
            visible_child_count += child.visible_child_count();
            named_child_count += match &child.data.body {
                SubtreeBody::Interior(interior) => interior.named_child_count,
                SubtreeBody::Leaf { .. } => 0,
            };
        }

        if child.has_external_tokens() {
            has_external_tokens = true;
        }
        if child.has_external_scanner_state_change() {
            has_external_scanner_state_change = true;
        }

        if child.is_error() {
            fragile_left = true;
            fragile_right = true;
            parse_state_none = true;
        }
    }

    if is_error_node {
        error_cost += ERROR_COST_PER_RECOVERY
            + ERROR_COST_PER_SKIPPED_CHAR * size.bytes
            + ERROR_COST_PER_SKIPPED_LINE * size.extent.row;
    }

    interior.visible_child_count = visible_child_count;
    interior.named_child_count = named_child_count;
    interior.visible_descendant_count = visible_descendant_count;
    interior.dynamic_precedence = dynamic_precedence;
    interior.repeat_depth = 0;

    if let [first, .., last] = interior.children.as_slice() {
        interior.first_leaf_symbol = first.leaf_symbol();
        interior.first_leaf_parse_state = first.leaf_parse_state();
        if first.data.fragile_left {
            fragile_left = true;
        }
        if last.data.fragile_right {
            fragile_right = true;
        }
        if !data.visible && !data.named && first.symbol() == data.symbol {
            interior.repeat_depth = first.repeat_depth().min(u32::from(u16::MAX - 1)) as u16 + 1;
        }
    } else if let [only] = interior.children.as_slice() {
        interior.first_leaf_symbol = only.leaf_symbol();
        interior.first_leaf_parse_state = only.leaf_parse_state();
        if only.data.fragile_left {
            fragile_left = true;
        }
        if only.data.fragile_right {
            fragile_right = true;
        }
    }

    data.padding = padding;
    data.size = size;
    data.lookahead_bytes = lookahead_end_byte.saturating_sub(padding.bytes + size.bytes);
    data.error_cost = error_cost;
    data.has_external_tokens = has_external_tokens;
    data.has_external_scanner_state_change = has_external_scanner_state_change;
    data.fragile_left = fragile_left;
    data.fragile_right = fragile_right;
    if parse_state_none {
        data.parse_state = TREE_STATE_NONE;
    }
}

// ---------------------------------------------------------------------------
// Structural comparison
// ---------------------------------------------------------------------------

/// Deterministic structural ordering used to pick between ambiguous subtrees
/// with equal costs and precedences: symbol order first, then child count,
/// then children pairwise.
pub(crate) fn compare(left: &Subtree, right: &Subtree) -> i32 {
    let mut pending = vec![(left.clone(), right.clone())];
    while let Some((a, b)) = pending.pop() {
        if a.symbol() < b.symbol() {
            return -1;
        }
        if b.symbol() < a.symbol() {
            return 1;
        }
        if a.child_count() < b.child_count() {
            return -1;
        }
        if b.child_count() < a.child_count() {
            return 1;
        }
        for pair in a
            .children()
            .iter()
            .cloned()
            .zip(b.children().iter().cloned())
            .rev()
        {
            pending.push(pair);
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Editing
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct EditRanges {
    start: Length,
    old_end: Length,
    new_end: Length,
}

/// Adjust a tree for an edit to its text, marking every touched node with
/// `has_changes` so reparsing knows what not to reuse. Shared nodes are
/// cloned on the way down; untouched subtrees stay shared with the old tree.
pub(crate) fn edit(tree: &mut Subtree, input_edit: &InputEdit) {
    let ranges = EditRanges {
        start: Length::new(input_edit.start_byte, input_edit.start_point),
        old_end: Length::new(input_edit.old_end_byte, input_edit.old_end_point),
        new_end: Length::new(input_edit.new_end_byte, input_edit.new_end_point),
    };
    apply_edit(tree, ranges);
}

fn apply_edit(tree: &mut Subtree, mut edit: EditRanges) {
    let is_noop = edit.old_end.bytes == edit.start.bytes && edit.new_end.bytes == edit.start.bytes;
    let is_pure_insertion = edit.old_end.bytes == edit.start.bytes;

    let mut size = tree.size();
    let mut padding = tree.padding();
    let total_size = padding + size;
    let lookahead_bytes = tree.lookahead_bytes();
    let end_byte = total_size.bytes + lookahead_bytes;
    if edit.start.bytes > end_byte || (is_noop && edit.start.bytes == end_byte) {
        return;
    }

    if edit.old_end.bytes <= padding.bytes {
        // Entirely within the space before this subtree: shift it.
        padding = edit.new_end + (padding - edit.old_end);
    } else if edit.start.bytes < padding.bytes {
        // Starts before this subtree and extends into it: shrink the content
        // to compensate for the consumed padding.
        size = size.saturating_sub(edit.old_end - padding);
        padding = edit.new_end;
    } else if edit.start.bytes == padding.bytes && is_pure_insertion {
        // Insertion at the very start: becomes part of the padding.
        padding = edit.new_end;
    } else if edit.start.bytes < total_size.bytes
        || (edit.start.bytes == total_size.bytes && is_pure_insertion)
    {
        // Within this subtree: resize.
        size = (edit.new_end - padding) + total_size.saturating_sub(edit.old_end);
    }

    let data = tree.make_mut();
    data.padding = padding;
    data.size = size;
    data.has_changes = true;

    let SubtreeBody::Interior(interior) = &mut data.body else {
        return;
    };

    let mut child_right = Length::ZERO;
    for child in interior.children.iter_mut() {
        let child_left = child_right;
        child_right = child_left + child.total_size();

        // Children that end before the edit are unaffected.
        if child_right.bytes + child.lookahead_bytes() < edit.start.bytes {
            continue;
        }
        // Children that start after the edit are positioned relatively and
        // need no adjustment.
        if child_left.bytes > edit.old_end.bytes {
            break;
        }

        let mut child_edit = EditRanges {
            start: edit.start - child_left,
            old_end: edit.old_end - child_left,
            new_end: edit.new_end - child_left,
        };
        if edit.start.bytes < child_left.bytes {
            child_edit.start = Length::ZERO;
        }
        if edit.old_end.bytes < child_left.bytes {
            child_edit.old_end = Length::ZERO;
        }
        if edit.new_end.bytes < child_left.bytes {
            child_edit.new_end = Length::ZERO;
        }
        if edit.old_end.bytes > child_right.bytes {
            child_edit.old_end = child_right - child_left;
        }

        // All inserted text belongs to the first child that touches the
        // edit; later children are only shrunk.
        if child_right.bytes > edit.start.bytes
            || (child_right.bytes == edit.start.bytes && is_pure_insertion)
        {
            edit.new_end = edit.start;
        } else {
            child_edit.old_end = child_edit.start;
            child_edit.new_end = child_edit.start;
        }

        apply_edit(child, child_edit);
    }
}

// ---------------------------------------------------------------------------
// Repetition compression
// ---------------------------------------------------------------------------

fn rotation_ready(tree: &Subtree, symbol: Symbol) -> bool {
    let check = |node: &Subtree| node.ref_count() == 1 && node.child_count() >= 2;
    if !check(tree) || tree.symbol() != symbol {
        return false;
    }
    let child = &tree.children()[0];
    if !check(child) || child.symbol() != symbol {
        return false;
    }
    let grandchild = &child.children()[0];
    check(grandchild) && grandchild.symbol() == symbol
}

/// One left-spine rotation: `T(C(G(…, X), rest…), …)` becomes
/// `T(G(…, C(X, rest…)), …)`, with `T`'s first-child slot left holding a
/// placeholder for the caller to fill. Returns the promoted grandchild.
/// Restores the original shape and returns `None` if the spine turns out
/// not to be rotatable (the caller checks `rotation_ready` first).
fn rotate(current: &mut Subtree, pool: &SubtreePool) -> Option<Subtree> {
    let data = Rc::get_mut(&mut current.data)?;
    let SubtreeBody::Interior(interior) = &mut data.body else {
        return None;
    };
    let mut child = std::mem::replace(&mut interior.children[0], pool.placeholder());
    let mut grandchild = match child.child_mut(0) {
        Some(slot) => std::mem::replace(slot, pool.placeholder()),
        None => {
            interior.children[0] = child;
            return None;
        }
    };
    let last = grandchild.child_count().saturating_sub(1);
    let displaced = match grandchild.child_mut(last) {
        Some(slot) => std::mem::replace(slot, pool.placeholder()),
        None => {
            if let Some(slot) = child.child_mut(0) {
                *slot = grandchild;
            }
            interior.children[0] = child;
            return None;
        }
    };
    if let Some(slot) = child.child_mut(0) {
        *slot = displaced;
    }
    if let Some(slot) = grandchild.child_mut(last) {
        *slot = child;
    }
    Some(grandchild)
}

/// Perform up to `count` rotations down the leftmost spine of a repetition
/// chain, moving depth from the left side to the right, then re-summarize
/// every touched node bottom-up.
pub(crate) fn compress(slot: &mut Subtree, count: u32, pool: &SubtreePool) {
    let symbol = slot.symbol();
    let mut spine: Vec<Subtree> = Vec::new();
    let mut current = std::mem::replace(slot, pool.placeholder());

    for _ in 0..count {
        if !rotation_ready(&current, symbol) {
            break;
        }
        match rotate(&mut current, pool) {
            Some(grandchild) => {
                spine.push(current);
                current = grandchild;
            }
            None => break,
        }
    }

    // Reassemble bottom-up, recomputing aggregates of every touched node.
    while let Some(mut parent) = spine.pop() {
        resummarize_last_child(&mut current);
        if let Some(data) = Rc::get_mut(&mut current.data) {
            summarize_children(data);
        }
        if let Some(first_child) = parent.child_mut(0) {
            *first_child = current;
        }
        if let Some(data) = Rc::get_mut(&mut parent.data) {
            summarize_children(data);
        }
        current = parent;
    }

    *slot = current;
}

fn resummarize_last_child(tree: &mut Subtree) {
    let count = tree.child_count();
    if count == 0 {
        return;
    }
    if let Some(child) = tree.child_mut(count - 1) {
        if let Some(data) = Rc::get_mut(&mut child.data) {
            summarize_children(data);
        }
    }
}
