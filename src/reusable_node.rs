//! A cursor over the previous syntax tree, walking it in source order so the
//! driver can consider each unchanged subtree for reuse.

use crate::subtree::Subtree;

#[derive(Clone)]
struct ReusableEntry {
    tree: Subtree,
    child_index: usize,
    byte_offset: u32,
}

pub(crate) struct ReusableNode {
    stack: Vec<ReusableEntry>,
    pub(crate) last_external_token: Option<Subtree>,
}

impl ReusableNode {
    pub(crate) fn new() -> Self {
        ReusableNode {
            stack: Vec::new(),
            last_external_token: None,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.stack.clear();
        self.last_external_token = None;
    }

    /// The current candidate subtree, if the cursor is inside the tree.
    pub(crate) fn tree(&self) -> Option<Subtree> {
        self.stack.last().map(|entry| entry.tree.clone())
    }

    pub(crate) fn byte_offset(&self) -> u32 {
        self.stack.last().map_or(u32::MAX, |entry| entry.byte_offset)
    }

    /// Move past the current candidate to the next subtree in source order.
    pub(crate) fn advance(&mut self) {
        let Some(last_entry) = self.stack.last() else {
            return;
        };
        let byte_offset = last_entry.byte_offset + last_entry.tree.total_bytes();
        if last_entry.tree.has_external_tokens() {
            self.last_external_token = last_entry.tree.last_external_token();
        }

        let mut next_index;
        loop {
            let Some(popped) = self.stack.pop() else {
                return;
            };
            next_index = popped.child_index + 1;
            match self.stack.last() {
                Some(parent) if parent.tree.child_count() > next_index => break,
                Some(_) => continue,
                None => return,
            }
        }

        let parent = &self.stack[self.stack.len() - 1];
        let tree = parent.tree.children()[next_index].clone();
        self.stack.push(ReusableEntry {
            tree,
            child_index: next_index,
            byte_offset,
        });
    }

    /// Step into the current candidate's first child. Returns false at a leaf.
    pub(crate) fn descend(&mut self) -> bool {
        let Some(last_entry) = self.stack.last() else {
            return false;
        };
        if last_entry.tree.child_count() == 0 {
            return false;
        }
        let entry = ReusableEntry {
            tree: last_entry.tree.children()[0].clone(),
            child_index: 0,
            byte_offset: last_entry.byte_offset,
        };
        self.stack.push(entry);
        true
    }

    /// Skip the leaf at the current position entirely.
    pub(crate) fn advance_past_leaf(&mut self) {
        while self.descend() {}
        self.advance();
    }

    pub(crate) fn reset(&mut self, tree: Subtree) {
        self.clear();
        self.stack.push(ReusableEntry {
            tree,
            child_index: 0,
            byte_offset: 0,
        });

        // Never reuse the root node: acceptance gave it a non-standard
        // structure (the EOF child and hoisted trailing extras).
        if !self.descend() {
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::LanguageBuilder;
    use crate::length::Length;
    use crate::point::Point;
    use crate::subtree::SubtreePool;

    #[test]
    fn walks_leaves_in_source_order() {
        let pool = SubtreePool::new();
        let mut builder = LanguageBuilder::new("cursor-tests");
        let a = builder.token("a");
        let inner = builder.non_terminal("inner");
        let root_symbol = builder.non_terminal("root");
        let language = builder.build();

        let leaf = |bytes: u32| {
            pool.new_leaf(
                a,
                Length::ZERO,
                Length::new(bytes, Point::new(0, bytes)),
                0,
                1,
                false,
                false,
                &language,
            )
        };
        let first = pool.new_node(inner, vec![leaf(1), leaf(2)], 0, &language);
        let root = pool.new_node(root_symbol, vec![first, leaf(3)], 0, &language);

        let mut cursor = ReusableNode::new();
        cursor.reset(root);

        // Starts at the root's first child.
        let candidate = cursor.tree().expect("cursor points at the first child");
        assert_eq!(candidate.symbol(), inner);
        assert_eq!(cursor.byte_offset(), 0);

        cursor.descend();
        assert_eq!(cursor.tree().map(|tree| tree.total_bytes()), Some(1));

        cursor.advance();
        assert_eq!(cursor.byte_offset(), 1);
        cursor.advance();
        assert_eq!(cursor.byte_offset(), 3);
        assert_eq!(cursor.tree().map(|tree| tree.total_bytes()), Some(3));

        cursor.advance();
        assert!(cursor.tree().is_none());
    }
}
