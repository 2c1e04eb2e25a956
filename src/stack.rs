//! The graph-structured parse stack.
//!
//! Several parse branches ("versions") coexist, sharing common prefixes in a
//! DAG of nodes. Nodes live in an arena and are addressed by index, so merges
//! and removals never invalidate references held elsewhere. Versions can be
//! pushed, popped in several ways, merged when they converge on the same
//! state and position, paused for error recovery, and halted for removal.

use std::io::{self, Write as _};

use smallvec::SmallVec;

use crate::error_costs::{ERROR_COST_PER_RECOVERY, ERROR_STATE};
use crate::language::{Language, StateId, ERROR_REPEAT_SYMBOL};
use crate::length::Length;
use crate::subtree::{external_scanner_state_eq, Subtree};

pub(crate) type StackVersion = usize;

const MAX_LINK_COUNT: usize = 8;
const MAX_ITERATOR_COUNT: usize = 64;

type NodeId = u32;

#[derive(Clone)]
struct StackLink {
    node: NodeId,
    subtree: Option<Subtree>,
    is_pending: bool,
}

struct StackNode {
    state: StateId,
    position: Length,
    links: SmallVec<[StackLink; 2]>,
    ref_count: u32,
    error_cost: u32,
    node_count: u32,
    dynamic_precedence: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StackStatus {
    Active,
    Paused,
    Halted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StackSummaryEntry {
    pub(crate) position: Length,
    pub(crate) depth: u32,
    pub(crate) state: StateId,
}

pub(crate) type StackSummary = Vec<StackSummaryEntry>;

struct StackHead {
    node: NodeId,
    summary: Option<StackSummary>,
    node_count_at_last_error: u32,
    last_external_token: Option<Subtree>,
    lookahead_when_paused: Option<Subtree>,
    status: StackStatus,
}

/// One path popped off a version: the subtrees in source order, and the
/// version whose head now rests where the pop stopped.
pub(crate) struct StackSlice {
    pub(crate) subtrees: Vec<Subtree>,
    pub(crate) version: StackVersion,
}

#[derive(Clone, Copy, Default)]
struct StackAction {
    pop: bool,
    stop: bool,
}

#[derive(Clone)]
struct StackIter {
    node: NodeId,
    subtrees: Vec<Subtree>,
    subtree_count: u32,
    is_pending: bool,
}

pub(crate) struct Stack {
    nodes: Vec<StackNode>,
    free_nodes: Vec<NodeId>,
    heads: Vec<StackHead>,
    base_node: NodeId,
}

fn subtree_node_count(subtree: &Subtree) -> u32 {
    let mut count = subtree.visible_descendant_count();
    if subtree.visible() {
        count += 1;
    }
    if subtree.symbol() == ERROR_REPEAT_SYMBOL {
        count += 1;
    }
    count
}

/// Two links can merge when their subtrees would be interchangeable: same
/// symbol and footprint, or both already erroneous.
fn subtree_is_equivalent(left: Option<&Subtree>, right: Option<&Subtree>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(left), Some(right)) => {
            if left.ptr_eq(right) {
                return true;
            }
            if left.symbol() != right.symbol() {
                return false;
            }
            if left.error_cost() > 0 && right.error_cost() > 0 {
                return true;
            }
            left.padding().bytes == right.padding().bytes
                && left.size().bytes == right.size().bytes
                && left.child_count() == right.child_count()
                && left.extra() == right.extra()
                && external_scanner_state_eq(Some(left), Some(right))
        }
        _ => false,
    }
}

impl Stack {
    pub(crate) fn new() -> Self {
        let mut stack = Stack {
            nodes: Vec::with_capacity(32),
            free_nodes: Vec::new(),
            heads: Vec::with_capacity(4),
            base_node: 0,
        };
        stack.base_node = stack.new_node(None, None, false, 1);
        stack.heads.push(StackHead {
            node: stack.base_node,
            summary: None,
            node_count_at_last_error: 0,
            last_external_token: None,
            lookahead_when_paused: None,
            status: StackStatus::Active,
        });
        stack
    }

    // -- node arena ---------------------------------------------------------

    fn new_node(
        &mut self,
        previous: Option<NodeId>,
        subtree: Option<Subtree>,
        is_pending: bool,
        state: StateId,
    ) -> NodeId {
        let mut node = StackNode {
            state,
            position: Length::ZERO,
            links: SmallVec::new(),
            ref_count: 1,
            error_cost: 0,
            node_count: 0,
            dynamic_precedence: 0,
        };

        if let Some(previous_id) = previous {
            let previous_node = &self.nodes[previous_id as usize];
            node.position = previous_node.position;
            node.error_cost = previous_node.error_cost;
            node.dynamic_precedence = previous_node.dynamic_precedence;
            node.node_count = previous_node.node_count;
            if let Some(subtree) = &subtree {
                node.error_cost += subtree.error_cost();
                node.position = node.position + subtree.total_size();
                node.node_count += subtree_node_count(subtree);
                node.dynamic_precedence += subtree.dynamic_precedence();
            }
            node.links.push(StackLink {
                node: previous_id,
                subtree,
                is_pending,
            });
        }

        match self.free_nodes.pop() {
            Some(id) => {
                self.nodes[id as usize] = node;
                id
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as NodeId
            }
        }
    }

    fn retain_node(&mut self, id: NodeId) {
        self.nodes[id as usize].ref_count += 1;
    }

    fn release_node(&mut self, id: NodeId) {
        let mut pending: SmallVec<[NodeId; 8]> = SmallVec::new();
        pending.push(id);
        while let Some(id) = pending.pop() {
            let node = &mut self.nodes[id as usize];
            debug_assert!(node.ref_count > 0);
            node.ref_count -= 1;
            if node.ref_count > 0 {
                continue;
            }
            let links = std::mem::take(&mut node.links);
            self.free_nodes.push(id);
            for link in links {
                pending.push(link.node);
            }
        }
    }

    fn node(&self, id: NodeId) -> &StackNode {
        &self.nodes[id as usize]
    }

    /// Attach another predecessor to a node, merging with an existing link
    /// when the subtrees are equivalent.
    fn node_add_link(&mut self, id: NodeId, link: StackLink) {
        if link.node == id {
            return;
        }

        for i in 0..self.node(id).links.len() {
            let existing = self.node(id).links[i].clone();
            if subtree_is_equivalent(existing.subtree.as_ref(), link.subtree.as_ref()) {
                if existing.node == link.node {
                    // Same shape, same predecessor: keep whichever subtree
                    // carries the higher dynamic precedence.
                    let link_precedence =
                        link.subtree.as_ref().map_or(0, Subtree::dynamic_precedence);
                    let existing_precedence = existing
                        .subtree
                        .as_ref()
                        .map_or(0, Subtree::dynamic_precedence);
                    if link_precedence > existing_precedence {
                        self.nodes[id as usize].links[i].subtree = link.subtree.clone();
                        self.nodes[id as usize].dynamic_precedence =
                            self.node(link.node).dynamic_precedence + link_precedence;
                    }
                    return;
                }

                let existing_node = existing.node;
                let link_node = link.node;
                if self.node(existing_node).state == self.node(link_node).state
                    && self.node(existing_node).position.bytes
                        == self.node(link_node).position.bytes
                    && self.node(existing_node).error_cost == self.node(link_node).error_cost
                {
                    // The two predecessors are interchangeable: graft the new
                    // one's links onto the old one.
                    let inner_links: SmallVec<[StackLink; 2]> =
                        self.node(link_node).links.iter().cloned().collect();
                    for inner in inner_links {
                        self.node_add_link(existing_node, inner);
                    }
                    let mut precedence = self.node(link_node).dynamic_precedence;
                    if let Some(subtree) = &link.subtree {
                        precedence += subtree.dynamic_precedence();
                    }
                    if precedence > self.node(id).dynamic_precedence {
                        self.nodes[id as usize].dynamic_precedence = precedence;
                    }
                    return;
                }
            }
        }

        if self.node(id).links.len() == MAX_LINK_COUNT {
            return;
        }

        self.retain_node(link.node);
        let mut node_count = self.node(link.node).node_count;
        let mut precedence = self.node(link.node).dynamic_precedence;
        if let Some(subtree) = &link.subtree {
            node_count += subtree_node_count(subtree);
            precedence += subtree.dynamic_precedence();
        }
        let node = &mut self.nodes[id as usize];
        node.links.push(link);
        if node_count > node.node_count {
            node.node_count = node_count;
        }
        if precedence > node.dynamic_precedence {
            node.dynamic_precedence = precedence;
        }
    }

    // -- version accessors --------------------------------------------------

    pub(crate) fn version_count(&self) -> usize {
        self.heads.len()
    }

    pub(crate) fn halted_version_count(&self) -> usize {
        self.heads
            .iter()
            .filter(|head| head.status == StackStatus::Halted)
            .count()
    }

    pub(crate) fn state(&self, version: StackVersion) -> StateId {
        self.node(self.heads[version].node).state
    }

    pub(crate) fn position(&self, version: StackVersion) -> Length {
        self.node(self.heads[version].node).position
    }

    pub(crate) fn last_external_token(&self, version: StackVersion) -> Option<Subtree> {
        self.heads[version].last_external_token.clone()
    }

    pub(crate) fn set_last_external_token(
        &mut self,
        version: StackVersion,
        token: Option<Subtree>,
    ) {
        self.heads[version].last_external_token = token;
    }

    pub(crate) fn error_cost(&self, version: StackVersion) -> u32 {
        let head = &self.heads[version];
        let node = self.node(head.node);
        let mut cost = node.error_cost;
        if head.status == StackStatus::Paused
            || (node.state == ERROR_STATE
                && node.links.first().is_some_and(|link| link.subtree.is_none()))
        {
            cost += ERROR_COST_PER_RECOVERY;
        }
        cost
    }

    pub(crate) fn node_count_since_error(&mut self, version: StackVersion) -> u32 {
        let node_count = self.node(self.heads[version].node).node_count;
        let head = &mut self.heads[version];
        if node_count < head.node_count_at_last_error {
            head.node_count_at_last_error = node_count;
        }
        node_count - head.node_count_at_last_error
    }

    pub(crate) fn dynamic_precedence(&self, version: StackVersion) -> i32 {
        self.node(self.heads[version].node).dynamic_precedence
    }

    pub(crate) fn has_advanced_since_error(&self, version: StackVersion) -> bool {
        let head = &self.heads[version];
        let mut node = self.node(head.node);
        if node.error_cost == 0 {
            return true;
        }
        while let Some(link) = node.links.first() {
            if let Some(subtree) = &link.subtree {
                if subtree.total_bytes() > 0 {
                    return true;
                }
                if node.node_count > head.node_count_at_last_error && subtree.error_cost() == 0 {
                    node = self.node(link.node);
                    continue;
                }
            }
            break;
        }
        false
    }

    // -- pushing and popping ------------------------------------------------

    pub(crate) fn push(
        &mut self,
        version: StackVersion,
        subtree: Option<Subtree>,
        is_pending: bool,
        state: StateId,
    ) {
        let head_node = self.heads[version].node;
        let reset_error_baseline = subtree.is_none();
        let new_node = self.new_node(Some(head_node), subtree, is_pending, state);
        if reset_error_baseline {
            self.heads[version].node_count_at_last_error = self.node(new_node).node_count;
        }
        self.heads[version].node = new_node;
    }

    fn add_version(&mut self, original_version: StackVersion, node: NodeId) -> StackVersion {
        let original = &self.heads[original_version];
        let head = StackHead {
            node,
            summary: None,
            node_count_at_last_error: original.node_count_at_last_error,
            last_external_token: original.last_external_token.clone(),
            lookahead_when_paused: None,
            status: StackStatus::Active,
        };
        self.heads.push(head);
        self.retain_node(node);
        self.heads.len() - 1
    }

    fn add_slice(
        &mut self,
        original_version: StackVersion,
        node: NodeId,
        subtrees: Vec<Subtree>,
        slices: &mut Vec<StackSlice>,
    ) {
        for i in (0..slices.len()).rev() {
            let version = slices[i].version;
            if self.heads[version].node == node {
                slices.insert(i + 1, StackSlice { subtrees, version });
                return;
            }
        }
        let version = self.add_version(original_version, node);
        slices.push(StackSlice { subtrees, version });
    }

    /// Core traversal: walk backward from a version's head, forking at every
    /// merge point, asking the callback at each node whether to pop a slice
    /// there, stop, or keep walking.
    fn iterate<F>(
        &mut self,
        version: StackVersion,
        goal_subtree_count: i32,
        mut callback: F,
    ) -> Vec<StackSlice>
    where
        F: FnMut(&StackNode, &[Subtree], u32, bool) -> StackAction,
    {
        let include_subtrees = goal_subtree_count >= 0;
        let mut slices: Vec<StackSlice> = Vec::new();
        let mut iterators = vec![StackIter {
            node: self.heads[version].node,
            subtrees: Vec::new(),
            subtree_count: 0,
            is_pending: true,
        }];

        while !iterators.is_empty() {
            let mut i = 0;
            while i < iterators.len() {
                let node_id = iterators[i].node;
                let (action, link_count) = {
                    let node = self.node(node_id);
                    let iter = &iterators[i];
                    (
                        callback(node, &iter.subtrees, iter.subtree_count, iter.is_pending),
                        node.links.len(),
                    )
                };
                let should_pop = action.pop;
                let should_stop = action.stop || link_count == 0;

                if should_pop {
                    let mut subtrees = if should_stop {
                        std::mem::take(&mut iterators[i].subtrees)
                    } else {
                        iterators[i].subtrees.clone()
                    };
                    subtrees.reverse();
                    self.add_slice(version, node_id, subtrees, &mut slices);
                }

                if should_stop {
                    iterators.remove(i);
                    continue;
                }

                let links: SmallVec<[StackLink; 2]> =
                    self.node(node_id).links.iter().cloned().collect();
                for link in links.iter().skip(1) {
                    if iterators.len() >= MAX_ITERATOR_COUNT {
                        continue;
                    }
                    let mut fork = iterators[i].clone();
                    Self::follow_link(&mut fork, link, include_subtrees);
                    iterators.push(fork);
                }
                if let Some(first) = links.first() {
                    Self::follow_link(&mut iterators[i], first, include_subtrees);
                }
                i += 1;
            }
        }

        slices
    }

    fn follow_link(iter: &mut StackIter, link: &StackLink, include_subtrees: bool) {
        iter.node = link.node;
        match &link.subtree {
            Some(subtree) => {
                if include_subtrees {
                    iter.subtrees.push(subtree.clone());
                }
                if !subtree.extra() {
                    iter.subtree_count += 1;
                    if !link.is_pending {
                        iter.is_pending = false;
                    }
                }
            }
            None => {
                iter.subtree_count += 1;
                iter.is_pending = false;
            }
        }
    }

    /// Pop the given number of non-extra subtrees, yielding one slice per
    /// distinct path through the graph.
    pub(crate) fn pop_count(&mut self, version: StackVersion, count: u32) -> Vec<StackSlice> {
        self.iterate(version, count as i32, |_, _, subtree_count, _| StackAction {
            pop: subtree_count == count,
            stop: subtree_count == count,
        })
    }

    /// Pop entries pushed as "pending" (partial reductions awaiting more
    /// input); used to break down reused nodes.
    pub(crate) fn pop_pending(&mut self, version: StackVersion) -> Vec<StackSlice> {
        let mut slices = self.iterate(version, 0, |_, _, subtree_count, is_pending| {
            if subtree_count >= 1 {
                StackAction {
                    pop: is_pending,
                    stop: true,
                }
            } else {
                StackAction::default()
            }
        });
        if !slices.is_empty() {
            self.renumber_version(slices[0].version, version);
            slices[0].version = version;
        }
        slices
    }

    /// Pop the error subtree sitting on top of a version, if any.
    pub(crate) fn pop_error(&mut self, version: StackVersion) -> Vec<Subtree> {
        let head_node = self.heads[version].node;
        let has_error = self
            .node(head_node)
            .links
            .iter()
            .any(|link| link.subtree.as_ref().is_some_and(Subtree::is_error));
        if !has_error {
            return Vec::new();
        }

        let mut found_error = false;
        let mut slices = self.iterate(version, 1, |_, subtrees, _, _| {
            if !subtrees.is_empty() {
                if !found_error && subtrees[0].is_error() {
                    found_error = true;
                    StackAction {
                        pop: true,
                        stop: true,
                    }
                } else {
                    StackAction {
                        pop: false,
                        stop: true,
                    }
                }
            } else {
                StackAction::default()
            }
        });

        if slices.is_empty() {
            return Vec::new();
        }
        debug_assert!(slices.len() == 1);
        let StackSlice {
            subtrees,
            version: slice_version,
        } = slices.swap_remove(0);
        self.renumber_version(slice_version, version);
        subtrees
    }

    /// Pop everything down to the base of the stack.
    pub(crate) fn pop_all(&mut self, version: StackVersion) -> Vec<StackSlice> {
        self.iterate(version, 0, |node, _, _, _| StackAction {
            pop: node.links.is_empty(),
            stop: false,
        })
    }

    // -- summaries ----------------------------------------------------------

    /// Record a depth-capped summary of the states reachable near the top of
    /// a version, for snap-back recovery.
    pub(crate) fn record_summary(&mut self, version: StackVersion, max_depth: u32) {
        let mut summary: StackSummary = Vec::new();
        self.iterate(version, -1, |node, _, subtree_count, _| {
            if subtree_count > max_depth {
                return StackAction {
                    pop: false,
                    stop: true,
                };
            }
            let depth = subtree_count;
            let state = node.state;
            let mut is_duplicate = false;
            for entry in summary.iter().rev() {
                if entry.depth < depth {
                    break;
                }
                if entry.depth == depth && entry.state == state {
                    is_duplicate = true;
                    break;
                }
            }
            if !is_duplicate {
                summary.push(StackSummaryEntry {
                    position: node.position,
                    depth,
                    state,
                });
            }
            StackAction::default()
        });
        self.heads[version].summary = Some(summary);
    }

    pub(crate) fn summary(&self, version: StackVersion) -> Option<&StackSummary> {
        self.heads[version].summary.as_ref()
    }

    // -- version management -------------------------------------------------

    fn release_head(&mut self, head: StackHead) {
        self.release_node(head.node);
    }

    pub(crate) fn remove_version(&mut self, version: StackVersion) {
        let head = self.heads.remove(version);
        self.release_head(head);
    }

    /// Move version `source` into slot `target` (which must be lower),
    /// discarding what was there.
    pub(crate) fn renumber_version(&mut self, source: StackVersion, target: StackVersion) {
        if source == target {
            return;
        }
        debug_assert!(target < source);
        let mut source_head = self.heads.remove(source);
        if source_head.summary.is_none() {
            source_head.summary = self.heads[target].summary.take();
        }
        let old_target = std::mem::replace(&mut self.heads[target], source_head);
        self.release_head(old_target);
    }

    pub(crate) fn swap_versions(&mut self, left: StackVersion, right: StackVersion) {
        self.heads.swap(left, right);
    }

    pub(crate) fn copy_version(&mut self, version: StackVersion) -> StackVersion {
        let original = &self.heads[version];
        let head = StackHead {
            node: original.node,
            summary: None,
            node_count_at_last_error: original.node_count_at_last_error,
            last_external_token: original.last_external_token.clone(),
            lookahead_when_paused: None,
            status: original.status,
        };
        let node = head.node;
        self.heads.push(head);
        self.retain_node(node);
        self.heads.len() - 1
    }

    pub(crate) fn can_merge(&self, left: StackVersion, right: StackVersion) -> bool {
        let left_head = &self.heads[left];
        let right_head = &self.heads[right];
        let left_node = self.node(left_head.node);
        let right_node = self.node(right_head.node);
        left_head.status == StackStatus::Active
            && right_head.status == StackStatus::Active
            && left_node.state == right_node.state
            && left_node.position.bytes == right_node.position.bytes
            && left_node.error_cost == right_node.error_cost
            && external_scanner_state_eq(
                left_head.last_external_token.as_ref(),
                right_head.last_external_token.as_ref(),
            )
    }

    pub(crate) fn merge(&mut self, left: StackVersion, right: StackVersion) -> bool {
        if !self.can_merge(left, right) {
            return false;
        }
        let left_node = self.heads[left].node;
        let right_node = self.heads[right].node;
        let links: SmallVec<[StackLink; 2]> =
            self.node(right_node).links.iter().cloned().collect();
        for link in links {
            self.node_add_link(left_node, link);
        }
        if self.node(left_node).state == ERROR_STATE {
            self.heads[left].node_count_at_last_error = self.node(left_node).node_count;
        }
        self.remove_version(right);
        true
    }

    // -- status -------------------------------------------------------------

    pub(crate) fn halt(&mut self, version: StackVersion) {
        self.heads[version].status = StackStatus::Halted;
    }

    pub(crate) fn pause(&mut self, version: StackVersion, lookahead: Subtree) {
        let node_count = self.node(self.heads[version].node).node_count;
        let head = &mut self.heads[version];
        head.status = StackStatus::Paused;
        head.lookahead_when_paused = Some(lookahead);
        head.node_count_at_last_error = node_count;
    }

    pub(crate) fn resume(&mut self, version: StackVersion) -> Option<Subtree> {
        let head = &mut self.heads[version];
        debug_assert!(head.status == StackStatus::Paused);
        head.status = StackStatus::Active;
        head.lookahead_when_paused.take()
    }

    pub(crate) fn is_active(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Active
    }

    pub(crate) fn is_paused(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Paused
    }

    pub(crate) fn is_halted(&self, version: StackVersion) -> bool {
        self.heads[version].status == StackStatus::Halted
    }

    /// Drop every version and return to a single head at the initial state.
    pub(crate) fn clear(&mut self) {
        self.retain_node(self.base_node);
        while let Some(head) = self.heads.pop() {
            self.release_head(head);
        }
        self.heads.push(StackHead {
            node: self.base_node,
            summary: None,
            node_count_at_last_error: 0,
            last_external_token: None,
            lookahead_when_paused: None,
            status: StackStatus::Active,
        });
    }

    // -- debugging ----------------------------------------------------------

    /// Dump the stack graph in DOT format.
    pub(crate) fn print_dot_graph(&self, language: &Language, out: &mut dyn io::Write) {
        let _ = writeln!(out, "digraph stack {{");
        let _ = writeln!(out, "rankdir=\"RL\";");
        let _ = writeln!(out, "edge [arrowhead=none]");

        let mut visited: Vec<NodeId> = Vec::new();
        let mut frontier: Vec<NodeId> = Vec::new();

        for (i, head) in self.heads.iter().enumerate() {
            if head.status == StackStatus::Halted {
                continue;
            }
            let _ = writeln!(out, "node_head_{i} [shape=none, label=\"\"]");
            let _ = write!(out, "node_head_{i} -> node_{} [", head.node);
            if head.status == StackStatus::Paused {
                let _ = write!(out, "color=red ");
            }
            let _ = writeln!(out, "label={i}, fontcolor=blue, weight=10000]");
            frontier.push(head.node);
        }

        while let Some(id) = frontier.pop() {
            if visited.contains(&id) {
                continue;
            }
            visited.push(id);
            let node = self.node(id);
            if node.state == ERROR_STATE {
                let _ = write!(out, "node_{id} [label=\"?\"");
            } else {
                let _ = write!(out, "node_{id} [label=\"{}\"", node.state);
            }
            let _ = writeln!(
                out,
                " tooltip=\"position: {},{}\nnode_count: {}\nerror_cost: {}\ndynamic_precedence: {}\"];",
                node.position.extent.row + 1,
                node.position.extent.column,
                node.node_count,
                node.error_cost,
                node.dynamic_precedence,
            );
            for link in &node.links {
                let _ = write!(out, "node_{id} -> node_{} [", link.node);
                if link.is_pending {
                    let _ = write!(out, "style=dashed ");
                }
                match &link.subtree {
                    Some(subtree) => {
                        let _ = write!(
                            out,
                            "label=\"{}\" labeltooltip=\"error_cost: {}\"",
                            language.symbol_name(subtree.symbol()),
                            subtree.error_cost(),
                        );
                    }
                    None => {
                        let _ = write!(out, "color=red");
                    }
                }
                let _ = writeln!(out, "];");
                frontier.push(link.node);
            }
        }

        let _ = writeln!(out, "}}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{LanguageBuilder, Symbol};
    use crate::point::Point;
    use crate::subtree::SubtreePool;

    fn fixture() -> (Language, SubtreePool, Symbol, Symbol) {
        let mut builder = LanguageBuilder::new("stack-tests");
        let a = builder.token("a");
        let b = builder.token("b");
        (builder.build(), SubtreePool::new(), a, b)
    }

    fn leaf(pool: &SubtreePool, language: &Language, symbol: Symbol, bytes: u32) -> Subtree {
        pool.new_leaf(
            symbol,
            Length::ZERO,
            Length::new(bytes, Point::new(0, bytes)),
            0,
            1,
            false,
            false,
            language,
        )
    }

    #[test]
    fn push_advances_position_and_state() {
        let (language, pool, a, b) = fixture();
        let mut stack = Stack::new();
        assert_eq!(stack.state(0), 1);
        stack.push(0, Some(leaf(&pool, &language, a, 2)), false, 3);
        stack.push(0, Some(leaf(&pool, &language, b, 4)), false, 4);
        assert_eq!(stack.state(0), 4);
        assert_eq!(stack.position(0).bytes, 6);
    }

    #[test]
    fn pop_count_returns_subtrees_in_source_order() {
        let (language, pool, a, b) = fixture();
        let mut stack = Stack::new();
        stack.push(0, Some(leaf(&pool, &language, a, 1)), false, 2);
        stack.push(0, Some(leaf(&pool, &language, b, 1)), false, 3);

        let slices = stack.pop_count(0, 2);
        assert_eq!(slices.len(), 1);
        let symbols: Vec<Symbol> = slices[0].subtrees.iter().map(Subtree::symbol).collect();
        assert_eq!(symbols, vec![a, b]);
        assert_eq!(stack.state(slices[0].version), 1);
    }

    #[test]
    fn extras_do_not_count_toward_pops() {
        let (language, pool, a, b) = fixture();
        let mut stack = Stack::new();
        stack.push(0, Some(leaf(&pool, &language, a, 1)), false, 2);
        let mut extra = leaf(&pool, &language, b, 1);
        extra.make_mut().extra = true;
        stack.push(0, Some(extra), false, 2);

        let slices = stack.pop_count(0, 1);
        assert_eq!(slices.len(), 1);
        // The pop crosses the extra but still collects it.
        assert_eq!(slices[0].subtrees.len(), 2);
        assert_eq!(slices[0].subtrees[0].symbol(), a);
    }

    #[test]
    fn equal_versions_merge() {
        let (language, pool, a, _) = fixture();
        let mut stack = Stack::new();
        stack.push(0, Some(leaf(&pool, &language, a, 1)), false, 2);
        let copy = stack.copy_version(0);
        assert_eq!(stack.version_count(), 2);
        assert!(stack.can_merge(0, copy));
        assert!(stack.merge(0, copy));
        assert_eq!(stack.version_count(), 1);
    }

    #[test]
    fn pause_and_resume_round_trip_the_lookahead() {
        let (language, pool, a, _) = fixture();
        let mut stack = Stack::new();
        let lookahead = leaf(&pool, &language, a, 1);
        stack.pause(0, lookahead.clone());
        assert!(stack.is_paused(0));
        assert!(!stack.is_active(0));
        let resumed = stack.resume(0);
        assert!(resumed.is_some_and(|tree| tree.ptr_eq(&lookahead)));
        assert!(stack.is_active(0));
    }

    #[test]
    fn summary_depth_is_capped() {
        let (language, pool, a, _) = fixture();
        let mut stack = Stack::new();
        for i in 0..8 {
            stack.push(0, Some(leaf(&pool, &language, a, 1)), false, 2 + i);
        }
        stack.record_summary(0, 3);
        let summary = stack.summary(0).expect("summary was just recorded");
        assert!(summary.iter().all(|entry| entry.depth <= 3));
        assert!(summary.iter().any(|entry| entry.state == 9));
    }

    #[test]
    fn clear_returns_to_the_initial_state() {
        let (language, pool, a, _) = fixture();
        let mut stack = Stack::new();
        stack.push(0, Some(leaf(&pool, &language, a, 1)), false, 2);
        stack.copy_version(0);
        stack.clear();
        assert_eq!(stack.version_count(), 1);
        assert_eq!(stack.state(0), 1);
        assert_eq!(stack.position(0).bytes, 0);
    }
}
