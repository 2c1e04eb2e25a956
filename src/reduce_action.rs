//! De-duplicating accumulator for the reductions discovered while scanning a
//! state's actions during error handling.

use smallvec::SmallVec;

use crate::language::Symbol;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReduceAction {
    pub(crate) count: u32,
    pub(crate) symbol: Symbol,
    pub(crate) dynamic_precedence: i32,
    pub(crate) production_id: u16,
}

#[derive(Default)]
pub(crate) struct ReduceActionSet {
    actions: SmallVec<[ReduceAction; 4]>,
}

impl ReduceActionSet {
    /// Add an action unless an equivalent `(symbol, count)` pair is present.
    pub(crate) fn add(&mut self, new_action: ReduceAction) {
        let duplicate = self
            .actions
            .iter()
            .any(|action| action.symbol == new_action.symbol && action.count == new_action.count);
        if !duplicate {
            self.actions.push(new_action);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.actions.clear();
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ReduceAction> {
        self.actions.iter()
    }

    pub(crate) fn take(&mut self) -> SmallVec<[ReduceAction; 4]> {
        std::mem::take(&mut self.actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_symbol_and_count_pairs_collapse() {
        let mut set = ReduceActionSet::default();
        let action = ReduceAction {
            count: 2,
            symbol: 7,
            dynamic_precedence: 0,
            production_id: 0,
        };
        set.add(action);
        set.add(ReduceAction {
            dynamic_precedence: 5,
            ..action
        });
        set.add(ReduceAction { count: 3, ..action });
        assert_eq!(set.iter().count(), 2);
    }
}
