//! Error-cost constants shared by the subtree, stack, and parser modules.
//!
//! Costs accumulate on subtrees and stack versions as recovery decisions are
//! made; smaller is better. The relative magnitudes matter more than the
//! absolute values: skipping a whole line is worse than skipping a character,
//! and entering recovery at all carries a large flat penalty so that clean
//! parses always win.

use crate::language::StateId;

pub const ERROR_STATE: StateId = 0;
pub const ERROR_COST_PER_RECOVERY: u32 = 500;
pub const ERROR_COST_PER_MISSING_TREE: u32 = 110;
pub const ERROR_COST_PER_SKIPPED_TREE: u32 = 100;
pub const ERROR_COST_PER_SKIPPED_LINE: u32 = 30;
pub const ERROR_COST_PER_SKIPPED_CHAR: u32 = 1;
