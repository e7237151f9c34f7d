//! Basic blocks (§4.4): an ordered sequence of instructions ending in
//! exactly one terminator, used by `Function` and `Process` units.

use std::fmt;

use crate::inst::{InstArena, InstId};
use crate::value::ValueId;

/// Identity of a basic block within its owning unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct BlockId(pub(crate) u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block{}", self.0)
    }
}

/// A block's instruction list and the `Label`-typed value that names it.
///
/// The terminator convention (§4.4) is structural, not a separate field:
/// the last instruction in `insts`, if any it is the terminator *once its
/// own opcode is actually a terminator* (`Inst::is_terminator`) — a block
/// mid-construction can have a non-empty `insts` list with no terminator
/// yet.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BlockData {
    pub(crate) value: Option<ValueId>,
    pub(crate) insts: Vec<InstId>,
}

impl BlockData {
    pub fn value(&self) -> Option<ValueId> {
        self.value
    }

    pub fn insts(&self) -> &[InstId] {
        &self.insts
    }

    /// The block's terminator, looked up against `insts` to confirm the
    /// last instruction's opcode is actually a terminator rather than
    /// merely present.
    pub fn terminator(&self, insts: &InstArena) -> Option<InstId> {
        let last = *self.insts.last()?;
        let data = insts.get(last)?;
        if data.inst().is_terminator() {
            Some(last)
        } else {
            None
        }
    }

    pub fn is_terminated(&self, insts: &InstArena) -> bool {
        self.terminator(insts).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::{Inst, InstData};
    use crate::ty::Type;

    fn arena_with(insts: Vec<Inst>) -> (InstArena, Vec<InstId>) {
        let mut arena = InstArena::new();
        let ids = insts
            .into_iter()
            .map(|inst| arena.alloc(InstData { inst, result: None, result_ty: Type::Void, block: None }))
            .collect();
        (arena, ids)
    }

    #[test]
    fn empty_block_is_not_terminated() {
        let block = BlockData::default();
        let arena = InstArena::new();
        assert!(!block.is_terminated(&arena));
        assert_eq!(block.terminator(&arena), None);
    }

    #[test]
    fn last_instruction_is_the_terminator_only_if_its_opcode_is() {
        let (arena, ids) = arena_with(vec![Inst::ConstInt { width: 1, value: 1 }, Inst::Halt]);
        let block = BlockData { value: None, insts: ids.clone() };
        assert_eq!(block.terminator(&arena), Some(ids[1]));
        assert!(block.is_terminated(&arena));
    }

    #[test]
    fn non_terminator_last_instruction_leaves_block_unterminated() {
        let (arena, ids) = arena_with(vec![Inst::ConstInt { width: 1, value: 1 }, Inst::Not { value: crate::value::ValueId(0) }]);
        let block = BlockData { value: None, insts: ids };
        assert!(!block.is_terminated(&arena));
        assert_eq!(block.terminator(&arena), None);
    }
}
