//! The value graph: values, uses, and the arena that owns them (§4.2).
//!
//! Grounded on the arena/index split used by Cretonne's `DataFlowGraph`
//! (`examples/other_examples/77d063a1_xtuc-wasmtime__lib-cretonne-src-ir-dfg.rs.rs`):
//! a value's identity is a stable index into a per-unit arena rather than a
//! pointer, which sidesteps the cyclic-ownership problem §9 calls out
//! (blocks reference terminator instructions that reference blocks back)
//! without reaching for `Rc`/`Weak`.
//!
//! Every `const` instruction's invariant-2 dominance requirement ("every
//! use of a value defined by an instruction `d` is dominated by `d`")
//! applies identically to literal constants, so this crate represents §3's
//! `Constant` value variant as the result of a `const` instruction
//! ([`crate::inst::Inst::ConstInt`] and friends) rather than as a separate
//! storage class — one production site per value, no exceptions.

use std::fmt;

use crate::block::BlockId;
use crate::inst::InstId;
use crate::ty::Type;

/// Identity of a value within its owning [`crate::unit::Unit`]. Per §5,
/// identities are unique within their containing module; pairing a
/// `ValueId` with its unit's name gives that module-wide identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ValueId(pub(crate) u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// What kind of node a value is (§3's `Value` variants, with `Constant`
/// folded into `Inst` — see the module doc comment).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ValueKind {
    /// A unit input or output, identified by its position in the signature.
    Param(u16),
    /// The `Label`-typed value identifying a basic block.
    Block(BlockId),
    /// The result of an instruction (including `const` instructions).
    Inst(InstId),
    /// Names a unit to instantiate, used only as the first operand of an
    /// `inst` instruction inside an entity.
    UnitRef(String),
}

/// A directed edge from a user (an instruction) to a used value, labeled
/// with the operand position (§3 `Use`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Use {
    pub user: InstId,
    pub position: u16,
}

/// The shared header every value carries, regardless of kind (§9: "common
/// fields... go in a shared header").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValueData {
    pub(crate) kind: ValueKind,
    pub(crate) ty: Type,
    pub(crate) name: Option<String>,
    pub(crate) uses: Vec<Use>,
}

impl ValueData {
    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    pub fn is_unused(&self) -> bool {
        self.uses.is_empty()
    }
}

/// Owns every value created inside one [`crate::unit::Unit`]. Slots are
/// tombstoned (set to `None`) rather than compacted on removal so that
/// existing `ValueId`s never dangle into a different value.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ValueArena {
    slots: Vec<Option<ValueData>>,
}

impl ValueArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn alloc(&mut self, data: ValueData) -> ValueId {
        let id = ValueId(self.slots.len() as u32);
        self.slots.push(Some(data));
        id
    }

    pub fn get(&self, id: ValueId) -> Option<&ValueData> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ValueId) -> Option<&mut ValueData> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    pub fn is_live(&self, id: ValueId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn free(&mut self, id: ValueId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    /// Iterate all live `(ValueId, &ValueData)` pairs in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (ValueId, &ValueData)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|d| (ValueId(i as u32), d)))
    }

    pub(crate) fn add_use(&mut self, used: ValueId, user: InstId, position: u16) {
        if let Some(data) = self.get_mut(used) {
            data.uses.push(Use { user, position });
        }
    }

    pub(crate) fn remove_use(&mut self, used: ValueId, user: InstId, position: u16) {
        if let Some(data) = self.get_mut(used) {
            if let Some(idx) = data
                .uses
                .iter()
                .position(|u| u.user == user && u.position == position)
            {
                data.uses.remove(idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(ty: Type) -> ValueData {
        ValueData { kind: ValueKind::Param(0), ty, name: None, uses: Vec::new() }
    }

    #[test]
    fn alloc_assigns_stable_ids() {
        let mut arena = ValueArena::new();
        let a = arena.alloc(dummy(Type::int(32)));
        let b = arena.alloc(dummy(Type::int(1)));
        assert_ne!(a, b);
        assert_eq!(arena.get(a).unwrap().ty(), &Type::int(32));
        assert_eq!(arena.get(b).unwrap().ty(), &Type::int(1));
    }

    #[test]
    fn free_tombstones_without_shifting_other_ids() {
        let mut arena = ValueArena::new();
        let a = arena.alloc(dummy(Type::int(32)));
        let b = arena.alloc(dummy(Type::int(1)));
        arena.free(a);
        assert!(!arena.is_live(a));
        assert!(arena.is_live(b));
    }

    #[test]
    fn use_list_consistency() {
        let mut arena = ValueArena::new();
        let v = arena.alloc(dummy(Type::int(32)));
        let user = InstId::from_raw(7);
        arena.add_use(v, user, 0);
        assert_eq!(arena.get(v).unwrap().uses(), &[Use { user, position: 0 }]);
        arena.remove_use(v, user, 0);
        assert!(arena.get(v).unwrap().is_unused());
    }
}
