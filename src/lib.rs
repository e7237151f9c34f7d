//! Typed SSA intermediate representation for hardware description.
//!
//! The IR sits between a front-end elaborator and backend code generators:
//! a [`Module`] owns named [`Unit`]s (functions, processes, entities, and
//! external declarations), each holding its own value/use graph. Passes
//! (see [`pass`] and [`passes`]) transform and verify a module in place;
//! [`verify::verify_module`] is the library's non-fatal diagnostic pass.

pub mod block;
pub mod dominance;
pub mod error;
pub mod inst;
pub mod module;
pub mod pass;
pub mod passes;
pub mod ty;
pub mod unit;
pub mod value;
pub mod verify;

pub use block::{BlockData, BlockId};
pub use error::{ConstructError, PassError};
pub use inst::{BinaryOp, CompareOp, FieldIndex, Inst, InstId, LogicValue, ShiftOp};
pub use module::Module;
pub use pass::{Pass, PassManager, PassOutcome, PassSignature};
pub use ty::{Type, TypeTable};
pub use unit::{Param, Signature, Unit, UnitKind};
pub use value::{ValueId, ValueKind};
pub use verify::{verify_module, Diagnostic};

/// Re-exports the pieces most call sites need, following the convention of
/// the other example crates in the surrounding toolchain.
pub mod prelude {
    pub use crate::block::BlockId;
    pub use crate::inst::{BinaryOp, CompareOp, FieldIndex, Inst, InstId, LogicValue, ShiftOp};
    pub use crate::module::Module;
    pub use crate::pass::{Pass, PassManager, PassOutcome};
    pub use crate::passes::{constfold::ConstFoldPass, dce::DcePass, deseq::DeseqPass, proclower::ProcLowerPass, VerifyPass};
    pub use crate::ty::Type;
    pub use crate::unit::{Param, Signature, Unit, UnitKind};
    pub use crate::value::ValueId;
    pub use crate::verify::{verify_module, Diagnostic};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn builds_and_verifies_a_trivial_function() {
        let mut module = Module::new();
        let f = module.declare_unit("id", UnitKind::Function, Signature::new(vec![Param { name: None, ty: Type::int(32) }], vec![Type::int(32)])).unwrap();
        let entry = f.append_block().unwrap();
        let x = f.params()[0];
        f.build_ret(entry, vec![x]).unwrap();

        let diagnostics = verify_module(&module);
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
    }
}
