//! Dead-code elimination (`dce`, ambient pass per §4.6's pipeline table).
//!
//! Rather than rebuilding instruction vectors by hand, this operates
//! directly over the value/use graph via [`crate::unit::Unit::
//! erase_if_unused`], the primitive §4.2 provides for exactly this purpose.

use crate::inst::Inst;
use crate::module::Module;
use crate::pass::{Pass, PassOutcome, PassSignature};
use crate::unit::UnitKind;

pub struct DcePass;

impl Pass for DcePass {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn signature(&self) -> PassSignature {
        PassSignature { invalidates_dominance: false, ..Default::default() }
    }

    fn run(&self, module: &mut Module) -> PassOutcome {
        let mut changed = false;
        let names: Vec<String> = module.unit_names().map(|n| n.to_string()).collect();
        for name in names {
            let Some(unit) = module.unit_mut(&name) else { continue };
            if matches!(unit.kind(), UnitKind::Declaration) {
                continue;
            }
            let candidates: Vec<_> = unit
                .insts()
                .iter()
                .filter(|(_, data)| matches!(data.inst(), Inst::Nop) || is_unused_pure(unit, data.result()))
                .map(|(id, _)| id)
                .collect();
            for id in candidates {
                let before = unit.insts().is_live(id);
                unit.erase_if_unused(id);
                changed |= before && !unit.insts().is_live(id);
            }
        }
        PassOutcome::Applied { changed }
    }
}

fn is_unused_pure(unit: &crate::unit::Unit, result: Option<crate::value::ValueId>) -> bool {
    match result {
        Some(v) => unit.value(v).map(|d| d.is_unused()).unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::BinaryOp;
    use crate::ty::Type;
    use crate::unit::{Param, Signature, Unit};

    #[test]
    fn removes_unused_pure_instruction() {
        let mut module = Module::new();
        let f = module
            .declare_unit("u", UnitKind::Function, Signature::new(vec![Param { name: None, ty: Type::int(32) }], vec![Type::int(32)]))
            .unwrap();
        let entry = f.append_block().unwrap();
        let x = f.params()[0];
        let dead = f.build_const_int(Some(entry), 32, 1).unwrap();
        let _unused_add = f.build_binary(Some(entry), BinaryOp::Add, x, dead).unwrap();
        f.build_ret(entry, vec![x]).unwrap();

        let outcome = DcePass.run(&mut module);
        assert!(outcome.changed());
        let u: &Unit = module.unit("u").unwrap();
        assert_eq!(u.block(entry).unwrap().insts().len(), 1, "only ret should remain");
    }
}
