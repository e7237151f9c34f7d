//! Constant folding (`cf`, ambient pass per §4.6's pipeline table).
//!
//! Rather than pattern-matching two constant operands and splicing a new
//! constant into an instruction vector by hand, this builds the folded
//! constant and lets [`crate::unit::Unit::replace_all_uses_with`] retarget
//! every use before the original instruction is cleaned up by `dce`.

use crate::inst::{BinaryOp, Inst};
use crate::module::Module;
use crate::pass::{Pass, PassOutcome, PassSignature};
use crate::unit::{Unit, UnitKind};

pub struct ConstFoldPass;

impl Pass for ConstFoldPass {
    fn name(&self) -> &'static str {
        "cf"
    }

    fn signature(&self) -> PassSignature {
        PassSignature::default()
    }

    fn run(&self, module: &mut Module) -> PassOutcome {
        let mut changed = false;
        let names: Vec<String> = module.unit_names().map(|n| n.to_string()).collect();
        for name in names {
            let Some(unit) = module.unit_mut(&name) else { continue };
            if matches!(unit.kind(), UnitKind::Declaration) {
                continue;
            }
            changed |= fold_unit(unit);
        }
        PassOutcome::Applied { changed }
    }
}

fn fold_unit(unit: &mut Unit) -> bool {
    let mut changed = false;
    loop {
        let Some((site, folded)) = find_foldable(unit) else { break };
        let block = unit.inst(site).and_then(|d| d.block());
        let replacement = match folded {
            FoldedConst::Int { width, value } => unit.build_const_int(block, width, value),
        };
        let Ok(replacement) = replacement else { break };
        let Some(original_result) = unit.inst(site).and_then(|d| d.result()) else { break };
        if unit.replace_all_uses_with(original_result, replacement).is_err() {
            break;
        }
        // Erase the now-unused original so the next scan does not refold it.
        unit.erase_if_unused(site);
        changed = true;
    }
    changed
}

enum FoldedConst {
    Int { width: u32, value: i64 },
}

fn find_foldable(unit: &Unit) -> Option<(crate::inst::InstId, FoldedConst)> {
    for (id, data) in unit.insts().iter() {
        let Inst::Binary { op, lhs, rhs } = data.inst() else { continue };
        let Some(a) = const_int_of(unit, *lhs) else { continue };
        let Some(b) = const_int_of(unit, *rhs) else { continue };
        if a.0 != b.0 {
            continue;
        }
        let width = a.0;
        let folded = match op {
            BinaryOp::Add => a.1.wrapping_add(b.1),
            BinaryOp::Sub => a.1.wrapping_sub(b.1),
            BinaryOp::Mul => a.1.wrapping_mul(b.1),
            BinaryOp::And => a.1 & b.1,
            BinaryOp::Or => a.1 | b.1,
            BinaryOp::Xor => a.1 ^ b.1,
            _ => continue,
        };
        return Some((id, FoldedConst::Int { width, value: folded }));
    }
    None
}

fn const_int_of(unit: &Unit, value: crate::value::ValueId) -> Option<(u32, i64)> {
    let data = unit.value(value)?;
    let crate::value::ValueKind::Inst(inst_id) = data.kind() else { return None };
    match unit.inst(*inst_id)?.inst() {
        Inst::ConstInt { width, value } => Some((*width, *value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::Type;
    use crate::unit::Signature;

    #[test]
    fn folds_add_of_two_constants() {
        let mut module = Module::new();
        let f = module.declare_unit("u", UnitKind::Function, Signature::new(vec![], vec![Type::int(32)])).unwrap();
        let entry = f.append_block().unwrap();
        let a = f.build_const_int(Some(entry), 32, 2).unwrap();
        let b = f.build_const_int(Some(entry), 32, 3).unwrap();
        let sum = f.build_binary(Some(entry), BinaryOp::Add, a, b).unwrap();
        f.build_ret(entry, vec![sum]).unwrap();

        let outcome = ConstFoldPass.run(&mut module);
        assert!(outcome.changed());
        let u = module.unit("u").unwrap();
        assert!(!u.values().is_live(sum), "folded add should be erased once unused");
        let ret_id = u.block(entry).unwrap().terminator(u.insts()).unwrap();
        let crate::inst::Inst::Ret { values } = u.inst(ret_id).unwrap().inst() else { panic!() };
        assert_ne!(values[0], sum);
    }
}
