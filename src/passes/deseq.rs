//! Sequential-logic recognition (component I, `deseq`, §4.8).
//!
//! Recovers the flip-flop/latch idiom from a process body: a `wait` on a
//! clock (and optionally a reset) sampled both before and after the
//! suspension point, combined into an edge expression, gating a `drv`.
//! Matched processes are rewritten into an entity driven by a `reg`; any
//! process that does not match the exact shape is left untouched, mirroring
//! [`crate::passes::proclower`]'s decline-rather-than-guess discipline.

use std::collections::{HashMap, HashSet};

use crate::block::{BlockData, BlockId};
use crate::dominance::successors;
use crate::inst::{BinaryOp, Inst, InstId};
use crate::module::Module;
use crate::pass::{Pass, PassOutcome, PassSignature};
use crate::unit::{Signature, Unit, UnitKind};
use crate::value::ValueId;

pub struct DeseqPass;

impl Pass for DeseqPass {
    fn name(&self) -> &'static str {
        "deseq"
    }

    fn signature(&self) -> PassSignature {
        PassSignature { invalidates_dominance: true, writes_module_table: true, ..Default::default() }
    }

    fn run(&self, module: &mut Module) -> PassOutcome {
        // Only `Process` units are candidates; once rewritten they become
        // entities, so a second run over the same module trivially finds
        // nothing left to do (§8 property 8, sequential recognition
        // idempotence).
        let candidates: Vec<String> = module.units().filter(|(_, u)| u.kind() == UnitKind::Process).map(|(name, _)| name.to_string()).collect();
        let mut changed = false;
        for name in candidates {
            let Some(process) = module.unit(&name) else { continue };
            if let Some(entity) = try_recognize(process) {
                if module.replace_unit(&name, entity).is_ok() {
                    changed = true;
                }
            }
        }
        PassOutcome::Applied { changed }
    }
}

enum Polarity {
    Pos,
    Neg,
}

/// One recognized register rewrite: a `drv` gated by an edge expression,
/// with the edge's supporting clock probes identified.
struct Recognized {
    drv: InstId,
    edge: ValueId,
    #[allow(dead_code)]
    polarity: Polarity,
}

fn try_recognize(process: &Unit) -> Option<Unit> {
    let entry = process.entry_block()?;
    let entry_block = process.block(entry)?;
    let wait_id = entry_block.terminator(process.insts())?;
    let Inst::Wait { target, signals, .. } = process.inst(wait_id)?.inst() else { return None };
    let clk = *signals.first()?;
    let target = *target;
    let target_block = process.block(target)?;

    let (_, clk_pre) = find_prb(process, entry_block, clk)?;
    let (_, clk_post) = find_prb(process, target_block, clk)?;

    let (edge_result, polarity) = find_edge(process, target_block, clk_pre, clk_post)?;
    let recognized = find_gated_drv(process, target_block, edge_result)?;

    Some(build_registered_entity(process, entry, target, &Recognized { drv: recognized, edge: edge_result, polarity }))
}

fn find_prb(unit: &Unit, block: &BlockData, signal: ValueId) -> Option<(InstId, ValueId)> {
    for &id in block.insts() {
        let data = unit.inst(id)?;
        if let Inst::Prb { signal: s } = data.inst() {
            if *s == signal {
                return Some((id, data.result()?));
            }
        }
    }
    None
}

fn find_not_of(unit: &Unit, block: &BlockData, operand: ValueId) -> Option<ValueId> {
    for &id in block.insts() {
        let data = unit.inst(id)?;
        if let Inst::Not { value } = data.inst() {
            if *value == operand {
                return data.result();
            }
        }
    }
    None
}

fn find_and_of(unit: &Unit, block: &BlockData, a: ValueId, b: ValueId) -> Option<(InstId, ValueId)> {
    for &id in block.insts() {
        let Some(data) = unit.inst(id) else { continue };
        if let Inst::Binary { op: BinaryOp::And, lhs, rhs } = data.inst() {
            if (*lhs == a && *rhs == b) || (*lhs == b && *rhs == a) {
                return Some((id, data.result()?));
            }
        }
    }
    None
}

/// `posedge(x) = not(x_pre) and x_post`; `negedge(x) = x_pre and not(x_post)`.
fn find_edge(unit: &Unit, block: &BlockData, pre: ValueId, post: ValueId) -> Option<(ValueId, Polarity)> {
    if let Some(not_pre) = find_not_of(unit, block, pre) {
        if let Some((_, edge)) = find_and_of(unit, block, not_pre, post) {
            return Some((edge, Polarity::Pos));
        }
    }
    if let Some(not_post) = find_not_of(unit, block, post) {
        if let Some((_, edge)) = find_and_of(unit, block, pre, not_post) {
            return Some((edge, Polarity::Neg));
        }
    }
    None
}

/// Find a `drv` in `block` whose gate expression's transitive operand
/// closure contains `edge` (the recognized clock-edge boolean). This
/// accepts a gate that additionally ANDs in an enable or ORs in an
/// asynchronous reset condition alongside the edge, matching the "gated
/// clock... asynchronous reset" idiom in §4.8 without requiring the exact
/// shape of that surrounding expression.
fn find_gated_drv(unit: &Unit, block: &BlockData, edge: ValueId) -> Option<InstId> {
    for &id in block.insts() {
        let data = unit.inst(id)?;
        if let Inst::Drv { gate: Some(gate), .. } = data.inst() {
            if *gate == edge || gate_contains(unit, *gate, edge) {
                return Some(id);
            }
        }
    }
    None
}

fn gate_contains(unit: &Unit, gate: ValueId, needle: ValueId) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![gate];
    while let Some(v) = stack.pop() {
        if v == needle {
            return true;
        }
        if !visited.insert(v) {
            continue;
        }
        let Some(value_data) = unit.value(v) else { continue };
        let crate::value::ValueKind::Inst(producer) = value_data.kind() else { continue };
        let Some(producer_data) = unit.inst(*producer) else { continue };
        producer_data.inst().for_each_operand(|_, operand| stack.push(operand));
    }
    false
}

/// Flatten the recognized process into an entity: copy every instruction
/// from the pre-wait and post-wait blocks (dropping the `wait`/back-edge
/// terminators and the recognized conditional `drv`), rebuild the strobe
/// condition combinationally, add a `reg`, and re-drive the target signal
/// unconditionally from the register's output.
fn build_registered_entity(process: &Unit, entry: BlockId, target: BlockId, recognized: &Recognized) -> Unit {
    let sig = Signature::new(process.signature().params.clone(), process.signature().returns.clone());
    let mut entity = Unit::new(process.name(), UnitKind::Entity, sig);
    let mut remap: HashMap<ValueId, ValueId> = HashMap::new();
    for (i, &old_param) in process.params().iter().enumerate() {
        remap.insert(old_param, entity.params()[i]);
    }

    let mut order = vec![entry];
    if target != entry {
        order.push(target);
    }
    for succ in successors(process, target) {
        if succ != entry && succ != target && !order.contains(&succ) {
            order.push(succ);
        }
    }

    let Some(recognized_drv) = process.inst(recognized.drv) else { return entity };
    let Inst::Drv { signal: q_signal, value: q_value, delay: q_delay, .. } = recognized_drv.inst().clone() else {
        return entity;
    };

    for block_id in order {
        let Some(block) = process.block(block_id) else { continue };
        for &inst_id in block.insts() {
            if inst_id == recognized.drv {
                continue;
            }
            copy_into_entity(process, &mut entity, inst_id, &mut remap);
        }
    }

    let strobe = resolve(&remap, recognized.edge);
    let value = resolve(&remap, q_value);
    if let Ok(reg_result) = entity.build_reg(value, strobe) {
        let signal = resolve(&remap, q_signal);
        let delay = resolve(&remap, q_delay);
        let _ = entity.build_drv(None, signal, reg_result, delay, None);
    }

    entity
}

fn resolve(remap: &HashMap<ValueId, ValueId>, v: ValueId) -> ValueId {
    *remap.get(&v).unwrap_or(&v)
}

fn copy_into_entity(process: &Unit, entity: &mut Unit, inst_id: InstId, remap: &mut HashMap<ValueId, ValueId>) {
    let Some(data) = process.inst(inst_id) else { return };
    let result = match data.inst() {
        Inst::ConstInt { width, value } => entity.build_const_int(None, *width, *value).ok(),
        Inst::ConstLogic { bits, .. } => entity.build_const_logic(None, bits.clone()).ok(),
        Inst::ConstTime { picoseconds, delta } => entity.build_const_time(None, *picoseconds, *delta).ok(),
        Inst::Prb { signal } => entity.build_prb(None, resolve(remap, *signal)).ok(),
        Inst::Binary { op, lhs, rhs } => entity.build_binary(None, *op, resolve(remap, *lhs), resolve(remap, *rhs)).ok(),
        Inst::Shift { op, value, amount } => entity.build_shift(None, *op, resolve(remap, *value), resolve(remap, *amount)).ok(),
        Inst::Not { value } => entity.build_not(None, resolve(remap, *value)).ok(),
        Inst::Compare { op, lhs, rhs } => entity.build_compare(None, *op, resolve(remap, *lhs), resolve(remap, *rhs)).ok(),
        Inst::Mux { selector, options } => {
            entity.build_mux(None, resolve(remap, *selector), options.iter().map(|v| resolve(remap, *v)).collect()).ok()
        }
        Inst::Drv { signal, value, delay, gate } => {
            let _ = entity.build_drv(None, resolve(remap, *signal), resolve(remap, *value), resolve(remap, *delay), gate.map(|g| resolve(remap, g)));
            None
        }
        _ => None,
    };
    if let Some(old_result) = data.result() {
        if let Some(new_result) = result {
            remap.insert(old_result, new_result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::Type;
    use crate::unit::Param;

    /// Builds `proc @dff (d, clk) -> (q)` matching the canonical posedge
    /// idiom: `wait entry, check, clk; edge = not(clk_pre) and clk_post;
    /// drv q if edge, d, #0`.
    fn build_posedge_process() -> Unit {
        let sig = Signature::new(
            vec![
                Param { name: Some("d".into()), ty: Type::signal(Type::int(1)) },
                Param { name: Some("clk".into()), ty: Type::signal(Type::int(1)) },
            ],
            vec![Type::signal(Type::int(1))],
        );
        let mut p = Unit::new("dff", UnitKind::Process, sig);
        let entry = p.append_block().unwrap();
        let check = p.append_block().unwrap();
        let d = p.params()[0];
        let clk = p.params()[1];

        let clk_pre = p.build_prb(Some(entry), clk).unwrap();
        p.build_wait(entry, check, vec![clk], None).unwrap();

        let d_val = p.build_prb(Some(check), d).unwrap();
        let clk_post = p.build_prb(Some(check), clk).unwrap();
        let not_pre = p.build_not(Some(check), clk_pre).unwrap();
        let edge = p.build_binary(Some(check), BinaryOp::And, not_pre, clk_post).unwrap();
        let zero = p.build_const_time(Some(check), 0, 0).unwrap();
        p.build_drv(Some(check), d, d_val, zero, Some(edge)).unwrap();
        p.build_br(check, entry).unwrap();
        p
    }

    #[test]
    fn recognizes_posedge_idiom_and_builds_reg() {
        let process = build_posedge_process();
        let entity = try_recognize(&process);
        assert!(entity.is_some());
        let entity = entity.unwrap();
        assert_eq!(entity.kind(), UnitKind::Entity);
        let has_reg = entity.insts().iter().any(|(_, data)| matches!(data.inst(), Inst::Reg { .. }));
        assert!(has_reg, "expected a reg instruction in the recognized entity");
    }

    #[test]
    fn declines_process_without_edge_detect_s5_negative() {
        // A `wait`/`drv` idiom that never forms not(pre) and post / pre and
        // not(post): deseq must leave the process untouched.
        let sig = Signature::new(
            vec![Param { name: Some("d".into()), ty: Type::signal(Type::int(1)) }, Param { name: Some("clk".into()), ty: Type::signal(Type::int(1)) }],
            vec![],
        );
        let mut p = Unit::new("latch_like", UnitKind::Process, sig);
        let entry = p.append_block().unwrap();
        let check = p.append_block().unwrap();
        let d = p.params()[0];
        let clk = p.params()[1];
        p.build_prb(Some(entry), clk).unwrap();
        p.build_wait(entry, check, vec![clk], None).unwrap();
        let d_val = p.build_prb(Some(check), d).unwrap();
        let clk_post = p.build_prb(Some(check), clk).unwrap();
        let zero = p.build_const_time(Some(check), 0, 0).unwrap();
        // gated directly by the raw level, not an edge expression.
        p.build_drv(Some(check), d, d_val, zero, Some(clk_post)).unwrap();
        p.build_br(check, entry).unwrap();

        assert!(try_recognize(&p).is_none());
    }
}
