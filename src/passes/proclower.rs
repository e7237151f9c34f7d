//! Process-lowering (component H, §4.7): rewrite a process whose
//! sensitivity list is complete into a behaviorally equivalent entity.
//!
//! The traversal style (walk the CFG from the entry block, classify each
//! block's role) generalizes a block-discovery pattern built for "build a
//! `ControlFlowGraph`" into "decide whether a process qualifies for
//! lowering and, if so, flatten it".

use std::collections::{HashMap, HashSet};

use crate::block::BlockId;
use crate::dominance::successors;
use crate::inst::{Inst, InstId};
use crate::module::Module;
use crate::pass::{Pass, PassOutcome, PassSignature};
use crate::unit::{Signature, Unit, UnitKind};
use crate::value::{ValueId, ValueKind};

pub struct ProcLowerPass;

impl Pass for ProcLowerPass {
    fn name(&self) -> &'static str {
        "proclower"
    }

    fn signature(&self) -> PassSignature {
        PassSignature { invalidates_dominance: true, writes_module_table: true, ..Default::default() }
    }

    fn run(&self, module: &mut Module) -> PassOutcome {
        let candidates: Vec<String> = module
            .units()
            .filter(|(_, u)| u.kind() == UnitKind::Process)
            .map(|(name, _)| name.to_string())
            .collect();
        let mut changed = false;
        for name in candidates {
            let Some(process) = module.unit(&name) else { continue };
            match try_lower(process) {
                Ok(entity) => {
                    if module.replace_unit(&name, entity).is_ok() {
                        changed = true;
                    }
                }
                Err(_reason) => continue,
            }
        }
        PassOutcome::Applied { changed }
    }
}

#[derive(Debug)]
enum LowerError {
    HasHalt,
    BranchNotToEntry,
    SensitivityIncomplete,
    PersistentLocalState,
}

/// Attempt to lower one process. On success, returns the replacement
/// entity. The caller is responsible for splicing it into the module.
fn try_lower(process: &Unit) -> Result<Unit, LowerError> {
    let entry = process.entry_block().ok_or(LowerError::BranchNotToEntry)?;
    check_terminator_shape(process, entry)?;
    check_sensitivity_completeness(process, entry)?;
    check_no_persistent_state(process, entry)?;
    Ok(build_entity(process, entry))
}

/// Condition 1: the only terminators are `wait` and `br` back to the entry
/// block; any `halt` disqualifies.
fn check_terminator_shape(process: &Unit, entry: BlockId) -> Result<(), LowerError> {
    for (_, block) in process.blocks_in_order() {
        let Some(term) = block.terminator(process.insts()) else { continue };
        let Some(data) = process.inst(term) else { continue };
        match data.inst() {
            Inst::Wait { .. } => {}
            Inst::Br { target } if *target == entry => {}
            Inst::Br { .. } => return Err(LowerError::BranchNotToEntry),
            Inst::Halt => return Err(LowerError::HasHalt),
            Inst::BrCond { .. } | Inst::Ret { .. } => return Err(LowerError::BranchNotToEntry),
            _ => {}
        }
    }
    Ok(())
}

/// Condition 2: every `wait`'s explicit signal list is a superset of the
/// signals actually sampled by `prb` on the paths that reach it (extra
/// listed signals are permitted, per §4.7).
fn check_sensitivity_completeness(process: &Unit, entry: BlockId) -> Result<(), LowerError> {
    let preds = predecessor_map(process, entry);
    for (block_id, block) in process.blocks_in_order() {
        let Some(term) = block.terminator(process.insts()) else { continue };
        let Some(data) = process.inst(term) else { continue };
        let Inst::Wait { signals, .. } = data.inst() else { continue };
        let explicit: HashSet<ValueId> = signals.iter().copied().collect();
        let computed = sampled_signals_reaching(process, entry, block_id, &preds);
        if !computed.is_subset(&explicit) {
            return Err(LowerError::SensitivityIncomplete);
        }
    }
    Ok(())
}

fn predecessor_map(unit: &Unit, entry: BlockId) -> HashMap<BlockId, Vec<BlockId>> {
    let mut preds: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
    for (block, _) in unit.blocks_in_order() {
        for succ in successors(unit, block) {
            preds.entry(succ).or_default().push(block);
        }
    }
    preds.entry(entry).or_default();
    preds
}

/// Walk backward from `target` to `entry` over predecessor edges,
/// collecting every `prb`'d signal found in a visited block.
fn sampled_signals_reaching(unit: &Unit, entry: BlockId, target: BlockId, preds: &HashMap<BlockId, Vec<BlockId>>) -> HashSet<ValueId> {
    let mut sampled = HashSet::new();
    let mut visited = HashSet::new();
    let mut stack = vec![target];
    while let Some(block_id) = stack.pop() {
        if !visited.insert(block_id) {
            continue;
        }
        if let Some(block) = unit.block(block_id) {
            for &inst_id in block.insts() {
                if let Some(Inst::Prb { signal }) = unit.inst(inst_id).map(|d| d.inst().clone()) {
                    sampled.insert(signal);
                }
            }
        }
        if block_id != entry {
            if let Some(ps) = preds.get(&block_id) {
                stack.extend(ps.iter().copied());
            }
        }
    }
    sampled
}

/// Condition 3: no value computed before a `wait` (other than via signal
/// probes) may be consumed after it. Approximated as: every value defined
/// in a block that precedes some `wait` and used in a block dominated by
/// that `wait`'s resume target must itself be a `prb` result (signal
/// probes are the sanctioned channel across the suspension boundary).
fn check_no_persistent_state(process: &Unit, entry: BlockId) -> Result<(), LowerError> {
    let wait_resume_targets: HashSet<BlockId> = process
        .blocks_in_order()
        .filter_map(|(_, block)| block.terminator(process.insts()).and_then(|t| process.inst(t)).map(|d| d.inst().clone()))
        .filter_map(|inst| match inst {
            Inst::Wait { target, .. } => Some(target),
            _ => None,
        })
        .collect();
    if wait_resume_targets.is_empty() {
        return Ok(());
    }
    for (block_id, block) in process.blocks_in_order() {
        if block_id == entry && !wait_resume_targets.contains(&block_id) {
            continue;
        }
        if !wait_resume_targets.contains(&block_id) {
            continue;
        }
        for &inst_id in block.insts() {
            let Some(data) = process.inst(inst_id) else { continue };
            let mut bad = false;
            data.inst().for_each_operand(|_, v| {
                if let Some(value_data) = process.value(v) {
                    if let ValueKind::Inst(producer) = value_data.kind() {
                        let producer_block = process.inst(*producer).and_then(|d| d.block());
                        let crosses_boundary = producer_block.map(|b| !wait_resume_targets.contains(&b) && b != block_id).unwrap_or(false);
                        let is_probe = matches!(process.inst(*producer).map(|d| d.inst().clone()), Some(Inst::Prb { .. }));
                        if crosses_boundary && !is_probe {
                            bad = true;
                        }
                    }
                }
            });
            if bad {
                return Err(LowerError::PersistentLocalState);
            }
        }
    }
    Ok(())
}

/// Flatten the qualifying process into an entity with the same name and
/// port signature (§4.7): every instruction except `wait`/`br` terminators
/// is copied in program order into the entity's flat body; `drv`s become
/// entity-level drivers automatically since `Unit::build_drv` accepts
/// `block: None` uniformly.
fn build_entity(process: &Unit, entry: BlockId) -> Unit {
    let sig = Signature::new(process.signature().params.clone(), process.signature().returns.clone());
    let mut entity = Unit::new(process.name(), UnitKind::Entity, sig);
    let mut remap: HashMap<ValueId, ValueId> = HashMap::new();
    for (i, &old_param) in process.params().iter().enumerate() {
        remap.insert(old_param, entity.params()[i]);
    }

    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![entry];
    while let Some(block_id) = stack.pop() {
        if !visited.insert(block_id) {
            continue;
        }
        order.push(block_id);
        for succ in successors(process, block_id) {
            if !visited.contains(&succ) {
                stack.push(succ);
            }
        }
    }
    order.sort_by_key(|b| b.0);

    for block_id in order {
        let Some(block) = process.block(block_id) else { continue };
        for &inst_id in block.insts() {
            copy_into_entity(process, &mut entity, inst_id, &mut remap);
        }
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
        Inst::Extract { aggregate, index } => entity.build_extract(None, resolve(remap, *aggregate), resolve_field(remap, *index)).ok(),
        Inst::Insert { aggregate, index, value } => {
            entity.build_insert(None, resolve(remap, *aggregate), resolve_field(remap, *index), resolve(remap, *value)).ok()
        }
        // `drv` has no result to remap (§4.3: its type column is `—`).
        Inst::Drv { signal, value, delay, gate } => {
            let _ = entity.build_drv(None, resolve(remap, *signal), resolve(remap, *value), resolve(remap, *delay), gate.map(|g| resolve(remap, g)));
            None
        }
        // `wait`/`br` terminators are dropped per §4.7 ("remove the `wait`
        // and back-edge"); anything else not yet handled is skipped rather
        // than panicking, since a real front-end would not produce it
        // inside a process this pass accepts.
        _ => None,
    };
    if let Some(old_result) = data.result() {
        if let Some(new_result) = result {
            remap.insert(old_result, new_result);
        }
    }
}

fn resolve_field(remap: &HashMap<ValueId, ValueId>, index: crate::inst::FieldIndex) -> crate::inst::FieldIndex {
    match index {
        crate::inst::FieldIndex::Dynamic(v) => crate::inst::FieldIndex::Dynamic(resolve(remap, v)),
        constant => constant,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::Type;
    use crate::unit::Param;

    fn build_complete_process() -> Unit {
        let sig = Signature::new(
            vec![Param { name: Some("a".into()), ty: Type::signal(Type::int(1)) }],
            vec![Type::signal(Type::int(1))],
        );
        let mut p = Unit::new("p", UnitKind::Process, sig);
        let entry = p.append_block().unwrap();
        let check = p.append_block().unwrap();
        let a = p.params()[0];
        p.build_wait(entry, check, vec![a], None).unwrap();
        let sampled = p.build_prb(Some(check), a).unwrap();
        let zero = p.build_const_time(Some(check), 0, 0).unwrap();
        p.build_drv(Some(check), a, sampled, zero, None).unwrap();
        p.build_br(check, entry).unwrap();
        p
    }

    #[test]
    fn lowers_process_with_complete_sensitivity_list() {
        let process = build_complete_process();
        let entity = try_lower(&process);
        assert!(entity.is_ok());
        assert_eq!(entity.unwrap().kind(), UnitKind::Entity);
    }

    #[test]
    fn declines_incomplete_sensitivity_list_s4() {
        // wait lists only %entry-implicit signal set {a}; body also samples
        // a second signal %b that is never listed.
        let sig = Signature::new(
            vec![
                Param { name: Some("a".into()), ty: Type::signal(Type::int(1)) },
                Param { name: Some("b".into()), ty: Type::signal(Type::int(1)) },
            ],
            vec![],
        );
        let mut p = Unit::new("p", UnitKind::Process, sig);
        let entry = p.append_block().unwrap();
        let check = p.append_block().unwrap();
        let a = p.params()[0];
        let b = p.params()[1];
        p.build_wait(entry, check, vec![a], None).unwrap();
        p.build_prb(Some(check), a).unwrap();
        p.build_prb(Some(check), b).unwrap();
        p.build_br(check, entry).unwrap();

        let result = try_lower(&p);
        assert!(matches!(result, Err(LowerError::SensitivityIncomplete)));
    }
}
