//! Dominator trees and instruction-level dominance (§4.5).
//!
//! Implements the Cooper–Harvey–Kennedy iterative algorithm over the
//! block CFG's reverse postorder, the standard fixpoint approach used by
//! compiler verifier passes of this shape and pinned here as the concrete
//! discharge of §4.5's "iterative data-flow on the reverse post-order".

use std::collections::HashMap;

use crate::block::BlockId;
use crate::inst::{Inst, InstId};
use crate::unit::Unit;

/// The dominator tree of one function/process's block CFG.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    entry: BlockId,
    /// Immediate dominator of every reachable block except `entry`.
    idom: HashMap<BlockId, BlockId>,
    rpo: Vec<BlockId>,
    rpo_index: HashMap<BlockId, usize>,
}

pub(crate) fn successors(unit: &Unit, block: BlockId) -> Vec<BlockId> {
    match unit.block(block).and_then(|b| b.terminator(unit.insts())).and_then(|id| unit.inst(id)) {
        Some(data) => match data.inst() {
            Inst::Br { target } => vec![*target],
            Inst::BrCond { then_target, else_target, .. } => vec![*then_target, *else_target],
            Inst::Wait { target, .. } => vec![*target],
            _ => Vec::new(),
        },
        None => Vec::new(),
    }
}

fn reverse_postorder(unit: &Unit, entry: BlockId) -> Vec<BlockId> {
    let mut visited = std::collections::HashSet::new();
    let mut postorder = Vec::new();
    let mut stack = vec![(entry, false)];
    while let Some((block, expanded)) = stack.pop() {
        if expanded {
            postorder.push(block);
            continue;
        }
        if !visited.insert(block) {
            continue;
        }
        stack.push((block, true));
        for succ in successors(unit, block) {
            if !visited.contains(&succ) {
                stack.push((succ, false));
            }
        }
    }
    postorder.reverse();
    postorder
}

impl DominatorTree {
    /// Compute the dominator tree for `unit`, rooted at its entry block.
    /// Returns `None` if the unit has no blocks (e.g. entities, empty
    /// functions).
    pub fn compute(unit: &Unit) -> Option<Self> {
        let entry = unit.entry_block()?;
        let rpo = reverse_postorder(unit, entry);
        let rpo_index: HashMap<BlockId, usize> = rpo.iter().enumerate().map(|(i, b)| (*b, i)).collect();

        let mut preds: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for (block, _) in unit.blocks_in_order() {
            for succ in successors(unit, block) {
                preds.entry(succ).or_default().push(block);
            }
        }

        let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
        idom.insert(entry, entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block in rpo.iter().skip(1) {
                let Some(block_preds) = preds.get(&block) else { continue };
                let mut new_idom: Option<BlockId> = None;
                for &p in block_preds {
                    if !idom.contains_key(&p) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, &rpo_index, cur, p),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom.get(&block) != Some(&new_idom) {
                        idom.insert(block, new_idom);
                        changed = true;
                    }
                }
            }
        }

        Some(DominatorTree { entry, idom, rpo, rpo_index })
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.idom.contains_key(&block)
    }

    /// Blocks in reverse-postorder, for deterministic iteration by callers
    /// (the verifier walks blocks in this order when evaluating dominance).
    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Whether block `a` dominates block `b` (every path from entry to `b`
    /// passes through `a`), inclusive of `a == b`.
    pub fn block_dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.idom.contains_key(&a) || !self.idom.contains_key(&b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            if cur == self.entry {
                return cur == a;
            }
            let next = self.idom[&cur];
            if next == cur {
                return false;
            }
            cur = next;
        }
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.block_dominates(a, b)
    }

    /// Instruction-level dominance (§4.5): `d` dominates `u` iff they are
    /// in the same block and `d` precedes `u`, or `d`'s block strictly
    /// dominates `u`'s block.
    pub fn inst_dominates(&self, unit: &Unit, d_block: BlockId, d: InstId, u_block: BlockId, u: InstId) -> bool {
        if d_block == u_block {
            let Some(block) = unit.block(d_block) else { return false };
            let d_pos = block.insts().iter().position(|i| *i == d);
            let u_pos = block.insts().iter().position(|i| *i == u);
            match (d_pos, u_pos) {
                (Some(dp), Some(up)) => dp <= up,
                _ => false,
            }
        } else {
            self.strictly_dominates(d_block, u_block)
        }
    }
}

/// Cooper–Harvey–Kennedy's `intersect`: walk both candidates toward the
/// root along `idom`, using reverse-postorder numbers as the ancestry
/// comparator, until they meet.
fn intersect(idom: &HashMap<BlockId, BlockId>, rpo_index: &HashMap<BlockId, usize>, mut a: BlockId, mut b: BlockId) -> BlockId {
    while a != b {
        while rpo_index[&a] > rpo_index[&b] {
            a = idom[&a];
        }
        while rpo_index[&b] > rpo_index[&a] {
            b = idom[&b];
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Signature, UnitKind};

    #[test]
    fn diamond_cfg_dominance() {
        // entry -> (then | else) -> merge
        let mut f = Unit::new("diamond", UnitKind::Function, Signature::new(vec![], vec![]));
        let entry = f.append_block().unwrap();
        let then_b = f.append_block().unwrap();
        let else_b = f.append_block().unwrap();
        let merge = f.append_block().unwrap();

        let cond = f.build_const_int(Some(entry), 1, 1).unwrap();
        f.build_br_cond(entry, cond, then_b, else_b).unwrap();
        f.build_br(then_b, merge).unwrap();
        f.build_br(else_b, merge).unwrap();
        f.build_ret(merge, vec![]).unwrap();

        let tree = DominatorTree::compute(&f).unwrap();
        assert!(tree.block_dominates(entry, merge));
        assert!(!tree.strictly_dominates(then_b, merge));
        assert!(!tree.strictly_dominates(else_b, merge));
        assert!(tree.strictly_dominates(entry, then_b));
    }

    #[test]
    fn unreachable_block_is_not_dominated() {
        let mut f = Unit::new("u", UnitKind::Function, Signature::new(vec![], vec![]));
        let entry = f.append_block().unwrap();
        let orphan = f.append_block().unwrap();
        f.build_ret(entry, vec![]).unwrap();
        f.build_ret(orphan, vec![]).unwrap();

        let tree = DominatorTree::compute(&f).unwrap();
        assert!(!tree.is_reachable(orphan));
        assert!(!tree.block_dominates(entry, orphan));
    }
}
