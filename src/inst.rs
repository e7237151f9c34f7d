//! The instruction set (§4.3): opcodes, operand shapes, and the
//! construction-time contracts each opcode enforces before it is allowed
//! into the graph.
//!
//! One variant per opcode, with `Display` producing the textual form from
//! §6, generalized from a software-codegen instruction set to these
//! hardware opcodes (arithmetic/bitwise/comparison unchanged in shape,
//! `drv`/`prb`/`reg`/`wait`/`halt`/`inst` added for the signal and
//! concurrency model).

use std::fmt;

use crate::block::BlockId;
use crate::error::ConstructError;
use crate::ty::Type;
use crate::value::ValueId;

/// Identity of an instruction within its owning unit. An instruction's
/// result, if it has one, is a [`ValueId`] whose [`crate::value::ValueKind`]
/// is `Inst(this_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct InstId(pub(crate) u32);

impl InstId {
    /// Test-only constructor; production code only ever receives `InstId`s
    /// back from a `Unit`'s builder methods.
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u32) -> Self {
        InstId(raw)
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::UDiv => "udiv",
            BinaryOp::SDiv => "sdiv",
            BinaryOp::URem => "urem",
            BinaryOp::SRem => "srem",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
        };
        write!(f, "{}", s)
    }
}

impl BinaryOp {
    /// `and`/`or`/`xor` are defined for both `Int` and `Logic`; the rest
    /// are `Int`-only (§4.3).
    pub fn accepts_logic(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ShiftOp {
    Shl,
    LShr,
    AShr,
}

impl fmt::Display for ShiftOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShiftOp::Shl => "shl",
            ShiftOp::LShr => "lshr",
            ShiftOp::AShr => "ashr",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Ult,
    Ugt,
    Ule,
    Uge,
    Slt,
    Sgt,
    Sle,
    Sge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Ult => "ult",
            CompareOp::Ugt => "ugt",
            CompareOp::Ule => "ule",
            CompareOp::Uge => "uge",
            CompareOp::Slt => "slt",
            CompareOp::Sgt => "sgt",
            CompareOp::Sle => "sle",
            CompareOp::Sge => "sge",
        };
        write!(f, "{}", s)
    }
}

impl CompareOp {
    /// `eq`/`ne` are defined for both `Int` and `Logic`; the ordered
    /// comparisons are `Int`-only (§4.3).
    pub fn accepts_logic(&self) -> bool {
        matches!(self, CompareOp::Eq | CompareOp::Ne)
    }
}

/// A field selector for `extract`/`insert`: either a compile-time-known
/// index (struct fields, which have no other indexing mode) or a
/// dynamically computed one (array elements).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FieldIndex {
    Constant(u32),
    Dynamic(ValueId),
}

impl fmt::Display for FieldIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldIndex::Constant(i) => write!(f, "{}", i),
            FieldIndex::Dynamic(v) => write!(f, "{}", v),
        }
    }
}

/// One instruction, carrying its operands directly (§4.3). The result
/// type, when the opcode produces a value, is recorded alongside in
/// [`InstData`] rather than recomputed from the variant on every query.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Inst {
    ConstInt { width: u32, value: i64 },
    ConstLogic { width: u32, bits: Vec<LogicValue> },
    ConstTime { picoseconds: u64, delta: u32 },

    Binary { op: BinaryOp, lhs: ValueId, rhs: ValueId },
    Shift { op: ShiftOp, value: ValueId, amount: ValueId },
    Not { value: ValueId },
    Compare { op: CompareOp, lhs: ValueId, rhs: ValueId },

    /// `mux %sel, [%a, %b, ...]`. Open question 1 resolution (out-of-range
    /// selector) is enforced by the verifier, not at construction time,
    /// since it may depend on a selector whose concrete value is unknown
    /// until simulation/synthesis.
    Mux { selector: ValueId, options: Vec<ValueId> },

    Extract { aggregate: ValueId, index: FieldIndex },
    Insert { aggregate: ValueId, index: FieldIndex, value: ValueId },

    /// `reg %value, %strobe` — only valid inside an entity. One strobe per
    /// `reg`; compound trigger conditions are built with `and`/`not` before
    /// they reach here (Open Question 3 resolution).
    Reg { value: ValueId, strobe: ValueId },

    /// `sig T` — declares a signal of type `T` inside an entity. `T`
    /// parameterizes the opcode the way a literal width parameterizes
    /// `const`; there is no operand (§4.3's table lists none).
    Sig { ty: Type },

    /// `prb %signal` — sample a signal's current value.
    Prb { signal: ValueId },

    /// `drv %signal, %value, %delay[, %gate]`.
    Drv {
        signal: ValueId,
        value: ValueId,
        delay: ValueId,
        gate: Option<ValueId>,
    },

    Br { target: BlockId },
    BrCond { cond: ValueId, then_target: BlockId, else_target: BlockId },
    Ret { values: Vec<ValueId> },

    /// `wait target, s₁…sₙ[, for <timeout>]` — suspends a process until any
    /// listed signal changes or the optional timeout elapses, then resumes
    /// at `target`.
    Wait { target: BlockId, signals: Vec<ValueId>, timeout: Option<ValueId> },
    Halt,

    /// `call @unit(args...)` inside a function/process.
    Call { callee: String, args: Vec<ValueId> },

    /// `inst @unit(inputs...) -> (outputs...)` inside an entity.
    InstBody { unit_ref: String, inputs: Vec<ValueId>, outputs: Vec<ValueId> },

    /// A no-op, used by passes as a cheap tombstone before `dce` removes it
    /// outright; never produced by a surface builder.
    Nop,
}

/// One bit of a 9-valued logic vector (§4.1's `Logic(w)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LogicValue {
    V0,
    V1,
    X,
    Z,
    H,
    L,
    W,
    U,
    Dash,
}

impl fmt::Display for LogicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            LogicValue::V0 => '0',
            LogicValue::V1 => '1',
            LogicValue::X => 'X',
            LogicValue::Z => 'Z',
            LogicValue::H => 'H',
            LogicValue::L => 'L',
            LogicValue::W => 'W',
            LogicValue::U => 'U',
            LogicValue::Dash => '-',
        };
        write!(f, "{}", c)
    }
}

impl Inst {
    /// Whether this opcode may only terminate a block (`br`, `br_cond`,
    /// `ret`, `wait`, `halt`) — §4.4's terminator set.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Br { .. }
                | Inst::BrCond { .. }
                | Inst::Ret { .. }
                | Inst::Wait { .. }
                | Inst::Halt
        )
    }

    /// Opcodes valid only inside an entity's flat body (no control flow).
    pub fn requires_entity(&self) -> bool {
        matches!(self, Inst::Reg { .. } | Inst::Sig { .. } | Inst::InstBody { .. })
    }

    /// Opcodes valid only inside a function/process's block graph.
    pub fn requires_control_flow(&self) -> bool {
        matches!(
            self,
            Inst::Br { .. } | Inst::BrCond { .. } | Inst::Ret { .. } | Inst::Wait { .. } | Inst::Halt
        )
    }

    /// The mnemonic used in the textual form (§6).
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Inst::ConstInt { .. } | Inst::ConstLogic { .. } | Inst::ConstTime { .. } => "const",
            Inst::Binary { op, .. } => match op {
                BinaryOp::Add => "add",
                BinaryOp::Sub => "sub",
                BinaryOp::Mul => "mul",
                BinaryOp::UDiv => "udiv",
                BinaryOp::SDiv => "sdiv",
                BinaryOp::URem => "urem",
                BinaryOp::SRem => "srem",
                BinaryOp::And => "and",
                BinaryOp::Or => "or",
                BinaryOp::Xor => "xor",
            },
            Inst::Shift { op, .. } => match op {
                ShiftOp::Shl => "shl",
                ShiftOp::LShr => "lshr",
                ShiftOp::AShr => "ashr",
            },
            Inst::Not { .. } => "not",
            Inst::Compare { .. } => "icmp",
            Inst::Mux { .. } => "mux",
            Inst::Extract { .. } => "extract",
            Inst::Insert { .. } => "insert",
            Inst::Reg { .. } => "reg",
            Inst::Sig { .. } => "sig",
            Inst::Prb { .. } => "prb",
            Inst::Drv { .. } => "drv",
            Inst::Br { .. } => "br",
            Inst::BrCond { .. } => "br",
            Inst::Ret { .. } => "ret",
            Inst::Wait { .. } => "wait",
            Inst::Halt => "halt",
            Inst::Call { .. } => "call",
            Inst::InstBody { .. } => "inst",
            Inst::Nop => "nop",
        }
    }

    /// Visit every operand `ValueId`, in argument order, together with its
    /// zero-based operand position (used to build/maintain use-lists).
    pub fn for_each_operand(&self, mut f: impl FnMut(u16, ValueId)) {
        let mut push = |i: u16, v: ValueId| f(i, v);
        match self {
            Inst::ConstInt { .. } | Inst::ConstLogic { .. } | Inst::ConstTime { .. } => {}
            Inst::Binary { lhs, rhs, .. } => {
                push(0, *lhs);
                push(1, *rhs);
            }
            Inst::Shift { value, amount, .. } => {
                push(0, *value);
                push(1, *amount);
            }
            Inst::Not { value } => push(0, *value),
            Inst::Compare { lhs, rhs, .. } => {
                push(0, *lhs);
                push(1, *rhs);
            }
            Inst::Mux { selector, options } => {
                push(0, *selector);
                for (i, opt) in options.iter().enumerate() {
                    push(1 + i as u16, *opt);
                }
            }
            Inst::Extract { aggregate, index } => {
                push(0, *aggregate);
                if let FieldIndex::Dynamic(v) = index {
                    push(1, *v);
                }
            }
            Inst::Insert { aggregate, index, value } => {
                push(0, *aggregate);
                let mut next = 1;
                if let FieldIndex::Dynamic(v) = index {
                    push(next, *v);
                    next += 1;
                }
                push(next, *value);
            }
            Inst::Reg { value, strobe } => {
                push(0, *value);
                push(1, *strobe);
            }
            Inst::Sig { .. } => {}
            Inst::Prb { signal } => push(0, *signal),
            Inst::Drv { signal, value, delay, gate } => {
                push(0, *signal);
                push(1, *value);
                push(2, *delay);
                if let Some(g) = gate {
                    push(3, *g);
                }
            }
            Inst::Br { .. } => {}
            Inst::BrCond { cond, .. } => push(0, *cond),
            Inst::Ret { values } => {
                for (i, v) in values.iter().enumerate() {
                    push(i as u16, *v);
                }
            }
            Inst::Wait { signals, timeout, .. } => {
                for (i, v) in signals.iter().enumerate() {
                    push(i as u16, *v);
                }
                if let Some(t) = timeout {
                    push(signals.len() as u16, *t);
                }
            }
            Inst::Halt | Inst::Nop => {}
            Inst::Call { args, .. } => {
                for (i, v) in args.iter().enumerate() {
                    push(i as u16, *v);
                }
            }
            Inst::InstBody { inputs, outputs, .. } => {
                for (i, v) in inputs.iter().enumerate() {
                    push(i as u16, *v);
                }
                for (i, v) in outputs.iter().enumerate() {
                    push(inputs.len() as u16 + i as u16, *v);
                }
            }
        }
    }

    /// Replace every operand equal to `from` with `to` (used by
    /// `replace_all_uses_with` and by passes rewriting the graph in place).
    pub fn replace_operand(&mut self, from: ValueId, to: ValueId) {
        let mut r = |v: &mut ValueId| {
            if *v == from {
                *v = to;
            }
        };
        match self {
            Inst::Binary { lhs, rhs, .. } => {
                r(lhs);
                r(rhs);
            }
            Inst::Shift { value, amount, .. } => {
                r(value);
                r(amount);
            }
            Inst::Not { value } => r(value),
            Inst::Compare { lhs, rhs, .. } => {
                r(lhs);
                r(rhs);
            }
            Inst::Mux { selector, options } => {
                r(selector);
                options.iter_mut().for_each(r);
            }
            Inst::Extract { aggregate, index } => {
                r(aggregate);
                if let FieldIndex::Dynamic(v) = index {
                    r(v);
                }
            }
            Inst::Insert { aggregate, index, value } => {
                r(aggregate);
                if let FieldIndex::Dynamic(v) = index {
                    r(v);
                }
                r(value);
            }
            Inst::Reg { value, strobe } => {
                r(value);
                r(strobe);
            }
            Inst::Prb { signal } => r(signal),
            Inst::Drv { signal, value, delay, gate } => {
                r(signal);
                r(value);
                r(delay);
                if let Some(g) = gate {
                    r(g);
                }
            }
            Inst::BrCond { cond, .. } => r(cond),
            Inst::Ret { values } => values.iter_mut().for_each(r),
            Inst::Wait { signals, timeout, .. } => {
                signals.iter_mut().for_each(&mut r);
                if let Some(t) = timeout {
                    r(t);
                }
            }
            Inst::Call { args, .. } => args.iter_mut().for_each(r),
            Inst::InstBody { inputs, outputs, .. } => {
                inputs.iter_mut().for_each(&mut r);
                outputs.iter_mut().for_each(r);
            }
            Inst::ConstInt { .. }
            | Inst::ConstLogic { .. }
            | Inst::ConstTime { .. }
            | Inst::Sig { .. }
            | Inst::Br { .. }
            | Inst::Halt
            | Inst::Nop => {}
        }
    }
}

/// The stored form of an instruction: the opcode-and-operands payload plus
/// its result (if any) and the block/entity it is attached to.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstData {
    pub(crate) inst: Inst,
    pub(crate) result: Option<ValueId>,
    pub(crate) result_ty: Type,
    pub(crate) block: Option<BlockId>,
}

impl InstData {
    pub fn inst(&self) -> &Inst {
        &self.inst
    }

    pub fn result(&self) -> Option<ValueId> {
        self.result
    }

    pub fn result_ty(&self) -> &Type {
        &self.result_ty
    }

    pub fn block(&self) -> Option<BlockId> {
        self.block
    }
}

/// Owns every instruction created inside one unit; tombstoned on removal
/// like [`crate::value::ValueArena`].
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct InstArena {
    slots: Vec<Option<InstData>>,
}

impl InstArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn alloc(&mut self, data: InstData) -> InstId {
        let id = InstId(self.slots.len() as u32);
        self.slots.push(Some(data));
        id
    }

    pub fn get(&self, id: InstId) -> Option<&InstData> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: InstId) -> Option<&mut InstData> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    pub fn is_live(&self, id: InstId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn free(&mut self, id: InstId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstId, &InstData)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|d| (InstId(i as u32), d)))
    }
}

/// Check an operand's type against an expected one, producing the
/// standard §7 error on mismatch. Shared by every opcode's construction
/// path in `unit.rs`.
pub(crate) fn expect_type(op: &str, index: usize, expected: &Type, found: &Type) -> Result<(), ConstructError> {
    if expected == found {
        Ok(())
    } else {
        Err(ConstructError::InvalidOperand {
            op: op.to_string(),
            index,
            expected: expected.to_string(),
            found: found.clone(),
        })
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::ConstInt { value, .. } => write!(f, "const {}", value),
            Inst::ConstLogic { bits, .. } => {
                write!(f, "const n\"")?;
                for b in bits {
                    write!(f, "{}", b)?;
                }
                write!(f, "\"")
            }
            Inst::ConstTime { picoseconds, delta } => write!(f, "const {}ps {}d", picoseconds, delta),
            Inst::Binary { op, lhs, rhs } => write!(f, "{} {}, {}", op, lhs, rhs),
            Inst::Shift { op, value, amount } => write!(f, "{} {}, {}", op, value, amount),
            Inst::Not { value } => write!(f, "not {}", value),
            Inst::Compare { op, lhs, rhs } => write!(f, "icmp {} {}, {}", op, lhs, rhs),
            Inst::Mux { selector, options } => {
                write!(f, "mux {}, [", selector)?;
                for (i, o) in options.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", o)?;
                }
                write!(f, "]")
            }
            Inst::Extract { aggregate, index } => write!(f, "extract {}, {}", aggregate, index),
            Inst::Insert { aggregate, index, value } => {
                write!(f, "insert {}, {}, {}", aggregate, index, value)
            }
            Inst::Reg { value, strobe } => write!(f, "reg {}, {}", value, strobe),
            Inst::Sig { ty } => write!(f, "sig {}", ty),
            Inst::Prb { signal } => write!(f, "prb {}", signal),
            Inst::Drv { signal, value, delay, gate } => {
                if let Some(g) = gate {
                    write!(f, "drv {} if {}, {}, {}", signal, g, value, delay)
                } else {
                    write!(f, "drv {}, {}, {}", signal, value, delay)
                }
            }
            Inst::Br { target } => write!(f, "br {}", target),
            Inst::BrCond { cond, then_target, else_target } => {
                write!(f, "br {}, {}, {}", cond, then_target, else_target)
            }
            Inst::Ret { values } => {
                write!(f, "ret")?;
                for (i, v) in values.iter().enumerate() {
                    write!(f, "{}{}", if i == 0 { " " } else { ", " }, v)?;
                }
                Ok(())
            }
            Inst::Wait { target, signals, timeout } => {
                write!(f, "wait {}", target)?;
                for s in signals.iter() {
                    write!(f, ", {}", s)?;
                }
                if let Some(t) = timeout {
                    write!(f, ", for {}", t)?;
                }
                Ok(())
            }
            Inst::Halt => write!(f, "halt"),
            Inst::Call { callee, args } => {
                write!(f, "call @{}(", callee)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Inst::InstBody { unit_ref, inputs, outputs } => {
                write!(f, "inst @{}(", unit_ref)?;
                for (i, v) in inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ") -> (")?;
                for (i, v) in outputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
            Inst::Nop => write!(f, "nop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_classification() {
        assert!(Inst::Halt.is_terminator());
        assert!(Inst::Ret { values: vec![] }.is_terminator());
        assert!(!Inst::Not { value: ValueId(0) }.is_terminator());
    }

    #[test]
    fn display_matches_textual_grammar() {
        let add = Inst::Binary { op: BinaryOp::Add, lhs: ValueId(0), rhs: ValueId(1) };
        assert_eq!(add.to_string(), "add %0, %1");

        let ret = Inst::Ret { values: vec![ValueId(2)] };
        assert_eq!(ret.to_string(), "ret %2");
    }

    #[test]
    fn for_each_operand_visits_mux_options_in_order() {
        let mux = Inst::Mux { selector: ValueId(0), options: vec![ValueId(1), ValueId(2)] };
        let mut seen = Vec::new();
        mux.for_each_operand(|pos, v| seen.push((pos, v)));
        assert_eq!(seen, vec![(0, ValueId(0)), (1, ValueId(1)), (2, ValueId(2))]);
    }

    #[test]
    fn replace_operand_rewrites_every_occurrence() {
        let mut cmp = Inst::Compare { op: CompareOp::Eq, lhs: ValueId(0), rhs: ValueId(0) };
        cmp.replace_operand(ValueId(0), ValueId(9));
        assert_eq!(cmp, Inst::Compare { op: CompareOp::Eq, lhs: ValueId(9), rhs: ValueId(9) });
    }
}
