//! Container units (§4.4): `Function`, `Process`, `Entity`, `Declaration`,
//! their blocks, and the builder surface that constructs instructions
//! against the operand contracts in §4.3.
//!
//! A single-kind, CFG-only function representation generalizes here into a
//! four-kind sealed `UnitKind`, following §9's guidance to keep shared
//! fields (name, signature, params, value/inst arenas) in one header and
//! let the per-kind body (`UnitBody`) vary — the same "common header,
//! per-variant payload" split used for [`crate::inst::Inst`].

use indexmap::IndexMap;
use log::trace;

use crate::block::{BlockData, BlockId};
use crate::error::ConstructError;
use crate::inst::{
    expect_type, BinaryOp, CompareOp, FieldIndex, Inst, InstArena, InstData, InstId, LogicValue,
    ShiftOp,
};
use crate::ty::Type;
use crate::value::{Use, ValueArena, ValueData, ValueId, ValueKind};

/// A unit name is unique within a module and is the key used by `inst` and
/// by external references (§3).
pub type UnitName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnitKind {
    Function,
    Process,
    Entity,
    Declaration,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Function => "func",
            UnitKind::Process => "proc",
            UnitKind::Entity => "entity",
            UnitKind::Declaration => "decl",
        }
    }

    pub fn has_blocks(&self) -> bool {
        matches!(self, UnitKind::Function | UnitKind::Process)
    }

    pub fn is_flat(&self) -> bool {
        matches!(self, UnitKind::Entity)
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit's parameter (input or output port, or plain value parameter for
/// functions).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Param {
    pub name: Option<String>,
    pub ty: Type,
}

/// Declares a unit's calling convention: ordered parameter types and
/// ordered return/output types. Entities and processes require every
/// entry to be `Signal(T)` (ports); functions require value types.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Signature {
    pub params: Vec<Param>,
    pub returns: Vec<Type>,
}

impl Signature {
    pub fn new(params: Vec<Param>, returns: Vec<Type>) -> Self {
        Signature { params, returns }
    }

    /// The output types a `call`/`inst` to a unit with this signature
    /// produces, per §4.3: `call` results in "struct of outputs", `inst`
    /// wires existing signals instead of producing new ones.
    pub fn call_result_type(&self) -> Type {
        Type::Struct(self.returns.clone())
    }
}

/// Ordered blocks of a `Function`/`Process`, with insertion order doubling
/// as iteration order (§4.4's "iterate blocks... in order").
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BlockGraph {
    blocks: IndexMap<BlockId, BlockData>,
    next_id: u32,
}

impl BlockGraph {
    fn alloc_id(&mut self) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// The per-kind payload of a [`Unit`] (§3: "Function... body is a CFG of
/// blocks"; "Entity... a single flat set of instructions"; "Declaration...
/// no body").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum UnitBody {
    Blocks(BlockGraph),
    Flat(Vec<InstId>),
    None,
}

/// One top-level IR unit (§3 `Unit`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Unit {
    name: UnitName,
    kind: UnitKind,
    sig: Signature,
    params: Vec<ValueId>,
    values: ValueArena,
    insts: InstArena,
    body: UnitBody,
}

impl Unit {
    pub fn new(name: impl Into<String>, kind: UnitKind, sig: Signature) -> Self {
        let mut values = ValueArena::new();
        let mut params = Vec::with_capacity(sig.params.len());
        for (i, p) in sig.params.iter().enumerate() {
            let id = values.alloc(ValueData {
                kind: ValueKind::Param(i as u16),
                ty: p.ty.clone(),
                name: p.name.clone(),
                uses: Vec::new(),
            });
            params.push(id);
        }
        let body = match kind {
            UnitKind::Function | UnitKind::Process => UnitBody::Blocks(BlockGraph::default()),
            UnitKind::Entity => UnitBody::Flat(Vec::new()),
            UnitKind::Declaration => UnitBody::None,
        };
        Unit { name: name.into(), kind, sig, params, values, insts: InstArena::new(), body }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn signature(&self) -> &Signature {
        &self.sig
    }

    pub fn params(&self) -> &[ValueId] {
        &self.params
    }

    pub fn values(&self) -> &ValueArena {
        &self.values
    }

    pub fn insts(&self) -> &InstArena {
        &self.insts
    }

    pub fn value(&self, id: ValueId) -> Option<&ValueData> {
        self.values.get(id)
    }

    pub fn inst(&self, id: InstId) -> Option<&InstData> {
        self.insts.get(id)
    }

    pub fn body(&self) -> &UnitBody {
        &self.body
    }

    fn block_graph(&self) -> Option<&BlockGraph> {
        match &self.body {
            UnitBody::Blocks(g) => Some(g),
            _ => None,
        }
    }

    fn block_graph_mut(&mut self) -> Option<&mut BlockGraph> {
        match &mut self.body {
            UnitBody::Blocks(g) => Some(g),
            _ => None,
        }
    }

    pub fn block(&self, id: BlockId) -> Option<&BlockData> {
        self.block_graph()?.blocks.get(&id)
    }

    /// Blocks in layout order (§4.4 "iterate blocks... in order").
    pub fn blocks_in_order(&self) -> Box<dyn Iterator<Item = (BlockId, &BlockData)> + '_> {
        match self.block_graph() {
            Some(g) => Box::new(g.blocks.iter().map(|(id, b)| (*id, b))),
            None => Box::new(std::iter::empty()),
        }
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.block_graph()?.blocks.keys().next().copied()
    }

    /// The entity's flat instruction list, in insertion order. Order carries
    /// no semantic meaning (§4.4) — only the use graph does.
    pub fn entity_insts(&self) -> &[InstId] {
        match &self.body {
            UnitBody::Flat(v) => v,
            _ => &[],
        }
    }

    // ---- block structure ----------------------------------------------

    /// Allocate the `Label`-typed value that names a freshly created block
    /// (§3: "Blocks carry type Label").
    fn alloc_block_label(&mut self, id: BlockId) -> ValueId {
        self.values.alloc(ValueData { kind: ValueKind::Block(id), ty: Type::Label, name: None, uses: Vec::new() })
    }

    pub fn append_block(&mut self) -> Result<BlockId, ConstructError> {
        let id = self
            .block_graph_mut()
            .ok_or_else(|| ConstructError::RequiresControlFlow("block".to_string()))?
            .alloc_id();
        let label = self.alloc_block_label(id);
        let g = self.block_graph_mut().expect("checked above");
        g.blocks.insert(id, BlockData { value: Some(label), insts: Vec::new() });
        Ok(id)
    }

    pub fn prepend_block(&mut self) -> Result<BlockId, ConstructError> {
        let id = self
            .block_graph_mut()
            .ok_or_else(|| ConstructError::RequiresControlFlow("block".to_string()))?
            .alloc_id();
        let label = self.alloc_block_label(id);
        let g = self.block_graph_mut().expect("checked above");
        let mut reordered = IndexMap::with_capacity(g.blocks.len() + 1);
        reordered.insert(id, BlockData { value: Some(label), insts: Vec::new() });
        for (k, v) in g.blocks.drain(..) {
            reordered.insert(k, v);
        }
        g.blocks = reordered;
        Ok(id)
    }

    pub fn insert_block_after(&mut self, after: BlockId) -> Result<BlockId, ConstructError> {
        self.insert_block_relative(after, true)
    }

    pub fn insert_block_before(&mut self, before: BlockId) -> Result<BlockId, ConstructError> {
        self.insert_block_relative(before, false)
    }

    fn insert_block_relative(&mut self, anchor: BlockId, after: bool) -> Result<BlockId, ConstructError> {
        if !self.block_graph().map(|g| g.blocks.contains_key(&anchor)).unwrap_or(false) {
            return Err(ConstructError::DanglingBlock);
        }
        let new_id = self.block_graph_mut().expect("checked above").alloc_id();
        let label = self.alloc_block_label(new_id);
        let g = self.block_graph_mut().expect("checked above");
        let mut reordered = IndexMap::with_capacity(g.blocks.len() + 1);
        for (k, v) in g.blocks.drain(..) {
            if after {
                reordered.insert(k, v);
                if k == anchor {
                    reordered.insert(new_id, BlockData { value: Some(label), insts: Vec::new() });
                }
            } else {
                if k == anchor {
                    reordered.insert(new_id, BlockData { value: Some(label), insts: Vec::new() });
                }
                reordered.insert(k, v);
            }
        }
        g.blocks = reordered;
        Ok(new_id)
    }

    /// Unlink an empty block. A block with instructions must be cleared
    /// with [`Unit::unlink_inst`] first — this mirrors the instruction
    /// deletion rule (§4.2: deletion only once unused) applied one level up.
    pub fn unlink_block(&mut self, id: BlockId) -> Result<(), ConstructError> {
        let label = {
            let g = self
                .block_graph_mut()
                .ok_or_else(|| ConstructError::RequiresControlFlow("block".to_string()))?;
            match g.blocks.get(&id) {
                None => return Err(ConstructError::DanglingBlock),
                Some(b) if !b.is_empty() => return Err(ConstructError::AlreadyAttached),
                Some(b) => {
                    let label = b.value;
                    g.blocks.shift_remove(&id);
                    label
                }
            }
        };
        if let Some(label) = label {
            self.values.free(label);
        }
        Ok(())
    }

    // ---- generic instruction attach/detach -----------------------------

    fn push_uses(&mut self, id: InstId, inst: &Inst) {
        let mut edits = Vec::new();
        inst.for_each_operand(|pos, v| edits.push((pos, v)));
        for (pos, v) in edits {
            self.values.add_use(v, id, pos);
        }
    }

    fn pop_uses(&mut self, id: InstId, inst: &Inst) {
        let mut edits = Vec::new();
        inst.for_each_operand(|pos, v| edits.push((pos, v)));
        for (pos, v) in edits {
            self.values.remove_use(v, id, pos);
        }
    }

    fn check_operand_live(&self, v: ValueId) -> Result<(), ConstructError> {
        if self.values.is_live(v) {
            Ok(())
        } else {
            Err(ConstructError::DanglingValue)
        }
    }

    /// Append an already-validated instruction to a block, enforcing the
    /// terminator-totality rule (§3 invariant 3).
    fn attach_to_block(&mut self, block: BlockId, id: InstId, inst: &Inst) -> Result<(), ConstructError> {
        if !self.kind.has_blocks() {
            return Err(ConstructError::RequiresControlFlow(inst.mnemonic().to_string()));
        }
        if inst.requires_entity() {
            return Err(ConstructError::RequiresEntity(inst.mnemonic().to_string()));
        }
        let already_terminated = {
            let g = self.block_graph().ok_or(ConstructError::DanglingBlock)?;
            let b = g.blocks.get(&block).ok_or(ConstructError::DanglingBlock)?;
            b.is_terminated(&self.insts)
        };
        if already_terminated {
            return Err(ConstructError::BlockAlreadyTerminated(inst.mnemonic().to_string()));
        }
        let g = self.block_graph_mut().expect("checked has_blocks above");
        let b = g.blocks.get_mut(&block).ok_or(ConstructError::DanglingBlock)?;
        b.insts.push(id);
        Ok(())
    }

    /// Append an already-validated instruction to an entity's flat body.
    fn attach_to_entity(&mut self, id: InstId, inst: &Inst) -> Result<(), ConstructError> {
        if !self.kind.is_flat() {
            return Err(ConstructError::RequiresEntity(inst.mnemonic().to_string()));
        }
        if inst.requires_control_flow() {
            return Err(ConstructError::RequiresControlFlow(inst.mnemonic().to_string()));
        }
        match &mut self.body {
            UnitBody::Flat(v) => v.push(id),
            _ => unreachable!("checked is_flat above"),
        }
        Ok(())
    }

    fn alloc_inst(&mut self, inst: Inst, result_ty: Type) -> InstId {
        let data = InstData { inst, result: None, result_ty, block: None };
        self.insts.alloc(data)
    }

    fn finish_inst(&mut self, id: InstId, block: Option<BlockId>, produces_result: bool) -> Option<ValueId> {
        let (inst, ty) = {
            let data = self.insts.get(id).expect("just allocated");
            (data.inst.clone(), data.result_ty.clone())
        };
        self.push_uses(id, &inst);
        let result = if produces_result && ty != Type::Void {
            let v = self.values.alloc(ValueData {
                kind: ValueKind::Inst(id),
                ty,
                name: None,
                uses: Vec::new(),
            });
            Some(v)
        } else {
            None
        };
        if let Some(data) = self.insts.get_mut(id) {
            data.result = result;
            data.block = block;
        }
        trace!("unit {}: built {} -> {:?}", self.name, self.insts.get(id).unwrap().inst, result);
        result
    }

    // ---- per-opcode builders, entity (flat) placement -------------------

    /// Build a `const` instruction and attach it like any other: into
    /// `block` for a function/process, or into the entity's flat body when
    /// `block` is `None`. Mirrors [`Unit::build_prb`]'s placement style.
    pub fn build_const_int(&mut self, block: Option<BlockId>, width: u32, value: i64) -> Result<ValueId, ConstructError> {
        let id = self.alloc_inst(Inst::ConstInt { width, value }, Type::int(width));
        self.attach_and_place(block, id)
    }

    pub fn build_const_logic(&mut self, block: Option<BlockId>, bits: Vec<LogicValue>) -> Result<ValueId, ConstructError> {
        let width = bits.len() as u32;
        let id = self.alloc_inst(Inst::ConstLogic { width, bits }, Type::logic(width));
        self.attach_and_place(block, id)
    }

    pub fn build_const_time(&mut self, block: Option<BlockId>, picoseconds: u64, delta: u32) -> Result<ValueId, ConstructError> {
        let id = self.alloc_inst(Inst::ConstTime { picoseconds, delta }, Type::Time);
        self.attach_and_place(block, id)
    }

    /// Shared placement logic for opcodes valid in either a block or an
    /// entity's flat body (currently only the `const` family and `prb`).
    fn attach_and_place(&mut self, block: Option<BlockId>, id: InstId) -> Result<ValueId, ConstructError> {
        let inst = self.insts.get(id).expect("just allocated").inst.clone();
        match block {
            Some(b) => {
                self.attach_to_block(b, id, &inst)?;
                Ok(self.finish_inst(id, Some(b), true).expect("non-void"))
            }
            None => {
                self.attach_to_entity(id, &inst)?;
                Ok(self.finish_inst(id, None, true).expect("non-void"))
            }
        }
    }

    fn binary_result_type(op: BinaryOp, lhs: &Type, rhs: &Type) -> Result<Type, ConstructError> {
        if lhs != rhs {
            return Err(ConstructError::TypeMismatch { expected: lhs.to_string(), found: rhs.clone() });
        }
        match lhs {
            Type::Int(_) => Ok(lhs.clone()),
            Type::Logic(_) if op.accepts_logic() => Ok(lhs.clone()),
            _ => Err(ConstructError::InvalidOperand {
                op: op.to_string(),
                index: 0,
                expected: "Int(w)".to_string(),
                found: lhs.clone(),
            }),
        }
    }

    /// `binary` is valid in a function/process block or in an entity's flat
    /// body alike (§4.3 places no control-flow restriction on it); `block`
    /// follows the same dual-mode convention as [`Unit::build_prb`].
    pub fn build_binary(&mut self, block: Option<BlockId>, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId, ConstructError> {
        self.check_operand_live(lhs)?;
        self.check_operand_live(rhs)?;
        let lhs_ty = self.value(lhs).unwrap().ty().clone();
        let rhs_ty = self.value(rhs).unwrap().ty().clone();
        let result_ty = Self::binary_result_type(op, &lhs_ty, &rhs_ty)?;
        let id = self.alloc_inst(Inst::Binary { op, lhs, rhs }, result_ty);
        self.attach_and_place(block, id)
    }

    pub fn build_shift(&mut self, block: Option<BlockId>, op: ShiftOp, value: ValueId, amount: ValueId) -> Result<ValueId, ConstructError> {
        self.check_operand_live(value)?;
        self.check_operand_live(amount)?;
        let value_ty = self.value(value).unwrap().ty().clone();
        let amount_ty = self.value(amount).unwrap().ty().clone();
        if !value_ty.is_int() {
            return Err(ConstructError::InvalidOperand { op: op.to_string(), index: 0, expected: "Int(w)".to_string(), found: value_ty });
        }
        if !amount_ty.is_int() {
            return Err(ConstructError::InvalidOperand { op: op.to_string(), index: 1, expected: "Int(w')".to_string(), found: amount_ty });
        }
        let id = self.alloc_inst(Inst::Shift { op, value, amount }, value_ty);
        self.attach_and_place(block, id)
    }

    pub fn build_not(&mut self, block: Option<BlockId>, value: ValueId) -> Result<ValueId, ConstructError> {
        self.check_operand_live(value)?;
        let ty = self.value(value).unwrap().ty().clone();
        if !(ty.is_int() || ty.is_logic()) {
            return Err(ConstructError::InvalidOperand { op: "not".to_string(), index: 0, expected: "Int(w) or Logic(w)".to_string(), found: ty });
        }
        let id = self.alloc_inst(Inst::Not { value }, ty);
        self.attach_and_place(block, id)
    }

    pub fn build_compare(&mut self, block: Option<BlockId>, op: CompareOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId, ConstructError> {
        self.check_operand_live(lhs)?;
        self.check_operand_live(rhs)?;
        let lhs_ty = self.value(lhs).unwrap().ty().clone();
        let rhs_ty = self.value(rhs).unwrap().ty().clone();
        if lhs_ty != rhs_ty {
            return Err(ConstructError::TypeMismatch { expected: lhs_ty.to_string(), found: rhs_ty });
        }
        let ok = lhs_ty.is_int() || (op.accepts_logic() && lhs_ty.is_logic());
        if !ok {
            return Err(ConstructError::InvalidOperand { op: op.to_string(), index: 0, expected: "Int(w)".to_string(), found: lhs_ty });
        }
        let id = self.alloc_inst(Inst::Compare { op, lhs, rhs }, Type::int(1));
        self.attach_and_place(block, id)
    }

    pub fn build_mux(&mut self, block: Option<BlockId>, selector: ValueId, options: Vec<ValueId>) -> Result<ValueId, ConstructError> {
        self.check_operand_live(selector)?;
        let sel_ty = self.value(selector).unwrap().ty().clone();
        if !sel_ty.is_int() {
            return Err(ConstructError::InvalidOperand { op: "mux".to_string(), index: 0, expected: "Int(k)".to_string(), found: sel_ty });
        }
        if options.is_empty() {
            return Err(ConstructError::MuxArityMismatch { implied: 0, found: 0 });
        }
        for &opt in &options {
            self.check_operand_live(opt)?;
        }
        let result_ty = self.value(options[0]).unwrap().ty().clone();
        for &opt in &options[1..] {
            let ty = self.value(opt).unwrap().ty().clone();
            if ty != result_ty {
                return Err(ConstructError::TypeMismatch { expected: result_ty.to_string(), found: ty });
            }
        }
        let id = self.alloc_inst(Inst::Mux { selector, options }, result_ty);
        self.attach_and_place(block, id)
    }

    pub fn build_extract(&mut self, block: Option<BlockId>, aggregate: ValueId, index: FieldIndex) -> Result<ValueId, ConstructError> {
        self.check_operand_live(aggregate)?;
        if let FieldIndex::Dynamic(v) = index {
            self.check_operand_live(v)?;
        }
        let agg_ty = self.value(aggregate).unwrap().ty().clone();
        let result_ty = match (&agg_ty, index) {
            (Type::Struct(fields), FieldIndex::Constant(i)) => fields
                .get(i as usize)
                .cloned()
                .ok_or_else(|| ConstructError::InvalidOperand { op: "extract".to_string(), index: 1, expected: "field in range".to_string(), found: agg_ty.clone() })?,
            (Type::Array(_, elem), _) => (**elem).clone(),
            (Type::Int(_), _) => Type::int(1),
            (Type::Logic(_), _) => Type::logic(1),
            _ => {
                return Err(ConstructError::InvalidOperand {
                    op: "extract".to_string(),
                    index: 0,
                    expected: "Struct, Array, Int, or Logic".to_string(),
                    found: agg_ty,
                })
            }
        };
        let id = self.alloc_inst(Inst::Extract { aggregate, index }, result_ty);
        self.attach_and_place(block, id)
    }

    pub fn build_insert(&mut self, block: Option<BlockId>, aggregate: ValueId, index: FieldIndex, value: ValueId) -> Result<ValueId, ConstructError> {
        self.check_operand_live(aggregate)?;
        self.check_operand_live(value)?;
        if let FieldIndex::Dynamic(v) = index {
            self.check_operand_live(v)?;
        }
        let agg_ty = self.value(aggregate).unwrap().ty().clone();
        let value_ty = self.value(value).unwrap().ty().clone();
        let expected = match (&agg_ty, index) {
            (Type::Struct(fields), FieldIndex::Constant(i)) => fields
                .get(i as usize)
                .cloned()
                .ok_or_else(|| ConstructError::InvalidOperand { op: "insert".to_string(), index: 1, expected: "field in range".to_string(), found: agg_ty.clone() })?,
            (Type::Array(_, elem), _) => (**elem).clone(),
            (Type::Int(_), _) => Type::int(1),
            (Type::Logic(_), _) => Type::logic(1),
            _ => {
                return Err(ConstructError::InvalidOperand {
                    op: "insert".to_string(),
                    index: 0,
                    expected: "Struct, Array, Int, or Logic".to_string(),
                    found: agg_ty,
                })
            }
        };
        expect_type("insert", 2, &expected, &value_ty)?;
        let id = self.alloc_inst(Inst::Insert { aggregate, index, value }, agg_ty);
        self.attach_and_place(block, id)
    }

    /// `reg` — entity only (§4.3, §4.8). Does not take a `block` parameter
    /// since entities have no blocks.
    pub fn build_reg(&mut self, value: ValueId, strobe: ValueId) -> Result<ValueId, ConstructError> {
        self.check_operand_live(value)?;
        self.check_operand_live(strobe)?;
        let value_ty = self.value(value).unwrap().ty().clone();
        let strobe_ty = self.value(strobe).unwrap().ty().clone();
        expect_type("reg", 1, &Type::int(1), &strobe_ty)?;
        let id = self.alloc_inst(Inst::Reg { value, strobe }, value_ty);
        self.attach_to_entity(id, &self.insts.get(id).unwrap().inst.clone())?;
        Ok(self.finish_inst(id, None, true).expect("non-void"))
    }

    pub fn build_sig(&mut self, ty: Type) -> Result<ValueId, ConstructError> {
        let result_ty = Type::signal(ty.clone());
        let id = self.alloc_inst(Inst::Sig { ty }, result_ty);
        self.attach_to_entity(id, &self.insts.get(id).unwrap().inst.clone())?;
        Ok(self.finish_inst(id, None, true).expect("non-void"))
    }

    pub fn build_prb(&mut self, block_or_none: Option<BlockId>, signal: ValueId) -> Result<ValueId, ConstructError> {
        self.check_operand_live(signal)?;
        let sig_ty = self.value(signal).unwrap().ty().clone();
        let inner = sig_ty
            .signal_value_type()
            .cloned()
            .ok_or_else(|| ConstructError::NotASignal { op: "prb".to_string(), found: sig_ty.clone() })?;
        let id = self.alloc_inst(Inst::Prb { signal }, inner);
        self.attach_and_place(block_or_none, id)
    }

    pub fn build_drv(
        &mut self,
        block_or_none: Option<BlockId>,
        signal: ValueId,
        value: ValueId,
        delay: ValueId,
        gate: Option<ValueId>,
    ) -> Result<InstId, ConstructError> {
        self.check_operand_live(signal)?;
        self.check_operand_live(value)?;
        self.check_operand_live(delay)?;
        if let Some(g) = gate {
            self.check_operand_live(g)?;
        }
        let sig_ty = self.value(signal).unwrap().ty().clone();
        let inner = sig_ty
            .signal_value_type()
            .cloned()
            .ok_or_else(|| ConstructError::NotASignal { op: "drv".to_string(), found: sig_ty.clone() })?;
        let value_ty = self.value(value).unwrap().ty().clone();
        expect_type("drv", 1, &inner, &value_ty)?;
        let delay_ty = self.value(delay).unwrap().ty().clone();
        expect_type("drv", 2, &Type::Time, &delay_ty)?;
        if let Some(g) = gate {
            let gate_ty = self.value(g).unwrap().ty().clone();
            expect_type("drv", 3, &Type::int(1), &gate_ty)?;
        }
        let id = self.alloc_inst(Inst::Drv { signal, value, delay, gate }, Type::Void);
        match block_or_none {
            Some(b) => {
                self.attach_to_block(b, id, &self.insts.get(id).unwrap().inst.clone())?;
                self.finish_inst(id, Some(b), false);
            }
            None => {
                self.attach_to_entity(id, &self.insts.get(id).unwrap().inst.clone())?;
                self.finish_inst(id, None, false);
            }
        }
        Ok(id)
    }

    pub fn build_br(&mut self, block: BlockId, target: BlockId) -> Result<InstId, ConstructError> {
        if self.block(target).is_none() {
            return Err(ConstructError::DanglingBlock);
        }
        let id = self.alloc_inst(Inst::Br { target }, Type::Void);
        self.attach_to_block(block, id, &self.insts.get(id).unwrap().inst.clone())?;
        self.finish_inst(id, Some(block), false);
        Ok(id)
    }

    pub fn build_br_cond(&mut self, block: BlockId, cond: ValueId, then_target: BlockId, else_target: BlockId) -> Result<InstId, ConstructError> {
        self.check_operand_live(cond)?;
        let cond_ty = self.value(cond).unwrap().ty().clone();
        expect_type("br", 0, &Type::int(1), &cond_ty)?;
        if self.block(then_target).is_none() || self.block(else_target).is_none() {
            return Err(ConstructError::DanglingBlock);
        }
        let id = self.alloc_inst(Inst::BrCond { cond, then_target, else_target }, Type::Void);
        self.attach_to_block(block, id, &self.insts.get(id).unwrap().inst.clone())?;
        self.finish_inst(id, Some(block), false);
        Ok(id)
    }

    pub fn build_ret(&mut self, block: BlockId, values: Vec<ValueId>) -> Result<InstId, ConstructError> {
        for &v in &values {
            self.check_operand_live(v)?;
        }
        let found: Vec<Type> = values.iter().map(|v| self.value(*v).unwrap().ty().clone()).collect();
        if found != self.sig.returns {
            return Err(ConstructError::ReturnMismatch { expected: self.sig.returns.clone(), found });
        }
        let id = self.alloc_inst(Inst::Ret { values }, Type::Void);
        self.attach_to_block(block, id, &self.insts.get(id).unwrap().inst.clone())?;
        self.finish_inst(id, Some(block), false);
        Ok(id)
    }

    pub fn build_wait(&mut self, block: BlockId, target: BlockId, signals: Vec<ValueId>, timeout: Option<ValueId>) -> Result<InstId, ConstructError> {
        if self.kind != UnitKind::Process {
            return Err(ConstructError::RequiresControlFlow("wait".to_string()));
        }
        if self.block(target).is_none() {
            return Err(ConstructError::DanglingBlock);
        }
        for &s in &signals {
            self.check_operand_live(s)?;
            let ty = self.value(s).unwrap().ty().clone();
            if !ty.is_signal() {
                return Err(ConstructError::NotASignal { op: "wait".to_string(), found: ty });
            }
        }
        if let Some(t) = timeout {
            self.check_operand_live(t)?;
            let ty = self.value(t).unwrap().ty().clone();
            expect_type("wait", signals.len(), &Type::Time, &ty)?;
        }
        let id = self.alloc_inst(Inst::Wait { target, signals, timeout }, Type::Void);
        self.attach_to_block(block, id, &self.insts.get(id).unwrap().inst.clone())?;
        self.finish_inst(id, Some(block), false);
        Ok(id)
    }

    pub fn build_halt(&mut self, block: BlockId) -> Result<InstId, ConstructError> {
        if self.kind != UnitKind::Process {
            return Err(ConstructError::RequiresControlFlow("halt".to_string()));
        }
        let id = self.alloc_inst(Inst::Halt, Type::Void);
        self.attach_to_block(block, id, &self.insts.get(id).unwrap().inst.clone())?;
        self.finish_inst(id, Some(block), false);
        Ok(id)
    }

    pub fn build_call(&mut self, block: BlockId, callee: impl Into<String>, args: Vec<ValueId>, callee_sig: &Signature) -> Result<ValueId, ConstructError> {
        if !matches!(self.kind, UnitKind::Function | UnitKind::Process) {
            return Err(ConstructError::RequiresControlFlow("call".to_string()));
        }
        for &a in &args {
            self.check_operand_live(a)?;
        }
        let found: Vec<Type> = args.iter().map(|a| self.value(*a).unwrap().ty().clone()).collect();
        let expected: Vec<Type> = callee_sig.params.iter().map(|p| p.ty.clone()).collect();
        if found.len() != expected.len() {
            return Err(ConstructError::ArgumentCountMismatch { expected: expected.len(), found: found.len() });
        }
        for (i, (f, e)) in found.iter().zip(expected.iter()).enumerate() {
            expect_type("call", i, e, f)?;
        }
        let result_ty = callee_sig.call_result_type();
        let id = self.alloc_inst(Inst::Call { callee: callee.into(), args }, result_ty);
        self.attach_to_block(block, id, &self.insts.get(id).unwrap().inst.clone())?;
        Ok(self.finish_inst(id, Some(block), true).expect("non-void"))
    }

    /// `inst` — structural instantiation, entity only. `outputs` are
    /// existing `Signal`-typed values (from `sig` or from this entity's own
    /// output ports) wired to the instantiated unit's output ports; no new
    /// value is produced (§4.3: result column is empty).
    pub fn build_instantiate(&mut self, unit_ref: impl Into<String>, inputs: Vec<ValueId>, outputs: Vec<ValueId>, callee_sig: &Signature) -> Result<InstId, ConstructError> {
        if !self.kind.is_flat() {
            return Err(ConstructError::RequiresEntity("inst".to_string()));
        }
        for &v in inputs.iter().chain(outputs.iter()) {
            self.check_operand_live(v)?;
        }
        let port_count = inputs.len() + outputs.len();
        if port_count != callee_sig.params.len() + callee_sig.returns.len() {
            return Err(ConstructError::ArgumentCountMismatch {
                expected: callee_sig.params.len() + callee_sig.returns.len(),
                found: port_count,
            });
        }
        let id = self.alloc_inst(Inst::InstBody { unit_ref: unit_ref.into(), inputs, outputs }, Type::Void);
        self.attach_to_entity(id, &self.insts.get(id).unwrap().inst.clone())?;
        self.finish_inst(id, None, false);
        Ok(id)
    }

    // ---- deletion, replacement ------------------------------------------

    /// Clear an instruction's operand uses and remove it from its block or
    /// entity. Only valid when its own result, if any, has no remaining
    /// uses (§4.2).
    pub fn unlink_inst(&mut self, id: InstId) -> Result<(), ConstructError> {
        let data = self.insts.get(id).ok_or(ConstructError::DanglingValue)?;
        if let Some(result) = data.result {
            if !self.values.get(result).map(|v| v.is_unused()).unwrap_or(true) {
                return Err(ConstructError::AlreadyAttached);
            }
        }
        let inst = data.inst.clone();
        let block = data.block;
        let result = data.result;
        self.pop_uses(id, &inst);
        if let Some(b) = block {
            if let Some(g) = self.block_graph_mut() {
                if let Some(bd) = g.blocks.get_mut(&b) {
                    bd.insts.retain(|i| *i != id);
                }
            }
        } else if let UnitBody::Flat(v) = &mut self.body {
            v.retain(|i| *i != id);
        }
        if let Some(result) = result {
            self.values.free(result);
        }
        self.insts.free(id);
        Ok(())
    }

    /// `erase_if_unused` (§4.2): delete `id` if its result has no uses
    /// (void instructions with side effects, like `drv`, are never erased
    /// this way), then recurse into operands that become unused and are
    /// themselves free of side effects.
    pub fn erase_if_unused(&mut self, id: InstId) {
        let Some(data) = self.insts.get(id) else { return };
        if has_side_effect(&data.inst) {
            return;
        }
        if let Some(result) = data.result {
            if !self.values.get(result).map(|v| v.is_unused()).unwrap_or(true) {
                return;
            }
        }
        let mut operands = Vec::new();
        data.inst.for_each_operand(|_, v| operands.push(v));
        if self.unlink_inst(id).is_err() {
            return;
        }
        for v in operands {
            if let Some(ValueKind::Inst(producer)) = self.values.get(v).map(|d| d.kind().clone()) {
                self.erase_if_unused(producer);
            }
        }
    }

    /// §4.2's central primitive: move every use of `v` onto `r`, rewriting
    /// each user's operand in place.
    pub fn replace_all_uses_with(&mut self, v: ValueId, r: ValueId) -> Result<(), ConstructError> {
        if v == r {
            return Ok(());
        }
        self.check_operand_live(v)?;
        self.check_operand_live(r)?;
        let uses: Vec<Use> = self.value(v).unwrap().uses().to_vec();
        let r_ty = self.value(r).unwrap().ty().clone();
        for u in &uses {
            let user_ty_ok = self
                .insts
                .get(u.user)
                .map(|d| operand_contract_satisfied(&d.inst, u.position, &r_ty))
                .unwrap_or(true);
            if !user_ty_ok {
                return Err(ConstructError::TypeMismatch { expected: r_ty.to_string(), found: r_ty.clone() });
            }
        }
        for u in &uses {
            if let Some(data) = self.insts.get_mut(u.user) {
                data.inst.replace_operand(v, r);
            }
            self.values.add_use(r, u.user, u.position);
        }
        if let Some(data) = self.values.get_mut(v) {
            data.uses.clear();
        }
        Ok(())
    }

    pub fn set_value_name(&mut self, id: ValueId, name: impl Into<String>) -> Result<(), ConstructError> {
        let data = self.values.get_mut(id).ok_or(ConstructError::DanglingValue)?;
        data.name = Some(name.into());
        Ok(())
    }
}

/// Whether an instruction has an observable effect beyond producing its
/// result, and is therefore never a candidate for `erase_if_unused`
/// (§4.2: "transitively any instructions that thereby become unused *and
/// side-effect free*").
fn has_side_effect(inst: &Inst) -> bool {
    matches!(
        inst,
        Inst::Drv { .. }
            | Inst::Br { .. }
            | Inst::BrCond { .. }
            | Inst::Ret { .. }
            | Inst::Wait { .. }
            | Inst::Halt
            | Inst::Call { .. }
            | Inst::InstBody { .. }
    )
}

/// Best-effort check that substituting a value of type `new_ty` into
/// `inst`'s operand `position` would not violate that operand's contract.
/// Used by `replace_all_uses_with`'s precondition (§4.2).
fn operand_contract_satisfied(inst: &Inst, position: u16, new_ty: &Type) -> bool {
    let mut ok = true;
    let mut checked = false;
    inst.for_each_operand(|pos, _| {
        if pos == position {
            checked = true;
        }
    });
    if !checked {
        return true;
    }
    match inst {
        Inst::Binary { .. } | Inst::Compare { .. } => {
            ok = new_ty.is_int() || new_ty.is_logic();
        }
        Inst::Reg { .. } if position == 1 => {
            ok = *new_ty == Type::int(1);
        }
        _ => {}
    }
    ok
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn simple_function() -> Unit {
        Unit::new(
            "add_one",
            UnitKind::Function,
            Signature::new(vec![Param { name: Some("x".into()), ty: Type::int(32) }], vec![Type::int(32)]),
        )
    }

    #[test]
    fn build_straight_line_function() {
        let mut f = simple_function();
        let entry = f.append_block().unwrap();
        let x = f.params()[0];
        let one = f.build_const_int(Some(entry), 32, 1).unwrap();
        let sum = f.build_binary(Some(entry), BinaryOp::Add, x, one).unwrap();
        f.build_ret(entry, vec![sum]).unwrap();
        assert!(f.block(entry).unwrap().is_terminated(f.insts()));
    }

    #[test]
    fn cannot_append_after_terminator() {
        let mut f = simple_function();
        let entry = f.append_block().unwrap();
        f.build_ret(entry, vec![f.params()[0]]).unwrap();
        let err = f.build_const_int(Some(entry), 32, 1);
        assert!(matches!(err, Err(ConstructError::BlockAlreadyTerminated(_))));
    }

    #[test]
    fn replace_all_uses_with_moves_every_use() {
        let mut f = simple_function();
        let entry = f.append_block().unwrap();
        let x = f.params()[0];
        let one = f.build_const_int(Some(entry), 32, 1).unwrap();
        let two = f.build_const_int(Some(entry), 32, 2).unwrap();
        let sum = f.build_binary(Some(entry), BinaryOp::Add, x, one).unwrap();
        f.replace_all_uses_with(one, two).unwrap();
        assert!(f.value(one).unwrap().is_unused());
        assert_eq!(f.value(two).unwrap().uses().len(), 1);
        let Inst::Binary { rhs, .. } = f.inst(sum_inst_of(&f, sum)).unwrap().inst() else { panic!() };
        assert_eq!(*rhs, two);
    }

    fn sum_inst_of(f: &Unit, v: ValueId) -> InstId {
        match f.value(v).unwrap().kind() {
            ValueKind::Inst(id) => *id,
            _ => panic!("expected inst-kind value"),
        }
    }

    proptest! {
        /// Use-list consistency (uses of `v` are exactly the insts that
        /// reference `v` in an operand slot), for any number of users.
        #[test]
        fn use_list_matches_operand_references(num_users in 1usize..8) {
            let mut f = simple_function();
            let entry = f.append_block().unwrap();
            let one = f.build_const_int(Some(entry), 32, 1).unwrap();
            for _ in 0..num_users {
                f.build_not(Some(entry), one).unwrap();
            }
            let uses = f.value(one).unwrap().uses().to_vec();
            prop_assert_eq!(uses.len(), num_users);
            for u in &uses {
                let data = f.inst(u.user).unwrap();
                let mut found = false;
                data.inst().for_each_operand(|_, v| if v == one { found = true });
                prop_assert!(found);
            }
        }

        /// Replacement (§8 property 2): every former user of `v` now
        /// references `r` at the same operand position, and `v` ends up
        /// unused, regardless of how many users `v` started with.
        #[test]
        fn replace_all_uses_with_moves_every_user_for_any_use_count(num_users in 1usize..8) {
            let mut f = simple_function();
            let entry = f.append_block().unwrap();
            let one = f.build_const_int(Some(entry), 32, 1).unwrap();
            let two = f.build_const_int(Some(entry), 32, 2).unwrap();
            let mut users = Vec::with_capacity(num_users);
            for _ in 0..num_users {
                let v = f.build_not(Some(entry), one).unwrap();
                users.push(sum_inst_of(&f, v));
            }
            let two_uses_before = f.value(two).unwrap().uses().len();
            f.replace_all_uses_with(one, two).unwrap();
            prop_assert!(f.value(one).unwrap().is_unused());
            prop_assert_eq!(f.value(two).unwrap().uses().len(), two_uses_before + num_users);
            for user in users {
                let Inst::Not { value } = f.inst(user).unwrap().inst() else { panic!() };
                prop_assert_eq!(*value, two);
            }
        }
    }

    #[test]
    fn entity_rejects_control_flow_and_accepts_reg() {
        let mut e = Unit::new(
            "dff",
            UnitKind::Entity,
            Signature::new(
                vec![Param { name: Some("d".into()), ty: Type::signal(Type::int(1)) }],
                vec![Type::signal(Type::int(1))],
            ),
        );
        let d = e.params()[0];
        let clk = e.build_sig(Type::int(1)).unwrap();
        let _ = clk;
        let d_val = e.build_prb(None, d).unwrap();
        let one = e.build_const_int(None, 1, 1).unwrap();
        // compare is a combinational op and is legal directly in an entity body.
        let strobe = e.build_compare(None, CompareOp::Eq, one, one);
        assert!(strobe.is_ok());
        // `br` requires block-structured control flow, which entities lack.
        let branch = e.build_br(BlockId(0), BlockId(0));
        assert!(branch.is_err());
        let _ = d_val;
    }
}
