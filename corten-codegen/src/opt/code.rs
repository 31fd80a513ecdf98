//! SSA code container.
//!
//! A function's code is a set of basic blocks indexed by dense block ids
//! (block 0 is the entry). Every instruction is identified by a [`Value`]:
//! the instruction *is* the value it produces. Blocks keep two orderings: a
//! full instruction list, and a control sub-list holding only the
//! instructions with side effects or control-flow meaning; a finalized
//! block's control list ends with a terminator.
//!
//! Instructions are immutable after creation except for moving them within
//! their block's ordering, attaching phi inputs, and filling in call-site
//! argument slots.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap};
use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::ir::{
    BranchCondition, ComparisonOp, ComplexBinaryOp, ComplexUnaryOp, ComplexWidth, ConversionOp,
    FloatBinaryOp, FloatWidth, FuncDecl, InlineAsmId, IntBinaryOp, IntUnaryOp, IntWidth,
    LongDoubleOp, MemoryOrder, MemoryWidth, OverflowOp,
};
use crate::{Error, Result};

/// An opaque reference to a basic block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to an instruction, which doubles as the reference to
/// the value it produces.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// An opaque reference to a phi node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Phi(u32);
entity_impl!(Phi, "phi");

/// An opaque reference to a call site.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Call(u32);
entity_impl!(Call, "call");

/// An opaque reference to an inline-assembly site.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InlineAsm(u32);
entity_impl!(InlineAsm, "inlasm");

/// An SSA operation together with its operands.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OpInst {
    /// Signed integer constant.
    IntConst(i64),
    /// Unsigned integer constant.
    UintConst(u64),
    /// `float` constant.
    Float32Const(f32),
    /// `double` constant.
    Float64Const(f64),
    /// `long double` constant.
    LongDoubleConst(f64),
    /// Signed bit-precise integer constant by constant-pool id.
    BitintSignedConst(u32),
    /// Unsigned bit-precise integer constant by constant-pool id.
    BitintUnsignedConst(u32),
    /// Address of a string literal.
    StringRef(u32),
    /// Address of a basic block, for indirect jumps.
    BlockLabel(Block),
    /// Undefined integer value.
    IntPlaceholder,
    /// Undefined `float` value.
    Float32Placeholder,
    /// Undefined `double` value.
    Float64Placeholder,

    /// Value merged from the predecessors through the referenced phi node.
    Phi(Phi),

    /// Address of a global object.
    GetGlobal(u32),
    /// Address of a thread-local object.
    GetThreadLocal(u32),
    /// Stack allocation of a local object.
    AllocLocal {
        /// Index of the local's entry in the function locals type.
        type_index: u32,
    },
    /// Address within a local object.
    GetLocal {
        /// The local's allocation.
        allocation: Value,
        /// Byte offset into it.
        offset: u32,
    },
    /// Value of a function argument.
    GetArgument(usize),

    /// Typed load.
    Load {
        /// Access width.
        width: MemoryWidth,
        /// Address operand.
        location: Value,
        /// Whether the access is volatile.
        volatile: bool,
    },
    /// Typed store.
    Store {
        /// Access width.
        width: MemoryWidth,
        /// Address operand.
        location: Value,
        /// Stored value.
        value: Value,
        /// Whether the access is volatile.
        volatile: bool,
    },
    /// Zero a typed memory region.
    ZeroMemory {
        /// Address operand.
        location: Value,
        /// Type table identifier.
        type_id: u32,
        /// Entry index within the type.
        type_index: u32,
    },
    /// Copy a typed memory region.
    CopyMemory {
        /// Destination address.
        destination: Value,
        /// Source address.
        source: Value,
        /// Type table identifier.
        type_id: u32,
        /// Entry index within the type.
        type_index: u32,
    },

    /// Sign-extending bit-field extraction.
    BitsExtractSigned {
        /// Storage unit.
        base: Value,
        /// Bit offset.
        offset: u32,
        /// Bit width.
        length: u32,
    },
    /// Zero-extending bit-field extraction.
    BitsExtractUnsigned {
        /// Storage unit.
        base: Value,
        /// Bit offset.
        offset: u32,
        /// Bit width.
        length: u32,
    },
    /// Bit-field insertion.
    BitsInsert {
        /// Storage unit.
        base: Value,
        /// Inserted value.
        value: Value,
        /// Bit offset.
        offset: u32,
        /// Bit width.
        length: u32,
    },

    /// Unary integer operation.
    IntUnary(IntUnaryOp, IntWidth, Value),
    /// Binary integer operation.
    IntBinary(IntBinaryOp, IntWidth, Value, Value),
    /// Sign extension from the given width to 64 bits.
    IntSignExtend(IntWidth, Value),
    /// Zero extension from the given width to 64 bits.
    IntZeroExtend(IntWidth, Value),

    /// Floating-point negation.
    FloatNeg(FloatWidth, Value),
    /// Binary floating-point operation.
    FloatBinary(FloatBinaryOp, FloatWidth, Value, Value),
    /// `long double` negation.
    LongDoubleNeg(Value),
    /// Binary `long double` operation.
    LongDoubleBinary(LongDoubleOp, Value, Value),
    /// Unary complex operation.
    ComplexUnary(ComplexUnaryOp, ComplexWidth, Value),
    /// Binary complex operation.
    ComplexBinary(ComplexBinaryOp, ComplexWidth, Value, Value),

    /// Scalar comparison producing 0/1.
    ScalarCompare(ComparisonOp, Value, Value),
    /// Scalar conversion.
    Conversion(ConversionOp, Value),

    /// `va_start`.
    VarargStart(Value),
    /// `va_end`.
    VarargEnd(Value),
    /// `va_arg` of the referenced type.
    VarargGet {
        /// `va_list` address.
        source: Value,
        /// Type table identifier.
        type_id: u32,
        /// Entry index within the type.
        type_index: u32,
    },
    /// `va_copy`.
    VarargCopy {
        /// Destination `va_list` address.
        destination: Value,
        /// Source `va_list` address.
        source: Value,
    },

    /// Dynamic stack allocation.
    StackAlloc {
        /// Allocation size in bytes.
        size: Value,
        /// Allocation alignment in bytes.
        alignment: Value,
        /// Whether the allocation lives inside the current dynamic scope.
        within_scope: bool,
    },
    /// Open a dynamic scope, producing its token.
    ScopePush,
    /// Close the dynamic scope named by the token.
    ScopePop(Value),
    /// Lifetime start marker for a local allocation.
    LocalLifetimeMark(Value),

    /// Atomic load.
    AtomicLoad {
        /// Access width.
        width: MemoryWidth,
        /// Address operand.
        location: Value,
        /// Memory ordering.
        order: MemoryOrder,
    },
    /// Atomic store.
    AtomicStore {
        /// Access width.
        width: MemoryWidth,
        /// Address operand.
        location: Value,
        /// Stored value.
        value: Value,
        /// Memory ordering.
        order: MemoryOrder,
    },
    /// Atomic compare-exchange producing the success flag.
    AtomicCompareExchange {
        /// Access width.
        width: MemoryWidth,
        /// Address operand.
        location: Value,
        /// Expected value.
        expected: Value,
        /// Desired value.
        desired: Value,
        /// Memory ordering.
        order: MemoryOrder,
    },
    /// Atomic region copy out of an atomic object.
    AtomicCopyMemoryFrom {
        /// Destination address.
        destination: Value,
        /// Source address.
        source: Value,
        /// Memory ordering.
        order: MemoryOrder,
        /// Type table identifier.
        type_id: u32,
        /// Entry index within the type.
        type_index: u32,
    },
    /// Atomic region copy into an atomic object.
    AtomicCopyMemoryTo {
        /// Destination address.
        destination: Value,
        /// Source address.
        source: Value,
        /// Memory ordering.
        order: MemoryOrder,
        /// Type table identifier.
        type_id: u32,
        /// Entry index within the type.
        type_index: u32,
    },

    /// Overflow-checked arithmetic producing the overflow flag; the result
    /// itself is stored through the pointer operand.
    OverflowArith {
        /// Checked operation.
        op: OverflowOp,
        /// Left operand.
        left: Value,
        /// Right operand.
        right: Value,
        /// Result pointer.
        result_pointer: Value,
        /// Signedness of left operand, right operand and result.
        signedness: [bool; 3],
    },

    /// Branch-free conditional value.
    Select {
        /// Width interpretation of the condition.
        condition: BranchCondition,
        /// Condition value.
        condition_value: Value,
        /// Value produced when the condition is non-zero.
        true_value: Value,
        /// Value produced when the condition is zero.
        false_value: Value,
    },
    /// Branch-free conditional value keyed on a comparison.
    SelectCompare {
        /// Comparison to perform.
        comparison: ComparisonOp,
        /// Left comparison operand.
        left: Value,
        /// Right comparison operand.
        right: Value,
        /// Value produced when the comparison holds.
        true_value: Value,
        /// Value produced otherwise.
        false_value: Value,
    },

    /// Unconditional terminator.
    Jump {
        /// Successor block.
        target: Block,
    },
    /// Two-way conditional terminator.
    Branch {
        /// Width interpretation of the condition.
        condition: BranchCondition,
        /// Condition value.
        condition_value: Value,
        /// Successor when the condition is non-zero.
        target: Block,
        /// Successor when the condition is zero.
        alternative: Block,
    },
    /// Two-way conditional terminator keyed on a comparison.
    BranchCompare {
        /// Comparison to perform.
        comparison: ComparisonOp,
        /// Left comparison operand.
        left: Value,
        /// Right comparison operand.
        right: Value,
        /// Successor when the comparison holds.
        target: Block,
        /// Successor otherwise.
        alternative: Block,
    },
    /// Computed-goto terminator.
    IndirectJump(Value),
    /// Function return terminator.
    Return(PackedOption<Value>),

    /// Function call through the referenced call site.
    Call(Call),
    /// Tail call through the referenced call site; terminates the block.
    TailCall(Call),
    /// Inline-assembly execution; terminates the block when the site has
    /// jump targets.
    InlineAsm(InlineAsm),

    /// Save the floating-point environment.
    FenvSave,
    /// Clear pending floating-point exceptions.
    FenvClear,
    /// Merge a saved floating-point environment into the current one.
    FenvUpdate(Value),
}

/// Data associated with one instruction.
#[derive(Clone, Copy, Debug)]
pub struct InstData {
    /// Block the instruction belongs to.
    pub block: Block,
    /// The operation.
    pub op: OpInst,
}

/// Data associated with one basic block.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    insts: Vec<Value>,
    control: Vec<Value>,
    phis: Vec<Phi>,
    public_labels: Vec<String>,
    finalized: bool,
}

impl BlockData {
    /// Instructions in block order.
    pub fn insts(&self) -> &[Value] {
        &self.insts
    }

    /// Control sub-list: side-effecting and terminating instructions in
    /// order.
    pub fn control(&self) -> &[Value] {
        &self.control
    }

    /// Phi nodes attached to the block.
    pub fn phis(&self) -> &[Phi] {
        &self.phis
    }

    /// Public labels naming this block as an indirect-jump target.
    pub fn public_labels(&self) -> &[String] {
        &self.public_labels
    }

    /// Whether the block has received its terminator.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// Data associated with one phi node.
#[derive(Clone, Debug)]
pub struct PhiData {
    /// Block the phi merges values into.
    pub block: Block,
    /// The instruction carrying the phi.
    pub instr: Value,
    links: BTreeMap<Block, Value>,
}

impl PhiData {
    /// Inputs as `(predecessor, value)` pairs in block order.
    pub fn links(&self) -> impl Iterator<Item = (Block, Value)> + '_ {
        self.links.iter().map(|(b, v)| (*b, *v))
    }

    /// Number of attached inputs.
    pub fn num_links(&self) -> usize {
        self.links.len()
    }
}

/// Data associated with one call site.
#[derive(Clone, Debug)]
pub struct CallData {
    /// Called declaration.
    pub callee: FuncDecl,
    /// The instruction performing the call.
    pub instr: Value,
    /// Function-pointer operand of a virtual call.
    pub indirect_callee: PackedOption<Value>,
    /// Caller-provided buffer for an aggregate return value.
    pub return_space: PackedOption<Value>,
    /// Whether the call is a tail call.
    pub tail: bool,
    arguments: Vec<PackedOption<Value>>,
}

impl CallData {
    /// Argument slots in parameter order.
    pub fn arguments(&self) -> &[PackedOption<Value>] {
        &self.arguments
    }
}

/// One parameter binding of an inline-assembly site.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineAsmSiteParam {
    /// Read operand, when the parameter class reads.
    pub read: PackedOption<Value>,
    /// Load/store operand, when the parameter class accesses memory.
    pub load_store: PackedOption<Value>,
}

/// Data associated with one inline-assembly site.
#[derive(Clone, Debug)]
pub struct InlineAsmData {
    /// Fragment this site instantiates.
    pub fragment: InlineAsmId,
    /// The instruction executing the fragment.
    pub instr: Value,
    /// Fall-through successor when the fragment has jump targets.
    pub default_jump_target: PackedOption<Block>,
    parameters: Vec<InlineAsmSiteParam>,
    jump_targets: BTreeMap<u64, Block>,
}

impl InlineAsmData {
    /// Parameter bindings in fragment order.
    pub fn parameters(&self) -> &[InlineAsmSiteParam] {
        &self.parameters
    }

    /// Jump targets as `(uid, block)` pairs in uid order.
    pub fn jump_targets(&self) -> impl Iterator<Item = (u64, Block)> + '_ {
        self.jump_targets.iter().map(|(uid, b)| (*uid, *b))
    }

    /// Whether the fragment can branch.
    pub fn has_jump_targets(&self) -> bool {
        !self.jump_targets.is_empty()
    }
}

/// The SSA code container.
pub struct Code {
    blocks: PrimaryMap<Block, BlockData>,
    insts: PrimaryMap<Value, InstData>,
    phis: PrimaryMap<Phi, PhiData>,
    calls: PrimaryMap<Call, CallData>,
    inline_asms: PrimaryMap<InlineAsm, InlineAsmData>,
}

impl Code {
    /// Empty container without any blocks.
    pub fn new() -> Self {
        Self {
            blocks: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            phis: PrimaryMap::new(),
            calls: PrimaryMap::new(),
            inline_asms: PrimaryMap::new(),
        }
    }

    /// Whether no block has been created yet.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The entry block. Meaningful once at least one block exists.
    pub fn entry(&self) -> Block {
        Block::from_u32(0)
    }

    /// Number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of instructions across all blocks.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Create a new, open basic block.
    pub fn new_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    /// Block data by reference.
    pub fn block(&self, block: Block) -> Result<&BlockData> {
        self.blocks
            .get(block)
            .ok_or(Error::InvalidParameter("unknown optimizer code block"))
    }

    /// Iterate over all block ids in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks.keys()
    }

    /// Attach a public label to a block.
    pub fn add_block_public_label(&mut self, block: Block, label: impl Into<String>) -> Result<()> {
        let data = self
            .blocks
            .get_mut(block)
            .ok_or(Error::InvalidParameter("unknown optimizer code block"))?;
        data.public_labels.push(label.into());
        Ok(())
    }

    /// Instruction data by reference.
    pub fn instr(&self, value: Value) -> Result<&InstData> {
        self.insts
            .get(value)
            .ok_or(Error::InvalidParameter("unknown optimizer instruction"))
    }

    /// The operation of an instruction.
    pub fn op(&self, value: Value) -> Result<&OpInst> {
        Ok(&self.instr(value)?.op)
    }

    /// Append a value-producing instruction to a block.
    pub fn append(&mut self, block: Block, op: OpInst) -> Result<Value> {
        if self.blocks.get(block).is_none() {
            return Err(Error::InvalidParameter("unknown optimizer code block"));
        }
        let value = self.insts.push(InstData { block, op });
        self.blocks[block].insts.push(value);
        Ok(value)
    }

    /// Append an already-created instruction to a block's control list.
    ///
    /// Only side-effecting and terminating operations belong there, and a
    /// finalized block accepts no further control instructions.
    pub fn add_control(&mut self, block: Block, value: Value) -> Result<()> {
        let data = self
            .blocks
            .get(block)
            .ok_or(Error::InvalidParameter("unknown optimizer code block"))?;
        if data.finalized {
            return Err(Error::InvalidState(
                "optimizer code block is already finalized",
            ));
        }
        if self.instr(value)?.block != block {
            return Err(Error::InvalidParameter(
                "control instruction belongs to another block",
            ));
        }
        self.blocks[block].control.push(value);
        Ok(())
    }

    /// Last control instruction of a block, if any.
    pub fn control_tail(&self, block: Block) -> Result<Option<Value>> {
        Ok(self.block(block)?.control.last().copied())
    }

    /// Whether a block has received its terminator.
    pub fn is_finalized(&self, block: Block) -> Result<bool> {
        Ok(self.block(block)?.finalized)
    }

    fn finalize(&mut self, block: Block, op: OpInst) -> Result<Value> {
        if self.is_finalized(block)? {
            return Err(Error::InvalidState(
                "optimizer code block is already finalized",
            ));
        }
        let value = self.append(block, op)?;
        self.blocks[block].control.push(value);
        self.blocks[block].finalized = true;
        Ok(value)
    }

    /// Terminate a block with an unconditional jump.
    pub fn finalize_jump(&mut self, block: Block, target: Block) -> Result<Value> {
        self.finalize(block, OpInst::Jump { target })
    }

    /// Terminate a block with a conditional branch.
    pub fn finalize_branch(
        &mut self,
        block: Block,
        condition: BranchCondition,
        condition_value: Value,
        target: Block,
        alternative: Block,
    ) -> Result<Value> {
        self.finalize(
            block,
            OpInst::Branch {
                condition,
                condition_value,
                target,
                alternative,
            },
        )
    }

    /// Terminate a block with a fused compare-and-branch.
    pub fn finalize_branch_compare(
        &mut self,
        block: Block,
        comparison: ComparisonOp,
        left: Value,
        right: Value,
        target: Block,
        alternative: Block,
    ) -> Result<Value> {
        self.finalize(
            block,
            OpInst::BranchCompare {
                comparison,
                left,
                right,
                target,
                alternative,
            },
        )
    }

    /// Terminate a block with an indirect jump.
    pub fn finalize_indirect_jump(&mut self, block: Block, target: Value) -> Result<Value> {
        self.finalize(block, OpInst::IndirectJump(target))
    }

    /// Terminate a block with a return.
    pub fn finalize_return(&mut self, block: Block, value: Option<Value>) -> Result<Value> {
        self.finalize(block, OpInst::Return(value.into()))
    }

    /// Create a phi node in a block, together with its carrying
    /// instruction. The instruction is appended at the block's tail; use
    /// [`Code::instruction_move_after`] to relocate it to the head.
    pub fn new_phi(&mut self, block: Block) -> Result<(Phi, Value)> {
        if self.blocks.get(block).is_none() {
            return Err(Error::InvalidParameter("unknown optimizer code block"));
        }
        let phi = self.phis.next_key();
        let value = self.append(block, OpInst::Phi(phi))?;
        let created = self.phis.push(PhiData {
            block,
            instr: value,
            links: BTreeMap::new(),
        });
        debug_assert_eq!(created, phi);
        self.blocks[block].phis.push(phi);
        Ok((phi, value))
    }

    /// Phi data by reference.
    pub fn phi(&self, phi: Phi) -> Result<&PhiData> {
        self.phis
            .get(phi)
            .ok_or(Error::InvalidParameter("unknown optimizer phi node"))
    }

    /// Attach a phi input for the given predecessor block.
    pub fn phi_attach(&mut self, phi: Phi, predecessor: Block, value: Value) -> Result<()> {
        let data = self
            .phis
            .get_mut(phi)
            .ok_or(Error::InvalidParameter("unknown optimizer phi node"))?;
        match data.links.entry(predecessor) {
            btree_map::Entry::Occupied(_) => Err(Error::InvalidState(
                "phi node already has a link for the predecessor block",
            )),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    /// Phi input attached for the given predecessor block.
    pub fn phi_link_for(&self, phi: Phi, predecessor: Block) -> Result<Value> {
        self.phi(phi)?
            .links
            .get(&predecessor)
            .copied()
            .ok_or(Error::NotFound("phi node has no link for the block"))
    }

    /// Create a call site in a block together with its instruction, with
    /// `argument_count` unfilled argument slots.
    pub fn new_call(
        &mut self,
        block: Block,
        callee: FuncDecl,
        argument_count: usize,
        indirect_callee: Option<Value>,
        tail: bool,
    ) -> Result<(Call, Value)> {
        if self.blocks.get(block).is_none() {
            return Err(Error::InvalidParameter("unknown optimizer code block"));
        }
        let call = self.calls.next_key();
        let op = if tail {
            OpInst::TailCall(call)
        } else {
            OpInst::Call(call)
        };
        let value = self.append(block, op)?;
        let created = self.calls.push(CallData {
            callee,
            instr: value,
            indirect_callee: indirect_callee.into(),
            return_space: PackedOption::default(),
            tail,
            arguments: vec![PackedOption::default(); argument_count],
        });
        debug_assert_eq!(created, call);
        Ok((call, value))
    }

    /// Call data by reference.
    pub fn call(&self, call: Call) -> Result<&CallData> {
        self.calls
            .get(call)
            .ok_or(Error::InvalidParameter("unknown optimizer call site"))
    }

    /// Fill in a call-site argument slot.
    pub fn call_set_argument(&mut self, call: Call, index: usize, value: Value) -> Result<()> {
        let data = self
            .calls
            .get_mut(call)
            .ok_or(Error::InvalidParameter("unknown optimizer call site"))?;
        let slot = data
            .arguments
            .get_mut(index)
            .ok_or(Error::InvalidParameter("call argument index out of bounds"))?;
        *slot = Some(value).into();
        Ok(())
    }

    /// Record the caller-provided aggregate return buffer of a call site.
    pub fn call_set_return_space(&mut self, call: Call, value: Value) -> Result<()> {
        let data = self
            .calls
            .get_mut(call)
            .ok_or(Error::InvalidParameter("unknown optimizer call site"))?;
        data.return_space = Some(value).into();
        Ok(())
    }

    /// Create an inline-assembly site in a block together with its
    /// instruction, with `parameter_count` unfilled parameter bindings.
    pub fn new_inline_assembly(
        &mut self,
        block: Block,
        fragment: InlineAsmId,
        parameter_count: usize,
    ) -> Result<(InlineAsm, Value)> {
        if self.blocks.get(block).is_none() {
            return Err(Error::InvalidParameter("unknown optimizer code block"));
        }
        let site = self.inline_asms.next_key();
        let value = self.append(block, OpInst::InlineAsm(site))?;
        let created = self.inline_asms.push(InlineAsmData {
            fragment,
            instr: value,
            default_jump_target: PackedOption::default(),
            parameters: vec![InlineAsmSiteParam::default(); parameter_count],
            jump_targets: BTreeMap::new(),
        });
        debug_assert_eq!(created, site);
        Ok((site, value))
    }

    /// Inline-assembly data by reference.
    pub fn inline_assembly(&self, site: InlineAsm) -> Result<&InlineAsmData> {
        self.inline_asms.get(site).ok_or(Error::InvalidParameter(
            "unknown optimizer inline assembly site",
        ))
    }

    /// Fill in an inline-assembly parameter binding.
    pub fn inline_assembly_set_parameter(
        &mut self,
        site: InlineAsm,
        index: usize,
        param: InlineAsmSiteParam,
    ) -> Result<()> {
        let data = self.inline_asms.get_mut(site).ok_or(Error::InvalidParameter(
            "unknown optimizer inline assembly site",
        ))?;
        let slot = data.parameters.get_mut(index).ok_or(Error::InvalidParameter(
            "inline assembly parameter index out of bounds",
        ))?;
        *slot = param;
        Ok(())
    }

    /// Record the fall-through successor of a branching inline-assembly
    /// site.
    pub fn inline_assembly_set_default_jump_target(
        &mut self,
        site: InlineAsm,
        target: Block,
    ) -> Result<()> {
        let data = self.inline_asms.get_mut(site).ok_or(Error::InvalidParameter(
            "unknown optimizer inline assembly site",
        ))?;
        data.default_jump_target = Some(target).into();
        Ok(())
    }

    /// Register a jump target of an inline-assembly site.
    pub fn inline_assembly_add_jump_target(
        &mut self,
        site: InlineAsm,
        uid: u64,
        target: Block,
    ) -> Result<()> {
        let data = self.inline_asms.get_mut(site).ok_or(Error::InvalidParameter(
            "unknown optimizer inline assembly site",
        ))?;
        match data.jump_targets.entry(uid) {
            btree_map::Entry::Occupied(_) => Err(Error::InvalidState(
                "duplicate inline assembly jump target identifier",
            )),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(target);
                Ok(())
            }
        }
    }

    /// Move an instruction within its block ordering so that it directly
    /// follows `after`, or sits at the block head when `after` is `None`.
    pub fn instruction_move_after(&mut self, value: Value, after: Option<Value>) -> Result<()> {
        let block = self.instr(value)?.block;
        if let Some(anchor) = after {
            if self.instr(anchor)?.block != block {
                return Err(Error::InvalidParameter(
                    "anchor instruction belongs to another block",
                ));
            }
        }
        let insts = &mut self.blocks[block].insts;
        let position = insts
            .iter()
            .position(|v| *v == value)
            .ok_or(Error::InvalidState("instruction missing from its block"))?;
        insts.remove(position);
        let insert_at = match after {
            None => 0,
            Some(anchor) => {
                insts
                    .iter()
                    .position(|v| *v == anchor)
                    .ok_or(Error::InvalidState("instruction missing from its block"))?
                    + 1
            }
        };
        insts.insert(insert_at, value);
        Ok(())
    }

    /// Whether the operation terminates a block.
    pub fn op_is_terminator(&self, op: &OpInst) -> bool {
        match op {
            OpInst::Jump { .. }
            | OpInst::Branch { .. }
            | OpInst::BranchCompare { .. }
            | OpInst::IndirectJump(_)
            | OpInst::Return(_)
            | OpInst::TailCall(_) => true,
            OpInst::InlineAsm(site) => self
                .inline_assembly(*site)
                .map(|data| data.has_jump_targets())
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalization_state_machine() {
        let mut code = Code::new();
        let b0 = code.new_block();
        let b1 = code.new_block();
        assert!(!code.is_finalized(b0).unwrap());

        let c = code.append(b0, OpInst::IntConst(1)).unwrap();
        code.finalize_branch(b0, BranchCondition::Bits64, c, b1, b1)
            .unwrap();
        assert!(code.is_finalized(b0).unwrap());
        assert_eq!(
            code.finalize_jump(b0, b1),
            Err(Error::InvalidState(
                "optimizer code block is already finalized"
            ))
        );

        // Control tail of a finalized block is its terminator.
        let tail = code.control_tail(b0).unwrap().unwrap();
        assert!(matches!(code.op(tail).unwrap(), OpInst::Branch { .. }));
    }

    #[test]
    fn phi_links() {
        let mut code = Code::new();
        let b0 = code.new_block();
        let b1 = code.new_block();
        let b2 = code.new_block();
        let v0 = code.append(b0, OpInst::IntConst(1)).unwrap();
        let v1 = code.append(b1, OpInst::IntConst(2)).unwrap();

        let (phi, phi_value) = code.new_phi(b2).unwrap();
        assert!(matches!(code.op(phi_value).unwrap(), OpInst::Phi(p) if *p == phi));

        code.phi_attach(phi, b0, v0).unwrap();
        code.phi_attach(phi, b1, v1).unwrap();
        assert_eq!(code.phi_link_for(phi, b0).unwrap(), v0);
        assert_eq!(code.phi_link_for(phi, b1).unwrap(), v1);
        assert!(matches!(
            code.phi_attach(phi, b0, v1),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            code.phi_link_for(phi, b2),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn move_instruction_to_head() {
        let mut code = Code::new();
        let b0 = code.new_block();
        let a = code.append(b0, OpInst::IntConst(1)).unwrap();
        let b = code.append(b0, OpInst::IntConst(2)).unwrap();
        let (_, phi_value) = code.new_phi(b0).unwrap();

        code.instruction_move_after(phi_value, None).unwrap();
        assert_eq!(code.block(b0).unwrap().insts(), &[phi_value, a, b]);

        code.instruction_move_after(phi_value, Some(a)).unwrap();
        assert_eq!(code.block(b0).unwrap().insts(), &[a, phi_value, b]);
    }

    #[test]
    fn call_argument_slots() {
        let mut code = Code::new();
        let b0 = code.new_block();
        let callee = FuncDecl::from_u32(0);
        let arg = code.append(b0, OpInst::IntConst(3)).unwrap();
        let (call, _) = code.new_call(b0, callee, 2, None, false).unwrap();
        code.call_set_argument(call, 1, arg).unwrap();
        let data = code.call(call).unwrap();
        assert!(data.arguments()[0].is_none());
        assert_eq!(data.arguments()[1].expand(), Some(arg));
        assert!(code.call_set_argument(call, 2, arg).is_err());
    }
}
