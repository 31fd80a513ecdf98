//! Translation of linear stack-machine IR into the SSA code container.
//!
//! Construction runs in three passes over the function body:
//!
//! 1. *Block identification.* Jump and branch targets, the instructions
//!    following terminators, inline-assembly jump targets and public labels
//!    all open basic blocks; block-label arguments and public labels are
//!    additionally recorded as potential indirect-jump targets.
//! 2. *Per-block translation.* Every block owns a symbolic operand stack.
//!    Stack manipulation opcodes rearrange it without emitting code; any
//!    access below the virtual stack bottom synthesizes a phi node at the
//!    block head whose inputs are filled in later.
//! 3. *Successor linking.* A depth-first walk from the entry block (and
//!    from every indirect-jump target) grows each successor's phi list to
//!    the predecessor's stack depth, then every terminator's stack tops are
//!    attached as phi inputs. Blocks the walk never reaches stay
//!    unreachable and their phis receive no inputs.

use log::trace;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use cranelift_entity::EntityRef;

use crate::ir::{self, Instr, TypeCode};
use crate::opt::code::{Block, Code, InlineAsmSiteParam, OpInst, Phi, Value};
use crate::opt::Function;
use crate::{Error, Result};

struct BlockState {
    block: Block,
    stack: Vec<Value>,
    phi_stack: Vec<Phi>,
    reachable: bool,
}

struct Constructor<'a> {
    module: &'a ir::Module,
    body: &'a ir::Body,
    function: &'a mut Function,
    /// Block states keyed by the IR offset the block starts at.
    block_states: BTreeMap<usize, BlockState>,
    /// Reverse index from block id to starting IR offset.
    block_offsets: HashMap<Block, usize>,
    indirect_jump_targets: BTreeSet<Block>,
    /// Starting offset of the block currently being translated.
    current: Option<usize>,
    location: usize,
    /// Lazily created local-variable allocations, keyed by local id.
    locals: HashMap<u64, Value>,
}

/// Construct the SSA code of `function` from the linear IR `body`.
///
/// The function's code container must be empty; on error it is left in an
/// unspecified state and must be discarded.
pub fn construct_function(
    module: &ir::Module,
    body: &ir::Body,
    function: &mut Function,
) -> Result<()> {
    if !function.code.is_empty() {
        return Err(Error::InvalidParameter(
            "expected an empty optimizer code container",
        ));
    }
    let mut constructor = Constructor {
        module,
        body,
        function,
        block_states: BTreeMap::new(),
        block_offsets: HashMap::new(),
        indirect_jump_targets: BTreeSet::new(),
        current: None,
        location: 0,
        locals: HashMap::new(),
    };
    constructor.identify_blocks()?;
    constructor.translate_code()?;
    constructor.link_blocks()
}

impl<'a> Constructor<'a> {
    fn code(&mut self) -> &mut Code {
        &mut self.function.code
    }

    fn start_block_at(&mut self, location: usize) -> Result<()> {
        if self.block_states.contains_key(&location) {
            return Ok(());
        }
        let block = self.function.code.new_block();
        trace!("opened {} at IR offset {}", block, location);
        self.block_offsets.insert(block, location);
        self.block_states.insert(
            location,
            BlockState {
                block,
                stack: Vec::new(),
                phi_stack: Vec::new(),
                reachable: false,
            },
        );
        Ok(())
    }

    fn block_at(&self, location: usize) -> Result<Block> {
        self.block_states
            .get(&location)
            .map(|state| state.block)
            .ok_or(Error::NotFound(
                "no optimizer code block starts at the IR offset",
            ))
    }

    fn mark_indirect_jump_target(&mut self, location: usize) -> Result<()> {
        let block = self.block_at(location)?;
        self.indirect_jump_targets.insert(block);
        Ok(())
    }

    fn state_of(&self, block: Block) -> Result<&BlockState> {
        let offset = self
            .block_offsets
            .get(&block)
            .ok_or(Error::InvalidState("block has no constructor state"))?;
        Ok(&self.block_states[offset])
    }

    fn state_of_mut(&mut self, block: Block) -> Result<&mut BlockState> {
        let offset = *self
            .block_offsets
            .get(&block)
            .ok_or(Error::InvalidState("block has no constructor state"))?;
        Ok(self
            .block_states
            .get_mut(&offset)
            .expect("offset index is kept in sync with block states"))
    }

    // Pass 1.

    fn identify_blocks(&mut self) -> Result<()> {
        let body = self.body;
        let mut start_new_block = true;
        let mut i = 0;
        while i < body.len() {
            if start_new_block {
                self.start_block_at(i)?;
            }
            start_new_block = false;

            match *body.at(i)? {
                Instr::BlockLabel(target) => {
                    self.start_block_at(target)?;
                    self.mark_indirect_jump_target(target)?;
                }
                Instr::Jump { target }
                | Instr::Branch { target, .. }
                | Instr::BranchCompare { target, .. } => {
                    self.start_block_at(target)?;
                    start_new_block = true;
                }
                Instr::IndirectJump | Instr::Return => {
                    start_new_block = true;
                }
                Instr::InlineAssembly(id) => {
                    let fragment = self.module.inline_assembly(id)?;
                    if !fragment.jump_targets.is_empty() {
                        let targets: Vec<usize> =
                            fragment.jump_targets.iter().map(|t| t.target).collect();
                        for target in targets {
                            self.start_block_at(target)?;
                        }
                        start_new_block = true;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        if start_new_block {
            self.start_block_at(i)?;
        }

        for (label, location) in body.public_labels() {
            self.start_block_at(location)?;
            self.mark_indirect_jump_target(location)?;
            let block = self.block_at(location)?;
            self.function.code.add_block_public_label(block, label)?;
        }
        Ok(())
    }

    // Pass 2.

    fn current_block(&self) -> Result<Block> {
        let key = self
            .current
            .ok_or(Error::InvalidState("no current optimizer code block"))?;
        Ok(self.block_states[&key].block)
    }

    fn update_current(&mut self, location: usize) -> Result<()> {
        let Some(state) = self.block_states.get(&location) else {
            return Ok(());
        };
        let next = state.block;
        if self.current == Some(location) {
            return Ok(());
        }
        if let Some(current_key) = self.current {
            let current_block = self.block_states[&current_key].block;
            if !self.function.code.is_finalized(current_block)? {
                // Fall-through edge between adjacent blocks.
                self.function.code.finalize_jump(current_block, next)?;
            }
        }
        self.current = Some(location);
        Ok(())
    }

    fn ensure_stack_depth(&mut self, depth: usize) -> Result<()> {
        let key = self
            .current
            .ok_or(Error::InvalidState("no current optimizer code block"))?;
        while self.block_states[&key].stack.len() < depth {
            let block = self.block_states[&key].block;
            let (phi, value) = self.function.code.new_phi(block)?;
            self.function.code.instruction_move_after(value, None)?;
            let state = self
                .block_states
                .get_mut(&key)
                .expect("current key names a block state");
            state.stack.insert(0, value);
            state.phi_stack.insert(0, phi);
        }
        Ok(())
    }

    fn stack_push(&mut self, value: Value) -> Result<()> {
        let key = self
            .current
            .ok_or(Error::InvalidState("no current optimizer code block"))?;
        self.block_states
            .get_mut(&key)
            .expect("current key names a block state")
            .stack
            .push(value);
        Ok(())
    }

    fn stack_pop(&mut self) -> Result<Value> {
        self.ensure_stack_depth(1)?;
        let key = self.current.expect("checked by ensure_stack_depth");
        self.block_states
            .get_mut(&key)
            .expect("current key names a block state")
            .stack
            .pop()
            .ok_or(Error::InternalError("operand stack is empty"))
    }

    fn stack_at(&mut self, index: usize) -> Result<Value> {
        self.ensure_stack_depth(index + 1)?;
        let key = self.current.expect("checked by ensure_stack_depth");
        let stack = &self.block_states[&key].stack;
        Ok(stack[stack.len() - index - 1])
    }

    fn stack_exchange(&mut self, index: usize) -> Result<()> {
        self.ensure_stack_depth(index + 1)?;
        let key = self.current.expect("checked by ensure_stack_depth");
        let stack = &mut self
            .block_states
            .get_mut(&key)
            .expect("current key names a block state")
            .stack;
        let top = stack.len() - 1;
        let other = stack.len() - index - 1;
        stack.swap(top, other);
        Ok(())
    }

    fn translate_code(&mut self) -> Result<()> {
        let body = self.body;
        self.current = None;
        self.location = 0;
        self.update_current(0)?;
        while self.location < body.len() {
            self.update_current(self.location)?;
            let instr = *body.at(self.location)?;

            self.function
                .debug_info
                .set_instruction_location_cursor(Some(self.location));
            let first_new = self.function.code.num_insts();
            self.translate_instruction(instr)?;
            for index in first_new..self.function.code.num_insts() {
                self.function.debug_info.register_instruction(Value::new(index));
            }
            self.function.debug_info.set_instruction_location_cursor(None);

            self.location += 1;
        }

        self.update_current(self.location)?;
        let last = self.current_block()?;
        if !self.function.code.is_finalized(last)? {
            self.function.code.finalize_return(last, None)?;
        }
        Ok(())
    }

    fn local_allocation(&mut self, id: u64, type_index: u32) -> Result<Value> {
        if let Some(&allocation) = self.locals.get(&id) {
            return Ok(allocation);
        }
        let block = self.current_block()?;
        let allocation = self.function.code.append(block, OpInst::AllocLocal { type_index })?;
        self.locals.insert(id, allocation);
        Ok(allocation)
    }

    fn translate_instruction(&mut self, instr: Instr) -> Result<()> {
        let block = self.current_block()?;
        match instr {
            Instr::Nop => {}

            Instr::Jump { target } => {
                let target_block = self.block_at(target)?;
                self.code().finalize_jump(block, target_block)?;
            }
            Instr::Branch { target, condition } => {
                let condition_value = self.stack_pop()?;
                let target_block = self.block_at(target)?;
                let alternative_block = self.block_at(self.location + 1)?;
                self.code().finalize_branch(
                    block,
                    condition,
                    condition_value,
                    target_block,
                    alternative_block,
                )?;
            }
            Instr::BranchCompare { target, comparison } => {
                let right = self.stack_pop()?;
                let left = self.stack_pop()?;
                let target_block = self.block_at(target)?;
                let alternative_block = self.block_at(self.location + 1)?;
                self.code().finalize_branch_compare(
                    block,
                    comparison,
                    left,
                    right,
                    target_block,
                    alternative_block,
                )?;
            }
            Instr::IndirectJump => {
                let target = self.stack_pop()?;
                self.code().finalize_indirect_jump(block, target)?;
            }
            Instr::Return => {
                let decl = self.module.function_decl(self.function.decl)?;
                let value = if decl.returns() {
                    Some(self.stack_pop()?)
                } else {
                    None
                };
                self.code().finalize_return(block, value)?;
            }

            Instr::Select(condition) => {
                let false_value = self.stack_pop()?;
                let true_value = self.stack_pop()?;
                let condition_value = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::Select {
                        condition,
                        condition_value,
                        true_value,
                        false_value,
                    },
                )?;
                self.stack_push(value)?;
            }
            Instr::SelectCompare(comparison) => {
                let false_value = self.stack_pop()?;
                let true_value = self.stack_pop()?;
                let right = self.stack_pop()?;
                let left = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::SelectCompare {
                        comparison,
                        left,
                        right,
                        true_value,
                        false_value,
                    },
                )?;
                self.stack_push(value)?;
            }

            Instr::IntConst(v) => {
                let value = self.code().append(block, OpInst::IntConst(v))?;
                self.stack_push(value)?;
            }
            Instr::UintConst(v) => {
                let value = self.code().append(block, OpInst::UintConst(v))?;
                self.stack_push(value)?;
            }
            Instr::Float32Const(v) => {
                let value = self.code().append(block, OpInst::Float32Const(v))?;
                self.stack_push(value)?;
            }
            Instr::Float64Const(v) => {
                let value = self.code().append(block, OpInst::Float64Const(v))?;
                self.stack_push(value)?;
            }
            Instr::LongDoubleConst(v) => {
                let value = self.code().append(block, OpInst::LongDoubleConst(v))?;
                self.stack_push(value)?;
            }
            Instr::BitintSignedConst(id) => {
                let value = self.code().append(block, OpInst::BitintSignedConst(id))?;
                self.stack_push(value)?;
            }
            Instr::BitintUnsignedConst(id) => {
                let value = self.code().append(block, OpInst::BitintUnsignedConst(id))?;
                self.stack_push(value)?;
            }
            Instr::StringRef(id) => {
                let value = self.code().append(block, OpInst::StringRef(id))?;
                self.stack_push(value)?;
            }
            Instr::BlockLabel(target) => {
                let target_block = self.block_at(target)?;
                let value = self.code().append(block, OpInst::BlockLabel(target_block))?;
                self.stack_push(value)?;
            }
            Instr::IntPlaceholder => {
                let value = self.code().append(block, OpInst::IntPlaceholder)?;
                self.stack_push(value)?;
            }
            Instr::Float32Placeholder => {
                let value = self.code().append(block, OpInst::Float32Placeholder)?;
                self.stack_push(value)?;
            }
            Instr::Float64Placeholder => {
                let value = self.code().append(block, OpInst::Float64Placeholder)?;
                self.stack_push(value)?;
            }

            Instr::VStackPick(depth) => {
                let value = self.stack_at(depth)?;
                self.stack_push(value)?;
            }
            Instr::VStackPop => {
                self.stack_pop()?;
            }
            Instr::VStackExchange(depth) => {
                self.stack_exchange(depth)?;
            }

            Instr::GetGlobal(id) => {
                let value = self.code().append(block, OpInst::GetGlobal(id))?;
                self.stack_push(value)?;
            }
            Instr::GetThreadLocal(id) => {
                let value = self.code().append(block, OpInst::GetThreadLocal(id))?;
                self.stack_push(value)?;
            }
            Instr::GetLocal {
                id,
                type_index,
                offset,
            } => {
                let allocation = self.local_allocation(id, type_index)?;
                if offset != 0 {
                    let value = self
                        .code()
                        .append(block, OpInst::GetLocal { allocation, offset })?;
                    self.stack_push(value)?;
                } else {
                    self.stack_push(allocation)?;
                }
            }
            Instr::GetArgument(index) => {
                let value = self.code().append(block, OpInst::GetArgument(index))?;
                self.stack_push(value)?;
            }

            Instr::Load { width, volatile } => {
                let location = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::Load {
                        width,
                        location,
                        volatile,
                    },
                )?;
                self.stack_push(value)?;
            }
            Instr::Store { width, volatile } => {
                let value = self.stack_pop()?;
                let location = self.stack_pop()?;
                let store = self.code().append(
                    block,
                    OpInst::Store {
                        width,
                        location,
                        value,
                        volatile,
                    },
                )?;
                self.code().add_control(block, store)?;
            }
            Instr::ZeroMemory {
                type_id,
                type_index,
            } => {
                let location = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::ZeroMemory {
                        location,
                        type_id,
                        type_index,
                    },
                )?;
                self.code().add_control(block, value)?;
            }
            Instr::CopyMemory {
                type_id,
                type_index,
            } => {
                let source = self.stack_pop()?;
                let destination = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::CopyMemory {
                        destination,
                        source,
                        type_id,
                        type_index,
                    },
                )?;
                self.code().add_control(block, value)?;
            }

            Instr::BitsExtractSigned { offset, length } => {
                let base = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::BitsExtractSigned {
                        base,
                        offset,
                        length,
                    },
                )?;
                self.stack_push(value)?;
            }
            Instr::BitsExtractUnsigned { offset, length } => {
                let base = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::BitsExtractUnsigned {
                        base,
                        offset,
                        length,
                    },
                )?;
                self.stack_push(value)?;
            }
            Instr::BitsInsert { offset, length } => {
                let value = self.stack_pop()?;
                let base = self.stack_pop()?;
                let result = self.code().append(
                    block,
                    OpInst::BitsInsert {
                        base,
                        value,
                        offset,
                        length,
                    },
                )?;
                self.stack_push(result)?;
            }

            Instr::IntUnary(op, width) => {
                let operand = self.stack_pop()?;
                let value = self.code().append(block, OpInst::IntUnary(op, width, operand))?;
                self.stack_push(value)?;
            }
            Instr::IntBinary(op, width) => {
                let right = self.stack_pop()?;
                let left = self.stack_pop()?;
                let value = self
                    .code()
                    .append(block, OpInst::IntBinary(op, width, left, right))?;
                self.stack_push(value)?;
            }
            Instr::IntSignExtend(width) => {
                let operand = self.stack_pop()?;
                let value = self.code().append(block, OpInst::IntSignExtend(width, operand))?;
                self.stack_push(value)?;
            }
            Instr::IntZeroExtend(width) => {
                let operand = self.stack_pop()?;
                let value = self.code().append(block, OpInst::IntZeroExtend(width, operand))?;
                self.stack_push(value)?;
            }

            Instr::FloatNeg(width) => {
                let operand = self.stack_pop()?;
                let value = self.code().append(block, OpInst::FloatNeg(width, operand))?;
                self.stack_push(value)?;
            }
            Instr::FloatBinary(op, width) => {
                let right = self.stack_pop()?;
                let left = self.stack_pop()?;
                let value = self
                    .code()
                    .append(block, OpInst::FloatBinary(op, width, left, right))?;
                self.stack_push(value)?;
            }
            Instr::LongDoubleNeg => {
                let operand = self.stack_pop()?;
                let value = self.code().append(block, OpInst::LongDoubleNeg(operand))?;
                self.stack_push(value)?;
            }
            Instr::LongDoubleBinary(op) => {
                let right = self.stack_pop()?;
                let left = self.stack_pop()?;
                let value = self
                    .code()
                    .append(block, OpInst::LongDoubleBinary(op, left, right))?;
                self.stack_push(value)?;
            }
            Instr::ComplexUnary(op, width) => {
                let operand = self.stack_pop()?;
                let value = self.code().append(block, OpInst::ComplexUnary(op, width, operand))?;
                self.stack_push(value)?;
            }
            Instr::ComplexBinary(op, width) => {
                let right = self.stack_pop()?;
                let left = self.stack_pop()?;
                let value = self
                    .code()
                    .append(block, OpInst::ComplexBinary(op, width, left, right))?;
                self.stack_push(value)?;
            }

            Instr::ScalarCompare(comparison) => {
                let right = self.stack_pop()?;
                let left = self.stack_pop()?;
                let value = self
                    .code()
                    .append(block, OpInst::ScalarCompare(comparison, left, right))?;
                self.stack_push(value)?;
            }
            Instr::Conversion(op) => {
                let operand = self.stack_pop()?;
                let value = self.code().append(block, OpInst::Conversion(op, operand))?;
                self.stack_push(value)?;
            }

            Instr::VarargStart => {
                let list = self.stack_pop()?;
                let value = self.code().append(block, OpInst::VarargStart(list))?;
                self.code().add_control(block, value)?;
            }
            Instr::VarargEnd => {
                let list = self.stack_pop()?;
                let value = self.code().append(block, OpInst::VarargEnd(list))?;
                self.code().add_control(block, value)?;
            }
            Instr::VarargGet {
                type_id,
                type_index,
            } => {
                let source = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::VarargGet {
                        source,
                        type_id,
                        type_index,
                    },
                )?;
                self.stack_push(value)?;
                self.code().add_control(block, value)?;
            }
            Instr::VarargCopy => {
                let source = self.stack_pop()?;
                let destination = self.stack_pop()?;
                let value = self
                    .code()
                    .append(block, OpInst::VarargCopy {
                        destination,
                        source,
                    })?;
                self.code().add_control(block, value)?;
            }

            Instr::StackAlloc { within_scope } => {
                let alignment = self.stack_pop()?;
                let size = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::StackAlloc {
                        size,
                        alignment,
                        within_scope,
                    },
                )?;
                self.stack_push(value)?;
            }
            Instr::ScopePush => {
                let value = self.code().append(block, OpInst::ScopePush)?;
                self.stack_push(value)?;
                self.code().add_control(block, value)?;
            }
            Instr::ScopePop => {
                let scope = self.stack_pop()?;
                let value = self.code().append(block, OpInst::ScopePop(scope))?;
                self.code().add_control(block, value)?;
            }
            Instr::LocalLifetimeMark => {
                let local = self.stack_pop()?;
                let value = self.code().append(block, OpInst::LocalLifetimeMark(local))?;
                self.code().add_control(block, value)?;
            }

            Instr::AtomicLoad { width, order } => {
                let location = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::AtomicLoad {
                        width,
                        location,
                        order,
                    },
                )?;
                self.code().add_control(block, value)?;
                self.stack_push(value)?;
            }
            Instr::AtomicStore { width, order } => {
                let value = self.stack_pop()?;
                let location = self.stack_pop()?;
                let store = self.code().append(
                    block,
                    OpInst::AtomicStore {
                        width,
                        location,
                        value,
                        order,
                    },
                )?;
                self.code().add_control(block, store)?;
            }
            Instr::AtomicCompareExchange { width, order } => {
                let desired = self.stack_pop()?;
                let expected = self.stack_pop()?;
                let location = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::AtomicCompareExchange {
                        width,
                        location,
                        expected,
                        desired,
                        order,
                    },
                )?;
                self.code().add_control(block, value)?;
                self.stack_push(value)?;
            }
            Instr::AtomicCopyMemoryFrom {
                order,
                type_id,
                type_index,
            } => {
                let source = self.stack_pop()?;
                let destination = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::AtomicCopyMemoryFrom {
                        destination,
                        source,
                        order,
                        type_id,
                        type_index,
                    },
                )?;
                self.code().add_control(block, value)?;
            }
            Instr::AtomicCopyMemoryTo {
                order,
                type_id,
                type_index,
            } => {
                let source = self.stack_pop()?;
                let destination = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::AtomicCopyMemoryTo {
                        destination,
                        source,
                        order,
                        type_id,
                        type_index,
                    },
                )?;
                self.code().add_control(block, value)?;
            }

            Instr::OverflowArith { op, signedness } => {
                let result_pointer = self.stack_pop()?;
                let right = self.stack_pop()?;
                let left = self.stack_pop()?;
                let value = self.code().append(
                    block,
                    OpInst::OverflowArith {
                        op,
                        left,
                        right,
                        result_pointer,
                        signedness,
                    },
                )?;
                self.code().add_control(block, value)?;
                self.stack_push(value)?;
            }

            Instr::Invoke(decl) => self.translate_invoke(block, decl, false, false)?,
            Instr::TailInvoke(decl) => self.translate_invoke(block, decl, false, true)?,
            Instr::InvokeVirtual(decl) => self.translate_invoke(block, decl, true, false)?,
            Instr::TailInvokeVirtual(decl) => self.translate_invoke(block, decl, true, true)?,

            Instr::InlineAssembly(id) => self.translate_inline_assembly(block, id)?,

            Instr::FenvSave => {
                let value = self.code().append(block, OpInst::FenvSave)?;
                self.stack_push(value)?;
                self.code().add_control(block, value)?;
            }
            Instr::FenvClear => {
                let value = self.code().append(block, OpInst::FenvClear)?;
                self.code().add_control(block, value)?;
            }
            Instr::FenvUpdate => {
                let env = self.stack_pop()?;
                let value = self.code().append(block, OpInst::FenvUpdate(env))?;
                self.code().add_control(block, value)?;
            }
        }
        Ok(())
    }

    fn translate_invoke(
        &mut self,
        block: Block,
        decl: ir::FuncDecl,
        virtual_call: bool,
        tail: bool,
    ) -> Result<()> {
        let module = self.module;
        let declaration = module.function_decl(decl)?;
        let num_params = declaration.params.children();
        let has_return = declaration.returns();
        let aggregate_return = match declaration.result.at(0) {
            Ok(entry) => matches!(
                entry.code,
                TypeCode::Struct { .. } | TypeCode::Union { .. } | TypeCode::Array { .. }
            ),
            Err(_) => false,
        };

        let indirect_callee = if virtual_call {
            Some(self.stack_at(num_params)?)
        } else {
            None
        };
        let (call, value) = self
            .function
            .code
            .new_call(block, decl, num_params, indirect_callee, tail)?;
        for i in 0..num_params {
            let argument = self.stack_pop()?;
            self.function
                .code
                .call_set_argument(call, num_params - i - 1, argument)?;
        }
        if virtual_call {
            self.stack_pop()?;
        }
        if aggregate_return {
            let return_space = self.stack_pop()?;
            self.function.code.call_set_return_space(call, return_space)?;
        }

        self.function.code.add_control(block, value)?;
        if has_return {
            self.stack_push(value)?;
        }
        Ok(())
    }

    fn translate_inline_assembly(&mut self, block: Block, id: ir::InlineAsmId) -> Result<()> {
        use crate::ir::InlineAsmParamClass::*;

        let module = self.module;
        let fragment = module.inline_assembly(id)?;

        let mut num_parameter_indices = 0;
        for param in &fragment.parameters {
            match param.class {
                Load | Store | LoadStore => {
                    num_parameter_indices = num_parameter_indices.max(param.load_store_index + 1);
                }
                ReadStore => {
                    num_parameter_indices = num_parameter_indices.max(param.load_store_index + 1);
                    num_parameter_indices = num_parameter_indices.max(param.read_index + 1);
                }
                Read => {
                    num_parameter_indices = num_parameter_indices.max(param.read_index + 1);
                }
                Immediate => {}
            }
        }

        let (site, value) =
            self.function
                .code
                .new_inline_assembly(block, id, fragment.parameters.len())?;

        for (index, param) in fragment.parameters.iter().enumerate() {
            let mut binding = InlineAsmSiteParam::default();
            match param.class {
                Load | Store | LoadStore => {
                    binding.load_store = Some(self.stack_at(param.load_store_index)?).into();
                }
                ReadStore => {
                    binding.load_store = Some(self.stack_at(param.load_store_index)?).into();
                    binding.read = Some(self.stack_at(param.read_index)?).into();
                }
                Read => {
                    binding.read = Some(self.stack_at(param.read_index)?).into();
                }
                Immediate => continue,
            }
            self.function
                .code
                .inline_assembly_set_parameter(site, index, binding)?;
        }

        self.function.code.add_control(block, value)?;

        for _ in 0..num_parameter_indices {
            self.stack_pop()?;
        }

        if !fragment.jump_targets.is_empty() {
            let default_block = self.block_at(self.location + 1)?;
            self.function
                .code
                .inline_assembly_set_default_jump_target(site, default_block)?;
            let targets: Vec<(u64, usize)> = fragment
                .jump_targets
                .iter()
                .map(|t| (t.uid, t.target))
                .collect();
            for (uid, target) in targets {
                let target_block = self.block_at(target)?;
                self.function
                    .code
                    .inline_assembly_add_jump_target(site, uid, target_block)?;
            }
        }
        Ok(())
    }

    // Pass 3.

    fn link_blocks(&mut self) -> Result<()> {
        self.traverse(self.function.code.entry())?;
        let indirect_targets: Vec<Block> = self.indirect_jump_targets.iter().copied().collect();
        for target in indirect_targets {
            self.traverse(target)?;
        }
        let blocks: Vec<Block> = self.function.code.blocks().collect();
        for block in blocks {
            self.link_terminator(block)?;
        }
        Ok(())
    }

    fn equalize_stack(&mut self, source: Block, target: Block) -> Result<()> {
        let source_depth = self.state_of(source)?.stack.len();
        while self.state_of(target)?.phi_stack.len() < source_depth {
            let (phi, value) = self.function.code.new_phi(target)?;
            self.function.code.instruction_move_after(value, None)?;
            let state = self.state_of_mut(target)?;
            state.stack.insert(0, value);
            state.phi_stack.insert(0, phi);
        }
        Ok(())
    }

    fn traverse(&mut self, block: Block) -> Result<()> {
        {
            let state = self.state_of_mut(block)?;
            if state.reachable {
                return Ok(());
            }
            state.reachable = true;
        }

        let tail = self
            .function
            .code
            .control_tail(block)?
            .ok_or(Error::InvalidState(
                "encountered unterminated optimizer code block",
            ))?;
        let op = *self.function.code.op(tail)?;
        match op {
            OpInst::Jump { target } => {
                self.equalize_stack(block, target)?;
                self.traverse(target)?;
            }
            OpInst::Branch {
                target,
                alternative,
                ..
            }
            | OpInst::BranchCompare {
                target,
                alternative,
                ..
            } => {
                self.equalize_stack(block, target)?;
                self.equalize_stack(block, alternative)?;
                self.traverse(target)?;
                self.traverse(alternative)?;
            }
            OpInst::IndirectJump(_) | OpInst::Return(_) | OpInst::TailCall(_) => {}
            OpInst::InlineAsm(site) => {
                let data = self.function.code.inline_assembly(site)?;
                if data.has_jump_targets() {
                    let default_target = data.default_jump_target.expand().ok_or(
                        Error::InvalidState("branching inline assembly has no default target"),
                    )?;
                    let targets: Vec<Block> = data.jump_targets().map(|(_, b)| b).collect();
                    self.equalize_stack(block, default_target)?;
                    for target in &targets {
                        self.equalize_stack(block, *target)?;
                    }
                    self.traverse(default_target)?;
                    for target in targets {
                        self.traverse(target)?;
                    }
                }
            }
            _ => {
                return Err(Error::InvalidState(
                    "encountered unterminated optimizer code block",
                ))
            }
        }
        Ok(())
    }

    fn link_edge(&mut self, source: Block, target: Block) -> Result<()> {
        let source_state = self.state_of(source)?;
        if !source_state.reachable {
            return Ok(());
        }
        let stack = source_state.stack.clone();
        let phi_stack = self.state_of(target)?.phi_stack.clone();
        if phi_stack.len() > stack.len() {
            return Err(Error::InvalidState(
                "unable to link optimizer block outputs with target block phi nodes",
            ));
        }
        for (value, phi) in stack.iter().rev().zip(phi_stack.iter().rev()) {
            match self.function.code.phi_link_for(*phi, source) {
                Ok(existing) => {
                    if existing != *value {
                        return Err(Error::InvalidState(
                            "mismatch with existing phi link for a source block",
                        ));
                    }
                }
                Err(Error::NotFound(_)) => {
                    self.function.code.phi_attach(*phi, source, *value)?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn link_terminator(&mut self, block: Block) -> Result<()> {
        let Some(tail) = self.function.code.control_tail(block)? else {
            return Ok(());
        };
        let op = *self.function.code.op(tail)?;
        match op {
            OpInst::Jump { target } => self.link_edge(block, target)?,
            OpInst::Branch {
                target,
                alternative,
                ..
            }
            | OpInst::BranchCompare {
                target,
                alternative,
                ..
            } => {
                self.link_edge(block, target)?;
                self.link_edge(block, alternative)?;
            }
            OpInst::IndirectJump(_) => {
                // Indirect jumps transfer no stack values; every potential
                // target must be phi-free.
                let targets: Vec<Block> = self.indirect_jump_targets.iter().copied().collect();
                for target in targets {
                    if !self.state_of(target)?.phi_stack.is_empty() {
                        return Err(Error::InvalidState(
                            "potential target of indirect jump shall have no phi nodes",
                        ));
                    }
                }
            }
            OpInst::InlineAsm(site) => {
                let data = self.function.code.inline_assembly(site)?;
                if data.has_jump_targets() {
                    let default_target = data.default_jump_target.expand().ok_or(
                        Error::InvalidState("branching inline assembly has no default target"),
                    )?;
                    let targets: Vec<Block> = data.jump_targets().map(|(_, b)| b).collect();
                    self.link_edge(block, default_target)?;
                    for target in targets {
                        self.link_edge(block, target)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{IrType, TypeEntry};
    use crate::ir::{BranchCondition, Builder, FunctionDecl};

    fn test_module(result: IrType) -> (ir::Module, ir::FuncDecl) {
        let mut module = ir::Module::new();
        let decl = module.declare_function(FunctionDecl {
            name: "test".to_string(),
            params: IrType::new(),
            result,
            vararg: false,
        });
        (module, decl)
    }

    fn int_result() -> IrType {
        IrType::from_entries(vec![TypeEntry::new(TypeCode::Int)])
    }

    #[test]
    fn constant_return_roundtrip() {
        let (module, decl) = test_module(int_result());
        let mut body = ir::Body::new();
        {
            let mut builder = Builder::new(&mut body);
            builder.append(Instr::IntConst(7));
            builder.append(Instr::Return);
        }

        let mut function = Function::new(decl);
        construct_function(&module, &body, &mut function).unwrap();

        let entry = function.code.entry();
        let tail = function.code.control_tail(entry).unwrap().unwrap();
        let OpInst::Return(value) = function.code.op(tail).unwrap() else {
            panic!("expected return terminator");
        };
        let returned = value.expand().unwrap();
        assert_eq!(*function.code.op(returned).unwrap(), OpInst::IntConst(7));
        assert!(function.code.is_finalized(entry).unwrap());
        assert_eq!(function.debug_info.instruction_location(returned), Some(0));
    }

    #[test]
    fn void_return_pops_nothing() {
        let (module, decl) = test_module(IrType::new());
        let mut body = ir::Body::new();
        {
            let mut builder = Builder::new(&mut body);
            builder.append(Instr::IntConst(1));
            builder.append(Instr::Return);
        }
        let mut function = Function::new(decl);
        construct_function(&module, &body, &mut function).unwrap();
        let tail = function
            .code
            .control_tail(function.code.entry())
            .unwrap()
            .unwrap();
        assert_eq!(
            *function.code.op(tail).unwrap(),
            OpInst::Return(None.into())
        );
    }

    #[test]
    fn diamond_merges_through_phi() {
        // 0: IntConst 0        condition
        // 1: Branch @4
        // 2: IntConst 1        left arm value
        // 3: Jump @5
        // 4: IntConst 2        right arm value
        // 5: Return            pops the merged value
        let (module, decl) = test_module(int_result());
        let mut body = ir::Body::new();
        {
            let mut builder = Builder::new(&mut body);
            builder.append(Instr::IntConst(0));
            builder.append(Instr::Branch {
                target: 4,
                condition: BranchCondition::Bits64,
            });
            builder.append(Instr::IntConst(1));
            builder.append(Instr::Jump { target: 5 });
            builder.append(Instr::IntConst(2));
            builder.append(Instr::Return);
        }

        let mut function = Function::new(decl);
        construct_function(&module, &body, &mut function).unwrap();
        let code = &function.code;

        // Blocks start at offsets 0, 2, 4 and 5, plus the trailing block
        // opened after the final return.
        assert_eq!(code.num_blocks(), 5);
        let entry = code.entry();
        let tail = code.control_tail(entry).unwrap().unwrap();
        let OpInst::Branch {
            target,
            alternative,
            condition_value,
            ..
        } = *code.op(tail).unwrap()
        else {
            panic!("expected branch terminator");
        };
        assert_eq!(*code.op(condition_value).unwrap(), OpInst::IntConst(0));

        // The join block holds one phi fed by both arms.
        let join_tail = {
            let mut join = None;
            for block in code.blocks() {
                let data = code.block(block).unwrap();
                if data.phis().len() == 1 {
                    assert!(join.is_none());
                    join = Some(block);
                }
            }
            join.expect("join block with a phi")
        };
        let data = code.block(join_tail).unwrap();
        let phi = data.phis()[0];
        let phi_data = code.phi(phi).unwrap();
        assert_eq!(phi_data.num_links(), 2);
        let mut inputs: Vec<i64> = phi_data
            .links()
            .map(|(_, value)| match code.op(value).unwrap() {
                OpInst::IntConst(v) => *v,
                other => panic!("unexpected phi input {other:?}"),
            })
            .collect();
        inputs.sort_unstable();
        assert_eq!(inputs, vec![1, 2]);

        // The phi instruction sits at the head of its block.
        assert_eq!(data.insts()[0], phi_data.instr);

        // The return consumes the phi value.
        let ret = code.control_tail(join_tail).unwrap().unwrap();
        let OpInst::Return(value) = *code.op(ret).unwrap() else {
            panic!("expected return terminator");
        };
        assert_eq!(value.expand().unwrap(), phi_data.instr);
        assert_ne!(target, alternative);
    }

    #[test]
    fn fall_through_blocks_get_jump_terminators() {
        // A branch target in the middle of straight-line code forces a
        // fall-through edge between adjacent blocks.
        let (module, decl) = test_module(IrType::new());
        let mut body = ir::Body::new();
        {
            let mut builder = Builder::new(&mut body);
            builder.append(Instr::IntConst(1)); // 0
            builder.append(Instr::Branch {
                target: 3,
                condition: BranchCondition::Bits8,
            }); // 1
            builder.append(Instr::Nop); // 2
            builder.append(Instr::Nop); // 3: branch target
            builder.append(Instr::Return); // 4
        }
        let mut function = Function::new(decl);
        construct_function(&module, &body, &mut function).unwrap();
        let code = &function.code;
        // Blocks at offsets 0, 2 and 3, plus the trailing block.
        assert_eq!(code.num_blocks(), 4);
        for block in code.blocks() {
            assert!(code.is_finalized(block).unwrap());
        }
    }

    #[test]
    fn indirect_jump_targets_must_be_phi_free() {
        // Public labels make both blocks indirect-jump targets; the
        // operand stack is balanced at every edge so this must succeed.
        let (module, decl) = test_module(IrType::new());
        let mut body = ir::Body::new();
        {
            let mut builder = Builder::new(&mut body);
            builder.append(Instr::BlockLabel(2)); // 0
            builder.append(Instr::IndirectJump); // 1
            builder.append(Instr::Return); // 2
        }
        body.declare_public_label("resume", 2).unwrap();

        let mut function = Function::new(decl);
        construct_function(&module, &body, &mut function).unwrap();

        let code = &function.code;
        let labeled = code
            .blocks()
            .find(|b| !code.block(*b).unwrap().public_labels().is_empty())
            .unwrap();
        assert_eq!(code.block(labeled).unwrap().public_labels(), &["resume"]);
    }

    #[test]
    fn invoke_builds_call_site() {
        let mut module = ir::Module::new();
        let callee = module.declare_function(FunctionDecl {
            name: "callee".to_string(),
            params: IrType::from_entries(vec![
                TypeEntry::new(TypeCode::Int),
                TypeEntry::new(TypeCode::Int),
            ]),
            result: int_result(),
            vararg: false,
        });
        let decl = module.declare_function(FunctionDecl {
            name: "caller".to_string(),
            params: IrType::new(),
            result: int_result(),
            vararg: false,
        });

        let mut body = ir::Body::new();
        {
            let mut builder = Builder::new(&mut body);
            builder.append(Instr::IntConst(10));
            builder.append(Instr::IntConst(20));
            builder.append(Instr::Invoke(callee));
            builder.append(Instr::Return);
        }

        let mut function = Function::new(decl);
        construct_function(&module, &body, &mut function).unwrap();
        let code = &function.code;

        let entry = code.block(code.entry()).unwrap();
        let call_value = entry.control()[0];
        let OpInst::Call(call) = *code.op(call_value).unwrap() else {
            panic!("expected call instruction");
        };
        let call_data = code.call(call).unwrap();
        assert_eq!(call_data.callee, callee);
        assert!(!call_data.tail);
        let args: Vec<i64> = call_data
            .arguments()
            .iter()
            .map(|arg| match code.op(arg.expand().unwrap()).unwrap() {
                OpInst::IntConst(v) => *v,
                other => panic!("unexpected argument {other:?}"),
            })
            .collect();
        assert_eq!(args, vec![10, 20]);

        // The call result is what the function returns.
        let tail = code.control_tail(code.entry()).unwrap().unwrap();
        let OpInst::Return(value) = *code.op(tail).unwrap() else {
            panic!("expected return terminator");
        };
        assert_eq!(value.expand().unwrap(), call_value);
    }

    #[test]
    fn loop_back_edge_links_phi_inputs() {
        // A value carried around a loop through the operand stack:
        //
        // 0: IntConst 1
        // 1: BlockLabel 1 is not used; loop head starts here via jump
        //    target below.
        //
        // Layout:
        // 0: IntConst 1          seed
        // 1: Jump @2             enter loop head
        // 2: VStackPick 0        loop head: duplicate carried value
        // 3: Branch @2           loop back while non-zero
        // 4: Return              exit, returning the carried value
        let (module, decl) = test_module(int_result());
        let mut body = ir::Body::new();
        {
            let mut builder = Builder::new(&mut body);
            builder.append(Instr::IntConst(1));
            builder.append(Instr::Jump { target: 2 });
            builder.append(Instr::VStackPick(0));
            builder.append(Instr::Branch {
                target: 2,
                condition: BranchCondition::Bits64,
            });
            builder.append(Instr::Return);
        }

        let mut function = Function::new(decl);
        construct_function(&module, &body, &mut function).unwrap();
        let code = &function.code;

        // The loop head receives a phi merging the seed and the
        // loop-carried copy.
        let head = code
            .blocks()
            .find(|b| !code.block(*b).unwrap().phis().is_empty())
            .expect("loop head with phi");
        let phi = code.block(head).unwrap().phis()[0];
        assert_eq!(code.phi(phi).unwrap().num_links(), 2);
    }
}
