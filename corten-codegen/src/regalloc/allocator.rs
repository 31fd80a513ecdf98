//! The live-range interference allocator.

use cranelift_entity::{EntityRef, SecondaryMap};
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};
use std::mem::discriminant;

use crate::abi::pad_aligned;
use crate::frame::StackFrame;
use crate::isa::{x64, Reg};
use crate::regalloc::BitSet;
use crate::vcode::{
    AsmValue, IndirectBasis, Preallocation, Stash, VCode, VInstr, VReg, VRegType,
    VirtualBlockId, DEFAULT_VIRTUAL_BLOCK,
};
use crate::{Error, Result};

/// Inclusive interval of linearized instruction indices a virtual register
/// is live over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lifetime {
    /// First instruction mentioning the register.
    pub begin: usize,
    /// Last instruction mentioning the register.
    pub end: usize,
}

/// Result of allocating one virtual register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Allocation {
    /// Not allocated yet.
    #[default]
    Unallocated,
    /// Assigned a physical register.
    Register(Reg),
    /// Holds its value directly in spill slots.
    SpillDirect {
        /// First slot index.
        index: usize,
        /// Number of slots.
        length: usize,
    },
    /// Owns spill slots addressed indirectly (spill-space registers and
    /// sized stashes).
    SpillIndirect {
        /// First slot index.
        index: usize,
        /// Number of slots.
        length: usize,
    },
    /// Lives at the selector-fixed memory location.
    MemoryPointer,
    /// Materialized as an integer immediate.
    ImmediateInteger,
    /// Resolved by local-variable frame layout.
    LocalVariable,
    /// Allocated through the two component registers.
    Pair,
}

#[derive(Clone, Debug, Default)]
struct VRegState {
    lifetime: Option<Lifetime>,
    interference: BTreeSet<VReg>,
    virtual_blocks: BTreeSet<VirtualBlockId>,
    allocation: Allocation,
}

#[derive(Clone, Debug)]
struct VirtualBlockData {
    parent: Option<VirtualBlockId>,
    vregs: BTreeSet<VReg>,
}

struct RegisterOrders {
    general_purpose: Vec<Reg>,
    floating_point: Vec<Reg>,
}

#[derive(Default)]
struct AllocState {
    allocation_order: BTreeMap<u64, BTreeSet<VReg>>,
    active_registers: BTreeSet<Reg>,
    active_hints: BTreeSet<Reg>,
    active_spill_area: BitSet,
    active_spill_area_hints: BitSet,
    stashes: BTreeMap<VReg, (Stash, usize)>,
    preserve_locations: BTreeMap<usize, VirtualBlockId>,
    block_stack: Vec<VirtualBlockId>,
}

/// The amd64 register allocator.
///
/// One instance allocates one function; results stay queryable afterwards.
/// Given identical input code and preallocations the outcome is
/// byte-identical across runs: every internal container iterates in a
/// deterministic order and bucket members are processed by ascending
/// virtual register index.
pub struct RegisterAllocator {
    executed: bool,
    code_length: usize,
    vregs: SecondaryMap<VReg, VRegState>,
    virtual_blocks: BTreeMap<VirtualBlockId, VirtualBlockData>,
    used_registers: BTreeSet<Reg>,
    used_slots: usize,
}

impl RegisterAllocator {
    /// Fresh allocator.
    pub fn new() -> Self {
        Self {
            executed: false,
            code_length: 0,
            vregs: SecondaryMap::new(),
            virtual_blocks: BTreeMap::new(),
            used_registers: BTreeSet::new(),
            used_slots: 0,
        }
    }

    /// Run allocation over `code`, reporting frame requirements to
    /// `frame`. May only be invoked once per allocator.
    pub fn run(&mut self, code: &mut VCode, frame: &mut StackFrame) -> Result<()> {
        if self.executed {
            return Err(Error::InvalidParameter(
                "register allocator has already been executed",
            ));
        }
        self.executed = true;
        self.code_length = code.len();

        let variant = code.abi_variant();
        let mut general_purpose = x64::GENERAL_PURPOSE_REGS.to_vec();
        // Stable sort: caller-saved registers first, hardware order within
        // each class.
        general_purpose.sort_by_key(|reg| x64::is_callee_preserved(variant, *reg));
        let orders = RegisterOrders {
            general_purpose,
            floating_point: x64::FLOATING_POINT_REGS.to_vec(),
        };

        let mut state = AllocState::default();
        self.scan_code(code, &mut state)?;
        self.build_interference(code)?;
        self.do_allocation_impl(code, frame, &mut state, &orders)?;
        debug!(
            "allocated {} virtual registers over {} instructions, {} spill slots",
            code.num_virtual_registers(),
            self.code_length,
            self.used_slots
        );
        Ok(())
    }

    /// Allocation result of a virtual register.
    pub fn allocation_of(&self, vreg: VReg) -> &Allocation {
        &self.vregs[vreg].allocation
    }

    /// Linearized position of an instruction. The stream is already dense,
    /// so this is a bounds check plus identity.
    pub fn linear_position_of(&self, instr: usize) -> Result<usize> {
        if instr >= self.code_length {
            return Err(Error::NotFound("instruction index out of linearized code"));
        }
        Ok(instr)
    }

    /// Lifetime of a virtual register, if it is mentioned at all.
    pub fn lifetime_of(&self, vreg: VReg) -> Option<Lifetime> {
        self.vregs[vreg].lifetime
    }

    /// Whether the virtual register appears in the virtual block or any
    /// block nested in it.
    pub fn exists_in_block(&self, vreg: VReg, block: VirtualBlockId) -> bool {
        self.vregs[vreg].virtual_blocks.contains(&block)
    }

    /// Physical registers touched by the function.
    pub fn used_registers(&self) -> &BTreeSet<Reg> {
        &self.used_registers
    }

    /// Whether the function touches the physical register.
    pub fn has_used_register(&self, reg: Reg) -> bool {
        self.used_registers.contains(&reg)
    }

    /// High-water mark of spill slots used.
    pub fn used_spill_slots(&self) -> usize {
        self.used_slots
    }

    // Scanning.

    fn push_virtual_block(&mut self, state: &mut AllocState, id: VirtualBlockId) -> Result<()> {
        if self.virtual_blocks.contains_key(&id) {
            return Err(Error::InvalidParameter("duplicate virtual block identifier"));
        }
        self.virtual_blocks.insert(
            id,
            VirtualBlockData {
                parent: state.block_stack.last().copied(),
                vregs: BTreeSet::new(),
            },
        );
        state.block_stack.push(id);
        Ok(())
    }

    fn register_in_block(
        &mut self,
        code: &VCode,
        block: VirtualBlockId,
        vreg: VReg,
    ) -> Result<()> {
        match *code.virtual_register(vreg)? {
            VRegType::ImmediateInteger(_) | VRegType::LocalVariable { .. } => return Ok(()),
            VRegType::Pair(first, second) => {
                self.register_in_block(code, block, first)?;
                self.register_in_block(code, block, second)?;
            }
            _ => {}
        }
        self.virtual_blocks
            .get_mut(&block)
            .ok_or(Error::InvalidState("unknown virtual block"))?
            .vregs
            .insert(vreg);
        // The register is visible in every enclosing block.
        let mut cursor = Some(block);
        while let Some(id) = cursor {
            self.vregs[vreg].virtual_blocks.insert(id);
            cursor = self.virtual_blocks[&id].parent;
        }
        Ok(())
    }

    fn touch(
        &mut self,
        code: &VCode,
        state: &mut AllocState,
        vreg: VReg,
        index: usize,
    ) -> Result<()> {
        let lifetime = match self.vregs[vreg].lifetime {
            None => Lifetime {
                begin: index,
                end: index,
            },
            Some(lifetime) => Lifetime {
                begin: lifetime.begin.min(index),
                end: lifetime.end.max(index),
            },
        };
        self.vregs[vreg].lifetime = Some(lifetime);
        let block = *state
            .block_stack
            .last()
            .ok_or(Error::InvalidState("virtual block stack is empty"))?;
        self.register_in_block(code, block, vreg)
    }

    fn scan_code(&mut self, code: &VCode, state: &mut AllocState) -> Result<()> {
        self.push_virtual_block(state, DEFAULT_VIRTUAL_BLOCK)?;

        let instrs: Vec<VInstr> = code.iter().copied().collect();
        for (index, instr) in instrs.into_iter().enumerate() {
            match instr {
                VInstr::VirtualBlockBegin(id) => self.push_virtual_block(state, id)?,
                VInstr::VirtualBlockEnd => {
                    if state.block_stack.len() <= 1 {
                        return Err(Error::InvalidParameter("no virtual block can be popped"));
                    }
                    state.block_stack.pop();
                }
                VInstr::PreserveActiveVirtualRegisters => {
                    let block = *state
                        .block_stack
                        .last()
                        .expect("the default virtual block is always open");
                    state.preserve_locations.insert(index, block);
                }
                VInstr::StashActivate(stash) => {
                    let vreg = code.stash(stash)?.spill_vreg();
                    state.stashes.insert(vreg, (stash, index));
                    self.touch(code, state, vreg, index)?;
                }
                VInstr::Op(args) => {
                    for arg in args {
                        match arg {
                            AsmValue::VirtualRegister(vreg) => {
                                self.touch(code, state, vreg, index)?;
                            }
                            AsmValue::Indirect(IndirectBasis::Virtual(vreg)) => {
                                self.touch(code, state, vreg, index)?;
                            }
                            AsmValue::StashIndex(stash) => {
                                let vreg = code.stash(stash)?.spill_vreg();
                                self.touch(code, state, vreg, index)?;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        // Preserve points widen every register live across them to the
        // whole function and drag it into the base block.
        let preserve_locations: Vec<(usize, VirtualBlockId)> = state
            .preserve_locations
            .iter()
            .map(|(index, block)| (*index, *block))
            .collect();
        for (linear_index, block) in preserve_locations {
            for vreg in self.block_members(block) {
                let Some(lifetime) = self.vregs[vreg].lifetime else {
                    continue;
                };
                if lifetime.begin <= linear_index && linear_index <= lifetime.end {
                    self.vregs[vreg].lifetime = Some(Lifetime {
                        begin: 0,
                        end: self.code_length,
                    });
                    self.register_in_block(code, DEFAULT_VIRTUAL_BLOCK, vreg)?;
                }
            }
        }
        Ok(())
    }

    /// Registers of the block and of every enclosing block.
    fn block_members(&self, block: VirtualBlockId) -> Vec<VReg> {
        let mut members = Vec::new();
        let mut cursor = Some(block);
        while let Some(id) = cursor {
            let Some(data) = self.virtual_blocks.get(&id) else {
                break;
            };
            members.extend(data.vregs.iter().copied());
            cursor = data.parent;
        }
        members
    }

    // Interference.

    fn mark_interference(&mut self, code: &VCode, first: VReg, second: VReg) -> Result<()> {
        if first == second {
            return Ok(());
        }
        let first_ty = *code.virtual_register(first)?;
        let second_ty = *code.virtual_register(second)?;
        if matches!(
            first_ty,
            VRegType::ImmediateInteger(_) | VRegType::LocalVariable { .. }
        ) || matches!(
            second_ty,
            VRegType::ImmediateInteger(_) | VRegType::LocalVariable { .. }
        ) {
            return Ok(());
        }

        if let VRegType::Pair(a, b) = first_ty {
            self.mark_interference(code, a, second)?;
            self.mark_interference(code, b, second)?;
        }
        if let VRegType::Pair(a, b) = second_ty {
            self.mark_interference(code, first, a)?;
            self.mark_interference(code, first, b)?;
        }

        let (Some(l1), Some(l2)) = (self.vregs[first].lifetime, self.vregs[second].lifetime)
        else {
            return Ok(());
        };
        if l1.begin < l2.end && l2.begin < l1.end {
            self.vregs[first].interference.insert(second);
            self.vregs[second].interference.insert(first);
        }
        Ok(())
    }

    fn build_interference(&mut self, code: &VCode) -> Result<()> {
        let blocks: Vec<VirtualBlockId> = self.virtual_blocks.keys().copied().collect();
        for block in blocks {
            let members = self.block_members(block);
            for (i, &first) in members.iter().enumerate() {
                for &second in &members[i + 1..] {
                    self.mark_interference(code, first, second)?;
                }
            }
        }
        Ok(())
    }

    // Allocation.

    fn build_allocation_order(&self, code: &VCode, state: &mut AllocState) {
        // Prioritize short-lived registers so long-living values do not
        // clobber the register file early; group lifetimes at a
        // 32-instruction granularity and order groups by start position.
        // Registers spanning the whole function go last.
        let base = &self.virtual_blocks[&DEFAULT_VIRTUAL_BLOCK];
        for index in 0..code.num_virtual_registers() {
            let vreg = VReg::new(index);
            let Some(lifetime) = self.vregs[vreg].lifetime else {
                continue;
            };
            let whole_function = lifetime.begin == 0
                && lifetime.end == self.code_length
                && base.vregs.contains(&vreg);
            let duration = (lifetime.end - lifetime.begin) as u64;
            let mask = (1u64 << 32) - 1;
            let upper = if whole_function {
                mask
            } else {
                (duration >> 5) & mask
            };
            let lower = (lifetime.begin as u64) & mask;
            state
                .allocation_order
                .entry((upper << 32) | lower)
                .or_default()
                .insert(vreg);
        }
    }

    fn add_active(&self, code: &VCode, state: &mut AllocState, vreg: VReg) -> Result<()> {
        match self.vregs[vreg].allocation {
            Allocation::Unallocated => {
                if let Some(preallocation) = code.preallocation(vreg) {
                    match *preallocation {
                        Preallocation::Requirement(reg) => {
                            state.active_registers.insert(reg);
                        }
                        Preallocation::Hint(reg) => {
                            state.active_hints.insert(reg);
                        }
                        Preallocation::SameAs(other) => match self.vregs[other].allocation {
                            Allocation::Register(reg) => {
                                state.active_hints.insert(reg);
                            }
                            Allocation::SpillDirect { index, length }
                            | Allocation::SpillIndirect { index, length } => {
                                state
                                    .active_spill_area_hints
                                    .set_consecutive(index, length, true);
                            }
                            _ => {}
                        },
                    }
                }
            }
            Allocation::Register(reg) => {
                state.active_registers.insert(reg);
            }
            Allocation::SpillDirect { index, length }
            | Allocation::SpillIndirect { index, length } => {
                state.active_spill_area.set_consecutive(index, length, true);
            }
            Allocation::Pair => {
                let VRegType::Pair(a, b) = *code.virtual_register(vreg)? else {
                    return Err(Error::InvalidState(
                        "pair allocation without a pair register",
                    ));
                };
                self.add_active(code, state, a)?;
                self.add_active(code, state, b)?;
            }
            Allocation::ImmediateInteger
            | Allocation::LocalVariable
            | Allocation::MemoryPointer => {}
        }
        Ok(())
    }

    fn build_active(&self, code: &VCode, state: &mut AllocState, vreg: VReg) -> Result<()> {
        state.active_registers.clear();
        state.active_hints.clear();
        state.active_spill_area.clear();
        state.active_spill_area_hints.clear();
        let interference: Vec<VReg> = self.vregs[vreg].interference.iter().copied().collect();
        for other in interference {
            self.add_active(code, state, other)?;
        }
        Ok(())
    }

    fn allocate_spill_area(
        state: &mut AllocState,
        length: usize,
        alignment: usize,
    ) -> Result<(usize, usize)> {
        if length == 0 {
            return Ok((0, 0));
        }
        let alignment = alignment.max(1);

        // First fit among the existing slots, avoiding hinted slots.
        let mut num_slots = state.active_spill_area.len();
        let mut iter_index = 0;
        while iter_index < num_slots {
            match state.active_spill_area.find_consecutive_clear(length, iter_index) {
                Some(spill_index) => {
                    let mut satisfies = spill_index % alignment == 0;
                    for slot in spill_index..spill_index + length {
                        if !satisfies {
                            break;
                        }
                        satisfies = !state.active_spill_area_hints.get(slot);
                    }
                    if satisfies {
                        return Ok((spill_index, length));
                    }
                    iter_index = spill_index + 1;
                }
                None => iter_index = num_slots,
            }
        }

        // Grow the area and retry past the old end, ignoring hints.
        let orig_num_slots = num_slots;
        num_slots = pad_aligned(num_slots + length, alignment);
        state.active_spill_area.resize(num_slots);
        state.active_spill_area_hints.resize(num_slots);

        iter_index = orig_num_slots;
        while iter_index < num_slots {
            match state.active_spill_area.find_consecutive_clear(length, iter_index) {
                Some(spill_index) => {
                    if spill_index % alignment == 0 {
                        return Ok((spill_index, length));
                    }
                    iter_index = spill_index + 1;
                }
                None => iter_index = num_slots,
            }
        }

        Err(Error::InternalError("unable to allocate spill space"))
    }

    fn assign_register(&mut self, state: &mut AllocState, vreg: VReg, reg: Reg) {
        trace!("{}: {:?}", vreg, reg);
        self.vregs[vreg].allocation = Allocation::Register(reg);
        state.active_registers.insert(reg);
    }

    fn do_allocate_register(
        &mut self,
        code: &VCode,
        state: &mut AllocState,
        vreg: VReg,
        order: &[Reg],
        spill_size: usize,
    ) -> Result<()> {
        let preallocation = code.preallocation(vreg).copied();

        if let Some(Preallocation::Requirement(reg)) = preallocation {
            if state.active_registers.contains(&reg) {
                return Err(Error::InternalError(
                    "unable to satisfy register allocation requirements",
                ));
            }
            self.assign_register(state, vreg, reg);
            return Ok(());
        }

        if let Some(Preallocation::Hint(reg)) = preallocation {
            if !state.active_registers.contains(&reg) && order.contains(&reg) {
                self.assign_register(state, vreg, reg);
                return Ok(());
            }
        }

        if let Some(Preallocation::SameAs(other)) = preallocation {
            if !self.vregs[vreg].interference.contains(&other)
                && discriminant(code.virtual_register(vreg)?)
                    == discriminant(code.virtual_register(other)?)
            {
                match self.vregs[other].allocation {
                    Allocation::Register(reg) => {
                        if !state.active_registers.contains(&reg) && order.contains(&reg) {
                            self.assign_register(state, vreg, reg);
                            return Ok(());
                        }
                    }
                    Allocation::SpillDirect { index, length } => {
                        let occupied = (index..index + length)
                            .any(|slot| state.active_spill_area.get(slot));
                        if !occupied {
                            state.active_spill_area.set_consecutive(index, length, true);
                            self.vregs[vreg].allocation =
                                Allocation::SpillDirect { index, length };
                            return Ok(());
                        }
                    }
                    _ => {}
                }
            }
        }

        // Prefer registers nobody is hinting at, then any free register.
        for &reg in order {
            if !state.active_registers.contains(&reg) && !state.active_hints.contains(&reg) {
                self.assign_register(state, vreg, reg);
                return Ok(());
            }
        }
        for &reg in order {
            if !state.active_registers.contains(&reg) {
                self.assign_register(state, vreg, reg);
                return Ok(());
            }
        }

        let (index, length) = Self::allocate_spill_area(state, spill_size, spill_size)?;
        trace!("{}: spill {}+{}", vreg, index, length);
        self.vregs[vreg].allocation = Allocation::SpillDirect { index, length };
        Ok(())
    }

    fn do_vreg_allocation(
        &mut self,
        code: &VCode,
        state: &mut AllocState,
        orders: &RegisterOrders,
        vreg: VReg,
    ) -> Result<()> {
        if self.vregs[vreg].allocation != Allocation::Unallocated {
            return Ok(());
        }

        match *code.virtual_register(vreg)? {
            VRegType::Unspecified => {
                return Err(Error::InvalidState("unexpected amd64 virtual register type"))
            }
            VRegType::GeneralPurpose => {
                self.build_active(code, state, vreg)?;
                self.do_allocate_register(code, state, vreg, &orders.general_purpose, 1)?;
            }
            VRegType::FloatingPoint => {
                self.build_active(code, state, vreg)?;
                self.do_allocate_register(code, state, vreg, &orders.floating_point, 2)?;
            }
            VRegType::SpillSpace { length, alignment } => {
                self.build_active(code, state, vreg)?;
                let (index, length) =
                    Self::allocate_spill_area(state, length as usize, alignment as usize)?;
                self.vregs[vreg].allocation = Allocation::SpillIndirect { index, length };
            }
            VRegType::LocalVariable { .. } => {
                self.vregs[vreg].allocation = Allocation::LocalVariable;
            }
            VRegType::ImmediateInteger(_) => {
                self.vregs[vreg].allocation = Allocation::ImmediateInteger;
            }
            VRegType::ExternalMemory { .. } => {
                self.vregs[vreg].allocation = Allocation::MemoryPointer;
            }
            VRegType::Pair(first, second) => {
                self.do_vreg_allocation(code, state, orders, first)?;
                self.do_vreg_allocation(code, state, orders, second)?;
                self.vregs[vreg].allocation = Allocation::Pair;
            }
        }
        self.used_registers
            .extend(state.active_registers.iter().copied());
        Ok(())
    }

    fn do_stash_allocation(
        &mut self,
        code: &mut VCode,
        state: &mut AllocState,
        orders: &RegisterOrders,
        vreg: VReg,
        stash: Stash,
        activation_index: usize,
    ) -> Result<()> {
        if self.vregs[vreg].allocation != Allocation::Unallocated {
            return Ok(());
        }
        let liveness_index = code
            .stash(stash)?
            .liveness_instr()
            .unwrap_or(activation_index);

        self.build_active(code, state, vreg)?;

        // The stash needs one qword per live stashed general-purpose
        // register and two per SSE register.
        let mut qwords: u32 = 0;
        let interference: Vec<VReg> = self.vregs[vreg].interference.iter().copied().collect();
        for other in interference {
            let Allocation::Register(reg) = self.vregs[other].allocation else {
                continue;
            };
            let stash_data = code.stash(stash)?;
            if !stash_data.registers().contains(&reg)
                || !stash_data.covers_virtual_register(other)
            {
                continue;
            }
            let Some(lifetime) = self.vregs[other].lifetime else {
                continue;
            };
            if lifetime.begin > liveness_index
                || lifetime.end <= liveness_index
                || lifetime.begin > activation_index
                || lifetime.end <= activation_index
            {
                continue;
            }
            qwords += if reg.is_floating_point() { 2 } else { 1 };
        }

        code.set_spill_space_size(vreg, qwords, 1)?;
        self.do_vreg_allocation(code, state, orders, vreg)
    }

    fn do_allocation_impl(
        &mut self,
        code: &mut VCode,
        frame: &mut StackFrame,
        state: &mut AllocState,
        orders: &RegisterOrders,
    ) -> Result<()> {
        self.build_allocation_order(code, state);

        let buckets: Vec<Vec<VReg>> = state
            .allocation_order
            .values()
            .map(|bucket| bucket.iter().copied().collect())
            .collect();
        for bucket in buckets {
            for vreg in bucket {
                if !state.stashes.contains_key(&vreg) {
                    self.do_vreg_allocation(code, state, orders, vreg)?;
                }
            }
        }

        let stashes: Vec<(VReg, Stash, usize)> = state
            .stashes
            .iter()
            .map(|(vreg, (stash, index))| (*vreg, *stash, *index))
            .collect();
        for (vreg, stash, index) in stashes {
            self.do_stash_allocation(code, state, orders, vreg, stash, index)?;
        }

        let num_slots = state.active_spill_area.len();
        frame.ensure_spill_area(num_slots);
        self.used_slots = self.used_slots.max(num_slots);
        for reg in self.used_registers.iter().copied() {
            frame.use_register(reg);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::AbiVariant;

    fn touch(code: &mut VCode, vreg: VReg) {
        code.append(VInstr::op1(AsmValue::VirtualRegister(vreg)));
    }

    fn pad(code: &mut VCode, count: usize) {
        for _ in 0..count {
            code.append(VInstr::op0());
        }
    }

    #[test]
    fn single_register_gets_first_caller_saved() {
        let mut code = VCode::new(AbiVariant::SystemV);
        let v0 = code.new_virtual_register(VRegType::GeneralPurpose);
        touch(&mut code, v0);
        code.append(VInstr::op0());

        let mut frame = StackFrame::new(AbiVariant::SystemV);
        let mut allocator = RegisterAllocator::new();
        allocator.run(&mut code, &mut frame).unwrap();

        assert_eq!(*allocator.allocation_of(v0), Allocation::Register(Reg::Rax));
        // No callee-preserved register is touched and no spill slot used.
        assert_eq!(frame.preserved_registers().count(), 0);
        assert_eq!(frame.spill_area_size(), 0);
        assert_eq!(allocator.used_spill_slots(), 0);
    }

    #[test]
    fn requirement_and_hint_conflict() {
        // Two overlapping lifetimes; the required register wins, the
        // hinted one falls back to the next caller-saved register.
        let mut code = VCode::new(AbiVariant::SystemV);
        let v0 = code.new_virtual_register(VRegType::GeneralPurpose);
        let v1 = code.new_virtual_register(VRegType::GeneralPurpose);
        code.preallocate_requirement(v0, Reg::Rax);
        code.preallocate_hint(v1, Reg::Rax);

        touch(&mut code, v0); // 0
        pad(&mut code, 2); // 1-2
        touch(&mut code, v1); // 3
        pad(&mut code, 1); // 4
        touch(&mut code, v0); // 5
        pad(&mut code, 2); // 6-7
        touch(&mut code, v1); // 8

        let mut frame = StackFrame::new(AbiVariant::SystemV);
        let mut allocator = RegisterAllocator::new();
        allocator.run(&mut code, &mut frame).unwrap();

        assert_eq!(*allocator.allocation_of(v0), Allocation::Register(Reg::Rax));
        assert_eq!(*allocator.allocation_of(v1), Allocation::Register(Reg::Rcx));
        assert!(allocator.has_used_register(Reg::Rax));
        assert!(allocator.has_used_register(Reg::Rcx));
        assert_eq!(allocator.used_spill_slots(), 0);
    }

    #[test]
    fn conflicting_requirements_fail() {
        let mut code = VCode::new(AbiVariant::SystemV);
        let v0 = code.new_virtual_register(VRegType::GeneralPurpose);
        let v1 = code.new_virtual_register(VRegType::GeneralPurpose);
        code.preallocate_requirement(v0, Reg::Rdx);
        code.preallocate_requirement(v1, Reg::Rdx);
        code.append(VInstr::op2(
            AsmValue::VirtualRegister(v0),
            AsmValue::VirtualRegister(v1),
        ));
        code.append(VInstr::op2(
            AsmValue::VirtualRegister(v0),
            AsmValue::VirtualRegister(v1),
        ));

        let mut frame = StackFrame::new(AbiVariant::SystemV);
        let mut allocator = RegisterAllocator::new();
        assert_eq!(
            allocator.run(&mut code, &mut frame),
            Err(Error::InternalError(
                "unable to satisfy register allocation requirements"
            ))
        );
    }

    #[test]
    fn overlapping_registers_never_share() {
        // Sixteen pairwise-overlapping general-purpose registers exceed
        // the fourteen allocatable ones; two fall into the spill area, in
        // distinct slots, and no two share a register.
        let mut code = VCode::new(AbiVariant::SystemV);
        let vregs: Vec<VReg> = (0..16)
            .map(|_| code.new_virtual_register(VRegType::GeneralPurpose))
            .collect();
        for &vreg in &vregs {
            touch(&mut code, vreg);
        }
        for &vreg in &vregs {
            touch(&mut code, vreg);
        }

        let mut frame = StackFrame::new(AbiVariant::SystemV);
        let mut allocator = RegisterAllocator::new();
        allocator.run(&mut code, &mut frame).unwrap();

        let mut seen_registers = BTreeSet::new();
        let mut spills = Vec::new();
        for &vreg in &vregs {
            match *allocator.allocation_of(vreg) {
                Allocation::Register(reg) => {
                    assert!(seen_registers.insert(reg), "{:?} assigned twice", reg);
                }
                Allocation::SpillDirect { index, length } => spills.push((index, length)),
                other => panic!("unexpected allocation {other:?}"),
            }
        }
        assert_eq!(seen_registers.len(), 14);
        assert_eq!(spills, vec![(0, 1), (1, 1)]);
        assert_eq!(frame.spill_area_size(), 2);
    }

    #[test]
    fn floating_point_spills_are_two_slots() {
        let mut code = VCode::new(AbiVariant::SystemV);
        let vregs: Vec<VReg> = (0..17)
            .map(|_| code.new_virtual_register(VRegType::FloatingPoint))
            .collect();
        for &vreg in &vregs {
            touch(&mut code, vreg);
        }
        for &vreg in &vregs {
            touch(&mut code, vreg);
        }

        let mut frame = StackFrame::new(AbiVariant::SystemV);
        let mut allocator = RegisterAllocator::new();
        allocator.run(&mut code, &mut frame).unwrap();

        let spills: Vec<(usize, usize)> = vregs
            .iter()
            .filter_map(|vreg| match *allocator.allocation_of(*vreg) {
                Allocation::SpillDirect { index, length } => Some((index, length)),
                _ => None,
            })
            .collect();
        assert_eq!(spills, vec![(0, 2)]);
        assert_eq!(frame.spill_area_size(), 2);
    }

    #[test]
    fn same_as_follows_prior_allocation() {
        // Disjoint lifetimes with a same-as preallocation share the
        // register.
        let mut code = VCode::new(AbiVariant::SystemV);
        let v0 = code.new_virtual_register(VRegType::GeneralPurpose);
        let v1 = code.new_virtual_register(VRegType::GeneralPurpose);
        code.preallocate_hint(v0, Reg::R10);
        code.preallocate_same_as(v1, v0);

        touch(&mut code, v0); // 0
        touch(&mut code, v0); // 1
        pad(&mut code, 1); // 2
        touch(&mut code, v1); // 3
        touch(&mut code, v1); // 4

        let mut frame = StackFrame::new(AbiVariant::SystemV);
        let mut allocator = RegisterAllocator::new();
        allocator.run(&mut code, &mut frame).unwrap();

        assert_eq!(*allocator.allocation_of(v0), Allocation::Register(Reg::R10));
        assert_eq!(*allocator.allocation_of(v1), Allocation::Register(Reg::R10));
    }

    #[test]
    fn stash_sized_from_live_registers() {
        // One general-purpose register lives across the stash activation;
        // the stash spill space gets one qword.
        let mut code = VCode::new(AbiVariant::SystemV);
        let v0 = code.new_virtual_register(VRegType::GeneralPurpose);
        code.preallocate_requirement(v0, Reg::Rax);
        let stash = code.new_stash([Reg::Rax, Reg::Rcx, Reg::Rdx]);
        let spill_vreg = code.stash(stash).unwrap().spill_vreg();

        touch(&mut code, v0); // 0
        code.append(VInstr::StashActivate(stash)); // 1
        touch(&mut code, v0); // 2

        let mut frame = StackFrame::new(AbiVariant::SystemV);
        let mut allocator = RegisterAllocator::new();
        allocator.run(&mut code, &mut frame).unwrap();

        assert_eq!(
            *allocator.allocation_of(spill_vreg),
            Allocation::SpillIndirect { index: 0, length: 1 }
        );
        assert!(matches!(
            code.virtual_register(spill_vreg).unwrap(),
            VRegType::SpillSpace {
                length: 1,
                alignment: 1
            }
        ));
        assert_eq!(frame.spill_area_size(), 1);
    }

    #[test]
    fn preserve_point_widens_lifetimes() {
        let mut code = VCode::new(AbiVariant::SystemV);
        let v0 = code.new_virtual_register(VRegType::GeneralPurpose);
        pad(&mut code, 1); // 0
        touch(&mut code, v0); // 1
        code.append(VInstr::PreserveActiveVirtualRegisters); // 2
        touch(&mut code, v0); // 3
        pad(&mut code, 2); // 4-5

        let mut frame = StackFrame::new(AbiVariant::SystemV);
        let mut allocator = RegisterAllocator::new();
        allocator.run(&mut code, &mut frame).unwrap();

        assert_eq!(
            allocator.lifetime_of(v0),
            Some(Lifetime { begin: 0, end: 6 })
        );
        assert!(allocator.exists_in_block(v0, DEFAULT_VIRTUAL_BLOCK));
    }

    #[test]
    fn virtual_blocks_bound_interference() {
        // Two registers in sibling virtual blocks with overlapping raw
        // lifetimes: each is registered in its own block and the default
        // block, so they still interfere through the shared parent only if
        // their lifetimes overlap. Verify block membership tracking.
        let mut code = VCode::new(AbiVariant::SystemV);
        let v0 = code.new_virtual_register(VRegType::GeneralPurpose);
        let v1 = code.new_virtual_register(VRegType::GeneralPurpose);

        code.append(VInstr::VirtualBlockBegin(1));
        touch(&mut code, v0);
        touch(&mut code, v0);
        code.append(VInstr::VirtualBlockEnd);
        code.append(VInstr::VirtualBlockBegin(2));
        touch(&mut code, v1);
        touch(&mut code, v1);
        code.append(VInstr::VirtualBlockEnd);

        let mut frame = StackFrame::new(AbiVariant::SystemV);
        let mut allocator = RegisterAllocator::new();
        allocator.run(&mut code, &mut frame).unwrap();

        assert!(allocator.exists_in_block(v0, 1));
        assert!(!allocator.exists_in_block(v0, 2));
        assert!(allocator.exists_in_block(v0, DEFAULT_VIRTUAL_BLOCK));
        assert!(allocator.exists_in_block(v1, 2));

        // Disjoint lifetimes: both can take the same register.
        assert_eq!(*allocator.allocation_of(v0), Allocation::Register(Reg::Rax));
        assert_eq!(*allocator.allocation_of(v1), Allocation::Register(Reg::Rax));
    }

    #[test]
    fn allocation_is_deterministic() {
        let build = || {
            let mut code = VCode::new(AbiVariant::SystemV);
            let vregs: Vec<VReg> = (0..24)
                .map(|i| {
                    if i % 3 == 0 {
                        code.new_virtual_register(VRegType::FloatingPoint)
                    } else {
                        code.new_virtual_register(VRegType::GeneralPurpose)
                    }
                })
                .collect();
            for (i, &vreg) in vregs.iter().enumerate() {
                touch(&mut code, vreg);
                if i % 5 == 0 {
                    code.append(VInstr::op0());
                }
            }
            for &vreg in vregs.iter().rev() {
                touch(&mut code, vreg);
            }
            (code, vregs)
        };

        let (mut code1, vregs1) = build();
        let (mut code2, _) = build();
        let mut frame1 = StackFrame::new(AbiVariant::SystemV);
        let mut frame2 = StackFrame::new(AbiVariant::SystemV);
        let mut alloc1 = RegisterAllocator::new();
        let mut alloc2 = RegisterAllocator::new();
        alloc1.run(&mut code1, &mut frame1).unwrap();
        alloc2.run(&mut code2, &mut frame2).unwrap();

        for vreg in vregs1 {
            assert_eq!(alloc1.allocation_of(vreg), alloc2.allocation_of(vreg));
        }
        assert_eq!(alloc1.used_registers(), alloc2.used_registers());
        assert_eq!(alloc1.used_spill_slots(), alloc2.used_spill_slots());
    }

    #[test]
    fn pair_allocates_components() {
        let mut code = VCode::new(AbiVariant::SystemV);
        let lo = code.new_virtual_register(VRegType::GeneralPurpose);
        let hi = code.new_virtual_register(VRegType::GeneralPurpose);
        let pair = code.new_virtual_register(VRegType::Pair(lo, hi));
        touch(&mut code, pair); // 0
        touch(&mut code, lo); // 1
        touch(&mut code, hi); // 2
        touch(&mut code, lo); // 3
        touch(&mut code, hi); // 4
        touch(&mut code, pair); // 5

        let mut frame = StackFrame::new(AbiVariant::SystemV);
        let mut allocator = RegisterAllocator::new();
        allocator.run(&mut code, &mut frame).unwrap();

        assert_eq!(*allocator.allocation_of(pair), Allocation::Pair);
        let lo_alloc = *allocator.allocation_of(lo);
        let hi_alloc = *allocator.allocation_of(hi);
        assert!(matches!(lo_alloc, Allocation::Register(_)));
        assert!(matches!(hi_alloc, Allocation::Register(_)));
        assert_ne!(lo_alloc, hi_alloc);
    }
}
