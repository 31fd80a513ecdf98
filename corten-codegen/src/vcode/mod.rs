//! Virtual-register machine code.
//!
//! The instruction selector lowers SSA into a linear stream of machine
//! instructions whose operands still reference *virtual* registers; the
//! register allocator then rewrites those to physical registers and spill
//! slots. This module defines that in-between representation: the virtual
//! register table, per-register preallocation constraints, register
//! stashes, and the handful of allocator-directed pseudo-instructions
//! (virtual block delimiters, preserve points, stash activation).
//!
//! The concrete machine mnemonics are deliberately absent here: the
//! allocator only ever inspects operand shapes, so a generic three-operand
//! [`VInstr::Op`] carries everything it needs.

use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};
use std::collections::BTreeSet;

use crate::isa::{AbiVariant, Reg};
use crate::{Error, Result};

/// An opaque reference to a virtual register.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u32);
entity_impl!(VReg, "vreg");

/// An opaque reference to a register stash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Stash(u32);
entity_impl!(Stash, "stash");

/// Identifier of a virtual block, assigned by the instruction selector.
pub type VirtualBlockId = u64;

/// The implicit virtual block wrapping the whole function.
pub const DEFAULT_VIRTUAL_BLOCK: VirtualBlockId = VirtualBlockId::MAX;

/// Type of a virtual register, fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VRegType {
    /// Not yet classified; encountering one during allocation is an error.
    Unspecified,
    /// Lives in a general-purpose register.
    GeneralPurpose,
    /// Lives in an SSE register.
    FloatingPoint,
    /// A chunk of spill space allocated directly on the stack frame.
    SpillSpace {
        /// Size in eight-byte slots.
        length: u32,
        /// Alignment in eight-byte slots.
        alignment: u32,
    },
    /// Memory location fixed by the selector; never allocated.
    ExternalMemory {
        /// Base register of the location.
        base: Reg,
        /// Displacement from the base.
        offset: i64,
    },
    /// Integer immediate materialized at use sites; never allocated.
    ImmediateInteger(i64),
    /// Address of a local variable; resolved by frame layout, never
    /// allocated.
    LocalVariable {
        /// Function-unique local identifier.
        id: u64,
    },
    /// Two virtual registers treated as one value.
    Pair(VReg, VReg),
}

/// Addressing basis of an indirect operand.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IndirectBasis {
    /// Address held in a virtual register.
    Virtual(VReg),
    /// Address held in a physical register.
    Physical(Reg),
    /// Offset into the local-variable area.
    LocalArea(i64),
    /// Spill-area slot.
    SpillArea(u32),
}

/// One operand of a machine instruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AsmValue {
    /// Unused operand slot.
    None,
    /// Signed immediate.
    Integer(i64),
    /// Unsigned immediate.
    Uinteger(u64),
    /// Physical register fixed by the selector.
    PhysicalRegister(Reg),
    /// Virtual register.
    VirtualRegister(VReg),
    /// Memory operand.
    Indirect(IndirectBasis),
    /// Stash reference (only on stash pseudo-instructions).
    StashIndex(Stash),
    /// Internal label reference.
    InternalLabel(u64),
}

/// One instruction of the virtual-register stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VInstr {
    /// A machine instruction with up to three operands. The mnemonic is
    /// the emitter's business; the allocator only reads the operands.
    Op([AsmValue; 3]),
    /// Open a virtual block.
    VirtualBlockBegin(VirtualBlockId),
    /// Close the innermost open virtual block.
    VirtualBlockEnd,
    /// Treat every virtual register live here as live for the whole
    /// function.
    PreserveActiveVirtualRegisters,
    /// Save the stashed registers into the stash's spill space.
    StashActivate(Stash),
}

impl VInstr {
    /// Machine instruction without register operands.
    pub fn op0() -> Self {
        VInstr::Op([AsmValue::None, AsmValue::None, AsmValue::None])
    }

    /// Machine instruction with one operand.
    pub fn op1(a: AsmValue) -> Self {
        VInstr::Op([a, AsmValue::None, AsmValue::None])
    }

    /// Machine instruction with two operands.
    pub fn op2(a: AsmValue, b: AsmValue) -> Self {
        VInstr::Op([a, b, AsmValue::None])
    }

    /// Machine instruction with three operands.
    pub fn op3(a: AsmValue, b: AsmValue, c: AsmValue) -> Self {
        VInstr::Op([a, b, c])
    }
}

/// Preallocation constraint attached to a virtual register by the
/// instruction selector before the allocator runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Preallocation {
    /// The register must receive exactly this physical register.
    Requirement(Reg),
    /// Strong preference for this physical register.
    Hint(Reg),
    /// Preference for whatever another virtual register received.
    SameAs(VReg),
}

/// A register stash: a request to save live physical registers around a
/// boundary (typically a call).
#[derive(Clone, Debug)]
pub struct StashData {
    registers: BTreeSet<Reg>,
    virtual_registers: BTreeSet<VReg>,
    spill_vreg: VReg,
    liveness_instr: Option<usize>,
}

impl StashData {
    /// Physical registers the stash covers.
    pub fn registers(&self) -> &BTreeSet<Reg> {
        &self.registers
    }

    /// Spill-space virtual register backing the stash.
    pub fn spill_vreg(&self) -> VReg {
        self.spill_vreg
    }

    /// Instruction index at which liveness is evaluated; activation index
    /// is used when absent.
    pub fn liveness_instr(&self) -> Option<usize> {
        self.liveness_instr
    }

    /// Whether the value of the virtual register needs saving. An empty
    /// membership set covers every virtual register.
    pub fn covers_virtual_register(&self, vreg: VReg) -> bool {
        self.virtual_registers.is_empty() || self.virtual_registers.contains(&vreg)
    }
}

/// The virtual-register machine code of one function.
pub struct VCode {
    variant: AbiVariant,
    instrs: Vec<VInstr>,
    vregs: PrimaryMap<VReg, VRegType>,
    preallocations: SecondaryMap<VReg, Option<Preallocation>>,
    stashes: PrimaryMap<Stash, StashData>,
}

impl VCode {
    /// Empty stream for the given ABI variant.
    pub fn new(variant: AbiVariant) -> Self {
        Self {
            variant,
            instrs: Vec::new(),
            vregs: PrimaryMap::new(),
            preallocations: SecondaryMap::new(),
            stashes: PrimaryMap::new(),
        }
    }

    /// ABI variant the function is compiled for.
    pub fn abi_variant(&self) -> AbiVariant {
        self.variant
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    /// Whether the stream is empty.
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Append an instruction, returning its index.
    pub fn append(&mut self, instr: VInstr) -> usize {
        self.instrs.push(instr);
        self.instrs.len() - 1
    }

    /// Iterate over the instructions in order.
    pub fn iter(&self) -> impl Iterator<Item = &VInstr> {
        self.instrs.iter()
    }

    /// Create a virtual register of the given type.
    pub fn new_virtual_register(&mut self, ty: VRegType) -> VReg {
        self.vregs.push(ty)
    }

    /// Number of virtual registers created so far.
    pub fn num_virtual_registers(&self) -> usize {
        self.vregs.len()
    }

    /// Type of a virtual register.
    pub fn virtual_register(&self, vreg: VReg) -> Result<&VRegType> {
        self.vregs
            .get(vreg)
            .ok_or(Error::InvalidParameter("unknown virtual register"))
    }

    /// Resize the spill space backing a spill-space virtual register.
    pub fn set_spill_space_size(
        &mut self,
        vreg: VReg,
        length: u32,
        alignment: u32,
    ) -> Result<()> {
        match self.vregs.get_mut(vreg) {
            Some(VRegType::SpillSpace {
                length: l,
                alignment: a,
            }) => {
                *l = length;
                *a = alignment;
                Ok(())
            }
            Some(_) => Err(Error::InvalidParameter(
                "virtual register is not a spill space",
            )),
            None => Err(Error::InvalidParameter("unknown virtual register")),
        }
    }

    /// Constrain a virtual register to a specific physical register.
    /// Overrides any previously recorded weaker constraint.
    pub fn preallocate_requirement(&mut self, vreg: VReg, reg: Reg) {
        self.preallocations[vreg] = Some(Preallocation::Requirement(reg));
    }

    /// Record a register preference unless a requirement already exists.
    pub fn preallocate_hint(&mut self, vreg: VReg, reg: Reg) {
        match self.preallocations[vreg] {
            Some(Preallocation::Requirement(_)) => {}
            _ => self.preallocations[vreg] = Some(Preallocation::Hint(reg)),
        }
    }

    /// Record an allocation-matching preference unless any stronger
    /// constraint already exists.
    pub fn preallocate_same_as(&mut self, vreg: VReg, other: VReg) {
        if self.preallocations[vreg].is_none() {
            self.preallocations[vreg] = Some(Preallocation::SameAs(other));
        }
    }

    /// Preallocation attached to a virtual register, if any.
    pub fn preallocation(&self, vreg: VReg) -> Option<&Preallocation> {
        self.preallocations[vreg].as_ref()
    }

    /// Create a stash covering the given physical registers. The backing
    /// spill-space virtual register starts empty; the allocator sizes it
    /// when the stash is activated.
    pub fn new_stash(&mut self, registers: impl IntoIterator<Item = Reg>) -> Stash {
        let spill_vreg = self.new_virtual_register(VRegType::SpillSpace {
            length: 0,
            alignment: 1,
        });
        self.stashes.push(StashData {
            registers: registers.into_iter().collect(),
            virtual_registers: BTreeSet::new(),
            spill_vreg,
            liveness_instr: None,
        })
    }

    /// Stash data by reference.
    pub fn stash(&self, stash: Stash) -> Result<&StashData> {
        self.stashes
            .get(stash)
            .ok_or(Error::InvalidParameter("unknown register stash"))
    }

    /// Restrict the stash to saving the given virtual register's value
    /// (in addition to previously added ones).
    pub fn stash_add_virtual_register(&mut self, stash: Stash, vreg: VReg) -> Result<()> {
        let data = self
            .stashes
            .get_mut(stash)
            .ok_or(Error::InvalidParameter("unknown register stash"))?;
        data.virtual_registers.insert(vreg);
        Ok(())
    }

    /// Set the instruction index at which stash liveness is evaluated.
    pub fn stash_set_liveness_instr(&mut self, stash: Stash, instr: usize) -> Result<()> {
        let data = self
            .stashes
            .get_mut(stash)
            .ok_or(Error::InvalidParameter("unknown register stash"))?;
        data.liveness_instr = Some(instr);
        Ok(())
    }
}
