//! Stack-frame accounting.
//!
//! The allocator and the ABI lowering report their stack and
//! register-preservation needs here; the prologue/epilogue emitter reads
//! the accumulated sizes back. The frame never shrinks: all requests are
//! watermarks.

use std::collections::BTreeSet;

use crate::isa::x64;
use crate::isa::{AbiVariant, Reg};

/// Stack-frame requirements of a single function.
#[derive(Clone, Debug)]
pub struct StackFrame {
    variant: AbiVariant,
    used_registers: BTreeSet<Reg>,
    spill_area_size: usize,
    preserve_x87_control_word: bool,
    preserve_mxcsr: bool,
}

impl StackFrame {
    /// Empty frame for the given ABI variant.
    pub fn new(variant: AbiVariant) -> Self {
        Self {
            variant,
            used_registers: BTreeSet::new(),
            spill_area_size: 0,
            preserve_x87_control_word: false,
            preserve_mxcsr: false,
        }
    }

    /// ABI variant the frame is laid out for.
    pub fn abi_variant(&self) -> AbiVariant {
        self.variant
    }

    /// Record that the function touches a physical register.
    pub fn use_register(&mut self, reg: Reg) {
        self.used_registers.insert(reg);
    }

    /// Whether the function touches the register.
    pub fn register_used(&self, reg: Reg) -> bool {
        self.used_registers.contains(&reg)
    }

    /// Callee-preserved registers the prologue must save, in a fixed
    /// deterministic order.
    pub fn preserved_registers(&self) -> impl Iterator<Item = Reg> + '_ {
        self.used_registers
            .iter()
            .copied()
            .filter(|reg| x64::is_callee_preserved(self.variant, *reg))
    }

    /// Request at least `qwords` eight-byte slots of spill area.
    pub fn ensure_spill_area(&mut self, qwords: usize) {
        self.spill_area_size = self.spill_area_size.max(qwords);
    }

    /// Spill area size in eight-byte slots.
    pub fn spill_area_size(&self) -> usize {
        self.spill_area_size
    }

    /// Request preservation of the x87 control word.
    pub fn preserve_x87_control_word(&mut self) {
        self.preserve_x87_control_word = true;
    }

    /// Request preservation of the MXCSR register.
    pub fn preserve_mxcsr(&mut self) {
        self.preserve_mxcsr = true;
    }

    /// Size of the register-preserve area in eight-byte slots: one per
    /// saved callee-preserved register plus the control-word slots.
    pub fn preserve_area_size(&self) -> usize {
        self.preserved_registers().count()
            + usize::from(self.preserve_x87_control_word)
            + usize::from(self.preserve_mxcsr)
    }
}
