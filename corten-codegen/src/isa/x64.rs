//! amd64 register file.
//!
//! `RSP` and `RBP` never take part in allocation; they anchor the stack
//! frame. All other general-purpose registers and all sixteen SSE registers
//! are allocatable.

use crate::isa::AbiVariant;

/// An amd64 physical register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
}

impl Reg {
    /// Whether the register belongs to the SSE bank.
    pub fn is_floating_point(self) -> bool {
        self >= Reg::Xmm0
    }
}

/// Allocatable general-purpose registers in hardware order.
pub const GENERAL_PURPOSE_REGS: [Reg; 14] = [
    Reg::Rax,
    Reg::Rbx,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

/// Allocatable SSE registers in hardware order.
pub const FLOATING_POINT_REGS: [Reg; 16] = [
    Reg::Xmm0,
    Reg::Xmm1,
    Reg::Xmm2,
    Reg::Xmm3,
    Reg::Xmm4,
    Reg::Xmm5,
    Reg::Xmm6,
    Reg::Xmm7,
    Reg::Xmm8,
    Reg::Xmm9,
    Reg::Xmm10,
    Reg::Xmm11,
    Reg::Xmm12,
    Reg::Xmm13,
    Reg::Xmm14,
    Reg::Xmm15,
];

/// Callee-preserved general-purpose registers of the given ABI variant.
pub fn callee_preserved_general_purpose(variant: AbiVariant) -> &'static [Reg] {
    match variant {
        AbiVariant::SystemV => &[Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15],
    }
}

/// Whether the register must be preserved across calls under the given ABI
/// variant. All SSE registers are caller-saved under System V.
pub fn is_callee_preserved(variant: AbiVariant, reg: Reg) -> bool {
    callee_preserved_general_purpose(variant).contains(&reg)
}

/// General-purpose parameter registers in argument order.
pub fn general_purpose_parameter_regs(variant: AbiVariant) -> &'static [Reg] {
    match variant {
        AbiVariant::SystemV => &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9],
    }
}

/// SSE parameter registers in argument order.
pub fn sse_parameter_regs(variant: AbiVariant) -> &'static [Reg] {
    match variant {
        AbiVariant::SystemV => &[
            Reg::Xmm0,
            Reg::Xmm1,
            Reg::Xmm2,
            Reg::Xmm3,
            Reg::Xmm4,
            Reg::Xmm5,
            Reg::Xmm6,
            Reg::Xmm7,
        ],
    }
}

/// General-purpose return registers in classification order.
pub fn general_purpose_return_regs(variant: AbiVariant) -> &'static [Reg] {
    match variant {
        AbiVariant::SystemV => &[Reg::Rax, Reg::Rdx],
    }
}

/// SSE return registers in classification order.
pub fn sse_return_regs(variant: AbiVariant) -> &'static [Reg] {
    match variant {
        AbiVariant::SystemV => &[Reg::Xmm0, Reg::Xmm1],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_banks() {
        assert!(!Reg::Rax.is_floating_point());
        assert!(!Reg::R15.is_floating_point());
        assert!(Reg::Xmm0.is_floating_point());
        assert!(Reg::Xmm15.is_floating_point());
    }

    #[test]
    fn sysv_preserved_set() {
        let variant = AbiVariant::SystemV;
        assert!(is_callee_preserved(variant, Reg::Rbx));
        assert!(is_callee_preserved(variant, Reg::R12));
        assert!(!is_callee_preserved(variant, Reg::Rax));
        assert!(!is_callee_preserved(variant, Reg::R10));
        assert!(!is_callee_preserved(variant, Reg::Xmm6));
    }
}
