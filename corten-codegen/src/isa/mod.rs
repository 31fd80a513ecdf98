//! Target instruction-set definitions.
//!
//! Only amd64 is supported; the [`x64`] module defines its register file
//! and the ABI-variant-dependent register sets the allocator and the
//! parameter classifier consult.

pub mod x64;

pub use self::x64::Reg;

/// Calling-convention variant of the amd64 target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiVariant {
    /// System V AMD64 psABI (Linux, BSD, macOS).
    SystemV,
}
