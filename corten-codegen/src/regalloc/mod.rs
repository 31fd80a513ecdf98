//! amd64 register allocation.
//!
//! The allocator maps every virtual register of a [`crate::vcode::VCode`]
//! stream onto a physical register or a spill slot. It is a live-range
//! interference allocator: lifetimes are half-open-ish index intervals over
//! the linearized instruction stream, interference is computed pairwise
//! inside *virtual blocks* (selector-delimited nesting scopes that bound
//! how far interference has to be checked), and allocation proceeds in
//! priority buckets that favor short-lived values.
//!
//! There is no iterative back-off: the instruction selector is expected to
//! produce satisfiable preallocation requests, and an unsatisfiable
//! requirement surfaces as an internal error.

mod allocator;
mod bitset;

pub use self::allocator::{Allocation, Lifetime, RegisterAllocator};
pub(crate) use self::bitset::BitSet;
