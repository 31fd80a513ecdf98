//! Middle end of the Corten C compiler.
//!
//! This crate takes over once the front end has produced a linear,
//! stack-machine intermediate representation for a translation unit. It owns
//! the three heavy stages between that IR and machine code:
//!
//! - the [`opt`] module turns linear IR into an SSA code container organized
//!   into basic blocks, with phi nodes for values that cross block
//!   boundaries on the operand stack;
//! - the [`regalloc`] module maps the virtual registers of the emitted
//!   machine-level code onto amd64 general-purpose/SSE registers or stack
//!   spill slots;
//! - the [`abi`] module computes type layouts and System V amd64 parameter
//!   classification.
//!
//! Supporting modules: [`ir`] defines the linear IR and the type
//! descriptors, [`vcode`] the virtual-register machine code the allocator
//! consumes, [`isa`] the amd64 register model, and [`frame`] the stack-frame
//! accounting object shared with the final emitter.
//!
//! Everything here is single-threaded and deterministic: compiling the same
//! function twice produces byte-identical results.

#![allow(clippy::new_without_default)]

pub use cranelift_entity as entity;

pub mod abi;
pub mod frame;
pub mod ir;
pub mod isa;
pub mod opt;
pub mod regalloc;
pub mod vcode;

mod result;

pub use crate::result::{Error, Result, SourceLocation};
