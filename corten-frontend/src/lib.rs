//! Flow-control analysis and statement lowering.
//!
//! The semantic analyzer drives this crate while walking the syntax tree:
//! it records every lexical scope, loop, switch and jump target in the
//! [`flow_control`] tree, and the statement translators lower control flow
//! into linear IR through it. The tree is what makes `break`, `continue`,
//! `goto`, `case` and variable-length-array scope push/pop come out right,
//! and what diagnoses jumps that would bypass VLA initialization.
//!
//! Forward references are handled with flow-control *points*: stable
//! handles allocated before the jump target's position is known, resolved
//! exactly once, patching every jump emitted against them.

pub mod flow_control;
pub mod jump;
pub mod stmt;
pub mod switch;

pub use crate::flow_control::{
    AssociatedScopes, FlowControlTree, Point, ScopeEvent, Structure, StructureKind,
    StructurePayload,
};
