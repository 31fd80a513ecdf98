//! SSA optimizer representation.
//!
//! The [`code`] module defines the code container: basic blocks holding
//! value-producing instructions, per-block control lists, phi nodes, call
//! sites and inline-assembly sites. The [`constructor`] module translates a
//! linear stack-machine function body into that container.

pub mod code;
pub mod constructor;

use std::collections::BTreeMap;

use crate::ir;
use crate::opt::code::{Code, Value};

/// Per-instruction debug information side table.
///
/// The container itself treats this as opaque payload; the constructor
/// records which linear-IR offset produced every SSA instruction, and the
/// final emitter maps that back to source locations.
#[derive(Debug, Default)]
pub struct DebugInfo {
    instruction_locations: BTreeMap<Value, usize>,
    location_cursor: Option<usize>,
}

impl DebugInfo {
    /// Empty side table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the linear-IR offset subsequently registered instructions are
    /// attributed to, or `None` to suspend attribution.
    pub fn set_instruction_location_cursor(&mut self, cursor: Option<usize>) {
        self.location_cursor = cursor;
    }

    /// Attribute `value` to the current cursor position, if any.
    pub fn register_instruction(&mut self, value: Value) {
        if let Some(cursor) = self.location_cursor {
            self.instruction_locations.insert(value, cursor);
        }
    }

    /// Linear-IR offset the instruction was produced from.
    pub fn instruction_location(&self, value: Value) -> Option<usize> {
        self.instruction_locations.get(&value).copied()
    }
}

/// An SSA function under optimization: the declaration it implements, its
/// code container and the debug-info side table.
pub struct Function {
    /// Declaration of the function being compiled.
    pub decl: ir::FuncDecl,
    /// SSA code container.
    pub code: Code,
    /// Debug-info side table.
    pub debug_info: DebugInfo,
}

impl Function {
    /// Fresh function with an empty code container.
    pub fn new(decl: ir::FuncDecl) -> Self {
        Self {
            decl,
            code: Code::new(),
            debug_info: DebugInfo::new(),
        }
    }
}
