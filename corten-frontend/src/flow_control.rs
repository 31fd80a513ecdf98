//! The flow-control tree.
//!
//! During semantic analysis every lexical block, conditional, switch and
//! loop pushes a *structure* onto the tree; the structure stack mirrors
//! statement nesting and stays available to the statement translators
//! afterwards. Structures and points are entity-indexed and owned solely by
//! the tree; parent and back references are plain ids, so the child/parent
//! and structure/point reference cycles never turn into ownership cycles.
//!
//! A flow-control *point* names a future position in the emitted linear
//! IR. Jumps may reference a point any number of times before it is
//! resolved; resolution happens exactly once and patches every recorded
//! reference through the IR builder.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap};
use std::any::Any;
use std::collections::BTreeMap;

use corten_codegen::ir::{Builder, TypeCode};
use corten_codegen::{Error, Result};

/// An opaque reference to a flow-control structure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Structure(u32);
entity_impl!(Structure, "fc");

/// An opaque reference to a flow-control point.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Point(u32);
entity_impl!(Point, "fcp");

/// Kind of a flow-control structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructureKind {
    /// Compound statement.
    Block,
    /// `if` statement.
    If,
    /// `switch` statement.
    Switch,
    /// `for` loop.
    For,
    /// `while` loop.
    While,
    /// `do`/`while` loop.
    DoWhile,
}

impl StructureKind {
    /// Whether `break` applies to the structure.
    pub fn is_breakable(self) -> bool {
        matches!(
            self,
            StructureKind::Switch | StructureKind::For | StructureKind::While | StructureKind::DoWhile
        )
    }

    /// Whether `continue` applies to the structure.
    pub fn is_continuable(self) -> bool {
        matches!(
            self,
            StructureKind::For | StructureKind::While | StructureKind::DoWhile
        )
    }
}

/// Identifier scopes the semantic analyzer associates with a structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssociatedScopes {
    /// Ordinary-identifier scope handle.
    pub ordinary_scope: u32,
    /// Tag scope handle.
    pub tag_scope: u32,
}

/// One entry of a structure's ordered scope-event list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeEvent {
    /// A nested structure was opened here.
    Child(Structure),
    /// A variable-length array was allocated here.
    VlArray {
        /// Front-end identifier of the array's scope bookkeeping local.
        id: u64,
        /// Point recording the allocation position.
        point: Point,
    },
    /// A computed-goto branching point was registered here.
    Branching(Point),
}

/// Kind-specific payload of a structure.
#[derive(Debug)]
pub enum StructurePayload {
    /// Compound statement: all state lives in the event list.
    Block,
    /// `if` statement.
    If {
        /// End of the then-branch; allocated by the statement translator.
        then_branch_end: Option<Point>,
        /// End of the else-branch, when the statement has one.
        else_branch_end: Option<Point>,
    },
    /// `switch` statement.
    Switch {
        /// Case value to target point, ordered by value.
        cases: BTreeMap<i64, Point>,
        /// Range length per ranged case value; unit cases are absent.
        ranges: BTreeMap<i64, i64>,
        /// `default` label target.
        default_case: Option<Point>,
        /// Promoted type of the controlling expression, set by the first
        /// case label.
        controlling_type: Option<TypeCode>,
        /// End of the whole statement.
        end: Point,
    },
    /// Any of the three loop forms.
    Loop {
        /// `continue` target.
        continuation: Point,
        /// `break` target and end of the statement.
        end: Point,
    },
}

/// A flow-control structure.
pub struct StructureData {
    /// Structure kind.
    pub kind: StructureKind,
    /// Scopes associated by the analyzer.
    pub scopes: AssociatedScopes,
    /// Kind-specific payload.
    pub payload: StructurePayload,
    parent: PackedOption<Structure>,
    events: Vec<ScopeEvent>,
    payload_data: Option<Box<dyn Any>>,
}

impl StructureData {
    /// Parent structure, if any.
    pub fn parent(&self) -> Option<Structure> {
        self.parent.expand()
    }

    /// Scope events in source order.
    pub fn events(&self) -> &[ScopeEvent] {
        &self.events
    }

    /// Child structures in source order.
    pub fn children(&self) -> impl Iterator<Item = Structure> + '_ {
        self.events.iter().filter_map(|event| match event {
            ScopeEvent::Child(child) => Some(*child),
            _ => None,
        })
    }
}

/// Kind of a flow-control point.
#[derive(Debug)]
pub enum PointKind {
    /// Plain jump target.
    Generic,
    /// Variable-length-array allocation event.
    VlArray(u64),
    /// Computed-goto branching point: label name to target point.
    Branching(BTreeMap<String, Point>),
}

/// A flow-control point.
pub struct PointData {
    /// Point kind.
    pub kind: PointKind,
    parent: PackedOption<Structure>,
    resolved: Option<usize>,
    dependents: Vec<usize>,
    payload_data: Option<Box<dyn Any>>,
}

impl PointData {
    /// Structure the point is bound to, if any.
    pub fn parent(&self) -> Option<Structure> {
        self.parent.expand()
    }

    /// Resolved IR offset, once resolution happened.
    pub fn resolved(&self) -> Option<usize> {
        self.resolved
    }
}

/// The flow-control tree of one function.
pub struct FlowControlTree {
    structures: PrimaryMap<Structure, StructureData>,
    points: PrimaryMap<Point, PointData>,
    current: PackedOption<Structure>,
    roots: Vec<Structure>,
}

impl FlowControlTree {
    /// Fresh empty tree; the current position is the implicit root.
    pub fn new() -> Self {
        Self {
            structures: PrimaryMap::new(),
            points: PrimaryMap::new(),
            current: PackedOption::default(),
            roots: Vec::new(),
        }
    }

    /// Open a new structure of the given kind under the current one and
    /// make it current.
    pub fn push(&mut self, kind: StructureKind, scopes: AssociatedScopes) -> Structure {
        let parent = self.current;
        let structure = self.structures.push(StructureData {
            kind,
            scopes,
            payload: StructurePayload::Block,
            parent,
            events: Vec::new(),
            payload_data: None,
        });

        let payload = match kind {
            StructureKind::Block => StructurePayload::Block,
            StructureKind::If => StructurePayload::If {
                then_branch_end: None,
                else_branch_end: None,
            },
            StructureKind::Switch => StructurePayload::Switch {
                cases: BTreeMap::new(),
                ranges: BTreeMap::new(),
                default_case: None,
                controlling_type: None,
                end: self.point_alloc(Some(structure)),
            },
            StructureKind::For | StructureKind::While | StructureKind::DoWhile => {
                StructurePayload::Loop {
                    continuation: self.point_alloc(Some(structure)),
                    end: self.point_alloc(Some(structure)),
                }
            }
        };
        self.structures[structure].payload = payload;

        match parent.expand() {
            Some(parent) => self.structures[parent].events.push(ScopeEvent::Child(structure)),
            None => self.roots.push(structure),
        }
        self.current = Some(structure).into();
        structure
    }

    /// Close the current structure, returning to its parent. Popped
    /// structures keep their state but can never become current again.
    pub fn pop(&mut self) -> Result<()> {
        let current = self.current.expand().ok_or(Error::InvalidState(
            "cannot pop flow control tree top-level structure",
        ))?;
        self.current = self.structures[current].parent;
        Ok(())
    }

    /// Currently open structure, or `None` at the root.
    pub fn top(&self) -> Option<Structure> {
        self.current.expand()
    }

    /// Top-level structures in source order.
    pub fn roots(&self) -> &[Structure] {
        &self.roots
    }

    /// Climb the parent chain from the current structure, returning the
    /// first structure the predicate accepts.
    pub fn traverse(&self, predicate: impl Fn(&StructureData) -> bool) -> Result<Structure> {
        let mut cursor = self.current.expand();
        while let Some(structure) = cursor {
            let data = &self.structures[structure];
            if predicate(data) {
                return Ok(structure);
            }
            cursor = data.parent.expand();
        }
        Err(Error::NotFound(
            "no matching structure on the flow control stack",
        ))
    }

    /// Structure data by reference.
    pub fn structure(&self, structure: Structure) -> &StructureData {
        &self.structures[structure]
    }

    /// Structure data by mutable reference.
    pub fn structure_mut(&mut self, structure: Structure) -> &mut StructureData {
        &mut self.structures[structure]
    }

    /// Parent of a structure.
    pub fn parent(&self, structure: Structure) -> Option<Structure> {
        self.structures[structure].parent.expand()
    }

    /// Attach an opaque payload to a structure; the previous payload, if
    /// any, is dropped.
    pub fn set_structure_payload(&mut self, structure: Structure, payload: Box<dyn Any>) {
        self.structures[structure].payload_data = Some(payload);
    }

    /// Opaque payload of a structure.
    pub fn structure_payload(&self, structure: Structure) -> Option<&dyn Any> {
        self.structures[structure].payload_data.as_deref()
    }

    // Points.

    /// Allocate a new unresolved point, optionally bound to a structure.
    pub fn point_alloc(&mut self, parent: Option<Structure>) -> Point {
        self.points.push(PointData {
            kind: PointKind::Generic,
            parent: parent.into(),
            resolved: None,
            dependents: Vec::new(),
            payload_data: None,
        })
    }

    /// Bind a previously unbound point to a structure.
    pub fn point_bind(&mut self, point: Point, parent: Structure) -> Result<()> {
        let data = &mut self.points[point];
        if data.parent.is_some() {
            return Err(Error::InvalidParameter(
                "expected unbound flow control point",
            ));
        }
        data.parent = Some(parent).into();
        Ok(())
    }

    /// Point data by reference.
    pub fn point(&self, point: Point) -> &PointData {
        &self.points[point]
    }

    /// Structure a point is bound to.
    pub fn point_parent(&self, point: Point) -> Option<Structure> {
        self.points[point].parent.expand()
    }

    /// Attach an opaque payload to a point.
    pub fn set_point_payload(&mut self, point: Point, payload: Box<dyn Any>) {
        self.points[point].payload_data = Some(payload);
    }

    /// Opaque payload of a point.
    pub fn point_payload(&self, point: Point) -> Option<&dyn Any> {
        self.points[point].payload_data.as_deref()
    }

    /// Record that the jump or branch at `offset` targets `point`. If the
    /// point is already resolved the instruction is patched immediately,
    /// otherwise the patch is deferred until resolution.
    pub fn point_reference(
        &mut self,
        point: Point,
        builder: &mut Builder,
        offset: usize,
    ) -> Result<()> {
        match self.points[point].resolved {
            Some(location) => builder.patch_jump_target(offset, location),
            None => {
                self.points[point].dependents.push(offset);
                Ok(())
            }
        }
    }

    /// Resolve a point to a concrete IR offset, patching every jump
    /// recorded against it. A point resolves exactly once.
    pub fn point_resolve(
        &mut self,
        point: Point,
        builder: &mut Builder,
        location: usize,
    ) -> Result<()> {
        let data = &mut self.points[point];
        if data.resolved.is_some() {
            return Err(Error::InvalidState(
                "flow control point is already resolved",
            ));
        }
        data.resolved = Some(location);
        let dependents = std::mem::take(&mut data.dependents);
        for offset in dependents {
            builder.patch_jump_target(offset, location)?;
        }
        Ok(())
    }

    // Block scope events.

    /// Record a variable-length-array allocation in a block.
    pub fn block_add_vl_array(&mut self, structure: Structure, id: u64) -> Result<()> {
        if self.structures[structure].kind != StructureKind::Block {
            return Err(Error::InvalidParameter(
                "expected flow control structure to be a block",
            ));
        }
        let point = self.points.push(PointData {
            kind: PointKind::VlArray(id),
            parent: Some(structure).into(),
            resolved: None,
            dependents: Vec::new(),
            payload_data: None,
        });
        self.structures[structure]
            .events
            .push(ScopeEvent::VlArray { id, point });
        Ok(())
    }

    /// Identifier of the earliest variable-length array allocated in the
    /// block.
    pub fn block_vl_array_head(&self, structure: Structure) -> Result<u64> {
        if self.structures[structure].kind != StructureKind::Block {
            return Err(Error::InvalidParameter(
                "expected flow control structure to be a block",
            ));
        }
        self.structures[structure]
            .events
            .iter()
            .find_map(|event| match event {
                ScopeEvent::VlArray { id, .. } => Some(*id),
                _ => None,
            })
            .ok_or(Error::NotFound(
                "block has no associated variable-length arrays",
            ))
    }

    /// Whether the block allocates any variable-length arrays.
    pub fn block_contains_vl_arrays(&self, structure: Structure) -> bool {
        self.structures[structure]
            .events
            .iter()
            .any(|event| matches!(event, ScopeEvent::VlArray { .. }))
    }

    /// Register a computed-goto branching point in a structure.
    pub fn block_add_branching_point(&mut self, structure: Structure) -> Result<Point> {
        let point = self.points.push(PointData {
            kind: PointKind::Branching(BTreeMap::new()),
            parent: Some(structure).into(),
            resolved: None,
            dependents: Vec::new(),
            payload_data: None,
        });
        self.structures[structure]
            .events
            .push(ScopeEvent::Branching(point));
        Ok(point)
    }

    /// Add a named branch to a branching point.
    pub fn branching_point_append(
        &mut self,
        branching: Point,
        identifier: impl Into<String>,
        target: Point,
    ) -> Result<()> {
        match &mut self.points[branching].kind {
            PointKind::Branching(branches) => {
                branches.insert(identifier.into(), target);
                Ok(())
            }
            _ => Err(Error::InvalidParameter(
                "expected flow control branching point",
            )),
        }
    }

    // Ancestry.

    /// Lowest structure that is an ancestor of both points.
    pub fn common_parent(&self, first: Point, second: Point) -> Result<Structure> {
        let mut cursor = self.points[first].parent.expand();
        while let Some(candidate) = cursor {
            let mut other = self.points[second].parent.expand();
            while let Some(structure) = other {
                if structure == candidate {
                    return Ok(candidate);
                }
                other = self.structures[structure].parent.expand();
            }
            cursor = self.structures[candidate].parent.expand();
        }
        Err(Error::NotFound(
            "unable to determine common parent for two flow control points",
        ))
    }

    /// Ancestors of a point from its immediate parent up to, but not
    /// including, `top_parent`.
    pub fn point_parents(&self, point: Point, top_parent: Option<Structure>) -> Vec<Structure> {
        let mut parents = Vec::new();
        let mut cursor = self.points[point].parent.expand();
        while let Some(structure) = cursor {
            if Some(structure) == top_parent {
                break;
            }
            parents.push(structure);
            cursor = self.structures[structure].parent.expand();
        }
        parents
    }
}
