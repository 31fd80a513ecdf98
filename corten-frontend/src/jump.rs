//! Jump lowering.
//!
//! `goto`, `break` and `continue` all reduce to a jump from one
//! flow-control point to another. Lowering has to do more than emit a jump
//! instruction: every variable-length-array scope left on the way out must
//! be popped at run time, and jumps that would enter a scope holding a live
//! VLA, or skip over a VLA allocation in the target's scope, are
//! diagnosed.

use log::trace;

use corten_codegen::ir::{Builder, Instr, MemoryWidth};
use corten_codegen::{Error, Result, SourceLocation};

use crate::flow_control::{FlowControlTree, Point, ScopeEvent, Structure, StructureKind};

/// Emit the scope-pop for the earliest variable-length array of a block:
/// load the scope token saved next to the array and pop the dynamic scope.
fn emit_vl_array_pop(tree: &FlowControlTree, builder: &mut Builder, block: Structure) -> Result<()> {
    let id = tree.block_vl_array_head(block)?;
    emit_vl_array_pop_for(builder, id);
    Ok(())
}

fn emit_vl_array_pop_for(builder: &mut Builder, id: u64) {
    builder.append(Instr::GetLocal {
        id,
        type_index: 0,
        offset: 0,
    });
    builder.append(Instr::Load {
        width: MemoryWidth::W64,
        volatile: false,
    });
    builder.append(Instr::ScopePop);
}

/// Lower a jump from `origin` to `target`.
///
/// Emits run-time scope pops for every VLA-carrying block left between the
/// origin and the common parent of both points, verifies that the jump does
/// not enter a VLA scope or bypass a VLA allocation, and finally emits a
/// jump referencing the target point.
pub fn translate_jump(
    tree: &mut FlowControlTree,
    builder: &mut Builder,
    origin: Point,
    target: Point,
    location: &SourceLocation,
) -> Result<()> {
    let target_structure = tree.point_parent(target).ok_or(Error::InvalidParameter(
        "expected target flow control point to be bound to a structure",
    ))?;
    let origin_structure = tree.point_parent(origin).ok_or(Error::InvalidParameter(
        "expected origin flow control point to be bound to a structure",
    ))?;

    let common_parent = tree.common_parent(origin, target)?;
    trace!("jump {} -> {} through {}", origin, target, common_parent);
    let target_parents = tree.point_parents(target, Some(common_parent));

    // Entering any block that holds a live VLA is invalid.
    let mut top_target = target_structure;
    for &structure in &target_parents {
        if tree.structure(structure).kind == StructureKind::Block
            && tree.block_contains_vl_arrays(structure)
        {
            return Err(Error::Analysis {
                location: location.clone(),
                message: "Cannot jump into scope with local VLA variables",
            });
        }
        top_target = structure;
    }

    // Pop the VLA scopes of every block left between the origin and the
    // common parent.
    let mut top_origin = origin_structure;
    if origin_structure != common_parent {
        let mut cursor = tree.parent(origin_structure);
        while let Some(structure) = cursor {
            if structure == common_parent {
                break;
            }
            if tree.structure(structure).kind == StructureKind::Block
                && tree.block_contains_vl_arrays(structure)
            {
                emit_vl_array_pop(tree, builder, structure)?;
            }
            top_origin = structure;
            cursor = tree.parent(structure);
        }
    }

    // When origin and target descend from distinct children of the common
    // parent, scan the sibling chain: a forward jump may not skip a VLA
    // allocation that would still be uninitialized at the target, while a
    // backward jump over one pops its scope.
    if top_target != common_parent && top_origin != common_parent && top_target != top_origin {
        let events: Vec<ScopeEvent> = tree.structure(common_parent).events().to_vec();
        let mut found_origin_first = false;
        let mut found_target_first = false;
        for event in events {
            if found_origin_first {
                match event {
                    ScopeEvent::Child(structure) if structure == top_target => break,
                    ScopeEvent::VlArray { .. } => {
                        return Err(Error::Analysis {
                            location: location.clone(),
                            message: "Cannot jump in the scope with uninitialized VLA variables",
                        })
                    }
                    _ => {}
                }
            } else if found_target_first {
                match event {
                    ScopeEvent::Child(structure) if structure == top_origin => break,
                    ScopeEvent::VlArray { id, .. } => {
                        emit_vl_array_pop_for(builder, id);
                        break;
                    }
                    _ => {}
                }
            } else {
                match event {
                    ScopeEvent::Child(structure) if structure == top_origin => {
                        found_origin_first = true;
                    }
                    ScopeEvent::Child(structure) if structure == top_target => {
                        found_target_first = true;
                    }
                    _ => {}
                }
            }
        }
        if !found_origin_first && !found_target_first {
            return Err(Error::InvalidState("unexpected flow control structure"));
        }
    }

    let jump = builder.append(Instr::Jump { target: 0 });
    tree.point_reference(target, builder, jump)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_control::AssociatedScopes;
    use corten_codegen::ir::Body;

    fn scopes() -> AssociatedScopes {
        AssociatedScopes {
            ordinary_scope: 0,
            tag_scope: 0,
        }
    }

    fn location() -> SourceLocation {
        SourceLocation::new("test.c", 1, 1)
    }

    #[test]
    fn jump_out_of_vla_scopes_pops_them() {
        // block (VLA 5) > for > block, jumping to the enclosing function
        // body. The VLA scope is popped on the way out.
        let mut tree = FlowControlTree::new();
        let function_body = tree.push(StructureKind::Block, scopes());
        let target = tree.point_alloc(Some(function_body));

        let vla_block = tree.push(StructureKind::Block, scopes());
        tree.block_add_vl_array(vla_block, 5).unwrap();
        tree.push(StructureKind::For, scopes());
        let inner = tree.push(StructureKind::Block, scopes());
        let origin = tree.point_alloc(Some(inner));

        let mut body = Body::new();
        let mut builder = Builder::new(&mut body);
        translate_jump(&mut tree, &mut builder, origin, target, &location()).unwrap();
        tree.point_resolve(target, &mut builder, 0).unwrap();
        drop(builder);

        let instrs: Vec<Instr> = body.iter().copied().collect();
        assert_eq!(
            instrs,
            vec![
                Instr::GetLocal {
                    id: 5,
                    type_index: 0,
                    offset: 0
                },
                Instr::Load {
                    width: MemoryWidth::W64,
                    volatile: false
                },
                Instr::ScopePop,
                Instr::Jump { target: 0 },
            ]
        );
    }

    #[test]
    fn jump_into_vla_scope_is_rejected() {
        // block (outer) > block (inner, VLA 9) with a label inside the
        // inner block; a goto from the outer block must fail.
        let mut tree = FlowControlTree::new();
        let outer = tree.push(StructureKind::Block, scopes());
        let inner = tree.push(StructureKind::Block, scopes());
        tree.block_add_vl_array(inner, 9).unwrap();
        let label = tree.point_alloc(Some(inner));
        tree.pop().unwrap();
        let origin = tree.point_alloc(Some(outer));

        let mut body = Body::new();
        let mut builder = Builder::new(&mut body);
        let result = translate_jump(&mut tree, &mut builder, origin, label, &location());
        assert_eq!(
            result,
            Err(Error::Analysis {
                location: location(),
                message: "Cannot jump into scope with local VLA variables",
            })
        );
    }

    #[test]
    fn forward_jump_over_vla_allocation_is_rejected() {
        // { goto l; int a[n]; { l: } } must fail: the jump would leave
        // the array uninitialized at the label.
        let mut tree = FlowControlTree::new();
        let outer = tree.push(StructureKind::Block, scopes());
        let origin_block = tree.push(StructureKind::Block, scopes());
        let origin = tree.point_alloc(Some(origin_block));
        tree.pop().unwrap();
        tree.block_add_vl_array(outer, 3).unwrap();
        let label_block = tree.push(StructureKind::Block, scopes());
        let label = tree.point_alloc(Some(label_block));
        tree.pop().unwrap();

        let mut body = Body::new();
        let mut builder = Builder::new(&mut body);
        let result = translate_jump(&mut tree, &mut builder, origin, label, &location());
        assert_eq!(
            result,
            Err(Error::Analysis {
                location: location(),
                message: "Cannot jump in the scope with uninitialized VLA variables",
            })
        );
    }

    #[test]
    fn backward_jump_over_vla_allocation_pops_it() {
        // { { l: } int a[n]; { goto l; } } jumps back before the
        // allocation, which pops the array's scope.
        let mut tree = FlowControlTree::new();
        let outer = tree.push(StructureKind::Block, scopes());
        let label_block = tree.push(StructureKind::Block, scopes());
        let label = tree.point_alloc(Some(label_block));
        tree.pop().unwrap();
        tree.block_add_vl_array(outer, 7).unwrap();
        let origin_block = tree.push(StructureKind::Block, scopes());
        let origin = tree.point_alloc(Some(origin_block));
        tree.pop().unwrap();

        let mut body = Body::new();
        let mut builder = Builder::new(&mut body);
        translate_jump(&mut tree, &mut builder, origin, label, &location()).unwrap();
        drop(builder);

        let instrs: Vec<Instr> = body.iter().copied().collect();
        assert_eq!(
            instrs,
            vec![
                Instr::GetLocal {
                    id: 7,
                    type_index: 0,
                    offset: 0
                },
                Instr::Load {
                    width: MemoryWidth::W64,
                    volatile: false
                },
                Instr::ScopePop,
                Instr::Jump { target: 0 },
            ]
        );
    }

    #[test]
    fn jump_to_enclosing_scope_point() {
        // A goto to a label directly in an enclosing block emits a plain
        // jump.
        let mut tree = FlowControlTree::new();
        let outer = tree.push(StructureKind::Block, scopes());
        let label = tree.point_alloc(Some(outer));
        let inner = tree.push(StructureKind::Block, scopes());
        let origin = tree.point_alloc(Some(inner));

        let mut body = Body::new();
        let mut builder = Builder::new(&mut body);
        builder.append(Instr::Nop);
        translate_jump(&mut tree, &mut builder, origin, label, &location()).unwrap();
        tree.point_resolve(label, &mut builder, 0).unwrap();
        drop(builder);

        assert_eq!(*body.at(1).unwrap(), Instr::Jump { target: 0 });
    }
}
