//! Statement lowering glue.
//!
//! These helpers connect the flow-control tree to the IR builder for the
//! statements that need entry/exit points: conditionals, the three loop
//! forms, `break` and `continue`. Expression and body emission stays with
//! the caller (the syntax-tree translator) and is passed in as closures;
//! the helpers own point allocation, referencing and resolution so the
//! branch targets always come out consistent.

use corten_codegen::ir::{BranchCondition, Builder, Instr, IntUnaryOp, IntWidth};
use corten_codegen::{Error, Result, SourceLocation};

use crate::flow_control::{FlowControlTree, Structure, StructurePayload};
use crate::jump;

/// Emitter of a condition value onto the operand stack.
pub type EmitFn<'a> = &'a mut dyn FnMut(&mut Builder) -> Result<()>;

/// Emitter of a statement body; receives the tree so nested statements can
/// keep using it.
pub type BodyFn<'a> = &'a mut dyn FnMut(&mut FlowControlTree, &mut Builder) -> Result<()>;

fn loop_points(tree: &FlowControlTree, structure: Structure) -> Result<(
    crate::flow_control::Point,
    crate::flow_control::Point,
)> {
    match &tree.structure(structure).payload {
        StructurePayload::Loop { continuation, end } => Ok((*continuation, *end)),
        _ => Err(Error::InvalidParameter(
            "expected flow control structure to be a loop",
        )),
    }
}

/// Lower an `if` statement. The condition emitter leaves the condition on
/// the stack at the given width.
pub fn translate_if(
    tree: &mut FlowControlTree,
    builder: &mut Builder,
    structure: Structure,
    condition_width: IntWidth,
    condition: EmitFn,
    then_branch: BodyFn,
    else_branch: Option<BodyFn>,
) -> Result<()> {
    let then_end = tree.point_alloc(Some(structure));
    let else_end = else_branch
        .is_some()
        .then(|| tree.point_alloc(Some(structure)));
    match &mut tree.structure_mut(structure).payload {
        StructurePayload::If {
            then_branch_end,
            else_branch_end,
        } => {
            *then_branch_end = Some(then_end);
            *else_branch_end = else_end;
        }
        _ => {
            return Err(Error::InvalidParameter(
                "expected flow control structure to be a conditional",
            ))
        }
    }

    condition(builder)?;
    builder.append(Instr::IntUnary(IntUnaryOp::BoolNot, condition_width));
    let branch = builder.append(Instr::Branch {
        target: 0,
        condition: BranchCondition::Bits8,
    });
    tree.point_reference(then_end, builder, branch)?;

    then_branch(tree, builder)?;
    match else_branch {
        Some(else_branch) => {
            let else_end = else_end.expect("allocated together with the else branch");
            let jump = builder.append(Instr::Jump { target: 0 });
            tree.point_reference(else_end, builder, jump)?;
            let here = builder.current_index();
            tree.point_resolve(then_end, builder, here)?;
            else_branch(tree, builder)?;
            let here = builder.current_index();
            tree.point_resolve(else_end, builder, here)?;
        }
        None => {
            let here = builder.current_index();
            tree.point_resolve(then_end, builder, here)?;
        }
    }
    Ok(())
}

/// Lower a `while` loop. `continue` re-tests the condition.
pub fn translate_while(
    tree: &mut FlowControlTree,
    builder: &mut Builder,
    structure: Structure,
    condition_width: IntWidth,
    condition: EmitFn,
    body: BodyFn,
) -> Result<()> {
    let (continuation, end) = loop_points(tree, structure)?;

    let beginning = builder.current_index();
    tree.point_resolve(continuation, builder, beginning)?;
    condition(builder)?;
    builder.append(Instr::IntUnary(IntUnaryOp::BoolNot, condition_width));
    let branch = builder.append(Instr::Branch {
        target: 0,
        condition: BranchCondition::Bits8,
    });
    tree.point_reference(end, builder, branch)?;

    body(tree, builder)?;
    builder.append(Instr::Jump { target: beginning });
    let here = builder.current_index();
    tree.point_resolve(end, builder, here)?;
    Ok(())
}

/// Lower a `do`/`while` loop. `continue` falls through to the condition
/// test at the loop tail.
pub fn translate_do_while(
    tree: &mut FlowControlTree,
    builder: &mut Builder,
    structure: Structure,
    condition_width: BranchCondition,
    condition: EmitFn,
    body: BodyFn,
) -> Result<()> {
    let (continuation, end) = loop_points(tree, structure)?;

    let beginning = builder.current_index();
    body(tree, builder)?;
    let here = builder.current_index();
    tree.point_resolve(continuation, builder, here)?;
    condition(builder)?;
    builder.append(Instr::Branch {
        target: beginning,
        condition: condition_width,
    });
    let here = builder.current_index();
    tree.point_resolve(end, builder, here)?;
    Ok(())
}

/// Lower a `for` loop. The init clause, when any, must already have been
/// emitted by the caller; the condition and tail clauses are optional
/// exactly as in the source language.
pub fn translate_for(
    tree: &mut FlowControlTree,
    builder: &mut Builder,
    structure: Structure,
    condition: Option<(IntWidth, EmitFn)>,
    body: BodyFn,
    tail: Option<EmitFn>,
) -> Result<()> {
    let (continuation, end) = loop_points(tree, structure)?;

    let beginning = builder.current_index();
    if let Some((width, condition)) = condition {
        condition(builder)?;
        builder.append(Instr::IntUnary(IntUnaryOp::BoolNot, width));
        let branch = builder.append(Instr::Branch {
            target: 0,
            condition: BranchCondition::Bits8,
        });
        tree.point_reference(end, builder, branch)?;
    }

    body(tree, builder)?;
    let here = builder.current_index();
    tree.point_resolve(continuation, builder, here)?;
    if let Some(tail) = tail {
        tail(builder)?;
    }
    builder.append(Instr::Jump { target: beginning });
    let here = builder.current_index();
    tree.point_resolve(end, builder, here)?;
    Ok(())
}

/// Lower a `break` statement: jump to the end of the innermost breakable
/// structure, popping any VLA scopes left on the way.
pub fn translate_break(
    tree: &mut FlowControlTree,
    builder: &mut Builder,
    location: &SourceLocation,
) -> Result<()> {
    let target_structure = tree
        .traverse(|data| data.kind.is_breakable())
        .map_err(|_| Error::Analysis {
            location: location.clone(),
            message: "Break statement is not allowed outside of loops and switches",
        })?;
    let target = match &tree.structure(target_structure).payload {
        StructurePayload::Loop { end, .. } => *end,
        StructurePayload::Switch { end, .. } => *end,
        _ => return Err(Error::InvalidState("unexpected flow control structure")),
    };
    let current = tree
        .top()
        .ok_or(Error::InvalidState("expected an open flow control structure"))?;
    let origin = tree.point_alloc(Some(current));
    jump::translate_jump(tree, builder, origin, target, location)
}

/// Lower a `continue` statement: jump to the continuation point of the
/// innermost loop.
pub fn translate_continue(
    tree: &mut FlowControlTree,
    builder: &mut Builder,
    location: &SourceLocation,
) -> Result<()> {
    let target_structure = tree
        .traverse(|data| data.kind.is_continuable())
        .map_err(|_| Error::Analysis {
            location: location.clone(),
            message: "Continue statement is not allowed outside of loops",
        })?;
    let target = match &tree.structure(target_structure).payload {
        StructurePayload::Loop { continuation, .. } => *continuation,
        _ => return Err(Error::InvalidState("unexpected flow control structure")),
    };
    let current = tree
        .top()
        .ok_or(Error::InvalidState("expected an open flow control structure"))?;
    let origin = tree.point_alloc(Some(current));
    jump::translate_jump(tree, builder, origin, target, location)
}
