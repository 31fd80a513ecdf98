//! `switch` statement analysis and lowering.
//!
//! The analyzer registers every `case` label (including the range
//! extension `case X ... Y:`) and the `default` label on the switch's
//! flow-control structure. Lowering then emits, per case in value order, a
//! compare-and-branch chain against the controlling value kept on the
//! operand stack, with a bounded-range form for ranged cases, and a
//! trailing dispatch to the default label or past the statement.

use corten_codegen::ir::{
    BranchCondition, Builder, ComparisonOp, Instr, IntBinaryOp, IntUnaryOp, IntWidth, TypeCode,
};
use corten_codegen::{Error, Result, SourceLocation};

use crate::flow_control::{FlowControlTree, Point, Structure, StructureKind, StructurePayload};

/// Width the controlling expression's comparisons are performed at.
fn controlling_width(code: TypeCode) -> Result<IntWidth> {
    Ok(match code {
        TypeCode::Bool | TypeCode::Char | TypeCode::Int8 => IntWidth::W8,
        TypeCode::Short | TypeCode::Int16 => IntWidth::W16,
        TypeCode::Int | TypeCode::Int32 => IntWidth::W32,
        TypeCode::Long | TypeCode::Word | TypeCode::Int64 => IntWidth::W64,
        _ => return Err(Error::InvalidState("expected value of an integral type")),
    })
}

fn switch_payload_mut(
    tree: &mut FlowControlTree,
    structure: Structure,
) -> Result<&mut StructurePayload> {
    if tree.structure(structure).kind != StructureKind::Switch {
        return Err(Error::InvalidParameter(
            "expected flow control structure to be a switch",
        ));
    }
    Ok(&mut tree.structure_mut(structure).payload)
}

/// Register a `case` label. `range_end`, when present, makes it a ranged
/// case covering `value ..= range_end`. Returns the point the case body
/// will resolve.
pub fn insert_case(
    tree: &mut FlowControlTree,
    structure: Structure,
    value: i64,
    range_end: Option<i64>,
    controlling_type: TypeCode,
    location: &SourceLocation,
) -> Result<Point> {
    // The controlling type must be integral and consistent across the
    // whole statement; the first case label records it.
    controlling_width(controlling_type).map_err(|_| Error::Analysis {
        location: location.clone(),
        message: "Expected switch controlling expression of an integral type",
    })?;
    if let Some(range_end) = range_end {
        if range_end < value {
            return Err(Error::Analysis {
                location: location.clone(),
                message: "Expected case range to be non-empty",
            });
        }
    }

    let point = tree.point_alloc(Some(structure));
    let StructurePayload::Switch {
        cases,
        ranges,
        controlling_type: recorded_type,
        ..
    } = switch_payload_mut(tree, structure)?
    else {
        unreachable!("switch structure carries a switch payload");
    };

    match recorded_type {
        None => *recorded_type = Some(controlling_type),
        Some(recorded) => {
            if *recorded != controlling_type {
                return Err(Error::InvalidState(
                    "switch controlling expression type mismatch",
                ));
            }
        }
    }

    if cases.contains_key(&value) {
        return Err(Error::Analysis {
            location: location.clone(),
            message: "Cannot duplicate case statement constants",
        });
    }
    cases.insert(value, point);
    if let Some(range_end) = range_end {
        ranges.insert(value, range_end - value + 1);
    }
    Ok(point)
}

/// Register the `default` label. Returns the point the default body will
/// resolve.
pub fn set_default_case(
    tree: &mut FlowControlTree,
    structure: Structure,
    location: &SourceLocation,
) -> Result<Point> {
    let point = tree.point_alloc(Some(structure));
    let StructurePayload::Switch { default_case, .. } = switch_payload_mut(tree, structure)?
    else {
        unreachable!("switch structure carries a switch payload");
    };
    if default_case.is_some() {
        return Err(Error::Analysis {
            location: location.clone(),
            message: "Cannot duplicate default statement",
        });
    }
    *default_case = Some(point);
    Ok(point)
}

/// Lower the case dispatch of a switch whose controlling value sits on top
/// of the operand stack. The value is consumed on every path; the final
/// jump goes to the default label when present, past the statement
/// otherwise.
pub fn translate_cases(
    tree: &mut FlowControlTree,
    builder: &mut Builder,
    structure: Structure,
) -> Result<()> {
    let StructurePayload::Switch {
        cases,
        ranges,
        default_case,
        controlling_type,
        end,
    } = &tree.structure(structure).payload
    else {
        return Err(Error::InvalidParameter(
            "expected flow control structure to be a switch",
        ));
    };
    let width = controlling_width(
        controlling_type.ok_or(Error::InvalidState("switch controlling type is not set"))?,
    )?;
    let cases: Vec<(i64, Point, i64)> = cases
        .iter()
        .map(|(value, point)| (*value, *point, ranges.get(value).copied().unwrap_or(1)))
        .collect();
    let default_case = *default_case;
    let end = *end;

    for (value, point, range) in cases {
        if range == 1 {
            builder.append(Instr::VStackPick(0));
            builder.append(Instr::IntConst(value));
            builder.append(Instr::ScalarCompare(ComparisonOp::IntEquals(width)));
        } else {
            // value <= x && x < value + range, built from the three-valued
            // compare results without branching.
            builder.append(Instr::VStackPick(0));
            builder.append(Instr::IntConst(value));
            builder.append(Instr::VStackPick(1));
            builder.append(Instr::VStackPick(1));
            builder.append(Instr::ScalarCompare(ComparisonOp::IntGreater(width)));
            builder.append(Instr::VStackExchange(2));
            builder.append(Instr::ScalarCompare(ComparisonOp::IntEquals(width)));
            builder.append(Instr::IntBinary(IntBinaryOp::BoolOr, IntWidth::W8));

            builder.append(Instr::VStackPick(1));
            builder.append(Instr::IntConst(range));
            builder.append(Instr::VStackPick(1));
            builder.append(Instr::VStackPick(1));
            builder.append(Instr::ScalarCompare(ComparisonOp::IntLesser(width)));
            builder.append(Instr::VStackExchange(2));
            builder.append(Instr::ScalarCompare(ComparisonOp::IntEquals(width)));
            builder.append(Instr::IntBinary(IntBinaryOp::BoolOr, IntWidth::W8));
            builder.append(Instr::IntBinary(IntBinaryOp::BoolAnd, IntWidth::W8));
        }
        builder.append(Instr::IntUnary(IntUnaryOp::BoolNot, IntWidth::W8));
        builder.append(Instr::Branch {
            target: builder.current_index() + 3,
            condition: BranchCondition::Bits8,
        });
        builder.append(Instr::VStackPop);
        let jump = builder.append(Instr::Jump { target: 0 });
        tree.point_reference(point, builder, jump)?;
    }

    builder.append(Instr::VStackPop);
    let jump = builder.append(Instr::Jump { target: 0 });
    match default_case {
        Some(default_case) => tree.point_reference(default_case, builder, jump)?,
        None => tree.point_reference(end, builder, jump)?,
    }
    Ok(())
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
        SourceLocation::new("test.c", 2, 5)
    }

    #[test]
    fn duplicate_cases_are_rejected() {
        let mut tree = FlowControlTree::new();
        let switch = tree.push(StructureKind::Switch, scopes());
        insert_case(&mut tree, switch, 1, None, TypeCode::Int, &location()).unwrap();
        let result = insert_case(&mut tree, switch, 1, None, TypeCode::Int, &location());
        assert_eq!(
            result,
            Err(Error::Analysis {
                location: location(),
                message: "Cannot duplicate case statement constants",
            })
        );
    }

    #[test]
    fn controlling_type_is_recorded_and_checked() {
        let mut tree = FlowControlTree::new();
        let switch = tree.push(StructureKind::Switch, scopes());
        insert_case(&mut tree, switch, 1, None, TypeCode::Int, &location()).unwrap();
        let StructurePayload::Switch {
            controlling_type, ..
        } = &tree.structure(switch).payload
        else {
            panic!("expected switch payload");
        };
        assert_eq!(*controlling_type, Some(TypeCode::Int));

        assert!(matches!(
            insert_case(&mut tree, switch, 2, None, TypeCode::Long, &location()),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            insert_case(&mut tree, switch, 3, None, TypeCode::Float64, &location()),
            Err(Error::Analysis { .. })
        ));
    }

    #[test]
    fn duplicate_default_is_rejected() {
        let mut tree = FlowControlTree::new();
        let switch = tree.push(StructureKind::Switch, scopes());
        set_default_case(&mut tree, switch, &location()).unwrap();
        assert!(matches!(
            set_default_case(&mut tree, switch, &location()),
            Err(Error::Analysis { .. })
        ));
    }

    #[test]
    fn case_dispatch_lowering() {
        // switch (int) { case 1: ...; case 2 ... 4: ...; default: ... }
        let mut tree = FlowControlTree::new();
        let switch = tree.push(StructureKind::Switch, scopes());
        insert_case(&mut tree, switch, 1, None, TypeCode::Int, &location()).unwrap();
        insert_case(&mut tree, switch, 2, Some(4), TypeCode::Int, &location()).unwrap();
        set_default_case(&mut tree, switch, &location()).unwrap();

        // The structure records keys {1, 2}, range map {2: 3} and a
        // default point.
        {
            let StructurePayload::Switch {
                cases,
                ranges,
                default_case,
                ..
            } = &tree.structure(switch).payload
            else {
                panic!("expected switch payload");
            };
            assert_eq!(cases.keys().copied().collect::<Vec<i64>>(), vec![1, 2]);
            assert_eq!(ranges.get(&2), Some(&3));
            assert!(ranges.get(&1).is_none());
            assert!(default_case.is_some());
        }

        let mut body = Body::new();
        let mut builder = Builder::new(&mut body);
        translate_cases(&mut tree, &mut builder, switch).unwrap();
        drop(builder);

        let instrs: Vec<Instr> = body.iter().copied().collect();
        let width = IntWidth::W32;

        // Unit case: a single equality compare.
        let unit = &instrs[0..7];
        assert_eq!(
            unit,
            &[
                Instr::VStackPick(0),
                Instr::IntConst(1),
                Instr::ScalarCompare(ComparisonOp::IntEquals(width)),
                Instr::IntUnary(IntUnaryOp::BoolNot, IntWidth::W8),
                Instr::Branch {
                    target: 7,
                    condition: BranchCondition::Bits8
                },
                Instr::VStackPop,
                Instr::Jump { target: 0 },
            ]
        );

        // Ranged case: bounded comparison of both ends.
        let ranged = &instrs[7..28];
        assert_eq!(
            ranged,
            &[
                Instr::VStackPick(0),
                Instr::IntConst(2),
                Instr::VStackPick(1),
                Instr::VStackPick(1),
                Instr::ScalarCompare(ComparisonOp::IntGreater(width)),
                Instr::VStackExchange(2),
                Instr::ScalarCompare(ComparisonOp::IntEquals(width)),
                Instr::IntBinary(IntBinaryOp::BoolOr, IntWidth::W8),
                Instr::VStackPick(1),
                Instr::IntConst(3),
                Instr::VStackPick(1),
                Instr::VStackPick(1),
                Instr::ScalarCompare(ComparisonOp::IntLesser(width)),
                Instr::VStackExchange(2),
                Instr::ScalarCompare(ComparisonOp::IntEquals(width)),
                Instr::IntBinary(IntBinaryOp::BoolOr, IntWidth::W8),
                Instr::IntBinary(IntBinaryOp::BoolAnd, IntWidth::W8),
                Instr::IntUnary(IntUnaryOp::BoolNot, IntWidth::W8),
                Instr::Branch {
                    target: 28,
                    condition: BranchCondition::Bits8
                },
                Instr::VStackPop,
                Instr::Jump { target: 0 },
            ]
        );

        // Trailing dispatch to the default label.
        assert_eq!(instrs[28], Instr::VStackPop);
        assert!(matches!(instrs[29], Instr::Jump { .. }));
        assert_eq!(instrs.len(), 30);
    }

    #[test]
    fn empty_case_range_is_rejected() {
        let mut tree = FlowControlTree::new();
        let switch = tree.push(StructureKind::Switch, scopes());
        assert!(matches!(
            insert_case(&mut tree, switch, 5, Some(3), TypeCode::Int, &location()),
            Err(Error::Analysis { .. })
        ));
    }
}
