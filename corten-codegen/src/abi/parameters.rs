//! System V amd64 function-parameter classification and allocation.
//!
//! Classification runs per parameter: scalars map straight to a register
//! class, aggregates are partitioned into qwords and merged through the
//! class lattice, then post-processed (oversized, memory-tainted,
//! misaligned and dangling-`X87Up` aggregates degrade to memory).
//! Allocation walks the classified parameters and hands out the fixed
//! argument register sequences; whatever does not fit goes to the stack at
//! eight-byte granularity.

use smallvec::SmallVec;

use crate::abi::layout::TypeLayout;
use crate::abi::pad_aligned;
use crate::abi::qwords::{DataClass, Qwords, QWORD};
use crate::ir::types::{BuiltinType, IrType, TypeCode};
use crate::isa::{x64, AbiVariant, Reg};
use crate::{Error, Result};

/// One register consumed by a multi-register parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterRegister {
    /// General-purpose register.
    GeneralPurpose(Reg),
    /// SSE register.
    Sse(Reg),
}

/// Where a parameter (or return value) lives at the call boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParameterLocation {
    /// Not yet allocated.
    None,
    /// A single general-purpose register.
    GeneralPurposeRegister(Reg),
    /// A single SSE register.
    SseRegister(Reg),
    /// The x87 register stack (long double return values).
    X87,
    /// One register per non-empty qword.
    MultipleRegisters(SmallVec<[ParameterRegister; 2]>),
    /// Caller stack memory at the given offset from the argument area
    /// (or the hidden-pointer return buffer when a return value).
    Memory {
        /// Byte offset within the argument area.
        offset: i64,
    },
}

#[derive(Clone, Debug, PartialEq)]
enum Classification {
    Integer,
    Sse,
    X87,
    ComplexX87,
    Aggregate(SmallVec<[DataClass; 4]>),
    Memory,
}

/// One classified parameter.
#[derive(Clone, Debug)]
pub struct Parameter {
    /// Index of the parameter's entry in the type descriptor.
    pub type_index: usize,
    /// Assigned location; [`ParameterLocation::None`] until allocation.
    pub location: ParameterLocation,
    classification: Classification,
    size: usize,
    alignment: usize,
}

impl Parameter {
    /// Qword classes of an aggregate parameter.
    pub fn classes(&self) -> Option<&[DataClass]> {
        match &self.classification {
            Classification::Aggregate(classes) => Some(classes),
            _ => None,
        }
    }

    /// Whether classification demoted the parameter to memory.
    pub fn is_memory_class(&self) -> bool {
        matches!(self.classification, Classification::Memory)
    }
}

/// Register and stack totals consumed by an allocated parameter list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParameterRequirements {
    /// General-purpose registers consumed.
    pub general_purpose_regs: usize,
    /// SSE registers consumed.
    pub sse_regs: usize,
    /// Stack bytes consumed.
    pub stack: usize,
}

/// Classified and allocated parameters of one function signature.
#[derive(Clone, Debug)]
pub struct FunctionParameters {
    variant: AbiVariant,
    parameters: Vec<Parameter>,
    requirements: ParameterRequirements,
}

impl FunctionParameters {
    /// Classify every top-level entry of `ty` as a parameter. The layout
    /// must have been computed in function-parameter context.
    pub fn classify(variant: AbiVariant, ty: &IrType, layout: &TypeLayout) -> Result<Self> {
        let mut parameters = Vec::new();
        let mut index = 0;
        while index < ty.len() {
            let entry_layout = *layout.at(index)?;
            parameters.push(Parameter {
                type_index: index,
                location: ParameterLocation::None,
                classification: classify_entry(ty, layout, index)?,
                size: entry_layout.size,
                alignment: entry_layout.alignment,
            });
            index += ty.entry_span(index)?;
        }
        Ok(Self {
            variant,
            parameters,
            requirements: ParameterRequirements::default(),
        })
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Whether the signature has no parameters.
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Parameter at `index`.
    pub fn at(&self, index: usize) -> Result<&Parameter> {
        self.parameters
            .get(index)
            .ok_or(Error::InvalidParameter("parameter index out of bounds"))
    }

    /// Totals consumed by the allocated parameters.
    pub fn requirements(&self) -> ParameterRequirements {
        self.requirements
    }

    /// Assign argument registers and stack offsets.
    pub fn allocate(&mut self) -> Result<()> {
        let gp_regs = x64::general_purpose_parameter_regs(self.variant);
        let sse_regs = x64::sse_parameter_regs(self.variant);
        self.allocate_impl(gp_regs, sse_regs, false)
    }

    /// Assign return-value registers. A memory-class return is delivered
    /// through the caller's hidden buffer pointer.
    pub fn allocate_return(&mut self) -> Result<()> {
        let gp_regs = x64::general_purpose_return_regs(self.variant);
        let sse_regs = x64::sse_return_regs(self.variant);
        self.allocate_impl(gp_regs, sse_regs, true)
    }

    fn allocate_impl(
        &mut self,
        gp_regs: &[Reg],
        sse_regs: &[Reg],
        returning: bool,
    ) -> Result<()> {
        let mut next_gp = 0usize;
        let mut next_sse = 0usize;
        let mut stack = 0usize;

        for parameter in &mut self.parameters {
            parameter.location = match &parameter.classification {
                Classification::Integer => {
                    if next_gp < gp_regs.len() {
                        let reg = gp_regs[next_gp];
                        next_gp += 1;
                        ParameterLocation::GeneralPurposeRegister(reg)
                    } else {
                        spill_to_stack(&mut stack, QWORD, QWORD)
                    }
                }
                Classification::Sse => {
                    if next_sse < sse_regs.len() {
                        let reg = sse_regs[next_sse];
                        next_sse += 1;
                        ParameterLocation::SseRegister(reg)
                    } else {
                        spill_to_stack(&mut stack, QWORD, QWORD)
                    }
                }
                Classification::X87 => {
                    if returning {
                        ParameterLocation::X87
                    } else {
                        spill_to_stack(&mut stack, 2 * QWORD, 2 * QWORD)
                    }
                }
                Classification::ComplexX87 => {
                    if returning {
                        ParameterLocation::Memory { offset: 0 }
                    } else {
                        spill_to_stack(&mut stack, 4 * QWORD, 2 * QWORD)
                    }
                }
                Classification::Memory => {
                    if returning {
                        ParameterLocation::Memory { offset: 0 }
                    } else {
                        spill_to_stack(
                            &mut stack,
                            parameter.size,
                            parameter.alignment.max(QWORD),
                        )
                    }
                }
                Classification::Aggregate(classes) => {
                    let needed_gp = classes
                        .iter()
                        .filter(|class| **class == DataClass::Integer)
                        .count();
                    let needed_sse = classes
                        .iter()
                        .filter(|class| **class == DataClass::Sse)
                        .count();
                    let has_x87 = classes.iter().any(|class| {
                        matches!(
                            class,
                            DataClass::X87 | DataClass::X87Up | DataClass::ComplexX87
                        )
                    });
                    if !has_x87
                        && next_gp + needed_gp <= gp_regs.len()
                        && next_sse + needed_sse <= sse_regs.len()
                    {
                        let mut registers = SmallVec::new();
                        for class in classes {
                            match class {
                                DataClass::Integer => {
                                    registers
                                        .push(ParameterRegister::GeneralPurpose(gp_regs[next_gp]));
                                    next_gp += 1;
                                }
                                DataClass::Sse => {
                                    registers.push(ParameterRegister::Sse(sse_regs[next_sse]));
                                    next_sse += 1;
                                }
                                // Padding and continuation qwords consume
                                // no register of their own.
                                DataClass::NoClass | DataClass::SseUp => {}
                                _ => {
                                    return Err(Error::InvalidState(
                                        "unexpected data class in register aggregate",
                                    ))
                                }
                            }
                        }
                        ParameterLocation::MultipleRegisters(registers)
                    } else if returning {
                        ParameterLocation::Memory { offset: 0 }
                    } else {
                        spill_to_stack(
                            &mut stack,
                            parameter.size,
                            parameter.alignment.max(QWORD),
                        )
                    }
                }
            };
        }

        self.requirements = ParameterRequirements {
            general_purpose_regs: next_gp,
            sse_regs: next_sse,
            stack,
        };
        Ok(())
    }
}

fn spill_to_stack(stack: &mut usize, size: usize, alignment: usize) -> ParameterLocation {
    *stack = pad_aligned(*stack, alignment);
    let offset = *stack as i64;
    *stack += pad_aligned(size, QWORD);
    ParameterLocation::Memory { offset }
}

fn classify_entry(ty: &IrType, layout: &TypeLayout, index: usize) -> Result<Classification> {
    let entry = ty.at(index)?;
    Ok(match entry.code {
        TypeCode::Bool
        | TypeCode::Char
        | TypeCode::Int8
        | TypeCode::Short
        | TypeCode::Int16
        | TypeCode::Int
        | TypeCode::Int32
        | TypeCode::Long
        | TypeCode::Word
        | TypeCode::Int64
        | TypeCode::Bits(_) => Classification::Integer,
        TypeCode::Float32 | TypeCode::Float64 => Classification::Sse,
        TypeCode::LongDouble => Classification::X87,
        TypeCode::ComplexLongDouble => Classification::ComplexX87,
        TypeCode::ComplexFloat32
        | TypeCode::ComplexFloat64
        | TypeCode::Struct { .. }
        | TypeCode::Union { .. }
        | TypeCode::Array { .. }
        | TypeCode::Builtin(_) => classify_aggregate(ty, layout, index)?,
    })
}

fn classify_aggregate(ty: &IrType, layout: &TypeLayout, index: usize) -> Result<Classification> {
    let entry_layout = *layout.at(index)?;
    // Oversized or unaligned aggregates go straight to memory.
    if entry_layout.size > 8 * QWORD || !entry_layout.aligned {
        return Ok(Classification::Memory);
    }
    let count = (entry_layout.size + QWORD - 1) / QWORD;
    if count == 0 {
        return Ok(Classification::Aggregate(SmallVec::new()));
    }

    let mut qwords = Qwords::new(count);
    classify_nested(ty, layout, index, &mut qwords)?;
    let classes = qwords.classes();

    if classes.contains(&DataClass::Memory) {
        return Ok(Classification::Memory);
    }
    for (position, class) in classes.iter().enumerate() {
        let preceded_by_x87 = position > 0 && classes[position - 1] == DataClass::X87;
        if *class == DataClass::X87Up && !preceded_by_x87 {
            return Ok(Classification::Memory);
        }
    }
    Ok(Classification::Aggregate(classes))
}

fn classify_nested(
    ty: &IrType,
    layout: &TypeLayout,
    index: usize,
    qwords: &mut Qwords,
) -> Result<()> {
    let entry = *ty.at(index)?;
    let entry_layout = *layout.at(index)?;
    match entry.code {
        TypeCode::Bool
        | TypeCode::Char
        | TypeCode::Int8
        | TypeCode::Short
        | TypeCode::Int16
        | TypeCode::Int
        | TypeCode::Int32
        | TypeCode::Long
        | TypeCode::Word
        | TypeCode::Int64 => {
            qwords.next(DataClass::Integer, entry_layout.size, entry_layout.alignment)?;
        }
        TypeCode::Bits(width) => {
            qwords.next_bitfield(DataClass::Integer, width as usize)?;
        }
        TypeCode::Float32 | TypeCode::Float64 => {
            qwords.next(DataClass::Sse, entry_layout.size, entry_layout.alignment)?;
        }
        TypeCode::LongDouble => {
            qwords.next(DataClass::X87, QWORD, 16)?;
            qwords.next(DataClass::X87Up, QWORD, QWORD)?;
        }
        TypeCode::ComplexFloat32 => {
            qwords.next(DataClass::Sse, 8, 4)?;
        }
        TypeCode::ComplexFloat64 => {
            qwords.next(DataClass::Sse, 16, 8)?;
        }
        TypeCode::ComplexLongDouble => {
            qwords.next(DataClass::ComplexX87, 32, 16)?;
        }
        TypeCode::Struct { fields } => {
            let mut cursor = index + 1;
            for _ in 0..fields {
                classify_nested(ty, layout, cursor, qwords)?;
                cursor += ty.entry_span(cursor)?;
            }
        }
        TypeCode::Union { fields } => {
            let start = qwords.save_position();
            let mut furthest = start;
            let mut cursor = index + 1;
            for _ in 0..fields {
                qwords.restore_position(start)?;
                classify_nested(ty, layout, cursor, qwords)?;
                furthest = furthest.max(qwords.save_position());
                cursor += ty.entry_span(cursor)?;
            }
            qwords.restore_position(furthest)?;
        }
        TypeCode::Array { length } => {
            for _ in 0..length {
                classify_nested(ty, layout, index + 1, qwords)?;
            }
        }
        TypeCode::Builtin(BuiltinType::Vararg) => {
            qwords.next(DataClass::Integer, 3 * QWORD, QWORD)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::layout::LayoutContext;
    use crate::ir::types::TypeEntry;

    fn classified(entries: Vec<TypeEntry>) -> FunctionParameters {
        let ty = IrType::from_entries(entries);
        let layout = TypeLayout::new(&ty, LayoutContext::FunctionParameter).unwrap();
        FunctionParameters::classify(AbiVariant::SystemV, &ty, &layout).unwrap()
    }

    fn allocated(entries: Vec<TypeEntry>) -> FunctionParameters {
        let mut parameters = classified(entries);
        parameters.allocate().unwrap();
        parameters
    }

    #[test]
    fn two_double_struct_takes_two_xmm_registers() {
        let parameters = allocated(vec![
            TypeEntry::new(TypeCode::Struct { fields: 2 }),
            TypeEntry::new(TypeCode::Float64),
            TypeEntry::new(TypeCode::Float64),
        ]);
        let parameter = parameters.at(0).unwrap();
        assert_eq!(parameter.classes(), Some(&[DataClass::Sse, DataClass::Sse][..]));
        assert_eq!(
            parameter.location,
            ParameterLocation::MultipleRegisters(
                [
                    ParameterRegister::Sse(Reg::Xmm0),
                    ParameterRegister::Sse(Reg::Xmm1)
                ]
                .into_iter()
                .collect()
            )
        );
        assert_eq!(parameters.requirements().sse_regs, 2);
    }

    #[test]
    fn single_double_field_is_one_sse_qword() {
        let parameters = classified(vec![
            TypeEntry::new(TypeCode::Struct { fields: 1 }),
            TypeEntry::new(TypeCode::Float64),
        ]);
        assert_eq!(
            parameters.at(0).unwrap().classes(),
            Some(&[DataClass::Sse][..])
        );
    }

    #[test]
    fn long_double_field_is_x87_pair() {
        let parameters = classified(vec![
            TypeEntry::new(TypeCode::Struct { fields: 1 }),
            TypeEntry::new(TypeCode::LongDouble),
        ]);
        assert_eq!(
            parameters.at(0).unwrap().classes(),
            Some(&[DataClass::X87, DataClass::X87Up][..])
        );
    }

    #[test]
    fn long_and_char_struct_is_two_integer_qwords() {
        let mut parameters = classified(vec![
            TypeEntry::new(TypeCode::Struct { fields: 2 }),
            TypeEntry::new(TypeCode::Long),
            TypeEntry::new(TypeCode::Char),
        ]);
        assert_eq!(
            parameters.at(0).unwrap().classes(),
            Some(&[DataClass::Integer, DataClass::Integer][..])
        );
        parameters.allocate().unwrap();
        assert_eq!(
            parameters.at(0).unwrap().location,
            ParameterLocation::MultipleRegisters(
                [
                    ParameterRegister::GeneralPurpose(Reg::Rdi),
                    ParameterRegister::GeneralPurpose(Reg::Rsi)
                ]
                .into_iter()
                .collect()
            )
        );
    }

    #[test]
    fn oversized_array_is_memory() {
        let parameters = allocated(vec![
            TypeEntry::new(TypeCode::Array { length: 18 }),
            TypeEntry::new(TypeCode::Int),
        ]);
        let parameter = parameters.at(0).unwrap();
        assert!(parameter.is_memory_class());
        assert_eq!(parameter.location, ParameterLocation::Memory { offset: 0 });
    }

    #[test]
    fn integer_parameters_exhaust_registers_then_stack() {
        let parameters = allocated(vec![TypeEntry::new(TypeCode::Int); 8]);
        let expected = [
            Reg::Rdi,
            Reg::Rsi,
            Reg::Rdx,
            Reg::Rcx,
            Reg::R8,
            Reg::R9,
        ];
        for (index, reg) in expected.iter().enumerate() {
            assert_eq!(
                parameters.at(index).unwrap().location,
                ParameterLocation::GeneralPurposeRegister(*reg)
            );
        }
        assert_eq!(
            parameters.at(6).unwrap().location,
            ParameterLocation::Memory { offset: 0 }
        );
        assert_eq!(
            parameters.at(7).unwrap().location,
            ParameterLocation::Memory { offset: 8 }
        );
        assert_eq!(parameters.requirements().stack, 16);
    }

    #[test]
    fn mixed_struct_splits_register_classes() {
        let parameters = allocated(vec![
            TypeEntry::new(TypeCode::Struct { fields: 2 }),
            TypeEntry::new(TypeCode::Long),
            TypeEntry::new(TypeCode::Float64),
        ]);
        assert_eq!(
            parameters.at(0).unwrap().location,
            ParameterLocation::MultipleRegisters(
                [
                    ParameterRegister::GeneralPurpose(Reg::Rdi),
                    ParameterRegister::Sse(Reg::Xmm0)
                ]
                .into_iter()
                .collect()
            )
        );
    }

    #[test]
    fn long_double_parameter_goes_to_stack() {
        let parameters = allocated(vec![TypeEntry::new(TypeCode::LongDouble)]);
        assert_eq!(
            parameters.at(0).unwrap().location,
            ParameterLocation::Memory { offset: 0 }
        );
    }

    #[test]
    fn unaligned_member_demotes_to_memory() {
        let parameters = classified(vec![
            TypeEntry::new(TypeCode::Struct { fields: 1 }),
            TypeEntry::aligned(TypeCode::Long, 4),
        ]);
        assert!(parameters.at(0).unwrap().is_memory_class());
    }

    #[test]
    fn union_merges_member_classes() {
        // union { double; long; } merges to Integer.
        let parameters = classified(vec![
            TypeEntry::new(TypeCode::Union { fields: 2 }),
            TypeEntry::new(TypeCode::Float64),
            TypeEntry::new(TypeCode::Long),
        ]);
        assert_eq!(
            parameters.at(0).unwrap().classes(),
            Some(&[DataClass::Integer][..])
        );
    }

    #[test]
    fn return_allocation_uses_result_registers() {
        let mut parameters = classified(vec![TypeEntry::new(TypeCode::Int)]);
        parameters.allocate_return().unwrap();
        assert_eq!(
            parameters.at(0).unwrap().location,
            ParameterLocation::GeneralPurposeRegister(Reg::Rax)
        );

        let mut parameters = classified(vec![
            TypeEntry::new(TypeCode::Struct { fields: 2 }),
            TypeEntry::new(TypeCode::Long),
            TypeEntry::new(TypeCode::Long),
        ]);
        parameters.allocate_return().unwrap();
        assert_eq!(
            parameters.at(0).unwrap().location,
            ParameterLocation::MultipleRegisters(
                [
                    ParameterRegister::GeneralPurpose(Reg::Rax),
                    ParameterRegister::GeneralPurpose(Reg::Rdx)
                ]
                .into_iter()
                .collect()
            )
        );

        let mut parameters = classified(vec![TypeEntry::new(TypeCode::LongDouble)]);
        parameters.allocate_return().unwrap();
        assert_eq!(parameters.at(0).unwrap().location, ParameterLocation::X87);

        let mut parameters = classified(vec![
            TypeEntry::new(TypeCode::Array { length: 18 }),
            TypeEntry::new(TypeCode::Int),
        ]);
        parameters.allocate_return().unwrap();
        assert_eq!(
            parameters.at(0).unwrap().location,
            ParameterLocation::Memory { offset: 0 }
        );
    }
}
