use test_case::test_case;

use crate::args_format::{ArgumentFormat, Direction, HiddenKind, SlotKind, TilingScalar};
use crate::descriptor::{IrTensor, OpAttrs, OperatorDescriptor};
use crate::error::Error;
use crate::test::helpers::{ai_core, f32_tensor};

fn op_with(inputs: Vec<IrTensor>, outputs: usize, format: Option<&str>) -> OperatorDescriptor {
    OperatorDescriptor::builder()
        .name("fmt")
        .op_type("Fmt")
        .kernel(ai_core())
        .inputs(inputs)
        .outputs((0..outputs).map(|_| IrTensor::required(f32_tensor(&[2]))).collect())
        .maybe_args_format(format.map(str::to_string))
        .build()
}

fn kinds(text: &str) -> Vec<SlotKind> {
    ArgumentFormat::parse(text).unwrap().slots().iter().map(|slot| slot.kind).collect()
}

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn test_parse_tensor_tokens() {
    assert_eq!(
        kinds("{i0}{i1*}{o*}{i_instance3}{o_desc0}"),
        vec![
            SlotKind::Tensor { direction: Direction::Input, ir: 0 },
            SlotKind::IrInstances { direction: Direction::Input, ir: 1 },
            SlotKind::AllTensors { direction: Direction::Output },
            SlotKind::Instance { direction: Direction::Input, instance: 3 },
            SlotKind::ShapeDesc { direction: Direction::Output, ir: 0 },
        ]
    );
}

#[test]
fn test_parse_special_tokens() {
    assert_eq!(
        kinds("{ws*} {ws2}\n{t}{tiling_context.tiling_key}{tiling_context.block_dim}{overflow_addr}{ffts_addr}{}"),
        vec![
            SlotKind::AllWorkspaces,
            SlotKind::Workspace(2),
            SlotKind::Tiling,
            SlotKind::TilingScalar(TilingScalar::TilingKey),
            SlotKind::TilingScalar(TilingScalar::BlockDim),
            SlotKind::Overflow,
            SlotKind::FftsAddr,
            SlotKind::Placeholder,
        ]
    );
}

#[test_case("{#42}", SlotKind::Literal(42); "decimal_literal")]
#[test_case("{#0x1F}", SlotKind::Literal(31); "hex_literal")]
#[test_case("{hi.hcom1}", SlotKind::Hidden { kind: HiddenKind::Hcom, index: Some(1) }; "hidden_indexed")]
#[test_case("{hi.tilefwk*}", SlotKind::Hidden { kind: HiddenKind::Tilefwk, index: None }; "hidden_all")]
#[test_case("{event_addr7}", SlotKind::Event(7); "event")]
fn test_parse_single(text: &str, expected: SlotKind) {
    assert_eq!(kinds(text), vec![expected]);
}

#[test]
fn test_repetition_marks_folded() {
    let format = ArgumentFormat::parse("{i0}{i0*}{i*}{ws*}{ws0}{hi.hcom*}{hi.hcom0}").unwrap();
    let folded: Vec<bool> = format.slots().iter().map(|slot| slot.folded).collect();
    assert_eq!(folded, vec![false, true, true, true, false, true, false]);
}

#[test]
fn test_display_reproduces_text() {
    let text = "{i0}{i1*}{o_instance0}{i_desc1}{ws*}{t}{tiling_context.block_dim}{hi.hcom*}{#5}{}";
    assert_eq!(ArgumentFormat::parse(text).unwrap().to_string(), text);
}

#[test]
fn test_parse_unterminated() {
    assert!(matches!(ArgumentFormat::parse("{i0}{o0"), Err(Error::FormatUnterminated { position: 4 })));
}

#[test]
fn test_parse_unexpected_char() {
    assert!(matches!(
        ArgumentFormat::parse("{i0},{o0}"),
        Err(Error::FormatUnexpectedChar { found: ',', position: 4 })
    ));
}

#[test_case("{foo}"; "unknown_word")]
#[test_case("{ix}"; "bad_input_index")]
#[test_case("{#0x}"; "empty_hex")]
#[test_case("{#-1}"; "negative_literal")]
#[test_case("{hi.bogus0}"; "unknown_hidden_kind")]
#[test_case("{tiling_context.foo}"; "unknown_tiling_scalar")]
#[test_case("{ws}"; "workspace_without_index")]
fn test_parse_unknown_token(text: &str) {
    assert!(matches!(ArgumentFormat::parse(text), Err(Error::FormatUnknownToken { position: 0, .. })));
}

#[test]
fn test_parse_empty_text() {
    assert!(ArgumentFormat::parse("  ").unwrap().is_empty());
}

// =============================================================================
// Checking against an operator
// =============================================================================

#[test]
fn test_default_format() {
    let mut op = op_with(vec![IrTensor::required(f32_tensor(&[2]))], 1, None);
    assert_eq!(ArgumentFormat::default_for(&op).to_string(), "{i*}{o*}{ws*}");

    op.attrs = OpAttrs { max_tiling_size: 32, overflow_check: true, ..Default::default() };
    assert_eq!(ArgumentFormat::default_for(&op).to_string(), "{i*}{o*}{ws*}{t}{overflow_addr}");
}

#[test]
fn test_control_address_prefixed_once() {
    let format = ArgumentFormat::parse("{i0}{o0}").unwrap().with_control_address();
    assert_eq!(format.to_string(), "{ffts_addr}{i0}{o0}");
    assert_eq!(format.with_control_address().to_string(), "{ffts_addr}{i0}{o0}");

    let format = ArgumentFormat::parse("{i0}{ffts_addr}").unwrap().with_control_address();
    assert_eq!(format.to_string(), "{i0}{ffts_addr}");
}

#[test]
fn test_compile_records_instance_ranges() {
    let inputs = vec![
        IrTensor::required(f32_tensor(&[2])),
        IrTensor::optional(None),
        IrTensor::dynamic([f32_tensor(&[1]), f32_tensor(&[2]), f32_tensor(&[3])]),
    ];
    let op = op_with(inputs, 1, Some("{i0}{i1}{i2*}{o0}"));
    let compiled = ArgumentFormat::compile(&op).unwrap();

    assert_eq!(compiled.format.len(), 4);
    assert_eq!(compiled.inputs.arity(), 3);
    assert_eq!(compiled.inputs.total(), 4);
    assert_eq!(compiled.inputs.range(2).map(|range| range.start), Some(1));
    assert_eq!(compiled.instances(Direction::Output).total(), 1);
}

#[test]
fn test_check_index_out_of_range() {
    let op = op_with(vec![IrTensor::required(f32_tensor(&[2]))], 1, Some("{i1}{o0}"));
    assert!(matches!(
        ArgumentFormat::compile(&op),
        Err(Error::FormatIndexOutOfRange { direction: Direction::Input, index: 1, arity: 1 })
    ));
}

#[test]
fn test_check_dynamic_needs_star() {
    let op = op_with(vec![IrTensor::dynamic([f32_tensor(&[2])])], 1, Some("{i0}{o0}"));
    assert!(matches!(ArgumentFormat::compile(&op), Err(Error::FormatDynamicDirect { index: 0, .. })));
}

#[test_case("{t}{i0}{t}"; "tiling")]
#[test_case("{overflow_addr}{overflow_addr}"; "overflow")]
#[test_case("{ffts_addr}{i0}{ffts_addr}"; "control")]
fn test_check_duplicates(text: &str) {
    let mut op = op_with(vec![IrTensor::required(f32_tensor(&[2]))], 1, Some(text));
    op.attrs.max_tiling_size = 8;
    assert!(matches!(ArgumentFormat::compile(&op), Err(Error::FormatDuplicate { .. })));
}

#[test_case("{i*}{i0}"; "all_then_direct")]
#[test_case("{i0*}{i*}"; "ir_then_all")]
#[test_case("{i*}{i_instance0}"; "all_then_instance")]
#[test_case("{i*}{i*}"; "all_twice")]
fn test_check_conflicting_claims(text: &str) {
    let op = op_with(vec![IrTensor::required(f32_tensor(&[2]))], 1, Some(text));
    assert!(matches!(
        ArgumentFormat::compile(&op),
        Err(Error::FormatConflict { direction: Direction::Input })
    ));
}

#[test]
fn test_check_descriptor_alongside_all() {
    let op = op_with(vec![IrTensor::dynamic([f32_tensor(&[2]), f32_tensor(&[3])])], 1, Some("{i*}{i_desc0}{o*}"));
    assert!(ArgumentFormat::compile(&op).is_ok());
}

#[test]
fn test_check_instance_out_of_range() {
    let op = op_with(vec![IrTensor::dynamic([f32_tensor(&[2]), f32_tensor(&[3])])], 1, Some("{i_instance2}"));
    assert!(matches!(
        ArgumentFormat::compile(&op),
        Err(Error::FormatInstanceOutOfRange { index: 2, count: 2, .. })
    ));
}

#[test]
fn test_compile_is_pure() {
    let op = op_with(vec![IrTensor::dynamic([f32_tensor(&[2]), f32_tensor(&[3])])], 2, Some("{i0*}{o1}{o0}{ws*}"));
    assert_eq!(ArgumentFormat::compile(&op).unwrap(), ArgumentFormat::compile(&op).unwrap());
}
