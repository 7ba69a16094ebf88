//! Argument-format compiler.
//!
//! An operator's argument format is a sequence of brace-delimited tokens, each
//! naming one declared position of the kernel's argument list:
//!
//! | Token | Slot |
//! |---|---|
//! | `{iN}` / `{oN}` | IR input/output `N` |
//! | `{iN*}` / `{oN*}` | every instance of IR input/output `N` |
//! | `{i*}` / `{o*}` | every instance of every IR input/output |
//! | `{i_instanceK}` / `{o_instanceK}` | `K`-th concrete instance |
//! | `{i_descN}` / `{o_descN}` | pointer to the shape block of IR `N` |
//! | `{ws*}` / `{wsN}` | all workspaces / workspace `N` |
//! | `{t}` | tiling data |
//! | `{tiling_context.tiling_key}` / `{tiling_context.block_dim}` | live tiling scalar |
//! | `{overflow_addr}` | overflow-detection address |
//! | `{ffts_addr}` | FFTS+ control address |
//! | `{hi.KINDN}` / `{hi.KIND*}` | hidden engine handle |
//! | `{event_addrN}` | device address of event `N` |
//! | `{#V}` | literal word |
//! | `{}` | null placeholder |
//!
//! Compilation is a pure function of the format text and the operator's IR
//! arity. Whitespace between tokens is ignored.

use std::fmt;

use snafu::ensure;

use crate::descriptor::{IrKind, OperatorDescriptor};
use crate::error::*;
use crate::instance::InstanceMap;

// ============================================================================
// SLOTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub const fn prefix(self) -> char {
        match self {
            Self::Input => 'i',
            Self::Output => 'o',
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Engine handle families reachable through `{hi.KIND…}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::VariantArray)]
#[strum(serialize_all = "lowercase")]
pub enum HiddenKind {
    /// Collective-communication context.
    Hcom,
    /// Tile framework control handle.
    Tilefwk,
}

/// Scalars read from the live tiling result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TilingScalar {
    TilingKey,
    BlockDim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// `{iN}`: the single instance of IR `ir`.
    Tensor { direction: Direction, ir: usize },
    /// `{iN*}`: every instance of IR `ir`.
    IrInstances { direction: Direction, ir: usize },
    /// `{i*}`: every instance of every IR position.
    AllTensors { direction: Direction },
    /// `{i_instanceK}`: one flattened instance.
    Instance { direction: Direction, instance: usize },
    /// `{i_descN}`: level-2 pointer to a shape block.
    ShapeDesc { direction: Direction, ir: usize },
    AllWorkspaces,
    Workspace(usize),
    Tiling,
    TilingScalar(TilingScalar),
    Overflow,
    FftsAddr,
    /// `index == None` selects every handle of `kind`.
    Hidden { kind: HiddenKind, index: Option<usize> },
    Event(usize),
    Literal(u64),
    Placeholder,
}

/// One declared position of the kernel argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArgumentSlot {
    pub kind: SlotKind,
    /// Part of a variable-length repetition (`*`).
    pub folded: bool,
}

impl ArgumentSlot {
    pub fn new(kind: SlotKind) -> Self {
        let folded = matches!(
            kind,
            SlotKind::IrInstances { .. }
                | SlotKind::AllTensors { .. }
                | SlotKind::AllWorkspaces
                | SlotKind::Hidden { index: None, .. }
        );
        Self { kind, folded }
    }
}

impl From<SlotKind> for ArgumentSlot {
    fn from(kind: SlotKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for ArgumentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SlotKind::Tensor { direction, ir } => write!(f, "{{{direction}{ir}}}"),
            SlotKind::IrInstances { direction, ir } => write!(f, "{{{direction}{ir}*}}"),
            SlotKind::AllTensors { direction } => write!(f, "{{{direction}*}}"),
            SlotKind::Instance { direction, instance } => write!(f, "{{{direction}_instance{instance}}}"),
            SlotKind::ShapeDesc { direction, ir } => write!(f, "{{{direction}_desc{ir}}}"),
            SlotKind::AllWorkspaces => f.write_str("{ws*}"),
            SlotKind::Workspace(index) => write!(f, "{{ws{index}}}"),
            SlotKind::Tiling => f.write_str("{t}"),
            SlotKind::TilingScalar(scalar) => write!(f, "{{tiling_context.{scalar}}}"),
            SlotKind::Overflow => f.write_str("{overflow_addr}"),
            SlotKind::FftsAddr => f.write_str("{ffts_addr}"),
            SlotKind::Hidden { kind, index: Some(index) } => write!(f, "{{hi.{kind}{index}}}"),
            SlotKind::Hidden { kind, index: None } => write!(f, "{{hi.{kind}*}}"),
            SlotKind::Event(index) => write!(f, "{{event_addr{index}}}"),
            SlotKind::Literal(value) => write!(f, "{{#{value}}}"),
            SlotKind::Placeholder => f.write_str("{}"),
        }
    }
}

// ============================================================================
// FORMAT
// ============================================================================

/// Ordered argument slots of one operator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArgumentFormat {
    slots: Vec<ArgumentSlot>,
}

/// A format validated against an operator, with its instance ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFormat {
    pub format: ArgumentFormat,
    pub inputs: InstanceMap,
    pub outputs: InstanceMap,
}

impl CompiledFormat {
    pub fn instances(&self, direction: Direction) -> &InstanceMap {
        match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }
}

impl FromIterator<ArgumentSlot> for ArgumentFormat {
    fn from_iter<I: IntoIterator<Item = ArgumentSlot>>(iter: I) -> Self {
        Self { slots: iter.into_iter().collect() }
    }
}

impl fmt::Display for ArgumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.slots.iter().try_for_each(|slot| write!(f, "{slot}"))
    }
}

impl ArgumentFormat {
    pub fn slots(&self) -> &[ArgumentSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, kind: SlotKind) -> bool {
        self.slots.iter().any(|slot| slot.kind == kind)
    }

    /// Parse format text without checking it against an operator.
    pub fn parse(text: &str) -> Result<Self> {
        let mut slots = Vec::new();
        let mut position = 0;

        while let Some(c) = text[position..].chars().next() {
            if c.is_whitespace() {
                position += c.len_utf8();
                continue;
            }
            ensure!(c == '{', FormatUnexpectedCharSnafu { found: c, position });

            let body_start = position + 1;
            let Some(close) = text[body_start..].find('}') else {
                return FormatUnterminatedSnafu { position }.fail();
            };
            slots.push(ArgumentSlot::new(parse_token(&text[body_start..body_start + close], position)?));
            position = body_start + close + 1;
        }

        Ok(Self { slots })
    }

    /// Default layout: all inputs, all outputs, all workspaces, then tiling
    /// data and the overflow address when the operator uses them.
    pub fn default_for(op: &OperatorDescriptor) -> Self {
        let mut slots = vec![
            ArgumentSlot::new(SlotKind::AllTensors { direction: Direction::Input }),
            ArgumentSlot::new(SlotKind::AllTensors { direction: Direction::Output }),
            ArgumentSlot::new(SlotKind::AllWorkspaces),
        ];
        if op.has_tiling() {
            slots.push(ArgumentSlot::new(SlotKind::Tiling));
        }
        if op.attrs.overflow_check {
            slots.push(ArgumentSlot::new(SlotKind::Overflow));
        }
        Self { slots }
    }

    /// Prefix the FFTS+ control address unless the format already has one.
    pub fn with_control_address(mut self) -> Self {
        if !self.contains(SlotKind::FftsAddr) {
            self.slots.insert(0, ArgumentSlot::new(SlotKind::FftsAddr));
        }
        self
    }

    /// Parse the operator's format text, or derive the default one, and
    /// validate it against the operator's IR.
    pub fn compile(op: &OperatorDescriptor) -> Result<CompiledFormat> {
        let format = match &op.args_format {
            Some(text) => Self::parse(text)?,
            None => Self::default_for(op),
        };
        format.check(op)
    }

    /// Validate against the operator's IR arity and instance counts.
    pub fn check(self, op: &OperatorDescriptor) -> Result<CompiledFormat> {
        let inputs = InstanceMap::from_ir(&op.inputs);
        let outputs = InstanceMap::from_ir(&op.outputs);

        let all_claimed = |direction: Direction| {
            self.slots.iter().filter(|slot| slot.kind == SlotKind::AllTensors { direction }).count()
        };
        let claimed = [all_claimed(Direction::Input), all_claimed(Direction::Output)];
        let claimed_by_all = |direction: Direction| claimed[direction as usize] > 0;

        for direction in [Direction::Input, Direction::Output] {
            ensure!(claimed[direction as usize] <= 1, FormatConflictSnafu { direction });
        }

        let mut seen_unique = Vec::new();
        for slot in &self.slots {
            match slot.kind {
                SlotKind::Tensor { direction, ir } => {
                    let ir_tensor = check_ir(op, direction, ir)?;
                    ensure!(ir_tensor.kind != IrKind::Dynamic, FormatDynamicDirectSnafu { direction, index: ir });
                    ensure!(!claimed_by_all(direction), FormatConflictSnafu { direction });
                }
                SlotKind::IrInstances { direction, ir } => {
                    check_ir(op, direction, ir)?;
                    ensure!(!claimed_by_all(direction), FormatConflictSnafu { direction });
                }
                SlotKind::Instance { direction, instance } => {
                    let count = match direction {
                        Direction::Input => inputs.total(),
                        Direction::Output => outputs.total(),
                    };
                    ensure!(instance < count, FormatInstanceOutOfRangeSnafu { direction, index: instance, count });
                    ensure!(!claimed_by_all(direction), FormatConflictSnafu { direction });
                }
                SlotKind::ShapeDesc { direction, ir } => {
                    check_ir(op, direction, ir)?;
                }
                SlotKind::Tiling | SlotKind::Overflow | SlotKind::FftsAddr => {
                    ensure!(!seen_unique.contains(&slot.kind), FormatDuplicateSnafu { token: slot.to_string() });
                    seen_unique.push(slot.kind);
                }
                SlotKind::AllTensors { .. }
                | SlotKind::AllWorkspaces
                | SlotKind::Workspace(_)
                | SlotKind::TilingScalar(_)
                | SlotKind::Hidden { .. }
                | SlotKind::Event(_)
                | SlotKind::Literal(_)
                | SlotKind::Placeholder => {}
            }
        }

        tracing::trace!(op.name = %op.name, format = %self, "argument format compiled");
        Ok(CompiledFormat { format: self, inputs, outputs })
    }
}

fn check_ir(op: &OperatorDescriptor, direction: Direction, ir: usize) -> Result<&crate::descriptor::IrTensor> {
    let irs = op.ir(direction);
    irs.get(ir).ok_or_else(|| FormatIndexOutOfRangeSnafu { direction, index: ir, arity: irs.len() }.build())
}

// ============================================================================
// TOKENS
// ============================================================================

fn parse_token(body: &str, position: usize) -> Result<SlotKind> {
    let unknown = || FormatUnknownTokenSnafu { token: body, position }.build();

    let kind = match body {
        "" => SlotKind::Placeholder,
        "t" => SlotKind::Tiling,
        "overflow_addr" => SlotKind::Overflow,
        "ffts_addr" => SlotKind::FftsAddr,
        "ws*" => SlotKind::AllWorkspaces,
        _ => {
            if let Some(scalar) = body.strip_prefix("tiling_context.") {
                SlotKind::TilingScalar(scalar.parse().map_err(|_| unknown())?)
            } else if let Some(literal) = body.strip_prefix('#') {
                SlotKind::Literal(parse_literal(literal).ok_or_else(unknown)?)
            } else if let Some(hidden) = body.strip_prefix("hi.") {
                parse_hidden(hidden).ok_or_else(unknown)?
            } else if let Some(index) = body.strip_prefix("event_addr") {
                SlotKind::Event(parse_index(index).ok_or_else(unknown)?)
            } else if let Some(index) = body.strip_prefix("ws") {
                SlotKind::Workspace(parse_index(index).ok_or_else(unknown)?)
            } else if let Some(rest) = body.strip_prefix('i') {
                parse_tensor(Direction::Input, rest).ok_or_else(unknown)?
            } else if let Some(rest) = body.strip_prefix('o') {
                parse_tensor(Direction::Output, rest).ok_or_else(unknown)?
            } else {
                return Err(unknown());
            }
        }
    };
    Ok(kind)
}

fn parse_tensor(direction: Direction, rest: &str) -> Option<SlotKind> {
    if rest == "*" {
        return Some(SlotKind::AllTensors { direction });
    }
    if let Some(instance) = rest.strip_prefix("_instance") {
        return Some(SlotKind::Instance { direction, instance: parse_index(instance)? });
    }
    if let Some(ir) = rest.strip_prefix("_desc") {
        return Some(SlotKind::ShapeDesc { direction, ir: parse_index(ir)? });
    }
    if let Some(ir) = rest.strip_suffix('*') {
        return Some(SlotKind::IrInstances { direction, ir: parse_index(ir)? });
    }
    Some(SlotKind::Tensor { direction, ir: parse_index(rest)? })
}

fn parse_hidden(rest: &str) -> Option<SlotKind> {
    let split = rest.find(|c: char| c.is_ascii_digit() || c == '*')?;
    let kind = rest[..split].parse().ok()?;
    let index = match &rest[split..] {
        "*" => None,
        digits => Some(parse_index(digits)?),
    };
    Some(SlotKind::Hidden { kind, index })
}

fn parse_index(text: &str) -> Option<usize> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn parse_literal(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) if !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()) => u64::from_str_radix(hex, 16).ok(),
        Some(_) => None,
        None if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) => text.parse().ok(),
        None => None,
    }
}
