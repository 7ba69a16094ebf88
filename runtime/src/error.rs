//! Error types for task construction and dispatch.

use snafu::Snafu;

use crate::args_format::Direction;
use crate::task::TaskState;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type returned by external collaborators (tiling service, hidden
/// handle callbacks).
pub type ServiceError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while building or dispatching a task.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    // ========================================================================
    // Argument format
    // ========================================================================
    /// Brace token the parser does not recognise.
    #[snafu(display("unknown argument token '{{{token}}}' at byte {position}"))]
    FormatUnknownToken { token: String, position: usize },

    /// Opening brace without a closing one.
    #[snafu(display("unterminated '{{' at byte {position}"))]
    FormatUnterminated { position: usize },

    /// Text outside a brace token.
    #[snafu(display("unexpected character '{found}' at byte {position}, expected '{{'"))]
    FormatUnexpectedChar { found: char, position: usize },

    /// Direct IR index past the operator's arity.
    #[snafu(display("{direction} index {index} out of range for arity {arity}"))]
    FormatIndexOutOfRange { direction: Direction, index: usize, arity: usize },

    /// Dynamic IR tensor addressed by a direct index.
    #[snafu(display("{direction}{index} is dynamic and can only be addressed with '*'"))]
    FormatDynamicDirect { direction: Direction, index: usize },

    /// Token that may appear only once, repeated.
    #[snafu(display("duplicate '{{{token}}}' in argument format"))]
    FormatDuplicate { token: String },

    /// Direct or instance token for a direction already taken by a wildcard.
    #[snafu(display("{direction} tensors are already claimed by '{{{direction}*}}'"))]
    FormatConflict { direction: Direction },

    /// Instance index past the flattened instance count.
    #[snafu(display("{direction} instance {index} out of range for {count} instances"))]
    FormatInstanceOutOfRange { direction: Direction, index: usize, count: usize },

    // ========================================================================
    // Address resolution
    // ========================================================================
    /// Instance with no binding in the task addresses.
    #[snafu(display("{direction} instance {index} has no bound address"))]
    ResolveMissingTensor { direction: Direction, index: usize },

    /// Required instance bound to a null pointer.
    #[snafu(display("required {direction} instance {index} is bound to a null address"))]
    ResolveNullTensor { direction: Direction, index: usize },

    /// Workspace, event or other indexed binding that does not exist.
    #[snafu(display("{what} index {index} out of range ({len} available)"))]
    ResolveIndexOutOfRange { what: &'static str, index: usize, len: usize },

    /// Binding count disagrees with the operator's instance count.
    #[snafu(display("{direction} bindings: expected {expected} instances, got {actual}"))]
    ResolveInstanceRange { direction: Direction, expected: usize, actual: usize },

    /// Hidden input callback returned no handle for the index.
    #[snafu(display("no '{kind}' handle at index {index}"))]
    ResolveMissingHandle { kind: String, index: usize },

    /// Hidden input callback failed.
    #[snafu(display("hidden input callback failed for '{kind}'"))]
    ResolveHiddenInput { kind: String, source: ServiceError },

    /// Host-resident input bound or sized incorrectly.
    #[snafu(display("input instance {index}: {reason}"))]
    ResolveHostInput { index: usize, reason: String },

    /// Tiling token on an operator without tiling.
    #[snafu(display("operator '{op}' has no tiling data for '{{{token}}}'"))]
    ResolveMissingTiling { op: String, token: String },

    // ========================================================================
    // Capacity
    // ========================================================================
    /// Size or offset arithmetic overflowed.
    #[snafu(display("arithmetic overflow computing {what}"))]
    CapacityOverflow { what: &'static str },

    /// Buffer or host input larger than the configured limit.
    #[snafu(display("{what} of {size} bytes exceeds limit of {limit} bytes"))]
    CapacityExceeded { what: &'static str, size: usize, limit: usize },

    /// Write past the end of the argument arena.
    #[snafu(display("write of {len} bytes at offset {offset} exceeds argument buffer of {capacity} bytes"))]
    CapacityOutOfBounds { offset: usize, len: usize, capacity: usize },

    // ========================================================================
    // Tiling
    // ========================================================================
    /// Tiling service returned an error.
    #[snafu(display("tiling failed for operator '{op}'"))]
    TilingFailed { op: String, source: ServiceError },

    /// Tiling payload larger than the operator's declared maximum.
    #[snafu(display("tiling data of operator '{op}' is {size} bytes, declared maximum is {max}"))]
    TilingTooLarge { op: String, size: usize, max: usize },

    // ========================================================================
    // Kernels and device
    // ========================================================================
    /// No binary for the kernel key.
    #[snafu(display("no kernel binary registered under '{key}'"))]
    KernelNotFound { key: String },

    /// Atomic clear requested without a clear kernel.
    #[snafu(display("operator '{op}' needs atomic clear but declares no clear kernel"))]
    MissingAtomicKernel { op: String },

    /// Kernel variant not allowed in this launch context.
    #[snafu(display("operator '{op}' cannot run as {context}"))]
    UnsupportedKernel { op: String, context: &'static str },

    /// Driver call failed.
    #[snafu(display("device error: {source}"))]
    Device { source: tessel_device::Error },

    // ========================================================================
    // Task state machine
    // ========================================================================
    /// Task operation out of order.
    #[snafu(display("invalid task transition {from} -> {to}"))]
    InvalidTransition { from: TaskState, to: TaskState },

    /// Task already failed; no further operations.
    #[snafu(display("task for operator '{op}' has failed"))]
    TaskFailed { op: String },
}
