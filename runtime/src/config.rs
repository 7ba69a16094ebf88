//! Runtime configuration.
//!
//! Provides typed configuration with bon builders and environment variable
//! fallbacks.

use bon::bon;

// ============================================================================
// RUNTIME CONFIGURATION
// ============================================================================

/// Knobs of the argument assembler and dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Emitted slot count above which arguments switch to folded addressing.
    ///
    /// A count equal to the threshold stays unfolded.
    pub fold_slot_threshold: usize,
    /// Upper bound on the total argument buffer size.
    pub max_args_bytes: usize,
    /// Upper bound on the host-resident scalar region.
    pub max_host_input_bytes: usize,
    /// Append the live tiling length to the tiling region for memory-check
    /// tooling.
    pub mem_check: bool,
    /// Synchronize the stream after every launch.
    pub sync_after_launch: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[bon]
impl RuntimeConfig {
    #[builder]
    pub fn new(
        #[builder(default = 64)] fold_slot_threshold: usize,
        #[builder(default = 65536)] max_args_bytes: usize,
        #[builder(default = 1024)] max_host_input_bytes: usize,
        #[builder(default = false)] mem_check: bool,
        #[builder(default = false)] sync_after_launch: bool,
    ) -> Self {
        Self { fold_slot_threshold, max_args_bytes, max_host_input_bytes, mem_check, sync_after_launch }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `TESSEL_FOLD_SLOT_THRESHOLD` - Fold threshold (default: 64)
    /// * `TESSEL_MAX_ARGS_BYTES` - Argument buffer limit (default: 65536)
    /// * `TESSEL_MAX_HOST_INPUT_BYTES` - Host scalar region limit (default: 1024)
    /// * `TESSEL_MEM_CHECK` - Enable memory-check padding if set
    /// * `TESSEL_SYNC_LAUNCH` - Synchronize after each launch if set
    pub fn from_env() -> Self {
        let fold_slot_threshold =
            std::env::var("TESSEL_FOLD_SLOT_THRESHOLD").ok().and_then(|s| s.parse().ok()).unwrap_or(64);
        let max_args_bytes = std::env::var("TESSEL_MAX_ARGS_BYTES").ok().and_then(|s| s.parse().ok()).unwrap_or(65536);
        let max_host_input_bytes =
            std::env::var("TESSEL_MAX_HOST_INPUT_BYTES").ok().and_then(|s| s.parse().ok()).unwrap_or(1024);
        let mem_check = std::env::var("TESSEL_MEM_CHECK").is_ok();
        let sync_after_launch = std::env::var("TESSEL_SYNC_LAUNCH").is_ok();

        Self { fold_slot_threshold, max_args_bytes, max_host_input_bytes, mem_check, sync_after_launch }
    }
}

// ============================================================================
// PLATFORM
// ============================================================================

/// Target chip description handed to the tiling service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub soc_version: String,
    pub aicore_count: u32,
    pub vector_core_count: u32,
    pub aicpu_count: u32,
    /// Unified buffer bytes per AI core.
    pub ub_size: usize,
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[bon]
impl PlatformInfo {
    #[builder]
    pub fn new(
        #[builder(into, default = String::from("sim"))] soc_version: String,
        #[builder(default = 24)] aicore_count: u32,
        #[builder(default = 48)] vector_core_count: u32,
        #[builder(default = 6)] aicpu_count: u32,
        #[builder(default = 196_608)] ub_size: usize,
    ) -> Self {
        Self { soc_version, aicore_count, vector_core_count, aicpu_count, ub_size }
    }
}
