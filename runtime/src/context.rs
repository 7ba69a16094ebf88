//! Runtime context shared by every task built against one device.

use std::sync::Arc;

use bon::bon;
use tessel_device::Driver;

use crate::addresses::{HiddenInputResolver, NoHiddenInputs};
use crate::config::{PlatformInfo, RuntimeConfig};
use crate::dump::{DiagnosticsSink, NullSink};
use crate::kernel_cache::{KernelBinarySource, KernelHandleCache};
use crate::tiling::{TilingInjector, TilingService};

/// Driver, configuration and external collaborators of the dispatch engine.
///
/// Cheap to share: tasks hold an `Arc<RuntimeContext>`.
pub struct RuntimeContext {
    pub driver: Arc<dyn Driver>,
    pub config: RuntimeConfig,
    pub platform: PlatformInfo,
    pub kernels: KernelHandleCache,
    pub binaries: Arc<dyn KernelBinarySource>,
    pub tiling: Arc<dyn TilingService>,
    pub hidden: Arc<dyn HiddenInputResolver>,
    pub diagnostics: Arc<dyn DiagnosticsSink>,
}

#[bon]
impl RuntimeContext {
    #[builder]
    pub fn new(
        driver: Arc<dyn Driver>,
        binaries: Arc<dyn KernelBinarySource>,
        tiling: Arc<dyn TilingService>,
        #[builder(default)] config: RuntimeConfig,
        #[builder(default)] platform: PlatformInfo,
        hidden: Option<Arc<dyn HiddenInputResolver>>,
        diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    ) -> Self {
        Self {
            driver,
            config,
            platform,
            kernels: KernelHandleCache::new(),
            binaries,
            tiling,
            hidden: hidden.unwrap_or_else(|| Arc::new(NoHiddenInputs)),
            diagnostics: diagnostics.unwrap_or_else(|| Arc::new(NullSink)),
        }
    }

    pub fn tiling_injector(&self) -> TilingInjector<'_> {
        TilingInjector::new(self.tiling.as_ref(), &self.platform, self.config.mem_check)
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("driver", &self.driver)
            .field("config", &self.config)
            .field("platform", &self.platform)
            .field("kernels", &self.kernels)
            .finish_non_exhaustive()
    }
}
