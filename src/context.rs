//! Execution contexts.
//!
//! A [`Context`] is the ownership scope every other resource attaches to:
//! it binds one platform and the subset of its devices matching a
//! [`DeviceKind`] selector, fixed at creation time.

use crate::driver::{DeviceId, DeviceKind, PlatformId, RawContext};
use crate::error::{Error, Result};
use crate::registry::{Registry, Shared};
use std::sync::Arc;
use tracing::{debug, warn};

/// Owning handle to a platform-scoped execution environment. Move-only;
/// released exactly once, on [`release`](Context::release) or drop.
#[derive(Debug)]
pub struct Context {
    shared: Arc<Shared>,
    raw: Option<RawContext>,
    platform: PlatformId,
}

impl Context {
    /// Create a context on `platform` covering every device matching
    /// `selector`. The bound device set is decided by the driver at
    /// creation and can be inspected with [`devices`](Context::devices).
    pub fn create(registry: &Registry, platform: PlatformId, selector: DeviceKind) -> Result<Self> {
        let shared = Arc::clone(registry.shared());
        let raw = shared.guard(shared.driver.create_context(platform, selector))?;
        debug!(?platform, ?selector, "context created");
        Ok(Self { shared, raw: Some(raw), platform })
    }

    /// Look up the first platform owning a device of `kind` and create a
    /// context on it covering all of that platform's devices.
    ///
    /// Absence of a matching platform is a discovery condition: the error
    /// is always returned, never routed through the abort policy.
    pub fn create_specific(registry: &Registry, kind: DeviceKind) -> Result<Self> {
        let platform = registry
            .platform_with_kind(kind)
            .ok_or(Error::NoMatchingDevice(kind))?;
        Self::create(registry, platform, DeviceKind::All)
    }

    /// The platform this context is bound to.
    pub fn platform(&self) -> PlatformId {
        self.platform
    }

    /// The device set bound at creation.
    pub fn devices(&self) -> Result<Vec<DeviceId>> {
        let raw = self.shared.guard(self.raw())?;
        self.shared.guard(self.shared.driver.context_devices(raw))
    }

    /// Release the underlying context. Safe to call more than once; only
    /// the first call reaches the driver.
    pub fn release(&mut self) {
        if let Some(raw) = self.raw.take() {
            if let Err(e) = self.shared.driver.release_context(raw) {
                warn!(error = %e, "context release failed");
            }
        }
    }

    pub(crate) fn raw(&self) -> Result<RawContext> {
        self.raw.ok_or(Error::Released("context"))
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.release();
    }
}
