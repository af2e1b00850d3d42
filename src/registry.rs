//! Platform and device discovery.
//!
//! A [`Registry`] is a process-scoped snapshot of the platform→device map,
//! taken once at construction. Hardware or driver changes are only observed
//! by constructing a new `Registry`.

use crate::config::Config;
use crate::diag::Diagnostics;
use crate::driver::host::HostDriver;
use crate::driver::{DeviceId, DeviceKind, Driver, PlatformId};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Driver handle plus diagnostic state, threaded through every owning
/// wrapper created under one registry.
#[derive(Debug, Clone)]
pub(crate) struct Shared {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) diag: Diagnostics,
}

impl Shared {
    /// Route a fallible driver call through the failure policy.
    pub(crate) fn guard<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.diag.handle(e))
    }
}

/// Snapshot of every platform and its ordered device list.
#[derive(Debug)]
pub struct Registry {
    shared: Arc<Shared>,
    snapshot: Vec<(PlatformId, Vec<DeviceId>)>,
}

impl Registry {
    /// Registry over the built-in host driver with default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Registry over a specific driver with default configuration.
    pub fn with_driver(driver: Arc<dyn Driver>) -> Result<Self> {
        Self::builder().driver(driver).build()
    }

    /// Start building a registry with explicit driver or configuration.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Read-only view of the snapshot: each platform with its devices, in
    /// enumeration order.
    pub fn devices(&self) -> &[(PlatformId, Vec<DeviceId>)] {
        &self.snapshot
    }

    /// Total number of devices across all platforms.
    pub fn device_count(&self) -> usize {
        self.snapshot.iter().map(|(_, d)| d.len()).sum()
    }

    /// Classification of one device.
    pub fn device_kind(&self, device: DeviceId) -> Result<DeviceKind> {
        self.shared.guard(self.shared.driver.device_kind(device))
    }

    /// Whether `device` is GPU-class.
    pub fn is_gpu(&self, device: DeviceId) -> Result<bool> {
        Ok(self.device_kind(device)? == DeviceKind::Gpu)
    }

    /// Whether `device` is CPU-class.
    pub fn is_cpu(&self, device: DeviceId) -> Result<bool> {
        Ok(self.device_kind(device)? == DeviceKind::Cpu)
    }

    /// Platform owning the first device matching `kind`, scanning platforms
    /// and their device lists in snapshot order. The first match wins.
    ///
    /// `None` is the sentinel for "nothing matched"; callers must check.
    pub fn platform_with_kind(&self, kind: DeviceKind) -> Option<PlatformId> {
        for (platform, devices) in &self.snapshot {
            for device in devices {
                match self.shared.driver.device_kind(*device) {
                    Ok(k) if kind.matches(k) => return Some(*platform),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "device kind query failed during scan");
                    }
                }
            }
        }
        None
    }

    /// Human-readable platform name.
    pub fn platform_name(&self, platform: PlatformId) -> Result<String> {
        self.shared.guard(self.shared.driver.platform_name(platform))
    }

    /// Human-readable device name.
    pub fn device_name(&self, device: DeviceId) -> Result<String> {
        self.shared.guard(self.shared.driver.device_name(device))
    }

    /// Device vendor string.
    pub fn device_vendor(&self, device: DeviceId) -> Result<String> {
        self.shared.guard(self.shared.driver.device_vendor(device))
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

/// Builder for [`Registry`].
#[derive(Debug)]
pub struct RegistryBuilder {
    driver: Option<Arc<dyn Driver>>,
    config: Config,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Builder with the default driver and configuration.
    pub fn new() -> Self {
        Self { driver: None, config: Config::default() }
    }

    /// Drive a specific platform implementation instead of the built-in
    /// host driver.
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Replace the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Take the discovery snapshot and build the registry.
    pub fn build(self) -> Result<Registry> {
        self.config.validate()?;
        let driver: Arc<dyn Driver> =
            self.driver.unwrap_or_else(|| Arc::new(HostDriver::new()));
        let diag = Diagnostics {
            sink: self.config.sink,
            policy: self.config.failure_policy,
            build_log_limit: self.config.build_log_limit,
        };
        let shared = Arc::new(Shared { driver, diag });

        let platforms = shared
            .driver
            .platforms()
            .map_err(|e| Error::discovery(format!("platform enumeration failed: {e}")))?;

        let mut snapshot = Vec::with_capacity(platforms.len());
        for platform in platforms {
            let devices = shared
                .driver
                .devices(platform)
                .map_err(|e| Error::discovery(format!("device enumeration failed: {e}")))?;
            for device in &devices {
                match shared.driver.device_kind(*device) {
                    Ok(DeviceKind::Gpu) => debug!(?device, "GPU found"),
                    Ok(DeviceKind::Cpu) => debug!(?device, "CPU found"),
                    Ok(kind) => debug!(?device, ?kind, "device found"),
                    Err(e) => warn!(?device, error = %e, "device kind query failed"),
                }
            }
            snapshot.push((platform, devices));
        }
        debug!(
            platforms = snapshot.len(),
            devices = snapshot.iter().map(|(_, d)| d.len()).sum::<usize>(),
            "discovery snapshot taken"
        );

        Ok(Registry { shared, snapshot })
    }
}
