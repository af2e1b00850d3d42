//! Kernel program compilation.
//!
//! A [`Program`] is built synchronously from source text or a source file.
//! There is no partial-success state: either the build succeeds for the
//! whole device set of its context, or the per-device build logs are dumped
//! to the diagnostic sink and the failure is routed through the failure
//! policy.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::registry::Shared;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Owning handle to a built kernel program. Move-only; released exactly
/// once, on [`release`](Program::release) or drop.
#[derive(Debug)]
pub struct Program {
    shared: Arc<Shared>,
    raw: Option<crate::driver::RawProgram>,
}

impl Program {
    /// Build a program from in-memory source text.
    pub fn from_source(context: &Context, source: &str, options: Option<&str>) -> Result<Self> {
        Self::build(context, source, options)
    }

    /// Slurp `path` in full and build a program from its contents.
    ///
    /// A missing or unreadable file indicates a deployment problem, so the
    /// error is routed through the failure policy (fatal under the default
    /// `Abort` policy) after a diagnostic naming the file.
    pub fn from_file<P: AsRef<Path>>(context: &Context, path: P, options: Option<&str>) -> Result<Self> {
        let shared = context.shared();
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                shared
                    .diag
                    .emit(&format!("cannot open kernel source file '{}': {e}", path.display()));
                return Err(shared.diag.handle(Error::Io(e)));
            }
        };
        let source = match String::from_utf8(bytes) {
            Ok(source) => source,
            Err(e) => {
                return Err(shared.diag.handle(Error::source(format!(
                    "kernel source '{}' is not valid UTF-8: {e}",
                    path.display()
                ))));
            }
        };
        Self::build(context, &source, options)
    }

    fn build(context: &Context, source: &str, options: Option<&str>) -> Result<Self> {
        let shared = Arc::clone(context.shared());
        let ctx = shared.guard(context.raw())?;

        let raw = shared.guard(shared.driver.create_program(ctx, source))?;
        match shared.driver.build_program(raw, options) {
            Ok(()) => {
                debug!(bytes = source.len(), "program built");
                Ok(Self { shared, raw: Some(raw) })
            }
            Err(_) => {
                // Dump every attached device's build log before failing.
                let devices = shared.driver.context_devices(ctx).unwrap_or_default();
                for device in devices {
                    let log = shared.driver.build_log(raw, device).unwrap_or_default();
                    let name = shared
                        .driver
                        .device_name(device)
                        .unwrap_or_else(|_| "unknown device".to_string());
                    error!(device = %name, "kernel program build failed");
                    shared.diag.emit("build error");
                    shared.diag.emit(&format!("device '{name}' build log:"));
                    shared.diag.emit(truncated(&log, shared.diag.build_log_limit));
                }
                if let Err(e) = shared.driver.release_program(raw) {
                    warn!(error = %e, "program release failed after build failure");
                }
                Err(shared.diag.handle(Error::BuildFailed))
            }
        }
    }

    /// Release the underlying program. Safe to call more than once; only
    /// the first call reaches the driver.
    pub fn release(&mut self) {
        if let Some(raw) = self.raw.take() {
            if let Err(e) = self.shared.driver.release_program(raw) {
                warn!(error = %e, "program release failed");
            }
        }
    }

    pub(crate) fn raw(&self) -> Result<crate::driver::RawProgram> {
        self.raw.ok_or(Error::Released("program"))
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        self.release();
    }
}

/// Clamp a build log to `limit` bytes on a character boundary.
fn truncated(log: &str, limit: usize) -> &str {
    if log.len() <= limit {
        return log;
    }
    let mut end = limit;
    while !log.is_char_boundary(end) {
        end -= 1;
    }
    &log[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::diag::{CaptureSink, FailurePolicy};
    use crate::driver::host::HostDriver;
    use crate::driver::{DeviceKind, ObjectKind};
    use crate::registry::Registry;
    use std::io::Write;

    const GOOD_SOURCE: &str =
        "__kernel void x2(__global const uint *in, __global uint *out, uint width) {}";

    fn fixture() -> (Arc<HostDriver>, Arc<CaptureSink>, Registry) {
        let driver = Arc::new(HostDriver::new());
        let sink = Arc::new(CaptureSink::new());
        let config = Config::builder()
            .failure_policy(FailurePolicy::Propagate)
            .shared_sink(sink.clone())
            .build()
            .unwrap();
        let registry = Registry::builder()
            .driver(driver.clone())
            .config(config)
            .build()
            .unwrap();
        (driver, sink, registry)
    }

    #[test]
    fn builds_from_source() {
        let (_, _, registry) = fixture();
        let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();
        let program = Program::from_source(&ctx, GOOD_SOURCE, None).unwrap();
        drop(program);
    }

    #[test]
    fn build_failure_dumps_log_per_device_and_releases_program() {
        let (driver, sink, registry) = fixture();
        let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();

        let err = Program::from_source(&ctx, "this is not a kernel module", None).unwrap_err();
        assert!(matches!(err, Error::BuildFailed));

        let lines = sink.lines();
        assert!(lines.iter().any(|l| l == "build error"));
        assert!(lines.iter().any(|l| l.contains("no __kernel entry points")));

        // No half-built program may linger.
        assert_eq!(driver.live(ObjectKind::Program), 0);
        assert_eq!(driver.releases(ObjectKind::Program), 1);
    }

    #[test]
    fn builds_from_file() {
        let (_, _, registry) = fixture();
        let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(GOOD_SOURCE.as_bytes()).unwrap();

        let program = Program::from_file(&ctx, file.path(), None).unwrap();
        drop(program);
    }

    #[test]
    fn missing_file_emits_diagnostic_and_errors() {
        let (_, sink, registry) = fixture();
        let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();

        let err = Program::from_file(&ctx, "/nonexistent/kernels.cl", None).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(sink
            .lines()
            .iter()
            .any(|l| l.contains("cannot open kernel source file")));
    }

    #[test]
    fn release_is_idempotent() {
        let (driver, _, registry) = fixture();
        let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();
        let mut program = Program::from_source(&ctx, GOOD_SOURCE, None).unwrap();

        program.release();
        program.release();
        drop(program);

        assert_eq!(driver.releases(ObjectKind::Program), 1);
    }

    #[test]
    fn log_truncation_respects_char_boundaries() {
        assert_eq!(truncated("abcdef", 4), "abcd");
        assert_eq!(truncated("abc", 8), "abc");
        // Multibyte character straddling the limit is dropped whole.
        assert_eq!(truncated("ab\u{00e9}", 3), "ab");
    }
}
