//! Registry configuration.

use crate::diag::{DiagnosticSink, FailurePolicy, StderrSink};
use crate::error::{Error, Result};
use std::sync::Arc;

/// Configuration for a [`Registry`](crate::registry::Registry) and every
/// resource created through it.
#[derive(Debug, Clone)]
pub struct Config {
    /// How non-discovery errors surface. Defaults to [`FailurePolicy::Abort`].
    pub failure_policy: FailurePolicy,

    /// Upper bound on a single device build log, in bytes. Logs longer than
    /// this are truncated before being written to the diagnostic sink.
    pub build_log_limit: usize,

    /// Where diagnostics (build logs, fatal error reports) go.
    pub sink: Arc<dyn DiagnosticSink>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            build_log_limit: 1 << 20,
            sink: Arc::new(StderrSink),
        }
    }
}

impl Config {
    /// Start building a configuration from the defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.build_log_limit == 0 {
            return Err(Error::invalid_arg("build_log_limit must be > 0"));
        }
        Ok(())
    }
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Builder seeded with the default configuration.
    pub fn new() -> Self {
        Self { config: Config::default() }
    }

    /// How non-discovery errors surface.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    /// Upper bound on a single device build log, in bytes.
    pub fn build_log_limit(mut self, limit: usize) -> Self {
        self.config.build_log_limit = limit;
        self
    }

    /// Replace the diagnostic sink.
    pub fn sink<S: DiagnosticSink + 'static>(mut self, sink: S) -> Self {
        self.config.sink = Arc::new(sink);
        self
    }

    /// Replace the diagnostic sink with an already-shared one, so the
    /// caller can keep a handle to it.
    pub fn shared_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.config.sink = sink;
        self
    }

    /// Validate and finish.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_log_limit_rejected() {
        let result = Config::builder().build_log_limit(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_sets_policy() {
        let config = Config::builder()
            .failure_policy(FailurePolicy::Propagate)
            .build()
            .unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::Propagate);
    }
}
