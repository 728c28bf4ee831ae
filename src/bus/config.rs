//! Configuration for the event bus.

/// Configuration for the event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Bus identifier used in log output; may be empty
    pub name: String,

    /// Log a warning when a registration is blocked by a guarded event
    pub log_guard_violations: bool,

    /// Emit a trace event for every dispatch
    pub trace_dispatch: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            log_guard_violations: true,
            trace_dispatch: true,
        }
    }
}

impl BusConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bus name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Enable guard violation warnings
    pub fn log_guard_violations(mut self, enable: bool) -> Self {
        self.log_guard_violations = enable;
        self
    }

    /// Enable per-dispatch tracing
    pub fn trace_dispatch(mut self, enable: bool) -> Self {
        self.trace_dispatch = enable;
        self
    }
}

/// Preset configurations for common use cases
impl BusConfig {
    /// Hot-path configuration: no per-dispatch tracing
    pub fn quiet() -> Self {
        Self::default().trace_dispatch(false)
    }

    /// Configuration for testing
    pub fn test() -> Self {
        Self::default()
            .name("test")
            .trace_dispatch(false)
            .log_guard_violations(false)
    }
}
