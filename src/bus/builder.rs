//! Builder pattern for constructing Bus instances.

use crate::bus::config::BusConfig;
use crate::Bus;
use tracing::debug;

/// Builder for creating Bus instances
#[derive(Debug, Clone, Default)]
pub struct BusBuilder {
    config: BusConfig,
}

impl BusBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bus name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Use a custom configuration
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Configure the bus
    pub fn configure<F>(mut self, f: F) -> Self
    where
        F: FnOnce(BusConfig) -> BusConfig,
    {
        self.config = f(self.config);
        self
    }

    /// Build the Bus
    pub fn build(self) -> Bus {
        let bus = Bus::from_config(self.config);
        debug!(bus = bus.name(), id = %bus.id(), "Bus created");
        bus
    }
}
