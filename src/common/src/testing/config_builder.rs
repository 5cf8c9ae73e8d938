//! Test configuration builder for creating test setups quickly.

use std::time::Duration;

use crate::config::{ClusterConfig, Configuration, ContactPoint, SearchConfig};

/// Builder for creating test configurations.
///
/// Provides a fluent API for creating configurations suitable for testing,
/// with sensible defaults that can be customized as needed.
///
/// # Example
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new()
///     .in_memory()
///     .with_keyspace("identity_test")
///     .with_search_timeout(Duration::from_millis(50))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    /// Create a new test configuration builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: Configuration::default(),
        }
    }

    /// Configure for fully in-memory operation (fastest for tests).
    ///
    /// This sets:
    /// - A single `sqlite::memory:` cluster host
    /// - The in-process search index (`memory://`)
    /// - No background lookup sweep
    pub fn in_memory(mut self) -> Self {
        self.config.cluster = ClusterConfig {
            hosts: vec![ContactPoint::new("sqlite::memory:")],
            ..ClusterConfig::default()
        };
        self.config.search = SearchConfig {
            url: "memory://".to_string(),
            ..SearchConfig::default()
        };
        self.config.reclamation.sweep_enabled = false;
        self
    }

    /// Store keyspaces as SQLite files below `dir`.
    pub fn with_sqlite_dir(mut self, dir: &std::path::Path) -> Self {
        self.config.cluster.hosts = vec![ContactPoint::new(format!("sqlite://{}", dir.display()))];
        self
    }

    pub fn with_keyspace(mut self, keyspace: &str) -> Self {
        self.config.reclamation.keyspace = keyspace.to_string();
        self
    }

    pub fn with_consistency_level(mut self, level: &str) -> Self {
        self.config.cluster.consistency_level = Some(level.to_string());
        self
    }

    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.config.search.timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.reclamation.request_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.reclamation.sweep_enabled = true;
        self.config.reclamation.sweep_interval = interval;
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> Configuration {
        self.config
    }
}
