//! Test utilities for the identity service.
//!
//! This module provides reusable test utilities for creating test configurations.
//!
//! # Feature Flag
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testing::TestConfigBuilder;
//!
//! let config = TestConfigBuilder::new()
//!     .in_memory()
//!     .with_keyspace("identity_test")
//!     .build();
//! ```

mod config_builder;

pub use config_builder::TestConfigBuilder;
