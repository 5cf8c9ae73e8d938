pub mod driver;
pub mod error;
pub mod manager;
pub mod options;
pub mod sql;

pub use driver::{
    ClusterConnection, ClusterDriver, ClusterMetadata, HostInfo, KeyspaceSession, Row, row,
};
pub use error::{ClusterError, ClusterResult};
pub use manager::{ClusterManager, spawn_shutdown_hook};
pub use options::{ClusterOptions, ConsistencyLevel, HostDistance, RoutingPolicy};
pub use sql::SqlDriver;
