/// Errors raised by the cluster session manager and its drivers.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Invalid cluster configuration: {0}")]
    Configuration(String),

    #[error("Failed to connect to cluster: {0}")]
    Connection(String),

    #[error("Keyspace not found: {0}")]
    KeyspaceNotFound(String),

    #[error("Table not found: {keyspace}.{table}")]
    TableNotFound { keyspace: String, table: String },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Cluster connection is closed")]
    Closed,
}

impl ClusterError {
    /// True when the keyspace or table does not exist, as opposed to the
    /// cluster being unreachable or failing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClusterError::KeyspaceNotFound(_) | ClusterError::TableNotFound { .. }
        )
    }
}

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;
