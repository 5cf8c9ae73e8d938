use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// A cluster contact point.
///
/// In configuration files a contact point is either a plain address string or
/// a table carrying the datacenter and rack labels used by datacenter-aware
/// routing:
///
/// ```toml
/// hosts = [
///     "postgres://db-1:5432/identity",
///     { address = "postgres://db-2:5432/identity", datacenter = "dc2", rack = "r1" },
/// ]
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "ContactPointRepr")]
pub struct ContactPoint {
    pub address: String,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ContactPointRepr {
    Address(String),
    Detailed {
        address: String,
        #[serde(default)]
        datacenter: Option<String>,
        #[serde(default)]
        rack: Option<String>,
    },
}

impl From<ContactPointRepr> for ContactPoint {
    fn from(repr: ContactPointRepr) -> Self {
        match repr {
            ContactPointRepr::Address(address) => ContactPoint::new(address),
            ContactPointRepr::Detailed {
                address,
                datacenter,
                rack,
            } => ContactPoint {
                address,
                datacenter,
                rack,
            },
        }
    }
}

impl ContactPoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            datacenter: None,
            rack: None,
        }
    }

    pub fn in_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    pub fn on_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = Some(rack.into());
        self
    }
}

/// Connection pooling limits, split by host distance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolingConfig {
    /// Connections kept open to each host in the local datacenter
    pub core_connections_local: u32,
    /// Upper bound of connections to each host in the local datacenter
    pub max_connections_local: u32,
    pub core_connections_remote: u32,
    pub max_connections_remote: u32,
    /// Concurrent requests allowed on a single connection
    pub max_requests_per_connection: u32,
    /// Interval between host liveness probes
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Maximum time to wait for a connection or a request slot
    #[serde(with = "humantime_serde")]
    pub pool_timeout: Duration,
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self {
            core_connections_local: 4,
            max_connections_local: 10,
            core_connections_remote: 2,
            max_connections_remote: 4,
            max_requests_per_connection: 32768,
            heartbeat_interval: Duration::from_secs(60),
            pool_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration of the primary store cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Contact points; the scheme selects the driver backend
    pub hosts: Vec<ContactPoint>,
    pub pooling: PoolingConfig,
    /// Consistency level name, case-insensitive; unset or unknown means driver default
    pub consistency_level: Option<String>,
    /// Route with a datacenter-aware round-robin policy
    pub multi_dc_enabled: bool,
    /// Local datacenter for multi-DC routing, defaults to the first contact point's
    pub local_datacenter: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: vec![ContactPoint::new("sqlite::memory:")],
            pooling: PoolingConfig::default(),
            consistency_level: None,
            multi_dc_enabled: false,
            local_datacenter: None,
        }
    }
}

/// Configuration of the secondary search index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Base URL of the search cluster, or `memory://` for the in-process index
    pub url: String,
    /// Index holding user documents
    pub index: String,
    /// Upper bound on waiting for an index acknowledgment
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: "memory://".to_string(),
            index: "user".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration of identifier reclamation and lookup reconciliation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReclamationConfig {
    pub keyspace: String,
    pub user_table: String,
    pub lookup_table: String,
    pub role_group_table: String,
    /// Deadline applied to requests that do not carry their own
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Create the keyspace and tables at startup when missing
    pub provision_schema: bool,
    /// Run the periodic stale lookup sweep
    pub sweep_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Pending lookup deletes kept for retry before falling back to the sweep
    pub retry_queue_capacity: usize,
    /// Delay before the second attempt of a queued lookup delete; doubles per attempt
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Attempts of a queued lookup delete before leaving it to the sweep
    pub retry_attempts: u32,
}

impl Default for ReclamationConfig {
    fn default() -> Self {
        Self {
            keyspace: "identity".to_string(),
            user_table: "user".to_string(),
            lookup_table: "user_lookup".to_string(),
            role_group_table: "role_group".to_string(),
            request_timeout: Duration::from_secs(30),
            provision_schema: true,
            sweep_enabled: true,
            sweep_interval: Duration::from_secs(600),
            retry_queue_capacity: 1024,
            retry_backoff: Duration::from_secs(1),
            retry_attempts: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Primary store cluster
    pub cluster: ClusterConfig,
    /// Search index mirror
    pub search: SearchConfig,
    /// Identifier reclamation
    pub reclamation: ReclamationConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file("identity.toml"))
            .extract()
            .map_err(Box::new)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(path)).extract().map_err(Box::new)
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed("IDENTITY__").split("__"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn load() -> figment::Result<Configuration> {
        Configuration::load().map_err(|e| *e)
    }

    #[test]
    fn test_default_configuration_is_in_memory() {
        let config = Configuration::default();

        assert_eq!(config.cluster.hosts, vec![ContactPoint::new("sqlite::memory:")]);
        assert!(config.cluster.consistency_level.is_none());
        assert!(!config.cluster.multi_dc_enabled);
        assert_eq!(config.search.url, "memory://");
        assert_eq!(config.reclamation.keyspace, "identity");
        assert_eq!(config.reclamation.user_table, "user");
        assert_eq!(config.reclamation.lookup_table, "user_lookup");
    }

    #[test]
    fn test_configless_operation() {
        Jail::expect_with(|_jail| {
            let config = load()?;
            assert_eq!(config.cluster.pooling, PoolingConfig::default());
            assert_eq!(config.search.timeout, Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn test_toml_file_with_mixed_contact_points() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "identity.toml",
                r#"
                [cluster]
                hosts = [
                    "postgres://db-1:5432/identity",
                    { address = "postgres://db-2:5432/identity", datacenter = "dc2", rack = "r7" },
                ]
                consistency_level = "local_quorum"
                multi_dc_enabled = true

                [cluster.pooling]
                max_connections_local = 16
                heartbeat_interval = "15s"
                pool_timeout = "250ms"
                "#,
            )?;

            let config = load()?;
            assert_eq!(config.cluster.hosts.len(), 2);
            assert_eq!(config.cluster.hosts[0].address, "postgres://db-1:5432/identity");
            assert_eq!(config.cluster.hosts[0].datacenter, None);
            assert_eq!(config.cluster.hosts[1].datacenter.as_deref(), Some("dc2"));
            assert_eq!(config.cluster.hosts[1].rack.as_deref(), Some("r7"));
            assert_eq!(config.cluster.consistency_level.as_deref(), Some("local_quorum"));
            assert!(config.cluster.multi_dc_enabled);

            // Unset pooling keys keep their defaults
            assert_eq!(config.cluster.pooling.max_connections_local, 16);
            assert_eq!(config.cluster.pooling.core_connections_local, 4);
            assert_eq!(config.cluster.pooling.heartbeat_interval, Duration::from_secs(15));
            assert_eq!(config.cluster.pooling.pool_timeout, Duration::from_millis(250));
            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        Jail::expect_with(|jail| {
            jail.set_env("IDENTITY__SEARCH__URL", "http://search:9200");
            jail.set_env("IDENTITY__SEARCH__TIMEOUT", "2s");
            jail.set_env("IDENTITY__RECLAMATION__KEYSPACE", "accounts");
            jail.set_env("IDENTITY__CLUSTER__CONSISTENCY_LEVEL", "QUORUM");
            jail.set_env("IDENTITY__RECLAMATION__RETRY_BACKOFF", "250ms");

            let config = load()?;
            assert_eq!(config.reclamation.retry_backoff, Duration::from_millis(250));
            assert_eq!(config.reclamation.retry_attempts, 5);
            assert_eq!(config.search.url, "http://search:9200");
            assert_eq!(config.search.timeout, Duration::from_secs(2));
            assert_eq!(config.reclamation.keyspace, "accounts");
            assert_eq!(config.cluster.consistency_level.as_deref(), Some("QUORUM"));
            Ok(())
        });
    }

    #[test]
    fn test_explicit_path_wins_over_default_file() {
        Jail::expect_with(|jail| {
            jail.create_file("identity.toml", "[search]\nindex = \"ignored\"\n")?;
            jail.create_file("custom.toml", "[search]\nindex = \"users_v2\"\n")?;

            let config = Configuration::load_from_path(Path::new("custom.toml")).map_err(|e| *e)?;
            assert_eq!(config.search.index, "users_v2");
            Ok(())
        });
    }
}
