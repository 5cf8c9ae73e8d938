//! Connection options resolved from [`ClusterConfig`].

use std::fmt;
use std::str::FromStr;

use common::config::{ClusterConfig, ContactPoint, PoolingConfig};

use crate::error::{ClusterError, ClusterResult};

/// Replica acknowledgment policy applied to reads and writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConsistencyLevel {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    LocalOne,
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown consistency level: {0}")]
pub struct UnknownConsistencyLevel(pub String);

impl ConsistencyLevel {
    pub const ALL_LEVELS: [ConsistencyLevel; 11] = [
        ConsistencyLevel::Any,
        ConsistencyLevel::One,
        ConsistencyLevel::Two,
        ConsistencyLevel::Three,
        ConsistencyLevel::Quorum,
        ConsistencyLevel::All,
        ConsistencyLevel::LocalQuorum,
        ConsistencyLevel::EachQuorum,
        ConsistencyLevel::Serial,
        ConsistencyLevel::LocalSerial,
        ConsistencyLevel::LocalOne,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyLevel::Any => "ANY",
            ConsistencyLevel::One => "ONE",
            ConsistencyLevel::Two => "TWO",
            ConsistencyLevel::Three => "THREE",
            ConsistencyLevel::Quorum => "QUORUM",
            ConsistencyLevel::All => "ALL",
            ConsistencyLevel::LocalQuorum => "LOCAL_QUORUM",
            ConsistencyLevel::EachQuorum => "EACH_QUORUM",
            ConsistencyLevel::Serial => "SERIAL",
            ConsistencyLevel::LocalSerial => "LOCAL_SERIAL",
            ConsistencyLevel::LocalOne => "LOCAL_ONE",
        }
    }

    /// Resolve a configured level.
    ///
    /// A blank value means "driver default". An unrecognized value is logged
    /// and also treated as the driver default instead of failing startup.
    pub fn resolve(raw: Option<&str>) -> Option<ConsistencyLevel> {
        let raw = raw.map(str::trim).filter(|s| !s.is_empty())?;
        match raw.parse() {
            Ok(level) => Some(level),
            Err(e) => {
                log::error!("{e}; falling back to the driver default consistency level");
                None
            }
        }
    }
}

impl FromStr for ConsistencyLevel {
    type Err = UnknownConsistencyLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL_LEVELS
            .into_iter()
            .find(|level| level.as_str() == upper)
            .ok_or_else(|| UnknownConsistencyLevel(s.to_string()))
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distance class of a host relative to the local datacenter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostDistance {
    Local,
    Remote,
}

impl HostDistance {
    /// Core and max connection counts for hosts at this distance.
    pub fn connection_limits(&self, pooling: &PoolingConfig) -> (u32, u32) {
        match self {
            HostDistance::Local => (
                pooling.core_connections_local,
                pooling.max_connections_local,
            ),
            HostDistance::Remote => (
                pooling.core_connections_remote,
                pooling.max_connections_remote,
            ),
        }
    }
}

/// How requests are spread over the contact hosts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RoutingPolicy {
    /// Hosts are tried in contact order, healthy hosts first.
    #[default]
    ContactOrder,
    /// Round robin over the hosts of the local datacenter, remote hosts only
    /// as a fallback. Without an explicit local datacenter, the datacenter of
    /// the first contact point is used.
    DatacenterAwareRoundRobin { local_datacenter: Option<String> },
}

/// Everything a driver needs to open a cluster connection.
#[derive(Clone, Debug)]
pub struct ClusterOptions {
    pub contact_points: Vec<ContactPoint>,
    pub pooling: PoolingConfig,
    pub consistency: Option<ConsistencyLevel>,
    pub routing: RoutingPolicy,
}

impl ClusterOptions {
    pub fn new(contact_points: Vec<ContactPoint>) -> Self {
        Self {
            contact_points,
            pooling: PoolingConfig::default(),
            consistency: None,
            routing: RoutingPolicy::default(),
        }
    }

    /// Resolve options from configuration and validate them.
    pub fn from_config(config: &ClusterConfig) -> ClusterResult<Self> {
        let consistency = ConsistencyLevel::resolve(config.consistency_level.as_deref());
        log::info!(
            "Consistency level = {}",
            consistency.map_or("driver default", |c| c.as_str())
        );

        log::info!("Multi-DC routing enabled = {}", config.multi_dc_enabled);
        let routing = if config.multi_dc_enabled {
            RoutingPolicy::DatacenterAwareRoundRobin {
                local_datacenter: config.local_datacenter.clone(),
            }
        } else {
            RoutingPolicy::ContactOrder
        };

        let options = Self {
            contact_points: config.hosts.clone(),
            pooling: config.pooling.clone(),
            consistency,
            routing,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn with_pooling(mut self, pooling: PoolingConfig) -> Self {
        self.pooling = pooling;
        self
    }

    pub fn with_consistency(mut self, consistency: Option<ConsistencyLevel>) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_routing(mut self, routing: RoutingPolicy) -> Self {
        self.routing = routing;
        self
    }

    pub fn validate(&self) -> ClusterResult<()> {
        if self.contact_points.is_empty() {
            return Err(ClusterError::Configuration(
                "at least one contact point is required".to_string(),
            ));
        }
        if let Some(empty) = self
            .contact_points
            .iter()
            .position(|cp| cp.address.trim().is_empty())
        {
            return Err(ClusterError::Configuration(format!(
                "contact point #{empty} has an empty address"
            )));
        }

        let pooling = &self.pooling;
        for distance in [HostDistance::Local, HostDistance::Remote] {
            let (core, max) = distance.connection_limits(pooling);
            if max == 0 {
                return Err(ClusterError::Configuration(format!(
                    "max connections for {distance:?} hosts must be positive"
                )));
            }
            if core > max {
                return Err(ClusterError::Configuration(format!(
                    "core connections ({core}) exceed max connections ({max}) for {distance:?} hosts"
                )));
            }
        }
        if pooling.max_requests_per_connection == 0 {
            return Err(ClusterError::Configuration(
                "max requests per connection must be positive".to_string(),
            ));
        }
        if pooling.heartbeat_interval.is_zero() {
            return Err(ClusterError::Configuration(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Datacenter considered local for routing and pool sizing.
    pub fn local_datacenter(&self) -> Option<&str> {
        match &self.routing {
            RoutingPolicy::ContactOrder => None,
            RoutingPolicy::DatacenterAwareRoundRobin {
                local_datacenter: Some(dc),
            } => Some(dc.as_str()),
            RoutingPolicy::DatacenterAwareRoundRobin {
                local_datacenter: None,
            } => self
                .contact_points
                .first()
                .and_then(|cp| cp.datacenter.as_deref()),
        }
    }

    /// Distance of a contact point. Without datacenter-aware routing every
    /// host is local.
    pub fn distance(&self, contact_point: &ContactPoint) -> HostDistance {
        match (&self.routing, self.local_datacenter()) {
            (RoutingPolicy::ContactOrder, _) | (_, None) => HostDistance::Local,
            (_, Some(local)) => {
                if contact_point.datacenter.as_deref().unwrap_or(local) == local {
                    HostDistance::Local
                } else {
                    HostDistance::Remote
                }
            }
        }
    }

    /// Total number of requests the connection may have in flight.
    pub fn max_in_flight_requests(&self) -> usize {
        let per_host = self.pooling.max_connections_local as usize
            * self.pooling.max_requests_per_connection as usize;
        per_host.clamp(1, tokio::sync::Semaphore::MAX_PERMITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_consistency_level_is_case_insensitive() {
        assert_eq!("quorum".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::Quorum);
        assert_eq!(
            " Local_Quorum ".parse::<ConsistencyLevel>().unwrap(),
            ConsistencyLevel::LocalQuorum
        );
        assert_eq!(
            "LOCAL_ONE".parse::<ConsistencyLevel>().unwrap(),
            ConsistencyLevel::LocalOne
        );
        assert!("majority".parse::<ConsistencyLevel>().is_err());
    }

    #[test]
    fn test_resolve_treats_blank_and_unknown_as_default() {
        assert_eq!(ConsistencyLevel::resolve(None), None);
        assert_eq!(ConsistencyLevel::resolve(Some("   ")), None);
        assert_eq!(ConsistencyLevel::resolve(Some("strongest")), None);
        assert_eq!(
            ConsistencyLevel::resolve(Some("each_quorum")),
            Some(ConsistencyLevel::EachQuorum)
        );
    }

    #[test]
    fn test_display_round_trips_every_level() {
        for level in ConsistencyLevel::ALL_LEVELS {
            assert_eq!(level.to_string().parse::<ConsistencyLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_from_config_selects_routing_policy() {
        let mut config = ClusterConfig::default();
        let options = ClusterOptions::from_config(&config).unwrap();
        assert_eq!(options.routing, RoutingPolicy::ContactOrder);
        assert_eq!(options.consistency, None);

        config.multi_dc_enabled = true;
        config.consistency_level = Some("local_quorum".to_string());
        let options = ClusterOptions::from_config(&config).unwrap();
        assert_eq!(
            options.routing,
            RoutingPolicy::DatacenterAwareRoundRobin {
                local_datacenter: None
            }
        );
        assert_eq!(options.consistency, Some(ConsistencyLevel::LocalQuorum));
    }

    #[test]
    fn test_unknown_consistency_is_not_fatal() {
        let config = ClusterConfig {
            consistency_level: Some("whatever".to_string()),
            ..ClusterConfig::default()
        };
        let options = ClusterOptions::from_config(&config).unwrap();
        assert_eq!(options.consistency, None);
    }

    #[test]
    fn test_validate_rejects_bad_pooling() {
        let mut pooling = PoolingConfig {
            core_connections_remote: 8,
            max_connections_remote: 2,
            ..PoolingConfig::default()
        };
        let options = ClusterOptions::new(vec![ContactPoint::new("sqlite::memory:")])
            .with_pooling(pooling.clone());
        assert!(matches!(options.validate(), Err(ClusterError::Configuration(_))));

        pooling = PoolingConfig {
            max_requests_per_connection: 0,
            ..PoolingConfig::default()
        };
        let options = options.with_pooling(pooling);
        assert!(matches!(options.validate(), Err(ClusterError::Configuration(_))));

        let options = ClusterOptions::new(vec![]).with_pooling(PoolingConfig {
            heartbeat_interval: Duration::from_secs(1),
            ..PoolingConfig::default()
        });
        assert!(matches!(options.validate(), Err(ClusterError::Configuration(_))));
    }

    #[test]
    fn test_local_datacenter_defaults_to_first_contact_point() {
        let options = ClusterOptions::new(vec![
            ContactPoint::new("postgres://a").in_datacenter("dc1"),
            ContactPoint::new("postgres://b").in_datacenter("dc2"),
        ])
        .with_routing(RoutingPolicy::DatacenterAwareRoundRobin {
            local_datacenter: None,
        });

        assert_eq!(options.local_datacenter(), Some("dc1"));
        assert_eq!(options.distance(&options.contact_points[0]), HostDistance::Local);
        assert_eq!(options.distance(&options.contact_points[1]), HostDistance::Remote);

        let explicit = options.with_routing(RoutingPolicy::DatacenterAwareRoundRobin {
            local_datacenter: Some("dc2".to_string()),
        });
        assert_eq!(explicit.distance(&explicit.contact_points[0]), HostDistance::Remote);
        assert_eq!(explicit.distance(&explicit.contact_points[1]), HostDistance::Local);
    }

    #[test]
    fn test_contact_order_treats_every_host_as_local() {
        let options = ClusterOptions::new(vec![
            ContactPoint::new("postgres://a").in_datacenter("dc1"),
            ContactPoint::new("postgres://b").in_datacenter("dc2"),
        ]);
        assert_eq!(options.local_datacenter(), None);
        assert_eq!(options.distance(&options.contact_points[1]), HostDistance::Local);
    }

    #[test]
    fn test_connection_limits_by_distance() {
        let pooling = PoolingConfig::default();
        assert_eq!(HostDistance::Local.connection_limits(&pooling), (4, 10));
        assert_eq!(HostDistance::Remote.connection_limits(&pooling), (2, 4));
    }
}
