/*!
Configuration records and the daemon configuration file.

This module defines:
- `GlobalConf`, `AreaConf`, `IntfConf`: the typed config-apply records. They
  are validated before the control loop lets them cause any side effect.
- `GlobalState`: the process-wide singleton built around the applied
  `GlobalConf`, with status flags and counters.
- `Timers` and `DaemonConfig`: the JSON configuration file read at startup.
  Durations are written in human-readable form (`"200ms"`, `"5s"`).
*/

use std::{fs, net::Ipv4Addr, path::Path, time::Duration};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::router::{AreaId, IntfKey, RouterId};

pub const OSPF_VERSION_2: u8 = 2;
const DEFAULT_REFERENCE_BANDWIDTH: i32 = 100_000;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid router id {0}")]
    InvalidRouterId(RouterId),
    #[error("interface {intf} has negative cost {cost}")]
    NegativeMetric { intf: IntfKey, cost: i32 },
    #[error("interface {intf} cost {cost} is outside 1..=65535")]
    InvalidMetric { intf: IntfKey, cost: i32 },
    #[error("invalid reference bandwidth {0}")]
    InvalidReferenceBandwidth(i32),
    #[error("invalid external LSDB limit {0}")]
    InvalidExtLsdbLimit(i32),
    #[error("invalid prefix length {prefix_len} on interface {intf}")]
    InvalidPrefixLength { intf: IntfKey, prefix_len: u8 },
    #[error("interface {intf}: hello interval must be non-zero and shorter than the dead interval")]
    InvalidInterval { intf: IntfKey },
    #[error("area {0} is not configured")]
    UnknownArea(AreaId),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Serde helper to read and write `Duration`s as humantime strings.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    #[default]
    Disabled,
    Enabled,
}

impl AdminState {
    pub fn is_enabled(&self) -> bool {
        *self == AdminState::Enabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartSupport {
    #[default]
    None,
    PlannedOnly,
    PlannedAndUnplanned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StubRouterAdvertisement {
    #[default]
    DoNotAdvertise,
    Advertise,
}

/// Global protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConf {
    pub router_id: RouterId,
    pub admin_state: AdminState,
    pub as_border_router: bool,
    pub tos_support: bool,
    /// Maximum number of AS-external LSAs, -1 for no limit.
    pub ext_lsdb_limit: i32,
    pub multicast_extensions: i32,
    pub exit_overflow_interval: u32,
    pub demand_extensions: bool,
    pub rfc1583_compatibility: bool,
    pub reference_bandwidth: i32,
    pub restart_support: RestartSupport,
    pub restart_interval: i32,
    pub restart_strict_lsa_checking: bool,
    pub stub_router_advertisement: StubRouterAdvertisement,
}

impl Default for GlobalConf {
    fn default() -> Self {
        Self {
            router_id: RouterId::default(),
            admin_state: AdminState::Disabled,
            as_border_router: false,
            tos_support: false,
            ext_lsdb_limit: -1,
            multicast_extensions: 0,
            exit_overflow_interval: 0,
            demand_extensions: false,
            rfc1583_compatibility: false,
            reference_bandwidth: DEFAULT_REFERENCE_BANDWIDTH,
            restart_support: RestartSupport::None,
            restart_interval: 0,
            restart_strict_lsa_checking: false,
            stub_router_advertisement: StubRouterAdvertisement::DoNotAdvertise,
        }
    }
}

impl GlobalConf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let id = self.router_id.addr();
        if id.is_multicast() || id.is_broadcast() || (self.admin_state.is_enabled() && id.is_unspecified()) {
            return Err(ConfigError::InvalidRouterId(self.router_id));
        }
        if self.reference_bandwidth <= 0 {
            return Err(ConfigError::InvalidReferenceBandwidth(self.reference_bandwidth));
        }
        if self.ext_lsdb_limit < -1 {
            return Err(ConfigError::InvalidExtLsdbLimit(self.ext_lsdb_limit));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GlobalCounters {
    pub extern_lsa_count: u32,
    pub extern_lsa_checksum: u32,
    pub originate_new_lsas: u32,
    pub rx_new_lsas: u32,
    pub spf_runs: u32,
    /// LS updates dropped because the sender is not a Full neighbor.
    pub rx_dropped_unknown_neighbor: u32,
}

/// The applied global configuration plus status and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalState {
    pub conf: GlobalConf,
    pub version: u8,
    pub area_border_router: bool,
    pub counters: GlobalCounters,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            conf: GlobalConf::default(),
            version: OSPF_VERSION_2,
            area_border_router: false,
            counters: GlobalCounters::default(),
        }
    }
}

impl GlobalState {
    pub fn is_enabled(&self) -> bool {
        self.conf.admin_state.is_enabled()
    }

    pub fn router_id(&self) -> RouterId {
        self.conf.router_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    Simple,
    Md5,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaConf {
    pub area_id: AreaId,
    #[serde(default)]
    pub auth_type: AuthType,
    /// Whether AS-external routes are used in this area.
    #[serde(default = "default_true")]
    pub import_as_extern: bool,
    #[serde(default = "default_true")]
    pub area_summary: bool,
    #[serde(default)]
    pub stub_default_cost: u32,
}

impl AreaConf {
    pub fn new(area_id: AreaId) -> Self {
        Self {
            area_id,
            auth_type: AuthType::None,
            import_as_extern: true,
            area_summary: true,
            stub_default_cost: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntfType {
    #[default]
    Broadcast,
    PointToPoint,
}

fn default_priority() -> u8 {
    1
}

fn default_cost() -> i32 {
    10
}

fn default_hello_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_dead_interval() -> Duration {
    Duration::from_secs(40)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntfConf {
    pub key: IntfKey,
    pub prefix_len: u8,
    pub area_id: AreaId,
    #[serde(default)]
    pub admin_state: AdminState,
    #[serde(default)]
    pub intf_type: IntfType,
    /// Signed so that a negative value can be reported instead of wrapping.
    #[serde(default = "default_cost")]
    pub cost: i32,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_hello_interval", with = "humantime_duration")]
    pub hello_interval: Duration,
    #[serde(default = "default_dead_interval", with = "humantime_duration")]
    pub dead_interval: Duration,
}

impl IntfConf {
    pub fn new(key: IntfKey, prefix_len: u8, area_id: AreaId) -> Self {
        Self {
            key,
            prefix_len,
            area_id,
            admin_state: AdminState::Enabled,
            intf_type: IntfType::Broadcast,
            cost: default_cost(),
            priority: default_priority(),
            hello_interval: default_hello_interval(),
            dead_interval: default_dead_interval(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cost < 0 {
            return Err(ConfigError::NegativeMetric {
                intf: self.key,
                cost: self.cost,
            });
        }
        if self.cost == 0 || self.cost > u16::MAX as i32 {
            return Err(ConfigError::InvalidMetric {
                intf: self.key,
                cost: self.cost,
            });
        }
        if self.hello_interval.is_zero() || self.hello_interval >= self.dead_interval {
            return Err(ConfigError::InvalidInterval { intf: self.key });
        }
        self.network()?;
        Ok(())
    }

    /// The interface address with its prefix length, e.g. `10.0.0.1/24`.
    pub fn network(&self) -> Result<Ipv4Network, ConfigError> {
        Ipv4Network::new(self.key.ip_address, self.prefix_len).map_err(|_| ConfigError::InvalidPrefixLength {
            intf: self.key,
            prefix_len: self.prefix_len,
        })
    }

    pub fn mask(&self) -> Ipv4Addr {
        self.network().map(|net| net.mask()).unwrap_or(Ipv4Addr::BROADCAST)
    }

    /// Cost as advertised in Router-LSAs. Only meaningful after `validate`.
    pub fn metric(&self) -> u16 {
        self.cost.clamp(1, u16::MAX as i32) as u16
    }
}

/// Protocol timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timers {
    /// Quiet period after a trigger before SPF runs; triggers inside it coalesce.
    #[serde(with = "humantime_duration")]
    pub spf_delay: Duration,
    /// Minimum spacing between two SPF runs.
    #[serde(with = "humantime_duration")]
    pub spf_hold: Duration,
    #[serde(with = "humantime_duration")]
    pub lsa_age_tick: Duration,
    /// Upper bound of the random early refresh of self-originated LSAs.
    #[serde(with = "humantime_duration")]
    pub refresh_jitter: Duration,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            spf_delay: Duration::from_millis(200),
            spf_hold: Duration::from_secs(1),
            lsa_age_tick: Duration::from_secs(1),
            refresh_jitter: Duration::from_secs(10),
        }
    }
}

/// Everything the daemon reads at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub global: GlobalConf,
    pub areas: Vec<AreaConf>,
    pub interfaces: Vec<IntfConf>,
    pub timers: Timers,
    pub channel_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            global: GlobalConf::default(),
            areas: Vec::new(),
            interfaces: Vec::new(),
            timers: Timers::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.global.validate()?;
        for intf in &self.interfaces {
            intf.validate()?;
            if !self.areas.iter().any(|area| area.area_id == intf.area_id) {
                return Err(ConfigError::UnknownArea(intf.area_id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_global_defaults() {
        let state = GlobalState::default();
        assert_eq!(state.conf.router_id, RouterId::new(0, 0, 0, 0));
        assert_eq!(state.conf.admin_state, AdminState::Disabled);
        assert_eq!(state.conf.ext_lsdb_limit, -1);
        assert_eq!(state.conf.reference_bandwidth, 100_000);
        assert_eq!(state.version, 2);
        assert!(state.conf.validate().is_ok());
    }

    #[test]
    fn test_enabled_instance_needs_router_id() {
        let conf = GlobalConf {
            admin_state: AdminState::Enabled,
            ..Default::default()
        };
        assert!(matches!(conf.validate(), Err(ConfigError::InvalidRouterId(_))));

        let conf = GlobalConf {
            router_id: RouterId::new(224, 0, 0, 5),
            ..Default::default()
        };
        assert!(matches!(conf.validate(), Err(ConfigError::InvalidRouterId(_))));
    }

    #[test]
    fn test_global_limits() {
        let conf = GlobalConf {
            reference_bandwidth: -5,
            ..Default::default()
        };
        assert!(matches!(conf.validate(), Err(ConfigError::InvalidReferenceBandwidth(-5))));

        let conf = GlobalConf {
            ext_lsdb_limit: -2,
            ..Default::default()
        };
        assert!(matches!(conf.validate(), Err(ConfigError::InvalidExtLsdbLimit(-2))));
    }

    #[test]
    fn test_interface_cost_validation() {
        let key = IntfKey::new(Ipv4Addr::new(10, 0, 0, 1), 2);
        let mut intf = IntfConf::new(key, 24, AreaId::BACKBONE);
        assert!(intf.validate().is_ok());
        assert_eq!(intf.metric(), 10);

        intf.cost = -1;
        assert!(matches!(intf.validate(), Err(ConfigError::NegativeMetric { cost: -1, .. })));
        intf.cost = 0;
        assert!(matches!(intf.validate(), Err(ConfigError::InvalidMetric { cost: 0, .. })));
        intf.cost = 70_000;
        assert!(matches!(intf.validate(), Err(ConfigError::InvalidMetric { .. })));

        intf.cost = 1;
        intf.prefix_len = 33;
        assert!(matches!(intf.validate(), Err(ConfigError::InvalidPrefixLength { .. })));
    }

    #[test]
    fn test_interface_interval_validation() {
        let key = IntfKey::new(Ipv4Addr::new(10, 0, 0, 1), 2);
        let mut intf = IntfConf::new(key, 24, AreaId::BACKBONE);
        intf.hello_interval = Duration::ZERO;
        assert!(matches!(intf.validate(), Err(ConfigError::InvalidInterval { .. })));
        intf.hello_interval = intf.dead_interval;
        assert!(matches!(intf.validate(), Err(ConfigError::InvalidInterval { .. })));
    }

    #[test]
    fn test_interface_network() {
        let key = IntfKey::new(Ipv4Addr::new(10, 0, 0, 1), 2);
        let intf = IntfConf::new(key, 24, AreaId::BACKBONE);
        assert_eq!(intf.mask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(intf.network().unwrap().network(), Ipv4Addr::new(10, 0, 0, 0));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "global": {{ "router_id": "1.1.1.1", "admin_state": "enabled" }},
                "areas": [ {{ "area_id": "0.0.0.0" }} ],
                "interfaces": [
                    {{
                        "key": {{ "ip_address": "10.0.0.1", "if_index": 3 }},
                        "prefix_len": 24,
                        "area_id": "0",
                        "admin_state": "enabled",
                        "intf_type": "point_to_point",
                        "cost": 5,
                        "hello_interval": "2s"
                    }}
                ],
                "timers": {{ "spf_delay": "50ms" }}
            }}"#
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.global.router_id, RouterId::new(1, 1, 1, 1));
        assert!(config.global.admin_state.is_enabled());
        assert_eq!(config.global.reference_bandwidth, 100_000);
        assert_eq!(config.areas, vec![AreaConf::new(AreaId::BACKBONE)]);

        let intf = &config.interfaces[0];
        assert_eq!(intf.area_id, AreaId::BACKBONE);
        assert_eq!(intf.intf_type, IntfType::PointToPoint);
        assert_eq!(intf.hello_interval, Duration::from_secs(2));
        assert_eq!(intf.dead_interval, Duration::from_secs(40));
        assert_eq!(intf.priority, 1);

        assert_eq!(config.timers.spf_delay, Duration::from_millis(50));
        assert_eq!(config.timers.spf_hold, Timers::default().spf_hold);
        assert_eq!(config.channel_capacity, 64);
    }

    #[test]
    fn test_interface_in_unknown_area_is_rejected() {
        let raw = r#"{
            "areas": [],
            "interfaces": [
                { "key": { "ip_address": "10.0.0.1", "if_index": 3 }, "prefix_len": 24, "area_id": "0.0.0.7" }
            ]
        }"#;
        assert!(matches!(
            DaemonConfig::from_json_str(raw),
            Err(ConfigError::UnknownArea(area)) if area == AreaId::new(0, 0, 0, 7)
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = DaemonConfig::load(dir.path().join("absent.json"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
