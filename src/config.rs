//! configuration tree, deserialized from a single YAML file

use std::collections::HashMap;
use std::path::Path;

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Top level configuration; every section carries workable defaults so a
/// minimal file only names zones and their primaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub log: LogConfig,
    pub api: ApiConfig,
    pub offloader: OffloaderConfig,
    pub receiver: ReceiverConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            enabled: true,
            listen: "127.0.0.1:5580".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OffloaderConfig {
    pub enabled: bool,

    /// interface for primary mode attach
    pub interface: String,

    /// path of the compiled bpf object
    pub path: String,

    /// pin root for all maps
    pub pin_path: String,

    /// primary, secondary or auto
    pub loader_mode: String,

    /// exported tail-call hook for secondary mode
    pub hook_pin_path: String,
    pub hook_index: Vec<u32>,

    /// response flag bits compiled into the program: AA, RD, MBZ
    pub response_flags: Vec<String>,
    pub response_random_ttl: bool,

    pub bpf_metrics: bool,
    pub bpf_xdpcap: bool,

    /// initial datapath dry-run, also seeded into runtime-config slot 0
    pub bpf_dryrun: bool,

    pub mount_bpffs: bool,
    pub raise_memlock: bool,

    /// destination pass-lists seeded at load
    pub pass4: Vec<String>,
    pub pass6: Vec<String>,
}

impl Default for OffloaderConfig {
    fn default() -> Self {
        OffloaderConfig {
            enabled: true,
            interface: String::new(),
            path: String::new(),
            pin_path: String::new(),
            loader_mode: "auto".to_string(),
            hook_pin_path: String::new(),
            hook_index: Vec::new(),
            response_flags: vec!["AA".to_string()],
            response_random_ttl: false,
            bpf_metrics: true,
            bpf_xdpcap: false,
            bpf_dryrun: false,
            mount_bpffs: false,
            raise_memlock: true,
            pass4: Vec::new(),
            pass6: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReceiverConfig {
    pub enabled: bool,

    /// pin root used by the data pipeline; falls back to the offloader's
    pub pin_path: String,

    pub options: ReceiverOptions,

    pub http_transfer: HttpTransferConfig,
    pub axfr_transfer: AxfrTransferConfig,

    pub verifier: VerifierConfig,
    pub cooker: CookerConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReceiverOptions {
    pub incremental: bool,
    pub snapshots: SnapshotsOptions,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        ReceiverOptions {
            incremental: true,
            snapshots: SnapshotsOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SnapshotsOptions {
    pub enabled: bool,

    /// a blob younger than this many seconds may be reused for reads
    pub read_validinterval: u64,

    /// a blob younger than this many seconds warm-starts the zone
    pub startup_validinterval: u64,

    pub directory: String,
}

impl Default for SnapshotsOptions {
    fn default() -> Self {
        SnapshotsOptions {
            enabled: true,
            read_validinterval: 3600,
            startup_validinterval: 0,
            directory: "/var/lib/xdpdns/snapshots".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HttpTransferConfig {
    pub enabled: bool,
    pub zones: ZonesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AxfrTransferConfig {
    pub enabled: bool,

    /// zone change detection: "soa" or "rrsets+data"
    pub dirty_via: String,

    pub transfer: TransferTuning,
    pub zones: ZonesConfig,
    pub notify: NotifyConfig,
}

impl Default for AxfrTransferConfig {
    fn default() -> Self {
        AxfrTransferConfig {
            enabled: true,
            dirty_via: "soa".to_string(),
            transfer: TransferTuning::default(),
            zones: ZonesConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TransferTuning {
    /// concurrent transfers, the worker pool size
    pub transfers_in: usize,

    /// seconds between refresh scans
    pub transfers_interval: u64,
}

impl Default for TransferTuning {
    fn default() -> Self {
        TransferTuning {
            transfers_in: 5,
            transfers_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ZonesConfig {
    /// aliases for primary servers usable in zone definitions
    pub primary: HashMap<String, String>,

    /// zones this instance is secondary for
    pub secondary: HashMap<String, ZoneConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ZoneConfig {
    pub enabled: bool,

    /// primary servers, tried in order
    pub primary: Vec<String>,

    /// sources allowed to NOTIFY this zone
    pub allow_notify: Vec<String>,

    /// overrides the SOA refresh when non-zero
    pub refresh: u32,

    /// "axfr" or "http" (http also covers file:/// primaries)
    #[serde(rename = "type")]
    pub zone_type: String,

    /// optional TSIG key in `[algo:]name:base64secret` form
    pub key: String,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        ZoneConfig {
            enabled: true,
            primary: Vec::new(),
            allow_notify: Vec::new(),
            refresh: 0,
            zone_type: "axfr".to_string(),
            key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NotifyConfig {
    pub enabled: bool,

    /// listen definitions, e.g. `udp://127.0.0.1:5353`
    pub listen: Vec<String>,

    pub udp_buffer_size: usize,

    /// listener threads per address; more than one enables SO_REUSEPORT
    pub workers: usize,

    pub cookers: NotifyCookers,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            enabled: false,
            listen: Vec::new(),
            udp_buffer_size: 4096,
            workers: 1,
            cookers: NotifyCookers::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NotifyCookers {
    pub workers: usize,
}

impl Default for NotifyCookers {
    fn default() -> Self {
        NotifyCookers { workers: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VerifierConfig {
    pub enabled: bool,

    /// base interval in seconds, doubled with uniform jitter
    pub interval: u64,

    pub verify_oncook: bool,

    /// allow the map check to repair drift it finds
    pub repair: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            enabled: true,
            interval: 120,
            verify_oncook: false,
            repair: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CookerConfig {
    pub enabled: bool,
    pub dryrun: bool,

    /// seconds between cooking passes
    pub interval: u64,
}

impl Default for CookerConfig {
    fn default() -> Self {
        CookerConfig {
            enabled: true,
            dryrun: false,
            interval: 70,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MonitorConfig {
    pub collector: CollectorConfig,
    pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CollectorConfig {
    pub enabled: bool,
    pub verbose: bool,

    pub bpf: BpfCollector,
    pub runtime: RuntimeCollector,

    pub dump_interval: u64,
    pub garbage_collector: GarbageCollector,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            enabled: true,
            verbose: false,
            bpf: BpfCollector::default(),
            runtime: RuntimeCollector::default(),
            dump_interval: 600,
            garbage_collector: GarbageCollector::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BpfCollector {
    pub intervals: CollectorIntervals,
}

impl Default for BpfCollector {
    fn default() -> Self {
        BpfCollector {
            intervals: CollectorIntervals::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuntimeCollector {
    pub intervals: CollectorIntervals,
}

impl Default for RuntimeCollector {
    fn default() -> Self {
        RuntimeCollector {
            intervals: CollectorIntervals::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CollectorIntervals {
    pub metrics: u64,

    /// histograms settle slower than plain counters
    pub histograms: u64,

    /// zero map slots after reading them
    pub zero: bool,
}

impl Default for CollectorIntervals {
    fn default() -> Self {
        CollectorIntervals {
            metrics: 10,
            histograms: 60,
            zero: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GarbageCollector {
    pub interval: u64,
    pub keep: usize,
}

impl Default for GarbageCollector {
    fn default() -> Self {
        GarbageCollector {
            interval: 60,
            keep: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WatcherConfig {
    pub enabled: bool,
    pub interval: u64,
    pub rules: HashMap<String, Rule>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            enabled: false,
            interval: 17,
            rules: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Rule {
    pub higher: i64,
    pub lower: i64,
    pub actions: Vec<String>,
}

impl ReceiverConfig {
    /// Every enabled zone across both transfer families. A zone defined
    /// twice keeps its first definition.
    pub fn zone_configs(&self) -> HashMap<String, ZoneConfig> {
        let mut configs: HashMap<String, ZoneConfig> = HashMap::new();

        let mut sources: Vec<(&HashMap<String, ZoneConfig>, &str)> = Vec::new();
        if self.axfr_transfer.enabled {
            sources.push((&self.axfr_transfer.zones.secondary, "axfr"));
        }
        if self.http_transfer.enabled {
            sources.push((&self.http_transfer.zones.secondary, "http"));
        }

        for (zones, family) in sources {
            for (zone, config) in zones {
                if configs.contains_key(zone) {
                    log::error!(
                        "(config) zone:'{}' has more than one configuration, keeping the first",
                        zone
                    );
                    continue;
                }
                let mut config = config.clone();
                if config.zone_type.is_empty() {
                    config.zone_type = family.to_string();
                }
                configs.insert(zone.clone(), config);
            }
        }

        configs
    }

    /// Resolve a primary alias to its address; unknown aliases pass
    /// through unchanged.
    pub fn resolve_primary(&self, primary: &str) -> String {
        for zones in [&self.axfr_transfer.zones, &self.http_transfer.zones] {
            if let Some(server) = zones.primary.get(primary) {
                return server.clone();
            }
        }
        primary.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_gets_defaults() {
        let yaml = r#"
receiver:
  enabled: true
  axfr-transfer:
    zones:
      secondary:
        tt.example.net:
          primary: ["ns3.example.net"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert!(config.receiver.enabled);
        assert_eq!(config.receiver.axfr_transfer.transfer.transfers_in, 5);
        assert_eq!(config.receiver.axfr_transfer.transfer.transfers_interval, 10);
        assert_eq!(config.receiver.cooker.interval, 70);
        assert_eq!(config.receiver.axfr_transfer.dirty_via, "soa");

        let zones = config.receiver.zone_configs();
        let zone = zones.get("tt.example.net").unwrap();
        assert_eq!(zone.zone_type, "axfr");
        assert_eq!(zone.primary, vec!["ns3.example.net"]);
    }

    #[test]
    fn primary_alias_resolution() {
        let yaml = r#"
receiver:
  axfr-transfer:
    zones:
      primary:
        main: "ns3.example.net:53"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.receiver.resolve_primary("main"),
            "ns3.example.net:53"
        );
        assert_eq!(config.receiver.resolve_primary("other"), "other");
    }
}
