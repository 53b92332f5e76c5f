//! the data pipeline: transfers zones into snapshots, cooks them into
//! the kernel maps and keeps all three copies reconciled.

/// per zone record snapshots and the IXFR engine
pub mod snapshot;

/// zone state ring, locks and change detection
pub mod zones;

/// snapshot acquisition over AXFR/IXFR and HTTP
pub mod importer;

/// bounded transfer worker pool
pub mod pool;

/// translation of pending actions into map mutations
pub mod cooker;

/// NOTIFY listener and its immediate-cook pool
pub mod notifier;

/// memory/file/map reconciliation
pub mod verifier;

/// metric collection and threshold rules
pub mod watcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReceiverConfig;
use crate::dns::client::TransferMode;
use crate::receiver::pool::TransferPool;
use crate::receiver::snapshot::{ImportActions, ZoneSnapshot};
use crate::receiver::zones::ZonesState;
use crate::shutdown::ShutdownToken;

pub const DEFAULT_TRANSFERS_INTERVAL: Duration = Duration::from_secs(10);

/// Scheduler half of the receiver: owns the zone states and decides on
/// every tick which zones are due for a transfer.
pub struct Receiver {
    config: Arc<ReceiverConfig>,
    zones: Arc<ZonesState>,
}

impl Receiver {
    pub fn new(config: Arc<ReceiverConfig>, zones: Arc<ZonesState>) -> Receiver {
        Receiver { config, zones }
    }

    /// Seed zone states at startup. A blob younger than the configured
    /// startup interval warm-starts its zone; everything else starts
    /// dirty with an empty ring and waits for the first transfer.
    pub fn startup(&self) {
        let id = "(receiver) (startup)";

        let startup = self.config.options.snapshots.startup_validinterval;
        let dir = PathBuf::from(&self.config.options.snapshots.directory);

        for (zone, config) in self.config.zone_configs() {
            if !config.enabled {
                continue;
            }

            let state = self.zones.ensure(&zone, &config);

            if startup == 0 {
                continue;
            }

            match ZoneSnapshot::from_blob(&dir, &zone, startup) {
                Ok(mut snapshot) => {
                    snapshot.pending = Some(ImportActions {
                        mode: TransferMode::None,
                        zone: zone.clone(),
                        actions: None,
                    });

                    log::debug!(
                        "{} zone:'{}' warm-started from blob serial:'{}'",
                        id,
                        zone,
                        snapshot.serial()
                    );

                    state.lock().advance(snapshot);
                }
                Err(e) => {
                    log::debug!("{} zone:'{}' cold start ({})", id, zone, e);
                }
            }
        }
    }

    /// One scheduling pass: push a transfer job for every enabled zone
    /// whose refresh timer has expired, and for every zone not imported
    /// yet.
    pub fn refresh_tick(&self, pool: &TransferPool) {
        let id = "(zones) (update)";

        log::debug!("{} request to update zones snapshot triggers", id);

        for (zone, config) in self.config.zone_configs() {
            if !config.enabled {
                continue;
            }

            let state = self.zones.ensure(&zone, &config);
            let state = state.lock();

            let http = config.zone_type == "http";

            let snapshot = match state.current() {
                Some(snapshot) => snapshot,
                None => {
                    log::debug!(
                        "{} requested snapshot for zone:'{}' via ['{}']",
                        id,
                        zone,
                        config.primary.join(",")
                    );
                    let mode = if http {
                        TransferMode::Http
                    } else {
                        TransferMode::Axfr
                    };
                    drop(state);
                    pool.submit(&zone, &config, mode, None);
                    continue;
                }
            };

            // the zone's own SOA refresh schedules the next transfer
            // unless the configuration overrides it
            let mut refresh = snapshot.refresh();
            if config.refresh > 0 {
                refresh = config.refresh;
            }

            let age = snapshot.age_seconds();
            log::debug!("{} zone:'{}' age:'{:2.2}'", id, zone, age);

            if age > refresh as f64 {
                let soa = snapshot.soa.clone();
                log::debug!("{} zone:'{}' SOA {}", id, zone, snapshot.soa_string());

                let mode = if http {
                    TransferMode::Http
                } else {
                    TransferMode::Ixfr
                };
                drop(state);
                pool.submit(&zone, &config, mode, soa);
            }
        }
    }

    /// Periodic loop driving [`Receiver::refresh_tick`].
    pub fn run(&self, pool: &TransferPool, shutdown: ShutdownToken) {
        let id = "(receiver) (tick)";

        let interval = if self.config.axfr_transfer.transfer.transfers_interval > 0 {
            Duration::from_secs(self.config.axfr_transfer.transfer.transfers_interval)
        } else {
            DEFAULT_TRANSFERS_INTERVAL
        };

        loop {
            if shutdown.wait(interval) {
                log::debug!("{} context stop on receiver", id);
                return;
            }

            self.refresh_tick(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SnapshotsOptions, ZoneConfig, ZonesConfig};
    use std::collections::HashMap;

    fn config_with(dir: &std::path::Path, startup: u64) -> Arc<ReceiverConfig> {
        let mut secondary = HashMap::new();
        secondary.insert(
            "tt.example.net".to_string(),
            ZoneConfig {
                primary: vec!["ns3.example.net".to_string()],
                ..ZoneConfig::default()
            },
        );

        Arc::new(ReceiverConfig {
            enabled: true,
            options: crate::config::ReceiverOptions {
                incremental: true,
                snapshots: SnapshotsOptions {
                    directory: dir.display().to_string(),
                    startup_validinterval: startup,
                    ..SnapshotsOptions::default()
                },
            },
            axfr_transfer: crate::config::AxfrTransferConfig {
                zones: ZonesConfig {
                    secondary,
                    ..ZonesConfig::default()
                },
                ..crate::config::AxfrTransferConfig::default()
            },
            ..ReceiverConfig::default()
        })
    }

    #[test]
    fn startup_without_blob_leaves_zone_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(dir.path(), 3600);
        let zones = Arc::new(ZonesState::new());

        Receiver::new(config, zones.clone()).startup();

        let state = zones.get("tt.example.net").unwrap();
        let state = state.lock();
        assert_eq!(state.snapshot_id, -1);
        assert!(state.current().is_none());
    }

    #[test]
    fn startup_warm_starts_from_fresh_blob() {
        let dir = tempfile::tempdir().unwrap();

        let snapshot = ZoneSnapshot::from_text(
            "tt.example.net",
            "\
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 2017041755 900 600 3600000 300
alpha.tt.example.net. 600 IN A 10.0.0.1
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 2017041755 900 600 3600000 300",
        )
        .unwrap();
        snapshot.write_blob(dir.path(), false).unwrap();

        let config = config_with(dir.path(), 3600);
        let zones = Arc::new(ZonesState::new());

        Receiver::new(config, zones.clone()).startup();

        let loaded = zones.last_snapshot("tt.example.net").unwrap();
        assert_eq!(loaded.serial(), 2017041755);
        assert_eq!(loaded.pending.as_ref().unwrap().mode, TransferMode::None);
    }
}
