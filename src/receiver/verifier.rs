//! reconciles the three copies of zone state: transfer snapshots, blob
//! files and the kernel maps

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};
use rand::Rng;

use crate::config::ReceiverConfig;
use crate::dns::client::{self, TransferMode, TransferOptions};
use crate::dns::protocol::DnsRecord;
use crate::offload::maps::AnswerMaps;
use crate::receiver::snapshot::{VerifyResult, ZoneSnapshot};
use crate::receiver::zones::ZonesState;
use crate::shutdown::ShutdownToken;

pub const DEFAULT_VERIFIER_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Display, From, Error)]
pub enum VerifierError {
    Client(crate::dns::client::ClientError),
    Snapshot(crate::receiver::snapshot::SnapshotError),
    Map(crate::offload::maps::MapError),
}

type Result<T> = std::result::Result<T, VerifierError>;

pub struct Verifier {
    config: Arc<ReceiverConfig>,
    zones: Arc<ZonesState>,
    pin_path: PathBuf,
}

/// Compare two rrset collections as text-form record maps; counts land
/// in the same five classes the map check reports.
pub fn compare_snapshots(src: &ZoneSnapshot, dst: &ZoneSnapshot) -> VerifyResult {
    let id = "(verifier) (snapshots)";

    let mut result = VerifyResult::default();

    let mut srcp: HashMap<String, &DnsRecord> = HashMap::new();
    for rrset in src.rrsets.values() {
        for rec in rrset {
            result.total += 1;
            srcp.insert(rec.to_string(), rec);
        }
    }

    let mut dstp: HashMap<String, &DnsRecord> = HashMap::new();
    for rrset in dst.rrsets.values() {
        for rec in rrset {
            result.verified += 1;
            dstp.insert(rec.to_string(), rec);
        }
    }

    for (text, rec) in &srcp {
        if !dstp.contains_key(text) {
            result.missed += 1;
            log::debug!("{} missed on dst {}", id, rec);
        }
    }

    for (text, rec) in &dstp {
        if !srcp.contains_key(text) {
            result.unexpected += 1;
            log::debug!("{} unexpected on dst {}", id, rec);
        }
    }

    log::debug!("{} verifier result {}", id, result);

    result
}

impl Verifier {
    pub fn new(config: Arc<ReceiverConfig>, zones: Arc<ZonesState>, pin_path: PathBuf) -> Verifier {
        Verifier {
            config,
            zones,
            pin_path,
        }
    }

    /// Merge every zone's current rrsets and diff the result against the
    /// kernel maps. Unless `dryrun`, a detected delta is translated into
    /// an IXFR style action log and replayed to repair the drift.
    pub fn verify_map_pass(&self, dryrun: bool) -> Result<VerifyResult> {
        let id = "(verifier) (verify)";
        let t0 = Instant::now();

        log::debug!("{} request to verify snapshots and bpf maps", id);

        let merged = self.zones.merged_snapshot();
        log::debug!("{} total rrsets:'{}' merged", id, merged.rrsets.len());

        let mut maps = AnswerMaps::open_pinned(&self.pin_path)?;
        let (result, changed) = merged.verify_map(&mut maps)?;

        crate::metrics::observe_verify(&result);

        if changed.created + changed.removed > 0 {
            let actions = changed.as_actions();
            let r = merged.sync_map(TransferMode::Ixfr, Some(&actions), &mut maps, dryrun)?;
            log::debug!("{} ixfr sync map '{}'", id, r);
        }

        log::debug!("{} result {}", id, result);
        log::debug!("{} finished in '{:?}'", id, t0.elapsed());

        Ok(result)
    }

    /// For every AXFR zone, transfer a fresh copy from its primary and
    /// compare it to the persisted blob.
    pub fn verify_blob_pass(&self) -> Result<VerifyResult> {
        let id = "(verifier) (verify) (blob)";
        let t0 = Instant::now();

        let mut verify = VerifyResult::default();

        let snapshots_dir = PathBuf::from(&self.config.options.snapshots.directory);

        for (zone, config) in self.config.zone_configs() {
            if !config.enabled || config.zone_type != "axfr" || config.primary.is_empty() {
                continue;
            }

            let server = self.config.resolve_primary(&config.primary[0]);

            let options = TransferOptions {
                mode: Some(TransferMode::Axfr),
                key: if config.key.is_empty() {
                    None
                } else {
                    Some(config.key.clone())
                },
                ..TransferOptions::default()
            };

            let records = client::transfer(&server, &zone, &options)?;
            log::debug!("{} transferred zone:'{}' rrset:'{}'", id, zone, records.len());

            let fresh = ZoneSnapshot::from_records(&zone, &records);

            let blob = ZoneSnapshot::from_blob(&snapshots_dir, &zone, 0)?;
            log::debug!(
                "{} importing snapshot from blob zone:'{}' rrsets:'{}'",
                id,
                zone,
                blob.rrsets.len()
            );

            let result = compare_snapshots(&fresh, &blob);
            verify.merge(&result);
        }

        log::debug!("{} result {}", id, verify);
        log::debug!("{} finished in '{:?}'", id, t0.elapsed());

        Ok(verify)
    }

    fn jittered_interval(&self) -> Duration {
        let base = if self.config.verifier.interval > 0 {
            self.config.verifier.interval
        } else {
            DEFAULT_VERIFIER_INTERVAL.as_secs()
        };
        Duration::from_secs(base + rand::thread_rng().gen_range(0..base.max(1)))
    }

    /// Map check loop on a randomized interval.
    pub fn run_map_loop(&self, shutdown: ShutdownToken) {
        let id = "(verifier) (tick)";

        loop {
            let interval = self.jittered_interval();
            log::debug!("{} next verify pass in '{:?}'", id, interval);

            if shutdown.wait(interval) {
                log::debug!("{} context stop on verifier", id);
                return;
            }

            // reporting pass; repairs only when configured
            match self.verify_map_pass(!self.config.verifier.repair) {
                Ok(result) => log::debug!("{} {}", id, result.as_json()),
                Err(e) => {
                    log::error!("{} error verify snapshots and bpf maps, err:'{}'", id, e)
                }
            }
        }
    }

    /// Blob check loop on its own randomized interval.
    pub fn run_blob_loop(&self, shutdown: ShutdownToken) {
        let id = "(verifier) (blob) (tick)";

        loop {
            let interval = self.jittered_interval();
            log::debug!("{} next blob verify pass in '{:?}'", id, interval);

            if shutdown.wait(interval) {
                log::debug!("{} context stop on blob verifier", id);
                return;
            }

            match self.verify_blob_pass() {
                Ok(result) => log::debug!("{} {}", id, result.as_json()),
                Err(e) => {
                    log::error!("{} error blob verify snapshots, err:'{}'", id, e)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(text: &str) -> ZoneSnapshot {
        ZoneSnapshot::from_text("tt.example.net", text).unwrap()
    }

    const BASE: &str = "\
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 2017041755 900 600 3600000 300
alpha.tt.example.net. 600 IN A 10.0.0.1
beta.tt.example.net. 600 IN A 10.0.0.2
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 2017041755 900 600 3600000 300";

    #[test]
    fn identical_snapshots_compare_clean() {
        let result = compare_snapshots(&snapshot(BASE), &snapshot(BASE));
        assert_eq!(result.total, 2);
        assert_eq!(result.verified, 2);
        assert_eq!(result.missed, 0);
        assert_eq!(result.unexpected, 0);
    }

    #[test]
    fn drifted_blob_shows_missed_and_unexpected() {
        let drifted = BASE.replace("10.0.0.2", "10.0.0.3");
        let result = compare_snapshots(&snapshot(BASE), &snapshot(&drifted));

        // beta with the old address is missing from the blob side, the
        // new address is unexpected there
        assert_eq!(result.missed, 1);
        assert_eq!(result.unexpected, 1);
    }
}
