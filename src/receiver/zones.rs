//! zone state bookkeeping: the snapshot ring, per zone locks and change
//! detection between consecutive snapshots

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{ReceiverConfig, ZoneConfig};
use crate::dns::protocol::DnsRecord;
use crate::receiver::snapshot::{
    blob_filename, file_age, RrKey, Section, SnapshotActions, ZoneSnapshot,
};

/// depth of the per zone snapshot ring
pub const DEFAULT_SNAPSHOT_COUNT: usize = 4;

/// Whether the kernel map is known to reflect a zone's latest snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneHealth {
    Clean,
    Dirty,
}

impl fmt::Display for ZoneHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneHealth::Clean => write!(f, "clean"),
            ZoneHealth::Dirty => write!(f, "dirty"),
        }
    }
}

/// Change detection method between consecutive snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyVia {
    Soa,
    RrsetData,
}

impl DirtyVia {
    pub fn from_config(value: &str) -> DirtyVia {
        match value {
            "rrsets+data" => DirtyVia::RrsetData,
            _ => DirtyVia::Soa,
        }
    }
}

/// Direction of one entry in a changed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Create,
    Remove,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Create => write!(f, "CREATE"),
            Change::Remove => write!(f, "REMOVE"),
        }
    }
}

/// Diff between two record sets, also produced by the verifier against
/// the kernel map. Translates into an IXFR style action log (removes
/// first, then creates, all in one group) for incremental repair.
#[derive(Debug, Clone, Default)]
pub struct ChangedSet {
    pub age: i64,
    pub removes: Vec<(RrKey, DnsRecord)>,
    pub creates: Vec<(RrKey, DnsRecord)>,
    pub created: usize,
    pub removed: usize,
}

impl ChangedSet {
    pub fn create(&mut self, key: RrKey, rec: DnsRecord) {
        self.creates.push((key, rec));
        self.created += 1;
    }

    pub fn remove(&mut self, key: RrKey, rec: DnsRecord) {
        self.removes.push((key, rec));
        self.removed += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.removes.is_empty()
    }

    pub fn as_actions(&self) -> SnapshotActions {
        let mut actions = SnapshotActions::default();
        for (key, rec) in &self.removes {
            actions.add(0, Section::Deletion, key.clone(), rec.clone());
        }
        for (key, rec) in &self.creates {
            actions.add(0, Section::Addition, key.clone(), rec.clone());
        }
        actions
    }

    pub fn dump(&self, tag: &str) {
        let id = format!("(dump) {}", tag);
        log::debug!("{} age:'{}'", id, self.age);

        for (key, rec) in &self.removes {
            log::debug!("{} {} k:'{}' {}", id, Change::Remove, key, rec);
        }
        for (key, rec) in &self.creates {
            log::debug!("{} {} k:'{}' {}", id, Change::Create, key, rec);
        }
    }
}

/// Whether two rrsets coincide as text-form sets.
fn rrsets_equal(rrset1: &[DnsRecord], rrset2: &[DnsRecord]) -> bool {
    if rrset1.len() != rrset2.len() {
        return false;
    }

    let collect = |rrset: &[DnsRecord]| -> std::collections::HashSet<String> {
        rrset.iter().map(|rec| rec.to_string()).collect()
    };

    collect(rrset1) == collect(rrset2)
}

/// Diff two snapshots: keys leaving `from` become removes, keys arriving
/// in `to` become creates, keys present in both with differing rrsets
/// become a remove+create pair.
pub fn detect_changed_state(from: &ZoneSnapshot, to: &ZoneSnapshot) -> ChangedSet {
    let mut changed = ChangedSet {
        age: (from.timestamp - to.timestamp).num_seconds(),
        ..ChangedSet::default()
    };

    for (key, rrset) in &from.rrsets {
        match to.rrsets.get(key) {
            None => {
                for rec in rrset {
                    changed.removes.push((key.clone(), rec.clone()));
                }
                changed.removed += 1;
            }
            Some(other) => {
                if rrsets_equal(rrset, other) {
                    continue;
                }
                for rec in rrset {
                    changed.removes.push((key.clone(), rec.clone()));
                }
                for rec in other {
                    changed.creates.push((key.clone(), rec.clone()));
                }
                changed.removed += 1;
                changed.created += 1;
            }
        }
    }

    for (key, rrset) in &to.rrsets {
        if !from.rrsets.contains_key(key) {
            for rec in rrset {
                changed.creates.push((key.clone(), rec.clone()));
            }
            changed.created += 1;
        }
    }

    changed
}

/// State of one zone: its configuration, a bounded ring of snapshots and
/// the clean/dirty flag the cooker resets.
#[derive(Debug)]
pub struct ZoneState {
    pub zone: String,
    pub config: ZoneConfig,

    pub snapshots: HashMap<usize, ZoneSnapshot>,
    pub snapshot_count: usize,

    /// index into the ring, -1 while no snapshot was imported yet
    pub snapshot_id: isize,

    pub state: ZoneHealth,
}

impl ZoneState {
    pub fn new(zone: &str, config: ZoneConfig) -> ZoneState {
        ZoneState {
            zone: zone.to_string(),
            config,
            snapshots: HashMap::new(),
            snapshot_count: DEFAULT_SNAPSHOT_COUNT,
            snapshot_id: -1,
            state: ZoneHealth::Dirty,
        }
    }

    pub fn current(&self) -> Option<&ZoneSnapshot> {
        if self.snapshot_id < 0 {
            return None;
        }
        self.snapshots.get(&(self.snapshot_id as usize))
    }

    pub fn current_mut(&mut self) -> Option<&mut ZoneSnapshot> {
        if self.snapshot_id < 0 {
            return None;
        }
        self.snapshots.get_mut(&(self.snapshot_id as usize))
    }

    /// Store a freshly imported snapshot, advancing the ring index.
    pub fn advance(&mut self, snapshot: ZoneSnapshot) {
        self.snapshot_id = (self.snapshot_id + 1) % self.snapshot_count as isize;
        self.snapshots.insert(self.snapshot_id as usize, snapshot);
    }

    /// Recompute the clean/dirty flag for a newly arrived snapshot.
    /// Dirty is sticky: only a successful cook resets it, so a zone that
    /// went dirty once stays dirty however similar later imports look.
    pub fn detect_state(&self, snapshot: &ZoneSnapshot, via: DirtyVia) -> ZoneHealth {
        let id = "(state) (detect)";

        let current = match self.current() {
            Some(current) => current,
            None => return ZoneHealth::Dirty,
        };

        let mut state = ZoneHealth::Dirty;

        match via {
            DirtyVia::Soa => {
                let s1 = current.serial();
                let s2 = snapshot.serial();
                if s1 == s2 {
                    state = ZoneHealth::Clean;
                }
                if self.state == ZoneHealth::Dirty {
                    state = ZoneHealth::Dirty;
                }

                log::debug!(
                    "{} zone:'{}' mode:'soa' ID:'{}' serials:'{}' -> '{}' {}",
                    id,
                    self.zone,
                    self.snapshot_id,
                    s1,
                    s2,
                    state.to_string().to_uppercase()
                );
            }
            DirtyVia::RrsetData => {
                let changed = detect_changed_state(current, snapshot);
                changed.dump(&self.zone);

                if changed.created == 0 && changed.removed == 0 {
                    state = ZoneHealth::Clean;
                }
                if self.state == ZoneHealth::Dirty {
                    state = ZoneHealth::Dirty;
                }

                log::debug!(
                    "{} zone:'{}' mode:'rrsets+data' ID:'{}' changes created:'{}' removed:'{}' {}",
                    id,
                    self.zone,
                    self.snapshot_id,
                    changed.created,
                    changed.removed,
                    state.to_string().to_uppercase()
                );
            }
        }

        state
    }
}

/// All zone states plus their locks. The outer lock guards insertion
/// only; each zone's inner mutex guards every mutation of its state and
/// of the kernel maps for its records during a cook.
#[derive(Default)]
pub struct ZonesState {
    zones: RwLock<HashMap<String, Arc<Mutex<ZoneState>>>>,
}

impl ZonesState {
    pub fn new() -> ZonesState {
        ZonesState::default()
    }

    pub fn get(&self, zone: &str) -> Option<Arc<Mutex<ZoneState>>> {
        self.zones.read().get(zone).cloned()
    }

    pub fn contains(&self, zone: &str) -> bool {
        self.zones.read().contains_key(zone)
    }

    /// Fetch the state of a zone, creating an empty dirty one on first
    /// sight.
    pub fn ensure(&self, zone: &str, config: &ZoneConfig) -> Arc<Mutex<ZoneState>> {
        if let Some(state) = self.get(zone) {
            return state;
        }

        let mut zones = self.zones.write();
        zones
            .entry(zone.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ZoneState::new(zone, config.clone()))))
            .clone()
    }

    pub fn entries(&self) -> Vec<(String, Arc<Mutex<ZoneState>>)> {
        self.zones
            .read()
            .iter()
            .map(|(zone, state)| (zone.clone(), state.clone()))
            .collect()
    }

    /// Clone of a zone's latest snapshot, if one was imported.
    pub fn last_snapshot(&self, zone: &str) -> Option<ZoneSnapshot> {
        let state = self.get(zone)?;
        let state = state.lock();
        state.current().cloned()
    }

    /// Merge every zone's current rrsets into one synthetic snapshot,
    /// the shape both the bulk cook and the map verifier consume.
    pub fn merged_snapshot(&self) -> ZoneSnapshot {
        let mut merged = ZoneSnapshot::empty("");

        for (zone, state) in self.entries() {
            let state = state.lock();
            let current = match state.current() {
                Some(current) => current,
                None => continue,
            };

            for (key, rrset) in &current.rrsets {
                merged
                    .rrsets
                    .entry(key.clone())
                    .or_default()
                    .extend(rrset.iter().cloned());
            }

            log::debug!(
                "(zones) (merge) z:'{}' rrsets:'{}' merged",
                zone,
                current.rrsets.len()
            );
        }

        merged
    }

    /// Dirty when any zone is dirty.
    pub fn aggregate_state(&self) -> ZoneHealth {
        let id = "(zones) (state)";
        let mut state = ZoneHealth::Clean;

        for (zone, zone_state) in self.entries() {
            if zone_state.lock().state == ZoneHealth::Dirty {
                state = ZoneHealth::Dirty;
                log::debug!("{} zone:'{}' detected as state:'DIRTY'", id, zone);
            }
        }

        state
    }
}

/// min/max/avg age of the persisted blobs across enabled zones; the
/// watcher turns the max into the stale-snapshot alarm.
#[derive(Debug, Clone, Copy, Default, serde_derive::Serialize)]
pub struct SnapshotsFilesState {
    pub max: i64,
    pub min: i64,
    pub avg: i64,
    pub count: i64,
}

pub fn snapshots_files_state(config: &ReceiverConfig) -> SnapshotsFilesState {
    let mut state = SnapshotsFilesState {
        max: -1,
        min: i64::MAX,
        ..SnapshotsFilesState::default()
    };

    let dir = std::path::Path::new(&config.options.snapshots.directory);

    for (zone, zone_config) in config.zone_configs() {
        if !zone_config.enabled {
            continue;
        }

        let age = file_age(&blob_filename(dir, &zone)) as i64;
        state.min = state.min.min(age);
        state.max = state.max.max(age);
        state.avg += age;
        state.count += 1;
    }

    if state.count > 0 {
        state.avg /= state.count;
    } else {
        state.min = 0;
        state.max = 0;
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::QueryType;

    fn snapshot_with_serial(serial: u32) -> ZoneSnapshot {
        let text = format!(
            "\
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. {} 900 600 3600000 300
alpha.tt.example.net. 600 IN A 10.0.0.1
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. {} 900 600 3600000 300",
            serial, serial
        );
        ZoneSnapshot::from_text("tt.example.net", &text).unwrap()
    }

    #[test]
    fn ring_advances_modulo_count() {
        let mut state = ZoneState::new("tt.example.net", ZoneConfig::default());
        assert_eq!(state.snapshot_id, -1);
        assert!(state.current().is_none());

        for i in 0..6 {
            state.advance(snapshot_with_serial(2017041750 + i));
        }

        // six imports into a ring of four wrap to index one
        assert_eq!(state.snapshot_id, 1);
        assert_eq!(state.snapshots.len(), DEFAULT_SNAPSHOT_COUNT);
        assert_eq!(state.current().unwrap().serial(), 2017041755);
    }

    #[test]
    fn dirty_via_soa_and_stickiness() {
        let mut state = ZoneState::new("tt.example.net", ZoneConfig::default());
        state.advance(snapshot_with_serial(2017041755));

        // same serial while dirty stays dirty
        let same = snapshot_with_serial(2017041755);
        assert_eq!(state.detect_state(&same, DirtyVia::Soa), ZoneHealth::Dirty);

        // only a cook flips the flag; simulate one
        state.state = ZoneHealth::Clean;
        assert_eq!(state.detect_state(&same, DirtyVia::Soa), ZoneHealth::Clean);

        let bumped = snapshot_with_serial(2017041756);
        assert_eq!(state.detect_state(&bumped, DirtyVia::Soa), ZoneHealth::Dirty);
    }

    #[test]
    fn dirty_via_rrsets_detects_content_changes() {
        let mut state = ZoneState::new("tt.example.net", ZoneConfig::default());
        state.advance(snapshot_with_serial(2017041755));
        state.state = ZoneHealth::Clean;

        let same = snapshot_with_serial(2017041755);
        assert_eq!(
            state.detect_state(&same, DirtyVia::RrsetData),
            ZoneHealth::Clean
        );

        let mut changed = snapshot_with_serial(2017041755);
        changed.rrsets.clear();
        assert_eq!(
            state.detect_state(&changed, DirtyVia::RrsetData),
            ZoneHealth::Dirty
        );
    }

    #[test]
    fn changed_state_produces_remove_and_create_pairs() {
        let from = ZoneSnapshot::from_text(
            "tt.example.net",
            "\
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 1 900 600 3600000 300
gone.tt.example.net. 600 IN A 10.0.0.1
kept.tt.example.net. 600 IN A 10.0.0.2
moved.tt.example.net. 600 IN A 10.0.0.3
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 1 900 600 3600000 300",
        )
        .unwrap();

        let to = ZoneSnapshot::from_text(
            "tt.example.net",
            "\
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 2 900 600 3600000 300
kept.tt.example.net. 600 IN A 10.0.0.2
moved.tt.example.net. 600 IN A 10.0.0.4
fresh.tt.example.net. 600 IN A 10.0.0.5
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 2 900 600 3600000 300",
        )
        .unwrap();

        let changed = detect_changed_state(&from, &to);

        // gone + moved removed, moved + fresh created
        assert_eq!(changed.removed, 2);
        assert_eq!(changed.created, 2);

        let actions = changed.as_actions();
        assert_eq!(actions.log.len(), 4);
        // removes precede creates in the replay
        assert_eq!(actions.log[0].section, Section::Deletion);
        assert_eq!(actions.log[3].section, Section::Addition);
    }

    #[test]
    fn merged_snapshot_stacks_zones() {
        let zones = ZonesState::new();

        let state1 = zones.ensure("tt.example.net", &ZoneConfig::default());
        state1.lock().advance(snapshot_with_serial(1));

        let other = ZoneSnapshot::from_text(
            "uu.example.net",
            "\
uu.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 1 900 600 3600000 300
beta.uu.example.net. 600 IN A 10.0.1.1
uu.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 1 900 600 3600000 300",
        )
        .unwrap();
        let state2 = zones.ensure("uu.example.net", &ZoneConfig::default());
        state2.lock().advance(other);

        let merged = zones.merged_snapshot();
        assert_eq!(merged.rrsets.len(), 2);
        assert!(merged.rrsets.contains_key(&RrKey {
            name: "alpha.tt.example.net".to_string(),
            qtype: QueryType::A,
        }));
        assert!(merged.rrsets.contains_key(&RrKey {
            name: "beta.uu.example.net".to_string(),
            qtype: QueryType::A,
        }));
    }
}
