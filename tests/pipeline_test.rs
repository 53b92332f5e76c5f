//! end to end exercises of the snapshot pipeline against the filesystem:
//! zone text in, blob out, IXFR applied, state machine advanced

use std::sync::Arc;

use xdpdns::config::{ReceiverConfig, ReceiverOptions, SnapshotsOptions, ZoneConfig};
use xdpdns::dns::client::{parse_zone_text, TransferMode};
use xdpdns::receiver::importer::{ImportOptions, Importer, SnapshotMemory};
use xdpdns::receiver::snapshot::{blob_filename, ZoneSnapshot};
use xdpdns::receiver::zones::{DirtyVia, ZoneHealth, ZonesState};

const ZONE: &str = "\
tt.example.net.         600     IN      SOA     ns3.example.net. sysadmin.example.net. 2017041755 900 600 3600000 300
tt.example.net.         172801  IN      NS      ns3.example.net.
tt.example.net.         172801  IN      NS      ns4.example.net.
alpha.tt.example.net.   600     IN      A       10.0.0.1
beta.tt.example.net.    600     IN      A       10.0.0.2
alpha-01v.lxd.tt.example.net.   617     IN      AAAA    2a02:6b8:c0e:125:0:433f:1:101
tt.example.net.         600     IN      SOA     ns3.example.net. sysadmin.example.net. 2017041755 900 600 3600000 300";

#[test]
fn cold_import_writes_blob_and_reloads() {
    let dir = tempfile::tempdir().unwrap();

    let snapshot = ZoneSnapshot::from_text("tt.example.net", ZONE).unwrap();
    assert_eq!(snapshot.serial(), 2017041755);

    snapshot.write_blob(dir.path(), false).unwrap();
    let blob = blob_filename(dir.path(), "tt.example.net");
    assert!(blob.exists());

    // SOA opens and closes the file
    let content = std::fs::read_to_string(&blob).unwrap();
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    assert!(lines.first().unwrap().contains("SOA"));
    assert!(lines.last().unwrap().contains("SOA"));

    let reloaded = ZoneSnapshot::from_blob(dir.path(), "tt.example.net", 3600).unwrap();
    assert!(reloaded.equal(&snapshot));
}

#[test]
fn serial_bump_via_ixfr_removes_the_announced_record() {
    let mut snapshot = ZoneSnapshot::from_text("tt.example.net", ZONE).unwrap();

    let ixfr = parse_zone_text(
        "\
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 2017041757 900 600 3600000 300
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 2017041755 900 600 3600000 300
alpha-01v.lxd.tt.example.net. 617 IN AAAA 2a02:6b8:c0e:125:0:433f:1:101
tt.example.net. 600 IN SOA ns3.example.net. sysadmin.example.net. 2017041757 900 600 3600000 300",
    )
    .unwrap();

    let (soa, mode, actions) = snapshot.apply_ixfr(&ixfr).unwrap();
    assert_eq!(mode, TransferMode::Ixfr);
    assert_eq!(actions.unwrap().log.len(), 1);

    // the bracketing SOA becomes the snapshot's new identity
    snapshot.soa = soa;
    assert_eq!(snapshot.serial(), 2017041757);

    let remaining: String = ZONE
        .replace("2017041755", "2017041757")
        .lines()
        .filter(|line| !line.contains("alpha-01v"))
        .collect::<Vec<_>>()
        .join("\n");
    let expected = ZoneSnapshot::from_text("tt.example.net", &remaining).unwrap();
    assert!(snapshot.equal(&expected));
}

#[test]
fn http_reimport_goes_incremental_once_a_blob_exists() {
    let dir = tempfile::tempdir().unwrap();

    let config = Arc::new(ReceiverConfig {
        options: ReceiverOptions {
            incremental: true,
            snapshots: SnapshotsOptions {
                directory: dir.path().display().to_string(),
                ..SnapshotsOptions::default()
            },
        },
        ..ReceiverConfig::default()
    });

    let zone_file = dir.path().join("zone.txt");
    std::fs::write(&zone_file, ZONE).unwrap();

    let importer = Importer::new(config);
    let zones = ZonesState::new();

    let zone_config = ZoneConfig {
        zone_type: "http".to_string(),
        primary: vec![format!("file://{}", zone_file.display())],
        ..ZoneConfig::default()
    };
    let options = ImportOptions {
        incremental: true,
        server: format!("file://{}", zone_file.display()),
        key: String::new(),
        memory: SnapshotMemory::Empty,
    };

    // first import has no blob to diff against: bulk
    importer
        .update_zone_state(&zones, "tt.example.net", &zone_config, &options)
        .unwrap();
    {
        let snapshot = zones.last_snapshot("tt.example.net").unwrap();
        assert_eq!(snapshot.pending.as_ref().unwrap().mode, TransferMode::Axfr);
        snapshot.write_blob(dir.path(), false).unwrap();
    }

    // second import with one record changed diffs against the blob
    std::fs::write(
        &zone_file,
        ZONE.replace("10.0.0.2", "10.0.0.9")
            .replace("2017041755", "2017041756"),
    )
    .unwrap();

    importer
        .update_zone_state(&zones, "tt.example.net", &zone_config, &options)
        .unwrap();

    let snapshot = zones.last_snapshot("tt.example.net").unwrap();
    let pending = snapshot.pending.as_ref().unwrap();
    assert_eq!(pending.mode, TransferMode::Ixfr);

    let actions = pending.actions.as_ref().unwrap();
    // beta changed address: one remove and one create on its key
    assert_eq!(actions.log.len(), 2);
    assert!(actions
        .log
        .iter()
        .all(|action| action.key.name == "beta.tt.example.net"));
}

#[test]
fn state_ring_and_dirtiness_through_reimports() {
    let zones = ZonesState::new();
    let state = zones.ensure("tt.example.net", &ZoneConfig::default());

    let first = ZoneSnapshot::from_text("tt.example.net", ZONE).unwrap();
    {
        let mut state = state.lock();
        assert_eq!(state.snapshot_id, -1);

        let health = state.detect_state(&first, DirtyVia::Soa);
        state.advance(first.clone());
        state.state = health;
        assert_eq!(state.state, ZoneHealth::Dirty);

        // a cook is the only way back to clean
        state.state = ZoneHealth::Clean;
    }

    // unchanged re-import keeps the zone clean
    {
        let mut state = state.lock();
        let health = state.detect_state(&first, DirtyVia::Soa);
        state.advance(first.clone());
        state.state = health;
        assert_eq!(state.state, ZoneHealth::Clean);
        assert_eq!(state.snapshot_id, 1);
    }

    // serial bump dirties the zone again
    let bumped =
        ZoneSnapshot::from_text("tt.example.net", &ZONE.replace("2017041755", "2017041756"))
            .unwrap();
    {
        let mut state = state.lock();
        let health = state.detect_state(&bumped, DirtyVia::Soa);
        state.advance(bumped);
        state.state = health;
        assert_eq!(state.state, ZoneHealth::Dirty);
    }
}
