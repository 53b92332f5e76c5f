//! collects runtime and datapath metrics and turns threshold rules into
//! runtime-config writes, e.g. forcing dry-run on stale snapshots

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};
use parking_lot::Mutex;

use crate::config::{ReceiverConfig, Rule};
use crate::offload::maps::{
    CounterArray, RuntimeConfigMap, METRICS_PACKETS_ERROR, METRICS_PACKETS_PASS,
    METRICS_PACKETS_RX, METRICS_PACKETS_TX, METRICS_TIME_CNT, METRICS_TIME_MAX, METRICS_TIME_MIN,
    METRICS_TIME_SUM, RUNTIME_CONFIG_DRYRUN,
};
use crate::receiver::zones::snapshots_files_state;
use crate::shutdown::ShutdownToken;

pub const DEFAULT_WATCHER_INTERVAL: u64 = 17;
pub const DEFAULT_COLLECTOR_INTERVAL: u64 = 10;

// metric ids, also the keys rules are written against
pub const METRICS_RUNTIME_THREADS: &str = "runtime-threads";
pub const METRICS_RUNTIME_RSS: &str = "runtime-mem-rss";

pub const METRICS_COOKER_SNAPSHOTS_AGE_MIN: &str = "cooker-snapshotsage-min";
pub const METRICS_COOKER_SNAPSHOTS_AGE_MAX: &str = "cooker-snapshotsage-max";
pub const METRICS_COOKER_SNAPSHOTS_AGE_AVG: &str = "cooker-snapshotsage-avg";
pub const METRICS_COOKER_SNAPSHOTS_COUNT: &str = "cooker-snapshots-count";

pub const METRICS_BPF_PACKETS_RX: &str = "bpf-packetsrx";
pub const METRICS_BPF_PACKETS_TX: &str = "bpf-packetstx";
pub const METRICS_BPF_PACKETS_PASS: &str = "bpf-packetspass";
pub const METRICS_BPF_PACKETS_ERROR: &str = "bpf-packetserror";

pub const METRICS_BPF_TIME_MIN: &str = "bpf-timemin";
pub const METRICS_BPF_TIME_MAX: &str = "bpf-timemax";
pub const METRICS_BPF_TIME_AVG: &str = "bpf-timeavg";
pub const METRICS_BPF_TIME_CNT: &str = "bpf-timecnt";

pub const METRICS_BPF_TIME_HISTOGRAM: &str = "bpf-timehistogram";

#[derive(Debug, Display, From, Error)]
pub enum WatcherError {
    Map(crate::offload::maps::MapError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, WatcherError>;

/// Time ordered sample store, metric id to (timestamp ns -> values).
/// Readers copy out under the lock; the garbage collector keeps the
/// last K samples per id.
#[derive(Default)]
pub struct MetricsStore {
    metrics: Mutex<HashMap<String, BTreeMap<i64, Vec<i64>>>>,
}

impl MetricsStore {
    pub fn new() -> MetricsStore {
        MetricsStore::default()
    }

    pub fn push_metric(&self, id: &str, values: Vec<i64>) {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        self.metrics
            .lock()
            .entry(id.to_string())
            .or_default()
            .insert(now, values);
    }

    pub fn push_int(&self, id: &str, value: i64) {
        self.push_metric(id, vec![value]);
    }

    pub fn push_metrics(&self, metrics: HashMap<String, i64>) {
        for (id, value) in metrics {
            self.push_int(&id, value);
        }
    }

    /// Latest sample of every metric id.
    pub fn last_metrics(&self) -> HashMap<String, Vec<i64>> {
        let metrics = self.metrics.lock();

        let mut out = HashMap::new();
        for (id, times) in metrics.iter() {
            if let Some((_, values)) = times.iter().next_back() {
                out.insert(id.clone(), values.clone());
            }
        }
        out
    }

    /// First value of every sample of one metric, newest first.
    pub fn last_metric(&self, id: &str) -> Vec<i64> {
        let metrics = self.metrics.lock();

        let mut out = Vec::new();
        if let Some(times) = metrics.get(id) {
            for (_, values) in times.iter().rev() {
                if let Some(first) = values.first() {
                    out.push(*first);
                }
            }
        }
        out
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string_pretty(&self.last_metrics()).unwrap_or_default()
    }

    /// Drop everything but the newest `keep` samples per metric.
    pub fn garbage(&self, keep: usize) {
        let id = "(monitor) (metrics) (garbage)";
        let mut metrics = self.metrics.lock();

        for (mid, times) in metrics.iter_mut() {
            while times.len() > keep {
                if let Some(oldest) = times.keys().next().copied() {
                    times.remove(&oldest);
                    log::debug!("{} REMOVE t:'{}' '{}'", id, oldest, mid);
                }
            }
        }
    }

    pub fn dump(&self, n: usize) {
        let id = "(monitor) (metrics) (dump)";
        let metrics = self.metrics.lock();

        for (mid, times) in metrics.iter() {
            for (i, (t, values)) in times.iter().rev().take(n).enumerate() {
                log::debug!("{} [{}] t:'{}' {} values:'{:?}'", id, i, t, mid, values);
            }
        }
    }
}

/// Rule edges; within the band nothing happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    On,
    Off,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::On => write!(f, "ON"),
            Stage::Off => write!(f, "OFF"),
        }
    }
}

/// Threshold evaluation: above `higher` arms the rule, below `lower`
/// disarms it, anything in between leaves the state alone.
pub fn evaluate_rule(rule: &Rule, value: i64) -> Option<Stage> {
    if value > rule.higher {
        return Some(Stage::On);
    }
    if value < rule.lower {
        return Some(Stage::Off);
    }
    None
}

/// Whether an edge actually requires a write, given the current dry-run
/// slot value. Writes happen only when the slot disagrees.
pub fn dryrun_needs_toggle(stage: Stage, dryrun: u32) -> bool {
    match stage {
        Stage::On => dryrun == 0,
        Stage::Off => dryrun == 1,
    }
}

/// Collector kinds the scheduler runs at independent intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collector {
    BpfMetrics,
    BpfHistograms,
    RuntimeMetrics,
    Garbage,
    Dumper,
}

impl std::fmt::Display for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Collector::BpfMetrics => "bpf+metrics",
            Collector::BpfHistograms => "bpf+histograms",
            Collector::RuntimeMetrics => "runtime+metrics",
            Collector::Garbage => "garbage-collector",
            Collector::Dumper => "dumper",
        };
        write!(f, "{}", name)
    }
}

pub struct Watcher {
    config: Arc<ReceiverConfig>,
    pin_path: PathBuf,
    store: Arc<MetricsStore>,
}

impl Watcher {
    pub fn new(config: Arc<ReceiverConfig>, pin_path: PathBuf) -> Watcher {
        Watcher {
            config,
            pin_path,
            store: Arc::new(MetricsStore::new()),
        }
    }

    pub fn store(&self) -> Arc<MetricsStore> {
        self.store.clone()
    }

    /// Spawn the collector threads and the rule checking loop; returns
    /// the join handles so the caller owns the task tree.
    pub fn start(self: Arc<Self>, shutdown: ShutdownToken) -> Vec<std::thread::JoinHandle<()>> {
        let id = "(monitor) (worker)";
        let mut handles = Vec::new();

        if self.config.monitor.collector.enabled {
            let collectors = [
                Collector::RuntimeMetrics,
                Collector::Garbage,
                Collector::Dumper,
                Collector::BpfMetrics,
                Collector::BpfHistograms,
            ];

            log::debug!("{} running {} monitor workers", id, collectors.len());

            for collector in collectors {
                let watcher = self.clone();
                let shutdown = shutdown.clone();
                if let Ok(handle) = std::thread::Builder::new()
                    .name(format!("collector-{}", collector))
                    .spawn(move || watcher.collector_loop(collector, shutdown))
                {
                    handles.push(handle);
                }
            }
        }

        if self.config.monitor.watcher.enabled {
            let watcher = self.clone();
            let shutdown = shutdown.clone();
            if let Ok(handle) = std::thread::Builder::new()
                .name("watcher".to_string())
                .spawn(move || watcher.watcher_loop(shutdown))
            {
                handles.push(handle);
            }
        }

        handles
    }

    fn collector_interval(&self, collector: Collector) -> u64 {
        let config = &self.config.monitor.collector;
        let interval = match collector {
            Collector::BpfMetrics => config.bpf.intervals.metrics,
            Collector::BpfHistograms => config.bpf.intervals.histograms,
            Collector::RuntimeMetrics => config.runtime.intervals.metrics,
            Collector::Garbage => config.garbage_collector.interval,
            Collector::Dumper => config.dump_interval,
        };
        if interval > 0 {
            interval
        } else {
            DEFAULT_COLLECTOR_INTERVAL
        }
    }

    fn collector_loop(&self, collector: Collector, shutdown: ShutdownToken) {
        let id = format!("(monitor) (collector) ({})", collector);
        let interval = Duration::from_secs(self.collector_interval(collector));

        log::debug!("{} started monitor worker", id);

        let mut counter = 0usize;
        loop {
            if shutdown.wait(interval) {
                log::debug!("{} context stop on worker", id);
                return;
            }
            counter += 1;

            if self.config.monitor.collector.verbose {
                log::debug!("{} [{}] time to collect metrics", id, counter);
            }

            let outcome = match collector {
                Collector::RuntimeMetrics => self.collect_runtime_metrics(),
                Collector::BpfMetrics => self.collect_bpf_metrics(),
                Collector::BpfHistograms => self.collect_bpf_histograms(),
                Collector::Garbage => {
                    self.store
                        .garbage(self.config.monitor.collector.garbage_collector.keep);
                    Ok(())
                }
                Collector::Dumper => {
                    self.store.dump(1);
                    Ok(())
                }
            };

            if let Err(e) = outcome {
                log::error!("{} error collecting metrics, err:'{}'", id, e);
            }
        }
    }

    fn collect_runtime_metrics(&self) -> Result<()> {
        let mut metrics = HashMap::new();

        let (threads, rss_kb) = read_proc_self();
        metrics.insert(METRICS_RUNTIME_THREADS.to_string(), threads);
        metrics.insert(METRICS_RUNTIME_RSS.to_string(), rss_kb);

        let ages = snapshots_files_state(&self.config);
        metrics.insert(METRICS_COOKER_SNAPSHOTS_AGE_MIN.to_string(), ages.min);
        metrics.insert(METRICS_COOKER_SNAPSHOTS_AGE_MAX.to_string(), ages.max);
        metrics.insert(METRICS_COOKER_SNAPSHOTS_AGE_AVG.to_string(), ages.avg);
        metrics.insert(METRICS_COOKER_SNAPSHOTS_COUNT.to_string(), ages.count);

        self.store.push_metrics(metrics);
        Ok(())
    }

    fn collect_bpf_metrics(&self) -> Result<()> {
        let mut counters = CounterArray::open_metrics(&self.pin_path)?;
        let values = counters.read_all()?;

        // interval counters normalize to per second rates
        let interval = self.collector_interval(Collector::BpfMetrics).max(1);

        let mut metrics = HashMap::new();
        metrics.insert(
            METRICS_BPF_PACKETS_RX.to_string(),
            (values[METRICS_PACKETS_RX as usize] / interval) as i64,
        );
        metrics.insert(
            METRICS_BPF_PACKETS_TX.to_string(),
            (values[METRICS_PACKETS_TX as usize] / interval) as i64,
        );
        metrics.insert(
            METRICS_BPF_PACKETS_PASS.to_string(),
            (values[METRICS_PACKETS_PASS as usize] / interval) as i64,
        );
        metrics.insert(
            METRICS_BPF_PACKETS_ERROR.to_string(),
            (values[METRICS_PACKETS_ERROR as usize] / interval) as i64,
        );

        metrics.insert(
            METRICS_BPF_TIME_MIN.to_string(),
            values[METRICS_TIME_MIN as usize] as i64,
        );
        metrics.insert(
            METRICS_BPF_TIME_MAX.to_string(),
            values[METRICS_TIME_MAX as usize] as i64,
        );
        metrics.insert(
            METRICS_BPF_TIME_CNT.to_string(),
            values[METRICS_TIME_CNT as usize] as i64,
        );
        if values[METRICS_TIME_CNT as usize] > 0 {
            metrics.insert(
                METRICS_BPF_TIME_AVG.to_string(),
                (values[METRICS_TIME_SUM as usize] / values[METRICS_TIME_CNT as usize]) as i64,
            );
        }

        self.store.push_metrics(metrics);

        if self.config.monitor.collector.bpf.intervals.zero {
            counters.zero_all()?;
        }

        Ok(())
    }

    fn collect_bpf_histograms(&self) -> Result<()> {
        let mut histogram = CounterArray::open_perf(&self.pin_path)?;
        let values = histogram.read_all()?;

        self.store.push_metric(
            METRICS_BPF_TIME_HISTOGRAM,
            values.iter().map(|v| *v as i64).collect(),
        );

        if self.config.monitor.collector.bpf.intervals.zero {
            histogram.zero_all()?;
        }

        Ok(())
    }

    fn watcher_loop(&self, shutdown: ShutdownToken) {
        let id = "(watcher)";

        let interval = if self.config.monitor.watcher.interval > 0 {
            self.config.monitor.watcher.interval
        } else {
            DEFAULT_WATCHER_INTERVAL
        };
        let interval = Duration::from_secs(interval);

        log::debug!("{} starting watcher", id);

        loop {
            if shutdown.wait(interval) {
                log::debug!("{} context stop on watcher", id);
                return;
            }

            if let Err(e) = self.check_rules() {
                log::error!("{} error checking rules, err:'{}'", id, e);
            }
        }
    }

    /// Evaluate every configured rule against its metric's latest value
    /// and apply the rule's action on edges. Actions dispatch through a
    /// table keyed by rule id; rules without an applier only log.
    pub fn check_rules(&self) -> Result<()> {
        let id = "(watcher)";

        let runtime = RuntimeConfigMap::open_pinned(&self.pin_path)?;
        let dryrun = runtime.read_slot(RUNTIME_CONFIG_DRYRUN)?;

        for (rid, rule) in &self.config.monitor.watcher.rules {
            let values = self.store.last_metric(rid);
            let value = match values.first() {
                Some(value) => *value,
                None => continue,
            };

            let stage = match evaluate_rule(rule, value) {
                Some(stage) => stage,
                None => continue,
            };

            log::debug!(
                "{} (CHECK) id:'{}' higher:'{}' lower:'{}' vs '{}' (last of '{}') as ['{}'] to '{}' dryrun:'{}'",
                id,
                rid,
                rule.higher,
                rule.lower,
                value,
                values.len(),
                rule.actions.join(","),
                stage,
                dryrun
            );

            match rid.as_str() {
                METRICS_COOKER_SNAPSHOTS_AGE_MAX => {
                    if !dryrun_needs_toggle(stage, dryrun) {
                        continue;
                    }

                    let target = stage == Stage::On;
                    let mut runtime = RuntimeConfigMap::open_pinned(&self.pin_path)?;
                    runtime.write_slot(RUNTIME_CONFIG_DRYRUN, target as u32)?;

                    log::debug!(
                        "{} (APPLY) id:'{}' '{}' -> dryrun:'{}'",
                        id,
                        rid,
                        stage,
                        target
                    );
                }
                other => {
                    log::debug!("{} rule id:'{}' has no applier, edge noted", id, other);
                }
            }
        }

        Ok(())
    }
}

/// Thread count and resident memory of this process, from /proc.
fn read_proc_self() -> (i64, i64) {
    let mut threads = 0;
    let mut rss_kb = 0;

    if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("Threads:") {
                threads = rest.trim().parse().unwrap_or(0);
            }
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                rss_kb = rest
                    .trim()
                    .trim_end_matches(" kB")
                    .trim()
                    .parse()
                    .unwrap_or(0);
            }
        }
    }

    (threads, rss_kb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_keeps_latest_and_garbage_collects() {
        let store = MetricsStore::new();

        for i in 0..20 {
            store.push_int("cooker-snapshotsage-max", i);
        }

        let latest = store.last_metric("cooker-snapshotsage-max");
        assert_eq!(latest.first(), Some(&19));
        assert_eq!(latest.len(), 20);

        store.garbage(5);
        assert_eq!(store.last_metric("cooker-snapshotsage-max").len(), 5);
        // newest samples survive
        assert_eq!(
            store.last_metric("cooker-snapshotsage-max").first(),
            Some(&19)
        );
    }

    #[test]
    fn rule_edges() {
        let rule = Rule {
            higher: 1800,
            lower: 600,
            actions: vec!["dryrun".to_string()],
        };

        // stale snapshots force the datapath into dry-run
        assert_eq!(evaluate_rule(&rule, 7200), Some(Stage::On));
        // recovered age releases it
        assert_eq!(evaluate_rule(&rule, 300), Some(Stage::Off));
        // in-band values cause no transition
        assert_eq!(evaluate_rule(&rule, 1000), None);
        assert_eq!(evaluate_rule(&rule, 1800), None);
        assert_eq!(evaluate_rule(&rule, 600), None);
    }

    #[test]
    fn dryrun_writes_only_on_disagreement() {
        assert!(dryrun_needs_toggle(Stage::On, 0));
        assert!(!dryrun_needs_toggle(Stage::On, 1));
        assert!(dryrun_needs_toggle(Stage::Off, 1));
        assert!(!dryrun_needs_toggle(Stage::Off, 0));
    }

    #[test]
    fn proc_self_is_readable() {
        let (threads, _) = read_proc_self();
        assert!(threads >= 1);
    }
}
