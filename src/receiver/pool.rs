//! bounded worker pool executing zone transfer jobs

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::{ReceiverConfig, ZoneConfig};
use crate::dns::client::TransferMode;
use crate::dns::protocol::DnsRecord;
use crate::receiver::importer::{ImportOptions, Importer, SnapshotMemory};
use crate::receiver::zones::ZonesState;
use crate::shutdown::ShutdownToken;

/// default worker count when the configuration stays silent
pub const DEFAULT_TRANSFER_WORKERS: usize = 5;

/// One unit of work: transfer a zone via its configured primaries and
/// fold the result into the shared state.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: i64,
    pub zone: String,
    pub config: ZoneConfig,
    pub mode: TransferMode,
    pub soa: Option<DnsRecord>,
}

impl TransferJob {
    fn describe(&self) -> String {
        format!("id:'{}' zone:'{}' mode:'{}'", self.id, self.zone, self.mode)
    }
}

/// Outcome reported back on the results channel; the dispatcher only
/// logs, per-job failures never terminate the pool.
#[derive(Debug)]
pub struct TransferResult {
    pub id: i64,
    pub zone: String,
    pub error: Option<String>,
    pub processed_ms: i64,
}

pub struct TransferPool {
    jobs: SyncSender<TransferJob>,
    workers: Vec<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

fn next_job_id() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

impl TransferPool {
    /// Spawn `count` workers plus a dispatcher draining their results.
    /// Jobs flow through a channel bounded to the pool size, so at most
    /// `count` transfers are in flight and a few more are queued.
    pub fn start(
        config: Arc<ReceiverConfig>,
        zones: Arc<ZonesState>,
        shutdown: ShutdownToken,
        count: usize,
    ) -> TransferPool {
        let id = "(collector) (pool)";

        let count = if count == 0 {
            DEFAULT_TRANSFER_WORKERS
        } else {
            count
        };
        log::debug!("{} starting, workers count:'{}'", id, count);

        let (jobs_tx, jobs_rx) = sync_channel::<TransferJob>(count);
        let (results_tx, results_rx) = sync_channel::<TransferResult>(count);

        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let jobs_rx = jobs_rx.clone();
            let results_tx = results_tx.clone();
            let config = config.clone();
            let zones = zones.clone();
            let shutdown = shutdown.clone();

            let handle = std::thread::Builder::new()
                .name(format!("transfer-worker-{}", index))
                .spawn(move || {
                    worker_loop(index, config, zones, shutdown, jobs_rx, results_tx);
                })
                .unwrap_or_else(|e| panic!("failed to spawn transfer worker: {}", e));
            workers.push(handle);
        }
        drop(results_tx);

        let dispatcher = std::thread::Builder::new()
            .name("transfer-results".to_string())
            .spawn(move || {
                dispatcher_loop(results_rx);
            })
            .ok();

        TransferPool {
            jobs: jobs_tx,
            workers,
            dispatcher,
        }
    }

    /// Queue a transfer. A full queue drops the job; the next scheduled
    /// tick simply requests it again.
    pub fn submit(&self, zone: &str, config: &ZoneConfig, mode: TransferMode, soa: Option<DnsRecord>) {
        let id = "(collector) (job)";

        let job = TransferJob {
            id: next_job_id(),
            zone: zone.to_string(),
            config: config.clone(),
            mode,
            soa,
        };

        log::debug!("{} push job {}", id, job.describe());

        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                log::debug!("{} queue full, dropping job {}", id, job.describe());
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("{} pool is gone, job discarded", id);
            }
        }
    }

    /// Close the job channel and join every worker; called on shutdown
    /// after the token has been triggered.
    pub fn stop(self) {
        drop(self.jobs);
        for handle in self.workers {
            let _ = handle.join();
        }
        if let Some(dispatcher) = self.dispatcher {
            let _ = dispatcher.join();
        }
    }
}

fn worker_loop(
    index: usize,
    config: Arc<ReceiverConfig>,
    zones: Arc<ZonesState>,
    shutdown: ShutdownToken,
    jobs: Arc<Mutex<Receiver<TransferJob>>>,
    results: SyncSender<TransferResult>,
) {
    let id = "(collector) (worker)";

    loop {
        if shutdown.is_shutdown() {
            log::debug!("{} stopped worker on index '{}'", id, index);
            return;
        }

        let job = {
            let guard = jobs.lock();
            match guard.recv_timeout(std::time::Duration::from_millis(500)) {
                Ok(job) => job,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    log::debug!("{} job channel closed on index '{}'", id, index);
                    return;
                }
            }
        };

        let result = execute(index, &config, &zones, job);
        if results.send(result).is_err() {
            return;
        }
    }
}

fn execute(
    index: usize,
    config: &Arc<ReceiverConfig>,
    zones: &Arc<ZonesState>,
    job: TransferJob,
) -> TransferResult {
    let id = "(collector) (job)";
    let t0 = Instant::now();

    let importer = Importer::new(config.clone());

    let mut error = None;

    for primary in &job.config.primary {
        log::debug!(
            "{} worker:'{}' importing zone:'{}' via primary:'{}'",
            id,
            index,
            job.zone,
            primary
        );

        let server = config.resolve_primary(primary);

        let options = ImportOptions {
            incremental: config.options.incremental,
            server,
            key: job.config.key.clone(),
            memory: SnapshotMemory::Empty,
        };

        if let Err(e) = importer.update_zone_state(zones, &job.zone, &job.config, &options) {
            log::error!(
                "{} error updating snapshot zone:'{}' via primary:'{}', err:'{}'",
                id,
                job.zone,
                primary,
                e
            );
            error = Some(e.to_string());
            break;
        }
    }

    let processed_ms = t0.elapsed().as_millis() as i64;

    crate::metrics::observe_zone_transfer(&job.zone, processed_ms);

    log::debug!(
        "{} worker:'{}' executed job {} in '{}' ms",
        id,
        index,
        job.describe(),
        processed_ms
    );

    TransferResult {
        id: job.id,
        zone: job.zone,
        error,
        processed_ms,
    }
}

fn dispatcher_loop(results: Receiver<TransferResult>) {
    let id = "(receiver) (pool)";

    // drains until every worker has dropped its sender
    for result in results.iter() {
        match result.error {
            Some(ref error) => {
                log::error!("{} job id:'{}' failed, err:'{}'", id, result.id, error);
            }
            None => {
                log::debug!(
                    "{} job id:'{}' zone:'{}' processed OK, time:'{}'",
                    id,
                    result.id,
                    result.zone,
                    result.processed_ms
                );
            }
        }
    }

    log::debug!("{} results channel drained", id);
}
