//! NOTIFY listener: acknowledges zone change notifications and hands
//! them to a small pool that transfers and cooks the zone immediately

use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::ReceiverConfig;
use crate::dns::buffer::BytePacketBuffer;
use crate::dns::client::{self, TransferMode, TransferOptions};
use crate::dns::protocol::{DnsPacket, DnsRecord, Opcode, QueryType, ResultCode};
use crate::receiver::cooker::Cooker;
use crate::receiver::snapshot::{ImportActions, ZoneSnapshot};
use crate::receiver::zones::{ZoneHealth, ZonesState};
use crate::shutdown::ShutdownToken;

/// default number of notify cooker workers
pub const DEFAULT_NOTIFY_COOKERS: usize = 2;

#[derive(Debug, Display, From, Error)]
pub enum NotifierError {
    Io(std::io::Error),
    Client(crate::dns::client::ClientError),
    Snapshot(crate::receiver::snapshot::SnapshotError),
    Cooker(crate::receiver::cooker::CookerError),
    #[display(fmt = "listen definition:'{}' is not correct", _0)]
    #[from(ignore)]
    BadListen(#[error(not(source))] String),
    #[display(fmt = "zone:'{}' memory snapshot missed", _0)]
    #[from(ignore)]
    NoSnapshot(#[error(not(source))] String),
    #[display(
        fmt = "zone:'{}' notify aborted as serial:'{}' less or equal snapshot memory:'{}'",
        zone, notified, current
    )]
    StaleSerial {
        zone: String,
        notified: u32,
        current: u32,
    },
    #[display(fmt = "zone:'{}' does not have primary defined", _0)]
    #[from(ignore)]
    NoPrimary(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, NotifierError>;

/// A matched NOTIFY: which zone and which serial the primary announced.
/// Serial zero means the message carried no answer SOA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedNotify {
    pub zone: String,
    pub serial: u32,
}

/// Extract (zone, serial) from a NOTIFY request against the set of known
/// zones. Anything else is answered REFUSED by the caller.
pub fn match_request(packet: &DnsPacket, zones: &ZonesState) -> Option<MatchedNotify> {
    if Opcode::from_num(packet.header.opcode) != Opcode::Notify || packet.questions.is_empty() {
        return None;
    }

    if let Some(DnsRecord::Soa { domain, serial, .. }) = packet.answers.first() {
        let zone = domain.trim_end_matches('.').to_lowercase();
        if zones.contains(&zone) {
            return Some(MatchedNotify {
                zone,
                serial: *serial,
            });
        }
        return None;
    }

    let question = packet.questions.first()?;
    if question.qtype != QueryType::Soa {
        return None;
    }
    let zone = question.name.trim_end_matches('.').to_lowercase();
    if zones.contains(&zone) {
        return Some(MatchedNotify { zone, serial: 0 });
    }

    None
}

/// Whether a notified serial advances the zone; stale or repeated
/// notifications are rejected to prevent regression. Serial zero is a
/// bare question-section NOTIFY and always triggers a probe.
pub fn serial_advances(notified: u32, current: u32) -> bool {
    notified == 0 || notified > current
}

#[derive(Debug, Clone)]
struct NotifyJob {
    id: i64,
    zone: String,
    serial: u32,
}

struct NotifyResult {
    id: i64,
    zone: String,
    error: Option<String>,
    processed_ms: i64,
}

/// The notify side of the receiver: UDP listeners plus the cooker pool.
pub struct Notifier {
    config: Arc<ReceiverConfig>,
    zones: Arc<ZonesState>,
    pin_path: PathBuf,
    shutdown: ShutdownToken,

    // listeners on several threads share the sender
    jobs: Mutex<SyncSender<NotifyJob>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Notifier {
    pub fn start(
        config: Arc<ReceiverConfig>,
        zones: Arc<ZonesState>,
        pin_path: PathBuf,
        shutdown: ShutdownToken,
    ) -> Result<Arc<Notifier>> {
        let id = "(notifier) (worker)";

        let notify = &config.axfr_transfer.notify;

        let workers = if notify.cookers.workers == 0 {
            DEFAULT_NOTIFY_COOKERS
        } else {
            notify.cookers.workers
        };

        let (jobs_tx, jobs_rx) = sync_channel::<NotifyJob>(workers);
        let (results_tx, results_rx) = sync_channel::<NotifyResult>(workers);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let notifier = Arc::new(Notifier {
            config: config.clone(),
            zones: zones.clone(),
            pin_path,
            shutdown: shutdown.clone(),
            jobs: Mutex::new(jobs_tx),
            handles: Mutex::new(Vec::new()),
        });

        log::debug!("{} request to start notify cooker workers:'{}'", id, workers);

        for index in 0..workers {
            let worker = notifier.clone();
            let jobs_rx = jobs_rx.clone();
            let results_tx = results_tx.clone();

            let handle = std::thread::Builder::new()
                .name(format!("notify-cooker-{}", index))
                .spawn(move || worker.cooker_worker(index, jobs_rx, results_tx))?;
            notifier.handles.lock().push(handle);
        }
        drop(results_tx);

        let drain = std::thread::Builder::new()
            .name("notify-results".to_string())
            .spawn(move || {
                let id = "(notifier) (cooker workers)";
                for result in results_rx.iter() {
                    match result.error {
                        Some(ref error) => {
                            log::error!("{} job id:'{}' failed, err:'{}'", id, result.id, error)
                        }
                        None => log::debug!(
                            "{} job id:'{}' zone:'{}' processed OK, time:'{}'",
                            id,
                            result.id,
                            result.zone,
                            result.processed_ms
                        ),
                    }
                }
            })?;
        notifier.handles.lock().push(drain);

        // one listener thread per (address, worker); more than one worker
        // per address requires SO_REUSEPORT
        let reuseport = notify.workers > 1;
        for listen in &notify.listen {
            let addr = parse_listen(listen)?;

            for worker in 0..notify.workers.max(1) {
                let listener = notifier.clone();
                let socket = bind_udp(addr, reuseport)?;

                log::debug!(
                    "{} l:'{}' addr:'{}' worker:'{}' reuseport:'{}'",
                    id,
                    listen,
                    addr,
                    worker,
                    reuseport
                );

                let handle = std::thread::Builder::new()
                    .name(format!("notify-listen-{}-{}", addr.port(), worker))
                    .spawn(move || listener.listener(socket))?;
                notifier.handles.lock().push(handle);
            }
        }

        Ok(notifier)
    }

    /// Join every listener and worker; the shutdown token must already
    /// be triggered so the loops drain.
    pub fn stop(&self) {
        let id = "(notifier) (stop)";
        log::debug!("{} request to stop all notifier listeners", id);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn listener(&self, socket: UdpSocket) {
        let id = "(notifier) (dns)";

        loop {
            if self.shutdown.is_shutdown() {
                log::debug!("{} notify worker stopped", id);
                return;
            }

            let mut res_buffer = BytePacketBuffer::new();
            let (len, source) = match socket.recv_from(&mut res_buffer.buf) {
                Ok(received) => received,
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("{} error receiving datagram, err:'{}'", id, e);
                    continue;
                }
            };

            if len == 0 {
                continue;
            }

            let request = match DnsPacket::from_buffer(&mut res_buffer) {
                Ok(packet) => packet,
                Err(e) => {
                    log::debug!("{} failed to parse request from '{}': {}", id, source, e);
                    continue;
                }
            };

            self.handle(&socket, source, request);
        }
    }

    fn handle(&self, socket: &UdpSocket, source: SocketAddr, request: DnsPacket) {
        let id = "(notifier) (handler)";

        let matched = match_request(&request, &self.zones);

        let mut reply = DnsPacket::new();
        reply.header.id = request.header.id;
        reply.header.response = true;
        reply.header.opcode = request.header.opcode;
        reply.header.authoritative_answer = true;
        reply.header.recursion_available = true;
        reply.header.rescode = if matched.is_some() {
            ResultCode::NOERROR
        } else {
            ResultCode::REFUSED
        };
        reply.questions = request.questions.clone();

        if let Some(ref matched) = matched {
            log::debug!(
                "{} request from:'{}' matched as soa zone:'{}' serial:'{}': OK",
                id,
                source,
                matched.zone,
                matched.serial
            );
        }

        let mut res_buffer = BytePacketBuffer::new();
        if let Err(e) = reply.write(&mut res_buffer, 512) {
            log::debug!("{} error writing reply, err:'{}'", id, e);
            return;
        }
        if let Err(e) = socket.send_to(&res_buffer.buf[0..res_buffer.pos], source) {
            log::debug!("{} error sending reply, err:'{}'", id, e);
        }

        if let Some(matched) = matched {
            crate::metrics::observe_notify(true);
            self.enqueue(matched);
        } else {
            crate::metrics::observe_notify(false);
        }
    }

    fn enqueue(&self, matched: MatchedNotify) {
        let id = "(notifier) (job)";

        let job = NotifyJob {
            id: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            zone: matched.zone,
            serial: matched.serial,
        };

        log::debug!("{} push job zone:'{}' serial:'{}'", id, job.zone, job.serial);

        match self.jobs.lock().try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                log::debug!(
                    "{} queue full, notify for zone:'{}' waits for the next refresh",
                    id,
                    job.zone
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn cooker_worker(
        &self,
        index: usize,
        jobs: Arc<Mutex<Receiver<NotifyJob>>>,
        results: SyncSender<NotifyResult>,
    ) {
        let id = "(notifier) (cooker) (worker)";

        loop {
            if self.shutdown.is_shutdown() {
                log::debug!("{} stopped worker on index '{}'", id, index);
                return;
            }

            let job = {
                let guard = jobs.lock();
                match guard.recv_timeout(Duration::from_millis(500)) {
                    Ok(job) => job,
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
                }
            };

            let t0 = Instant::now();
            let error = self.execute(index, &job).err().map(|e| e.to_string());

            let result = NotifyResult {
                id: job.id,
                zone: job.zone,
                error,
                processed_ms: t0.elapsed().as_millis() as i64,
            };
            if results.send(result).is_err() {
                return;
            }
        }
    }

    /// Process one accepted NOTIFY: under the zone lock, compare serials,
    /// IXFR from the known serial, fold the result into the ring and cook
    /// just this zone into the map.
    fn execute(&self, index: usize, job: &NotifyJob) -> Result<()> {
        let id = "(notifier) (cooker) (job)";

        let state = self
            .zones
            .get(&job.zone)
            .ok_or_else(|| NotifierError::NoSnapshot(job.zone.clone()))?;
        let mut state = state.lock();

        let snapshot = state
            .current()
            .ok_or_else(|| NotifierError::NoSnapshot(job.zone.clone()))?;
        let serial = snapshot.serial();

        log::debug!(
            "{} worker:'{}' zone:'{}' memory soa:'{}' received notify soa:'{}'",
            id,
            index,
            job.zone,
            serial,
            job.serial
        );

        if !serial_advances(job.serial, serial) {
            return Err(NotifierError::StaleSerial {
                zone: job.zone.clone(),
                notified: job.serial,
                current: serial,
            });
        }

        if state.config.primary.is_empty() {
            return Err(NotifierError::NoPrimary(job.zone.clone()));
        }
        let primary = self.config.resolve_primary(&state.config.primary[0]);

        let options = TransferOptions {
            mode: Some(if job.serial > 0 {
                TransferMode::Ixfr
            } else {
                TransferMode::Axfr
            }),
            serial,
            ns: match snapshot.soa {
                Some(DnsRecord::Soa { ref m_name, .. }) => m_name.clone(),
                _ => String::new(),
            },
            mbox: match snapshot.soa {
                Some(DnsRecord::Soa { ref r_name, .. }) => r_name.clone(),
                _ => String::new(),
            },
            key: if state.config.key.is_empty() {
                None
            } else {
                Some(state.config.key.clone())
            },
        };

        log::debug!(
            "{} worker:'{}' requesting ixfr zone:'{}' serial:'{}' via primary:'{}'",
            id,
            index,
            job.zone,
            options.serial,
            primary
        );

        let records = client::transfer(&primary, &job.zone, &options)?;
        log::debug!(
            "{} worker:'{}' transferred zone:'{}' as rrsets:'{}'",
            id,
            index,
            job.zone,
            records.len()
        );

        let mut snapshot = snapshot.clone();
        let (soa, mode, actions) = snapshot.apply_ixfr(&records)?;

        log::debug!(
            "{} worker:'{}' approved zone:'{}' '{}' received soa '{}'",
            id,
            index,
            job.zone,
            mode,
            soa.as_ref().map(|s| s.to_string()).unwrap_or_default()
        );

        let dryrun = self.config.cooker.dryrun;
        let snapshots_dir = PathBuf::from(&self.config.options.snapshots.directory);

        match mode {
            TransferMode::Ixfr => {
                snapshot.soa = soa;
                snapshot.timestamp = chrono::Utc::now();
                if let Some(ref actions) = actions {
                    actions.dump("notifier");
                }
                snapshot.pending = Some(ImportActions {
                    mode: TransferMode::Ixfr,
                    zone: job.zone.clone(),
                    actions,
                });

                state.advance(snapshot);

                // the zone lock is already held, cook it right away
                let cooker = Cooker::new(
                    self.config.clone(),
                    self.zones.clone(),
                    self.pin_path.clone(),
                );
                let result = cooker.cook_increment_locked(&state, dryrun)?;

                log::debug!(
                    "{} ixfr applied update zone:'{}' created:'{}' removed:'{}'",
                    id,
                    job.zone,
                    result.created,
                    result.removed
                );

                let current = state
                    .current_mut()
                    .ok_or_else(|| NotifierError::NoSnapshot(job.zone.clone()))?;
                if let Some(ref mut pending) = current.pending {
                    pending.mode = TransferMode::None;
                    pending.actions = None;
                }

                state.current().unwrap_or_else(|| unreachable!())
                    .write_blob(&snapshots_dir, dryrun)?;
                state.state = ZoneHealth::Clean;
            }
            TransferMode::Axfr => {
                // the primary fell back to a full transfer; store it as a
                // pending bulk import for the next scheduled cook, which
                // replays all zones consistently
                let rebuilt = ZoneSnapshot::from_records(&job.zone, &records);
                snapshot.soa = rebuilt.soa;
                snapshot.timestamp = rebuilt.timestamp;
                snapshot.rrsets = rebuilt.rrsets;
                snapshot.pending = Some(ImportActions {
                    mode: TransferMode::Axfr,
                    zone: job.zone.clone(),
                    actions: None,
                });

                state.advance(snapshot);
                state.state = ZoneHealth::Dirty;

                state.current().unwrap_or_else(|| unreachable!())
                    .write_blob(&snapshots_dir, dryrun)?;
            }
            _ => {
                log::debug!(
                    "{} worker:'{}' zone:'{}' notify produced no changes",
                    id,
                    index,
                    job.zone
                );
            }
        }

        Ok(())
    }
}

fn parse_listen(listen: &str) -> Result<SocketAddr> {
    let addr = listen
        .strip_prefix("udp://")
        .ok_or_else(|| NotifierError::BadListen(listen.to_string()))?;

    addr.parse()
        .map_err(|_| NotifierError::BadListen(listen.to_string()))
}

fn bind_udp(addr: SocketAddr, reuseport: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if reuseport {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneConfig;
    use crate::dns::protocol::{DnsQuestion, TransientTtl};

    fn known_zones() -> ZonesState {
        let zones = ZonesState::new();
        zones.ensure("tt.example.net", &ZoneConfig::default());
        zones
    }

    fn notify_with_answer(zone: &str, serial: u32) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.opcode = Opcode::Notify.to_num();
        packet
            .questions
            .push(DnsQuestion::new(zone.to_string(), QueryType::Soa));
        packet.answers.push(DnsRecord::Soa {
            domain: zone.to_string(),
            m_name: "ns3.example.net".to_string(),
            r_name: "sysadmin.example.net".to_string(),
            serial,
            refresh: 900,
            retry: 600,
            expire: 3600000,
            minimum: 300,
            ttl: TransientTtl(600),
        });
        packet
    }

    #[test]
    fn match_notify_with_answer_soa() {
        let zones = known_zones();
        let packet = notify_with_answer("tt.example.net", 2017041756);

        let matched = match_request(&packet, &zones).unwrap();
        assert_eq!(matched.zone, "tt.example.net");
        assert_eq!(matched.serial, 2017041756);
    }

    #[test]
    fn match_notify_question_only_yields_serial_zero() {
        let zones = known_zones();

        let mut packet = DnsPacket::new();
        packet.header.opcode = Opcode::Notify.to_num();
        packet
            .questions
            .push(DnsQuestion::new("tt.example.net".to_string(), QueryType::Soa));

        let matched = match_request(&packet, &zones).unwrap();
        assert_eq!(matched.serial, 0);
    }

    #[test]
    fn unknown_zone_is_not_matched() {
        let zones = known_zones();
        let packet = notify_with_answer("other.example.net", 1);
        assert!(match_request(&packet, &zones).is_none());
    }

    #[test]
    fn query_opcode_is_not_matched() {
        let zones = known_zones();
        let mut packet = notify_with_answer("tt.example.net", 1);
        packet.header.opcode = Opcode::Query.to_num();
        assert!(match_request(&packet, &zones).is_none());
    }

    #[test]
    fn serial_monotonicity() {
        // a notification must advance the serial to be acted upon
        assert!(serial_advances(2017041756, 2017041755));
        assert!(!serial_advances(2017041755, 2017041755));
        assert!(!serial_advances(2017041754, 2017041755));
        // a bare question NOTIFY always probes
        assert!(serial_advances(0, 2017041755));
    }

    #[test]
    fn listen_parsing() {
        assert!(parse_listen("udp://127.0.0.1:5353").is_ok());
        assert!(parse_listen("tcp://127.0.0.1:5353").is_err());
        assert!(parse_listen("127.0.0.1:5353").is_err());
    }
}
