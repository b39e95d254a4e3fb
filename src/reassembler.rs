//! Event reassembler (receiver side)
//!
//! - listens on a power-of-two block of UDP ports the balancer sprays over
//! - stitches fragments back into events, tolerant of loss, duplication
//!   and reordering
//! - hands completed events to the caller through a bounded queue
//! - optional background thread reports queue state to the control plane

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{
    bounded, select, tick, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ReassemblerFlags;
use crate::control::{port_range_for_sources, LbControlClient};
use crate::controller::PidController;
use crate::stats::{RecvCounters, RecvStats};
use crate::uri::EjfatUri;
use crate::wire::Fragment;
use crate::{Error, Result};

/// Nap between polling passes once every socket has come up empty
const RECV_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Most datagrams drained from one socket before its siblings get a turn
const RECV_SOCKET_BATCH: usize = 64;

/// (data id, event number) names one event across all ports.
type EventKey = (u16, u64);

/// One fully reassembled event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledEvent {
    pub payload: Bytes,
    pub event_number: u64,
    pub data_id: u16,
}

/// An event abandoned before all of its fragments arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostEvent {
    pub event_number: u64,
    pub data_id: u16,
}

/// Disjoint byte ranges seen so far for one event. Tracks exact coverage so
/// duplicated and overlapping fragments never double-count.
#[derive(Debug, Default)]
struct Coverage {
    /// Sorted, disjoint half-open ranges
    spans: Vec<(u32, u32)>,
    covered: usize,
}

impl Coverage {
    /// Record the range `[start, end)`. Returns how many bytes were new.
    fn add(&mut self, start: u32, end: u32) -> usize {
        if end <= start {
            return 0;
        }
        let mut merged = (start, end);
        let mut overlap = 0u64;
        self.spans.retain(|&(s, e)| {
            if s > merged.1 || e < merged.0 {
                true
            } else {
                let lo = s.max(start);
                let hi = e.min(end);
                if hi > lo {
                    overlap += (hi - lo) as u64;
                }
                merged.0 = merged.0.min(s);
                merged.1 = merged.1.max(e);
                false
            }
        });
        let pos = self.spans.partition_point(|&(s, _)| s < merged.0);
        self.spans.insert(pos, merged);

        let gained = (end - start) as usize - overlap as usize;
        self.covered += gained;
        gained
    }

    fn covered(&self) -> usize {
        self.covered
    }
}

/// In-progress event.
#[derive(Debug)]
struct ReassemblyBuffer {
    data: BytesMut,
    total: u32,
    coverage: Coverage,
    first_seen: Instant,
}

impl ReassemblyBuffer {
    fn new(total: u32, now: Instant) -> Self {
        let mut data = BytesMut::new();
        data.resize(total as usize, 0);
        Self {
            data,
            total,
            coverage: Coverage::default(),
            first_seen: now,
        }
    }
}

/// State shared by every receive thread and the sweep thread.
struct RecvCore {
    buffers: DashMap<EventKey, ReassemblyBuffer>,
    /// Events already delivered or declared lost; late fragments for these
    /// keys must not open a fresh buffer
    retired: DashMap<EventKey, Instant>,
    completed_tx: Sender<ReassembledEvent>,
    lost_tx: Sender<LostEvent>,
    counters: RecvCounters,
    with_lb_header: bool,
    event_timeout: Duration,
    queue_capacity: usize,
}

impl RecvCore {
    fn new(
        completed_tx: Sender<ReassembledEvent>,
        lost_tx: Sender<LostEvent>,
        with_lb_header: bool,
        event_timeout: Duration,
        queue_capacity: usize,
    ) -> Self {
        Self {
            buffers: DashMap::new(),
            retired: DashMap::new(),
            completed_tx,
            lost_tx,
            counters: RecvCounters::default(),
            with_lb_header,
            event_timeout,
            queue_capacity,
        }
    }

    /// Fold one received datagram into its event. Malformed or inconsistent
    /// datagrams are counted and dropped without disturbing the event.
    fn handle_datagram(&self, buf: &[u8]) {
        let frag = match Fragment::decode(buf, self.with_lb_header) {
            Ok(frag) => frag,
            Err(e) => {
                self.counters.record_data_err();
                debug!("dropping undecodable datagram: {}", e);
                return;
            }
        };

        let key: EventKey = (frag.data_id, frag.event_number);
        if self.retired.contains_key(&key) {
            // straggler for an event already delivered or written off
            return;
        }

        let mut buffer = match self.buffers.entry(key) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                // completion and expiry retire the key before its entry
                // unlocks, so a fragment that raced past the check above
                // lands here instead of reopening the event
                if self.retired.contains_key(&key) {
                    return;
                }
                entry.insert(ReassemblyBuffer::new(frag.total_length, Instant::now()))
            }
        };

        if buffer.total != frag.total_length {
            let expected = buffer.total;
            drop(buffer);
            self.counters.record_data_err();
            debug!(
                "event {} length conflict: fragment claims {}, buffer holds {}",
                frag.event_number, frag.total_length, expected
            );
            return;
        }

        let start = frag.offset;
        let end = match start.checked_add(frag.payload.len() as u32) {
            Some(end) if end <= buffer.total => end,
            _ => {
                drop(buffer);
                self.counters.record_data_err();
                debug!(
                    "event {} fragment at {} overruns declared length",
                    frag.event_number, start
                );
                return;
            }
        };

        buffer.coverage.add(start, end);
        buffer.data[start as usize..end as usize].copy_from_slice(&frag.payload);

        if buffer.coverage.covered() as u32 == buffer.total {
            // retire while the entry is still locked; the buffer stays whole
            // so a duplicate observing the same completion writes harmlessly
            self.retired.insert(key, Instant::now());
            drop(buffer);
            // when two threads see the event complete, the remove picks the
            // one that delivers
            if let Some((_, done)) = self.buffers.remove(&key) {
                let event = ReassembledEvent {
                    payload: done.data.freeze(),
                    event_number: frag.event_number,
                    data_id: frag.data_id,
                };
                match self.completed_tx.try_send(event) {
                    Ok(()) => self.counters.record_event_success(),
                    Err(TrySendError::Full(_)) => {
                        self.counters.record_enqueue_loss();
                        warn!(
                            "completed queue full, dropping event {}",
                            frag.event_number
                        );
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
        }
    }

    /// Expire partial events older than the timeout and prune the retired
    /// set once stragglers can no longer arrive.
    fn scan(&self, now: Instant) {
        let mut expired: Vec<EventKey> = Vec::new();
        for entry in self.buffers.iter() {
            if now.duration_since(entry.value().first_seen) >= self.event_timeout {
                expired.push(*entry.key());
            }
        }

        for key in expired {
            // retire first; a fragment that finds the entry gone then sees
            // the retired key instead of room for a fresh buffer. A completion
            // racing this sweep empties the entry and the remove stays quiet.
            self.retired.insert(key, now);
            if let Some((_, buffer)) = self.buffers.remove(&key) {
                self.counters.record_event_timeout();
                debug!(
                    "event {} from stream {} timed out with {}/{} bytes",
                    key.1,
                    key.0,
                    buffer.coverage.covered(),
                    buffer.total
                );
                // the lost queue is advisory; a full queue just drops notice
                let _ = self.lost_tx.try_send(LostEvent {
                    event_number: key.1,
                    data_id: key.0,
                });
            }
        }

        let horizon = self.event_timeout * 2;
        self.retired
            .retain(|_, retired_at| now.duration_since(*retired_at) < horizon);
    }
}

/// Receiver-side engine. Construct, optionally
/// [`register_worker`](Self::register_worker), then
/// [`open_and_start`](Self::open_and_start) and drain events with
/// [`receive`](Self::receive) or [`poll`](Self::poll).
pub struct Reassembler {
    flags: ReassemblerFlags,
    ip: IpAddr,
    start_port: u16,
    port_range: u8,
    num_threads: usize,
    cores: Option<Vec<usize>>,

    core: Arc<RecvCore>,
    completed_rx: Receiver<ReassembledEvent>,
    lost_rx: Receiver<LostEvent>,
    cp: Option<Arc<Mutex<LbControlClient>>>,
    running: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    report_stop_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
    opened: bool,
    closed: bool,
}

impl Reassembler {
    /// Listen on `ip` starting at `start_port` with `num_threads` receive
    /// threads. The port block size comes from the flags, or from the
    /// thread count when the flags leave it negative.
    pub fn new(
        uri: EjfatUri,
        ip: IpAddr,
        start_port: u16,
        num_threads: usize,
        flags: ReassemblerFlags,
    ) -> Result<Self> {
        Self::build(uri, ip, start_port, num_threads.max(1), None, flags)
    }

    /// Like [`new`](Self::new), with one receive thread pinned to each of
    /// the given CPU cores.
    pub fn with_cores(
        uri: EjfatUri,
        ip: IpAddr,
        start_port: u16,
        cores: Vec<usize>,
        flags: ReassemblerFlags,
    ) -> Result<Self> {
        if cores.is_empty() {
            return Err(Error::Config("core list is empty".into()));
        }
        let count = cores.len();
        Self::build(uri, ip, start_port, count, Some(cores), flags)
    }

    fn build(
        uri: EjfatUri,
        ip: IpAddr,
        start_port: u16,
        num_threads: usize,
        cores: Option<Vec<usize>>,
        flags: ReassemblerFlags,
    ) -> Result<Self> {
        flags.validate()?;

        let port_range = if flags.port_range >= 0 {
            flags.port_range as u8
        } else {
            port_range_for_sources(num_threads) as u8
        };
        let port_count = 1usize << port_range;

        let last_port = start_port as u32 + port_count as u32 - 1;
        if last_port > u16::MAX as u32 {
            return Err(Error::Config(format!(
                "{} ports from {} run past the end of the port space",
                port_count, start_port
            )));
        }

        let num_threads = if num_threads > port_count {
            warn!(
                "clamping {} receive threads to the {} available ports",
                num_threads, port_count
            );
            port_count
        } else {
            num_threads
        };

        let (completed_tx, completed_rx) = bounded(flags.event_queue_size);
        let (lost_tx, lost_rx) = bounded(flags.event_queue_size);
        let core = Arc::new(RecvCore::new(
            completed_tx,
            lost_tx,
            flags.with_lb_header,
            Duration::from_millis(flags.event_timeout_ms),
            flags.event_queue_size,
        ));

        let cp = if flags.use_cp {
            let client = LbControlClient::with_options(
                uri,
                flags.validate_cert,
                Duration::from_secs(10),
            )?;
            Some(Arc::new(Mutex::new(client)))
        } else {
            None
        };

        Ok(Self {
            flags,
            ip,
            start_port,
            port_range,
            num_threads,
            cores,
            core,
            completed_rx,
            lost_rx,
            cp,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            report_stop_tx: None,
            threads: Vec::new(),
            opened: false,
            closed: false,
        })
    }

    /// Bind every listening port and start the receive and sweep threads.
    /// Any port failing to bind aborts the whole start.
    pub fn open_and_start(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.opened {
            return Err(Error::Config("reassembler is already started".into()));
        }

        // bind everything first so a port clash fails before threads exist
        let port_count = 1usize << self.port_range;
        let mut per_thread: Vec<Vec<UdpSocket>> =
            (0..self.num_threads).map(|_| Vec::new()).collect();
        for i in 0..port_count {
            let addr = SocketAddr::new(self.ip, self.start_port + i as u16);
            let socket = bind_recv_socket(addr, self.flags.rcv_socket_buf_size)?;
            per_thread[i % self.num_threads].push(socket);
        }

        self.running.store(true, Ordering::SeqCst);
        for (idx, sockets) in per_thread.into_iter().enumerate() {
            let core = self.core.clone();
            let running = self.running.clone();
            let pin = self.cores.as_ref().and_then(|c| c.get(idx).copied());
            let handle = std::thread::Builder::new()
                .name(format!("ejfat-recv-{}", idx))
                .spawn(move || {
                    if let Some(core_id) = pin {
                        pin_current_thread(core_id);
                    }
                    recv_loop(core, running, sockets);
                })?;
            self.threads.push(handle);
        }

        self.start_sweep_thread()?;
        self.opened = true;

        info!(
            "reassembler listening on {} ports from {}:{} across {} threads",
            port_count, self.ip, self.start_port, self.num_threads
        );
        Ok(())
    }

    /// Sweep thread: periodically expires partial events.
    fn start_sweep_thread(&mut self) -> Result<()> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        self.stop_tx = Some(stop_tx);

        let core = self.core.clone();
        let period = (core.event_timeout / 2).max(Duration::from_millis(5));
        let handle = std::thread::Builder::new()
            .name("ejfat-sweep".into())
            .spawn(move || {
                let ticker = tick(period);
                loop {
                    select! {
                        recv(ticker) -> _ => core.scan(Instant::now()),
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;
        self.threads.push(handle);
        Ok(())
    }

    /// Join the balancer's worker pool under `node_name` and start the
    /// periodic state report thread.
    pub fn register_worker(&mut self, node_name: &str) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        let cp = self.require_cp()?;
        cp.lock().register(
            node_name,
            self.ip,
            self.start_port,
            self.flags.weight,
            1usize << self.port_range,
            self.flags.min_factor,
            self.flags.max_factor,
        )?;
        self.start_reporting_thread(cp)
    }

    /// Leave the worker pool. The state report thread stops first so the
    /// dying session sees no more traffic.
    pub fn deregister_worker(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        let cp = self.require_cp()?;
        self.report_stop_tx = None;
        cp.lock().deregister()?;
        Ok(())
    }

    fn require_cp(&self) -> Result<Arc<Mutex<LbControlClient>>> {
        self.cp
            .clone()
            .ok_or_else(|| Error::Config("control plane use is disabled by flags".into()))
    }

    /// Report thread: once per period, sample queue fill, run the PID
    /// controller and ship the state to the control plane.
    fn start_reporting_thread(&mut self, cp: Arc<Mutex<LbControlClient>>) -> Result<()> {
        if self.report_stop_tx.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        self.report_stop_tx = Some(stop_tx);

        let core = self.core.clone();
        let mut pid = PidController::new(
            self.flags.kp,
            self.flags.ki,
            self.flags.kd,
            self.flags.set_point,
            self.flags.epoch_ms,
        );
        let period = Duration::from_millis(self.flags.period_ms);
        let handle = std::thread::Builder::new()
            .name("ejfat-report".into())
            .spawn(move || {
                let ticker = tick(period);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let fill =
                                core.completed_tx.len() as f64 / core.queue_capacity as f64;
                            let signal = pid.sample(fill, Instant::now());
                            let ready = !core.completed_tx.is_full();
                            if let Err(e) = cp.lock().send_state(fill, signal, ready) {
                                core.counters.record_cp_err();
                                debug!("state report failed: {}", e);
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;
        self.threads.push(handle);
        Ok(())
    }

    /// Take a completed event if one is ready.
    pub fn poll(&self) -> Result<Option<ReassembledEvent>> {
        if self.closed {
            return Err(Error::Closed);
        }
        match self.completed_rx.try_recv() {
            Ok(ev) => Ok(Some(ev)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Closed),
        }
    }

    /// Wait up to `timeout_ms` for a completed event; zero waits forever.
    pub fn receive(&self, timeout_ms: u64) -> Result<Option<ReassembledEvent>> {
        if self.closed {
            return Err(Error::Closed);
        }
        if timeout_ms == 0 {
            return match self.completed_rx.recv() {
                Ok(ev) => Ok(Some(ev)),
                Err(_) => Err(Error::Closed),
            };
        }
        match self.completed_rx.recv_timeout(Duration::from_millis(timeout_ms)) {
            Ok(ev) => Ok(Some(ev)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Closed),
        }
    }

    /// Take a loss notice if one is ready.
    pub fn poll_lost_event(&self) -> Result<Option<LostEvent>> {
        if self.closed {
            return Err(Error::Closed);
        }
        match self.lost_rx.try_recv() {
            Ok(lost) => Ok(Some(lost)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Closed),
        }
    }

    pub fn stats(&self) -> RecvStats {
        self.core.counters.snapshot()
    }

    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    /// Inclusive range of listening ports.
    pub fn recv_ports(&self) -> (u16, u16) {
        (
            self.start_port,
            self.start_port + (self.port_count() - 1) as u16,
        )
    }

    /// log2 of the number of listening ports.
    pub fn port_range(&self) -> u8 {
        self.port_range
    }

    pub fn port_count(&self) -> usize {
        1usize << self.port_range
    }

    pub fn num_recv_threads(&self) -> usize {
        self.num_threads
    }

    /// Stop every thread. Events still in the completed queue are dropped
    /// with the engine; stats stay readable. Does not deregister, so a
    /// registered caller should do that first.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.running.store(false, Ordering::SeqCst);
        self.report_stop_tx = None;
        self.stop_tx = None;
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("reassembler thread panicked");
            }
        }

        info!("reassembler closed: {}", self.core.counters.snapshot().summary());
    }
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drain each socket in turn, folding datagrams into the shared core, until
/// the stop flag drops. Sockets are nonblocking; a pass that finds nothing
/// naps briefly, keeping idle threads cheap and shutdown prompt.
fn recv_loop(core: Arc<RecvCore>, running: Arc<AtomicBool>, sockets: Vec<UdpSocket>) {
    let mut buf = vec![0u8; 65535];
    while running.load(Ordering::SeqCst) {
        let mut received = 0usize;
        for socket in &sockets {
            // the per-socket cap keeps one flooded port from starving its
            // siblings on this thread
            for _ in 0..RECV_SOCKET_BATCH {
                match socket.recv(&mut buf) {
                    Ok(len) => {
                        received += 1;
                        core.handle_datagram(&buf[..len]);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        core.counters.record_socket_error(&e);
                        warn!("receive failed: {}", e);
                        break;
                    }
                }
            }
        }
        if received == 0 {
            std::thread::sleep(RECV_IDLE_SLEEP);
        }
    }
}

/// Best effort CPU pinning; a bad core id just leaves the thread floating.
fn pin_current_thread(core_id: usize) {
    let ids = core_affinity::get_core_ids().unwrap_or_default();
    match ids.into_iter().find(|c| c.id == core_id) {
        Some(id) => {
            let _ = core_affinity::set_for_current(id);
        }
        None => warn!("core {} does not exist, leaving thread unpinned", core_id),
    }
}

fn bind_recv_socket(addr: SocketAddr, buf_size: usize) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if buf_size > 0 {
        socket.set_recv_buffer_size(buf_size)?;
    }
    socket.bind(&addr.into())?;

    let socket: UdpSocket = socket.into();
    socket.set_nonblocking(true)?;
    Ok(socket)
}
