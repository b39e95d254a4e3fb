//! Event segmenter (sender side)
//!
//! - slices events into MTU-sized datagrams with balancer framing
//! - rotates over several send sockets so the kernel spreads the work
//! - optional background thread advertises the send rate to the balancer

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use crossbeam_channel::{bounded, select, tick, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::config::SegmenterFlags;
use crate::stats::{RateWindow, SendCounters, SendStats, SyncCounters, SyncStats};
use crate::uri::EjfatUri;
use crate::wire::{encode_fragment, event_entropy, header_overhead, max_payload, SyncHeader};
use crate::{Error, Result};

/// One event waiting in the send queue.
struct QueuedEvent {
    payload: Bytes,
    event_number: u64,
    data_id: u16,
    entropy: u16,
}

/// Socket pool shared between the caller and the drain thread.
struct SendCore {
    sockets: Vec<UdpSocket>,
    connected: bool,
    data_addr: SocketAddr,
    max_payload: usize,
    next_socket: AtomicUsize,
    counters: SendCounters,
}

impl SendCore {
    /// Fragment one event and push every datagram out, rotating sockets.
    /// A send failure is counted and the remaining fragments still go out;
    /// the last failure is returned so the caller sees the event as bad.
    fn send_event(
        &self,
        payload: &[u8],
        event_number: u64,
        data_id: u16,
        entropy: u16,
    ) -> Result<()> {
        if payload.len() > u32::MAX as usize {
            return Err(Error::Config(format!(
                "event of {} bytes exceeds the 32-bit length field",
                payload.len()
            )));
        }

        let entropy = event_entropy(entropy);
        let total = payload.len() as u32;
        let mut last_err: Option<std::io::Error> = None;

        for (i, chunk) in payload.chunks(self.max_payload).enumerate() {
            let offset = (i * self.max_payload) as u32;
            let wire = encode_fragment(event_number, data_id, offset, total, entropy, chunk);

            let idx = self.next_socket.fetch_add(1, Ordering::Relaxed) % self.sockets.len();
            let socket = &self.sockets[idx];
            let sent = if self.connected {
                socket.send(&wire)
            } else {
                socket.send_to(&wire, self.data_addr)
            };

            match sent {
                Ok(_) => self.counters.record_datagram(),
                Err(e) => {
                    self.counters.record_error(&e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(Error::Transport(e)),
            None => Ok(()),
        }
    }
}

/// Sender-side engine. Construct, [`open`](Self::open), then push events
/// either synchronously with [`send`](Self::send) or through the bounded
/// queue with [`enqueue`](Self::enqueue).
///
/// Event numbers passed as zero are generated: from the microsecond clock
/// when `usec_as_event_num` is set, from a running counter otherwise. A zero
/// data id falls back to the constructor's, and zero entropy asks for a
/// random value per event.
pub struct Segmenter {
    flags: SegmenterFlags,
    data_id: u16,
    event_src_id: u32,
    uri: EjfatUri,
    max_payload: usize,

    core: Option<Arc<SendCore>>,
    event_counter: AtomicU64,
    last_event: Arc<AtomicU64>,
    events_sent: Arc<AtomicU64>,
    sync_counters: Arc<SyncCounters>,

    queue_tx: Option<Sender<QueuedEvent>>,
    stop_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Segmenter {
    pub fn new(
        uri: EjfatUri,
        data_id: u16,
        event_src_id: u32,
        flags: SegmenterFlags,
    ) -> Result<Self> {
        flags.validate()?;
        let max_payload = max_payload(flags.mtu, header_overhead(flags.dp_v6))?;
        Ok(Self {
            flags,
            data_id,
            event_src_id,
            uri,
            max_payload,
            core: None,
            event_counter: AtomicU64::new(0),
            last_event: Arc::new(AtomicU64::new(0)),
            events_sent: Arc::new(AtomicU64::new(0)),
            sync_counters: Arc::new(SyncCounters::default()),
            queue_tx: None,
            stop_tx: None,
            threads: Vec::new(),
            closed: false,
        })
    }

    /// Bind the send sockets and start the worker threads.
    pub fn open(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.core.is_some() {
            return Err(Error::Config("segmenter is already open".into()));
        }

        let data_addr = self.uri.data_addr(self.flags.dp_v6).ok_or_else(|| {
            let family = if self.flags.dp_v6 { "IPv6" } else { "IPv4" };
            Error::Config(format!("uri has no {} data address", family))
        })?;

        let mut sockets = Vec::with_capacity(self.flags.num_send_sockets);
        for _ in 0..self.flags.num_send_sockets {
            let connect_to = self.flags.connected_socket.then_some(data_addr);
            sockets.push(bind_send_socket(
                data_addr.is_ipv6(),
                self.flags.snd_socket_buf_size,
                connect_to,
            )?);
        }

        let core = Arc::new(SendCore {
            sockets,
            connected: self.flags.connected_socket,
            data_addr,
            max_payload: self.max_payload,
            next_socket: AtomicUsize::new(0),
            counters: SendCounters::default(),
        });
        self.core = Some(core.clone());

        // drain thread: pulls queued events and sends them
        let (queue_tx, queue_rx) = bounded::<QueuedEvent>(self.flags.send_queue_size);
        self.queue_tx = Some(queue_tx);
        let drain_core = core;
        let handle = std::thread::Builder::new()
            .name("ejfat-send".into())
            .spawn(move || {
                while let Ok(ev) = queue_rx.recv() {
                    if let Err(e) =
                        drain_core.send_event(&ev.payload, ev.event_number, ev.data_id, ev.entropy)
                    {
                        debug!("queued event {} failed to send: {}", ev.event_number, e);
                    }
                }
            })?;
        self.threads.push(handle);

        if self.flags.use_cp {
            self.start_sync_thread()?;
        }

        info!(
            "segmenter open towards {} with {} sockets, {} payload bytes per datagram",
            data_addr, self.flags.num_send_sockets, self.max_payload
        );
        Ok(())
    }

    /// Sync thread: once per period, report the smoothed event rate and the
    /// latest event number to the balancer.
    fn start_sync_thread(&mut self) -> Result<()> {
        let sync_addr = self
            .uri
            .sync_addr()
            .ok_or_else(|| Error::Config("uri has no sync address".into()))?;
        let sync_socket = bind_send_socket(sync_addr.is_ipv6(), 0, Some(sync_addr))?;

        let (stop_tx, stop_rx) = bounded::<()>(1);
        self.stop_tx = Some(stop_tx);

        let period = Duration::from_millis(self.flags.sync_period_ms);
        let window_len = self.flags.sync_periods;
        let zero_rate = self.flags.zero_rate;
        let usec_clock = self.flags.usec_as_event_num;
        let src_id = self.event_src_id;
        let last_event = self.last_event.clone();
        let events_sent = self.events_sent.clone();
        let counters = self.sync_counters.clone();

        let handle = std::thread::Builder::new()
            .name("ejfat-sync".into())
            .spawn(move || {
                let ticker = tick(period);
                let mut window = RateWindow::new(window_len);
                let mut prev_total = 0u64;
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let total = events_sent.load(Ordering::Relaxed);
                            window.push(total - prev_total);
                            prev_total = total;

                            let rate = if zero_rate { 0 } else { window.average_hz(period) };
                            let event_number = if usec_clock {
                                usec_now()
                            } else {
                                last_event.load(Ordering::Relaxed)
                            };
                            let sync = SyncHeader {
                                event_src_id: src_id,
                                event_number,
                                avg_rate_hz: rate,
                                unix_time_ns: nanos_now(),
                            };
                            match sync_socket.send(&sync.encode()) {
                                Ok(_) => counters.record_msg(),
                                Err(e) => {
                                    counters.record_error(&e);
                                    warn!("sync send failed: {}", e);
                                }
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;
        self.threads.push(handle);
        Ok(())
    }

    /// Send one event on the caller's thread. Returns the event number used.
    pub fn send(&self, payload: &[u8]) -> Result<u64> {
        self.send_direct(payload, 0, 0, 0)
    }

    /// Send one event with explicit framing fields on the caller's thread.
    pub fn send_direct(
        &self,
        payload: &[u8],
        event_number: u64,
        data_id: u16,
        entropy: u16,
    ) -> Result<u64> {
        let core = self.core()?;
        let event_number = self.resolve_event_number(event_number);
        let data_id = if data_id == 0 { self.data_id } else { data_id };
        core.send_event(payload, event_number, data_id, entropy)?;
        self.note_event(event_number);
        Ok(event_number)
    }

    /// Queue one event for the drain thread, copying the payload. Fails with
    /// [`Error::Backpressure`] when the queue is full.
    pub fn enqueue(
        &self,
        payload: &[u8],
        event_number: u64,
        data_id: u16,
        entropy: u16,
    ) -> Result<u64> {
        self.enqueue_owned(Bytes::copy_from_slice(payload), event_number, data_id, entropy)
    }

    /// Queue one event without copying.
    pub fn enqueue_owned(
        &self,
        payload: Bytes,
        event_number: u64,
        data_id: u16,
        entropy: u16,
    ) -> Result<u64> {
        if self.closed {
            return Err(Error::Closed);
        }
        let tx = self
            .queue_tx
            .as_ref()
            .ok_or_else(|| Error::Config("segmenter is not open".into()))?;

        let event_number = self.resolve_event_number(event_number);
        let data_id = if data_id == 0 { self.data_id } else { data_id };
        let ev = QueuedEvent {
            payload,
            event_number,
            data_id,
            entropy,
        };
        match tx.try_send(ev) {
            Ok(()) => {
                self.note_event(event_number);
                Ok(event_number)
            }
            Err(TrySendError::Full(_)) => Err(Error::Backpressure),
            Err(TrySendError::Disconnected(_)) => Err(Error::Closed),
        }
    }

    pub fn mtu(&self) -> usize {
        self.flags.mtu
    }

    /// Payload bytes one datagram can carry at the configured MTU.
    pub fn max_payload_len(&self) -> usize {
        self.max_payload
    }

    pub fn data_id(&self) -> u16 {
        self.data_id
    }

    pub fn event_src_id(&self) -> u32 {
        self.event_src_id
    }

    pub fn uri(&self) -> &EjfatUri {
        &self.uri
    }

    pub fn send_stats(&self) -> SendStats {
        self.core
            .as_ref()
            .map(|c| c.counters.snapshot())
            .unwrap_or_default()
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync_counters.snapshot()
    }

    /// Stop the worker threads. Events already queued are flushed first.
    /// Further sends fail with [`Error::Closed`]; stats stay readable.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // dropping the handles wakes both threads out of their loops
        self.queue_tx = None;
        self.stop_tx = None;
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("segmenter thread panicked");
            }
        }

        if let Some(core) = &self.core {
            info!("segmenter closed: {}", core.counters.snapshot().summary());
        }
    }

    fn core(&self) -> Result<&Arc<SendCore>> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.core
            .as_ref()
            .ok_or_else(|| Error::Config("segmenter is not open".into()))
    }

    fn resolve_event_number(&self, requested: u64) -> u64 {
        if requested != 0 {
            return requested;
        }
        if self.flags.usec_as_event_num {
            usec_now()
        } else {
            self.event_counter.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    fn note_event(&self, event_number: u64) {
        self.last_event.store(event_number, Ordering::Relaxed);
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Segmenter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bind an ephemeral UDP socket, optionally sizing SO_SNDBUF and connecting
/// it to a fixed peer.
fn bind_send_socket(
    v6: bool,
    buf_size: usize,
    connect_to: Option<SocketAddr>,
) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if buf_size > 0 {
        socket.set_send_buffer_size(buf_size)?;
    }
    let bind_addr = if v6 {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    };
    socket.bind(&bind_addr.into())?;

    let socket: UdpSocket = socket.into();
    if let Some(addr) = connect_to {
        socket.connect(addr)?;
    }
    Ok(socket)
}

fn usec_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
