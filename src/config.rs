//! Tuning knobs for the dataplane engines
//!
//! Both engines take a flat flags struct at construction. Defaults suit a
//! 1500-byte-MTU lab setup; production deployments usually raise the MTU and
//! the socket buffer sizes. Flags can also be loaded from a TOML file, with
//! unknown keys rejected so typos fail loudly.

use serde::Deserialize;
use std::path::Path;

use crate::wire::header_overhead;
use crate::{Error, Result};

/// Default socket buffer request for both directions (3 MiB)
pub const DEFAULT_SOCKET_BUF_SIZE: usize = 3 * 1024 * 1024;

/// Default bounded-queue capacity for events in flight
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 2047;

/// Segmenter behavior flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SegmenterFlags {
    /// Send to the balancer's IPv6 dataplane address
    pub dp_v6: bool,

    /// connect() send sockets to the balancer instead of using send_to
    pub connected_socket: bool,

    /// Emit sync messages to the balancer (off for direct point-to-point runs)
    pub use_cp: bool,

    /// Report a rate of zero in sync messages regardless of traffic
    pub zero_rate: bool,

    /// Use the microsecond clock for generated event numbers and sync
    /// reports instead of a plain counter
    pub usec_as_event_num: bool,

    /// Interval between sync messages, milliseconds
    pub sync_period_ms: u64,

    /// Sliding-window length, in periods, for the advertised event rate
    pub sync_periods: usize,

    /// Path MTU towards the balancer, bytes
    pub mtu: usize,

    /// Number of send sockets rotated over per event
    pub num_send_sockets: usize,

    /// SO_SNDBUF request for each send socket, bytes
    pub snd_socket_buf_size: usize,

    /// Capacity of the bounded queue feeding the send thread
    pub send_queue_size: usize,
}

impl Default for SegmenterFlags {
    fn default() -> Self {
        Self {
            dp_v6: false,
            connected_socket: true,
            use_cp: true,
            zero_rate: false,
            usec_as_event_num: true,
            sync_period_ms: 1000,
            sync_periods: 2,
            mtu: 1500,
            num_send_sockets: 4,
            snd_socket_buf_size: DEFAULT_SOCKET_BUF_SIZE,
            send_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
        }
    }
}

impl SegmenterFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load flags from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let flags: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("bad segmenter flags: {}", e)))?;
        flags.validate()?;
        Ok(flags)
    }

    /// Reject flag combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let overhead = header_overhead(self.dp_v6);
        if self.mtu <= overhead {
            return Err(Error::Config(format!(
                "mtu {} leaves no payload room under {} bytes of headers",
                self.mtu, overhead
            )));
        }
        if self.num_send_sockets == 0 {
            return Err(Error::Config("num_send_sockets must be at least 1".into()));
        }
        if self.sync_periods == 0 {
            return Err(Error::Config("sync_periods must be at least 1".into()));
        }
        if self.sync_period_ms == 0 {
            return Err(Error::Config("sync_period_ms must be at least 1".into()));
        }
        if self.send_queue_size == 0 {
            return Err(Error::Config("send_queue_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Reassembler behavior flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReassemblerFlags {
    /// Report worker state to the control plane
    pub use_cp: bool,

    /// Interval between worker state reports, milliseconds
    pub period_ms: u64,

    /// Verify the control plane TLS certificate
    pub validate_cert: bool,

    /// PID proportional gain
    pub kp: f64,

    /// PID integral gain
    pub ki: f64,

    /// PID derivative gain
    pub kd: f64,

    /// PID target queue fill fraction
    pub set_point: f64,

    /// PID recomputation epoch, milliseconds
    pub epoch_ms: u64,

    /// log2 of the number of listening ports. Negative derives it from the
    /// receive thread count; the balancer caps it at 14.
    pub port_range: i32,

    /// Expect the balancer header on received datagrams (only true when
    /// traffic bypasses the balancer)
    pub with_lb_header: bool,

    /// How long a partial event may wait for fragments, milliseconds
    pub event_timeout_ms: u64,

    /// SO_RCVBUF request for each receive socket, bytes
    pub rcv_socket_buf_size: usize,

    /// Relative share of events this worker asks the balancer for
    pub weight: f64,

    /// Lower bound on the balancer's per-epoch slot scaling for this worker
    pub min_factor: f64,

    /// Upper bound on the balancer's per-epoch slot scaling for this worker
    pub max_factor: f64,

    /// Capacity of the completed-event and lost-event queues
    pub event_queue_size: usize,
}

impl Default for ReassemblerFlags {
    fn default() -> Self {
        Self {
            use_cp: true,
            period_ms: 100,
            validate_cert: true,
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            set_point: 0.0,
            epoch_ms: 1000,
            port_range: -1,
            with_lb_header: false,
            event_timeout_ms: 500,
            rcv_socket_buf_size: DEFAULT_SOCKET_BUF_SIZE,
            weight: 1.0,
            min_factor: 0.5,
            max_factor: 2.0,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
        }
    }
}

impl ReassemblerFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load flags from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let flags: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("bad reassembler flags: {}", e)))?;
        flags.validate()?;
        Ok(flags)
    }

    /// Reject flag combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.port_range > 14 {
            return Err(Error::Config(format!(
                "port_range {} exceeds the balancer maximum of 14",
                self.port_range
            )));
        }
        if self.period_ms == 0 {
            return Err(Error::Config("period_ms must be at least 1".into()));
        }
        if self.epoch_ms == 0 {
            return Err(Error::Config("epoch_ms must be at least 1".into()));
        }
        if self.event_timeout_ms == 0 {
            return Err(Error::Config("event_timeout_ms must be at least 1".into()));
        }
        if self.event_queue_size == 0 {
            return Err(Error::Config("event_queue_size must be at least 1".into()));
        }
        if self.weight <= 0.0 {
            return Err(Error::Config("weight must be positive".into()));
        }
        if self.min_factor > self.max_factor {
            return Err(Error::Config(format!(
                "min_factor {} exceeds max_factor {}",
                self.min_factor, self.max_factor
            )));
        }
        Ok(())
    }
}
