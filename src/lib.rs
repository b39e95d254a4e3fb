//! # EJFAT dataplane and control plane client
//!
//! Event segmentation and reassembly over UDP through a hardware load
//! balancer, plus the client side of the balancer's control plane.
//!
//! ## Core pieces
//! - **Segmenter**: slices events into MTU-sized datagrams with balancer
//!   framing and advertises its send rate
//! - **Reassembler**: listens on a block of ports, stitches fragments back
//!   into events across loss, duplication and reordering
//! - **LbControlClient**: reserves balancer instances, registers workers and
//!   streams PID-driven state reports
//! - **EjfatUri**: one string carrying the control plane endpoint, tokens
//!   and dataplane addresses through the whole workflow

pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod reassembler;
pub mod segmenter;
pub mod session;
pub mod stats;
pub mod uri;
pub mod wire;

pub use config::{ReassemblerFlags, SegmenterFlags};
pub use control::{LbControlClient, LbReservation, LbStatus, RegisterReply, VersionInfo};
pub use controller::PidController;
pub use error::{Error, Result};
pub use reassembler::{LostEvent, ReassembledEvent, Reassembler};
pub use segmenter::Segmenter;
pub use session::{MembershipState, ReservationState, SessionState};
pub use stats::{RecvStats, SendStats, SyncStats};
pub use uri::{EjfatUri, TokenScope};

use std::time::Duration;

/// Dataplane port workers listen on when the URI names none
pub const DEFAULT_DATA_PORT: u16 = 19522;

/// How often the control plane expects a state report from each registered
/// worker before it drops the session
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
