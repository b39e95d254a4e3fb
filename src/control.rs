//! Control plane client
//!
//! Blocking HTTP/JSON client for the balancer control plane:
//!
//! - reserve / inspect / free balancer instances
//! - register and deregister receiving workers
//! - stream periodic worker state reports
//! - manage the sender allow list
//!
//! Every call authenticates with a bearer token. The client picks the token
//! matching the operation's scope and refuses locally when it holds none, so
//! misuse fails before any traffic reaches the server. HTTP 401/403 map to
//! [`Error::Auth`], 404 to [`Error::NotFound`], anything else non-2xx to
//! [`Error::Network`].

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::session::{ReservationState, SessionState};
use crate::uri::{EjfatUri, TokenScope};
use crate::{Error, Result};

/// Default per-request timeout
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a reserve call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRequest {
    /// Human-readable balancer name
    pub name: String,

    /// Requested lease length in seconds
    pub seconds: f64,

    /// Sender addresses allowed through the balancer
    pub senders: Vec<IpAddr>,
}

/// Reservation record returned by reserve and lookup calls. The instance
/// token is only disclosed once, by the reserve call that created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbReservation {
    /// Balancer instance id
    pub lb_id: String,

    /// Hardware slot backing this instance
    pub fpga_lb_id: u32,

    #[serde(default)]
    pub instance_token: Option<String>,

    /// Where senders aim sync messages
    #[serde(default)]
    pub sync_addr: Option<std::net::SocketAddr>,

    /// IPv4 dataplane target
    #[serde(default)]
    pub data_addr_v4: Option<std::net::SocketAddr>,

    /// IPv6 dataplane target
    #[serde(default)]
    pub data_addr_v6: Option<std::net::SocketAddr>,

    /// When the lease lapses
    pub expires_at: DateTime<Utc>,
}

/// Body of a worker registration call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Worker node name
    pub name: String,

    /// Address the worker receives on
    pub ip: IpAddr,

    /// First port of the worker's listening range
    pub udp_port: u16,

    /// log2 of the number of listening ports
    pub port_range: u16,

    /// Relative share of events this worker asks for
    pub weight: f64,

    /// Lower bound on per-epoch slot scaling
    pub min_factor: f64,

    /// Upper bound on per-epoch slot scaling
    pub max_factor: f64,
}

/// Session credentials minted by a successful registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReply {
    pub session_id: String,
    pub session_token: String,
}

/// One periodic worker state report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateReport {
    /// Completed-queue fill fraction, 0.0 to 1.0
    pub fill_percent: f64,

    /// PID output steering this worker's schedule share
    pub control_signal: f64,

    /// Whether the worker can accept more events
    pub is_ready: bool,

    /// Client wall clock when the sample was taken
    pub timestamp: DateTime<Utc>,
}

/// Last reported state of one registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub fill_percent: f64,
    pub control_signal: f64,
    /// Schedule slots currently assigned by the balancer
    pub slots_assigned: u32,
    pub last_updated: DateTime<Utc>,
}

/// Full status of one balancer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbStatus {
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Epoch counter of the balancer schedule
    pub current_epoch: u64,
    /// Event number the balancer expects to see next
    pub predicted_event_number: u64,
    pub workers: Vec<WorkerStatus>,
    pub sender_addresses: Vec<IpAddr>,
}

/// One entry of the host-wide overview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbOverviewEntry {
    pub lb_id: String,
    pub name: String,
    pub fpga_lb_id: u32,
    pub status: LbStatus,
}

/// Control plane software version report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub commit: String,
    pub build: String,
    pub compat_tag: String,
}

/// Body of sender allow-list updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendersRequest {
    pub senders: Vec<IpAddr>,
}

/// Blocking control plane client bound to one balancer URI.
///
/// Successful calls keep the URI current: reserving fills in the instance
/// token and dataplane addresses, registering adds session credentials,
/// freeing clears them. Serialize the URI afterwards to hand workers or
/// senders their connection string.
pub struct LbControlClient {
    http: Client,
    base: String,
    uri: EjfatUri,
    session: SessionState,
}

impl LbControlClient {
    /// Build a client with certificate validation on and a 10 second
    /// request timeout.
    pub fn new(uri: EjfatUri) -> Result<Self> {
        Self::with_options(uri, true, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_options(uri: EjfatUri, validate_cert: bool, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!validate_cert)
            .build()?;
        let scheme = if uri.use_tls() { "https" } else { "http" };
        let base = format!("{}://{}:{}", scheme, uri.cp_host(), uri.cp_port());
        Ok(Self {
            http,
            base,
            uri,
            session: SessionState::new(),
        })
    }

    /// Current URI, including any tokens and addresses picked up so far.
    pub fn uri(&self) -> &EjfatUri {
        &self.uri
    }

    /// Client-side lifecycle state.
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Reserve a balancer instance. `duration` accepts plain seconds
    /// ("120", "1.5") or a clock form ("hh:mm" / "hh:mm:ss"). On success the
    /// URI gains the instance token and dataplane addresses.
    pub fn reserve(
        &mut self,
        name: &str,
        duration: &str,
        senders: &[IpAddr],
    ) -> Result<LbReservation> {
        if self.session.reservation() != ReservationState::Unreserved {
            return Err(Error::Config(format!(
                "client already holds a reservation in state {:?}",
                self.session.reservation()
            )));
        }
        let token = self.token_for(&[TokenScope::Admin])?;
        let seconds = parse_duration(duration)?;
        let req = ReserveRequest {
            name: name.to_string(),
            seconds,
            senders: senders.to_vec(),
        };

        debug!("reserving balancer '{}' for {}s", name, seconds);
        let resp = self
            .http
            .post(self.url("/v1/lb/reserve"))
            .bearer_auth(&token)
            .json(&req)
            .send()?;
        let reservation: LbReservation = decode(Self::check(resp)?)?;

        self.session.mark_reserved()?;
        self.uri.set_lb_id(&reservation.lb_id);
        self.uri.set_lb_name(name);
        if let Some(token) = &reservation.instance_token {
            self.uri.set_instance_token(token);
        }
        if let Some(addr) = reservation.sync_addr {
            self.uri.set_sync_addr(addr);
        }
        if let Some(addr) = reservation.data_addr_v4 {
            self.uri.set_data_addr(addr);
        }
        if let Some(addr) = reservation.data_addr_v6 {
            self.uri.set_data_addr(addr);
        }

        info!(
            "reserved balancer '{}' as instance {} until {}",
            name, reservation.lb_id, reservation.expires_at
        );
        Ok(reservation)
    }

    /// Look up the reservation this URI points at. A 404 while we believe
    /// the reservation is live means the lease expired under us.
    pub fn get_reservation(&mut self) -> Result<LbReservation> {
        let token = self.token_for(&[TokenScope::Admin])?;
        let path = self.lb_path()?;
        let resp = self.http.get(self.url(&path)).bearer_auth(&token).send()?;
        match Self::check(resp) {
            Ok(ok) => decode(ok),
            Err(Error::NotFound(msg)) => {
                if self.session.is_reserved() {
                    warn!("reservation {} expired server-side", self.uri.lb_id());
                    self.session.mark_expired()?;
                }
                Err(Error::NotFound(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Release the reservation the URI points at. Tokens and dataplane
    /// addresses die with it. Freeing twice, or freeing an instance the
    /// server already dropped, is a no-op.
    pub fn free(&mut self) -> Result<()> {
        if self.session.reservation() == ReservationState::Freed {
            debug!("reservation already freed, nothing to do");
            return Ok(());
        }
        let token = self.token_for(&[TokenScope::Admin, TokenScope::Instance])?;
        let path = self.lb_path()?;
        let resp = self
            .http
            .delete(self.url(&path))
            .bearer_auth(&token)
            .send()?;
        match Self::check(resp) {
            Ok(_) => {}
            // already gone server-side, same end state
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if self.session.is_active() {
            self.session.mark_auto_deregistered()?;
        }
        // a client that never reserved locally may still free by id
        if self.session.is_reserved() {
            self.session.mark_freed()?;
        }
        info!("freed balancer instance {}", self.uri.lb_id());
        self.uri.clear_session();
        self.uri.clear_instance();
        Ok(())
    }

    /// Adopt a worker session some earlier process registered, using the
    /// session credentials carried by the URI. Needed before
    /// [`send_state`](Self::send_state) or [`deregister`](Self::deregister)
    /// can act on such a session.
    pub fn resume_session(&mut self) -> Result<()> {
        if self.uri.session_token().is_none() || self.uri.session_id().is_none() {
            return Err(Error::Config(
                "uri carries no session token and id to resume".into(),
            ));
        }
        self.session.begin_register()?;
        self.session.complete_register()?;
        debug!(
            "resumed worker session {}",
            self.uri.session_id().unwrap_or_default()
        );
        Ok(())
    }

    /// Register this node as a receiving worker. `source_count` sizes the
    /// listening port range: the balancer spreads each event over
    /// 2^ceil(log2(count)) ports, capped at 2^14.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        name: &str,
        ip: IpAddr,
        udp_port: u16,
        weight: f64,
        source_count: usize,
        min_factor: f64,
        max_factor: f64,
    ) -> Result<RegisterReply> {
        let token = self.token_for(&[TokenScope::Instance])?;
        let path = format!("{}/workers", self.lb_path()?);
        let req = RegisterRequest {
            name: name.to_string(),
            ip,
            udp_port,
            port_range: port_range_for_sources(source_count),
            weight,
            min_factor,
            max_factor,
        };

        self.session.begin_register()?;
        let result = self
            .http
            .post(self.url(&path))
            .bearer_auth(&token)
            .json(&req)
            .send()
            .map_err(Error::from)
            .and_then(Self::check)
            .and_then(decode::<RegisterReply>);

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                self.session.fail_register()?;
                return Err(e);
            }
        };

        self.session.complete_register()?;
        self.uri.set_session_token(&reply.session_token);
        self.uri.set_session_id(&reply.session_id);
        info!("registered worker '{}' as session {}", name, reply.session_id);
        Ok(reply)
    }

    /// Remove this node from the worker pool and drop its session
    /// credentials. A worker the server already forgot counts as success.
    pub fn deregister(&mut self) -> Result<()> {
        let token = self.token_for(&[TokenScope::Session, TokenScope::Instance])?;
        let sid = self.session_id_required()?;
        let path = format!("{}/workers/{}", self.lb_path()?, sid);

        self.session.begin_deregister()?;
        let result = self
            .http
            .delete(self.url(&path))
            .bearer_auth(&token)
            .send()
            .map_err(Error::from)
            .and_then(Self::check);

        match result {
            Ok(_) => {}
            Err(Error::NotFound(_)) => {
                debug!("session {} was already dropped server-side", sid);
            }
            Err(e) => {
                self.session.fail_deregister()?;
                return Err(e);
            }
        }

        self.session.complete_deregister()?;
        self.uri.clear_session();
        info!("deregistered worker session {}", sid);
        Ok(())
    }

    /// Report worker state, stamped with the current wall clock.
    pub fn send_state(&mut self, fill: f64, control_signal: f64, is_ready: bool) -> Result<()> {
        self.send_state_at(fill, control_signal, is_ready, Utc::now())
    }

    /// Report worker state with an explicit timestamp. Requires an active
    /// session; an auth failure or a vanished session means the control
    /// plane dropped us, and the local state follows suit.
    pub fn send_state_at(
        &mut self,
        fill: f64,
        control_signal: f64,
        is_ready: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if !self.session.is_active() {
            return Err(Error::Auth("no active worker session".into()));
        }
        let token = self.token_for(&[TokenScope::Session])?;
        let sid = self.session_id_required()?;
        let path = format!("{}/workers/{}/state", self.lb_path()?, sid);
        let report = StateReport {
            fill_percent: fill,
            control_signal,
            is_ready,
            timestamp,
        };

        let result = self
            .http
            .put(self.url(&path))
            .bearer_auth(&token)
            .json(&report)
            .send()
            .map_err(Error::from)
            .and_then(Self::check);

        match result {
            Ok(_) => Ok(()),
            Err(Error::Auth(msg)) => {
                warn!("control plane rejected session {}: {}", sid, msg);
                self.session.mark_auto_deregistered()?;
                Err(Error::Auth(msg))
            }
            Err(Error::NotFound(msg)) => {
                warn!("control plane no longer knows session {}", sid);
                self.session.mark_auto_deregistered()?;
                Err(Error::NotFound(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Add sender addresses to the balancer's allow list.
    pub fn add_senders(&self, senders: &[IpAddr]) -> Result<()> {
        self.senders_request(senders, false)
    }

    /// Remove sender addresses from the balancer's allow list.
    pub fn remove_senders(&self, senders: &[IpAddr]) -> Result<()> {
        self.senders_request(senders, true)
    }

    fn senders_request(&self, senders: &[IpAddr], remove: bool) -> Result<()> {
        let token = self.token_for(&[TokenScope::Instance])?;
        let path = format!("{}/senders", self.lb_path()?);
        let req = SendersRequest {
            senders: senders.to_vec(),
        };
        let builder = if remove {
            self.http.delete(self.url(&path))
        } else {
            self.http.post(self.url(&path))
        };
        let resp = builder.bearer_auth(&token).json(&req).send()?;
        Self::check(resp).map(|_| ())
    }

    /// Fetch the live status of this balancer instance.
    pub fn get_status(&self) -> Result<LbStatus> {
        let token = self.token_for(&[TokenScope::Admin, TokenScope::Instance])?;
        let path = format!("{}/status", self.lb_path()?);
        let resp = self.http.get(self.url(&path)).bearer_auth(&token).send()?;
        decode(Self::check(resp)?)
    }

    /// Fetch the status of every balancer on the host.
    pub fn get_overview(&self) -> Result<Vec<LbOverviewEntry>> {
        let token = self.token_for(&[TokenScope::Admin])?;
        let resp = self
            .http
            .get(self.url("/v1/overview"))
            .bearer_auth(&token)
            .send()?;
        decode(Self::check(resp)?)
    }

    /// Fetch the control plane software version.
    pub fn version(&self) -> Result<VersionInfo> {
        let token = self.token_for(&[TokenScope::Admin, TokenScope::Instance])?;
        let resp = self
            .http
            .get(self.url("/v1/version"))
            .bearer_auth(&token)
            .send()?;
        decode(Self::check(resp)?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn lb_path(&self) -> Result<String> {
        if self.uri.lb_id().is_empty() {
            return Err(Error::Config("uri names no balancer instance".into()));
        }
        Ok(format!("/v1/lb/{}", self.uri.lb_id()))
    }

    fn session_id_required(&self) -> Result<String> {
        self.uri
            .session_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Config("uri carries no session id".into()))
    }

    /// Pick the first token we hold among the scopes an operation accepts.
    fn token_for(&self, scopes: &[TokenScope]) -> Result<String> {
        for scope in scopes {
            let token = match scope {
                TokenScope::Admin => self.uri.admin_token(),
                TokenScope::Instance => self.uri.instance_token(),
                TokenScope::Session => self.uri.session_token(),
            };
            if let Some(token) = token {
                return Ok(token.to_string());
            }
        }
        Err(Error::Auth(format!(
            "no token held for scopes {:?}",
            scopes
        )))
    }

    fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        let detail = if body.trim().is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, body.trim())
        };
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Auth(detail)),
            StatusCode::NOT_FOUND => Err(Error::NotFound(detail)),
            _ => Err(Error::Network(detail)),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T> {
    resp.json()
        .map_err(|e| Error::Protocol(format!("bad control plane response: {}", e)))
}

/// Parse a lease duration: plain seconds ("120", "0.5") or clock form
/// ("hh:mm" / "hh:mm:ss" with minutes and seconds under 60).
pub fn parse_duration(s: &str) -> Result<f64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty duration".into()));
    }

    if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() > 3 {
            return Err(Error::Config(format!("bad duration '{}'", s)));
        }
        let mut fields = [0u64; 3];
        for (i, part) in parts.iter().enumerate() {
            fields[i] = part
                .parse()
                .map_err(|_| Error::Config(format!("bad duration component '{}'", part)))?;
        }
        let (hours, minutes) = (fields[0], fields[1]);
        let seconds = if parts.len() == 3 { fields[2] } else { 0 };
        if minutes >= 60 || seconds >= 60 {
            return Err(Error::Config(format!(
                "minutes and seconds must stay under 60 in '{}'",
                s
            )));
        }
        let total = hours * 3600 + minutes * 60 + seconds;
        if total == 0 {
            return Err(Error::Config(format!(
                "duration must be positive, got '{}'",
                s
            )));
        }
        Ok(total as f64)
    } else {
        let seconds: f64 = s
            .parse()
            .map_err(|_| Error::Config(format!("bad duration '{}'", s)))?;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(Error::Config(format!(
                "duration must be positive, got '{}'",
                s
            )));
        }
        Ok(seconds)
    }
}

/// Port range exponent covering `count` senders: ceil(log2(count)), capped
/// at the balancer's limit of 14.
pub(crate) fn port_range_for_sources(count: usize) -> u16 {
    let count = count.max(1);
    let bits = (usize::BITS - (count - 1).leading_zeros()) as u16;
    bits.min(14)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_client(raw: &str) -> LbControlClient {
        LbControlClient::new(EjfatUri::parse(raw).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("5").unwrap(), 5.0);
        assert_eq!(parse_duration("1.5").unwrap(), 1.5);
        assert_eq!(parse_duration(" 120 ").unwrap(), 120.0);
    }

    #[test]
    fn test_parse_duration_clock_forms() {
        assert_eq!(parse_duration("02:30").unwrap(), 9000.0);
        assert_eq!(parse_duration("01:02:03").unwrap(), 3723.0);
        assert_eq!(parse_duration("0:00:30").unwrap(), 30.0);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for bad in [
            "", "abc", "-5", "0", "0:00", "0:00:00", "1:75", "1:00:60", "1:2:3:4", "1:",
        ] {
            assert!(
                matches!(parse_duration(bad), Err(Error::Config(_))),
                "expected rejection of '{}'",
                bad
            );
        }
    }

    #[test]
    fn test_port_range_for_sources() {
        assert_eq!(port_range_for_sources(0), 0);
        assert_eq!(port_range_for_sources(1), 0);
        assert_eq!(port_range_for_sources(2), 1);
        assert_eq!(port_range_for_sources(3), 2);
        assert_eq!(port_range_for_sources(4), 2);
        assert_eq!(port_range_for_sources(5), 3);
        assert_eq!(port_range_for_sources(1024), 10);
        assert_eq!(port_range_for_sources(100_000), 14);
    }

    #[test]
    fn test_send_state_requires_active_session() {
        // never touches the network: the local gate fires first
        let mut client = offline_client("ejfat://tok@127.0.0.1:19999/lb/1");
        assert!(matches!(
            client.send_state(0.5, 0.0, true),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_reserve_requires_admin_token() {
        let mut client = offline_client("ejfat://127.0.0.1:19999/lb/1");
        assert!(matches!(
            client.reserve("demo", "60", &[]),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_register_requires_instance_token() {
        // an admin token alone does not authorize worker registration
        let mut client = offline_client("ejfat://admin@127.0.0.1:19999/lb/1");
        assert!(matches!(
            client.register("w", "127.0.0.1".parse().unwrap(), 19522, 1.0, 1, 0.5, 2.0),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_free_requires_a_token() {
        let mut client = offline_client("ejfat://127.0.0.1:19999/lb/1");
        assert!(matches!(client.free(), Err(Error::Auth(_))));
    }

    #[test]
    fn test_resume_session_requires_credentials() {
        let mut client = offline_client("ejfat://tok@127.0.0.1:19999/lb/1");
        assert!(matches!(client.resume_session(), Err(Error::Config(_))));

        let uri = EjfatUri::parse_with(
            "ejfat://sess@127.0.0.1:19999/lb/1?sessionid=s7",
            TokenScope::Session,
            false,
        )
        .unwrap();
        let mut client = LbControlClient::new(uri).unwrap();
        client.resume_session().unwrap();
        assert!(client.session().is_active());
    }
}
