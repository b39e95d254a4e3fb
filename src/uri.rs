//! Balancer URI handling
//!
//! One URI string carries everything a client needs to talk to a balancer:
//!
//! - `ejfat[s]://[token@]cp_host:cp_port/lb/lb_id` for the control plane
//! - `?data=host[:port]` (one per IP family) for the dataplane target
//! - `&sync=host:port` for the sync stream
//! - `&sessionid=...` for a previously registered worker
//!
//! `ejfats` selects TLS for control-plane calls. Data and sync hosts must be
//! IP literals; only the control-plane host may need DNS, resolved lazily by
//! [`EjfatUri::cp_addr`].

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;

use url::Url;

use crate::{Error, Result, DEFAULT_DATA_PORT};

/// Which authorization tier a token (or an operation) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScope {
    /// Can reserve and release balancers and inspect the whole host
    Admin,
    /// Tied to one reserved balancer instance
    Instance,
    /// Tied to one registered worker session
    Session,
}

/// Parsed balancer URI. Mutated as the workflow progresses: reserving fills
/// in the instance token and dataplane addresses, registering fills in the
/// session token and id, freeing clears them again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EjfatUri {
    use_tls: bool,
    cp_host: String,
    cp_port: u16,
    lb_name: Option<String>,
    lb_id: String,
    admin_token: Option<String>,
    instance_token: Option<String>,
    session_token: Option<String>,
    session_id: Option<String>,
    sync_addr: Option<SocketAddr>,
    data_addr_v4: Option<SocketAddr>,
    data_addr_v6: Option<SocketAddr>,
    prefer_v6: bool,
}

impl EjfatUri {
    /// Parse with the userinfo token treated as an admin token.
    pub fn parse(raw: &str) -> Result<Self> {
        Self::parse_with(raw, TokenScope::Admin, false)
    }

    /// Parse, placing the userinfo token into the slot named by `scope`.
    /// `prefer_v6` steers later control-plane DNS resolution.
    pub fn parse_with(raw: &str, scope: TokenScope, prefer_v6: bool) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| Error::Config(format!("bad balancer uri: {}", e)))?;

        let use_tls = match url.scheme() {
            "ejfat" => false,
            "ejfats" => true,
            other => {
                return Err(Error::Config(format!("unknown uri scheme '{}'", other)));
            }
        };

        let cp_host = url
            .host_str()
            .ok_or_else(|| Error::Config("uri has no control plane host".into()))?
            .to_string();
        let cp_port = url
            .port()
            .ok_or_else(|| Error::Config("uri has no control plane port".into()))?;

        let mut uri = Self {
            use_tls,
            cp_host,
            cp_port,
            lb_name: None,
            lb_id: String::new(),
            admin_token: None,
            instance_token: None,
            session_token: None,
            session_id: None,
            sync_addr: None,
            data_addr_v4: None,
            data_addr_v6: None,
            prefer_v6,
        };

        let token = url.username();
        if !token.is_empty() {
            let token = Some(token.to_string());
            match scope {
                TokenScope::Admin => uri.admin_token = token,
                TokenScope::Instance => uri.instance_token = token,
                TokenScope::Session => uri.session_token = token,
            }
        }

        match url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect::<Vec<_>>())
            .unwrap_or_default()
            .as_slice()
        {
            [] => {}
            ["lb", id] => uri.lb_id = (*id).to_string(),
            _ => {
                return Err(Error::Config(format!(
                    "uri path must be /lb/<id>, got '{}'",
                    url.path()
                )));
            }
        }

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "data" => {
                    let addr = parse_data_addr(&value)?;
                    let slot = if addr.is_ipv6() {
                        &mut uri.data_addr_v6
                    } else {
                        &mut uri.data_addr_v4
                    };
                    if slot.is_some() {
                        return Err(Error::Config(format!(
                            "duplicate data address for one IP family: {}",
                            value
                        )));
                    }
                    *slot = Some(addr);
                }
                "sync" => {
                    let addr: SocketAddr = value.parse().map_err(|_| {
                        Error::Config(format!("bad sync address '{}'", value))
                    })?;
                    uri.sync_addr = Some(addr);
                }
                "sessionid" => {
                    uri.session_id = Some(value.to_string());
                }
                "lbname" => {
                    uri.lb_name = Some(value.to_string());
                }
                // be lenient about keys other tools may append
                _ => {}
            }
        }

        Ok(uri)
    }

    /// Parse the URI in the `EJFAT_URI` environment variable.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var("EJFAT_URI")
            .map_err(|_| Error::NotFound("EJFAT_URI is not set".into()))?;
        Self::parse(&raw)
    }

    /// Parse the URI stored on the first non-empty line of a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let line = contents
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| Error::Config("uri file is empty".into()))?;
        Self::parse(line)
    }

    pub fn use_tls(&self) -> bool {
        self.use_tls
    }

    pub fn cp_host(&self) -> &str {
        &self.cp_host
    }

    pub fn cp_port(&self) -> u16 {
        self.cp_port
    }

    /// Resolve the control plane host to one socket address. DNS is consulted
    /// here and nowhere else; `prefer_v6` breaks ties between A and AAAA.
    pub fn cp_addr(&self) -> Result<SocketAddr> {
        let bare = self.cp_host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.cp_port));
        }

        let addrs: Vec<SocketAddr> = (self.cp_host.as_str(), self.cp_port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::Network(format!("cannot resolve {}: {}", self.cp_host, e))
            })?
            .collect();

        let preferred = addrs
            .iter()
            .find(|a| a.is_ipv6() == self.prefer_v6)
            .or_else(|| addrs.first());
        preferred.copied().ok_or_else(|| {
            Error::Network(format!("no addresses for {}", self.cp_host))
        })
    }

    pub fn lb_name(&self) -> Option<&str> {
        self.lb_name.as_deref()
    }

    pub fn set_lb_name(&mut self, name: &str) {
        self.lb_name = Some(name.to_string());
    }

    pub fn lb_id(&self) -> &str {
        &self.lb_id
    }

    pub fn set_lb_id(&mut self, id: &str) {
        self.lb_id = id.to_string();
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    pub fn instance_token(&self) -> Option<&str> {
        self.instance_token.as_deref()
    }

    pub fn set_instance_token(&mut self, token: &str) {
        self.instance_token = Some(token.to_string());
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn set_session_token(&mut self, token: &str) {
        self.session_token = Some(token.to_string());
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn set_session_id(&mut self, id: &str) {
        self.session_id = Some(id.to_string());
    }

    /// Drop session credentials after deregistering.
    pub fn clear_session(&mut self) {
        self.session_token = None;
        self.session_id = None;
    }

    /// Drop instance credentials and dataplane addresses after freeing.
    /// The addresses die with the reservation, so they go together.
    pub fn clear_instance(&mut self) {
        self.instance_token = None;
        self.sync_addr = None;
        self.data_addr_v4 = None;
        self.data_addr_v6 = None;
    }

    pub fn sync_addr(&self) -> Option<SocketAddr> {
        self.sync_addr
    }

    pub fn set_sync_addr(&mut self, addr: SocketAddr) {
        self.sync_addr = Some(addr);
    }

    /// Dataplane address of the requested family, if the URI carries one.
    pub fn data_addr(&self, want_v6: bool) -> Option<SocketAddr> {
        if want_v6 {
            self.data_addr_v6
        } else {
            self.data_addr_v4
        }
    }

    pub fn data_addr_v4(&self) -> Option<SocketAddr> {
        self.data_addr_v4
    }

    pub fn data_addr_v6(&self) -> Option<SocketAddr> {
        self.data_addr_v6
    }

    /// Store a dataplane address into its family's slot.
    pub fn set_data_addr(&mut self, addr: SocketAddr) {
        if addr.is_ipv6() {
            self.data_addr_v6 = Some(addr);
        } else {
            self.data_addr_v4 = Some(addr);
        }
    }

    pub fn prefer_v6(&self) -> bool {
        self.prefer_v6
    }

    /// Serialize with the token for `scope` in the userinfo slot. Scopes
    /// whose token is absent print without userinfo.
    pub fn to_string_for(&self, scope: TokenScope) -> String {
        let token = match scope {
            TokenScope::Admin => self.admin_token.as_deref(),
            TokenScope::Instance => self.instance_token.as_deref(),
            TokenScope::Session => self.session_token.as_deref(),
        };

        let mut out = String::new();
        out.push_str(if self.use_tls { "ejfats://" } else { "ejfat://" });
        if let Some(token) = token {
            out.push_str(token);
            out.push('@');
        }
        out.push_str(&self.cp_host);
        out.push(':');
        out.push_str(&self.cp_port.to_string());
        if !self.lb_id.is_empty() {
            out.push_str("/lb/");
            out.push_str(&self.lb_id);
        }

        let mut params = Vec::new();
        if let Some(addr) = self.data_addr_v4 {
            params.push(format!("data={}", addr));
        }
        if let Some(addr) = self.data_addr_v6 {
            params.push(format!("data={}", addr));
        }
        if let Some(addr) = self.sync_addr {
            params.push(format!("sync={}", addr));
        }
        if let Some(id) = &self.session_id {
            params.push(format!("sessionid={}", id));
        }
        if let Some(name) = &self.lb_name {
            params.push(format!("lbname={}", name));
        }
        if !params.is_empty() {
            out.push('?');
            out.push_str(&params.join("&"));
        }

        out
    }
}

impl fmt::Display for EjfatUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_for(TokenScope::Admin))
    }
}

/// Parse a `data=` value: an IP literal with an optional port. Hostnames are
/// rejected so the segmenter hot path never blocks on DNS.
fn parse_data_addr(value: &str) -> Result<SocketAddr> {
    // full socket address forms first: "1.2.3.4:p" and "[v6]:p"
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    // bare literal, default port
    let bare = value.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_DATA_PORT));
    }
    Err(Error::Config(format!(
        "data address '{}' is not an IP literal",
        value
    )))
}
