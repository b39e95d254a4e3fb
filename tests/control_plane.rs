//! Client tests against a mock control plane speaking the same HTTP/JSON
//! dialect. The mock runs on a background tokio runtime; the client under
//! test stays blocking, exactly as production callers use it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::runtime::Runtime;

use ejfat::control::{
    LbOverviewEntry, LbReservation, LbStatus, RegisterReply, RegisterRequest, ReserveRequest,
    SendersRequest, StateReport, VersionInfo, WorkerStatus,
};
use ejfat::{
    EjfatUri, Error, LbControlClient, Reassembler, ReassemblerFlags, ReservationState, TokenScope,
};

const ADMIN_TOKEN: &str = "admintok";

struct MockWorker {
    session_token: String,
    port_range: u16,
    status: WorkerStatus,
}

struct MockLb {
    name: String,
    fpga_lb_id: u32,
    instance_token: String,
    senders: Vec<IpAddr>,
    workers: HashMap<String, MockWorker>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct MockState {
    next_lb: AtomicU32,
    next_session: AtomicU32,
    lbs: Mutex<HashMap<String, MockLb>>,
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn status_of(lb: &MockLb) -> LbStatus {
    LbStatus {
        timestamp: Utc::now(),
        expires_at: lb.expires_at,
        current_epoch: 42,
        predicted_event_number: 1000,
        workers: lb.workers.values().map(|w| w.status.clone()).collect(),
        sender_addresses: lb.senders.clone(),
    }
}

async fn reserve(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(req): Json<ReserveRequest>,
) -> Result<Json<LbReservation>, StatusCode> {
    if bearer(&headers).as_deref() != Some(ADMIN_TOKEN) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let id = state.next_lb.fetch_add(1, Ordering::Relaxed) + 1;
    let lb_id = id.to_string();
    let instance_token = format!("insttok-{}", id);
    let expires_at = Utc::now() + ChronoDuration::seconds(req.seconds as i64);
    state.lbs.lock().unwrap().insert(
        lb_id.clone(),
        MockLb {
            name: req.name,
            fpga_lb_id: id,
            instance_token: instance_token.clone(),
            senders: req.senders,
            workers: HashMap::new(),
            expires_at,
        },
    );
    Ok(Json(LbReservation {
        lb_id,
        fpga_lb_id: id,
        instance_token: Some(instance_token),
        sync_addr: Some("192.168.77.1:19010".parse().unwrap()),
        data_addr_v4: Some("192.168.77.2:19522".parse().unwrap()),
        data_addr_v6: None,
        expires_at,
    }))
}

async fn get_lb(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<LbReservation>, StatusCode> {
    let lbs = state.lbs.lock().unwrap();
    let token = bearer(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let lb = lbs.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    if token != ADMIN_TOKEN && token != lb.instance_token {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(LbReservation {
        lb_id: id,
        fpga_lb_id: lb.fpga_lb_id,
        instance_token: None,
        sync_addr: Some("192.168.77.1:19010".parse().unwrap()),
        data_addr_v4: Some("192.168.77.2:19522".parse().unwrap()),
        data_addr_v6: None,
        expires_at: lb.expires_at,
    }))
}

async fn free_lb(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    let mut lbs = state.lbs.lock().unwrap();
    let token = match bearer(&headers) {
        Some(token) => token,
        None => return StatusCode::UNAUTHORIZED,
    };
    let authorized = match lbs.get(&id) {
        Some(lb) => token == ADMIN_TOKEN || token == lb.instance_token,
        None => return StatusCode::NOT_FOUND,
    };
    if !authorized {
        return StatusCode::UNAUTHORIZED;
    }
    lbs.remove(&id);
    StatusCode::OK
}

async fn register_worker(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterReply>, StatusCode> {
    let mut lbs = state.lbs.lock().unwrap();
    let token = bearer(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let lb = lbs.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    if token != lb.instance_token {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let n = state.next_session.fetch_add(1, Ordering::Relaxed) + 1;
    let session_id = format!("sess-{}", n);
    let session_token = format!("sesstok-{}", n);
    lb.workers.insert(
        session_id.clone(),
        MockWorker {
            session_token: session_token.clone(),
            port_range: req.port_range,
            status: WorkerStatus {
                name: req.name,
                fill_percent: 0.0,
                control_signal: 0.0,
                slots_assigned: 0,
                last_updated: Utc::now(),
            },
        },
    );
    Ok(Json(RegisterReply {
        session_id,
        session_token,
    }))
}

async fn deregister_worker(
    State(state): State<Arc<MockState>>,
    Path((id, sid)): Path<(String, String)>,
    headers: HeaderMap,
) -> StatusCode {
    let mut lbs = state.lbs.lock().unwrap();
    let token = match bearer(&headers) {
        Some(token) => token,
        None => return StatusCode::UNAUTHORIZED,
    };
    let lb = match lbs.get_mut(&id) {
        Some(lb) => lb,
        None => return StatusCode::NOT_FOUND,
    };
    let authorized = match lb.workers.get(&sid) {
        Some(worker) => token == worker.session_token || token == lb.instance_token,
        None => return StatusCode::NOT_FOUND,
    };
    if !authorized {
        return StatusCode::UNAUTHORIZED;
    }
    lb.workers.remove(&sid);
    StatusCode::OK
}

async fn worker_state(
    State(state): State<Arc<MockState>>,
    Path((id, sid)): Path<(String, String)>,
    headers: HeaderMap,
    Json(report): Json<StateReport>,
) -> StatusCode {
    let mut lbs = state.lbs.lock().unwrap();
    let token = match bearer(&headers) {
        Some(token) => token,
        None => return StatusCode::UNAUTHORIZED,
    };
    let lb = match lbs.get_mut(&id) {
        Some(lb) => lb,
        None => return StatusCode::NOT_FOUND,
    };
    let worker = match lb.workers.get_mut(&sid) {
        Some(worker) => worker,
        None => return StatusCode::NOT_FOUND,
    };
    if token != worker.session_token {
        return StatusCode::UNAUTHORIZED;
    }
    worker.status.fill_percent = report.fill_percent;
    worker.status.control_signal = report.control_signal;
    worker.status.slots_assigned = 512;
    worker.status.last_updated = report.timestamp;
    StatusCode::OK
}

async fn lb_status(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<LbStatus>, StatusCode> {
    let lbs = state.lbs.lock().unwrap();
    let token = bearer(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let lb = lbs.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    if token != ADMIN_TOKEN && token != lb.instance_token {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(status_of(lb)))
}

async fn overview(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<LbOverviewEntry>>, StatusCode> {
    if bearer(&headers).as_deref() != Some(ADMIN_TOKEN) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let lbs = state.lbs.lock().unwrap();
    let entries = lbs
        .iter()
        .map(|(id, lb)| LbOverviewEntry {
            lb_id: id.clone(),
            name: lb.name.clone(),
            fpga_lb_id: lb.fpga_lb_id,
            status: status_of(lb),
        })
        .collect();
    Ok(Json(entries))
}

async fn add_senders(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SendersRequest>,
) -> StatusCode {
    senders_update(&state, &id, &headers, req, false)
}

async fn remove_senders(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SendersRequest>,
) -> StatusCode {
    senders_update(&state, &id, &headers, req, true)
}

fn senders_update(
    state: &MockState,
    id: &str,
    headers: &HeaderMap,
    req: SendersRequest,
    remove: bool,
) -> StatusCode {
    let mut lbs = state.lbs.lock().unwrap();
    let token = match bearer(headers) {
        Some(token) => token,
        None => return StatusCode::UNAUTHORIZED,
    };
    let lb = match lbs.get_mut(id) {
        Some(lb) => lb,
        None => return StatusCode::NOT_FOUND,
    };
    if token != ADMIN_TOKEN && token != lb.instance_token {
        return StatusCode::UNAUTHORIZED;
    }
    if remove {
        lb.senders.retain(|ip| !req.senders.contains(ip));
    } else {
        lb.senders.extend(req.senders);
    }
    StatusCode::OK
}

async fn version(headers: HeaderMap) -> Result<Json<VersionInfo>, StatusCode> {
    if bearer(&headers).is_none() {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(VersionInfo {
        commit: "abc1234".to_string(),
        build: "1.0.0".to_string(),
        compat_tag: "v1".to_string(),
    }))
}

fn router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/v1/lb/reserve", post(reserve))
        .route("/v1/lb/:id", get(get_lb).delete(free_lb))
        .route("/v1/lb/:id/workers", post(register_worker))
        .route("/v1/lb/:id/workers/:sid", axum::routing::delete(deregister_worker))
        .route("/v1/lb/:id/workers/:sid/state", put(worker_state))
        .route("/v1/lb/:id/status", get(lb_status))
        .route("/v1/lb/:id/senders", post(add_senders).delete(remove_senders))
        .route("/v1/overview", get(overview))
        .route("/v1/version", get(version))
        .with_state(state)
}

/// Start the mock on an ephemeral port. The returned runtime keeps it alive.
fn start_mock() -> (Runtime, SocketAddr, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let app = router(state.clone());
    let rt = Runtime::new().unwrap();
    let addr = rt.block_on(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    });
    (rt, addr, state)
}

fn admin_uri(addr: SocketAddr) -> EjfatUri {
    EjfatUri::parse(&format!("ejfat://{}@{}/", ADMIN_TOKEN, addr)).unwrap()
}

#[test]
fn test_full_lifecycle() {
    let (_rt, addr, state) = start_mock();
    let mut client = LbControlClient::new(admin_uri(addr)).unwrap();

    let reservation = client.reserve("daq", "30", &[]).unwrap();
    assert!(reservation.instance_token.is_some());
    assert_eq!(client.uri().lb_id(), reservation.lb_id);
    assert!(client.uri().sync_addr().is_some());
    assert!(client.uri().data_addr(false).is_some());
    assert!(client.session().is_reserved());

    let reply = client
        .register("worker1", "10.0.0.9".parse().unwrap(), 20000, 1.0, 4, 0.5, 2.0)
        .unwrap();
    assert!(!reply.session_token.is_empty());
    assert!(client.session().is_active());

    // 4 expected sources need a 4-port block, so the range exponent is 2
    {
        let lbs = state.lbs.lock().unwrap();
        let lb = lbs.get(&reservation.lb_id).unwrap();
        assert_eq!(lb.workers[&reply.session_id].port_range, 2);
    }

    let mut last_fill = 0.0;
    let mut last_signal = 0.0;
    for i in 0..25 {
        last_fill = i as f64 / 25.0;
        last_signal = 0.01 * i as f64;
        client.send_state(last_fill, last_signal, true).unwrap();
        std::thread::sleep(Duration::from_millis(100));
    }

    let status = client.get_status().unwrap();
    assert_eq!(status.current_epoch, 42);
    assert_eq!(status.workers.len(), 1);
    assert_eq!(status.workers[0].name, "worker1");
    assert!((status.workers[0].fill_percent - last_fill).abs() < 1e-6);
    assert!((status.workers[0].control_signal - last_signal).abs() < 1e-6);
    assert_eq!(status.workers[0].slots_assigned, 512);

    client.deregister().unwrap();
    client.free().unwrap();
    assert!(client.uri().instance_token().is_none());
    assert!(client.uri().session_token().is_none());
    // freeing an already freed instance stays quiet
    client.free().unwrap();
}

#[test]
fn test_reassembler_worker_lifecycle() {
    let (_rt, addr, state) = start_mock();
    let mut admin = LbControlClient::new(admin_uri(addr)).unwrap();
    let reservation = admin.reserve("daq", "30", &[]).unwrap();

    // hand the instance URI to a worker-side reassembler
    let raw = admin.uri().to_string_for(TokenScope::Instance);
    let uri = EjfatUri::parse_with(&raw, TokenScope::Instance, false).unwrap();
    let mut flags = ReassemblerFlags::new();
    flags.period_ms = 50;
    let mut reassembler =
        Reassembler::new(uri, "127.0.0.1".parse().unwrap(), 20000, 1, flags).unwrap();

    reassembler.register_worker("daq-worker").unwrap();
    {
        let lbs = state.lbs.lock().unwrap();
        assert_eq!(lbs[&reservation.lb_id].workers.len(), 1);
    }

    // let a few reports land before leaving the pool
    std::thread::sleep(Duration::from_millis(200));
    reassembler.deregister_worker().unwrap();
    {
        let lbs = state.lbs.lock().unwrap();
        assert!(lbs[&reservation.lb_id].workers.is_empty());
    }

    reassembler.close();
    admin.free().unwrap();
}

#[test]
fn test_session_uri_resumes_on_a_fresh_client() {
    let (_rt, addr, _state) = start_mock();
    let mut owner = LbControlClient::new(admin_uri(addr)).unwrap();
    owner.reserve("daq", "30", &[]).unwrap();
    owner
        .register("worker1", "10.0.0.9".parse().unwrap(), 20000, 1.0, 1, 0.5, 2.0)
        .unwrap();

    // hand the session URI to a second process
    let raw = owner.uri().to_string_for(TokenScope::Session);
    let uri = EjfatUri::parse_with(&raw, TokenScope::Session, false).unwrap();
    let mut other = LbControlClient::new(uri).unwrap();
    other.resume_session().unwrap();
    other.send_state(0.7, -0.2, true).unwrap();
    other.deregister().unwrap();

    // the original client's report now hits a dead session
    match owner.send_state(0.1, 0.0, true) {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected not-found, got {:?}", other),
    }
    assert!(!owner.session().is_active());
}

#[test]
fn test_wrong_token_is_an_auth_error() {
    let (_rt, addr, _state) = start_mock();
    let uri = EjfatUri::parse(&format!("ejfat://wrongtok@{}/", addr)).unwrap();
    let mut client = LbControlClient::new(uri).unwrap();
    match client.reserve("daq", "10", &[]) {
        Err(Error::Auth(_)) => {}
        other => panic!("expected auth error, got {:?}", other),
    }
}

#[test]
fn test_missing_token_is_refused_before_any_request() {
    // nothing listens on port 9; a network attempt would surface as a
    // transport error, not an auth error
    let uri = EjfatUri::parse("ejfat://127.0.0.1:9/").unwrap();
    let mut client = LbControlClient::new(uri).unwrap();
    match client.reserve("daq", "10", &[]) {
        Err(Error::Auth(_)) => {}
        other => panic!("expected auth error, got {:?}", other),
    }
}

#[test]
fn test_unknown_instance_is_not_found() {
    let (_rt, addr, _state) = start_mock();
    let uri = EjfatUri::parse(&format!("ejfat://{}@{}/lb/999", ADMIN_TOKEN, addr)).unwrap();
    let client = LbControlClient::new(uri).unwrap();
    match client.get_status() {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected not-found, got {:?}", other),
    }
}

#[test]
fn test_lookup_notices_a_server_side_free() {
    let (_rt, addr, _state) = start_mock();
    let mut owner = LbControlClient::new(admin_uri(addr)).unwrap();
    let reservation = owner.reserve("daq", "30", &[]).unwrap();

    // an admin elsewhere frees the instance by id
    let raw = format!("ejfat://{}@{}/lb/{}", ADMIN_TOKEN, addr, reservation.lb_id);
    let mut admin = LbControlClient::new(EjfatUri::parse(&raw).unwrap()).unwrap();
    admin.free().unwrap();

    match owner.get_reservation() {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected not-found, got {:?}", other),
    }
    assert_eq!(owner.session().reservation(), ReservationState::Expired);
}

#[test]
fn test_senders_overview_and_version() {
    let (_rt, addr, state) = start_mock();
    let mut client = LbControlClient::new(admin_uri(addr)).unwrap();
    let reservation = client.reserve("daq", "30", &["10.1.1.1".parse().unwrap()]).unwrap();

    let extra: Vec<IpAddr> = vec!["10.1.1.2".parse().unwrap(), "10.1.1.3".parse().unwrap()];
    client.add_senders(&extra).unwrap();
    {
        let lbs = state.lbs.lock().unwrap();
        assert_eq!(lbs[&reservation.lb_id].senders.len(), 3);
    }
    client.remove_senders(&extra[..1]).unwrap();

    let status = client.get_status().unwrap();
    assert_eq!(status.sender_addresses.len(), 2);
    assert!(!status.sender_addresses.contains(&extra[0]));

    let entries = client.get_overview().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "daq");
    assert_eq!(entries[0].lb_id, reservation.lb_id);

    let version = client.version().unwrap();
    assert_eq!(version.compat_tag, "v1");
}
