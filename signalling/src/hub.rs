//! The Hub: process-wide room registry and the WebSocket upgrade entry
//! point. One `Hub` per replica; rooms are created lazily on first join and
//! removed once their executor reports empty.

use std::sync::Arc;

use coordination_bus::CoordinationBus;
use salvo::prelude::*;
use salvo::websocket::WebSocketUpgrade;
use sfu_client::SfuClient;

use crate::config::AppEnv;
use crate::identity::{IdentityClaims, TokenValidator};
use crate::metrics::Metrics;
use crate::rate_limit::ConnectionRateLimiter;
use crate::room::{self, Role, RoomHandle, RoomSettings};
use crate::session::{ClientSession, LocalMember, SessionConfig};
use crate::wire::codec_for_subprotocol;

const RECONNECT_TOKEN_PREFIX: &str = "r:";

/// Process-wide room registry. `creation_lock` is held only for the
/// check-then-spawn window so two concurrent joiners never race into
/// spawning two executors for the same room id.
pub struct Hub {
    rooms: Arc<dashmap::DashMap<String, RoomHandle>>,
    creation_lock: tokio::sync::Mutex<()>,
    bus: Arc<dyn CoordinationBus>,
    sfu: Arc<SfuClient>,
    sfu_health_check_enabled: bool,
    metrics: Arc<Metrics>,
    event_rate_limiter: Arc<dyn ConnectionRateLimiter>,
    settings: RoomSettings,
}

impl Hub {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn CoordinationBus>,
        sfu: Arc<SfuClient>,
        sfu_health_check_enabled: bool,
        metrics: Arc<Metrics>,
        event_rate_limiter: Arc<dyn ConnectionRateLimiter>,
        settings: RoomSettings,
    ) -> Self {
        Self {
            rooms: Arc::new(dashmap::DashMap::new()),
            creation_lock: tokio::sync::Mutex::new(()),
            bus,
            sfu,
            sfu_health_check_enabled,
            metrics,
            event_rate_limiter,
            settings,
        }
    }

    pub async fn get_or_create(&self, room_id: &str) -> RoomHandle {
        if let Some(handle) = self.rooms.get(room_id) {
            return handle.clone();
        }

        let _guard = self.creation_lock.lock().await;
        if let Some(handle) = self.rooms.get(room_id) {
            return handle.clone();
        }

        let rooms = self.rooms.clone();
        let owned_id = room_id.to_owned();
        let handle = room::spawn(
            owned_id.clone(),
            self.settings.clone(),
            self.bus.clone(),
            self.sfu.clone(),
            self.metrics.clone(),
            self.event_rate_limiter.clone(),
            move |room_id| {
                rooms.remove(&room_id);
            },
        );

        self.metrics.active_rooms.set(self.rooms.len() as i64 + 1);
        self.rooms.insert(owned_id, handle.clone());
        handle
    }

    /// `/health/ready`: degraded if the bus is unreachable, or the SFU is
    /// unreachable and health checking it is enabled.
    pub async fn readiness(&self) -> bool {
        let bus_ok = self.bus.ping().await.is_ok();
        let sfu_ok = !self.sfu_health_check_enabled || self.sfu_is_healthy().await;
        bus_ok && sfu_ok
    }

    async fn sfu_is_healthy(&self) -> bool {
        use signaling_proto::sfu::health_check_response::ServingStatus;
        matches!(
            self.sfu.health_check("sfu_orchestration").await,
            Ok(response) if response.status == ServingStatus::Serving as i32
        )
    }
}

/// Everything the upgrade handler needs pulled out of the request in one
/// pass, before a room is touched.
struct UpgradeRequest {
    room_id: String,
    identity: IdentityClaims,
    reconnect_token: Option<String>,
    subprotocol: Option<String>,
    remote_ip: String,
}

fn extract_upgrade_request(req: &mut Request, validator: &dyn TokenValidator) -> Result<UpgradeRequest, StatusError> {
    let room_id = req
        .param::<String>("room_id")
        .ok_or_else(|| StatusError::bad_request().brief("missing room_id path segment"))?;

    let token = req
        .query::<String>("token")
        .or_else(|| bearer_token(req))
        .ok_or_else(StatusError::unauthorized)?;
    let identity = validator.decode(&token).map_err(|_| StatusError::unauthorized())?;

    let reconnect_token = req.query::<String>("reconnect_token").filter(|t| t.starts_with(RECONNECT_TOKEN_PREFIX));
    let subprotocol = req.header::<String>("sec-websocket-protocol");
    let remote_ip = req.remote_addr().to_string();

    Ok(UpgradeRequest { room_id, identity, reconnect_token, subprotocol, remote_ip })
}

fn bearer_token(req: &Request) -> Option<String> {
    req.header::<String>("authorization")?.strip_prefix("Bearer ").map(str::to_owned)
}

fn origin_is_allowed(req: &Request, allowed_origins: &[String]) -> bool {
    if allowed_origins.is_empty() {
        return true;
    }
    match req.header::<String>("origin") {
        Some(origin) => allowed_origins.iter().any(|allowed| allowed == &origin),
        None => false,
    }
}

/// `GET /ws/{room_id}`: the one entry point for every signaling connection.
/// Validates identity and origin, applies the per-IP rate limit, then hands
/// off to the room's command queue; everything past this point happens on
/// `ClientSession`'s reader/writer/heartbeat tasks.
#[handler]
pub async fn upgrade(req: &mut Request, res: &mut Response, depot: &mut Depot) -> Result<(), StatusError> {
    let env = depot.obtain::<AppEnv>().unwrap();
    let validator = depot.obtain::<Arc<dyn TokenValidator>>().unwrap();
    let limiter = depot.obtain::<Arc<dyn ConnectionRateLimiter>>().unwrap();
    let hub = depot.obtain::<Arc<Hub>>().unwrap();
    let metrics = depot.obtain::<Arc<Metrics>>().unwrap();

    if !origin_is_allowed(req, &env.allowed_origins) {
        return Err(StatusError::forbidden().brief("origin not allowed"));
    }

    let upgrade_request = extract_upgrade_request(req, validator.as_ref())?;

    if !limiter.check(&upgrade_request.remote_ip) {
        metrics.rate_limit_rejections_total.inc();
        return Err(StatusError::too_many_requests());
    }

    let room = hub.get_or_create(&upgrade_request.room_id).await;
    let codec = codec_for_subprotocol(upgrade_request.subprotocol.as_deref()).into();
    let session_config = SessionConfig {
        max_frame_bytes: env.max_frame_bytes,
        heartbeat_interval: env.heartbeat_interval,
        read_timeout: env.read_timeout,
        ..SessionConfig::default()
    };
    let metrics = metrics.clone();
    let identity = upgrade_request.identity;
    let reconnect_token = upgrade_request.reconnect_token;

    WebSocketUpgrade::new()
        .upgrade(req, res, move |ws| async move {
            let user_id = identity.subject.clone();
            let session = ClientSession::spawn(
                user_id.clone(),
                Role::Waiting,
                ws,
                codec,
                session_config,
                room.clone(),
                metrics.clone(),
            );
            metrics.active_connections.inc();

            let member = Arc::new(LocalMember::new(session));
            let joined = match reconnect_token {
                Some(token) => room.submit(room::Command::Reconnect { user_id: user_id.clone(), identity, prior_session: token, member }),
                None => room.submit(room::Command::Join { user_id: user_id.clone(), identity, member }),
            };

            if joined.is_err() {
                tracing::warn!(%user_id, "room vanished before admission could be submitted");
            }
        })
        .await
        .map_err(|_| StatusError::internal_server_error())
}

/// `GET /metrics`: Prometheus text exposition.
#[handler]
pub async fn metrics_endpoint(res: &mut Response, depot: &mut Depot) {
    let metrics = depot.obtain::<Arc<Metrics>>().expect("metrics must be injected");
    res.render(metrics.encode());
}

/// `GET /health/live`: process is up and accepting connections.
#[handler]
pub async fn health_live(res: &mut Response) {
    res.render("ok");
}

/// `GET /health/ready`: the coordination bus and the SFU are both reachable.
#[handler]
pub async fn health_ready(res: &mut Response, depot: &mut Depot) {
    let hub = depot.obtain::<Arc<Hub>>().expect("hub must be injected");
    if hub.readiness().await {
        res.render("ready");
    } else {
        res.status_code(StatusCode::SERVICE_UNAVAILABLE);
        res.render("degraded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::TokenBucketRateLimiter;
    use coordination_bus::LocalBus;
    use sfu_client::{CircuitBreakerConfig, SfuClient};

    fn test_hub() -> Hub {
        Hub::new(
            Arc::new(LocalBus::new()),
            Arc::new(SfuClient::new("http://127.0.0.1:1", CircuitBreakerConfig::default())),
            false,
            Arc::new(Metrics::new()),
            Arc::new(TokenBucketRateLimiter::new(1_000)),
            RoomSettings::default(),
        )
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_handle_for_repeat_calls() {
        let hub = test_hub();
        let first = hub.get_or_create("room-1").await;
        let second = hub.get_or_create("room-1").await;
        assert_eq!(first.room_id, second.room_id);
        assert_eq!(hub.rooms.len(), 1);
    }

    #[tokio::test]
    async fn get_or_create_spawns_distinct_rooms_for_distinct_ids() {
        let hub = test_hub();
        hub.get_or_create("room-1").await;
        hub.get_or_create("room-2").await;
        assert_eq!(hub.rooms.len(), 2);
    }

    #[tokio::test]
    async fn readiness_is_true_when_the_bus_is_reachable_and_sfu_checks_are_disabled() {
        let hub = test_hub();
        assert!(hub.readiness().await);
    }
}
