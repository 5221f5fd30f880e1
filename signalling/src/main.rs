use std::sync::Arc;

use salvo::catcher::Catcher;
use salvo::conn::rustls::{Keycert, RustlsConfig};
use salvo::cors::{Any, Cors};
use salvo::prelude::*;
use sfu_client::{CircuitBreakerConfig, SfuClient};

use signalling::config::AppEnv;
use signalling::hub::{self, Hub};
use signalling::identity::{JwtTokenValidator, TokenValidator};
use signalling::metrics::Metrics;
use signalling::rate_limit::{ConnectionRateLimiter, TokenBucketRateLimiter};
use signalling::room::RoomSettings;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt().init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let env = AppEnv::new();
    let http_addr = format!("0.0.0.0:{}", env.listen_port);

    let cert = include_bytes!("../../certificates/cert.pem").to_vec();
    let key = include_bytes!("../../certificates/key.pem").to_vec();
    let config = RustlsConfig::new(Keycert::new().cert(cert.as_slice()).key(key.as_slice()));

    let metrics = Arc::new(Metrics::new());

    let bus: Arc<dyn coordination_bus::CoordinationBus> = if env.coordination.enabled {
        Arc::new(coordination_bus::RedisBus::new(&env.coordination.address)?)
    } else {
        Arc::new(coordination_bus::LocalBus::new())
    };

    let breaker_config = CircuitBreakerConfig {
        failure_threshold: env.circuit_breaker.failure_threshold,
        open_timeout: env.circuit_breaker.open_timeout,
        half_open_max_requests: env.circuit_breaker.half_open_max_requests,
    };
    let sfu = Arc::new(
        SfuClient::new(env.sfu.address.clone(), breaker_config)
            .with_metrics(metrics.circuit_breaker_state.clone(), metrics.circuit_breaker_failures_total.clone()),
    );

    let validator: Arc<dyn TokenValidator> = Arc::new(JwtTokenValidator::new(
        &env.jwt.hmac_secret,
        env.jwt.audience.as_deref(),
        env.jwt.issuer_or_jwks_url.as_deref(),
    ));
    let rate_limiter: Arc<dyn ConnectionRateLimiter> = Arc::new(TokenBucketRateLimiter::new(env.rate_limits.per_ip_per_minute));
    let event_rate_limiter: Arc<dyn ConnectionRateLimiter> = Arc::new(TokenBucketRateLimiter::new(env.rate_limits.per_user_per_minute));

    let room_settings = RoomSettings {
        require_approval: false,
        max_participants: 500,
        reconnect_grace: env.reconnect_grace,
        chat_history_capacity: env.chat_history_capacity,
    };
    let hub = Arc::new(Hub::new(
        bus,
        sfu,
        env.sfu.health_check_enabled,
        metrics.clone(),
        event_rate_limiter,
        room_settings,
    ));

    let ws_router = Router::with_path(format!("{}/{{room_id}}", env.ws_path.trim_end_matches('/'))).get(hub::upgrade);
    let operational_router = Router::new()
        .push(Router::with_path("metrics").get(hub::metrics_endpoint))
        .push(Router::with_path("health/live").get(hub::health_live))
        .push(Router::with_path("health/ready").get(hub::health_ready));

    let cors = Cors::new()
        .allow_origin(Any)
        .allow_methods(vec![salvo::http::Method::GET])
        .into_handler();

    let router = Router::new()
        .hoop(Logger::new())
        .hoop(affix_state::inject(env.clone()))
        .hoop(affix_state::inject(validator))
        .hoop(affix_state::inject(rate_limiter))
        .hoop(affix_state::inject(hub.clone()))
        .hoop(affix_state::inject(metrics))
        .hoop(CatchPanic::new())
        .push(ws_router)
        .push(operational_router);

    let service = Service::new(router).hoop(cors).catcher(Catcher::default().hoop(handle404));

    let listener = TcpListener::new(http_addr).rustls(config);
    let acceptor = listener.bind().await;
    let server = Server::new(acceptor);
    let server_handle = server.handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl_c");
        tracing::info!("signal received, shutting down gracefully");
        server_handle.stop_graceful(None);
    });

    server.serve(service).await;

    Ok(())
}

#[handler]
async fn handle404(res: &mut Response, ctrl: &mut FlowCtrl) {
    if res.status_code.unwrap_or(StatusCode::NOT_FOUND) == StatusCode::NOT_FOUND {
        res.render("not found");
        ctrl.skip_rest();
    }
}
