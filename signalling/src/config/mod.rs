use std::time::Duration;

use dotenvy::dotenv;
use std::env;

/// Process-wide configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppEnv {
    pub listen_port: u16,
    pub ws_path: String,
    pub jwt: JwtConfig,
    pub allowed_origins: Vec<String>,
    pub sfu: SfuConfig,
    pub coordination: CoordinationConfig,
    pub rate_limits: RateLimitConfig,
    pub chat_history_capacity: usize,
    pub max_frame_bytes: usize,
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    pub reconnect_grace: Duration,
    pub circuit_breaker: CircuitBreakerSettings,
    pub log_level: String,
    pub env: Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub audience: Option<String>,
    pub issuer_or_jwks_url: Option<String>,
    pub hmac_secret: String,
}

#[derive(Debug, Clone)]
pub struct SfuConfig {
    pub address: String,
    pub health_check_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub address: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_ip_per_minute: u32,
    pub per_user_per_minute: u32,
    pub per_endpoint_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_max_requests: u32,
}

impl AppEnv {
    pub fn new() -> Self {
        dotenv().ok();

        Self {
            listen_port: Self::get_env("LISTEN_PORT", 3000),
            ws_path: Self::get_str_env("WS_PATH", "/ws".to_owned()),
            jwt: JwtConfig {
                audience: env::var("JWT_AUDIENCE").ok(),
                issuer_or_jwks_url: env::var("JWT_ISSUER_OR_JWKS_URL").ok(),
                hmac_secret: env::var("JWT_HMAC_SECRET")
                    .expect("JWT_HMAC_SECRET must be set"),
            },
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_owned()).collect())
                .unwrap_or_default(),
            sfu: SfuConfig {
                address: env::var("SFU_ADDRESS").expect("SFU_ADDRESS must be set"),
                health_check_enabled: Self::get_bool_env("SFU_HEALTH_CHECK_ENABLED", true),
            },
            coordination: CoordinationConfig {
                address: env::var("COORDINATION_STORE_ADDRESS").unwrap_or_default(),
                enabled: Self::get_bool_env("COORDINATION_STORE_ENABLED", false),
            },
            rate_limits: RateLimitConfig {
                per_ip_per_minute: Self::get_env("RATE_LIMIT_PER_IP_PER_MINUTE", 120),
                per_user_per_minute: Self::get_env("RATE_LIMIT_PER_USER_PER_MINUTE", 240),
                per_endpoint_per_minute: Self::get_env("RATE_LIMIT_PER_ENDPOINT_PER_MINUTE", 60),
            },
            chat_history_capacity: Self::get_env("CHAT_HISTORY_CAPACITY", 100u16) as usize,
            max_frame_bytes: Self::get_env("MAX_FRAME_BYTES", 262_144u32) as usize,
            heartbeat_interval: Duration::from_secs(Self::get_env("HEARTBEAT_INTERVAL_SECS", 30)),
            read_timeout: Duration::from_secs(Self::get_env("READ_TIMEOUT_SECS", 60)),
            reconnect_grace: Duration::from_secs(Self::get_env("RECONNECT_GRACE_SECS", 15)),
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: Self::get_env("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5),
                open_timeout: Duration::from_secs(Self::get_env("CIRCUIT_BREAKER_OPEN_TIMEOUT_SECS", 30)),
                half_open_max_requests: Self::get_env("CIRCUIT_BREAKER_HALF_OPEN_MAX_REQUESTS", 1),
            },
            log_level: Self::get_str_env("LOG_LEVEL", "info".to_owned()),
            env: match Self::get_str_env("APP_ENV", "dev".to_owned()).as_str() {
                "prod" | "production" => Environment::Prod,
                _ => Environment::Dev,
            },
        }
    }

    fn get_env<T: std::str::FromStr>(var: &str, default: T) -> T {
        env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn get_str_env(var: &str, default: String) -> String {
        env::var(var).ok().unwrap_or(default)
    }

    fn get_bool_env(var: &str, default: bool) -> bool {
        env::var(var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

impl Default for AppEnv {
    fn default() -> Self {
        Self::new()
    }
}
