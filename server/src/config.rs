//! Server configuration — all from environment variables.

use std::env;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

/// Europe/Istanbul has been fixed at UTC+03:00 since 2016.
const DEFAULT_UTC_OFFSET_SECS: i32 = 3 * 3600;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for WebSocket + REST.
    pub listen_addr: String,
    /// Redis connection string for the timeline store.
    pub redis_url: String,
    /// MQTT broker connection settings.
    pub mqtt: MqttConfig,
    /// Fixed offset the timestamp keys are rendered in.
    pub utc_offset: FixedOffset,
    /// Upper bound for a single write to one viewer.
    pub write_timeout: Duration,
    /// Server ping cadence while a viewer is live.
    pub ping_interval: Duration,
    /// A live viewer that sends nothing (not even a pong) for this long is dropped.
    pub idle_timeout: Duration,
    /// Allowed origin on the producer ingress. `None` allows any.
    pub cors_origin: Option<String>,
    /// Log level filter.
    pub log_level: String,
    /// Emit JSON log lines instead of the human formatter.
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Username and password; only applied when both are present.
    pub credentials: Option<(String, String)>,
    pub topic: String,
    pub keep_alive: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| {
            let port = env::var("HTTP_PORT").unwrap_or_else(|_| "8080".into());
            format!("0.0.0.0:{port}")
        });

        let utc_offset = parse_env("TIMESTAMP_UTC_OFFSET_SECS")
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(default_offset);

        Self {
            listen_addr,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://redis:6379/0".into()),
            mqtt: MqttConfig::from_env(),
            utc_offset,
            write_timeout: Duration::from_millis(parse_env("WS_WRITE_TIMEOUT_MS").unwrap_or(2000)),
            ping_interval: Duration::from_secs(parse_env("WS_PING_INTERVAL_SECS").unwrap_or(20)),
            idle_timeout: Duration::from_secs(parse_env("WS_IDLE_TIMEOUT_SECS").unwrap_or(60)),
            cors_origin: env::var("CORS_ORIGIN")
                .or_else(|_| env::var("DOMAIN"))
                .ok()
                .filter(|v| !v.is_empty()),
            log_level: env::var("RUST_LOG")
                .unwrap_or_else(|_| "nerede=info,tower_http=info".into()),
            log_json: env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false),
        }
    }
}

impl MqttConfig {
    pub fn from_env() -> Self {
        let default_port = parse_env("MQTT_PORT").unwrap_or(1883);
        let (host, port) = split_broker_addr(
            &env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".into()),
            default_port,
        );

        let credentials = match (env::var("MQTT_USERNAME"), env::var("MQTT_PASSWORD")) {
            (Ok(user), Ok(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        };

        Self {
            host,
            port,
            client_id: env::var("MQTT_CLIENT_NAME")
                .unwrap_or_else(|_| format!("nerede-{}", hostname())),
            credentials,
            topic: env::var("MQTT_TOPIC").unwrap_or_else(|_| "nerede/location".into()),
            keep_alive: Duration::from_secs(parse_env("MQTT_KEEP_ALIVE_SECS").unwrap_or(30)),
        }
    }
}

fn default_offset() -> FixedOffset {
    FixedOffset::east_opt(DEFAULT_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Accepts `host`, `host:port`, and `tcp://host:port` / `mqtt://host:port`.
fn split_broker_addr(raw: &str, default_port: u16) -> (String, u16) {
    let trimmed = raw
        .trim()
        .trim_start_matches("tcp://")
        .trim_start_matches("mqtt://")
        .trim_end_matches('/');

    match trimmed.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (trimmed.to_string(), default_port),
        },
        None => (trimmed.to_string(), default_port),
    }
}

fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into())
}
