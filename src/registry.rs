//! Heartbeat-driven server registry.
//!
//! A registry is a process-wide map from server address to the time it
//! last checked in. Servers POST their address periodically; clients GET
//! the live list. Everything rides one HTTP header, so the endpoint has
//! no body format to version.
//!
//! Entries are pruned lazily on GET. A zero registry timeout means every
//! entry is live forever and nothing is ever pruned.

use axum::extract::State;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::Error;

/// Path the registry serves under.
pub const DEFAULT_PATH: &str = "/_gorpc_/registry";

/// Header carrying addresses in both directions: the registering address
/// on POST, the comma-joined live list on GET.
pub const SERVERS_HEADER: &str = "GoRPC-Servers";

/// How long a registered server stays live without a heartbeat.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Address store with lazy expiry.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    /// A zero `timeout` keeps every entry live forever.
    pub fn new(timeout: Duration) -> Registry {
        Registry {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Register an address, or refresh its last-seen time.
    pub fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        servers.insert(addr.to_string(), Instant::now());
    }

    /// The sorted live list; expired entries are dropped on the way out.
    pub fn alive_servers(&self) -> Vec<String> {
        let timeout = self.timeout;
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        servers.retain(|_, last_seen| timeout.is_zero() || last_seen.elapsed() < timeout);
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// The axum surface at [`DEFAULT_PATH`]: POST registers, GET lists,
    /// anything else is 405.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(DEFAULT_PATH, any(handle))
            .with_state(self)
    }
}

async fn handle(
    State(registry): State<Arc<Registry>>,
    method: axum::http::Method,
    headers: HeaderMap,
) -> Response {
    match method.as_str() {
        "GET" => {
            let list = registry.alive_servers().join(",");
            match HeaderValue::from_str(&list) {
                Ok(value) => {
                    let mut out = HeaderMap::new();
                    out.insert(HeaderName::from_static("gorpc-servers"), value);
                    (StatusCode::OK, out).into_response()
                }
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
        "POST" => {
            let addr = headers
                .get(SERVERS_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|s| !s.is_empty());
            match addr {
                Some(addr) => {
                    registry.put_server(addr);
                    StatusCode::OK.into_response()
                }
                None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// Announce `addr` to the registry now and then on every period.
///
/// The first beat happens before this returns, so a failure to reach the
/// registry at startup is reported to the caller; afterwards the beat
/// runs on its own task until a POST fails. A zero `period` defaults to
/// the registry timeout minus a minute, leaving time for one beat before
/// expiry.
pub async fn heartbeat(
    registry: &str,
    addr: &str,
    period: Duration,
) -> Result<tokio::task::JoinHandle<()>, Error> {
    let period = if period.is_zero() {
        DEFAULT_TIMEOUT - Duration::from_secs(60)
    } else {
        period
    };
    let http = reqwest::Client::new();
    send_heartbeat(&http, registry, addr).await?;
    let registry = registry.to_string();
    let addr = addr.to_string();
    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; that beat was already sent.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&http, &registry, &addr).await {
                warn!("rpc server: heartbeat error: {}", e);
                return;
            }
        }
    }))
}

async fn send_heartbeat(http: &reqwest::Client, registry: &str, addr: &str) -> Result<(), Error> {
    debug!("{} send heartbeat to registry {}", addr, registry);
    http.post(registry)
        .header(SERVERS_HEADER, addr)
        .send()
        .await
        .map_err(|e| Error::Registry(e.to_string()))?;
    Ok(())
}
