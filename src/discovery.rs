//! Server-list discovery for the multi-server client.
//!
//! A discovery hands out server addresses: either a fixed seed list or a
//! list refreshed from the registry's HTTP endpoint. Selection is by
//! mode; round-robin starts at a random offset so a fleet of processes
//! does not converge on the same first server.

use async_trait::async_trait;
use rand::Rng;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::error::Error;
use crate::registry::SERVERS_HEADER;

/// How the next server is picked out of the current list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly random.
    Random,
    /// Rotate through the list, starting at a random offset.
    RoundRobin,
}

/// A mutable list of server addresses with selection.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Bring the list up to date, if the discovery has a source to pull
    /// from.
    async fn refresh(&self) -> Result<(), Error>;

    /// Replace the list.
    async fn update(&self, servers: Vec<String>) -> Result<(), Error>;

    /// Pick one server.
    async fn get(&self, mode: SelectMode) -> Result<String, Error>;

    /// A copy of the whole list.
    async fn get_all(&self) -> Result<Vec<String>, Error>;
}

struct ServerList {
    servers: Vec<String>,
    index: usize,
}

/// Discovery over a caller-maintained list; `refresh` is a no-op.
pub struct MultiServersDiscovery {
    inner: Mutex<ServerList>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        // Random starting point so processes don't all begin at entry 0.
        let index = rand::thread_rng().gen::<u32>() as usize;
        MultiServersDiscovery {
            inner: Mutex::new(ServerList { servers, index }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerList> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), Error> {
        self.lock().servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, Error> {
        let mut inner = self.lock();
        let n = inner.servers.len();
        if n == 0 {
            return Err(Error::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => {
                let pick = rand::thread_rng().gen_range(0..n);
                Ok(inner.servers[pick].clone())
            }
            SelectMode::RoundRobin => {
                let server = inner.servers[inner.index % n].clone();
                inner.index = (inner.index + 1) % n;
                Ok(server)
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>, Error> {
        Ok(self.lock().servers.clone())
    }
}

/// Default window between registry refreshes.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery backed by the registry HTTP endpoint.
///
/// The server list is refreshed lazily: `get` and `get_all` first call
/// `refresh`, which only goes to the network once the refresh window has
/// elapsed since the last update.
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry: String,
    refresh_timeout: Duration,
    last_update: AsyncMutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// `registry` is the full URL of the registry endpoint. A zero
    /// `refresh_timeout` selects the default window.
    pub fn new(registry: impl Into<String>, refresh_timeout: Duration) -> Self {
        let refresh_timeout = if refresh_timeout.is_zero() {
            DEFAULT_REFRESH_TIMEOUT
        } else {
            refresh_timeout
        };
        RegistryDiscovery {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry: registry.into(),
            refresh_timeout,
            last_update: AsyncMutex::new(None),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), Error> {
        let mut last_update = self.last_update.lock().await;
        if let Some(at) = *last_update {
            if at.elapsed() < self.refresh_timeout {
                return Ok(());
            }
        }
        debug!("rpc discovery: refresh servers from registry {}", self.registry);
        let response = self.http.get(&self.registry).send().await.map_err(|e| {
            warn!("rpc discovery: refresh error: {}", e);
            Error::Registry(e.to_string())
        })?;
        let raw = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let servers: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.servers.update(servers).await?;
        *last_update = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), Error> {
        self.servers.update(servers).await?;
        *self.last_update.lock().await = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, Error> {
        self.refresh().await?;
        self.servers.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>, Error> {
        self.refresh().await?;
        self.servers.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn seed() -> Vec<String> {
        vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()]
    }

    #[tokio::test]
    async fn empty_list_has_no_servers() {
        let d = MultiServersDiscovery::new(Vec::new());
        assert!(matches!(
            d.get(SelectMode::Random).await,
            Err(Error::NoAvailableServers)
        ));
        assert!(matches!(
            d.get(SelectMode::RoundRobin).await,
            Err(Error::NoAvailableServers)
        ));
    }

    #[tokio::test]
    async fn round_robin_visits_everyone_twice_in_rotation() {
        let d = MultiServersDiscovery::new(seed());
        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(d.get(SelectMode::RoundRobin).await.unwrap());
        }
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for p in &picks {
            *counts.entry(p.as_str()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 2));
        // Consistent rotation: the second lap repeats the first.
        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_eq!(picks[2], picks[5]);
    }

    #[tokio::test]
    async fn random_picks_a_member() {
        let d = MultiServersDiscovery::new(seed());
        for _ in 0..16 {
            let pick = d.get(SelectMode::Random).await.unwrap();
            assert!(seed().contains(&pick));
        }
    }

    #[tokio::test]
    async fn update_replaces_the_list() {
        let d = MultiServersDiscovery::new(seed());
        d.update(vec!["only:9".to_string()]).await.unwrap();
        assert_eq!(d.get_all().await.unwrap(), vec!["only:9".to_string()]);
        assert_eq!(
            d.get(SelectMode::RoundRobin).await.unwrap(),
            "only:9".to_string()
        );
    }

    #[tokio::test]
    async fn registry_discovery_defaults_the_window() {
        let d = RegistryDiscovery::new("http://127.0.0.1:1/registry", Duration::ZERO);
        assert_eq!(d.refresh_timeout, DEFAULT_REFRESH_TIMEOUT);
        // A fresh update stamps the window, so no network refresh happens.
        d.update(seed()).await.unwrap();
        assert_eq!(d.get_all().await.unwrap().len(), 3);
    }
}
