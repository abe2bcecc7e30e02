//! Multi-server client: discovery-driven selection, per-address
//! connection caching, and fan-out broadcast.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::warn;

use crate::client::Client;
use crate::codec::Encoding;
use crate::discovery::{Discovery, SelectMode};
use crate::error::Error;
use crate::wire::Options;

/// Dial a discovery-style address: `tcp@host:port`, `unix@/path`, or a
/// bare `host:port` which defaults to TCP.
pub async fn xdial(rpc_addr: &str, options: Options) -> Result<Client, Error> {
    match rpc_addr.split_once('@') {
        None => Client::dial(rpc_addr, options).await,
        Some(("tcp", addr)) => Client::dial(addr, options).await,
        #[cfg(unix)]
        Some(("unix", path)) => Client::dial_unix(path, options).await,
        Some(_) => Err(Error::BadAddress(rpc_addr.to_string())),
    }
}

struct XClientInner {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    options: Options,
    encoding: Encoding,
    clients: AsyncMutex<HashMap<String, Client>>,
}

/// Client over a fleet of servers.
///
/// Calls pick an address through the discovery and reuse one cached
/// [`Client`] per address; cached clients that went unavailable are
/// closed and replaced on demand. Cheap to clone.
#[derive(Clone)]
pub struct XClient {
    inner: Arc<XClientInner>,
}

impl XClient {
    /// Fails fast if the options name an unknown codec tag, since every
    /// pooled connection will use it.
    pub fn new(
        discovery: Arc<dyn Discovery>,
        mode: SelectMode,
        options: Options,
    ) -> Result<XClient, Error> {
        let encoding = Encoding::from_tag(&options.codec_type)?;
        Ok(XClient {
            inner: Arc::new(XClientInner {
                discovery,
                mode,
                options,
                encoding,
                clients: AsyncMutex::new(HashMap::new()),
            }),
        })
    }

    /// Get-or-dial the cached client for an address.
    async fn dial(&self, rpc_addr: &str) -> Result<Client, Error> {
        let mut clients = self.inner.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            if let Some(stale) = clients.remove(rpc_addr) {
                let _ = stale.close();
            }
        }
        let client = xdial(rpc_addr, self.inner.options.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    async fn call_addr<A, R>(&self, rpc_addr: &str, service_method: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let client = self.dial(rpc_addr).await?;
        client.call(service_method, args).await
    }

    /// Call one server, selected by the configured mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc_addr = self.inner.discovery.get(self.inner.mode).await?;
        self.call_addr(&rpc_addr, service_method, args).await
    }

    /// Call every known server with the same arguments.
    ///
    /// Each sub-call decodes into its own fresh reply value, so replies
    /// never clobber each other mid-flight. The first failure aborts the
    /// remaining sub-calls and becomes the result; otherwise the first
    /// reply to arrive wins. With no servers and no failures the reply is
    /// the default value.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned + Default + Send + 'static,
    {
        let servers = self.inner.discovery.get_all().await?;
        let body = self.inner.encoding.encode(args)?;
        let mut tasks: JoinSet<Result<R, Error>> = JoinSet::new();
        for rpc_addr in servers {
            let xclient = self.clone();
            let service_method = service_method.to_string();
            let body = body.clone();
            let encoding = self.inner.encoding;
            tasks.spawn(async move {
                let client = xclient.dial(&rpc_addr).await?;
                let raw = client.call_raw(&service_method, body).await?;
                encoding.decode(&raw)
            });
        }
        let mut first_err: Option<Error> = None;
        let mut first_reply: Option<R> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(reply)) => {
                    if first_reply.is_none() {
                        first_reply = Some(reply);
                    }
                }
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                        // Fail fast: pull the plug on every sibling call.
                        tasks.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    warn!("rpc xclient: broadcast task failed: {}", e);
                    if first_err.is_none() {
                        first_err = Some(Error::Remote(format!(
                            "rpc xclient: broadcast task failed: {}",
                            e
                        )));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(first_reply.unwrap_or_default()),
        }
    }

    /// Close and forget every pooled client.
    pub async fn close(&self) {
        let mut clients = self.inner.clients.lock().await;
        for (rpc_addr, client) in clients.drain() {
            if let Err(e) = client.close() {
                if !matches!(e, Error::Shutdown) {
                    warn!("rpc xclient: closing {}: {}", rpc_addr, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MultiServersDiscovery;
    use crate::server::Server;
    use crate::service::ServiceBuilder;

    struct Echo;

    async fn echo_server() -> std::net::SocketAddr {
        let server = Arc::new(Server::new());
        let service = ServiceBuilder::new(Echo)
            .method("Echo", |_e, n: i64, _reply: i64| async move { Ok(n) })
            .build();
        server.register(service).unwrap();
        server.listen("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn unknown_protocol_is_rejected() {
        let err = xdial("http@127.0.0.1:1", Options::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadAddress(_)));
    }

    #[tokio::test]
    async fn pool_reuses_and_evicts() {
        let addr = echo_server().await;
        let rpc_addr = format!("tcp@{}", addr);
        let discovery = Arc::new(MultiServersDiscovery::new(vec![rpc_addr.clone()]));
        let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default()).unwrap();

        let n: i64 = xclient.call("Echo.Echo", &5i64).await.unwrap();
        assert_eq!(n, 5);

        // Same address, same cached connection: the seq counter is shared,
        // so calls through both handles keep increasing.
        let first = xclient.dial(&rpc_addr).await.unwrap();
        let again = xclient.dial(&rpc_addr).await.unwrap();
        let call_a = first.go("Echo.Echo", &1i64);
        let call_b = again.go("Echo.Echo", &2i64);
        assert!(call_b.seq() > call_a.seq());
        call_a.finish().await.unwrap();
        call_b.finish().await.unwrap();

        // A closed client is evicted and replaced on the next call.
        first.close().unwrap();
        assert!(!first.is_available());
        let n: i64 = xclient.call("Echo.Echo", &6i64).await.unwrap();
        assert_eq!(n, 6);

        xclient.close().await;
    }
}
