//! Server session: accept, handshake, read requests, dispatch, respond.
//!
//! Each connection gets one task running the serve loop; the loop reads
//! requests sequentially and spawns one task per request, so handlers run
//! concurrently while the read side stays single-threaded. All responses
//! for a connection funnel through one write half behind an async mutex,
//! held only across a single message write. Responses go out in whatever
//! order handlers finish, never interleaved.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::codec::Encoding;
use crate::error::Error;
use crate::service::Service;
use crate::wire::{self, FrameReader, FrameWriter, Header, MAGIC};

/// RPC server: a name-to-service map plus the connection machinery.
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Server {
    pub fn new() -> Server {
        Server {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register a service under its name.
    ///
    /// Returns the shared handle so callers can keep watching call
    /// counters. Registering two services with the same name fails.
    pub fn register(&self, service: Service) -> Result<Arc<Service>, Error> {
        let mut services = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(service.name()) {
            return Err(Error::DuplicateService);
        }
        let service = Arc::new(service);
        services.insert(service.name().to_string(), Arc::clone(&service));
        Ok(service)
    }

    /// Split `"Service.Method"` on its last dot and resolve both halves.
    fn find_service(&self, service_method: &str) -> Result<(Arc<Service>, String), Error> {
        let dot = service_method
            .rfind('.')
            .ok_or(Error::InvalidServiceMethod)?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let service = services
            .get(service_name)
            .cloned()
            .ok_or(Error::ServiceNotFound)?;
        if !service.has_method(method_name) {
            return Err(Error::MethodNotFound);
        }
        Ok((service, method_name.to_string()))
    }

    /// Bind a TCP listener and serve it in the background; returns the
    /// bound address (useful with port 0).
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tokio::spawn(Arc::clone(self).accept(listener));
        Ok(local)
    }

    /// Accept TCP connections until the listener fails, serving each on
    /// its own task.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    trace!("rpc server: connection from {}", peer);
                    let server = Arc::clone(&self);
                    tokio::spawn(server.serve_conn(stream));
                }
                Err(e) => {
                    warn!("rpc server: accept error: {}", e);
                    return;
                }
            }
        }
    }

    /// [`Server::accept`] for Unix domain sockets.
    #[cfg(unix)]
    pub async fn accept_unix(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(server.serve_conn(stream));
                }
                Err(e) => {
                    warn!("rpc server: accept error: {}", e);
                    return;
                }
            }
        }
    }

    /// Serve one connection: validate the handshake, then run the request
    /// loop until the client hangs up or the stream fails.
    pub async fn serve_conn<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, writer) = wire::split(stream);
        let options = match reader.read_handshake().await {
            Ok(options) => options,
            Err(e) => {
                warn!("rpc server: options error: {}", e);
                return;
            }
        };
        if options.magic != MAGIC {
            warn!("{}", Error::InvalidMagic(options.magic));
            return;
        }
        let encoding = match Encoding::from_tag(&options.codec_type) {
            Ok(encoding) => encoding,
            Err(e) => {
                warn!("rpc server: {}", e);
                return;
            }
        };
        self.serve_codec(reader, writer, encoding, options.handle_timeout)
            .await;
    }

    async fn serve_codec(
        self: Arc<Self>,
        mut reader: FrameReader,
        writer: FrameWriter,
        encoding: Encoding,
        handle_timeout: Duration,
    ) {
        let writer = Arc::new(AsyncMutex::new(writer));
        let mut handlers = JoinSet::new();
        loop {
            // Reap dispatch tasks that have already finished.
            while handlers.try_join_next().is_some() {}
            let header = match reader.read_header(encoding).await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    debug!("rpc server: read header error: {}", e);
                    break;
                }
            };
            let resolved = self.find_service(&header.service_method);
            // The body frame is consumed even when resolution failed, so
            // the next read still lands on a header frame.
            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(e) => {
                    debug!("rpc server: read body error: {}", e);
                    break;
                }
            };
            match resolved {
                Err(e) => {
                    let response = Header {
                        service_method: header.service_method,
                        seq: header.seq,
                        error: e.to_string(),
                    };
                    send_response(&writer, encoding, &response, &[]).await;
                }
                Ok((service, method)) => {
                    handlers.spawn(handle_request(
                        service,
                        method,
                        encoding,
                        header,
                        body,
                        Arc::clone(&writer),
                        handle_timeout,
                    ));
                }
            }
        }
        // Don't close under in-flight handlers.
        while handlers.join_next().await.is_some() {}
        let mut writer = writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("rpc server: close error: {}", e);
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

/// Run one request: invoke the handler on its own task and race it
/// against the handle timeout.
///
/// On timeout the error response is written immediately; the handler task
/// keeps running but its eventual result is dropped with the join handle,
/// so a late completion can never produce a second response for this seq.
async fn handle_request(
    service: Arc<Service>,
    method: String,
    encoding: Encoding,
    request: Header,
    body: Vec<u8>,
    writer: Arc<AsyncMutex<FrameWriter>>,
    handle_timeout: Duration,
) {
    let handler = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.call(&method, encoding, body).await })
    };
    let mut response = Header {
        service_method: request.service_method,
        seq: request.seq,
        error: String::new(),
    };
    let joined = if handle_timeout.is_zero() {
        handler.await
    } else {
        tokio::select! {
            joined = handler => joined,
            _ = tokio::time::sleep(handle_timeout) => {
                response.error = format!(
                    "rpc server: request handle timeout: expect within {:?}",
                    handle_timeout
                );
                send_response(&writer, encoding, &response, &[]).await;
                return;
            }
        }
    };
    match joined {
        Ok(Ok(reply)) => {
            send_response(&writer, encoding, &response, &reply).await;
        }
        Ok(Err(e)) => {
            response.error = e.to_string();
            send_response(&writer, encoding, &response, &[]).await;
        }
        Err(e) => {
            response.error = format!("rpc server: handler failed: {}", e);
            send_response(&writer, encoding, &response, &[]).await;
        }
    }
}

/// Write one response under the connection's write mutex.
async fn send_response(
    writer: &Arc<AsyncMutex<FrameWriter>>,
    encoding: Encoding,
    header: &Header,
    body: &[u8],
) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_message(encoding, header, body).await {
        warn!("rpc server: write response error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::service::{HandlerError, ServiceBuilder};
    use crate::wire::Options;
    use serde::{Deserialize, Serialize};
    use tokio::io::AsyncWriteExt;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SumArgs {
        num1: i64,
        num2: i64,
    }

    struct Foo;

    fn arith_server() -> Arc<Server> {
        let server = Arc::new(Server::new());
        let service = ServiceBuilder::new(Foo)
            .method("Sum", |_foo, args: SumArgs, reply: i64| async move {
                let _ = reply;
                Ok(args.num1 + args.num2)
            })
            .method("Div", |_foo, args: SumArgs, _reply: i64| async move {
                if args.num2 == 0 {
                    return Err(HandlerError::from("division by zero"));
                }
                Ok(args.num1 / args.num2)
            })
            .build();
        server.register(service).unwrap();
        server
    }

    #[test]
    fn find_service_error_kinds() {
        let server = arith_server();
        assert!(matches!(
            server.find_service("no-dot-here"),
            Err(Error::InvalidServiceMethod)
        ));
        assert!(matches!(
            server.find_service("Bar.Sum"),
            Err(Error::ServiceNotFound)
        ));
        assert!(matches!(
            server.find_service("Foo.Nope"),
            Err(Error::MethodNotFound)
        ));
        assert!(server.find_service("Foo.Sum").is_ok());
    }

    #[test]
    fn duplicate_registration_fails() {
        let server = arith_server();
        let again = ServiceBuilder::named("Foo", Foo).build();
        assert!(matches!(
            server.register(again),
            Err(Error::DuplicateService)
        ));
    }

    #[tokio::test]
    async fn serves_a_duplex_connection() {
        let server = arith_server();
        let (a, b) = tokio::io::duplex(256 * 1024);
        tokio::spawn(server.serve_conn(b));
        let client = Client::new(a, Options::default()).await.unwrap();
        let sum: i64 = client
            .call("Foo.Sum", &SumArgs { num1: 1, num2: 2 })
            .await
            .unwrap();
        assert_eq!(sum, 3);
        let err = client
            .call::<SumArgs, i64>("Foo.Div", &SumArgs { num1: 1, num2: 0 })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "division by zero");
    }

    #[tokio::test]
    async fn bad_magic_closes_the_connection() {
        let server = arith_server();
        let (mut a, b) = tokio::io::duplex(4096);
        let handle = tokio::spawn(server.serve_conn(b));
        a.write_all(b"{\"magic\":1,\"codec_type\":\"application/postcard\",\"connect_timeout\":0,\"handle_timeout\":0}\n")
            .await
            .unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_codec_tag_closes_the_connection() {
        let server = arith_server();
        let (mut a, b) = tokio::io::duplex(4096);
        let handle = tokio::spawn(server.serve_conn(b));
        let line = format!(
            "{{\"magic\":{},\"codec_type\":\"application/gob\",\"connect_timeout\":0,\"handle_timeout\":0}}\n",
            MAGIC
        );
        a.write_all(line.as_bytes()).await.unwrap();
        handle.await.unwrap();
    }
}
