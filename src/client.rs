//! Client session: one connection, many concurrent calls.
//!
//! A [`Client`] multiplexes calls over a single connection. [`Client::go`]
//! encodes the arguments, registers the call in the pending table (which
//! assigns the sequence number), and hands the message to the connection's
//! write task. A receive task reads responses and completes pending calls
//! by sequence number, in whatever order the server finished them.
//!
//! Wire writes are strictly serialized by the write task, which owns the
//! write half outright and can never be cancelled in the middle of a
//! frame. The state mutex guards the pending table and flags and is never
//! held across I/O.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::codec::Encoding;
use crate::error::Error;
use crate::wire::{self, FrameReader, FrameWriter, Header, Options};

type Completion = oneshot::Sender<Result<Vec<u8>, Error>>;

struct State {
    seq: u64,
    pending: HashMap<u64, Completion>,
    /// Local close requested.
    closing: bool,
    /// The stream or the peer failed.
    shutdown: bool,
}

struct ClientInner {
    encoding: Encoding,
    write_tx: mpsc::UnboundedSender<(Header, Vec<u8>)>,
    state: Mutex<State>,
    close_tx: watch::Sender<bool>,
}

impl ClientInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_call(&self, seq: u64) -> Option<Completion> {
        self.lock_state().pending.remove(&seq)
    }

    /// Fail every pending call and refuse all future ones.
    fn terminate_calls(&self, err: Error) {
        let mut state = self.lock_state();
        state.shutdown = true;
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

/// An in-flight call handed back by [`Client::go`].
///
/// Await [`Call::finish`] for the outcome. Dropping an unfinished `Call`
/// deregisters it: the response, if it ever arrives, is discarded by the
/// receive loop as an unknown sequence number.
pub struct Call {
    seq: u64,
    service_method: String,
    client: Weak<ClientInner>,
    done: oneshot::Receiver<Result<Vec<u8>, Error>>,
    completed: bool,
}

impl Call {
    /// Sequence number assigned at registration; zero if the call never
    /// made it into the pending table.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Wait for the single completion of this call.
    pub async fn finish(mut self) -> Result<Vec<u8>, Error> {
        let outcome = (&mut self.done).await;
        self.completed = true;
        match outcome {
            Ok(result) => result,
            // The completion sender vanished without firing; the client
            // is gone.
            Err(_) => Err(Error::Shutdown),
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if self.completed || self.seq == 0 {
            return;
        }
        // Cancellation: race the receive loop for the pending entry. The
        // loser observes a missing entry and does nothing.
        if let Some(inner) = self.client.upgrade() {
            inner.remove_call(self.seq);
        }
    }
}

/// RPC client over one connection. Cheap to clone; all clones share the
/// connection and its pending table.
///
/// The connection's tasks only hold weak references, so dropping the last
/// `Client` handle shuts the connection down even without an explicit
/// [`Client::close`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client over an established stream: resolve the codec tag,
    /// write the handshake, start the write and receive tasks.
    pub async fn new<S>(stream: S, options: Options) -> Result<Client, Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let encoding = Encoding::from_tag(&options.codec_type)?;
        let (reader, mut writer) = wire::split(stream);
        writer.write_handshake(&options).await?;
        let (close_tx, close_rx) = watch::channel(false);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            encoding,
            write_tx,
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            close_tx,
        });
        tokio::spawn(write_loop(
            Arc::downgrade(&inner),
            encoding,
            writer,
            write_rx,
            close_rx.clone(),
        ));
        tokio::spawn(receive(Arc::downgrade(&inner), encoding, reader, close_rx));
        Ok(Client { inner })
    }

    /// Connect over TCP, honoring `options.connect_timeout` for the whole
    /// connect-plus-handshake sequence.
    pub async fn dial(addr: &str, options: Options) -> Result<Client, Error> {
        dial_timeout(Client::new, addr, options).await
    }

    /// Connect over a Unix domain socket, with the same timeout handling
    /// as [`Client::dial`].
    #[cfg(unix)]
    pub async fn dial_unix(path: &str, options: Options) -> Result<Client, Error> {
        let timeout = options.connect_timeout;
        let fut = async move {
            let stream = UnixStream::connect(path).await?;
            Client::new(stream, options).await
        };
        await_connect(timeout, fut).await
    }

    /// The encoding negotiated for this connection.
    pub fn encoding(&self) -> Encoding {
        self.inner.encoding
    }

    /// True until `close` is called or the connection fails.
    pub fn is_available(&self) -> bool {
        let state = self.inner.lock_state();
        !state.closing && !state.shutdown
    }

    /// Start a call and return its in-flight handle.
    pub fn go<A: Serialize>(&self, service_method: &str, args: &A) -> Call {
        match self.inner.encoding.encode(args) {
            Ok(body) => self.go_raw(service_method, body),
            Err(e) => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(e));
                Call {
                    seq: 0,
                    service_method: service_method.to_string(),
                    client: Arc::downgrade(&self.inner),
                    done: rx,
                    completed: false,
                }
            }
        }
    }

    /// Start a call whose body is already encoded with this connection's
    /// codec.
    pub fn go_raw(&self, service_method: &str, body: Vec<u8>) -> Call {
        let (tx, rx) = oneshot::channel();
        let mut call = Call {
            seq: 0,
            service_method: service_method.to_string(),
            client: Arc::downgrade(&self.inner),
            done: rx,
            completed: false,
        };
        let seq = {
            let mut state = self.inner.lock_state();
            if state.closing || state.shutdown {
                drop(state);
                let _ = tx.send(Err(Error::Shutdown));
                return call;
            }
            let seq = state.seq;
            state.seq += 1;
            state.pending.insert(seq, tx);
            seq
        };
        call.seq = seq;
        let header = Header {
            service_method: call.service_method.clone(),
            seq,
            error: String::new(),
        };
        if self.inner.write_tx.send((header, body)).is_err() {
            // The write task is gone, so nothing was put on the wire.
            if let Some(tx) = self.inner.remove_call(seq) {
                let _ = tx.send(Err(Error::Shutdown));
            }
        }
        call
    }

    /// Call and wait: the synchronous wrapper over [`Client::go`].
    ///
    /// Cancel-safe: dropping the returned future deregisters the call.
    /// Deadline cancellation is `tokio::time::timeout` around this call.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = self.go(service_method, args).finish().await?;
        self.inner.encoding.decode(&body)
    }

    /// [`Client::call`] on a pre-encoded body, returning the raw reply.
    pub async fn call_raw(&self, service_method: &str, body: Vec<u8>) -> Result<Vec<u8>, Error> {
        self.go_raw(service_method, body).finish().await
    }

    /// Close the connection. The write half shuts down, the receive loop
    /// terminates every call still pending. A second close reports
    /// [`Error::Shutdown`].
    pub fn close(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.lock_state();
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        let _ = self.inner.close_tx.send(true);
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("Client")
            .field("encoding", &self.inner.encoding)
            .field("pending", &state.pending.len())
            .field("closing", &state.closing)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// Write task: the only owner of the write half, so frames are strictly
/// serialized and never torn by a cancelled caller.
///
/// Exits on explicit close, or once every `Client` handle is gone and the
/// queue has drained; either way the write half is shut down.
async fn write_loop(
    inner: Weak<ClientInner>,
    encoding: Encoding,
    mut writer: FrameWriter,
    mut write_rx: mpsc::UnboundedReceiver<(Header, Vec<u8>)>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let (header, body) = tokio::select! {
            biased;
            _ = close_rx.changed() => break,
            job = write_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        if let Err(e) = writer.write_message(encoding, &header, &body).await {
            debug!("rpc client: write error on seq {}: {}", header.seq, e);
            // Partial send: complete the call unless the response already
            // raced in through the receive loop. Later jobs fail the same
            // way until the receive side tears the connection down.
            if let Some(client) = inner.upgrade() {
                if let Some(tx) = client.remove_call(header.seq) {
                    let _ = tx.send(Err(e));
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Receive loop: match responses to pending calls until the stream fails
/// or close is signaled (explicitly, or by the last `Client` handle going
/// away), then fail whatever is left.
async fn receive(
    inner: Weak<ClientInner>,
    encoding: Encoding,
    mut reader: FrameReader,
    mut close_rx: watch::Receiver<bool>,
) {
    let err = loop {
        let header = tokio::select! {
            biased;
            _ = close_rx.changed() => break Error::Shutdown,
            res = reader.read_header(encoding) => match res {
                Ok(Some(header)) => header,
                Ok(None) => break Error::Shutdown,
                Err(e) => break e,
            },
        };
        trace!(
            "rpc client: response seq {} for {}",
            header.seq,
            header.service_method
        );
        let Some(client) = inner.upgrade() else {
            break Error::Shutdown;
        };
        match client.remove_call(header.seq) {
            None => {
                // The request failed to fully send or was cancelled, yet
                // the server still answered. Consume and discard the body.
                if let Err(e) = reader.read_body().await {
                    break e;
                }
            }
            Some(tx) if !header.error.is_empty() => {
                let remote = Error::Remote(header.error);
                match reader.read_body().await {
                    Ok(_) => {
                        let _ = tx.send(Err(remote));
                    }
                    Err(e) => {
                        let _ = tx.send(Err(remote));
                        break e;
                    }
                }
            }
            Some(tx) => match reader.read_body().await {
                Ok(body) => {
                    let _ = tx.send(Ok(body));
                }
                Err(e) => {
                    let _ = tx.send(Err(Error::ReadBody(e.to_string())));
                    break e;
                }
            },
        }
    };
    debug!("rpc client: receive loop done: {}", err);
    if let Some(client) = inner.upgrade() {
        client.terminate_calls(err);
    }
}

async fn await_connect<F>(timeout: Duration, fut: F) -> Result<Client, Error>
where
    F: Future<Output = Result<Client, Error>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectTimeout(timeout)),
    }
}

/// Dial with a pluggable client constructor so slow handshakes can be
/// exercised in tests; the timeout covers connect plus construction.
async fn dial_timeout<F, Fut>(new_client: F, addr: &str, options: Options) -> Result<Client, Error>
where
    F: FnOnce(TcpStream, Options) -> Fut,
    Fut: Future<Output = Result<Client, Error>>,
{
    let timeout = options.connect_timeout;
    let fut = async move {
        let stream = TcpStream::connect(addr).await?;
        new_client(stream, options).await
    };
    await_connect(timeout, fut).await
}
