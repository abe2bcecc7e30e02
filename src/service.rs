//! Service registration and dispatch.
//!
//! A service is a user object whose methods are exposed as RPC endpoints
//! under `"Service.Method"` names. Registration is a typed builder: each
//! method closure has the shape `(receiver, args, reply) -> Result<reply>`,
//! and the builder erases it into a handler working on raw body bytes so
//! the server can dispatch by name without knowing any argument types.
//!
//! The reply cell handed to a handler is freshly `Default`-constructed per
//! request, so map- and list-shaped replies start out as empty containers
//! the handler can extend without any further setup.

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::codec::Encoding;

/// Error returned by a user handler; its message travels verbatim in the
/// response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError {
            message: message.to_string(),
        }
    }
}

type ErasedHandler =
    Box<dyn Fn(Encoding, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> + Send + Sync>;

/// One admitted method: the erased handler plus its call counter.
struct Method {
    handler: ErasedHandler,
    num_calls: AtomicU64,
}

/// A named set of callable methods built from one receiver object.
pub struct Service {
    name: String,
    methods: HashMap<String, Method>,
}

impl Service {
    /// The name requests use to address this service.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// How many times a method has been invoked, if it exists.
    pub fn num_calls(&self, method: &str) -> Option<u64> {
        self.methods
            .get(method)
            .map(|m| m.num_calls.load(Ordering::Relaxed))
    }

    /// Invoke a method on a raw request body.
    ///
    /// Decodes the arguments, runs the user future, encodes the reply.
    /// Every failure mode collapses into a [`HandlerError`] whose message
    /// goes back to the caller in the response header.
    pub async fn call(
        &self,
        method: &str,
        encoding: Encoding,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, HandlerError> {
        let m = self
            .methods
            .get(method)
            .ok_or_else(|| HandlerError::new("rpc server: cannot find method"))?;
        m.num_calls.fetch_add(1, Ordering::Relaxed);
        (m.handler)(encoding, body).await
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &names)
            .finish()
    }
}

/// Typed builder turning a receiver object into a [`Service`].
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: HashMap<String, Method>,
}

impl<T: Send + Sync + 'static> ServiceBuilder<T> {
    /// Start a service named after the receiver's type.
    ///
    /// The name is the rightmost segment of the type path, mirroring how a
    /// reflective registry would read the unindirected type name.
    pub fn new(receiver: T) -> Self {
        Self::named(short_type_name::<T>(), receiver)
    }

    /// Start a service with an explicit name.
    pub fn named(name: impl Into<String>, receiver: T) -> Self {
        ServiceBuilder {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        }
    }

    /// Admit one method.
    ///
    /// `f` is invoked per request with the shared receiver, the decoded
    /// arguments, and a `Default`-initialized reply cell; it returns the
    /// populated reply or an error whose message is sent to the caller.
    ///
    /// # Panics
    ///
    /// Panics if a method with the same name was already admitted; that is
    /// a registration-time programming error, not a runtime condition.
    pub fn method<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        F: Fn(Arc<T>, A, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let receiver = Arc::clone(&self.receiver);
        let f = Arc::new(f);
        let handler: ErasedHandler = Box::new(move |encoding, body| {
            let receiver = Arc::clone(&receiver);
            let f = Arc::clone(&f);
            Box::pin(async move {
                let args: A = encoding.decode(&body).map_err(|e| {
                    HandlerError::new(format!("rpc server: invalid request body: {}", e))
                })?;
                let reply = (*f)(receiver, args, R::default()).await?;
                encoding.encode(&reply).map_err(|e| {
                    HandlerError::new(format!("rpc server: encode reply error: {}", e))
                })
            })
        });
        let method = Method {
            handler,
            num_calls: AtomicU64::new(0),
        };
        if self.methods.insert(name.to_string(), method).is_some() {
            panic!(
                "rpc server: method {}.{} registered twice",
                self.name, name
            );
        }
        debug!("rpc server: register {}.{}", self.name, name);
        self
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
