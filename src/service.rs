//! Handler registry: named services exposing invokable methods.
//!
//! There is no runtime reflection here; a [`ServiceBuilder`] captures each
//! handler in a pair of erased thunks instead. `decode_args` turns raw body
//! bytes into the method's argument type, and `invoke` runs the handler and
//! encodes its reply. The canonical service name is taken from the
//! receiver's type name, so `ServiceBuilder::new(Arith)` registers as
//! `"Arith"` and its methods dispatch as `"Arith.Sum"`.
//!
//! Handlers have the shape
//! `Fn(Arc<Receiver>, Args) -> impl Future<Output = anyhow::Result<Reply>>`;
//! a handler error travels verbatim in the reply header.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::WireFormat;
use crate::error::{CodecError, ServerError};

pub(crate) type BoxedArgs = Box<dyn Any + Send>;

type DecodeFn = dyn Fn(WireFormat, &[u8]) -> Result<BoxedArgs, CodecError> + Send + Sync;
type InvokeFn =
    dyn Fn(BoxedArgs, WireFormat) -> BoxFuture<'static, Result<Vec<u8>, String>> + Send + Sync;

/// Erased metadata for one invokable method: argument decoding, the bound
/// invocation thunk, and a call counter.
pub struct MethodDescriptor {
    name: String,
    decode_fn: Box<DecodeFn>,
    invoke_fn: Box<InvokeFn>,
    calls: AtomicU64,
}

impl MethodDescriptor {
    /// The method name within its service.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Decode a request body into a freshly allocated argument value.
    pub(crate) fn decode_args(
        &self,
        format: WireFormat,
        body: &[u8],
    ) -> Result<BoxedArgs, CodecError> {
        (self.decode_fn)(format, body)
    }

    /// Invoke the handler. On success the returned bytes are the encoded
    /// reply; on failure the string goes into the reply header verbatim.
    pub(crate) fn invoke(
        &self,
        args: BoxedArgs,
        format: WireFormat,
    ) -> BoxFuture<'static, Result<Vec<u8>, String>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.invoke_fn)(args, format)
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("calls", &self.num_calls())
            .finish()
    }
}

/// A named collection of methods bound to one receiver.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl Service {
    /// The canonical service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of registered methods. An empty service is permitted.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Look up a method descriptor by name.
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name).map(Arc::as_ref)
    }

    pub(crate) fn method_arc(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.methods.get(name).cloned()
    }
}

/// Builds a [`Service`] from a receiver and a set of typed handlers.
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl<T: Send + Sync + 'static> ServiceBuilder<T> {
    /// Start a service named after the receiver's type.
    pub fn new(receiver: T) -> Self {
        Self::named(short_type_name::<T>(), receiver)
    }

    /// Start a service with an explicit name, for receivers whose type name
    /// is unsuitable (generics, conflicts).
    pub fn named(name: impl Into<String>, receiver: T) -> Self {
        Self {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        }
    }

    /// Register one method. The handler receives the shared receiver and a
    /// freshly decoded argument value, and returns its reply (the original
    /// out-parameter becomes the return value). Registering the same name
    /// twice replaces the earlier handler.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let name = name.into();
        let decode_fn: Box<DecodeFn> = Box::new(move |format: WireFormat, body: &[u8]| {
            let args: A = format.decode(body)?;
            Ok(Box::new(args) as BoxedArgs)
        });
        let receiver = Arc::clone(&self.receiver);
        let handler = Arc::new(handler);
        let invoke_fn: Box<InvokeFn> = Box::new(move |args: BoxedArgs, format: WireFormat| {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args = match args.downcast::<A>() {
                    Ok(args) => args,
                    Err(_) => return Err("rpc server: internal: argument type mismatch".to_string()),
                };
                match (*handler)(receiver, *args).await {
                    Ok(reply) => format
                        .encode(&reply)
                        .map_err(|err| format!("rpc server: encode reply failed: {err}")),
                    Err(err) => Err(err.to_string()),
                }
            })
        });
        self.methods.insert(
            name.clone(),
            Arc::new(MethodDescriptor {
                name,
                decode_fn,
                invoke_fn,
                calls: AtomicU64::new(0),
            }),
        );
        self
    }

    /// Validate the service name and produce the finished [`Service`].
    pub fn build(self) -> Result<Service, ServerError> {
        if !is_valid_service_name(&self.name) {
            return Err(ServerError::InvalidServiceName { name: self.name });
        }
        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// Last path segment of a type name, with any generic suffix stripped.
fn short_type_name<T>() -> String {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Service names must be plain uppercase-initial identifiers so they read
/// unambiguously inside `"Service.Method"`.
fn is_valid_service_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
