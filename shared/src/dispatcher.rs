//! Message Dispatcher
//!
//! Keeps a registry of handlers keyed by [`MessageKey`] and fans each inbound
//! message out to the handlers registered under its key, then to the handlers
//! registered under the wildcard key.
//!
//! Every handler call is isolated: an `Err` or a panic is caught, handed to the
//! [`DispatchReporter`] and delivery continues with the next handler.
//!
//! The registry sits behind a lock that is only held long enough to clone the
//! two handler lists, so handlers may register or unregister from inside a
//! callback. Such changes apply from the next dispatch on.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::messages::{IntoMessageKeys, MessageKey};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

type HandlerFn<S, M> = dyn Fn(&S, &MessageKey, &M) -> anyhow::Result<()> + Send + Sync;

/// Identity of a handler, shared by all of its clones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// Callback invoked with (source link, message key, message)
///
/// Two handlers are equal when one is a clone of the other.
pub struct Handler<S: ?Sized, M> {
    id: HandlerId,
    callback: Arc<HandlerFn<S, M>>,
}

impl<S: ?Sized, M> Handler<S, M> {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&S, &MessageKey, &M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            id: HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed)),
            callback: Arc::new(callback),
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Invoke the callback directly, without any isolation
    pub fn call(&self, source: &S, key: &MessageKey, message: &M) -> anyhow::Result<()> {
        (self.callback)(source, key, message)
    }
}

impl<S: ?Sized, M> Clone for Handler<S, M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: self.callback.clone(),
        }
    }
}

impl<S: ?Sized, M> PartialEq for Handler<S, M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<S: ?Sized, M> Eq for Handler<S, M> {}

impl<S: ?Sized, M> fmt::Debug for Handler<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.id.0).finish()
    }
}

/// Why a handler failed
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// The handler returned an error
    Error(String),
    /// The handler panicked
    Panic(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Error(msg) => write!(f, "error: {}", msg),
            FailureCause::Panic(msg) => write!(f, "panic: {}", msg),
        }
    }
}

/// A handler failure caught during dispatch
#[derive(Debug, Clone)]
pub struct HandlerFailure<'a> {
    /// Key the message was dispatched under
    pub key: &'a MessageKey,
    pub handler: HandlerId,
    /// Failure happened in the wildcard group
    pub wildcard: bool,
    pub cause: FailureCause,
}

/// Side channel for handler failures
pub trait DispatchReporter: Send + Sync {
    fn handler_failed(&self, failure: &HandlerFailure<'_>);
}

/// Reports handler failures as `tracing` warnings
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl DispatchReporter for TracingReporter {
    fn handler_failed(&self, failure: &HandlerFailure<'_>) {
        warn!(
            key = %failure.key,
            handler = %failure.handler,
            wildcard = failure.wildcard,
            cause = %failure.cause,
            "Unable to handle message listener"
        );
    }
}

/// Routes messages to registered handlers
pub struct Dispatcher<S: ?Sized, M> {
    listeners: RwLock<HashMap<MessageKey, Vec<Handler<S, M>>>>,
    reporter: Arc<dyn DispatchReporter>,
}

impl<S: ?Sized, M> Dispatcher<S, M> {
    /// Create a dispatcher that reports failures through `tracing`
    pub fn new() -> Self {
        Self::with_reporter(Arc::new(TracingReporter))
    }

    pub fn with_reporter(reporter: Arc<dyn DispatchReporter>) -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            reporter,
        }
    }

    /// Add `handler` under each key; registering an existing pair is a no-op
    pub fn register(&self, keys: impl IntoMessageKeys, handler: &Handler<S, M>) {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        for key in keys.into_message_keys() {
            let handlers = listeners.entry(key).or_default();
            if !handlers.contains(handler) {
                handlers.push(handler.clone());
            }
        }
    }

    /// Remove `handler` from each key, dropping keys left without handlers
    pub fn unregister(&self, keys: impl IntoMessageKeys, handler: &Handler<S, M>) {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        for key in keys.into_message_keys() {
            if let Some(handlers) = listeners.get_mut(&key) {
                handlers.retain(|h| h != handler);
                if handlers.is_empty() {
                    listeners.remove(&key);
                }
            }
        }
    }

    /// Wrap `callback` in a handler, register it under `keys` and return it
    pub fn on_message<F>(&self, keys: impl IntoMessageKeys, callback: F) -> Handler<S, M>
    where
        F: Fn(&S, &MessageKey, &M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler = Handler::new(callback);
        self.register(keys, &handler);
        handler
    }

    /// Deliver `message` to the handlers of `key`, then to the wildcard handlers
    pub fn dispatch(&self, source: &S, key: impl Into<MessageKey>, message: &M) {
        let key = key.into();
        let (named, wildcard) = self.snapshot(&key);

        for handler in &named {
            self.invoke(handler, source, &key, message, false);
        }
        for handler in &wildcard {
            self.invoke(handler, source, &key, message, true);
        }
    }

    /// Number of handlers registered under `key`
    pub fn handler_count(&self, key: impl Into<MessageKey>) -> usize {
        let key = key.into();
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map_or(0, Vec::len)
    }

    /// Keys that currently have at least one handler
    pub fn keys(&self) -> Vec<MessageKey> {
        let mut keys: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Drop every registration
    pub fn clear(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Clone both handler groups under a single read lock
    fn snapshot(&self, key: &MessageKey) -> (Vec<Handler<S, M>>, Vec<Handler<S, M>>) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        let wildcard = listeners
            .get(&MessageKey::wildcard())
            .cloned()
            .unwrap_or_default();

        // Dispatching under "*" reaches the wildcard group once, not twice
        let named = if key.is_wildcard() {
            Vec::new()
        } else {
            listeners.get(key).cloned().unwrap_or_default()
        };

        (named, wildcard)
    }

    fn invoke(&self, handler: &Handler<S, M>, source: &S, key: &MessageKey, message: &M, wildcard: bool) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.call(source, key, message)));

        let cause = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => FailureCause::Error(format!("{:#}", e)),
            Err(payload) => FailureCause::Panic(panic_message(payload.as_ref())),
        };

        self.reporter.handler_failed(&HandlerFailure {
            key,
            handler: handler.id(),
            wildcard,
            cause,
        });
    }
}

impl<S: ?Sized, M> Default for Dispatcher<S, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ?Sized, M> fmt::Debug for Dispatcher<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").field("keys", &self.keys()).finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
