//! Stream adaptor over a dispatcher
//!
//! Turns handler callbacks into an async [`Stream`] of `(key, message)` pairs.
//! The backing handler is unregistered when the stream is dropped.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::{Stream, StreamExt};

use crate::dispatcher::{Dispatcher, Handler};
use crate::messages::{IntoMessageKeys, MessageKey};

/// Messages delivered to a set of keys, as a stream
pub struct MessageStream<S: ?Sized, M> {
    rx: mpsc::UnboundedReceiver<(MessageKey, M)>,
    dispatcher: Weak<Dispatcher<S, M>>,
    keys: Vec<MessageKey>,
    handler: Handler<S, M>,
}

impl<S: ?Sized, M> MessageStream<S, M> {
    pub fn keys(&self) -> &[MessageKey] {
        &self.keys
    }
}

impl<S, M> Dispatcher<S, M>
where
    S: ?Sized + 'static,
    M: Clone + Send + 'static,
{
    /// Subscribe to `keys` as a stream; use `"*"` for every message
    pub fn stream(self: &Arc<Self>, keys: impl IntoMessageKeys) -> MessageStream<S, M> {
        let (tx, rx) = mpsc::unbounded();
        let keys = keys.into_message_keys();

        let handler = Handler::new(move |_source: &S, key: &MessageKey, message: &M| {
            tx.unbounded_send((key.clone(), message.clone()))
                .map_err(|_| anyhow::anyhow!("message stream receiver dropped"))
        });
        self.register(keys.clone(), &handler);

        MessageStream {
            rx,
            dispatcher: Arc::downgrade(self),
            keys,
            handler,
        }
    }
}

impl<S: ?Sized, M> Stream for MessageStream<S, M> {
    type Item = (MessageKey, M);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl<S: ?Sized, M> Drop for MessageStream<S, M> {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unregister(self.keys.clone(), &self.handler);
        }
    }
}
