//! Callback-to-stream bridge.
//!
//! Strategies and references notify through callbacks. [`UpdateStream`] turns
//! such a callback registration into a `futures::Stream`, owning whatever
//! guard keeps the registration alive so that dropping the stream
//! unsubscribes.

use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::Stream;

/// Sending half handed to the registration closure.
pub struct UpdateSender<T> {
    sender: mpsc::UnboundedSender<T>,
}

impl<T> Clone for UpdateSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> UpdateSender<T> {
    /// Push a value. Returns `false` once the stream has been dropped.
    pub fn send(&self, value: T) -> bool {
        self.sender.unbounded_send(value).is_ok()
    }

    /// Whether the receiving stream is gone.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Asynchronous sequence of values fed by a callback registration.
pub struct UpdateStream<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    _guard: Box<dyn Any + Send>,
}

impl<T> UpdateStream<T> {
    /// Register a callback via `register` and stream what it sends.
    ///
    /// The value returned by `register` (typically a subscription handle) is
    /// held until the stream is dropped.
    pub fn new<G, F>(register: F) -> Self
    where
        G: Send + 'static,
        F: FnOnce(UpdateSender<T>) -> G,
    {
        let (sender, receiver) = mpsc::unbounded();
        let guard = register(UpdateSender { sender });
        Self {
            receiver,
            _guard: Box::new(guard),
        }
    }

    /// Take a value that is already buffered without waiting.
    pub fn try_next_now(&mut self) -> Option<T> {
        self.receiver.try_next().ok().flatten()
    }
}

impl<T> fmt::Debug for UpdateStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateStream").finish_non_exhaustive()
    }
}

impl<T> Stream for UpdateStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}
