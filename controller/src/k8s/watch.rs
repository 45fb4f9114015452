use futures::prelude::*;
use std::pin::Pin;

pub use kube::core::WatchEvent;

/// Wraps one subscription's event stream.
///
/// The stream is finite: it ends when the server-side watch timeout expires
/// or the connection drops, at which point the owning pump returns and the
/// cluster watcher decides whether to resubscribe.
pub struct Watch<T>(Pin<Box<dyn Stream<Item = kube::Result<WatchEvent<T>>> + Send + 'static>>);

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = kube::Result<WatchEvent<T>>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Watch(watch.boxed())
    }
}

impl<T> Watch<T> {
    /// Receives the next event. `Ok(None)` means the subscription ended
    /// gracefully; an error means it broke and the watcher should reconnect.
    pub async fn recv(&mut self) -> kube::Result<Option<WatchEvent<T>>> {
        self.0.try_next().await
    }
}
