//! SSE transport for push subscriptions.
//!
//! ```text
//! registry ─write_frame─► ChannelSink ─try_send─► mpsc ─► SSE body ─► kiosk
//!                                                            │
//!                              drop (client gone) ──► SubscriptionGuard::drop
//!                                                       └─► registry.unregister
//! ```

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::response::sse::{Event, Sse};
use futures_util::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use roomsign_sync::{ConnectionRegistry, PushFrame, PushSink, SinkClosed};

/// Bounded, non-blocking sink feeding one SSE response.
///
/// A full buffer is reported as closed: a client that stopped reading is
/// treated like one that disconnected.
///
/// A sink created with [`ChannelSink::held`] queues frames until
/// [`ChannelSink::release`] sends the first frame ahead of them. This lets a
/// subscription register before its init snapshot is read without an update
/// overtaking the snapshot.
pub struct ChannelSink {
    tx: mpsc::Sender<PushFrame>,
    held: Mutex<Option<Vec<PushFrame>>>,
    capacity: usize,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PushFrame>) {
        Self::build(buffer, None)
    }

    /// Sink that queues writes until [`release`](Self::release).
    pub fn held(buffer: usize) -> (Self, mpsc::Receiver<PushFrame>) {
        Self::build(buffer, Some(Vec::new()))
    }

    fn build(buffer: usize, held: Option<Vec<PushFrame>>) -> (Self, mpsc::Receiver<PushFrame>) {
        let capacity = buffer.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let sink = ChannelSink {
            tx,
            held: Mutex::new(held),
            capacity,
        };
        (sink, rx)
    }

    fn lock_held(&self) -> MutexGuard<'_, Option<Vec<PushFrame>>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `first`, then the queued frames in write order, and stops
    /// queueing.
    pub fn release(&self, first: &PushFrame) -> Result<(), SinkClosed> {
        let mut held = self.lock_held();
        let queued = held.take().unwrap_or_default();
        self.tx.try_send(first.clone()).map_err(|_| SinkClosed)?;
        for frame in queued {
            self.tx.try_send(frame).map_err(|_| SinkClosed)?;
        }
        Ok(())
    }
}

impl PushSink for ChannelSink {
    fn write_frame(&self, frame: &PushFrame) -> Result<(), SinkClosed> {
        let mut held = self.lock_held();
        match held.as_mut() {
            // Queued frames plus the first frame must fit the channel.
            Some(queued) if queued.len() + 1 >= self.capacity => Err(SinkClosed),
            Some(queued) => {
                queued.push(frame.clone());
                Ok(())
            }
            None => self.tx.try_send(frame.clone()).map_err(|_| SinkClosed),
        }
    }
}

/// Unregisters its subscription when the response stream is dropped.
struct SubscriptionGuard {
    registry: Arc<ConnectionRegistry>,
    subscription_id: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        debug!(subscription_id = %self.subscription_id, "SSE stream dropped");
        self.registry.unregister(&self.subscription_id);
    }
}

/// Maps a push frame onto an SSE event.
pub fn to_event(frame: PushFrame) -> Event {
    match frame {
        PushFrame::Message(json) => Event::default().data(json),
        PushFrame::KeepAlive => Event::default().comment(""),
    }
}

/// Builds the SSE response for a registered subscription.
pub fn stream_response(
    rx: mpsc::Receiver<PushFrame>,
    registry: Arc<ConnectionRegistry>,
    subscription_id: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = SubscriptionGuard {
        registry,
        subscription_id,
    };
    let stream = ReceiverStream::new(rx).map(move |frame| {
        let _guard = &guard;
        Ok::<_, Infallible>(to_event(frame))
    });
    Sse::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_buffer_counts_as_closed() {
        let (sink, _rx) = ChannelSink::new(1);
        assert!(sink.write_frame(&PushFrame::KeepAlive).is_ok());
        assert_eq!(sink.write_frame(&PushFrame::KeepAlive), Err(SinkClosed));
    }

    #[test]
    fn test_dropped_receiver_counts_as_closed() {
        let (sink, rx) = ChannelSink::new(4);
        drop(rx);
        assert_eq!(sink.write_frame(&PushFrame::Message("{}".into())), Err(SinkClosed));
    }

    #[test]
    fn test_held_frames_follow_released_first_frame() {
        let (sink, mut rx) = ChannelSink::held(4);
        sink.write_frame(&PushFrame::Message("update".into())).unwrap();
        assert!(rx.try_recv().is_err(), "held frames are not sent");

        sink.release(&PushFrame::Message("init".into())).unwrap();
        sink.write_frame(&PushFrame::KeepAlive).unwrap();

        assert_eq!(rx.try_recv().unwrap(), PushFrame::Message("init".into()));
        assert_eq!(rx.try_recv().unwrap(), PushFrame::Message("update".into()));
        assert_eq!(rx.try_recv().unwrap(), PushFrame::KeepAlive);
    }

    #[test]
    fn test_held_overflow_counts_as_closed() {
        let (sink, _rx) = ChannelSink::held(2);
        assert!(sink.write_frame(&PushFrame::KeepAlive).is_ok());
        assert_eq!(sink.write_frame(&PushFrame::KeepAlive), Err(SinkClosed));
        assert!(sink.release(&PushFrame::Message("init".into())).is_ok());
    }
}
