use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use super::types::Event;

/// Subscriber side of a client's event queue.
///
/// The queue is bounded. A subscriber that falls behind loses the oldest
/// events and sees a single [`Event::Lagged`] in their place.
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<Event>,
}

impl EventStream {
    pub(crate) fn new(receiver: broadcast::Receiver<Event>) -> Self {
        Self { receiver }
    }

    /// Waits for the next event. `None` once the client is dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(dropped)) => {
                log::warn!("event subscriber lagged, {dropped} events dropped");
                Some(Event::Lagged { dropped })
            }
            Err(RecvError::Closed) => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Lagged(dropped)) => Some(Event::Lagged { dropped }),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }
}
