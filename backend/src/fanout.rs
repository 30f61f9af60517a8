//! Best-effort delivery of tally events to connected observers.
//!
//! Each observer owns a bounded queue. Publishing never waits on an observer:
//! a full queue drops the event for that observer only, and a closed queue
//! unregisters it. Observers that connect later do not see earlier events.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use shared::models::TallyEvent;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};
use uuid::Uuid;

type Observers = HashMap<Uuid, mpsc::Sender<Arc<TallyEvent>>>;

pub struct Fanout {
    observers: Arc<Mutex<Observers>>,
    buffer: usize,
}

/// Receiving side of one observer. Dropping it unregisters the observer.
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::Receiver<Arc<TallyEvent>>,
    observers: Arc<Mutex<Observers>>,
}

impl Fanout {
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: Arc::new(Mutex::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        if let Some(mut observers) = lock(&self.observers) {
            observers.insert(id, sender);
        }
        debug!("Observer {} connected", id);

        Subscription {
            id,
            receiver,
            observers: Arc::clone(&self.observers),
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).map(|o| o.len()).unwrap_or(0)
    }

    /// Hands `event` to every registered observer and returns how many
    /// accepted it.
    pub fn publish(&self, event: TallyEvent) -> usize {
        let event = Arc::new(event);
        let Some(mut observers) = lock(&self.observers) else {
            return 0;
        };

        let mut delivered = 0;
        observers.retain(|id, sender| match sender.try_send(Arc::clone(&event)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("Observer {} is lagging, dropped {} event", id, event.kind());
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Observer {} went away", id);
                false
            }
        });
        delivered
    }
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<TallyEvent>> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(mut observers) = lock(&self.observers) {
            observers.remove(&self.id);
        }
        debug!("Observer {} disconnected", self.id);
    }
}

fn lock(observers: &Mutex<Observers>) -> Option<MutexGuard<'_, Observers>> {
    match observers.lock() {
        Ok(guard) => Some(guard),
        Err(e) => {
            error!("Failed to acquire observer registry lock: {}", e);
            None
        }
    }
}
