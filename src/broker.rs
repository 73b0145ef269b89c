//! Event broker: fans notifications out to live subscribers.
//!
//! A single dispatch task owns the subscriber set. Registrations,
//! deregistrations and published events travel through one ordered command
//! queue, so enqueue order decides membership: a subscriber receives every
//! event published after its `subscribe` returned, and none published
//! before.
//!
//! Each subscriber has a bounded queue of `buffer` notifications. A
//! subscriber whose queue is full when an event is dispatched is
//! disconnected: it is removed from the set and its channel closes once it
//! has drained what was already queued. One stalled consumer can therefore
//! never hold up the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::progress::Notification;

enum Command {
    Register {
        id: u64,
        tx: mpsc::Sender<Notification>,
        ack: oneshot::Sender<()>,
    },
    Deregister(u64),
    Publish(Notification),
    Count(oneshot::Sender<usize>),
}

#[derive(Clone)]
pub struct Broker {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl Broker {
    /// Start the dispatch task. It exits once every `Broker` clone and
    /// every [`Subscriber`] has been dropped.
    pub fn spawn(buffer: usize) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(dispatch(rx));
        let broker = Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        };
        (broker, handle)
    }

    /// Register a new subscriber and wait until the dispatch task has
    /// accepted it.
    ///
    /// If the dispatch task is gone the returned subscriber's channel is
    /// already closed.
    pub async fn subscribe(&self) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let (ack, acked) = oneshot::channel();

        if self
            .commands
            .send(Command::Register { id, tx, ack })
            .is_ok()
        {
            let _ = acked.await;
        }

        Subscriber {
            id,
            rx,
            commands: self.commands.clone(),
        }
    }

    /// Enqueue a notification for every current subscriber. Returns `false`
    /// if the dispatch task has exited.
    pub fn publish(&self, notification: Notification) -> bool {
        self.commands.send(Command::Publish(notification)).is_ok()
    }

    /// Number of registered subscribers once every earlier command has been
    /// applied.
    pub async fn subscriber_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn dispatch(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut subscribers: HashMap<u64, mpsc::Sender<Notification>> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Register { id, tx, ack } => {
                subscribers.insert(id, tx);
                let _ = ack.send(());
                debug!(subscriber = id, total = subscribers.len(), "subscriber registered");
            }
            Command::Deregister(id) => {
                if subscribers.remove(&id).is_some() {
                    debug!(subscriber = id, total = subscribers.len(), "subscriber removed");
                }
            }
            Command::Publish(notification) => {
                subscribers.retain(|id, tx| match tx.try_send(notification.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = *id, "subscriber queue full; disconnecting");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            Command::Count(reply) => {
                let _ = reply.send(subscribers.len());
            }
        }
    }

    debug!("broker dispatch loop exited");
}

/// A registered consumer. Dropping it deregisters it.
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<Notification>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscriber {
    /// Next notification, or `None` once the subscriber was disconnected
    /// and its queue drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Deregister(self.id));
    }
}
