//! Per-connection subscribe protocol.
//!
//! [`SyncService::subscribe`] joins the controller and the broker:
//!
//! 1. register a broker subscriber;
//! 2. `stop`: stop the loop and cancel the active run before returning, so
//!    the stop takes effect even if the caller disconnects right away;
//! 3. `start`: if no loop is active, start one in the background together
//!    with a forwarder that republishes its [`ProgressEvent`]s on the
//!    broker. A rejected start (for example `AlreadyInProgress`) is
//!    returned to this caller only;
//! 4. the caller reads the [`Subscription`] until a terminal notification
//!    or disconnect. Dropping it deregisters the subscriber.

use std::str::FromStr;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{Broker, Subscriber};
use crate::controller::SyncController;
use crate::error::SyncResult;
use crate::progress::{Notification, ProgressEvent};
use crate::traits::NotificationTransport;

/// What a subscriber asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Start,
    Stop,
}

impl FromStr for SyncAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(SyncAction::Start),
            "stop" => Ok(SyncAction::Stop),
            other => anyhow::bail!("unknown sync action '{}'; expected start or stop", other),
        }
    }
}

struct ActiveSync {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SyncService {
    controller: Arc<SyncController>,
    broker: Broker,
    shutdown: CancellationToken,
    event_buffer: usize,
    active: Mutex<Option<ActiveSync>>,
}

impl SyncService {
    pub fn new(controller: Arc<SyncController>, broker: Broker, event_buffer: usize) -> Self {
        Self {
            controller,
            broker,
            shutdown: CancellationToken::new(),
            event_buffer: event_buffer.max(1),
            active: Mutex::new(None),
        }
    }

    pub fn controller(&self) -> &Arc<SyncController> {
        &self.controller
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub async fn subscribe(&self, action: SyncAction) -> SyncResult<Subscription> {
        let subscriber = self.broker.subscribe().await;

        match action {
            SyncAction::Stop => {
                let was_running = self.controller.stop_sync().await?;
                if let Some(active) = self.active.lock().await.take() {
                    active.cancel.cancel();
                }
                // Nothing will be broadcast, so answer this caller directly.
                let pending = (!was_running).then_some(Notification::from(ProgressEvent::Stopped));
                Ok(Subscription::new(subscriber, pending))
            }
            SyncAction::Start => {
                self.ensure_started().await?;
                Ok(Subscription::new(subscriber, None))
            }
        }
    }

    /// Whether a loop started through this service is still running.
    pub async fn is_active(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|a| !a.task.is_finished())
    }

    async fn ensure_started(&self) -> SyncResult<()> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|a| !a.task.is_finished()) {
            return Ok(());
        }

        let cancel = self.shutdown.child_token();
        let run = self.controller.begin_sync(&cancel).await?;

        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(self.event_buffer);
        let broker = self.broker.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !broker.publish(event.into()) {
                    break;
                }
            }
        });

        let task = tokio::spawn(async move {
            match run.run(tx).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(error = %e, "sync loop ended with an error"),
            }
            let _ = forwarder.await;
        });

        *active = Some(ActiveSync { cancel, task });
        Ok(())
    }

    /// Cancel any running loop and wait for it to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            if let Err(e) = active.task.await {
                warn!(error = %e, "sync task did not shut down cleanly");
            }
        }
        info!("sync service shut down");
    }
}

/// A live stream of notifications for one caller.
pub struct Subscription {
    subscriber: Subscriber,
    pending: Option<Notification>,
    finished: bool,
}

impl Subscription {
    fn new(subscriber: Subscriber, pending: Option<Notification>) -> Self {
        Self {
            subscriber,
            pending,
            finished: false,
        }
    }

    /// Next notification. Returns `None` after a terminal notification or
    /// once the broker disconnected this subscriber.
    pub async fn next(&mut self) -> Option<Notification> {
        if self.finished {
            return None;
        }
        let notification = match self.pending.take() {
            Some(n) => n,
            None => self.subscriber.recv().await?,
        };
        self.finished = notification.is_terminal();
        Some(notification)
    }

    /// Forward every notification to `transport`. Returns how many were
    /// delivered.
    pub async fn relay(mut self, transport: &dyn NotificationTransport) -> anyhow::Result<usize> {
        let mut delivered = 0;
        while let Some(notification) = self.next().await {
            transport.publish(&notification).await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn into_stream(self) -> impl Stream<Item = Notification> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let next = sub.next().await?;
            Some((next, sub))
        })
    }
}
