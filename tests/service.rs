//! Broker fan-out and the subscribe protocol.

mod common;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use common::*;
use mm_semantic_sync::broker::Broker;
use mm_semantic_sync::error::{Activity, SyncError};
use mm_semantic_sync::progress::Notification;
use mm_semantic_sync::service::{SyncAction, SyncService};
use mm_semantic_sync::sync_state::Flag;
use mm_semantic_sync::traits::NotificationTransport;

const WITHIN: Duration = Duration::from_secs(5);

fn progress(data: f64) -> Notification {
    Notification::Progress { data }
}

fn done() -> Notification {
    Notification::Done { is_done: true }
}

fn stopped() -> Notification {
    Notification::Stopped { is_stopped: true }
}

#[tokio::test]
async fn all_registered_subscribers_receive_each_event() {
    let (broker, _dispatch) = Broker::spawn(16);
    let mut subscribers = Vec::new();
    for _ in 0..5 {
        subscribers.push(broker.subscribe().await);
    }

    broker.publish(progress(50.0));
    broker.publish(done());

    for sub in &mut subscribers {
        assert_eq!(sub.recv().await, Some(progress(50.0)));
        assert_eq!(sub.recv().await, Some(done()));
    }
}

#[tokio::test]
async fn late_subscriber_misses_earlier_events() {
    let (broker, _dispatch) = Broker::spawn(16);
    let mut early = broker.subscribe().await;

    broker.publish(progress(10.0));
    let mut late = broker.subscribe().await;
    broker.publish(progress(20.0));

    assert_eq!(early.recv().await, Some(progress(10.0)));
    assert_eq!(early.recv().await, Some(progress(20.0)));
    assert_eq!(late.recv().await, Some(progress(20.0)));
}

#[tokio::test]
async fn slow_subscriber_does_not_block_others() {
    let (broker, _dispatch) = Broker::spawn(2);
    let _stalled = broker.subscribe().await;
    let mut live = broker.subscribe().await;

    for i in 0..2 {
        broker.publish(progress(i as f64));
    }
    // The live subscriber keeps up; the stalled one overflows next.
    assert_eq!(live.recv().await, Some(progress(0.0)));
    assert_eq!(live.recv().await, Some(progress(1.0)));
    broker.publish(progress(2.0));
    assert_eq!(live.recv().await, Some(progress(2.0)));
    assert_eq!(broker.subscriber_count().await, 1);
}

async fn service(upstream: ScriptedUpstream) -> (Harness, SyncService) {
    let h = harness(upstream, 200, 3600).await;
    let (broker, _dispatch) = Broker::spawn(16);
    let service = SyncService::new(h.controller.clone(), broker, 16);
    (h, service)
}

fn small_upstream() -> ScriptedUpstream {
    ScriptedUpstream::new().with_channel(channel("c1", "O", 2), posts("c1", "a", 2))
}

#[tokio::test]
async fn start_subscribers_share_one_loop() {
    let upstream = small_upstream();
    let gate = upstream.gate();
    let (h, service) = service(upstream).await;

    let mut first = service.subscribe(SyncAction::Start).await.unwrap();
    let mut second = service.subscribe(SyncAction::Start).await.unwrap();
    assert!(service.is_active().await);
    gate.notify_one();

    for sub in [&mut first, &mut second] {
        let mut seen = Vec::new();
        while let Some(n) = timeout(WITHIN, sub.next()).await.unwrap() {
            seen.push(n);
        }
        assert_eq!(seen.last(), Some(&done()));
        assert!(seen[..seen.len() - 1]
            .iter()
            .all(|n| matches!(n, Notification::Progress { .. })));
    }
    assert_eq!(
        h.upstream.channel_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    service.shutdown().await;
    assert!(!h.controller.get_is_sync_in_progress().await.unwrap());
}

#[tokio::test]
async fn rejected_start_is_only_reported_to_the_requester() {
    let (h, service) = service(small_upstream()).await;
    let mut bystander = service.broker().subscribe().await;

    // Another process holds the sync flag.
    let lease = h.state.acquire(Flag::Sync).await.unwrap();
    let err = service.subscribe(SyncAction::Start).await.err().unwrap();
    assert!(matches!(err, SyncError::AlreadyInProgress(Activity::Sync)));

    assert!(timeout(Duration::from_millis(200), bystander.recv())
        .await
        .is_err());
    assert!(!service.is_active().await);
    lease.release().await;
}

#[tokio::test]
async fn stop_broadcasts_the_final_event() {
    let (h, service) = service(small_upstream()).await;
    let mut watcher = service.broker().subscribe().await;

    let starter = service.subscribe(SyncAction::Start).await.unwrap();
    timeout(WITHIN, async {
        while let Some(n) = watcher.recv().await {
            if n == done() {
                break;
            }
        }
    })
    .await
    .unwrap();
    drop(starter);

    let mut stopper = service.subscribe(SyncAction::Stop).await.unwrap();
    assert_eq!(timeout(WITHIN, stopper.next()).await.unwrap(), Some(stopped()));
    assert_eq!(stopper.next().await, None);
    assert_eq!(timeout(WITHIN, watcher.recv()).await.unwrap(), Some(stopped()));

    assert!(!h.controller.get_is_sync_in_progress().await.unwrap());
    assert!(!service.is_active().await);
}

#[tokio::test]
async fn stop_when_idle_answers_immediately() {
    let (_h, service) = service(small_upstream()).await;
    let mut stopper = service.subscribe(SyncAction::Stop).await.unwrap();
    assert_eq!(stopper.next().await, Some(stopped()));
    assert_eq!(stopper.next().await, None);
}

#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationTransport for Recording {
    async fn publish(&self, notification: &Notification) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push(notification.event_name().to_string());
        Ok(())
    }
}

#[tokio::test]
async fn relay_forwards_until_the_terminal_event() {
    let (_h, service) = service(small_upstream()).await;
    let subscription = service.subscribe(SyncAction::Start).await.unwrap();

    let transport = Recording::default();
    let delivered = timeout(WITHIN, subscription.relay(&transport))
        .await
        .unwrap()
        .unwrap();

    let seen = transport.seen.lock().unwrap().clone();
    assert_eq!(delivered, seen.len());
    assert_eq!(seen.last().map(String::as_str), Some("onDone"));
    assert!(seen[..seen.len() - 1].iter().all(|e| e == "onProgress"));
    service.shutdown().await;
}

#[tokio::test]
async fn action_parsing() {
    assert_eq!("start".parse::<SyncAction>().unwrap(), SyncAction::Start);
    assert_eq!(" STOP ".parse::<SyncAction>().unwrap(), SyncAction::Stop);
    assert!("pause".parse::<SyncAction>().is_err());
}
