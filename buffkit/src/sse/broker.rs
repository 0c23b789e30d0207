//! The fan-out broker: coordinator task, subscriber handles, shutdown.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::event::{Delivery, Frame};
use crate::config::SseConfig;
use crate::error::{Error, Result};

/// Capacity of the internal command channel. The coordinator never blocks
/// on a client, so this queue drains quickly even under broadcast bursts.
const COMMAND_BUFFER: usize = 256;

/// Unique identifier for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Counters exposed by the broker, for tests and the stats command.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerStats {
    /// Currently connected subscribers
    pub subscribers: usize,
    /// Frames delivered since startup (per-subscriber sends that succeeded)
    pub delivered: u64,
    /// Frames dropped because a subscriber channel was full
    pub dropped: u64,
    /// Broadcasts observed by the coordinator
    pub broadcasts: u64,
}

enum Command {
    Register {
        id: SubscriberId,
        tag: Option<String>,
        tx: mpsc::Sender<Delivery>,
        ack: oneshot::Sender<()>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    Broadcast {
        kind: String,
        data: String,
    },
    Heartbeat,
    Stats {
        reply: oneshot::Sender<BrokerStats>,
    },
}

struct Slot {
    tx: mpsc::Sender<Delivery>,
    #[allow(dead_code)]
    tag: Option<String>,
    dropped: u64,
}

/// A connected subscriber, owning the receiving half of its bounded
/// delivery channel.
///
/// The handle is a [`Stream`] of [`Delivery`] items. Dropping it
/// unsubscribes from the broker (best effort; the coordinator also prunes
/// slots whose channel has closed on the next delivery attempt).
pub struct Subscriber {
    id: SubscriberId,
    rx: mpsc::Receiver<Delivery>,
    commands: mpsc::Sender<Command>,
}

impl Subscriber {
    /// This subscriber's id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Receive the next delivery, or `None` once the broker has shut down.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Stream for Subscriber {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = self
            .commands
            .try_send(Command::Unsubscribe { id: self.id });
    }
}

/// Single-process fan-out broker for SSE frames.
///
/// See the [module docs](crate::sse) for the concurrency model.
pub struct EventBroker {
    commands: mpsc::Sender<Command>,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    finished: AtomicBool,
    config: SseConfig,
}

impl EventBroker {
    /// Create a broker and spawn its coordinator and heartbeat tasks.
    #[must_use]
    pub fn new(config: SseConfig) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let stop = CancellationToken::new();

        let coordinator = tokio::spawn(coordinate(command_rx, stop.clone()));
        let heartbeat = tokio::spawn(heartbeat_loop(
            commands.clone(),
            config.heartbeat(),
            stop.clone(),
        ));

        Self {
            commands,
            stop,
            tasks: Mutex::new(vec![coordinator, heartbeat]),
            finished: AtomicBool::new(false),
            config,
        }
    }

    /// Register a new subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] once [`shutdown`](Self::shutdown)
    /// has begun.
    pub async fn subscribe(&self) -> Result<Subscriber> {
        self.subscribe_tagged(None).await
    }

    /// Register a subscriber with an interest tag.
    ///
    /// The tag is carried on the slot for host-side diagnostics; delivery
    /// is not filtered by it in this core.
    pub async fn subscribe_tagged(&self, tag: Option<String>) -> Result<Subscriber> {
        if self.stop.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let (ack, ack_rx) = oneshot::channel();

        self.commands
            .send(Command::Register { id, tag, tx, ack })
            .await
            .map_err(|_| Error::ShuttingDown)?;

        // The coordinator acks after inserting the slot; if it exited in
        // between, the registration never took effect.
        ack_rx.await.map_err(|_| Error::ShuttingDown)?;

        Ok(Subscriber {
            id,
            rx,
            commands: self.commands.clone(),
        })
    }

    /// Remove a subscriber and close its channel.
    ///
    /// Usually unnecessary: dropping the [`Subscriber`] handle does this.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        let _ = self.commands.send(Command::Unsubscribe { id }).await;
    }

    /// Deliver a frame to every current subscriber.
    ///
    /// Never blocks on a slow client: a full subscriber channel drops that
    /// subscriber's copy of the frame and increments its drop counter.
    /// A broker with zero subscribers accepts broadcasts and discards them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] once shutdown has begun.
    pub async fn broadcast(
        &self,
        kind: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.commands
            .send(Command::Broadcast {
                kind: kind.into(),
                data: data.into(),
            })
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Current counters.
    pub async fn stats(&self) -> Result<BrokerStats> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        reply_rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// True once shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop the broker: refuse new subscribers, stop the heartbeat, let the
    /// coordinator close every subscriber channel, and wait for both tasks
    /// to exit within the deadline.
    ///
    /// Idempotent; concurrent and repeated calls are safe, and only the
    /// first performs the waiting.
    pub async fn shutdown(&self, deadline: std::time::Duration) {
        self.stop.cancel();

        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        let handles = {
            let mut tasks = self.tasks.lock().expect("broker task list poisoned");
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            if timeout(deadline, handle).await.is_err() {
                tracing::warn!("broker task did not exit within the shutdown deadline");
            }
        }
        tracing::debug!("sse broker shut down");
    }
}

/// Coordinator: the only task that touches the subscriber set.
async fn coordinate(mut commands: mpsc::Receiver<Command>, stop: CancellationToken) {
    let mut slots: HashMap<SubscriberId, Slot> = HashMap::new();
    let mut next_frame_id: u64 = 0;
    let mut stats = BrokerStats::default();

    loop {
        let command = tokio::select! {
            () = stop.cancelled() => break,
            cmd = commands.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        match command {
            Command::Register { id, tag, tx, ack } => {
                slots.insert(
                    id,
                    Slot {
                        tx,
                        tag,
                        dropped: 0,
                    },
                );
                tracing::debug!(subscriber = %id, total = slots.len(), "sse subscriber registered");
                let _ = ack.send(());
            }

            Command::Unsubscribe { id } => {
                if slots.remove(&id).is_some() {
                    tracing::debug!(subscriber = %id, total = slots.len(), "sse subscriber removed");
                }
            }

            Command::Broadcast { kind, data } => {
                next_frame_id += 1;
                stats.broadcasts += 1;
                let frame = Frame {
                    id: next_frame_id,
                    kind,
                    data,
                };
                fan_out(&mut slots, &mut stats, Delivery::Frame(frame));
            }

            Command::Heartbeat => {
                fan_out(&mut slots, &mut stats, Delivery::Heartbeat);
            }

            Command::Stats { reply } => {
                stats.subscribers = slots.len();
                let _ = reply.send(stats);
            }
        }
    }

    // Closing every subscriber channel happens here and only here, so no
    // channel is written after close and none is closed twice.
    let remaining = slots.len();
    slots.clear();
    if remaining > 0 {
        tracing::debug!(subscribers = remaining, "sse coordinator closed subscriber channels");
    }
}

fn fan_out(slots: &mut HashMap<SubscriberId, Slot>, stats: &mut BrokerStats, delivery: Delivery) {
    let mut gone = Vec::new();
    for (id, slot) in slots.iter_mut() {
        match slot.tx.try_send(delivery.clone()) {
            Ok(()) => stats.delivered += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                slot.dropped += 1;
                stats.dropped += 1;
                tracing::trace!(subscriber = %id, dropped = slot.dropped, "sse frame dropped; subscriber is slow");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
        }
    }
    for id in gone {
        slots.remove(&id);
    }
}

/// Heartbeat: a periodic timer that asks the coordinator to fan out a
/// comment frame. Exits on shutdown or when the coordinator is gone.
async fn heartbeat_loop(
    commands: mpsc::Sender<Command>,
    period: std::time::Duration,
    stop: CancellationToken,
) {
    let start = tokio::time::Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = interval.tick() => {
                if commands.send(Command::Heartbeat).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> SseConfig {
        SseConfig {
            path: "/events".to_string(),
            heartbeat_secs: 3600,
            subscriber_buffer: 8,
        }
    }

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let broker = EventBroker::new(test_config());
        let mut a = broker.subscribe().await.unwrap();
        let mut b = broker.subscribe().await.unwrap();
        let mut c = broker.subscribe().await.unwrap();

        broker.broadcast("update", "<div>1</div>").await.unwrap();
        broker.broadcast("update", "<div>2</div>").await.unwrap();

        for sub in [&mut a, &mut b, &mut c] {
            let first = sub.recv().await.unwrap();
            let second = sub.recv().await.unwrap();
            match (first, second) {
                (Delivery::Frame(f1), Delivery::Frame(f2)) => {
                    assert_eq!(f1.data, "<div>1</div>");
                    assert_eq!(f2.data, "<div>2</div>");
                    assert!(f1.id < f2.id, "frame ids must be monotonic");
                }
                other => panic!("expected two frames, got {other:?}"),
            }
        }

        broker.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_zero_subscribers_broadcast_does_not_block() {
        let broker = EventBroker::new(test_config());
        for _ in 0..100 {
            broker.broadcast("update", "x").await.unwrap();
        }
        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.subscribers, 0);
        assert_eq!(stats.broadcasts, 100);
        broker.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_isolated() {
        let config = SseConfig {
            subscriber_buffer: 1,
            ..test_config()
        };
        let broker = EventBroker::new(config);

        // Slow subscriber never drains; fast one does.
        let _slow = broker.subscribe().await.unwrap();
        let mut fast = broker.subscribe().await.unwrap();

        broker.broadcast("e", "1").await.unwrap();
        match fast.recv().await.unwrap() {
            Delivery::Frame(f) => assert_eq!(f.data, "1"),
            Delivery::Heartbeat => panic!("unexpected heartbeat"),
        }
        broker.broadcast("e", "2").await.unwrap();
        match fast.recv().await.unwrap() {
            Delivery::Frame(f) => assert_eq!(f.data, "2"),
            Delivery::Heartbeat => panic!("unexpected heartbeat"),
        }

        // Every frame either reached the slow channel or was counted.
        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.dropped, 1, "second frame to the slow client drops");

        broker.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_fails_fast() {
        let broker = EventBroker::new(test_config());
        broker.shutdown(Duration::from_secs(1)).await;

        assert!(matches!(
            broker.subscribe().await,
            Err(Error::ShuttingDown)
        ));
        assert!(matches!(
            broker.broadcast("e", "x").await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels_and_is_idempotent() {
        let broker = EventBroker::new(test_config());
        let mut sub = broker.subscribe().await.unwrap();

        broker.shutdown(Duration::from_secs(1)).await;
        broker.shutdown(Duration::from_secs(1)).await;

        // Channel closed exactly once; receiver observes end-of-stream.
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let broker = EventBroker::new(test_config());
        {
            let _sub = broker.subscribe().await.unwrap();
            let stats = broker.stats().await.unwrap();
            assert_eq!(stats.subscribers, 1);
        }
        // Drop sent an unsubscribe command; the next stats round trip has
        // the coordinator process it first (same channel, FIFO).
        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.subscribers, 0);
        broker.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_under_broadcast_load() {
        let broker = std::sync::Arc::new(EventBroker::new(test_config()));
        let mut subs = Vec::new();
        for _ in 0..50 {
            subs.push(broker.subscribe().await.unwrap());
        }

        let producer_broker = broker.clone();
        let producer = tokio::spawn(async move {
            loop {
                if producer_broker.broadcast("tick", "<i>x</i>").await.is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        let started = tokio::time::Instant::now();
        broker.shutdown(Duration::from_secs(2)).await;
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "shutdown within 2x the deadline"
        );
        let _ = tokio::time::timeout(Duration::from_secs(1), producer).await;

        // Every client drains to a clean end-of-stream.
        for mut sub in subs {
            while sub.recv().await.is_some() {}
        }
    }

    #[tokio::test]
    async fn test_heartbeat_reaches_subscribers() {
        let config = SseConfig {
            heartbeat_secs: 1,
            ..test_config()
        };
        let broker = EventBroker::new(config);
        let mut sub = broker.subscribe().await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(3), sub.recv())
            .await
            .expect("heartbeat within cadence")
            .expect("channel open");
        assert!(matches!(delivery, Delivery::Heartbeat));

        broker.shutdown(Duration::from_secs(1)).await;
    }
}
