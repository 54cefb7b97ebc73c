//! Leadership notifications for the hosting application.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Leadership transitions visible to the hosting application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    /// This participant became leader
    StartedLeading,

    /// This participant is no longer leader
    StoppedLeading,

    /// The known lock holder changed; `None` when the lock is unheld
    NewLeader(Option<String>),
}

/// Receiving end of the leadership event queue.
pub type EventReceiver = mpsc::Receiver<ElectionEvent>;

/// Statistics about notification delivery
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NotificationStats {
    pub notifications_sent: u64,
    pub notifications_delivered: u64,
    pub notifications_dropped: u64,
}

/// Turns state machine transitions into [`ElectionEvent`]s.
///
/// Delivery never blocks the election loop: events are pushed onto a
/// bounded queue with `try_send`, and an event that does not fit (or whose
/// receiver is gone) is dropped and logged. Each transition is therefore
/// delivered at most once.
#[derive(Debug)]
pub struct ObserverNotifier {
    tx: mpsc::Sender<ElectionEvent>,
    leading: bool,
    last_reported: Option<String>,
    stats: NotificationStats,
}

impl ObserverNotifier {
    /// Create a notifier and the receiver the application consumes.
    pub fn channel(capacity: usize) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let notifier = Self {
            tx,
            leading: false,
            last_reported: None,
            stats: NotificationStats::default(),
        };

        (notifier, rx)
    }

    /// Entry into the leading state.
    pub fn started_leading(&mut self) {
        if !self.leading {
            self.leading = true;
            self.deliver(ElectionEvent::StartedLeading);
        }
    }

    /// Exit from the leading state.
    pub fn stopped_leading(&mut self) {
        if self.leading {
            self.leading = false;
            self.deliver(ElectionEvent::StoppedLeading);
        }
    }

    /// Report the holder seen in the lock record.
    ///
    /// Repeated observations of the same holder are suppressed, so polling
    /// an unchanged record fires at most one event.
    pub fn observe_leader(&mut self, holder: Option<&str>) {
        let holder = holder.filter(|h| !h.is_empty());

        if self.last_reported.as_deref() == holder {
            return;
        }

        self.last_reported = holder.map(str::to_string);
        self.deliver(ElectionEvent::NewLeader(self.last_reported.clone()));
    }

    pub fn is_leading(&self) -> bool {
        self.leading
    }

    pub fn last_reported(&self) -> Option<&str> {
        self.last_reported.as_deref()
    }

    pub fn stats(&self) -> NotificationStats {
        self.stats.clone()
    }

    fn deliver(&mut self, event: ElectionEvent) {
        self.stats.notifications_sent += 1;

        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.notifications_delivered += 1;
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.stats.notifications_dropped += 1;
                warn!("Event queue full, dropping {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.stats.notifications_dropped += 1;
                debug!("No event receiver, dropping {:?}", event);
            }
        }
    }
}

/// Application hooks invoked for leadership transitions.
///
/// Hooks run on their own task (see [`spawn_callbacks`]) and may take as long
/// as they need; a slow hook only delays later hooks, never the election.
#[async_trait]
pub trait LeaderCallbacks: Send + 'static {
    async fn on_started_leading(&mut self);

    async fn on_stopped_leading(&mut self);

    async fn on_new_leader(&mut self, identity: Option<&str>);
}

/// Drive `callbacks` from the event queue until the supervisor goes away.
pub fn spawn_callbacks<C>(mut events: EventReceiver, mut callbacks: C) -> JoinHandle<C>
where
    C: LeaderCallbacks,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ElectionEvent::StartedLeading => callbacks.on_started_leading().await,
                ElectionEvent::StoppedLeading => callbacks.on_stopped_leading().await,
                ElectionEvent::NewLeader(identity) => {
                    callbacks.on_new_leader(identity.as_deref()).await
                }
            }
        }
        callbacks
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut EventReceiver) -> Vec<ElectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_leading_events_fire_once() {
        let (mut notifier, mut rx) = ObserverNotifier::channel(16);

        notifier.started_leading();
        notifier.started_leading();
        notifier.stopped_leading();
        notifier.stopped_leading();

        assert_eq!(
            drain(&mut rx),
            vec![ElectionEvent::StartedLeading, ElectionEvent::StoppedLeading]
        );
    }

    #[tokio::test]
    async fn test_stopped_without_started_is_silent() {
        let (mut notifier, mut rx) = ObserverNotifier::channel(16);
        notifier.stopped_leading();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_new_leader_is_deduplicated() {
        let (mut notifier, mut rx) = ObserverNotifier::channel(16);

        for _ in 0..10 {
            notifier.observe_leader(Some("a"));
        }
        notifier.observe_leader(Some("b"));
        notifier.observe_leader(Some("b"));
        notifier.observe_leader(Some(""));
        notifier.observe_leader(None);
        notifier.observe_leader(Some("a"));

        assert_eq!(
            drain(&mut rx),
            vec![
                ElectionEvent::NewLeader(Some("a".to_string())),
                ElectionEvent::NewLeader(Some("b".to_string())),
                ElectionEvent::NewLeader(None),
                ElectionEvent::NewLeader(Some("a".to_string())),
            ]
        );
        assert_eq!(notifier.last_reported(), Some("a"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (mut notifier, mut rx) = ObserverNotifier::channel(1);

        notifier.observe_leader(Some("a"));
        notifier.observe_leader(Some("b"));
        notifier.started_leading();

        let stats = notifier.stats();
        assert_eq!(stats.notifications_sent, 3);
        assert_eq!(stats.notifications_delivered, 1);
        assert_eq!(stats.notifications_dropped, 2);

        // Dropped transitions are not replayed
        assert_eq!(
            drain(&mut rx),
            vec![ElectionEvent::NewLeader(Some("a".to_string()))]
        );
        assert!(notifier.is_leading());
    }

    #[tokio::test]
    async fn test_closed_receiver_counts_drops() {
        let (mut notifier, rx) = ObserverNotifier::channel(4);
        drop(rx);

        notifier.started_leading();
        assert_eq!(notifier.stats().notifications_dropped, 1);
    }

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
    }

    #[async_trait]
    impl LeaderCallbacks for Recorder {
        async fn on_started_leading(&mut self) {
            self.log.push("started".to_string());
        }

        async fn on_stopped_leading(&mut self) {
            self.log.push("stopped".to_string());
        }

        async fn on_new_leader(&mut self, identity: Option<&str>) {
            self.log.push(format!("leader={}", identity.unwrap_or("-")));
        }
    }

    #[tokio::test]
    async fn test_spawn_callbacks_dispatches_in_order() {
        let (mut notifier, rx) = ObserverNotifier::channel(8);
        let handle = spawn_callbacks(rx, Recorder::default());

        notifier.observe_leader(Some("me"));
        notifier.started_leading();
        notifier.stopped_leading();
        notifier.observe_leader(None);
        drop(notifier);

        let recorder = handle.await.unwrap();
        assert_eq!(
            recorder.log,
            vec!["leader=me", "started", "stopped", "leader=-"]
        );
    }
}
