//! FormationFeed: fan-out of formation changes to subscribers.
//!
//! A subscriber is registered for live announcements *before* the
//! historical query runs, so a change committed between the query and
//! the first live read shows up in both places. Each subscription keeps the
//! last commit version it delivered per formation key and drops anything
//! at or below it, which makes the hand-over from replay to live mode
//! gap-free and duplicate-free.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use flotilla_core::{ExpandedFormation, FeedEvent, Formation};
use flotilla_state::{FormationRecord, StateStore};

use crate::error::{FeedError, FeedResult};

/// An expanded formation tagged with the commit version it was read at.
#[derive(Debug, Clone)]
struct Versioned {
    version: u64,
    formation: ExpandedFormation,
}

struct Subscriber {
    tx: mpsc::Sender<Versioned>,
    lagged: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<u64, Subscriber>,
    closed: bool,
}

struct FeedInner {
    store: StateStore,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    buffer: usize,
}

impl FeedInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) {
        if self.registry().subscribers.remove(&id).is_some() {
            debug!(subscriber = id, "formation subscriber detached");
        }
    }

    /// Join a formation record with its app, release, and artifact.
    ///
    /// Returns `None` (after logging) when a referenced record is gone.
    fn expand(&self, record: &FormationRecord) -> Option<Versioned> {
        match self.try_expand(record) {
            Ok(Some(formation)) => Some(Versioned {
                version: record.version,
                formation,
            }),
            Ok(None) => {
                warn!(
                    key = %record.formation.key(),
                    version = record.version,
                    "dropping formation event: referenced record missing"
                );
                None
            }
            Err(e) => {
                warn!(key = %record.formation.key(), error = %e, "dropping formation event");
                None
            }
        }
    }

    fn try_expand(&self, record: &FormationRecord) -> FeedResult<Option<ExpandedFormation>> {
        let Formation {
            app_id,
            release_id,
            processes,
            ..
        } = &record.formation;

        let Some(app) = self.store.get_app(app_id)? else {
            return Ok(None);
        };
        let Some(release) = self.store.get_release(release_id)? else {
            return Ok(None);
        };
        let Some(artifact) = self.store.get_artifact(&release.artifact_id)? else {
            return Ok(None);
        };

        let processes = if record.is_deleted() {
            None
        } else {
            Some(processes.clone())
        };
        Ok(Some(ExpandedFormation {
            app,
            release,
            artifact,
            processes,
            updated_at: record.changed_at().unwrap_or_else(Utc::now),
        }))
    }
}

/// Synchronized registry of formation subscribers.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct FormationFeed {
    inner: Arc<FeedInner>,
}

impl FormationFeed {
    /// Create a feed over `store`. `buffer` bounds each subscriber's queue.
    pub fn new(store: StateStore, buffer: usize) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                store,
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Upsert a formation and announce the committed state.
    pub fn put_formation(&self, formation: &Formation) -> FeedResult<Formation> {
        let record = self.inner.store.put_formation(formation)?;
        self.announce(&record);
        Ok(record.formation)
    }

    /// Delete a formation and announce the deletion.
    ///
    /// Returns false when there was no live formation to delete.
    pub fn delete_formation(&self, app: &str, release_id: &str) -> FeedResult<bool> {
        match self.inner.store.delete_formation(app, release_id)? {
            Some(tombstone) => {
                self.announce(&tombstone);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Expand a committed formation record once and deliver it to every
    /// live subscriber.
    ///
    /// Delivery never blocks: a subscriber whose queue is full is
    /// disconnected and will observe [`FeedError::Lagged`].
    pub fn announce(&self, record: &FormationRecord) {
        let Some(event) = self.inner.expand(record) else {
            return;
        };

        let mut registry = self.inner.registry();
        let mut dropped = Vec::new();
        for (id, subscriber) in &registry.subscribers {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    subscriber.lagged.store(true, Ordering::Release);
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            let lagged = registry
                .subscribers
                .remove(&id)
                .is_some_and(|s| s.lagged.load(Ordering::Acquire));
            if lagged {
                warn!(subscriber = id, "formation subscriber lagged, disconnecting");
            }
        }
        debug!(
            key = %event.formation.key(),
            version = event.version,
            subscribers = registry.subscribers.len(),
            "formation announced"
        );
    }

    /// Subscribe to every formation change at or after `since`, followed by
    /// live changes.
    pub fn subscribe(&self, since: DateTime<Utc>) -> FeedResult<Subscription> {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let lagged = Arc::new(AtomicBool::new(false));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut registry = self.inner.registry();
            if registry.closed {
                return Err(FeedError::Closed);
            }
            registry.subscribers.insert(
                id,
                Subscriber {
                    tx,
                    lagged: lagged.clone(),
                },
            );
        }

        // Registered first: anything committed from here on reaches `rx`.
        let records = match self.inner.store.formation_changes_since(since) {
            Ok(records) => records,
            Err(e) => {
                self.inner.remove(id);
                return Err(e.into());
            }
        };
        let replay: VecDeque<Versioned> = records
            .iter()
            .filter_map(|record| self.inner.expand(record))
            .collect();

        info!(subscriber = id, %since, replay = replay.len(), "formation subscriber attached");
        Ok(Subscription {
            id,
            inner: self.inner.clone(),
            replay,
            replay_complete: false,
            rx,
            lagged,
            lag_reported: false,
            seen: HashMap::new(),
        })
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry().subscribers.len()
    }

    /// Disconnect every subscriber and refuse new ones.
    ///
    /// Open subscriptions end after draining what was already queued.
    pub fn close(&self) {
        let mut registry = self.inner.registry();
        registry.closed = true;
        let count = registry.subscribers.len();
        registry.subscribers.clear();
        info!(subscribers = count, "formation feed closed");
    }
}

/// A replay-then-live stream of formation changes.
///
/// Dropping the subscription removes it from the feed's registry.
pub struct Subscription {
    id: u64,
    inner: Arc<FeedInner>,
    replay: VecDeque<Versioned>,
    replay_complete: bool,
    rx: mpsc::Receiver<Versioned>,
    lagged: Arc<AtomicBool>,
    lag_reported: bool,
    /// Highest version delivered per formation key.
    seen: HashMap<String, u64>,
}

impl Subscription {
    /// Record `event` as delivered unless an equal or newer version of the
    /// same formation already was.
    fn admit(&mut self, event: &Versioned) -> bool {
        let key = event.formation.key();
        match self.seen.get(&key) {
            Some(&last) if event.version <= last => false,
            _ => {
                self.seen.insert(key, event.version);
                true
            }
        }
    }
}

impl Stream for Subscription {
    type Item = FeedResult<FeedEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        while let Some(event) = this.replay.pop_front() {
            if this.admit(&event) {
                return Poll::Ready(Some(Ok(FeedEvent::Formation(event.formation))));
            }
        }
        if !this.replay_complete {
            this.replay_complete = true;
            return Poll::Ready(Some(Ok(FeedEvent::ReplayComplete)));
        }

        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    if this.admit(&event) {
                        return Poll::Ready(Some(Ok(FeedEvent::Formation(event.formation))));
                    }
                }
                Poll::Ready(None) => {
                    if this.lagged.load(Ordering::Acquire) && !this.lag_reported {
                        this.lag_reported = true;
                        return Poll::Ready(Some(Err(FeedError::Lagged)));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{App, Artifact, Release};
    use futures::StreamExt;
    use std::time::Duration;

    struct Fixture {
        feed: FormationFeed,
        app: App,
        release: Release,
    }

    fn fixture(buffer: usize) -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let app = store
            .create_app(&App {
                name: "feed-app".into(),
                ..Default::default()
            })
            .unwrap();
        let release = new_release(&store);
        Fixture {
            feed: FormationFeed::new(store, buffer),
            app,
            release,
        }
    }

    fn new_release(store: &StateStore) -> Release {
        let artifact = store
            .create_artifact(&Artifact {
                kind: "docker".into(),
                uri: "docker://feed/app".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .create_release(&Release {
                artifact_id: artifact.id,
                ..Default::default()
            })
            .unwrap()
    }

    fn formation(app: &App, release: &Release, web: i32) -> Formation {
        Formation {
            app_id: app.id.clone(),
            release_id: release.id.clone(),
            processes: HashMap::from([("web".to_string(), web)]),
            ..Default::default()
        }
    }

    async fn next(sub: &mut Subscription) -> FeedEvent {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("timed out waiting for feed event")
            .expect("stream ended")
            .expect("feed error")
    }

    fn web_count(event: &FeedEvent) -> Option<i32> {
        match event {
            FeedEvent::Formation(f) => f.processes.as_ref().map(|p| p["web"]),
            FeedEvent::ReplayComplete => panic!("unexpected replay marker"),
        }
    }

    #[tokio::test]
    async fn replay_then_live() {
        let fx = fixture(16);
        fx.feed.put_formation(&formation(&fx.app, &fx.release, 1)).unwrap();

        let mut sub = fx.feed.subscribe(DateTime::<Utc>::UNIX_EPOCH).unwrap();
        assert_eq!(web_count(&next(&mut sub).await), Some(1));
        assert_eq!(next(&mut sub).await, FeedEvent::ReplayComplete);

        fx.feed.put_formation(&formation(&fx.app, &fx.release, 2)).unwrap();
        let live = next(&mut sub).await;
        assert_eq!(web_count(&live), Some(2));
        if let FeedEvent::Formation(f) = live {
            assert_eq!(f.app.id, fx.app.id);
            assert_eq!(f.release.id, fx.release.id);
            assert_eq!(f.artifact.uri, "docker://feed/app");
        }
    }

    #[tokio::test]
    async fn empty_replay_yields_marker_first() {
        let fx = fixture(16);
        let mut sub = fx.feed.subscribe(DateTime::<Utc>::UNIX_EPOCH).unwrap();
        assert_eq!(next(&mut sub).await, FeedEvent::ReplayComplete);
    }

    #[tokio::test]
    async fn since_filters_history() {
        let fx = fixture(16);
        let other = new_release(fx.feed.store());
        fx.feed.put_formation(&formation(&fx.app, &other, 1)).unwrap();
        let cutoff = Utc::now();
        fx.feed.put_formation(&formation(&fx.app, &fx.release, 5)).unwrap();

        let mut sub = fx.feed.subscribe(cutoff).unwrap();
        match next(&mut sub).await {
            FeedEvent::Formation(f) => assert_eq!(f.release.id, fx.release.id),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(next(&mut sub).await, FeedEvent::ReplayComplete);
    }

    #[tokio::test]
    async fn change_in_replay_window_is_not_duplicated() {
        let fx = fixture(16);
        let mut sub = fx.feed.subscribe(DateTime::<Utc>::UNIX_EPOCH).unwrap();

        // Committed after registration, so the live queue has it. Re-running
        // the replay query would find it too; simulate that by announcing the
        // same record twice.
        let record = fx
            .feed
            .store()
            .put_formation(&formation(&fx.app, &fx.release, 3))
            .unwrap();
        fx.feed.announce(&record);
        fx.feed.announce(&record);

        assert_eq!(next(&mut sub).await, FeedEvent::ReplayComplete);
        assert_eq!(web_count(&next(&mut sub).await), Some(3));

        fx.feed.put_formation(&formation(&fx.app, &fx.release, 4)).unwrap();
        assert_eq!(web_count(&next(&mut sub).await), Some(4));
    }

    #[tokio::test]
    async fn replayed_change_is_not_redelivered_live() {
        let fx = fixture(16);
        // Commit, subscribe, then announce late: the replay covers it.
        let record = fx
            .feed
            .store()
            .put_formation(&formation(&fx.app, &fx.release, 7))
            .unwrap();
        let mut sub = fx.feed.subscribe(DateTime::<Utc>::UNIX_EPOCH).unwrap();
        fx.feed.announce(&record);
        fx.feed.put_formation(&formation(&fx.app, &fx.release, 8)).unwrap();

        assert_eq!(web_count(&next(&mut sub).await), Some(7));
        assert_eq!(next(&mut sub).await, FeedEvent::ReplayComplete);
        assert_eq!(web_count(&next(&mut sub).await), Some(8));
    }

    #[tokio::test]
    async fn stale_announcement_is_dropped() {
        let fx = fixture(16);
        let store = fx.feed.store();
        let older = store.put_formation(&formation(&fx.app, &fx.release, 1)).unwrap();
        let newer = store.put_formation(&formation(&fx.app, &fx.release, 2)).unwrap();

        let mut sub = fx.feed.subscribe(Utc::now()).unwrap();
        assert_eq!(next(&mut sub).await, FeedEvent::ReplayComplete);

        fx.feed.announce(&newer);
        fx.feed.announce(&older);
        fx.feed.put_formation(&formation(&fx.app, &fx.release, 9)).unwrap();

        assert_eq!(web_count(&next(&mut sub).await), Some(2));
        assert_eq!(web_count(&next(&mut sub).await), Some(9));
    }

    #[tokio::test]
    async fn deletion_carries_identity_without_processes() {
        let fx = fixture(16);
        let mut sub = fx.feed.subscribe(DateTime::<Utc>::UNIX_EPOCH).unwrap();
        assert_eq!(next(&mut sub).await, FeedEvent::ReplayComplete);

        fx.feed.put_formation(&formation(&fx.app, &fx.release, 1)).unwrap();
        assert!(fx.feed.delete_formation(&fx.app.id, &fx.release.id).unwrap());

        assert_eq!(web_count(&next(&mut sub).await), Some(1));
        match next(&mut sub).await {
            FeedEvent::Formation(f) => {
                assert!(f.is_deletion());
                assert_eq!(f.app.id, fx.app.id);
                assert_eq!(f.release.id, fx.release.id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn deletion_replays_as_tombstone() {
        let fx = fixture(16);
        fx.feed.put_formation(&formation(&fx.app, &fx.release, 1)).unwrap();
        fx.feed.delete_formation(&fx.app.id, &fx.release.id).unwrap();

        let mut sub = fx.feed.subscribe(DateTime::<Utc>::UNIX_EPOCH).unwrap();
        match next(&mut sub).await {
            FeedEvent::Formation(f) => assert!(f.is_deletion()),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(next(&mut sub).await, FeedEvent::ReplayComplete);
    }

    #[tokio::test]
    async fn empty_processes_are_not_a_deletion() {
        let fx = fixture(16);
        let mut f = formation(&fx.app, &fx.release, 0);
        f.processes.clear();
        fx.feed.put_formation(&f).unwrap();

        let mut sub = fx.feed.subscribe(DateTime::<Utc>::UNIX_EPOCH).unwrap();
        match next(&mut sub).await {
            FeedEvent::Formation(f) => {
                assert!(!f.is_deletion());
                assert_eq!(f.processes, Some(HashMap::new()));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn expansion_failure_drops_event() {
        let fx = fixture(16);
        let record = fx
            .feed
            .store()
            .put_formation(&formation(&fx.app, &fx.release, 1))
            .unwrap();
        fx.feed.store().delete_app(&fx.app.id).unwrap();

        let mut sub = fx.feed.subscribe(DateTime::<Utc>::UNIX_EPOCH).unwrap();
        assert_eq!(next(&mut sub).await, FeedEvent::ReplayComplete);

        fx.feed.announce(&record);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_without_blocking_others() {
        let fx = fixture(2);
        let mut slow = fx.feed.subscribe(Utc::now()).unwrap();
        let mut fast = fx.feed.subscribe(Utc::now()).unwrap();
        assert_eq!(next(&mut fast).await, FeedEvent::ReplayComplete);

        for web in 1..=3 {
            fx.feed.put_formation(&formation(&fx.app, &fx.release, web)).unwrap();
            assert_eq!(web_count(&next(&mut fast).await), Some(web));
        }
        assert_eq!(fx.feed.subscriber_count(), 1);

        assert_eq!(next(&mut slow).await, FeedEvent::ReplayComplete);
        assert_eq!(web_count(&next(&mut slow).await), Some(1));
        assert_eq!(web_count(&next(&mut slow).await), Some(2));
        assert!(matches!(slow.next().await, Some(Err(FeedError::Lagged))));
        assert!(slow.next().await.is_none());
    }

    #[tokio::test]
    async fn drop_releases_registration() {
        let fx = fixture(16);
        let sub = fx.feed.subscribe(Utc::now()).unwrap();
        assert_eq!(fx.feed.subscriber_count(), 1);
        drop(sub);
        assert_eq!(fx.feed.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_ends_streams_and_rejects_new_subscribers() {
        let fx = fixture(16);
        let mut sub = fx.feed.subscribe(Utc::now()).unwrap();
        fx.feed.close();

        assert_eq!(next(&mut sub).await, FeedEvent::ReplayComplete);
        assert!(sub.next().await.is_none());
        assert!(matches!(
            fx.feed.subscribe(Utc::now()),
            Err(FeedError::Closed)
        ));
    }

    #[tokio::test]
    async fn ordering_per_formation_across_many_writes() {
        let fx = fixture(64);
        let mut sub = fx.feed.subscribe(DateTime::<Utc>::UNIX_EPOCH).unwrap();
        assert_eq!(next(&mut sub).await, FeedEvent::ReplayComplete);

        for web in 1..=20 {
            fx.feed.put_formation(&formation(&fx.app, &fx.release, web)).unwrap();
        }
        for web in 1..=20 {
            assert_eq!(web_count(&next(&mut sub).await), Some(web));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribers_racing_writers_see_every_formation_in_order() {
        const WRITES: i32 = 150;
        let fx = fixture(1024);
        let releases: Vec<Release> = (0..4).map(|_| new_release(fx.feed.store())).collect();

        let writers: Vec<_> = releases
            .iter()
            .map(|release| {
                let feed = fx.feed.clone();
                let base = formation(&fx.app, release, 0);
                std::thread::spawn(move || {
                    for web in 1..=WRITES {
                        let next = Formation {
                            processes: HashMap::from([("web".to_string(), web)]),
                            ..base.clone()
                        };
                        feed.put_formation(&next).unwrap();
                    }
                })
            })
            .collect();

        let mut readers = Vec::new();
        for _ in 0..10 {
            let mut sub = fx.feed.subscribe(DateTime::<Utc>::UNIX_EPOCH).unwrap();
            let keys = releases.len();
            readers.push(tokio::spawn(async move {
                let mut last: HashMap<String, i32> = HashMap::new();
                let mut markers = 0;
                while last.len() < keys || last.values().any(|&web| web < WRITES) {
                    match next(&mut sub).await {
                        FeedEvent::ReplayComplete => markers += 1,
                        FeedEvent::Formation(f) => {
                            let web = f.processes.as_ref().unwrap()["web"];
                            let prev = last.insert(f.release.id.clone(), web).unwrap_or(0);
                            assert!(web > prev, "{} went from {prev} to {web}", f.release.id);
                        }
                    }
                }
                assert!(markers <= 1);
            }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for writer in writers {
            writer.join().unwrap();
        }
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
