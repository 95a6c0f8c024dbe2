use std::sync::Arc;
use std::time::Duration;

use arena_core::records::{Hub, Identity, MatchRecord, Tournament, User};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Supplies platform records for cache misses. Lookup failures resolve
/// to `None`; the cache remembers negative results for the same TTL.
pub trait ContextFetch: Send + Sync + 'static {
    fn hub(&self, id: &str) -> BoxFuture<'static, Option<Hub>>;
    fn match_record(&self, id: &str) -> BoxFuture<'static, Option<MatchRecord>>;
    fn user(&self, id: &str) -> BoxFuture<'static, Option<User>>;
    fn tournament(&self, id: &str) -> BoxFuture<'static, Option<Tournament>>;
    fn identity(&self, id: &str) -> BoxFuture<'static, Option<Identity>>;
}

type SharedFetch<T> = Shared<BoxFuture<'static, Option<T>>>;

enum Slot<T: Clone> {
    /// A fetch is in flight; latecomers await the same future.
    Pending(SharedFetch<T>),
    Ready {
        value: Option<T>,
        expires_at: Instant,
    },
}

struct Partition<T: Clone> {
    entries: DashMap<String, Slot<T>>,
}

impl<T: Clone + Send + Sync + 'static> Partition<T> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    async fn get<F>(&self, key: &str, ttl: Duration, fetch: F) -> Option<T>
    where
        F: FnOnce() -> BoxFuture<'static, Option<T>>,
    {
        if key.trim().is_empty() {
            return None;
        }

        let shared = match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Ready { value, expires_at } if *expires_at > Instant::now() => {
                    return value.clone();
                }
                Slot::Pending(shared) => shared.clone(),
                Slot::Ready { .. } => {
                    // expired; this caller refreshes
                    let shared = fetch().shared();
                    occupied.insert(Slot::Pending(shared.clone()));
                    shared
                }
            },
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let shared = fetch().shared();
                vacant.insert(Slot::Pending(shared.clone()));
                shared
            }
        };

        let value = shared.await;
        // whichever awaiter completes installs the slot; the caller
        // that started the fetch may have been cancelled mid-await
        self.entries.insert(
            key.to_string(),
            Slot::Ready {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        value
    }

    fn bust(&self, key: &str) {
        self.entries.remove(key);
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| match slot {
            Slot::Pending(_) => true,
            Slot::Ready { expires_at, .. } => *expires_at > now,
        });
        before - self.entries.len()
    }
}

/// Read-through cache for the platform records the classifier needs.
/// One partition per record kind; concurrent misses on the same key
/// share a single upstream fetch.
pub struct ContextCache<F: ContextFetch> {
    fetch: Arc<F>,
    ttl: Duration,
    hubs: Partition<Hub>,
    matches: Partition<MatchRecord>,
    users: Partition<User>,
    tournaments: Partition<Tournament>,
    identities: Partition<Identity>,
}

impl<F: ContextFetch> ContextCache<F> {
    pub fn new(fetch: Arc<F>, ttl: Duration) -> Self {
        Self {
            fetch,
            ttl,
            hubs: Partition::new(),
            matches: Partition::new(),
            users: Partition::new(),
            tournaments: Partition::new(),
            identities: Partition::new(),
        }
    }

    pub async fn hub(&self, id: &str) -> Option<Hub> {
        let fetch = Arc::clone(&self.fetch);
        let id_owned = id.to_string();
        self.hubs
            .get(id, self.ttl, move || fetch.hub(&id_owned))
            .await
    }

    pub async fn match_record(&self, id: &str) -> Option<MatchRecord> {
        let fetch = Arc::clone(&self.fetch);
        let id_owned = id.to_string();
        self.matches
            .get(id, self.ttl, move || fetch.match_record(&id_owned))
            .await
    }

    pub async fn user(&self, id: &str) -> Option<User> {
        let fetch = Arc::clone(&self.fetch);
        let id_owned = id.to_string();
        self.users
            .get(id, self.ttl, move || fetch.user(&id_owned))
            .await
    }

    pub async fn tournament(&self, id: &str) -> Option<Tournament> {
        let fetch = Arc::clone(&self.fetch);
        let id_owned = id.to_string();
        self.tournaments
            .get(id, self.ttl, move || fetch.tournament(&id_owned))
            .await
    }

    pub async fn identity(&self, id: &str) -> Option<Identity> {
        let fetch = Arc::clone(&self.fetch);
        let id_owned = id.to_string();
        self.identities
            .get(id, self.ttl, move || fetch.identity(&id_owned))
            .await
    }

    pub fn bust_hub(&self, id: &str) {
        self.hubs.bust(id);
    }

    pub fn bust_match(&self, id: &str) {
        self.matches.bust(id);
    }

    pub fn bust_user(&self, id: &str) {
        self.users.bust(id);
    }

    pub fn bust_all(&self) {
        self.hubs.clear();
        self.matches.clear();
        self.users.clear();
        self.tournaments.clear();
        self.identities.clear();
    }

    /// Drop expired entries. Runs from the background sweeper; callable
    /// directly for deterministic tests.
    pub fn sweep(&self) -> usize {
        self.hubs.sweep()
            + self.matches.sweep()
            + self.users.sweep()
            + self.tournaments.sweep()
            + self.identities.sweep()
    }

    /// Periodic sweep until the token fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let dropped = cache.sweep();
                if dropped > 0 {
                    debug!(dropped, "cache sweep evicted expired entries");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingFetch {
        user_calls: AtomicUsize,
        hub_calls: AtomicUsize,
    }

    impl ContextFetch for CountingFetch {
        fn hub(&self, id: &str) -> BoxFuture<'static, Option<Hub>> {
            self.hub_calls.fetch_add(1, Ordering::SeqCst);
            let id = id.to_string();
            async move {
                Some(Hub {
                    id: id.clone(),
                    name: format!("hub {id}"),
                    game: Some("cs2".into()),
                    organizer_id: Some("org".into()),
                    chat_room_id: None,
                })
            }
            .boxed()
        }

        fn match_record(&self, _id: &str) -> BoxFuture<'static, Option<MatchRecord>> {
            async { None }.boxed()
        }

        fn user(&self, id: &str) -> BoxFuture<'static, Option<User>> {
            self.user_calls.fetch_add(1, Ordering::SeqCst);
            let id = id.to_string();
            async move {
                tokio::task::yield_now().await;
                if id == "ghost" {
                    return None;
                }
                Some(User {
                    id: id.clone(),
                    nickname: format!("nick-{id}"),
                    avatar: None,
                    country: None,
                })
            }
            .boxed()
        }

        fn tournament(&self, _id: &str) -> BoxFuture<'static, Option<Tournament>> {
            async { None }.boxed()
        }

        fn identity(&self, _id: &str) -> BoxFuture<'static, Option<Identity>> {
            async { None }.boxed()
        }
    }

    fn cache_with_ttl(ttl: Duration) -> (Arc<ContextCache<CountingFetch>>, Arc<CountingFetch>) {
        let fetch = Arc::new(CountingFetch::default());
        (
            Arc::new(ContextCache::new(Arc::clone(&fetch), ttl)),
            fetch,
        )
    }

    #[tokio::test]
    async fn second_lookup_hits_the_cache() {
        let (cache, fetch) = cache_with_ttl(Duration::from_secs(60));
        let first = cache.user("u1").await.unwrap();
        let second = cache.user("u1").await.unwrap();
        assert_eq!(first.nickname, second.nickname);
        assert_eq!(fetch.user_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let (cache, fetch) = cache_with_ttl(Duration::from_secs(60));
        let (a, b, c) = tokio::join!(cache.user("u1"), cache.user("u1"), cache.user("u1"));
        assert!(a.is_some() && b.is_some() && c.is_some());
        assert_eq!(fetch.user_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_results_are_cached_too() {
        let (cache, fetch) = cache_with_ttl(Duration::from_secs(60));
        assert!(cache.user("ghost").await.is_none());
        assert!(cache.user("ghost").await.is_none());
        assert_eq!(fetch.user_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_and_whitespace_keys_short_circuit() {
        let (cache, fetch) = cache_with_ttl(Duration::from_secs(60));
        assert!(cache.user("").await.is_none());
        assert!(cache.user("   ").await.is_none());
        assert!(cache.user("\t\n").await.is_none());
        assert_eq!(fetch.user_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_fetch_still_installs_an_expiring_entry() {
        let (cache, fetch) = cache_with_ttl(Duration::from_secs(10));

        // start a miss and abandon it mid-fetch
        {
            let mut pending = Box::pin(cache.user("u1"));
            assert!(futures::poll!(pending.as_mut()).is_pending());
        }

        // a latecomer completes the shared fetch without refetching
        assert!(cache.user("u1").await.is_some());
        assert_eq!(fetch.user_calls.load(Ordering::SeqCst), 1);

        // and the entry expires normally instead of pinning forever
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.sweep(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_triggers_a_refetch() {
        let (cache, fetch) = cache_with_ttl(Duration::from_secs(10));
        cache.user("u1").await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.user("u1").await.unwrap();
        assert_eq!(fetch.user_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_expired_entries() {
        let (cache, _fetch) = cache_with_ttl(Duration::from_secs(10));
        cache.user("old").await;
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.user("fresh").await;
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.sweep(), 1);
        // the fresh entry survives
        assert_eq!(cache.sweep(), 0);
    }

    #[tokio::test]
    async fn bust_forces_a_refetch() {
        let (cache, fetch) = cache_with_ttl(Duration::from_secs(60));
        cache.hub("h1").await.unwrap();
        cache.bust_hub("h1");
        cache.hub("h1").await.unwrap();
        assert_eq!(fetch.hub_calls.load(Ordering::SeqCst), 2);
    }
}
