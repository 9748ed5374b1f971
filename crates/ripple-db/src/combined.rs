use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bson::Document;
use tokio::time::Instant;

use crate::persistence::{Changeset, LoadResponse, OnChange, PersistenceAdapter, PersistenceError};

const DEFAULT_CACHE_WINDOW: Duration = Duration::from_millis(100);

/// Pairs a fast adapter (e.g. local storage) with a slow one (e.g. a
/// remote source). `load` answers from the fast adapter immediately;
/// the slow load runs in the background, is cached for a short
/// window, written back into the fast adapter and surfaced through
/// the change callback. Every save goes to both.
pub struct CombinedAdapter {
    fast: Arc<dyn PersistenceAdapter>,
    slow: Arc<dyn PersistenceAdapter>,
    cache_window: Duration,
    on_change: Arc<Mutex<Option<OnChange>>>,
    cached: Arc<Mutex<Option<(Instant, LoadResponse)>>>,
}

impl CombinedAdapter {
    pub fn new(fast: Arc<dyn PersistenceAdapter>, slow: Arc<dyn PersistenceAdapter>) -> Self {
        Self::with_cache_window(fast, slow, DEFAULT_CACHE_WINDOW)
    }

    pub fn with_cache_window(
        fast: Arc<dyn PersistenceAdapter>,
        slow: Arc<dyn PersistenceAdapter>,
        cache_window: Duration,
    ) -> Self {
        Self {
            fast,
            slow,
            cache_window,
            on_change: Arc::new(Mutex::new(None)),
            cached: Arc::new(Mutex::new(None)),
        }
    }

    fn take_fresh_cache(&self) -> Option<LoadResponse> {
        let mut cached = self.cached.lock().ok()?;
        match cached.take() {
            Some((at, response)) if at.elapsed() <= self.cache_window => Some(response),
            _ => None,
        }
    }
}

#[async_trait]
impl PersistenceAdapter for CombinedAdapter {
    async fn register(&self, on_change: OnChange) -> Result<(), PersistenceError> {
        if let Ok(mut slot) = self.on_change.lock() {
            *slot = Some(on_change.clone());
        }
        self.fast.register(on_change.clone()).await?;
        self.slow.register(on_change).await
    }

    async fn load(&self) -> Result<LoadResponse, PersistenceError> {
        if let Some(cached) = self.take_fresh_cache() {
            return Ok(cached);
        }

        // background refresh from the slow side
        let fast = self.fast.clone();
        let slow = self.slow.clone();
        let cached = self.cached.clone();
        let on_change = self.on_change.clone();
        tokio::spawn(async move {
            let response = match slow.load().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(error = %e, "slow adapter load failed");
                    return;
                }
            };
            if let Ok(mut slot) = cached.lock() {
                *slot = Some((Instant::now(), response.clone()));
            }
            if let LoadResponse::Items(items) = &response
                && let Err(e) = fast.save(items.clone(), Changeset::default()).await
            {
                tracing::warn!(error = %e, "write-back into fast adapter failed");
            }
            let callback = on_change.lock().ok().and_then(|slot| slot.clone());
            if let Some(callback) = callback {
                callback(Some(response));
            }
        });

        self.fast.load().await
    }

    async fn save(
        &self,
        items: Vec<Document>,
        changes: Changeset,
    ) -> Result<(), PersistenceError> {
        self.fast.save(items.clone(), changes.clone()).await?;
        self.slow.save(items, changes).await
    }

    async fn unregister(&self) -> Result<(), PersistenceError> {
        self.fast.unregister().await?;
        self.slow.unregister().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAdapter {
        items: Mutex<Vec<Document>>,
        saves: AtomicUsize,
    }

    impl StubAdapter {
        fn seeded(items: Vec<Document>) -> Arc<Self> {
            Arc::new(Self {
                items: Mutex::new(items),
                saves: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PersistenceAdapter for StubAdapter {
        async fn register(&self, _on_change: OnChange) -> Result<(), PersistenceError> {
            Ok(())
        }

        async fn load(&self) -> Result<LoadResponse, PersistenceError> {
            Ok(LoadResponse::Items(self.items.lock().unwrap().clone()))
        }

        async fn save(
            &self,
            items: Vec<Document>,
            _changes: Changeset,
        ) -> Result<(), PersistenceError> {
            *self.items.lock().unwrap() = items;
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn load_serves_fast_and_writes_back_slow() {
        let fast = StubAdapter::seeded(vec![doc! { "id": "cached" }]);
        let slow = StubAdapter::seeded(vec![doc! { "id": "fresh" }]);
        let combined = CombinedAdapter::new(fast.clone(), slow.clone());

        let surfaced: Arc<Mutex<Vec<LoadResponse>>> = Default::default();
        let seen = surfaced.clone();
        combined
            .register(Arc::new(move |response| {
                if let Some(response) = response {
                    seen.lock().unwrap().push(response);
                }
            }))
            .await
            .unwrap();

        // the fast answer comes back immediately
        match combined.load().await.unwrap() {
            LoadResponse::Items(items) => assert_eq!(items, vec![doc! { "id": "cached" }]),
            other => panic!("expected items, got {other:?}"),
        }

        // the slow result lands in the background: written back into
        // the fast adapter and surfaced through on_change
        for _ in 0..100 {
            if !surfaced.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(surfaced.lock().unwrap().len(), 1);
        assert_eq!(
            *fast.items.lock().unwrap(),
            vec![doc! { "id": "fresh" }]
        );
    }

    #[tokio::test]
    async fn save_reaches_both_sides() {
        let fast = StubAdapter::seeded(vec![]);
        let slow = StubAdapter::seeded(vec![]);
        let combined = CombinedAdapter::new(fast.clone(), slow.clone());

        combined
            .save(vec![doc! { "id": "1" }], Changeset::default())
            .await
            .unwrap();
        assert_eq!(fast.saves.load(Ordering::SeqCst), 1);
        assert_eq!(slow.saves.load(Ordering::SeqCst), 1);
    }
}
