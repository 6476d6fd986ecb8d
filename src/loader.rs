use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

struct BatchState<K, V> {
    queued: Vec<K>,
    waiters: HashMap<K, Vec<oneshot::Sender<Option<V>>>>,
    completed: HashMap<K, Option<V>>,
    scheduled: bool,
}

impl<K, V> Default for BatchState<K, V> {
    fn default() -> Self {
        Self {
            queued: Vec::new(),
            waiters: HashMap::new(),
            completed: HashMap::new(),
            scheduled: false,
        }
    }
}

/// Coalesces key lookups issued within `delay` into one call of `loader_fn`.
///
/// Results (including misses) are cached for the loader's lifetime, which is
/// the lifetime of the request scope that owns it.
pub struct BatchLoader<K, V, F>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    F: Fn(Vec<K>) -> BoxFuture<'static, HashMap<K, V>> + Send + Sync + Clone + 'static,
{
    delay: Duration,
    loader_fn: F,
    state: Arc<Mutex<BatchState<K, V>>>,
}

impl<K, V, F> BatchLoader<K, V, F>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    F: Fn(Vec<K>) -> BoxFuture<'static, HashMap<K, V>> + Send + Sync + Clone + 'static,
{
    pub fn new(delay: Duration, loader_fn: F) -> Self {
        Self {
            delay,
            loader_fn,
            state: Arc::new(Mutex::new(BatchState::default())),
        }
    }

    pub fn with_delay_ms(delay_ms: u64, loader_fn: F) -> Self {
        Self::new(Duration::from_millis(delay_ms), loader_fn)
    }

    pub async fn load(&self, key: K) -> Option<V> {
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.lock().await;
            if let Some(done) = state.completed.get(&key) {
                return done.clone();
            }

            match state.waiters.get_mut(&key) {
                Some(waiting) => waiting.push(tx),
                None => {
                    state.queued.push(key.clone());
                    state.waiters.insert(key, vec![tx]);
                }
            }

            if !state.scheduled {
                state.scheduled = true;
                self.schedule();
            }
        }

        rx.await.ok().flatten()
    }

    pub async fn load_many(&self, keys: impl IntoIterator<Item = K>) -> HashMap<K, V> {
        let pending: Vec<_> = keys
            .into_iter()
            .map(|key| async move { (key.clone(), self.load(key).await) })
            .collect();

        futures::future::join_all(pending)
            .await
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect()
    }

    /// Seeds the cache so later loads of `key` skip the batch.
    pub async fn prime(&self, key: K, value: V) {
        self.state.lock().await.completed.insert(key, Some(value));
    }

    pub async fn clear(&self) {
        self.state.lock().await.completed.clear();
    }

    fn schedule(&self) {
        let state = self.state.clone();
        let loader = self.loader_fn.clone();
        let delay = self.delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let keys = {
                let mut s = state.lock().await;
                s.scheduled = false;
                std::mem::take(&mut s.queued)
            };

            if keys.is_empty() {
                return;
            }

            let mut results = loader(keys.clone()).await;

            let mut s = state.lock().await;
            for key in keys {
                let value = results.remove(&key);
                if let Some(waiting) = s.waiters.remove(&key) {
                    for tx in waiting {
                        let _ = tx.send(value.clone());
                    }
                }
                s.completed.insert(key, value);
            }
        });
    }
}

impl<K, V, F> Clone for BatchLoader<K, V, F>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    F: Fn(Vec<K>) -> BoxFuture<'static, HashMap<K, V>> + Send + Sync + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            delay: self.delay,
            loader_fn: self.loader_fn.clone(),
            state: self.state.clone(),
        }
    }
}

/// The loaders of one request scope, keyed by name and loader type.
#[derive(Default)]
pub struct DataLoaders {
    loaders: StdMutex<HashMap<(String, TypeId), Arc<dyn Any + Send + Sync>>>,
}

impl DataLoaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the loader registered under `name`, creating it with `init`.
    pub fn get_or_insert_with<L, I>(&self, name: &str, init: I) -> Arc<L>
    where
        L: Send + Sync + 'static,
        I: FnOnce() -> L,
    {
        let mut loaders = self.loaders.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = loaders
            .entry((name.to_string(), TypeId::of::<L>()))
            .or_insert_with(|| Arc::new(init()));
        match entry.clone().downcast::<L>() {
            Ok(loader) => loader,
            Err(_) => unreachable!("loader entries are keyed by their TypeId"),
        }
    }

    pub fn get<L>(&self, name: &str) -> Option<Arc<L>>
    where
        L: Send + Sync + 'static,
    {
        let loaders = self.loaders.lock().unwrap_or_else(PoisonError::into_inner);
        loaders
            .get(&(name.to_string(), TypeId::of::<L>()))
            .cloned()
            .and_then(|loader| loader.downcast::<L>().ok())
    }

    pub fn len(&self) -> usize {
        self.loaders.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        let mut loaders = self.loaders.lock().unwrap_or_else(PoisonError::into_inner);
        let count = loaders.len();
        loaders.clear();
        count
    }
}

impl fmt::Debug for DataLoaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoaders")
            .field("loaders", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_batch_loader_batches_requests() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let loader = BatchLoader::with_delay_ms(10, move |keys: Vec<i64>| {
            let cc = call_count_clone.clone();
            Box::pin(async move {
                cc.fetch_add(1, Ordering::SeqCst);
                keys.into_iter()
                    .map(|k| (k, format!("value_{}", k)))
                    .collect()
            }) as BoxFuture<'static, HashMap<i64, String>>
        });

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let l = loader.clone();
                tokio::spawn(async move { l.load(i).await })
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(result.is_some());
        }

        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_loader_deduplicates_and_caches() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let loader = BatchLoader::with_delay_ms(5, move |keys: Vec<i64>| {
            seen_clone.lock().unwrap().push(keys.clone());
            Box::pin(async move { keys.into_iter().map(|k| (k, k * 2)).collect() })
                as BoxFuture<'static, HashMap<i64, i64>>
        });

        let (a, b) = tokio::join!(loader.load(21), loader.load(21));
        assert_eq!(a, Some(42));
        assert_eq!(b, Some(42));

        assert_eq!(loader.load(21).await, Some(42));
        assert_eq!(seen.lock().unwrap().clone(), vec![vec![21]]);

        loader.clear().await;
        assert_eq!(loader.load(21).await, Some(42));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_loader_missing_key() {
        let loader = BatchLoader::with_delay_ms(5, |_keys: Vec<i64>| {
            Box::pin(async move { HashMap::<i64, String>::new() })
                as BoxFuture<'static, HashMap<i64, String>>
        });

        let result = loader.load(1).await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_batch_loader_prime_and_load_many() {
        let loader = BatchLoader::with_delay_ms(5, |keys: Vec<i64>| {
            Box::pin(async move { keys.into_iter().filter(|k| *k != 3).map(|k| (k, k + 100)).collect() })
                as BoxFuture<'static, HashMap<i64, i64>>
        });

        loader.prime(1, 7).await;
        let loaded = loader.load_many([1, 2, 3]).await;
        assert_eq!(loaded.get(&1), Some(&7));
        assert_eq!(loaded.get(&2), Some(&102));
        assert!(!loaded.contains_key(&3));
    }

    #[test]
    fn test_data_loaders_are_keyed_by_name_and_type() {
        let loaders = DataLoaders::new();
        let a = loaders.get_or_insert_with("users", || 1u32);
        let b = loaders.get_or_insert_with("users", || 2u32);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 1);

        let c = loaders.get_or_insert_with("users", || String::from("other type"));
        assert_eq!(c.as_str(), "other type");
        assert_eq!(loaders.len(), 2);
        assert_eq!(loaders.get::<u32>("users").as_deref(), Some(&1));

        assert_eq!(loaders.clear(), 2);
        assert!(loaders.get::<u32>("users").is_none());
    }
}
