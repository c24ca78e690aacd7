//! Request-scoped data-fetching cache.
//!
//! Loaders read and prime shared data through a [`QueryClient`]. Each request
//! gets its own client wrapped in a [`TrackedQueryClient`], which forwards every
//! call and records the data the loaders touched so the full document can seed
//! the browser-side cache with it ([`TrackedQueryClient::dehydrate`]).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::trace;

use crate::BoxError;

/// Fetches the value of a query on a cache miss.
pub type QueryFetcher = BoxFuture<'static, Result<Value, BoxError>>;

/// A keyed query cache.
pub trait QueryClient: Send + Sync {
    /// Cached data for `key`, if any.
    fn get_query_data(&self, key: &str) -> Option<Value>;

    /// Store `data` under `key`, replacing what was there.
    fn set_query_data(&self, key: &str, data: Value);

    /// Cached data for `key`, running `fetcher` and caching its value on a miss.
    /// Failed fetches are not cached.
    fn fetch_query(&self, key: &str, fetcher: QueryFetcher)
    -> BoxFuture<'static, Result<Value, BoxError>>;
}

/// In-process [`QueryClient`] backed by a hash map.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueryClient {
    entries: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryQueryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl QueryClient for MemoryQueryClient {
    fn get_query_data(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    fn set_query_data(&self, key: &str, data: Value) {
        self.entries.lock().insert(key.to_owned(), data);
    }

    fn fetch_query(
        &self,
        key: &str,
        fetcher: QueryFetcher,
    ) -> BoxFuture<'static, Result<Value, BoxError>> {
        let entries = Arc::clone(&self.entries);
        let key = key.to_owned();
        Box::pin(async move {
            let cached = entries.lock().get(&key).cloned();
            if let Some(hit) = cached {
                trace!(%key, "query cache hit");
                return Ok(hit);
            }
            let value = fetcher.await?;
            entries.lock().insert(key, value.clone());
            Ok(value)
        })
    }
}

/// Records the queries a request's loaders read or wrote, forwarding every
/// call to the wrapped client.
#[derive(Clone)]
pub struct TrackedQueryClient {
    inner: Arc<dyn QueryClient>,
    touched: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl Default for TrackedQueryClient {
    fn default() -> Self {
        Self::new(Arc::new(MemoryQueryClient::new()))
    }
}

impl fmt::Debug for TrackedQueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedQueryClient")
            .field("touched", &self.touched.lock().len())
            .finish_non_exhaustive()
    }
}

impl TrackedQueryClient {
    pub fn new(inner: Arc<dyn QueryClient>) -> Self {
        Self {
            inner,
            touched: Arc::default(),
        }
    }

    /// [`fetch_query`](QueryClient::fetch_query) taking a closure.
    ///
    /// # Examples
    ///
    /// ```
    /// use routeweave::cache::TrackedQueryClient;
    /// use serde_json::json;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), routeweave::BoxError> {
    /// let client = TrackedQueryClient::default();
    /// let user = client.fetch("user:1", || async { Ok(json!({ "name": "Ada" })) }).await?;
    /// assert_eq!(user["name"], "Ada");
    /// assert_eq!(client.dehydrate(), json!({ "user:1": { "name": "Ada" } }));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn fetch<F, Fut>(&self, key: &str, fetcher: F) -> Result<Value, BoxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.fetch_query(key, Box::pin(fetcher())).await
    }

    /// Keys and data of every query touched so far.
    pub fn dehydrate(&self) -> Value {
        let touched = self.touched.lock();
        Value::Object(
            touched
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        )
    }

    pub fn touched_keys(&self) -> Vec<String> {
        self.touched.lock().keys().cloned().collect()
    }

    fn record(&self, key: &str, data: &Value) {
        self.touched.lock().insert(key.to_owned(), data.clone());
    }
}

impl QueryClient for TrackedQueryClient {
    fn get_query_data(&self, key: &str) -> Option<Value> {
        let data = self.inner.get_query_data(key);
        if let Some(data) = &data {
            self.record(key, data);
        }
        data
    }

    fn set_query_data(&self, key: &str, data: Value) {
        self.record(key, &data);
        self.inner.set_query_data(key, data);
    }

    fn fetch_query(
        &self,
        key: &str,
        fetcher: QueryFetcher,
    ) -> BoxFuture<'static, Result<Value, BoxError>> {
        let fetched = self.inner.fetch_query(key, fetcher);
        let tracker = self.clone();
        let key = key.to_owned();
        Box::pin(async move {
            let value = fetched.await?;
            tracker.record(&key, &value);
            Ok(value)
        })
    }
}
