//! Data producers and the topic → producer catalog.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use streamhub_core::FetchError;

/// Source of payloads for one topic.
///
/// `Ok(None)` means "nothing new"; the tick is skipped without a broadcast.
/// Errors are logged by the handler and the fetch is retried on the next tick.
#[async_trait]
pub trait DataProducer: Send + Sync {
    /// Fetch the current payload.
    async fn fetch(&self) -> Result<Option<Value>, FetchError>;
}

/// [`DataProducer`] backed by an async closure.
pub struct FnProducer<F> {
    f: F,
}

impl<F> FnProducer<F> {
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> DataProducer for FnProducer<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Value>, FetchError>> + Send,
{
    async fn fetch(&self) -> Result<Option<Value>, FetchError> {
        (self.f)().await
    }
}

/// Box an async closure as a shared producer.
pub fn producer_fn<F, Fut>(f: F) -> Arc<dyn DataProducer>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, FetchError>> + Send + 'static,
{
    Arc::new(FnProducer::new(f))
}

/// Producers available to clients, by topic.
#[derive(Clone, Default)]
pub struct ProducerCatalog {
    producers: HashMap<String, Arc<dyn DataProducer>>,
}

impl ProducerCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `producer` for `topic`, replacing any previous one.
    pub fn register(
        &mut self,
        topic: impl Into<String>,
        producer: Arc<dyn DataProducer>,
    ) -> Option<Arc<dyn DataProducer>> {
        self.producers.insert(topic.into(), producer)
    }

    /// Builder form of [`Self::register`].
    #[must_use]
    pub fn with(mut self, topic: impl Into<String>, producer: Arc<dyn DataProducer>) -> Self {
        let _ = self.register(topic, producer);
        self
    }

    /// Producer for `topic`.
    pub fn get(&self, topic: &str) -> Option<Arc<dyn DataProducer>> {
        self.producers.get(topic).cloned()
    }

    /// Whether `topic` has a producer.
    pub fn contains(&self, topic: &str) -> bool {
        self.producers.contains_key(topic)
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.producers.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of registered producers.
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    /// Whether no producer is registered.
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

impl std::fmt::Debug for ProducerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerCatalog")
            .field("topics", &self.topics())
            .finish()
    }
}
