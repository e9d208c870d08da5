use async_trait::async_trait;
use std::time::Duration;

use crate::query::{PartitionKeyRange, ProducerPage, QueryResultShape};

/// Resolves the partition key ranges that currently own a piece of the keyspace.
///
/// Implemented outside this crate by whatever owns the client's routing map cache; this pipeline
/// only consumes it, never refreshes the cache itself beyond asking for a re-resolution when a
/// [`crate::ErrorKind::PartitionGone`] is observed (`spec.md` §6).
#[async_trait]
pub trait RoutingMapProvider: Send + Sync {
    /// Returns the partition key ranges that currently overlap `query_ranges`, in `min_inclusive`
    /// order. An empty `query_ranges` means "the whole keyspace".
    async fn get_overlapping_ranges(
        &self,
        query_ranges: &[(String, String)],
    ) -> crate::Result<Vec<PartitionKeyRange>>;

    /// Returns the one or more ranges that replaced `range`, after observing that it is gone.
    ///
    /// Returns a single range, unchanged, if `range` turns out to still be current (a stale
    /// [`crate::ErrorKind::PartitionGone`] raced with an routing map refresh already in flight).
    async fn resolve_split(&self, range: &PartitionKeyRange) -> crate::Result<Vec<PartitionKeyRange>>;
}

/// A single request for one page of results from one partition key range.
#[derive(Clone, Debug)]
pub struct PartitionRequest<'a> {
    pub pkrange: &'a PartitionKeyRange,
    pub query_text: &'a str,
    pub parameters: Option<&'a serde_json::value::RawValue>,
    pub continuation: Option<&'a str>,
    pub max_item_count: Option<u32>,
    pub result_shape: QueryResultShape,
}

/// Executes a single partition's query request against the backend and returns one page.
///
/// Implemented outside this crate: owns transport, authentication, and wire (de)serialization,
/// none of which are this pipeline's concern (`spec.md` §1 Non-goals).
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, request: PartitionRequest<'_>) -> crate::Result<ProducerPage>;
}

/// Decides whether and how long to wait before retrying a failed partition request.
///
/// One [`RetryPolicy`] instance is created per logical request (so it can track how many times
/// that specific request has already been retried); the factory is the per-query entry point.
#[async_trait]
pub trait RetryPolicyFactory: Send + Sync {
    fn new_policy(&self) -> Box<dyn RetryPolicy>;
}

#[async_trait]
pub trait RetryPolicy: Send {
    /// Returns `Some(delay)` if `error` should be retried after waiting `delay`, or `None` if the
    /// policy's budget for this request is exhausted and the error should propagate.
    ///
    /// Only ever consulted for errors where [`crate::Error::is_retryable`] is true; `PartitionGone`
    /// and non-retryable 4xx errors never reach this method.
    async fn should_retry(&mut self, error: &crate::Error) -> Option<Duration>;
}
