use std::{cmp::Ordering, collections::HashMap};

use serde::Deserialize;
use uuid::Uuid;

mod aggregators;
pub mod base;
mod collaborators;
mod continuation;
mod engine;
pub mod pipeline;
mod plan;
mod producer;
mod query_result;

pub use collaborators::{PartitionRequest, RequestExecutor, RetryPolicy, RetryPolicyFactory, RoutingMapProvider};
pub use continuation::CompositeContinuation;
pub use engine::execute_query;
pub use plan::{DistinctType, QueryInfo, QueryPlan, QueryRange, SortOrder};
pub use query_result::{QueryClauseItem, QueryResult, QueryResultShape};

/// A half-open key interval `[min_inclusive, max_exclusive)` owned by one physical partition.
///
/// Ranges are ordered by `min_inclusive`, which is the tie-break order the pipeline uses
/// whenever it needs a deterministic, range-based visitation order (see [`base::parallel`]).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyRange {
    pub id: String,
    pub min_inclusive: String,
    pub max_exclusive: String,
    /// IDs of the ranges this range split from. Empty for a range that has never been split.
    #[serde(default)]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(
        id: impl Into<String>,
        min_inclusive: impl Into<String>,
        max_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
            parents: Vec::new(),
        }
    }

    pub fn with_parents(mut self, parents: impl IntoIterator<Item = String>) -> Self {
        self.parents = parents.into_iter().collect();
        self
    }
}

impl PartialOrd for PartitionKeyRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PartitionKeyRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.min_inclusive.cmp(&other.min_inclusive)
    }
}

/// A query, as supplied by the caller, paired with its pre-encoded parameters.
#[derive(Clone, Debug)]
pub struct Query {
    /// The text of the query. If the [`QueryPlan`] rewrote the query, [`execute_query`] uses
    /// the rewritten text instead; this field holds what the caller originally wrote.
    pub text: String,

    /// The parameters of the query, pre-encoded as a JSON object suitable to being the `parameters`
    /// field of a partition-scoped query request.
    pub encoded_parameters: Option<Box<serde_json::value::RawValue>>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            encoded_parameters: None,
        }
    }
}

/// User-supplied options for one query execution. Immutable for the lifetime of the query.
#[derive(Clone, Debug)]
pub struct FeedOptions {
    /// The requested page size. `None` means the backend's default.
    pub max_item_count: Option<u32>,

    /// An opaque continuation token from a prior page of this same query, if resuming.
    pub request_continuation: Option<String>,

    /// Bounds the number of partitions allowed to have a concurrently outstanding fetch.
    ///
    /// `-1` means "auto": `min(partition_count, logical_cores * 2)`. `0` or `1` means serial
    /// round-robin, one fetch outstanding at a time.
    pub max_degree_of_parallelism: i32,

    /// The total number of buffered items, across all partitions, this query execution may hold
    /// before producers suspend pre-fetching.
    pub max_buffered_item_count: usize,

    /// Whether the caller allows a query that requires visiting more than one partition.
    pub enable_cross_partition_query: bool,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            max_item_count: None,
            request_continuation: None,
            max_degree_of_parallelism: -1,
            max_buffered_item_count: 10_000,
            enable_cross_partition_query: false,
        }
    }
}

/// One page of raw results from a single partition, as returned by a [`RequestExecutor`].
#[derive(Clone, Debug, Default)]
pub struct ProducerPage {
    pub items: Vec<QueryResult>,
    pub continuation_token: Option<String>,
    pub request_charge: f64,
    pub activity_id: Option<Uuid>,
    /// Opaque, backend-reported per-partition query metrics, if the backend returns any.
    pub query_metrics: Option<String>,
}

/// One page of results surfaced to the caller of [`execute_query`], after the pipeline has
/// merged, ordered, aggregated, and/or paginated the underlying per-partition pages.
#[derive(Clone, Debug)]
pub struct FeedResponse<T> {
    pub items: Vec<T>,
    pub continuation_token: Option<String>,
    pub request_charge: f64,
    /// Per-partition-key-range-id query metrics, merged from every producer that contributed
    /// to this page.
    pub query_metrics: HashMap<String, String>,
    pub activity_id: Uuid,
}

impl<T> FeedResponse<T> {
    pub fn map_items<U>(self, f: impl FnMut(T) -> U) -> FeedResponse<U> {
        FeedResponse {
            items: self.items.into_iter().map(f).collect(),
            continuation_token: self.continuation_token,
            request_charge: self.request_charge,
            query_metrics: self.query_metrics,
            activity_id: self.activity_id,
        }
    }
}
