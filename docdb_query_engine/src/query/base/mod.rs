use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::query::{continuation::CompositeContinuation, QueryResult};

mod order_by;
mod parallel;

pub use order_by::OrderByBase;
pub use parallel::ParallelBase;

/// The common surface of the pipeline's two base execution strategies (`spec.md` §4.2: the
/// innermost stage of every pipeline).
///
/// Both strategies own a set of [`super::producer::DocumentProducer`]s and merge their output
/// into a single logical stream of [`QueryResult`]s; they differ only in merge strategy
/// ([`ParallelBase`] drains producers range-by-range, [`OrderByBase`] k-way-merges them).
#[async_trait]
pub trait BaseExecutionContext: Send {
    /// Returns the next merged item, or `None` once every producer is exhausted.
    async fn next(&mut self) -> crate::Result<Option<QueryResult>>;

    /// A continuation token snapshot reflecting everything consumed by `next` so far.
    fn continuation(&self) -> CompositeContinuation;

    /// Returns and resets the request charge accumulated since the last call.
    fn take_request_charge(&mut self) -> f64;

    /// Returns and resets the per-partition-key-range-id query metrics accumulated since the
    /// last call.
    fn take_query_metrics(&mut self) -> HashMap<String, String>;

    /// The activity id of the most recent backend response, if any producer has completed a
    /// request yet.
    fn activity_id(&self) -> Option<Uuid>;
}

/// Blanket delegation so a pipeline stage holding `Box<dyn BaseExecutionContext>` doesn't need to
/// re-implement pass-through for methods it doesn't change.
#[async_trait]
impl BaseExecutionContext for Box<dyn BaseExecutionContext> {
    async fn next(&mut self) -> crate::Result<Option<QueryResult>> {
        (**self).next().await
    }

    fn continuation(&self) -> CompositeContinuation {
        (**self).continuation()
    }

    fn take_request_charge(&mut self) -> f64 {
        (**self).take_request_charge()
    }

    fn take_query_metrics(&mut self) -> HashMap<String, String> {
        (**self).take_query_metrics()
    }

    fn activity_id(&self) -> Option<Uuid> {
        (**self).activity_id()
    }
}
