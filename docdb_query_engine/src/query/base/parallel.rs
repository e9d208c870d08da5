// Round-robin base execution context for queries that don't require cross-partition ordering
// (no `ORDER BY`): drains whichever producer currently has buffered data, visiting producers in
// `rangeMin` order, so that output order is deterministic even though it carries no ordering
// guarantee relative to the user's query (`spec.md` §4.4).

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::query::{
    base::BaseExecutionContext,
    collaborators::{RequestExecutor, RetryPolicyFactory},
    continuation::CompositeContinuation,
    producer::{self, DocumentProducer, ProducerState},
    QueryResult, RoutingMapProvider,
};

pub struct ParallelBase {
    producers: Vec<DocumentProducer>,
    cursor: usize,
    routing_provider: Arc<dyn RoutingMapProvider>,
    executor: Arc<dyn RequestExecutor>,
    retry_policy_factory: Arc<dyn RetryPolicyFactory>,
    buffer_budget: Arc<Semaphore>,
    parallelism: usize,
    last_activity_id: Option<Uuid>,
}

impl ParallelBase {
    pub fn new(
        mut producers: Vec<DocumentProducer>,
        routing_provider: Arc<dyn RoutingMapProvider>,
        executor: Arc<dyn RequestExecutor>,
        retry_policy_factory: Arc<dyn RetryPolicyFactory>,
        buffer_budget: Arc<Semaphore>,
        parallelism: usize,
    ) -> Self {
        producers.sort_by(|a, b| a.pkrange().cmp(b.pkrange()));
        Self {
            producers,
            cursor: 0,
            routing_provider,
            executor,
            retry_policy_factory,
            buffer_budget,
            parallelism: parallelism.max(1),
            last_activity_id: None,
        }
    }

    /// Fetches a fresh page for every producer sitting `Idle`, up to `parallelism` fetches in
    /// flight at once, then replaces any that came back `Split` with their children, re-sorted
    /// into range order (`spec.md` §5).
    async fn fill_all(&mut self) -> crate::Result<()> {
        let parallelism = self.parallelism;
        let fetches = self
            .producers
            .iter_mut()
            .filter(|p| p.state() == ProducerState::Idle)
            .map(|p| p.fill());
        futures::stream::iter(fetches)
            .buffer_unordered(parallelism)
            .try_collect::<Vec<()>>()
            .await?;

        let split_indices: Vec<usize> = self
            .producers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state() == ProducerState::Split)
            .map(|(idx, _)| idx)
            .collect();

        for idx in split_indices.into_iter().rev() {
            let producer = self.producers.remove(idx);
            let children = producer::resolve_split(
                &producer,
                self.routing_provider.as_ref(),
                self.executor.clone(),
                self.retry_policy_factory.as_ref(),
                self.buffer_budget.clone(),
            )
            .await?;
            self.producers.splice(idx..idx, children);
        }

        if !self.producers.is_empty() {
            self.producers.sort_by(|a, b| a.pkrange().cmp(b.pkrange()));
            self.cursor %= self.producers.len();
        }
        Ok(())
    }
}

#[async_trait]
impl BaseExecutionContext for ParallelBase {
    async fn next(&mut self) -> crate::Result<Option<QueryResult>> {
        loop {
            self.fill_all().await?;

            if self.producers.is_empty() {
                return Ok(None);
            }

            let start = self.cursor;
            loop {
                if let Some(activity_id) = self.producers[self.cursor].activity_id() {
                    self.last_activity_id = Some(activity_id);
                }
                if self.producers[self.cursor].peek().is_some() {
                    let item = self.producers[self.cursor].pop();
                    self.cursor = (self.cursor + 1) % self.producers.len();
                    return Ok(item);
                }
                if self.producers[self.cursor].is_done() {
                    self.producers.remove(self.cursor);
                    if self.producers.is_empty() {
                        return Ok(None);
                    }
                    self.cursor %= self.producers.len();
                    break;
                }
                self.cursor = (self.cursor + 1) % self.producers.len();
                if self.cursor == start {
                    // Every remaining producer is `Idle` (needs another fetch) or `Failed`
                    // (would already have returned an error from `fill_all`); go fetch again.
                    break;
                }
            }
        }
    }

    fn continuation(&self) -> CompositeContinuation {
        let mut token = CompositeContinuation::new();
        for producer in &self.producers {
            // `Parallel` has no order-by key to filter resumed items by, so the positional skip
            // count from `resume_point` is what stands in for a resume filter here: it records
            // how many items from the head of the replayed page were already emitted.
            let (token_value, skip_items) = producer.resume_point();
            token.set(
                producer.pkrange(),
                token_value.map(str::to_string),
                producer.is_done(),
                Vec::new(),
                None,
                skip_items,
            );
        }
        token
    }

    fn take_request_charge(&mut self) -> f64 {
        self.producers.iter_mut().map(|p| p.take_request_charge()).sum()
    }

    fn take_query_metrics(&mut self) -> HashMap<String, String> {
        self.producers
            .iter_mut()
            .filter_map(|p| p.take_query_metrics().map(|metrics| (p.pkrange().id.clone(), metrics)))
            .collect()
    }

    fn activity_id(&self) -> Option<Uuid> {
        self.last_activity_id
    }
}
