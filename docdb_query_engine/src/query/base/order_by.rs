// k-way merge base execution context for `ORDER BY` queries: maintains a max-heap of producers
// keyed by their front item's order-by key tuple (inverted per `Sorting::compare`'s contract), so
// popping the heap always yields the producer whose front item sorts earliest in the user's
// requested order (`spec.md` §4.5).

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::query::{
    base::BaseExecutionContext,
    collaborators::{RequestExecutor, RetryPolicyFactory},
    continuation::CompositeContinuation,
    producer::{self, DocumentProducer, ProducerState, Sorting},
    QueryResult, RoutingMapProvider,
};

/// A heap entry: the index of the producer whose front item this key tuple belongs to. The actual
/// comparison is delegated back to `sorting`, which every entry shares, so the heap never needs
/// its own notion of ordering beyond what the query's `ORDER BY` clause dictates.
struct HeapEntry {
    producer_index: usize,
    sorting: Sorting,
    key: Vec<crate::query::QueryClauseItem>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sorting
            .compare(Some(&self.key), Some(&other.key))
            .unwrap_or(Ordering::Equal)
    }
}

pub struct OrderByBase {
    producers: Vec<DocumentProducer>,
    sorting: Sorting,
    routing_provider: Arc<dyn RoutingMapProvider>,
    executor: Arc<dyn RequestExecutor>,
    retry_policy_factory: Arc<dyn RetryPolicyFactory>,
    buffer_budget: Arc<Semaphore>,
    parallelism: usize,
    last_activity_id: Option<Uuid>,
}

impl OrderByBase {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        producers: Vec<DocumentProducer>,
        sorting: Sorting,
        routing_provider: Arc<dyn RoutingMapProvider>,
        executor: Arc<dyn RequestExecutor>,
        retry_policy_factory: Arc<dyn RetryPolicyFactory>,
        buffer_budget: Arc<Semaphore>,
        parallelism: usize,
    ) -> Self {
        Self {
            producers,
            sorting,
            routing_provider,
            executor,
            retry_policy_factory,
            buffer_budget,
            parallelism: parallelism.max(1),
            last_activity_id: None,
        }
    }

    /// Fetches a fresh page for every producer sitting `Idle`, up to `parallelism` fetches in
    /// flight at once (`spec.md` §5), then replaces any that came back `Split` with their
    /// children.
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
        Ok(())
    }

    /// Builds the heap over every producer's current front item, refetching any producer that is
    /// still `Idle` so its true front key (rather than a placeholder "empty" key) takes part in
    /// the comparison.
    async fn rebuild_heap(&mut self) -> crate::Result<BinaryHeap<HeapEntry>> {
        // Keep fetching until every producer either has data buffered or is exhausted, since an
        // `Idle` producer's real front key is unknown and `Sorting::compare` would otherwise treat
        // it as "ahead of everything" only provisionally.
        loop {
            self.fill_all().await?;
            if self
                .producers
                .iter()
                .all(|p| p.state() != ProducerState::Idle)
            {
                break;
            }
        }

        let mut heap = BinaryHeap::with_capacity(self.producers.len());
        for (idx, producer) in self.producers.iter().enumerate() {
            if let Some(activity_id) = producer.activity_id() {
                self.last_activity_id = Some(activity_id);
            }
            if let Some(item) = producer.peek() {
                heap.push(HeapEntry {
                    producer_index: idx,
                    sorting: self.sorting.clone(),
                    key: item.order_by_items.clone(),
                });
            }
        }
        Ok(heap)
    }
}

#[async_trait]
impl BaseExecutionContext for OrderByBase {
    async fn next(&mut self) -> crate::Result<Option<QueryResult>> {
        let heap = self.rebuild_heap().await?;
        let Some(winner) = heap.into_iter().max() else {
            return Ok(None);
        };

        let item = self.producers[winner.producer_index].pop();
        self.producers[winner.producer_index].set_last_emitted_order_by(winner.key);
        if self.producers[winner.producer_index].is_done() {
            self.producers.remove(winner.producer_index);
        }
        Ok(item)
    }

    fn continuation(&self) -> CompositeContinuation {
        let mut token = CompositeContinuation::new();
        for producer in &self.producers {
            // Recorded from the last item THIS producer actually handed upstream, not whatever
            // sits at the front of its buffer now: a page boundary can land mid-buffer, and the
            // resume filter built from it is what lets a replayed page skip only the items
            // already emitted (`spec.md` §4.5).
            let last_order_by_items = producer
                .last_emitted_order_by()
                .map(|items| {
                    items
                        .iter()
                        .map(|clause| clause.item.clone().unwrap_or(serde_json::Value::Null))
                        .collect()
                })
                .unwrap_or_default();
            // `resume_point` yields the continuation active before the page still sitting in the
            // producer's buffer was fetched, so a resumed fetch re-reads that page rather than
            // skipping past whatever of it is still unconsumed; the resume filter built from
            // `last_order_by_items` above is what then discards the already-emitted prefix.
            let (token_value, _) = producer.resume_point();
            token.set(
                producer.pkrange(),
                token_value.map(str::to_string),
                producer.is_done(),
                last_order_by_items,
                None,
                0,
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
