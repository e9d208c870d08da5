use std::{collections::VecDeque, sync::Arc};

use tokio::sync::Semaphore;
use tracing::{instrument, trace};

use crate::{
    query::{
        collaborators::{PartitionRequest, RequestExecutor, RetryPolicy, RetryPolicyFactory},
        PartitionKeyRange, Query, QueryClauseItem, QueryResult, QueryResultShape,
    },
    ErrorKind,
};

mod sorting;
mod state;

pub use sorting::Sorting;
pub use state::ProducerState;

/// Worst-case number of items a fetch might buffer when the caller hasn't capped `max_item_count`,
/// used only to size the up-front buffer-budget reservation in [`DocumentProducer::fill`]; matches
/// `engine.rs`'s own default page size for an uncapped query.
const DEFAULT_PAGE_RESERVATION: usize = 100;

/// A one-shot filter applied to the first page fetched after resuming from a continuation token:
/// drops any buffered item that does not sort strictly after the last key the caller already saw
/// (`spec.md` §4.5), since a partially-consumed page can otherwise resurface already-emitted items.
#[derive(Clone)]
struct ResumeFilter {
    sorting: Sorting,
    last_seen: Vec<QueryClauseItem>,
}

/// Drives one partition key range's paginated fetch loop and buffers the pages it gets back.
///
/// Owns exactly one [`PartitionKeyRange`] for its lifetime; if the backend reports the range is
/// gone ([`crate::ErrorKind::PartitionGone`]), [`DocumentProducer::fill`] transitions to
/// [`ProducerState::Split`] and the caller — a base execution context — is responsible for
/// discarding this producer and creating one replacement producer per child range (`spec.md` §4.3).
pub struct DocumentProducer {
    pkrange: PartitionKeyRange,
    query: Query,
    result_shape: QueryResultShape,
    max_item_count: Option<u32>,
    max_buffered_item_count: usize,
    continuation: Option<String>,
    /// The continuation token that was active (i.e. sent on the request) immediately before the
    /// page currently sitting in `buffer` was fetched. `None` means that page was this producer's
    /// very first fetch. Distinct from `continuation`, which is already the *next* page's token
    /// the instant a fetch completes — see [`DocumentProducer::resume_point`].
    origin_continuation: Option<String>,
    /// How many items have been popped from the page currently occupying `buffer`. Reset to zero
    /// every time a new page is fetched.
    consumed_from_current_page: u64,
    buffer: VecDeque<QueryResult>,
    state: ProducerState,
    request_charge: f64,
    activity_id: Option<uuid::Uuid>,
    query_metrics: Option<String>,
    executor: Arc<dyn RequestExecutor>,
    retry_policy: Box<dyn RetryPolicy>,
    buffer_budget: Arc<Semaphore>,
    resume_filter: Option<ResumeFilter>,
    /// A one-shot positional skip applied to the first page fetched after resuming from a
    /// continuation token, for base execution contexts (`Parallel`) that have no order-by key to
    /// filter resumed items by: drops the first `n` items of that page, which were already
    /// emitted to the caller in the run that minted the token (`spec.md` I5/P4).
    pending_skip: Option<u64>,
    /// The order-by key tuple of the last item this producer handed to its base execution
    /// context, if any. Recorded by [`crate::query::base::OrderByBase`] so a continuation token
    /// minted mid-page can tell a resumed producer's resume filter where to pick back up, even
    /// though the producer's own buffer (and whatever it hadn't yet emitted) does not survive
    /// the resume (`spec.md` §4.5).
    last_emitted_order_by: Option<Vec<QueryClauseItem>>,
}

impl DocumentProducer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pkrange: PartitionKeyRange,
        query: Query,
        result_shape: QueryResultShape,
        max_item_count: Option<u32>,
        max_buffered_item_count: usize,
        initial_continuation: Option<String>,
        executor: Arc<dyn RequestExecutor>,
        retry_policy_factory: &dyn RetryPolicyFactory,
        buffer_budget: Arc<Semaphore>,
    ) -> Self {
        Self {
            pkrange,
            query,
            result_shape,
            max_item_count,
            max_buffered_item_count,
            continuation: initial_continuation,
            origin_continuation: None,
            consumed_from_current_page: 0,
            buffer: VecDeque::new(),
            state: ProducerState::Idle,
            request_charge: 0.0,
            activity_id: None,
            query_metrics: None,
            executor,
            retry_policy: retry_policy_factory.new_policy(),
            buffer_budget,
            resume_filter: None,
            pending_skip: None,
            last_emitted_order_by: None,
        }
    }

    /// Arranges for the first page fetched by this producer to drop any item that does not sort
    /// strictly after `last_seen` under `sorting` (`spec.md` §4.5 resume filter).
    pub fn with_resume_filter(mut self, sorting: Sorting, last_seen: Vec<QueryClauseItem>) -> Self {
        if !last_seen.is_empty() {
            self.resume_filter = Some(ResumeFilter { sorting, last_seen });
        }
        self
    }

    /// Arranges for the first page fetched by this producer to drop its first `n` items, which a
    /// prior run already emitted before the continuation token was minted (used by [`crate::query::base::ParallelBase`],
    /// which has no order-by key to filter resumed items by).
    pub fn with_skip(mut self, n: u64) -> Self {
        if n > 0 {
            self.pending_skip = Some(n);
        }
        self
    }

    pub fn pkrange(&self) -> &PartitionKeyRange {
        &self.pkrange
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn peek(&self) -> Option<&QueryResult> {
        self.buffer.front()
    }

    pub fn last_emitted_order_by(&self) -> Option<&[QueryClauseItem]> {
        self.last_emitted_order_by.as_deref()
    }

    pub fn set_last_emitted_order_by(&mut self, key: Vec<QueryClauseItem>) {
        self.last_emitted_order_by = Some(key);
    }

    /// The continuation token and positional skip count a caller should resume this producer
    /// from: if the buffer is fully drained, that's just the producer's own next-fetch
    /// continuation with nothing to skip; if items remain buffered but unconsumed, it's the
    /// continuation that was used to fetch the *current* page plus how many of that page's items
    /// have already been handed to the caller, so a resumed producer can legitimately re-fetch
    /// the same page and skip past whatever was already emitted instead of silently losing it
    /// (`spec.md` I5/P4).
    pub fn resume_point(&self) -> (Option<&str>, u64) {
        if self.buffer.is_empty() {
            (self.continuation.as_deref(), 0)
        } else {
            (self.origin_continuation.as_deref(), self.consumed_from_current_page)
        }
    }

    pub fn take_request_charge(&mut self) -> f64 {
        std::mem::take(&mut self.request_charge)
    }

    pub fn activity_id(&self) -> Option<uuid::Uuid> {
        self.activity_id
    }

    pub fn take_query_metrics(&mut self) -> Option<String> {
        self.query_metrics.take()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ProducerState::Exhausted)
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn result_shape(&self) -> QueryResultShape {
        self.result_shape
    }

    pub fn max_item_count(&self) -> Option<u32> {
        self.max_item_count
    }

    /// Removes and returns the next buffered item, transitioning to `Idle` or `Exhausted` if the
    /// buffer is now empty, and returning its buffer-budget permit (spec.md I3/P5).
    pub fn pop(&mut self) -> Option<QueryResult> {
        let item = self.buffer.pop_front()?;
        self.buffer_budget.add_permits(1);
        self.consumed_from_current_page += 1;
        if self.buffer.is_empty() && self.state == ProducerState::HasData {
            self.state = if self.continuation.is_some() {
                ProducerState::Idle
            } else {
                ProducerState::Exhausted
            };
        }
        Some(item)
    }

    /// Fetches the next page if the buffer is empty and the producer is `Idle`. No-op otherwise.
    ///
    /// Retries retryable errors (`Throttled`, `TimedOut`) against the caller-supplied retry
    /// policy; any other error, or a retry policy that declines to retry, moves the producer to
    /// `Failed` and is returned to the caller. A `PartitionGone` error moves to `Split` instead of
    /// failing, since it is expected and recoverable by the base execution context.
    #[instrument(skip(self), fields(pkrange = %self.pkrange.id))]
    pub async fn fill(&mut self) -> crate::Result<()> {
        if !matches!(self.state, ProducerState::Idle) {
            return Ok(());
        }

        // Reserve this fetch's worst-case share of the buffer budget up front (capped by the
        // page size and by the query's total budget), then true the reservation up or down once
        // the actual item count is known, so what's held tracks buffered *items*, not just
        // in-flight fetches (spec.md I3/P5). Permits are only returned one at a time, as `pop()`
        // drains items out of the buffer, so a slow consumer genuinely keeps the budget occupied.
        let reserved = self
            .max_item_count
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_PAGE_RESERVATION)
            .max(1)
            .min(self.max_buffered_item_count.max(1));
        self.buffer_budget
            .acquire_many(reserved as u32)
            .await
            .map_err(|e| ErrorKind::Cancelled.with_source(e))?
            .forget();

        loop {
            let request = PartitionRequest {
                pkrange: &self.pkrange,
                query_text: &self.query.text,
                parameters: self.query.encoded_parameters.as_deref(),
                continuation: self.continuation.as_deref(),
                max_item_count: self.max_item_count,
                result_shape: self.result_shape,
            };

            match self.executor.execute(request).await {
                Ok(page) => {
                    trace!(items = page.items.len(), "fetched page");
                    self.request_charge += page.request_charge;
                    self.activity_id = page.activity_id.or(self.activity_id);
                    self.query_metrics = page.query_metrics.or_else(|| self.query_metrics.take());
                    self.origin_continuation = self.continuation.clone();
                    self.continuation = page.continuation_token;
                    self.consumed_from_current_page = 0;
                    self.buffer = page.items.into();
                    if let Some(filter) = self.resume_filter.take() {
                        let mut kept = VecDeque::with_capacity(self.buffer.len());
                        for item in self.buffer.drain(..) {
                            let ordering = filter
                                .sorting
                                .compare(Some(&item.order_by_items), Some(&filter.last_seen))?;
                            if ordering == std::cmp::Ordering::Less {
                                kept.push_back(item);
                            }
                        }
                        self.buffer = kept;
                    }
                    if let Some(skip) = self.pending_skip.take() {
                        for _ in 0..skip.min(self.buffer.len() as u64) {
                            self.buffer.pop_front();
                        }
                    }

                    let actual = self.buffer.len();
                    match actual.cmp(&reserved) {
                        std::cmp::Ordering::Less => self.buffer_budget.add_permits(reserved - actual),
                        std::cmp::Ordering::Greater => {
                            self.buffer_budget
                                .acquire_many((actual - reserved) as u32)
                                .await
                                .map_err(|e| ErrorKind::Cancelled.with_source(e))?
                                .forget();
                        }
                        std::cmp::Ordering::Equal => {}
                    }

                    self.state = if self.buffer.is_empty() {
                        if self.continuation.is_some() {
                            ProducerState::Idle
                        } else {
                            ProducerState::Exhausted
                        }
                    } else {
                        ProducerState::HasData
                    };
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::PartitionGone => {
                    self.buffer_budget.add_permits(reserved);
                    self.state = ProducerState::Split;
                    return Ok(());
                }
                Err(e) if e.is_retryable() => match self.retry_policy.should_retry(&e).await {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => {
                        self.buffer_budget.add_permits(reserved);
                        self.state = ProducerState::Failed;
                        return Err(e);
                    }
                },
                Err(e) => {
                    self.buffer_budget.add_permits(reserved);
                    self.state = ProducerState::Failed;
                    return Err(e);
                }
            }
        }
    }
}

/// Replaces a producer whose range was reported gone with one producer per child range, each
/// seeded with the parent's last continuation (`spec.md` §4.3 `onSplit`).
///
/// Called by a base execution context when it observes [`ProducerState::Split`] after a call to
/// [`DocumentProducer::fill`].
pub async fn resolve_split(
    producer: &DocumentProducer,
    routing_provider: &dyn crate::query::RoutingMapProvider,
    executor: Arc<dyn RequestExecutor>,
    retry_policy_factory: &dyn RetryPolicyFactory,
    buffer_budget: Arc<Semaphore>,
) -> crate::Result<Vec<DocumentProducer>> {
    let children = routing_provider.resolve_split(&producer.pkrange).await?;
    trace!(
        pkrange = %producer.pkrange.id,
        children = children.len(),
        "resolved split, replacing producer"
    );
    Ok(children
        .into_iter()
        .map(|child| {
            DocumentProducer::new(
                child,
                producer.query.clone(),
                producer.result_shape,
                producer.max_item_count,
                producer.max_buffered_item_count,
                producer.continuation.clone(),
                executor.clone(),
                retry_policy_factory,
                buffer_budget.clone(),
            )
        })
        .collect())
}
