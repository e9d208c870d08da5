//! The single public entry point: wires planner output, collaborators, and the pipeline stages
//! together into one paginated [`Stream`] of [`FeedResponse`]s (`spec.md` §6).

use std::{collections::HashMap, pin::Pin, sync::Arc};

use async_stream::try_stream;
use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::instrument;

use crate::{
    query::{
        base::{BaseExecutionContext, OrderByBase, ParallelBase},
        continuation::CompositeContinuation,
        pipeline::PipelineFactory,
        producer::{DocumentProducer, Sorting},
        FeedOptions, FeedResponse, PartitionKeyRange, Query, QueryPlan, QueryRange,
        QueryResultShape, RequestExecutor, RetryPolicyFactory, RoutingMapProvider,
    },
    ErrorKind,
};

/// Degree-of-parallelism `-1` ("auto") resolves to this many logical partitions per CPU, matching
/// the teacher's cross-partition client default.
const AUTO_PARALLELISM_FACTOR: usize = 2;

fn result_shape(plan: &QueryPlan) -> QueryResultShape {
    if !plan.query_info.order_by_directions.is_empty() {
        QueryResultShape::OrderBy
    } else if !plan.query_info.aggregates.is_empty() && plan.query_info.has_select_value {
        QueryResultShape::ValueAggregate
    } else {
        QueryResultShape::RawPayload
    }
}

fn query_ranges_as_pairs(plan: &QueryPlan) -> Vec<(String, String)> {
    plan.query_ranges
        .iter()
        .map(|r| (r.min.clone(), r.max.clone()))
        .collect()
}

/// Narrows `ranges` (the coarse superset a [`RoutingMapProvider`] hands back for the `(min, max)`
/// pairs alone) down to those that actually overlap `query_ranges` once boundary inclusivity is
/// taken into account. A no-op when `query_ranges` is empty, meaning the plan restricts execution
/// to no sub-range of the keyspace and every resolved range is in play.
fn filter_overlapping_ranges(
    mut ranges: Vec<PartitionKeyRange>,
    query_ranges: &[QueryRange],
) -> Vec<PartitionKeyRange> {
    if query_ranges.is_empty() {
        return ranges;
    }

    ranges.retain(|pkrange| {
        query_ranges.iter().any(|query_range| {
            ranges_overlap(
                &pkrange.min_inclusive,
                &pkrange.max_exclusive,
                true,
                false,
                &query_range.min,
                &query_range.max,
                query_range.is_min_inclusive,
                query_range.is_max_inclusive,
            )
        })
    });
    ranges
}

/// Reports whether `[range1_min, range1_max]` and `[range2_min, range2_max]` overlap, honoring
/// each range's own endpoint inclusivity. Partition key ranges are always min-inclusive,
/// max-exclusive; query ranges carry their own inclusivity from the filter they were derived from
/// (e.g. `c.pk > X` yields a min-exclusive range), so a shared boundary point only counts as
/// overlap when both sides include it.
#[allow(clippy::too_many_arguments)]
fn ranges_overlap(
    range1_min: &str,
    range1_max: &str,
    range1_min_inclusive: bool,
    range1_max_inclusive: bool,
    range2_min: &str,
    range2_max: &str,
    range2_min_inclusive: bool,
    range2_max_inclusive: bool,
) -> bool {
    let no_overlap = if range1_max < range2_min {
        true
    } else if range1_max == range2_min {
        !(range1_max_inclusive && range2_min_inclusive)
    } else if range2_max < range1_min {
        true
    } else if range2_max == range1_min {
        !(range2_max_inclusive && range1_min_inclusive)
    } else {
        false
    };

    !no_overlap
}

/// Builds one [`DocumentProducer`] per resolved partition key range, seeded with whatever resume
/// state the continuation token (if any) carries for that range. Ranges the token marks `done`
/// are dropped entirely; there is nothing left for them to contribute.
#[allow(clippy::too_many_arguments)]
fn build_producers(
    ranges: Vec<PartitionKeyRange>,
    continuation: Option<&CompositeContinuation>,
    sorting: Option<&Sorting>,
    query: &Query,
    shape: QueryResultShape,
    max_item_count: Option<u32>,
    max_buffered_item_count: usize,
    executor: &Arc<dyn RequestExecutor>,
    retry_policy_factory: &Arc<dyn RetryPolicyFactory>,
    buffer_budget: &Arc<Semaphore>,
) -> crate::Result<Vec<DocumentProducer>> {
    let resume_points = match continuation {
        Some(token) => Some(token.resolve(&ranges)?),
        None => None,
    };

    let mut producers = Vec::with_capacity(ranges.len());
    match resume_points {
        Some(resume_points) => {
            for (range, resume) in resume_points {
                if resume.done {
                    continue;
                }
                let mut producer = DocumentProducer::new(
                    range,
                    query.clone(),
                    shape,
                    max_item_count,
                    max_buffered_item_count,
                    resume.token,
                    executor.clone(),
                    retry_policy_factory.as_ref(),
                    buffer_budget.clone(),
                );
                if let Some(sorting) = sorting {
                    if !resume.order_by_items.is_empty() {
                        let last_seen = resume
                            .order_by_items
                            .into_iter()
                            .map(crate::query::QueryClauseItem::from_value)
                            .collect();
                        producer = producer.with_resume_filter(sorting.clone(), last_seen);
                    }
                } else {
                    producer = producer.with_skip(resume.skip_items);
                }
                producers.push(producer);
            }
        }
        None => {
            for range in ranges {
                producers.push(DocumentProducer::new(
                    range,
                    query.clone(),
                    shape,
                    max_item_count,
                    max_buffered_item_count,
                    None,
                    executor.clone(),
                    retry_policy_factory.as_ref(),
                    buffer_budget.clone(),
                ));
            }
        }
    }
    Ok(producers)
}

/// Executes a cross-partition query, returning one page of results at a time.
///
/// `plan` is the planner collaborator's output (`spec.md` §4.1). The three collaborator `Arc`s
/// are supplied by the caller, which owns transport, authentication, and the routing map cache;
/// none of that is this pipeline's concern.
#[instrument(skip_all, fields(cross_partition = plan.query_info.requires_cross_partition))]
pub fn execute_query<T>(
    plan: QueryPlan,
    query: Query,
    options: FeedOptions,
    routing_provider: Arc<dyn RoutingMapProvider>,
    executor: Arc<dyn RequestExecutor>,
    retry_policy_factory: Arc<dyn RetryPolicyFactory>,
) -> Pin<Box<dyn Stream<Item = crate::Result<FeedResponse<T>>> + Send>>
where
    T: DeserializeOwned + Send + 'static,
{
    Box::pin(try_stream! {
        if plan.query_info.requires_cross_partition && !options.enable_cross_partition_query {
            Err(ErrorKind::BadRequest.with_message(
                "query requires visiting more than one partition, but cross-partition execution is not enabled",
            ))?;
        }

        let continuation = match &options.request_continuation {
            Some(token) => Some(CompositeContinuation::decode(token)?),
            None => None,
        };

        let shape = result_shape(&plan);
        let query_ranges = query_ranges_as_pairs(&plan);
        let ranges = routing_provider.get_overlapping_ranges(&query_ranges).await?;
        let ranges = filter_overlapping_ranges(ranges, &plan.query_ranges);

        let buffer_budget = Arc::new(Semaphore::new(options.max_buffered_item_count.max(1)));

        let sorting = if shape == QueryResultShape::OrderBy {
            Some(Sorting::new(plan.query_info.order_by_directions.clone()))
        } else {
            None
        };

        let producers = build_producers(
            ranges,
            continuation.as_ref(),
            sorting.as_ref(),
            &query,
            shape,
            options.max_item_count,
            options.max_buffered_item_count.max(1),
            &executor,
            &retry_policy_factory,
            &buffer_budget,
        )?;

        let outer_resume = continuation.as_ref().and_then(|c| c.outer());

        let parallelism = resolve_degree_of_parallelism(
            options.max_degree_of_parallelism,
            producers.len(),
        );

        let base: Box<dyn BaseExecutionContext> = match sorting {
            Some(sorting) => Box::new(OrderByBase::new(
                producers,
                sorting,
                routing_provider.clone(),
                executor.clone(),
                retry_policy_factory.clone(),
                buffer_budget.clone(),
                parallelism,
            )),
            None => Box::new(ParallelBase::new(
                producers,
                routing_provider.clone(),
                executor.clone(),
                retry_policy_factory.clone(),
                buffer_budget.clone(),
                parallelism,
            )),
        };

        let mut pipeline = PipelineFactory::build(&plan.query_info, base, outer_resume)?;

        let page_size = options.max_item_count.map(|n| n as usize).unwrap_or(100);

        loop {
            let mut items: Vec<T> = Vec::new();

            while items.len() < page_size {
                match pipeline.next().await? {
                    Some(item) => {
                        let payload = item.payload.as_ref().ok_or_else(|| {
                            ErrorKind::InternalError
                                .with_message("final pipeline stage produced an item with no payload")
                        })?;
                        let decoded: T = serde_json::from_str(payload.get())
                            .map_err(|e| ErrorKind::DeserializationError.with_source(e))?;
                        items.push(decoded);
                    }
                    None => break,
                }
            }

            let request_charge = pipeline.take_request_charge();
            let query_metrics: HashMap<String, String> = pipeline.take_query_metrics();
            let activity_id = pipeline.activity_id().unwrap_or_else(uuid::Uuid::nil);
            let token = pipeline.continuation();
            let continuation_token = if token.is_empty() { None } else { Some(token.encode()?) };

            let done = items.is_empty();
            if done && continuation_token.is_none() {
                break;
            }

            yield FeedResponse {
                items,
                continuation_token,
                request_charge,
                query_metrics,
                activity_id,
            };

            if done {
                break;
            }
        }
    })
}

/// Resolves `-1` ("auto") against `min(producer_count, logical_cores * 2)`; `0`/`1` mean serial
/// round-robin; anything else is the caller's explicit cap (`spec.md` §5).
fn resolve_degree_of_parallelism(requested: i32, producer_count: usize) -> usize {
    if requested < 0 {
        let auto = std::thread::available_parallelism()
            .map(|n| n.get() * AUTO_PARALLELISM_FACTOR)
            .unwrap_or(AUTO_PARALLELISM_FACTOR);
        auto.min(producer_count.max(1))
    } else {
        requested.max(1) as usize
    }
}
