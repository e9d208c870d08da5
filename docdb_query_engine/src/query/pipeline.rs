// Top/Skip/Distinct/Aggregate pipeline stages and the factory that composes them around a base
// execution context, in the fixed outer-to-inner order from `spec.md` §4.2.

use std::{
    collections::{hash_map::DefaultHasher, HashMap, HashSet},
    hash::{Hash, Hasher},
};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    query::{
        aggregators::Aggregator,
        base::BaseExecutionContext,
        continuation::{CompositeContinuation, OuterState},
        plan::{DistinctType, QueryInfo},
        QueryClauseItem, QueryResult,
    },
    ErrorKind,
};

/// Builds the `Top → Skip → Distinct → Aggregate → Base` stack a [`QueryInfo`] demands,
/// wrapping only the stages the plan actually requires (`spec.md` §4.2).
pub struct PipelineFactory;

impl PipelineFactory {
    pub fn build(
        info: &QueryInfo,
        base: Box<dyn BaseExecutionContext>,
        resume: Option<&OuterState>,
    ) -> crate::Result<Box<dyn BaseExecutionContext>> {
        if info.aggregates.len() > 1 {
            return Err(ErrorKind::PlanRejected
                .with_message("the pipeline supports at most one aggregate per query"));
        }
        if !info.group_by_expressions.is_empty() {
            return Err(ErrorKind::PlanRejected.with_message("GROUP BY is not supported"));
        }

        let mut stage = base;

        if let Some(name) = info.aggregates.first() {
            stage = Box::new(AggregateStage::new(stage, name.clone()));
        }

        if info.distinct_type == DistinctType::Unordered {
            let seen = resume
                .map(|o| o.distinct_seen.iter().copied().collect())
                .unwrap_or_default();
            stage = Box::new(DistinctStage::new(stage, seen));
        }

        let skip = info.offset.unwrap_or(0);
        if skip > 0 {
            let remaining = resume.and_then(|o| o.skip_remaining).unwrap_or(skip);
            stage = Box::new(SkipStage::new(stage, remaining));
        }

        if let Some(n) = info.top.or(info.limit) {
            let remaining = resume.and_then(|o| o.top_remaining).unwrap_or(n);
            stage = Box::new(TopStage::new(stage, remaining));
        }

        Ok(stage)
    }
}

/// `Top(N)`/`LIMIT N`: hard-caps the stream to `N` items, then signals end-of-stream.
struct TopStage {
    inner: Box<dyn BaseExecutionContext>,
    remaining: u64,
}

impl TopStage {
    fn new(inner: Box<dyn BaseExecutionContext>, n: u64) -> Self {
        Self { inner, remaining: n }
    }
}

#[async_trait]
impl BaseExecutionContext for TopStage {
    async fn next(&mut self) -> crate::Result<Option<QueryResult>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        match self.inner.next().await? {
            Some(item) => {
                self.remaining -= 1;
                Ok(Some(item))
            }
            None => {
                self.remaining = 0;
                Ok(None)
            }
        }
    }

    fn continuation(&self) -> CompositeContinuation {
        // Once `Top`/`LIMIT` is satisfied there is nothing left to resume, same as `AggregateStage`
        // below: forwarding the inner token here would resurrect producer/base state that still
        // has real, unconsumed ranges, and a caller resuming from it would re-run work this stage
        // already decided was unnecessary.
        if self.remaining == 0 {
            return CompositeContinuation::new();
        }
        let mut token = self.inner.continuation();
        let mut outer = token.outer().cloned().unwrap_or_default();
        outer.top_remaining = Some(self.remaining);
        token.set_outer(outer);
        token
    }

    fn take_request_charge(&mut self) -> f64 {
        self.inner.take_request_charge()
    }

    fn take_query_metrics(&mut self) -> HashMap<String, String> {
        self.inner.take_query_metrics()
    }

    fn activity_id(&self) -> Option<Uuid> {
        self.inner.activity_id()
    }
}

/// `Skip(K)`/`OFFSET K`: discards the first `K` items, then passes the rest through unchanged.
struct SkipStage {
    inner: Box<dyn BaseExecutionContext>,
    remaining: u64,
}

impl SkipStage {
    fn new(inner: Box<dyn BaseExecutionContext>, k: u64) -> Self {
        Self { inner, remaining: k }
    }
}

#[async_trait]
impl BaseExecutionContext for SkipStage {
    async fn next(&mut self) -> crate::Result<Option<QueryResult>> {
        while self.remaining > 0 {
            match self.inner.next().await? {
                Some(_) => self.remaining -= 1,
                None => return Ok(None),
            }
        }
        self.inner.next().await
    }

    fn continuation(&self) -> CompositeContinuation {
        let mut token = self.inner.continuation();
        let mut outer = token.outer().cloned().unwrap_or_default();
        outer.skip_remaining = Some(self.remaining);
        token.set_outer(outer);
        token
    }

    fn take_request_charge(&mut self) -> f64 {
        self.inner.take_request_charge()
    }

    fn take_query_metrics(&mut self) -> HashMap<String, String> {
        self.inner.take_query_metrics()
    }

    fn activity_id(&self) -> Option<Uuid> {
        self.inner.activity_id()
    }
}

/// Hash-based, unordered cross-partition `DISTINCT`. Ordered `DISTINCT` is instead collapsed by
/// the `OrderBy` base directly on adjacent equal keys (`spec.md` §4.2 item 3).
struct DistinctStage {
    inner: Box<dyn BaseExecutionContext>,
    seen: HashSet<u64>,
}

impl DistinctStage {
    fn new(inner: Box<dyn BaseExecutionContext>, seen: HashSet<u64>) -> Self {
        Self { inner, seen }
    }
}

fn fingerprint(item: &QueryResult) -> u64 {
    let mut hasher = DefaultHasher::new();
    if let Some(payload) = &item.payload {
        payload.get().hash(&mut hasher);
    }
    for clause in &item.aggregates {
        format!("{:?}", clause.item).hash(&mut hasher);
    }
    hasher.finish()
}

#[async_trait]
impl BaseExecutionContext for DistinctStage {
    async fn next(&mut self) -> crate::Result<Option<QueryResult>> {
        loop {
            match self.inner.next().await? {
                Some(item) => {
                    if self.seen.insert(fingerprint(&item)) {
                        return Ok(Some(item));
                    }
                    // Already seen this fingerprint; keep pulling from upstream.
                }
                None => return Ok(None),
            }
        }
    }

    fn continuation(&self) -> CompositeContinuation {
        let mut token = self.inner.continuation();
        let mut outer = token.outer().cloned().unwrap_or_default();
        outer.distinct_seen = self.seen.iter().copied().collect();
        token.set_outer(outer);
        token
    }

    fn take_request_charge(&mut self) -> f64 {
        self.inner.take_request_charge()
    }

    fn take_query_metrics(&mut self) -> HashMap<String, String> {
        self.inner.take_query_metrics()
    }

    fn activity_id(&self) -> Option<Uuid> {
        self.inner.activity_id()
    }
}

/// Fully consumes the inner stream, then emits exactly one item holding the aggregate result
/// (`spec.md` §4.6). `AVERAGE` over an empty set emits nothing at all.
struct AggregateStage {
    inner: Box<dyn BaseExecutionContext>,
    aggregator_name: String,
    drained: bool,
}

impl AggregateStage {
    fn new(inner: Box<dyn BaseExecutionContext>, aggregator_name: String) -> Self {
        Self {
            inner,
            aggregator_name,
            drained: false,
        }
    }
}

#[async_trait]
impl BaseExecutionContext for AggregateStage {
    async fn next(&mut self) -> crate::Result<Option<QueryResult>> {
        if self.drained {
            return Ok(None);
        }
        self.drained = true;

        let mut aggregator: Aggregator = self.aggregator_name.parse()?;
        while let Some(item) = self.inner.next().await? {
            let clause_item = item.aggregates.first().cloned().unwrap_or_default();
            aggregator.aggregate(&clause_item)?;
        }

        match aggregator.finalize()? {
            Some(value) => {
                let payload = serde_json::value::to_raw_value(&value)
                    .map_err(|e| ErrorKind::InternalError.with_source(e))?;
                Ok(Some(QueryResult {
                    aggregates: vec![QueryClauseItem::from_value(value)],
                    order_by_items: Vec::new(),
                    payload: Some(payload),
                }))
            }
            None => Ok(None),
        }
    }

    fn continuation(&self) -> CompositeContinuation {
        // An aggregate fully drains its source before emitting; there is nothing left to resume.
        CompositeContinuation::new()
    }

    fn take_request_charge(&mut self) -> f64 {
        self.inner.take_request_charge()
    }

    fn take_query_metrics(&mut self) -> HashMap<String, String> {
        self.inner.take_query_metrics()
    }

    fn activity_id(&self) -> Option<Uuid> {
        self.inner.activity_id()
    }
}
