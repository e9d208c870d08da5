// Shared, in-process mock of the three collaborator traits (`RoutingMapProvider`,
// `RequestExecutor`, `RetryPolicyFactory`) the pipeline consumes (`spec.md` §6). Tests script a
// fixed sequence of pages per partition key range and, optionally, a split; there is no network
// involved, matching how the teacher's own integration tests stub out the gateway.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use docdb_query_engine::{
    query::{
        PartitionKeyRange, PartitionRequest, ProducerPage, QueryClauseItem, QueryResult,
        RequestExecutor, RetryPolicy, RetryPolicyFactory, RoutingMapProvider,
    },
    Error, ErrorKind,
};

type Result<T> = std::result::Result<T, Error>;

/// One scripted page a [`MockBackend`] hands back for a single `execute()` call.
#[derive(Clone)]
pub struct MockPage {
    pub items: Vec<QueryResult>,
    pub continuation: Option<String>,
    pub request_charge: f64,
}

impl MockPage {
    pub fn new(items: Vec<QueryResult>, continuation: Option<&str>) -> Self {
        Self {
            items,
            continuation: continuation.map(str::to_string),
            request_charge: 1.0,
        }
    }
}

struct RangeScript {
    pages: VecDeque<MockPage>,
    /// Once `pages` is drained, the next fetch for this range reports `PartitionGone` and these
    /// children (each with their own page script) replace it, per `spec.md` §4.3.
    split_into: Option<Vec<(PartitionKeyRange, VecDeque<MockPage>)>>,
}

/// An in-process stand-in for the gateway: owns the routing map and the per-range page sequence,
/// and records every request it sees so tests can assert on dispatch order and resume tokens.
pub struct MockBackend {
    ranges: Mutex<Vec<PartitionKeyRange>>,
    scripts: Mutex<HashMap<String, RangeScript>>,
    requests: Mutex<Vec<ObservedRequest>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedRequest {
    pub range_id: String,
    pub continuation: Option<String>,
}

impl MockBackend {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        Self {
            ranges: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Registers a partition key range and the sequence of pages it will hand back, one per
    /// `execute()` call, in order. The last page should carry `continuation: None` unless the
    /// range is later given a split via [`MockBackend::split_range`].
    pub fn add_range(&self, range: PartitionKeyRange, pages: Vec<MockPage>) {
        self.scripts.lock().unwrap().insert(
            range.id.clone(),
            RangeScript {
                pages: pages.into(),
                split_into: None,
            },
        );
        self.ranges.lock().unwrap().push(range);
    }

    /// Arranges for the fetch that runs after `range_id`'s scripted pages are exhausted to report
    /// `PartitionGone` instead of a normal page, with `children` (and their own page scripts)
    /// taking over the range's share of the keyspace.
    pub fn split_range(&self, range_id: &str, children: Vec<(PartitionKeyRange, Vec<MockPage>)>) {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts
            .get_mut(range_id)
            .expect("range must be registered with add_range before it can be split");
        script.split_into = Some(
            children
                .into_iter()
                .map(|(range, pages)| (range, pages.into()))
                .collect(),
        );
    }

    pub fn requests(&self) -> Vec<ObservedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoutingMapProvider for MockBackend {
    async fn get_overlapping_ranges(
        &self,
        _query_ranges: &[(String, String)],
    ) -> Result<Vec<PartitionKeyRange>> {
        Ok(self.ranges.lock().unwrap().clone())
    }

    async fn resolve_split(&self, range: &PartitionKeyRange) -> Result<Vec<PartitionKeyRange>> {
        let scripts = self.scripts.lock().unwrap();
        match scripts.get(&range.id).and_then(|s| s.split_into.as_ref()) {
            Some(children) => Ok(children.iter().map(|(r, _)| r.clone()).collect()),
            None => Ok(vec![range.clone()]),
        }
    }
}

#[async_trait]
impl RequestExecutor for MockBackend {
    async fn execute(&self, request: PartitionRequest<'_>) -> Result<ProducerPage> {
        self.requests.lock().unwrap().push(ObservedRequest {
            range_id: request.pkrange.id.clone(),
            continuation: request.continuation.map(str::to_string),
        });

        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(&request.pkrange.id).ok_or_else(|| {
            ErrorKind::UnknownPartitionKeyRange
                .with_message(format!("no script registered for range {}", request.pkrange.id))
        })?;

        if let Some(page) = script.pages.pop_front() {
            return Ok(ProducerPage {
                items: page.items,
                continuation_token: page.continuation,
                request_charge: page.request_charge,
                activity_id: Some(uuid::Uuid::nil()),
                query_metrics: Some(request.pkrange.id.clone()),
            });
        }

        if let Some(children) = script.split_into.take() {
            for (range, pages) in children {
                scripts.entry(range.id.clone()).or_insert(RangeScript {
                    pages,
                    split_into: None,
                });
            }
            return Err(ErrorKind::PartitionGone
                .with_message(format!("range {} is gone", request.pkrange.id)));
        }

        Err(ErrorKind::InternalError.with_message(format!(
            "range {} has no more scripted pages",
            request.pkrange.id
        )))
    }
}

/// A retry policy factory that never retries; used by every test here since the mock backend
/// never returns `Throttled`/`TimedOut` unless a test opts into [`FlakyRetryPolicyFactory`].
pub struct NoRetryPolicyFactory;

struct NoRetryPolicy;

#[async_trait]
impl RetryPolicy for NoRetryPolicy {
    async fn should_retry(&mut self, _error: &Error) -> Option<Duration> {
        None
    }
}

impl RetryPolicyFactory for NoRetryPolicyFactory {
    fn new_policy(&self) -> Box<dyn RetryPolicy> {
        Box::new(NoRetryPolicy)
    }
}

/// A retry policy that retries `Throttled`/`TimedOut` errors up to `max_retries` times with no
/// delay, then gives up. Exercises the retry-exhaustion path through `DocumentProducer::fill`.
pub struct FlakyRetryPolicyFactory {
    pub max_retries: u32,
}

struct FlakyRetryPolicy {
    remaining: u32,
}

#[async_trait]
impl RetryPolicy for FlakyRetryPolicy {
    async fn should_retry(&mut self, _error: &Error) -> Option<Duration> {
        if self.remaining == 0 {
            None
        } else {
            self.remaining -= 1;
            Some(Duration::from_millis(0))
        }
    }
}

impl RetryPolicyFactory for FlakyRetryPolicyFactory {
    fn new_policy(&self) -> Box<dyn RetryPolicy> {
        Box::new(FlakyRetryPolicy {
            remaining: self.max_retries,
        })
    }
}

pub fn json_page(values: &[serde_json::Value], continuation: Option<&str>) -> MockPage {
    MockPage::new(
        values.iter().cloned().map(QueryResult::from_payload).collect(),
        continuation,
    )
}

/// Builds one `ORDER BY` result item: `key` is the single order-by clause's value, `payload` is
/// the document the backend would otherwise return unwrapped.
pub fn order_by_item(key: serde_json::Value, payload: serde_json::Value) -> QueryResult {
    QueryResult {
        order_by_items: vec![QueryClauseItem::from_value(key)],
        aggregates: Vec::new(),
        payload: Some(serde_json::value::to_raw_value(&payload).unwrap()),
    }
}

pub fn order_by_page(items: Vec<QueryResult>, continuation: Option<&str>) -> MockPage {
    MockPage::new(items, continuation)
}

/// Builds one `SELECT VALUE <aggregate>(...)` result item carrying a raw numeric partial value.
pub fn aggregate_item(value: serde_json::Value) -> QueryResult {
    QueryResult {
        order_by_items: Vec::new(),
        aggregates: vec![QueryClauseItem::from_value(value)],
        payload: None,
    }
}
