//! Resuming a cross-partition `ORDER BY` query from a continuation token saved mid-stream
//! (`spec.md` §8 scenario 6, property P4).

mod support;

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};

use docdb_query_engine::query::{
    execute_query, FeedOptions, PartitionKeyRange, Query, QueryInfo, QueryPlan, SortOrder,
};
use support::{json_page, order_by_item, order_by_page, MockBackend, NoRetryPolicyFactory};

fn ranges_and_pages() -> MockBackend {
    let backend = MockBackend::new();
    backend.add_range(
        PartitionKeyRange::new("0", "", "80"),
        vec![order_by_page(
            vec![
                order_by_item(json!(1), json!({"value": 1})),
                order_by_item(json!(3), json!({"value": 3})),
                order_by_item(json!(5), json!({"value": 5})),
            ],
            None,
        )],
    );
    backend.add_range(
        PartitionKeyRange::new("1", "80", "FF"),
        vec![order_by_page(
            vec![
                order_by_item(json!(2), json!({"value": 2})),
                order_by_item(json!(4), json!({"value": 4})),
                order_by_item(json!(6), json!({"value": 6})),
            ],
            None,
        )],
    );
    backend
}

fn plan() -> QueryPlan {
    QueryPlan {
        partitioned_query_execution_info_version: 1,
        query_info: QueryInfo {
            requires_cross_partition: true,
            order_by_directions: vec![SortOrder::Ascending],
            order_by_expressions: vec!["c.value".to_string()],
            ..Default::default()
        },
        query_ranges: Vec::new(),
    }
}

fn values_of(page: &docdb_query_engine::query::FeedResponse<Value>) -> Vec<i64> {
    page.items.iter().map(|v| v["value"].as_i64().unwrap()).collect()
}

#[tokio::test]
async fn resuming_from_a_saved_continuation_yields_the_original_suffix() {
    let options = FeedOptions {
        max_item_count: Some(2),
        enable_cross_partition_query: true,
        ..Default::default()
    };

    // Run the query to completion once, uninterrupted, to know what the "original" full stream
    // looks like.
    let backend = Arc::new(ranges_and_pages());
    let stream = execute_query::<Value>(
        plan(),
        Query::new("SELECT * FROM c ORDER BY c.value"),
        options.clone(),
        backend.clone(),
        backend.clone(),
        Arc::new(NoRetryPolicyFactory),
    );
    tokio::pin!(stream);
    let mut original_pages = Vec::new();
    while let Some(page) = stream.next().await {
        original_pages.push(page.unwrap());
    }
    assert_eq!(original_pages.len(), 3);
    assert_eq!(values_of(&original_pages[0]), vec![1, 2]);
    assert_eq!(values_of(&original_pages[1]), vec![3, 4]);
    assert_eq!(values_of(&original_pages[2]), vec![5, 6]);
    assert!(original_pages[0].continuation_token.is_some());
    assert!(original_pages[1].continuation_token.is_some());
    assert!(original_pages[2].continuation_token.is_none());

    // Now resume from the continuation saved after the first page, against a fresh backend
    // instance seeded with the same data (simulating a brand new process).
    let saved_token = original_pages[0].continuation_token.clone().unwrap();
    let resume_backend = Arc::new(ranges_and_pages());
    let resume_options = FeedOptions {
        request_continuation: Some(saved_token),
        ..options
    };
    let resumed_stream = execute_query::<Value>(
        plan(),
        Query::new("SELECT * FROM c ORDER BY c.value"),
        resume_options,
        resume_backend.clone(),
        resume_backend.clone(),
        Arc::new(NoRetryPolicyFactory),
    );
    tokio::pin!(resumed_stream);

    let mut resumed_values = Vec::new();
    while let Some(page) = resumed_stream.next().await {
        resumed_values.extend(values_of(&page.unwrap()));
    }

    let original_suffix: Vec<i64> = original_pages[1..]
        .iter()
        .flat_map(values_of)
        .collect();
    assert_eq!(resumed_values, vec![3, 4, 5, 6]);
    assert_eq!(resumed_values, original_suffix);
}

#[tokio::test]
async fn stale_continuation_referencing_a_merged_range_is_rejected() {
    let backend = Arc::new(MockBackend::new());
    // The continuation was minted when the keyspace was split into "0" and "1"; by the time we
    // resume, the routing map reports a single merged range "2" covering both.
    backend.add_range(
        PartitionKeyRange::new("2", "", "FF"),
        vec![order_by_page(vec![order_by_item(json!(1), json!({"value": 1}))], None)],
    );

    let stale_token = {
        let mut token = docdb_query_engine::query::CompositeContinuation::new();
        token.set(&PartitionKeyRange::new("0", "", "80"), None, false, vec![json!(1)], None, 0);
        token.set(&PartitionKeyRange::new("1", "80", "FF"), None, false, vec![json!(2)], None, 0);
        token.encode().unwrap()
    };

    let options = FeedOptions {
        request_continuation: Some(stale_token),
        enable_cross_partition_query: true,
        ..Default::default()
    };

    let stream = execute_query::<Value>(
        plan(),
        Query::new("SELECT * FROM c ORDER BY c.value"),
        options,
        backend.clone(),
        backend.clone(),
        Arc::new(NoRetryPolicyFactory),
    );
    tokio::pin!(stream);

    let first = stream.next().await.expect("stream should yield the rejection");
    let err = first.expect_err("a continuation naming ranges that later merged must be rejected");
    assert_eq!(err.kind(), docdb_query_engine::ErrorKind::InvalidContinuation);
}

/// A genuinely resumed producer, as opposed to `resuming_from_a_saved_continuation_yields_the_original_suffix`
/// above: there, every range's scripted page happens to line up exactly with the outer page
/// boundary, so replaying that whole page and filtering it is indistinguishable from simply
/// continuing to the next page. Here range "0" has a non-null backend continuation (a second page
/// still to come) *and* the outer boundary lands strictly inside its first, still-buffered page,
/// which is the case that silently dropped items before producers tracked their origin
/// continuation separately from their next-fetch continuation.
#[tokio::test]
async fn resuming_an_order_by_query_replays_the_still_buffered_page_under_the_resume_filter() {
    let ranges_and_pages = || {
        let backend = MockBackend::new();
        backend.add_range(
            PartitionKeyRange::new("0", "", "80"),
            vec![
                order_by_page(
                    vec![
                        order_by_item(json!(1), json!({"value": 1})),
                        order_by_item(json!(3), json!({"value": 3})),
                        order_by_item(json!(5), json!({"value": 5})),
                        order_by_item(json!(7), json!({"value": 7})),
                    ],
                    Some("range-0-page-2"),
                ),
                order_by_page(
                    vec![
                        order_by_item(json!(9), json!({"value": 9})),
                        order_by_item(json!(11), json!({"value": 11})),
                    ],
                    None,
                ),
            ],
        );
        backend.add_range(
            PartitionKeyRange::new("1", "80", "FF"),
            vec![order_by_page(
                vec![
                    order_by_item(json!(2), json!({"value": 2})),
                    order_by_item(json!(4), json!({"value": 4})),
                    order_by_item(json!(6), json!({"value": 6})),
                    order_by_item(json!(8), json!({"value": 8})),
                ],
                None,
            )],
        );
        backend
    };

    let options = FeedOptions {
        max_item_count: Some(3),
        enable_cross_partition_query: true,
        ..Default::default()
    };

    let backend = Arc::new(ranges_and_pages());
    let stream = execute_query::<Value>(
        plan(),
        Query::new("SELECT * FROM c ORDER BY c.value"),
        options.clone(),
        backend.clone(),
        backend.clone(),
        Arc::new(NoRetryPolicyFactory),
    );
    tokio::pin!(stream);
    let mut original_pages = Vec::new();
    while let Some(page) = stream.next().await {
        original_pages.push(page.unwrap());
    }
    // [1, 2, 3], then [4, 5, 6], etc. — the first page boundary (after 3 values) lands inside
    // range "0"'s still-buffered first page ([1, 3, 5, 7]), which still has a non-null
    // continuation ("range-0-page-2") at that point.
    assert_eq!(values_of(&original_pages[0]), vec![1, 2, 3]);
    assert!(original_pages[0].continuation_token.is_some());

    let saved_token = original_pages[0].continuation_token.clone().unwrap();
    let resume_backend = Arc::new(ranges_and_pages());
    let resumed_stream = execute_query::<Value>(
        plan(),
        Query::new("SELECT * FROM c ORDER BY c.value"),
        FeedOptions {
            request_continuation: Some(saved_token),
            ..options
        },
        resume_backend.clone(),
        resume_backend.clone(),
        Arc::new(NoRetryPolicyFactory),
    );
    tokio::pin!(resumed_stream);

    let mut resumed_values = Vec::new();
    while let Some(page) = resumed_stream.next().await {
        resumed_values.extend(values_of(&page.unwrap()));
    }

    let original_suffix: Vec<i64> = original_pages[1..].iter().flat_map(values_of).collect();
    assert_eq!(resumed_values, vec![4, 5, 6, 7, 8, 9, 11]);
    assert_eq!(resumed_values, original_suffix);
}

/// The `Parallel` analogue of the test above: no order-by key exists to filter resumed items by,
/// so the producer's positional skip count is what has to carry a partially-drained, still-backed
/// page across the resume.
#[tokio::test]
async fn resuming_a_parallel_query_replays_the_still_buffered_page_under_the_positional_skip() {
    let ranges_and_pages = || {
        let backend = MockBackend::new();
        backend.add_range(
            PartitionKeyRange::new("0", "", "80"),
            vec![
                json_page(&[json!(1), json!(2), json!(3), json!(4)], Some("range-0-page-2")),
                json_page(&[json!(5), json!(6)], None),
            ],
        );
        backend.add_range(
            PartitionKeyRange::new("1", "80", "FF"),
            vec![json_page(&[json!(7), json!(8)], None)],
        );
        backend
    };

    let plan = || QueryPlan {
        partitioned_query_execution_info_version: 1,
        query_info: QueryInfo {
            requires_cross_partition: true,
            ..Default::default()
        },
        query_ranges: Vec::new(),
    };

    let options = FeedOptions {
        max_item_count: Some(3),
        enable_cross_partition_query: true,
        max_degree_of_parallelism: 1,
        ..Default::default()
    };

    let backend = Arc::new(ranges_and_pages());
    let stream = execute_query::<Value>(
        plan(),
        Query::new("SELECT * FROM c"),
        options.clone(),
        backend.clone(),
        backend.clone(),
        Arc::new(NoRetryPolicyFactory),
    );
    tokio::pin!(stream);
    let mut original_pages = Vec::new();
    while let Some(page) = stream.next().await {
        original_pages.push(page.expect("query should not fail"));
    }

    let first_page_values: Vec<i64> = original_pages[0]
        .items
        .iter()
        .map(|v: &Value| v.as_i64().unwrap())
        .collect();
    // Round-robin across ranges "0" ([1,2,3,4] then [5,6]) and "1" ([7,8]) visits "0" twice for
    // every once of "1", so the 3-item boundary lands after only 2 of range "0"'s 4 buffered
    // items have been consumed — its backend continuation ("range-0-page-2") is still non-null.
    assert_eq!(first_page_values, vec![1, 7, 2]);
    assert!(original_pages[0].continuation_token.is_some());

    let saved_token = original_pages[0].continuation_token.clone().unwrap();
    let resume_backend = Arc::new(ranges_and_pages());
    let resumed_stream = execute_query::<Value>(
        plan(),
        Query::new("SELECT * FROM c"),
        FeedOptions {
            request_continuation: Some(saved_token),
            ..options
        },
        resume_backend.clone(),
        resume_backend.clone(),
        Arc::new(NoRetryPolicyFactory),
    );
    tokio::pin!(resumed_stream);

    let mut resumed_values: Vec<i64> = Vec::new();
    while let Some(page) = resumed_stream.next().await {
        resumed_values.extend(
            page.expect("resumed query should not fail")
                .items
                .iter()
                .map(|v: &Value| v.as_i64().unwrap()),
        );
    }
    resumed_values.sort_unstable();

    // `Parallel` gives no ordering guarantee across a resume, but every remaining item must
    // appear exactly once: nothing already emitted (1, 7, 2) re-appears, and nothing is lost.
    assert_eq!(resumed_values, vec![3, 4, 5, 6, 8]);
}
