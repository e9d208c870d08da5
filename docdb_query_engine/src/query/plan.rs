use serde::Deserialize;

/// The output of query planning: a [`QueryInfo`] plus the key ranges the plan requires the
/// pipeline to visit. Produced by the (external) planner collaborator; see `spec.md` §4.1.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    pub partitioned_query_execution_info_version: usize,
    pub query_info: QueryInfo,
    #[serde(default)]
    pub query_ranges: Vec<QueryRange>,
}

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
pub enum DistinctType {
    #[default]
    None,
    Ordered,
    Unordered,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
#[serde(rename_all = "camelCase")]
pub struct QueryInfo {
    pub distinct_type: DistinctType,
    pub top: Option<u64>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    /// Sort direction for each `ORDER BY` expression, in declared order.
    pub order_by_directions: Vec<SortOrder>,
    /// Source text of each `ORDER BY` expression, parallel to `order_by_directions`.
    pub order_by_expressions: Vec<String>,
    /// Names of the aggregate functions requested by the query, e.g. `["SUM"]`.
    ///
    /// The pipeline supports exactly one aggregate per query (`spec.md` §4.2); more than one
    /// entry here is a [`crate::ErrorKind::PlanRejected`] at pipeline construction time.
    pub aggregates: Vec<String>,
    /// Non-empty if the query has a `GROUP BY` clause. `GROUP BY` is not supported; its presence
    /// is rejected at pipeline construction.
    pub group_by_expressions: Vec<String>,
    pub rewritten_query: String,
    pub has_select_value: bool,
    /// True if the query requires visiting more than one partition key range to answer
    /// correctly (an `ORDER BY`, aggregate, `TOP`, or `OFFSET`/`LIMIT` over a partitioned
    /// collection, or an explicit cross-partition filter).
    pub requires_cross_partition: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A sub-range of the partition key space that the query plan restricts execution to
/// (for example, from an `IN` filter on the partition key). Used to prune the set of
/// partition key ranges a query is dispatched against.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRange {
    pub min: String,
    pub max: String,
    pub is_min_inclusive: bool,
    pub is_max_inclusive: bool,
}
