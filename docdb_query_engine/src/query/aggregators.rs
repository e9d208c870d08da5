use std::str::FromStr;

use serde::Deserialize;

use crate::{query::QueryClauseItem, ErrorKind};

/// Carries running aggregation state for one of the five aggregate functions the pipeline
/// supports. `Average` is carried as `(sum, count)` and only divided at [`Aggregator::finalize`]
/// time, so that partial averages from different partitions can still be combined correctly
/// (`spec.md` P6: `AVERAGE` commutes with the `(sum, count)` monoid).
#[derive(Clone, Debug)]
pub enum Aggregator {
    Count { count: u64 },
    Sum { sum: f64 },
    Average { sum: f64, count: u64 },
    Min { min: Option<QueryClauseItem> },
    Max { max: Option<QueryClauseItem> },
}

impl FromStr for Aggregator {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        if s.eq_ignore_ascii_case("count") {
            Ok(Aggregator::Count { count: 0 })
        } else if s.eq_ignore_ascii_case("sum") {
            Ok(Aggregator::Sum { sum: 0.0 })
        } else if s.eq_ignore_ascii_case("average") {
            Ok(Aggregator::Average { sum: 0.0, count: 0 })
        } else if s.eq_ignore_ascii_case("min") {
            Ok(Aggregator::Min { min: None })
        } else if s.eq_ignore_ascii_case("max") {
            Ok(Aggregator::Max { max: None })
        } else {
            Err(ErrorKind::PlanRejected.with_message(format!("unsupported aggregator: {}", s)))
        }
    }
}

impl Aggregator {
    /// Aggregates the current value with the provided value, updating it in place.
    ///
    /// Accepts either a raw value (a single partition's partial result has not yet been
    /// combined with anything) or a backend-provided partial aggregate object (e.g.
    /// `{"sum": .., "count": ..}` for `AVERAGE`, `{"min": .., "count": ..}` for `MIN`) — unifying
    /// both paths lets the aggregator consume either a fully streamed-per-item value or a
    /// partition's already-partially-aggregated header value.
    pub fn aggregate(&mut self, clause_item: &QueryClauseItem) -> crate::Result<()> {
        match self {
            Aggregator::Count { count } => {
                let value = require_non_null_value(clause_item, "count")?;
                let int_value = value.as_u64().ok_or_else(|| {
                    ErrorKind::InvalidGatewayResponse
                        .with_message("count aggregator expects an integer value")
                })?;
                *count += int_value;
            }
            Aggregator::Sum { sum } => {
                let value = require_non_null_value(clause_item, "sum")?;
                let num_value = value.as_f64().ok_or_else(|| {
                    ErrorKind::InvalidGatewayResponse.with_message("sum aggregator expects a numeric value")
                })?;
                *sum += num_value;
            }
            Aggregator::Average { sum, count } => {
                let value = require_non_null_value(clause_item, "average")?;
                #[derive(Debug, Deserialize)]
                struct AverageItem {
                    sum: f64,
                    count: u64,
                }
                let item: AverageItem = serde_json::from_value(value.clone()).map_err(|e| {
                    ErrorKind::InvalidGatewayResponse.with_message(format!(
                        "average aggregator expects object with 'sum' and 'count' properties: {}",
                        e
                    ))
                })?;
                *sum += item.sum;
                *count += item.count;
            }
            Aggregator::Min { min } => {
                if let Some(new) = better_minmax_candidate(min, clause_item, std::cmp::Ordering::Less)? {
                    *min = Some(new);
                }
            }
            Aggregator::Max { max } => {
                if let Some(new) = better_minmax_candidate(max, clause_item, std::cmp::Ordering::Greater)? {
                    *max = Some(new);
                }
            }
        }
        Ok(())
    }

    /// Produces the final aggregate value, or `None` if the aggregate has no defined result.
    ///
    /// Per `spec.md` §4.6, `AVERAGE` over an empty set is `Undefined` and the [`super::pipeline::aggregate`]
    /// stage emits no result document at all in that case. `SUM` and `COUNT` over an empty set are
    /// well-defined (`0`); `MIN`/`MAX` over an empty set are `null`, matching every other
    /// aggregate's "empty partition contributes nothing" behavior.
    pub fn finalize(self) -> crate::Result<Option<serde_json::Value>> {
        fn make_number(value: f64) -> crate::Result<serde_json::Number> {
            serde_json::Number::from_f64(value)
                .ok_or_else(|| ErrorKind::ArithmeticOverflow.with_message("aggregator has non-finite value"))
        }

        let value = match self {
            Aggregator::Count { count } => serde_json::Value::Number(count.into()),
            Aggregator::Sum { sum } => serde_json::Value::Number(make_number(sum)?),
            Aggregator::Average { count: 0, .. } => return Ok(None),
            Aggregator::Average { sum, count } => {
                serde_json::Value::Number(make_number(sum / (count as f64))?)
            }
            Aggregator::Min { min } => min.and_then(|c| c.item).unwrap_or(serde_json::Value::Null),
            Aggregator::Max { max } => max.and_then(|c| c.item).unwrap_or(serde_json::Value::Null),
        };
        Ok(Some(value))
    }
}

fn require_non_null_value<'a>(
    clause_item: &'a QueryClauseItem,
    aggregator_name: &str,
) -> crate::Result<&'a serde_json::Value> {
    clause_item.item.as_ref().ok_or_else(|| {
        ErrorKind::InvalidGatewayResponse
            .with_message(format!("{} aggregator expects a non-null value", aggregator_name))
    })
}

fn better_minmax_candidate(
    current: &Option<QueryClauseItem>,
    candidate: &QueryClauseItem,
    preferred_ordering: std::cmp::Ordering,
) -> crate::Result<Option<QueryClauseItem>> {
    let candidate_value = match &candidate.item {
        Some(serde_json::Value::Object(_)) => {
            #[derive(Debug, Deserialize)]
            struct MinMaxItem {
                #[serde(alias = "min")]
                #[serde(alias = "max")]
                value: serde_json::Value,
                count: u64,
            }

            let item: MinMaxItem =
                serde_json::from_value(candidate.item.clone().unwrap()).map_err(|e| {
                    ErrorKind::InvalidGatewayResponse.with_message(format!(
                        "min/max aggregator expects object with 'min'/'max' and 'count' properties: {}",
                        e
                    ))
                })?;
            if item.count == 0 {
                // An empty partition reports count == 0; ignore its candidate value entirely.
                return Ok(None);
            }
            QueryClauseItem::from_value(item.value)
        }
        _ => candidate.clone(),
    };

    Ok(match current {
        None => Some(candidate_value),
        Some(existing) if candidate_value.compare(existing)? == preferred_ordering => Some(candidate_value),
        _ => None,
    })
}
