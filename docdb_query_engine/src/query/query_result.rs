use serde::{Deserialize, Deserializer, Serialize};

use crate::ErrorKind;

/// Describes the expected shape of a partition's query result.
///
/// The backend varies the shape of what it returns depending on the kind of query: a plain
/// `SELECT *` returns raw documents, an `ORDER BY` query wraps each document with its order-by
/// key tuple, and a `SELECT VALUE <aggregate>(...)` query returns bare aggregate clause items.
/// Deserializing the backend's wire response into [`QueryResult`] is the [`super::RequestExecutor`]
/// collaborator's job (wire framing is out of this pipeline's scope); this enum is how the
/// pipeline tells that collaborator which shape to expect for a given plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryResultShape {
    /// The result is just the raw payload, with no additional metadata.
    RawPayload,
    /// The payload is the result of an `ORDER BY` query.
    OrderBy,
    /// The result is from a `SELECT VALUE <aggregate>(...)` query.
    ValueAggregate,
}

/// A single result from one partition, normalized into the shape the pipeline operates on.
///
/// The pipeline never deserializes `payload` into the caller's type until a [`super::FeedResponse`]
/// is about to be handed back to the caller; internally it only inspects `order_by_items` and
/// `aggregates`.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    /// The items used for ordering the results, present only for `ORDER BY` queries.
    pub order_by_items: Vec<QueryClauseItem>,

    /// Values of aggregate functions, present only for `SELECT VALUE <aggregate>(...)` queries.
    pub aggregates: Vec<QueryClauseItem>,

    /// The actual payload of the query result. Empty when the query only requested aggregates.
    pub payload: Option<Box<serde_json::value::RawValue>>,
}

impl QueryResult {
    pub fn from_payload<T: Serialize>(payload: T) -> Self {
        Self {
            order_by_items: Vec::new(),
            aggregates: Vec::new(),
            payload: Some(serde_json::value::to_raw_value(&payload).expect("payload must serialize")),
        }
    }
}

/// Many backend-rewritten queries produce `{"item": <value>}` objects for order-by and group-by
/// items. This struct represents that shape and provides the comparison logic the merge and
/// aggregate stages rely on.
#[derive(Clone, Debug, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct QueryClauseItem {
    #[serde(default, deserialize_with = "deserialize_item")]
    pub item: Option<serde_json::Value>,

    /// An alternate form of the item the backend sometimes attaches, such as a min/max value
    /// bundled with the count of items it was computed over.
    #[serde(default, deserialize_with = "deserialize_item")]
    pub item2: Option<serde_json::Value>,
}

// Based on https://github.com/serde-rs/serde/issues/984#issuecomment-314143738
// This deserializes a missing field to `None`, a present-but-null field to `Some(Value::Null)`,
// and a present-non-null field to `Some(value)`.
fn deserialize_item<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

impl QueryClauseItem {
    pub fn from_value(value: serde_json::Value) -> Self {
        Self {
            item: Some(value),
            item2: None,
        }
    }

    pub fn from_values(item: serde_json::Value, item2: serde_json::Value) -> Self {
        Self {
            item: Some(item),
            item2: Some(item2),
        }
    }

    /// Compares two [`QueryClauseItem`]s using the backend's cross-type ordering rules:
    /// undefined < null < bool < number < string, and non-primitive values cannot be compared.
    ///
    /// We can't implement [`PartialOrd`] here, because we need to be able to return an error.
    pub fn compare(&self, other: &Self) -> crate::Result<std::cmp::Ordering> {
        let left_ordinal = self.type_ordinal()?;
        let right_ordinal = other.type_ordinal()?;

        if left_ordinal != right_ordinal {
            return Ok(left_ordinal.cmp(&right_ordinal));
        }

        match (&self.item, &other.item) {
            (None, None) => Ok(std::cmp::Ordering::Equal),
            (Some(serde_json::Value::Null), Some(serde_json::Value::Null)) => {
                Ok(std::cmp::Ordering::Equal)
            }
            (Some(serde_json::Value::String(left)), Some(serde_json::Value::String(right))) => {
                Ok(left.cmp(right))
            }
            (Some(serde_json::Value::Bool(left)), Some(serde_json::Value::Bool(right))) => {
                Ok(left.cmp(right))
            }
            (Some(serde_json::Value::Number(left)), Some(serde_json::Value::Number(right))) => {
                if let (Some(l_int), Some(r_int)) = (left.as_i64(), right.as_i64()) {
                    Ok(l_int.cmp(&r_int))
                } else {
                    let l = left.as_f64().ok_or_else(|| {
                        ErrorKind::InvalidGatewayResponse
                            .with_message("encountered NaN or Infinity while comparing floats")
                    })?;
                    let r = right.as_f64().ok_or_else(|| {
                        ErrorKind::InvalidGatewayResponse
                            .with_message("encountered NaN or Infinity while comparing floats")
                    })?;
                    l.partial_cmp(&r).ok_or_else(|| {
                        ErrorKind::InvalidGatewayResponse
                            .with_message("encountered NaN or Infinity while comparing floats")
                    })
                }
            }
            _ => unreachable!(
                "encountered different types after comparing type ordinal, this shouldn't be possible"
            ),
        }
    }

    /// The "type ordinal" used to order items of differing types before comparing values.
    fn type_ordinal(&self) -> crate::Result<usize> {
        match &self.item {
            None => Ok(0),
            Some(serde_json::Value::Null) => Ok(1),
            Some(serde_json::Value::Bool(_)) => Ok(2),
            // 3 is intentionally unused, to leave room for a future type without a wire version bump.
            Some(serde_json::Value::Number(_)) => Ok(4),
            Some(serde_json::Value::String(_)) => Ok(5),
            _ => Err(ErrorKind::InvalidGatewayResponse
                .with_message("cannot compare non-primitive values")),
        }
    }
}
