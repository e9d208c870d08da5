use std::{cmp::Ordering, sync::Arc};

use crate::{
    query::{QueryClauseItem, SortOrder},
    ErrorKind,
};

/// A compiled `ORDER BY` clause: one [`SortOrder`] per expression, in declared order.
#[derive(Clone)]
pub struct Sorting(Arc<[SortOrder]>);

impl Sorting {
    pub fn new(ordering: Vec<SortOrder>) -> Self {
        Self(Arc::from(ordering))
    }

    /// Compares two order-by key tuples using this clause's directions.
    ///
    /// This ALWAYS returns an ordering with the LARGEST key tuple first, because the k-way merge
    /// in [`super::super::base::order_by`] uses a [`std::collections::BinaryHeap`], which is a
    /// max-heap: a DESCENDING sort of the items this function orders produces the user's actual
    /// requested order.
    ///
    /// `left`/`right` are `None` when a partition's buffer is currently empty; an empty partition
    /// sorts ahead of every non-empty one, so the merge is forced to request more data from it
    /// before it can safely emit anything past that point.
    pub fn compare(
        &self,
        left: Option<&[QueryClauseItem]>,
        right: Option<&[QueryClauseItem]>,
    ) -> crate::Result<Ordering> {
        let (left, right) = match (left, right) {
            (Some(left), Some(right)) => (left, right),
            (None, Some(_)) => return Ok(Ordering::Greater),
            (Some(_), None) => return Ok(Ordering::Less),
            (None, None) => return Ok(Ordering::Equal),
        };

        if left.len() != right.len() || left.len() != self.0.len() {
            return Err(ErrorKind::InvalidGatewayResponse
                .with_message("items have inconsistent numbers of order by items"));
        }

        for ((left, right), direction) in left.iter().zip(right.iter()).zip(self.0.iter()) {
            let order = left.compare(right)?;
            match (direction, order) {
                (SortOrder::Ascending, Ordering::Less) => return Ok(Ordering::Greater),
                (SortOrder::Ascending, Ordering::Greater) => return Ok(Ordering::Less),
                (SortOrder::Descending, Ordering::Less) => return Ok(Ordering::Less),
                (SortOrder::Descending, Ordering::Greater) => return Ok(Ordering::Greater),
                (_, Ordering::Equal) => {}
            }
        }

        Ok(Ordering::Equal)
    }
}
