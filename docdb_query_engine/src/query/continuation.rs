use serde::{Deserialize, Serialize};

use crate::{query::PartitionKeyRange, ErrorKind};

/// Current wire version of [`CompositeContinuation`]. Bumped whenever the token's JSON shape
/// changes in a way older readers can't tolerate.
const CONTINUATION_VERSION: u32 = 1;

/// The opaque continuation token `execute_query` hands back to the caller and accepts back in
/// [`crate::query::FeedOptions::request_continuation`].
///
/// One entry per partition key range the query still has work left in, recorded against the
/// range's bounds rather than its id, so that a token issued before a split can still be resolved
/// against the post-split routing map (`spec.md` §4.7, I4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompositeContinuation {
    version: u32,
    ranges: Vec<RangeContinuation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outer: Option<OuterState>,
}

/// Resumable state for the outer `Top`/`Skip`/`Distinct` pipeline stages (`spec.md` §4.7
/// `outer`). Absent when none of those stages are present in the pipeline.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OuterState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_remaining: Option<u64>,
    /// Fingerprints of items already emitted by an unordered `DISTINCT` stage. The spec permits
    /// either a full set or a bloom filter here (`spec.md` §4.6); we keep the full set because
    /// queries in this pipeline's scale class buffer at most `maxBufferedItemCount` items anyway.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distinct_seen: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeContinuation {
    min_inclusive: String,
    max_exclusive: String,
    /// The backend continuation to resume this range's next page with. `None` means either the
    /// range was being visited for the first time when the token was issued, or (if `done` is
    /// true) that the range was already fully drained.
    token: Option<String>,
    /// True if this range had already been fully drained when the token was issued; such a
    /// range resumes straight into `Exhausted` rather than issuing another fetch.
    #[serde(default)]
    done: bool,
    /// Non-empty for `ORDER BY` queries: the last-seen order-by key tuple, used to reconstruct
    /// the resume filter described in `spec.md` §4.5.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    order_by_items: Vec<serde_json::Value>,
    /// The `_rid` of the last-seen item, used to break order-by key ties on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_rid: Option<String>,
    /// Positional resume filter for `Parallel` execution (no order-by key to filter by): the
    /// number of items from the head of `token`'s next page that were already emitted before the
    /// token was issued and must be skipped again on resume.
    #[serde(default, skip_serializing_if = "is_zero")]
    skip_items: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// One partition key range's resume state, as resolved against the current routing map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumePoint {
    pub token: Option<String>,
    pub done: bool,
    pub order_by_items: Vec<serde_json::Value>,
    pub last_rid: Option<String>,
    pub skip_items: u64,
}

impl CompositeContinuation {
    pub fn new() -> Self {
        Self {
            version: CONTINUATION_VERSION,
            ranges: Vec::new(),
            outer: None,
        }
    }

    pub fn outer(&self) -> Option<&OuterState> {
        self.outer.as_ref()
    }

    pub fn set_outer(&mut self, outer: OuterState) {
        self.outer = Some(outer);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &mut self,
        range: &PartitionKeyRange,
        token: Option<String>,
        done: bool,
        order_by_items: Vec<serde_json::Value>,
        last_rid: Option<String>,
        skip_items: u64,
    ) {
        self.ranges.retain(|r| r.min_inclusive != range.min_inclusive || r.max_exclusive != range.max_exclusive);
        self.ranges.push(RangeContinuation {
            min_inclusive: range.min_inclusive.clone(),
            max_exclusive: range.max_exclusive.clone(),
            token,
            done,
            order_by_items,
            last_rid,
            skip_items,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn encode(&self) -> crate::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ErrorKind::InternalError.with_source(e))
    }

    pub fn decode(token: &str) -> crate::Result<Self> {
        let decoded: Self = serde_json::from_str(token)
            .map_err(|e| ErrorKind::InvalidContinuation.with_source(e))?;
        if decoded.version > CONTINUATION_VERSION {
            return Err(ErrorKind::InvalidContinuation
                .with_message(format!("continuation token version {} is newer than supported version {}", decoded.version, CONTINUATION_VERSION)));
        }
        Ok(decoded)
    }

    /// Resolves this token's per-range entries against the routing map's current ranges,
    /// returning the [`ResumePoint`] each current range should start from.
    ///
    /// A current range resolves one of three ways:
    /// - it exactly matches a recorded entry: resume that entry's state directly.
    /// - its bounds are entirely contained within a single recorded entry's bounds (the range
    ///   split since the token was issued): resume from the parent's state, since none of the
    ///   parent's buffered items could have come from past the split point it hadn't reached yet.
    /// - it spans parts of more than one recorded entry, or no entry covers it at all (two ranges
    ///   merged since the token was issued): the token cannot be resolved, and the query must be
    ///   restarted from scratch (`ErrorKind::InvalidContinuation`).
    pub fn resolve(&self, current_ranges: &[PartitionKeyRange]) -> crate::Result<Vec<(PartitionKeyRange, ResumePoint)>> {
        let mut resolved = Vec::with_capacity(current_ranges.len());
        for range in current_ranges {
            let covering: Vec<&RangeContinuation> = self
                .ranges
                .iter()
                .filter(|entry| entry.min_inclusive <= range.min_inclusive && range.max_exclusive <= entry.max_exclusive)
                .collect();

            match covering.as_slice() {
                [] => {
                    return Err(ErrorKind::InvalidContinuation.with_message(format!(
                        "continuation token does not cover partition key range {}..{}",
                        range.min_inclusive, range.max_exclusive
                    )));
                }
                [entry] => {
                    resolved.push((
                        range.clone(),
                        ResumePoint {
                            token: entry.token.clone(),
                            done: entry.done,
                            order_by_items: entry.order_by_items.clone(),
                            last_rid: entry.last_rid.clone(),
                            skip_items: entry.skip_items,
                        },
                    ));
                }
                _ => {
                    return Err(ErrorKind::InvalidContinuation.with_message(format!(
                        "partition key range {}..{} merges ranges recorded separately in the continuation token",
                        range.min_inclusive, range.max_exclusive
                    )));
                }
            }
        }
        Ok(resolved)
    }
}

impl Default for CompositeContinuation {
    fn default() -> Self {
        Self::new()
    }
}
