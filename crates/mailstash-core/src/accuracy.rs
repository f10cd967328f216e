//! Accuracy-range bookkeeping: which time spans of a folder are known to be
//! synchronized with the remote store, and how recently.
//!
//! Ranges are kept newest-first and non-overlapping; the start is inclusive
//! and the end exclusive, matching the IMAP SINCE/BEFORE convention used by
//! the sync engine. Adjacent ranges carrying identical full-sync metadata
//! are coalesced on insertion. The list answers the one question everything
//! else cares about: "can I trust what I have for this span without talking
//! to the server again?"

use serde::{Deserialize, Serialize};

use crate::date::TimestampMs;

/// Metadata recorded when a range was fully synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSync {
    /// Highest remote change token observed during the sync (for protocols
    /// with CONDSTORE-style tokens; opaque to us).
    pub highest_modseq: String,
    /// When the range was last refreshed, client clock.
    pub updated: TimestampMs,
}

/// One contiguous span of known-synchronized time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccuracyRange {
    /// Inclusive start.
    pub start_ts: TimestampMs,
    /// Exclusive end.
    pub end_ts: TimestampMs,
    /// `Some` if the range was a full synchronization; `None` for spans we
    /// merely know about (sparse search results).
    pub full_sync: Option<FullSync>,
}

/// A sub-interval still needing sync work, returned by
/// [`AccuracyTracker::range_needing_refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSpan {
    /// Inclusive start.
    pub start_ts: TimestampMs,
    /// Exclusive end.
    pub end_ts: TimestampMs,
}

/// Sorted, non-overlapping list of accuracy ranges for one folder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccuracyTracker {
    ranges: Vec<AccuracyRange>,
}

impl AccuracyTracker {
    /// Create an empty tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Rebuild from persisted ranges. The caller is trusted to hand back
    /// what a tracker previously produced.
    #[must_use]
    pub const fn from_ranges(ranges: Vec<AccuracyRange>) -> Self {
        Self { ranges }
    }

    /// The ranges, newest-first.
    #[must_use]
    pub fn ranges(&self) -> &[AccuracyRange] {
        &self.ranges
    }

    /// Index of the first (newest) range overlapping `[start_ts, end_ts)`,
    /// or the insertion index if none does.
    fn find_first_overlap(&self, start_ts: TimestampMs, end_ts: TimestampMs) -> (usize, bool) {
        for (i, range) in self.ranges.iter().enumerate() {
            // Ranges are newest-first; once our start is past this range's
            // end nothing older can overlap either. Touching endpoints do
            // not overlap (exclusive ends).
            if start_ts > range.end_ts {
                return (i, false);
            }
            if end_ts > range.start_ts {
                return (i, true);
            }
        }
        (self.ranges.len(), false)
    }

    /// Index of the last (oldest) range overlapping `[start_ts, end_ts)`,
    /// or the insertion index if none does.
    fn find_last_overlap(&self, start_ts: TimestampMs, end_ts: TimestampMs) -> (usize, bool) {
        for (i, range) in self.ranges.iter().enumerate().rev() {
            if end_ts <= range.start_ts {
                return (i + 1, false);
            }
            if start_ts < range.end_ts {
                return (i, true);
            }
        }
        (0, false)
    }

    /// Record that `[start_ts, end_ts)` has been fully synchronized.
    ///
    /// Overlapped neighbors are split where the new range's edges fall
    /// strictly inside them; adjacent ranges whose full-sync metadata is
    /// identical to `full_sync` are merged into the inserted range.
    ///
    /// # Panics
    ///
    /// Panics if `start_ts > end_ts`; the timestamps are switched.
    pub fn mark_synced(
        &mut self,
        start_ts: TimestampMs,
        mut end_ts: TimestampMs,
        full_sync: &FullSync,
    ) {
        assert!(start_ts <= end_ts, "accuracy range timestamps are switched");

        let (mut new_idx, new_found) = self.find_first_overlap(start_ts, end_ts);
        let (old_idx, old_found) = self.find_last_overlap(start_ts, end_ts);

        // Split the newest overlapped range if our end lands strictly
        // inside it, unless its metadata matches and we can just absorb it.
        let new_splits = new_found && self.ranges[new_idx].end_ts > end_ts;
        let old_splits = old_found && self.ranges[old_idx].start_ts < start_ts;

        let mut del_count = old_idx - new_idx + usize::from(old_found);
        let mut insertions: Vec<AccuracyRange> = Vec::new();

        if new_splits {
            let neighbor = &self.ranges[new_idx];
            if neighbor.full_sync.as_ref() == Some(full_sync) {
                end_ts = neighbor.end_ts;
            } else {
                insertions.push(AccuracyRange {
                    start_ts: end_ts,
                    end_ts: neighbor.end_ts,
                    full_sync: neighbor.full_sync.clone(),
                });
            }
        }
        insertions.push(AccuracyRange {
            start_ts,
            end_ts,
            full_sync: Some(full_sync.clone()),
        });
        if old_splits {
            let neighbor = &self.ranges[old_idx];
            if neighbor.full_sync.as_ref() == Some(full_sync) {
                if let Some(last) = insertions.last_mut() {
                    last.start_ts = neighbor.start_ts;
                }
            } else {
                insertions.push(AccuracyRange {
                    start_ts: neighbor.start_ts,
                    end_ts: start_ts,
                    full_sync: neighbor.full_sync.clone(),
                });
            }
        }

        // Coalesce with the untouched neighbor on each side when the spans
        // line up exactly and the metadata matches.
        if new_idx > 0 {
            let neighbor = &self.ranges[new_idx - 1];
            if insertions[0].end_ts == neighbor.start_ts
                && neighbor.full_sync.as_ref() == Some(full_sync)
            {
                insertions[0].end_ts = neighbor.end_ts;
                new_idx -= 1;
                del_count += 1;
            }
        }
        let old_neighbor_idx = old_idx + usize::from(old_found);
        if old_neighbor_idx < self.ranges.len() {
            let neighbor = &self.ranges[old_neighbor_idx];
            let last_start = insertions
                .last()
                .map(|r| r.start_ts)
                .unwrap_or_default();
            if last_start == neighbor.end_ts && neighbor.full_sync.as_ref() == Some(full_sync) {
                if let Some(last) = insertions.last_mut() {
                    last.start_ts = neighbor.start_ts;
                }
                del_count += 1;
            }
        }

        self.ranges.splice(new_idx..new_idx + del_count, insertions);
    }

    /// Stretch the oldest accuracy range back to the sync horizon,
    /// recording that we believe the whole folder history is synchronized.
    ///
    /// Logged as a defect no-op when no ranges exist; callers only reach
    /// this after a successful sync pass, which always records a range.
    pub fn mark_synced_to_dawn_of_time(&mut self, oldest_sync_date: TimestampMs) {
        if let Some(last) = self.ranges.last_mut() {
            tracing::debug!(oldest_sync_date, "marking synced to dawn of time");
            last.start_ts = oldest_sync_date;
        } else {
            tracing::warn!("synced-to-dawn-of-time with no accuracy ranges");
        }
    }

    /// Withdraw the synced-through-the-dawn-of-time claim, truncating the
    /// oldest range's coverage to `new_oldest_ts`. A `mark_synced` covering
    /// the withdrawn span is expected to follow in the same pass.
    pub fn clear_synced_to_dawn_of_time(&mut self, new_oldest_ts: TimestampMs) {
        let Some(last) = self.ranges.last_mut() else {
            return;
        };
        if last.end_ts > new_oldest_ts {
            last.start_ts = new_oldest_ts;
        } else {
            // Truncating would invert the range; drop it instead. Not
            // expected to happen, so leave a trail.
            tracing::warn!(
                start_ts = last.start_ts,
                end_ts = last.end_ts,
                new_oldest_ts,
                "suspect oldest accuracy range dropped"
            );
            self.ranges.pop();
        }
    }

    /// The most recent timestamp we have fully synchronized through, or 0
    /// when nothing has been synced (safely "not up to date").
    #[must_use]
    pub fn newest_full_sync_date(&self) -> TimestampMs {
        self.ranges.first().map_or(0, |r| r.end_ts)
    }

    /// The oldest timestamp we have fully synchronized through, or `now`
    /// when no fully-synced range exists.
    #[must_use]
    pub fn oldest_full_sync_date(&self, now: TimestampMs) -> TimestampMs {
        self.ranges
            .iter()
            .rev()
            .find(|r| r.full_sync.is_some())
            .map_or(now, |r| r.start_ts)
    }

    /// Whether coverage reaches the configured sync horizon. A day of slop
    /// absorbs timezone-related drift in horizon refreshes.
    #[must_use]
    pub fn synced_to_dawn_of_time(
        &self,
        oldest_sync_date: TimestampMs,
        now: TimestampMs,
    ) -> bool {
        self.oldest_full_sync_date(now) <= oldest_sync_date + crate::date::DAY_MS
    }

    /// Whether coverage reaches the current day, so that a refresh of the
    /// newest span would see messages received today.
    #[must_use]
    pub fn synced_to_today(&self, now: TimestampMs) -> bool {
        self.newest_full_sync_date() >= crate::date::quantize_date(now)
    }

    /// Find the minimal single sub-interval of `[start_ts, end_ts)` that is
    /// not covered by sufficiently fresh full-sync ranges.
    ///
    /// Returns `None` only when the entire queried interval is covered; if
    /// non-contiguous gaps exist the result spans them all, and callers
    /// re-query after closing one.
    #[must_use]
    pub fn range_needing_refresh(
        &self,
        start_ts: TimestampMs,
        end_ts: TimestampMs,
        thresh_ms: i64,
        now: TimestampMs,
    ) -> Option<RefreshSpan> {
        let recency_cutoff = now - thresh_ms;
        let mut result = RefreshSpan { start_ts, end_ts };

        let (new_idx, new_found) = self.find_first_overlap(start_ts, end_ts);
        if !new_found {
            return Some(result);
        }
        let (old_idx, _) = self.find_last_overlap(start_ts, end_ts);

        let fresh = |range: &AccuracyRange| {
            range
                .full_sync
                .as_ref()
                .is_some_and(|fs| fs.updated >= recency_cutoff)
        };

        // Walk from the newest end inward, shrinking while we find fresh
        // contiguous coverage. The newest range may fall short of the
        // queried end by up to the staleness threshold: a span younger
        // than the threshold needs no refresh by definition.
        let mut slack = thresh_ms;
        for range in &self.ranges[new_idx..=old_idx] {
            if range.end_ts + slack < result.end_ts {
                break; // gap
            }
            slack = 0;
            if !fresh(range) {
                break;
            }
            if range.start_ts <= result.start_ts {
                return None; // covered all the way through
            }
            result.end_ts = range.start_ts;
        }
        // Walk from the oldest end inward. We know we do not cover the whole
        // interval at this point, so this only tightens the start.
        for range in self.ranges[..=old_idx].iter().rev() {
            if range.start_ts > result.start_ts {
                break; // gap
            }
            if !fresh(range) {
                break;
            }
            result.start_ts = range.end_ts;
        }
        Some(result)
    }

    /// Drop coverage claims older than `cut_ts`, splitting an overlapped
    /// range. Used by the purge path after deleting old records.
    pub fn truncate_before(&mut self, cut_ts: TimestampMs) {
        let (idx, found) = self.find_first_overlap(cut_ts, cut_ts);
        if found {
            self.ranges[idx].start_ts = cut_ts;
            self.ranges.truncate(idx + 1);
        } else {
            self.ranges.truncate(idx);
        }
    }

    /// Debug check of the structural invariants: newest-first ordering, no
    /// overlap, no uncoalesced identical neighbors.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        self.ranges.windows(2).all(|w| {
            w[1].end_ts <= w[0].start_ts
                && !(w[1].end_ts == w[0].start_ts
                    && w[0].full_sync.is_some()
                    && w[0].full_sync == w[1].full_sync)
        }) && self.ranges.iter().all(|r| r.start_ts < r.end_ts)
    }
}
