//! Sync and storage tuning constants.
//!
//! Every threshold in this module is a hand-tuned calibration value carried
//! over from field experience, not a derived invariant. Tests may rely on
//! the relationships between values (for example that the bisection
//! threshold is smaller than the too-many-messages cap) but not on the
//! specific numbers, which are expected to be overridden by embedders.

use crate::date::{DAY_MS, TimestampMs, utc_date_ms};

/// Tuning knobs for folder storage and synchronization.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How many headers a freshly opened slice tries to display.
    pub initial_fill_size: usize,

    /// Day-window size of the very first sync of a folder.
    pub initial_sync_days: i64,

    /// Day-window size used when growing into unsynced territory.
    pub initial_sync_growth_days: i64,

    /// A remote search returning more identifiers than this triggers
    /// bisection instead of processing.
    pub bisect_at_n_messages: usize,

    /// Absolute cap on headers returned by unbounded range queries.
    pub too_many_messages: usize,

    /// Multiplier applied to the day window after a zero-yield sync step.
    pub time_scale_factor_on_no_messages: f64,

    /// Day-window ceilings keyed on how far in the past the window anchor
    /// already is: `(days_in_past_below, max_day_step)`, checked in order.
    /// Anchors beyond the last tier use `day_step_absolute_max`.
    pub day_step_ceilings: Vec<(i64, i64)>,

    /// Day-window ceiling for anchors older than every tier.
    pub day_step_absolute_max: i64,

    /// Maximum estimated byte size of a header or body block before it is
    /// split.
    pub max_block_size: u32,

    /// Share of bytes kept in the newer half when splitting the newest
    /// block. Small, because folders grow toward the future and we want the
    /// next insertions to have room.
    pub block_split_small_part: f64,

    /// Share kept in the newer half when splitting the oldest block.
    pub block_split_large_part: f64,

    /// Share kept in the newer half when splitting an interior block.
    pub block_split_equal_part: f64,

    /// No sync ever reaches further back than this.
    pub oldest_sync_date: TimestampMs,

    /// Accuracy-range staleness threshold when opening a slice.
    pub open_refresh_thresh_ms: i64,

    /// Accuracy-range staleness threshold when growing a slice.
    pub grow_refresh_thresh_ms: i64,

    /// Slop applied to local date-range lookups to absorb timezone skew
    /// between our timestamps and the server's quantized SEARCH dates.
    pub search_ambiguity_ms: i64,

    /// Folders at or under this total count are synced in their entirety
    /// when opened.
    pub sync_whole_folder_at_n_messages: u32,

    /// A purge pass is scheduled every time this many new body blocks have
    /// been allocated.
    pub block_purge_every_n_new_body_blocks: u32,

    /// Purging never touches data whose accuracy range was refreshed more
    /// recently than this.
    pub block_purge_only_after_unsynced_ms: i64,

    /// Hard cap on blocks per directory; exceeding it forces purging of
    /// additional already-stale data.
    pub block_purge_hard_max_block_limit: usize,

    /// Retention horizon for purge cut-point calculation.
    pub sync_range_ms: i64,

    /// Maximum attempts for a deferrable mutation operation before it is
    /// marked given-up.
    pub max_op_try_count: u32,

    /// Delay before deferred operations are replayed.
    pub op_defer_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_fill_size: 15,
            initial_sync_days: 3,
            initial_sync_growth_days: 1,
            bisect_at_n_messages: 50,
            too_many_messages: 2000,
            time_scale_factor_on_no_messages: 1.6,
            day_step_ceilings: vec![
                (180, 45),
                (365, 90),
                (730, 120),
                (1825, 180),
                (3650, 365),
            ],
            day_step_absolute_max: 730,
            max_block_size: 96 * 1024,
            block_split_small_part: 0.05,
            block_split_large_part: 0.95,
            block_split_equal_part: 0.5,
            oldest_sync_date: utc_date_ms(1990, 1, 1),
            open_refresh_thresh_ms: 10 * 60 * 1000,
            grow_refresh_thresh_ms: 60 * 60 * 1000,
            search_ambiguity_ms: DAY_MS,
            sync_whole_folder_at_n_messages: 40,
            block_purge_every_n_new_body_blocks: 4,
            block_purge_only_after_unsynced_ms: 14 * DAY_MS,
            block_purge_hard_max_block_limit: 256,
            sync_range_ms: 30 * DAY_MS,
            max_op_try_count: 3,
            op_defer_delay_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Ceiling for the sync day window given how many days in the past the
    /// window anchor currently sits.
    #[must_use]
    pub fn day_step_ceiling(&self, days_in_past: f64) -> i64 {
        for &(tier_days, ceiling) in &self.day_step_ceilings {
            #[allow(clippy::cast_precision_loss)]
            if days_in_past < tier_days as f64 {
                return ceiling;
            }
        }
        self.day_step_absolute_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceilings_pick_first_matching_tier() {
        let config = SyncConfig::default();
        assert_eq!(config.day_step_ceiling(10.0), 45);
        assert_eq!(config.day_step_ceiling(200.0), 90);
        assert_eq!(config.day_step_ceiling(400.0), 120);
        assert_eq!(config.day_step_ceiling(1000.0), 180);
        assert_eq!(config.day_step_ceiling(2000.0), 365);
        assert_eq!(config.day_step_ceiling(5000.0), 730);
    }

    #[test]
    fn defaults_are_internally_consistent() {
        let config = SyncConfig::default();
        assert!(config.bisect_at_n_messages < config.too_many_messages);
        assert!(config.time_scale_factor_on_no_messages > 1.0);
        assert!(config.block_split_small_part < config.block_split_equal_part);
        assert!(config.block_split_equal_part < config.block_split_large_part);
        assert!(config.oldest_sync_date < utc_date_ms(2000, 1, 1));
    }
}
