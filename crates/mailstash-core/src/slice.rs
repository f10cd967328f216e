//! Live slice views over a folder's header index.
//!
//! A slice is a windowed, ordered view a consumer opens over a folder; it
//! receives splice/update/remove notifications as sync and mutations change
//! the index underneath it. Slices never touch storage themselves; the
//! registry fans events out to them and reports their live windows back to
//! the cache eviction pass.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::accuracy::AccuracyTracker;
use crate::config::SyncConfig;
use crate::date::TimestampMs;
use crate::records::{BlockedRecord, HeaderRecord, MessageKey};

/// Identifier of a live slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceId(pub u64);

impl std::fmt::Display for SliceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slice synchronization status as surfaced to consumers.
///
/// `SyncFailed` is distinct from `Synced` so a consumer can show
/// stale-but-present data instead of blocking on the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    /// Freshly opened, nothing delivered yet.
    New,
    /// A sync or grow pass is running on the slice's behalf.
    Synchronizing,
    /// Contents are current as of the last pass.
    Synced,
    /// The last pass failed; contents are stale but valid.
    SyncFailed,
}

/// A notification delivered to the consumer side.
#[derive(Debug, Clone, PartialEq)]
pub enum SliceEvent {
    /// A contiguous range change: `removed` records vanished at `index`
    /// and `added` took their place. Bulk fills arrive as one splice.
    Splice {
        /// Receiving slice.
        slice: SliceId,
        /// Position of the change.
        index: usize,
        /// Number of records removed at that position.
        removed: usize,
        /// Records inserted, newest-first.
        added: Vec<HeaderRecord>,
        /// True when more changes from the same pass will follow.
        more_coming: bool,
    },
    /// One record was inserted.
    Added {
        /// Receiving slice.
        slice: SliceId,
        /// Insertion position.
        index: usize,
        /// The record.
        header: HeaderRecord,
    },
    /// One record changed in place (flags, snippet).
    Modified {
        /// Receiving slice.
        slice: SliceId,
        /// Position of the record.
        index: usize,
        /// The updated record.
        header: HeaderRecord,
    },
    /// One record was removed.
    Removed {
        /// Receiving slice.
        slice: SliceId,
        /// Position the record held.
        index: usize,
        /// Key of the removed record.
        key: MessageKey,
    },
    /// Status and edge-flag change.
    Status {
        /// Receiving slice.
        slice: SliceId,
        /// New status.
        status: SliceStatus,
        /// Newest held record is the folder's newest known.
        at_top: bool,
        /// Oldest held record is the folder's oldest known.
        at_bottom: bool,
        /// Unsynchronized remote territory may exist above.
        can_grow_upward: bool,
        /// Unsynchronized remote territory may exist below.
        can_grow_downward: bool,
    },
    /// Coarse progress of the pass driving this slice, in `0.0..=1.0`.
    Progress {
        /// Receiving slice.
        slice: SliceId,
        /// Progress value.
        value: f64,
    },
}

impl SliceEvent {
    fn slice(&self) -> SliceId {
        match self {
            Self::Splice { slice, .. }
            | Self::Added { slice, .. }
            | Self::Modified { slice, .. }
            | Self::Removed { slice, .. }
            | Self::Status { slice, .. }
            | Self::Progress { slice, .. } => *slice,
        }
    }
}

/// Consumer-side event receiver. Pure fan-out; implementations must not
/// call back into the engine.
pub trait NotificationSink: Send + Sync {
    /// Deliver one event.
    fn notify(&self, event: SliceEvent);
}

/// A recording sink for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<SliceEvent>>,
}

impl RecordingSink {
    /// Create an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events delivered so far.
    ///
    /// # Panics
    ///
    /// Panics on lock poisoning, which only a prior test panic causes.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn events(&self) -> Vec<SliceEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events delivered to one slice.
    #[must_use]
    pub fn events_for(&self, slice: SliceId) -> Vec<SliceEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.slice() == slice)
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    #[allow(clippy::unwrap_used)]
    fn notify(&self, event: SliceEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Debug)]
struct MailSlice {
    id: SliceId,
    desired_size: usize,
    /// Held headers, newest-first.
    headers: Vec<HeaderRecord>,
    status: SliceStatus,
    /// Bulk-fill mode: adds are buffered into one splice.
    accumulating: bool,
    accumulated: Vec<HeaderRecord>,
    /// Events held back while another slice drives a pass.
    deferred: Vec<SliceEvent>,
    at_top: bool,
    at_bottom: bool,
    can_grow_upward: bool,
    can_grow_downward: bool,
}

impl MailSlice {
    /// Key of the newest held record.
    fn newest(&self) -> Option<MessageKey> {
        self.headers.first().map(BlockedRecord::key)
    }

    /// Key of the oldest held record.
    fn oldest(&self) -> Option<MessageKey> {
        self.headers.last().map(BlockedRecord::key)
    }

    /// Whether an add with `key` belongs in this slice's window.
    fn accepts(&self, key: MessageKey) -> bool {
        if self.accumulating {
            return true;
        }
        match (self.newest(), self.oldest()) {
            (Some(newest), Some(oldest)) => {
                (oldest <= key && key <= newest)
                    || (key > newest && self.at_top)
                    || (key < oldest && self.at_bottom)
            }
            // An empty live slice only tracks the top of the folder.
            _ => self.at_top,
        }
    }

    /// Insertion index for `key`, maintaining descending `(date, id)`.
    fn insertion_index(&self, key: MessageKey) -> usize {
        self.headers.partition_point(|h| h.key() > key)
    }

    fn index_of(&self, key: MessageKey) -> Option<usize> {
        self.headers.iter().position(|h| h.key() == key)
    }
}

/// The set of live slices for one folder plus the event fan-out.
pub struct SliceRegistry {
    sink: Arc<dyn NotificationSink>,
    slices: Vec<MailSlice>,
    next_id: u64,
}

impl std::fmt::Debug for SliceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceRegistry")
            .field("slices", &self.slices)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl SliceRegistry {
    /// Create a registry delivering events to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            slices: Vec::new(),
            next_id: 1,
        }
    }

    /// Open a new slice. `desired_size` of 0 uses the configured initial
    /// fill size.
    pub fn open(&mut self, desired_size: usize, config: &SyncConfig) -> SliceId {
        let id = SliceId(self.next_id);
        self.next_id += 1;
        let desired_size = if desired_size == 0 {
            config.initial_fill_size
        } else {
            desired_size
        };
        debug!(slice = %id, desired_size, "slice opened");
        self.slices.push(MailSlice {
            id,
            desired_size,
            headers: Vec::new(),
            status: SliceStatus::New,
            accumulating: false,
            accumulated: Vec::new(),
            deferred: Vec::new(),
            at_top: true,
            at_bottom: false,
            can_grow_upward: false,
            can_grow_downward: true,
        });
        id
    }

    /// Close a slice. It stops receiving events immediately; buffered
    /// deferred events are discarded.
    pub fn die(&mut self, id: SliceId) {
        debug!(slice = %id, "slice died");
        self.slices.retain(|s| s.id != id);
    }

    /// Whether no live slices remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Desired fill size of a slice.
    #[must_use]
    pub fn desired_size(&self, id: SliceId) -> Option<usize> {
        self.slice(id).map(|s| s.desired_size)
    }

    /// Number of headers a slice currently holds.
    #[must_use]
    pub fn held_count(&self, id: SliceId) -> Option<usize> {
        self.slice(id).map(|s| s.headers.len())
    }

    /// Headers a slice currently holds, newest-first.
    #[must_use]
    pub fn headers(&self, id: SliceId) -> Option<&[HeaderRecord]> {
        self.slice(id).map(|s| s.headers.as_slice())
    }

    /// Current status of a slice.
    #[must_use]
    pub fn status(&self, id: SliceId) -> Option<SliceStatus> {
        self.slice(id).map(|s| s.status)
    }

    /// Key of the oldest record a slice holds.
    #[must_use]
    pub fn oldest_held(&self, id: SliceId) -> Option<MessageKey> {
        self.slice(id).and_then(MailSlice::oldest)
    }

    /// Key of the newest record a slice holds.
    #[must_use]
    pub fn newest_held(&self, id: SliceId) -> Option<MessageKey> {
        self.slice(id).and_then(MailSlice::newest)
    }

    /// The key windows of all live slices, for cache eviction.
    #[must_use]
    pub fn live_windows(&self) -> Vec<(MessageKey, MessageKey)> {
        self.slices
            .iter()
            .filter_map(|s| Some((s.oldest()?, s.newest()?)))
            .collect()
    }

    fn slice(&self, id: SliceId) -> Option<&MailSlice> {
        self.slices.iter().find(|s| s.id == id)
    }

    fn slice_mut(&mut self, id: SliceId) -> Option<&mut MailSlice> {
        self.slices.iter_mut().find(|s| s.id == id)
    }

    /// Deliver to the driving slice now, defer for passive slices. Status
    /// changes flush deferrals, keeping passive observers from seeing a
    /// pass's partial state interleaved.
    fn deliver(&mut self, event: SliceEvent, driving: Option<SliceId>) {
        let target = event.slice();
        if driving.is_none_or(|d| d == target) {
            self.sink.notify(event);
        } else if let Some(slice) = self.slice_mut(target) {
            trace!(slice = %target, "event deferred behind driving pass");
            slice.deferred.push(event);
        }
    }

    /// Enter bulk-fill mode on a slice: subsequent adds accumulate into a
    /// single splice emitted by [`Self::finish_fill`].
    pub fn begin_fill(&mut self, id: SliceId) {
        if let Some(slice) = self.slice_mut(id) {
            slice.accumulating = true;
            slice.accumulated.clear();
        }
    }

    /// Leave bulk-fill mode, emitting one batch splice positioned where
    /// the batch landed in the held list (0 for an initial fill, below the
    /// held records for a downward grow).
    pub fn finish_fill(&mut self, id: SliceId, more_coming: bool) {
        let Some(slice) = self.slice_mut(id) else {
            return;
        };
        slice.accumulating = false;
        let mut batch = std::mem::take(&mut slice.accumulated);
        batch.sort_by(|a, b| b.key().cmp(&a.key()));
        // Merge the batch into the held list in one ordered pass.
        let mut added = Vec::with_capacity(batch.len());
        let mut index = slice.headers.len();
        for header in batch {
            let key = header.key();
            if slice.index_of(key).is_none() {
                let at = slice.insertion_index(key);
                slice.headers.insert(at, header.clone());
                index = index.min(at);
                added.push(header);
            }
        }
        // Fill batches lie entirely above or entirely below the records
        // held before the fill, so one splice describes them.
        debug_assert!(
            slice.headers[index..index + added.len()]
                .iter()
                .zip(&added)
                .all(|(held, new)| held.key() == new.key()),
            "fill batch must be contiguous in the held list"
        );
        let event = SliceEvent::Splice {
            slice: id,
            index,
            removed: 0,
            added,
            more_coming,
        };
        self.deliver(event, None);
    }

    /// Trim a slice to the inclusive held-index range `[first, last]`,
    /// releasing the records outside it (`None` keeps through the oldest
    /// held record). The released key span stops counting as a live
    /// window, so cache eviction can reclaim its blocks; growth toward a
    /// released edge becomes available again.
    pub fn request_shrink(&mut self, id: SliceId, first: usize, last: Option<usize>) {
        let mut events = Vec::new();
        {
            let Some(slice) = self.slice_mut(id) else {
                return;
            };
            let held = slice.headers.len();
            if held == 0 {
                return;
            }
            let first = first.min(held - 1);
            let last = last.map_or(held - 1, |l| l.clamp(first, held - 1));

            let tail = held - 1 - last;
            if tail > 0 {
                slice.headers.truncate(last + 1);
                slice.at_bottom = false;
                slice.can_grow_downward = true;
                events.push(SliceEvent::Splice {
                    slice: id,
                    index: last + 1,
                    removed: tail,
                    added: Vec::new(),
                    more_coming: first > 0,
                });
            }
            if first > 0 {
                slice.headers.drain(..first);
                slice.at_top = false;
                slice.can_grow_upward = true;
                events.push(SliceEvent::Splice {
                    slice: id,
                    index: 0,
                    removed: first,
                    added: Vec::new(),
                    more_coming: false,
                });
            }
            if events.is_empty() {
                return;
            }
            debug!(slice = %id, kept = slice.headers.len(), "slice shrunk");
            events.push(SliceEvent::Status {
                slice: id,
                status: slice.status,
                at_top: slice.at_top,
                at_bottom: slice.at_bottom,
                can_grow_upward: slice.can_grow_upward,
                can_grow_downward: slice.can_grow_downward,
            });
        }
        for event in events {
            self.deliver(event, None);
        }
    }

    /// Fan out a header addition to every slice whose window accepts it.
    pub fn note_added(&mut self, header: &HeaderRecord, driving: Option<SliceId>) {
        let key = header.key();
        let targets: Vec<SliceId> = self
            .slices
            .iter()
            .filter(|s| s.accepts(key))
            .map(|s| s.id)
            .collect();
        for id in targets {
            let Some(slice) = self.slice_mut(id) else {
                continue;
            };
            if slice.accumulating {
                slice.accumulated.push(header.clone());
                continue;
            }
            if slice.index_of(key).is_some() {
                continue;
            }
            let index = slice.insertion_index(key);
            slice.headers.insert(index, header.clone());
            let event = SliceEvent::Added {
                slice: id,
                index,
                header: header.clone(),
            };
            self.deliver(event, driving);
        }
    }

    /// Fan out an in-place header modification.
    pub fn note_modified(&mut self, header: &HeaderRecord, driving: Option<SliceId>) {
        let key = header.key();
        let targets: Vec<(SliceId, usize)> = self
            .slices
            .iter()
            .filter_map(|s| Some((s.id, s.index_of(key)?)))
            .collect();
        for (id, index) in targets {
            if let Some(slice) = self.slice_mut(id) {
                slice.headers[index] = header.clone();
            }
            let event = SliceEvent::Modified {
                slice: id,
                index,
                header: header.clone(),
            };
            self.deliver(event, driving);
        }
    }

    /// Fan out a header removal.
    pub fn note_removed(&mut self, key: MessageKey, driving: Option<SliceId>) {
        let targets: Vec<(SliceId, usize)> = self
            .slices
            .iter()
            .filter_map(|s| Some((s.id, s.index_of(key)?)))
            .collect();
        for (id, index) in targets {
            if let Some(slice) = self.slice_mut(id) {
                slice.headers.remove(index);
            }
            let event = SliceEvent::Removed {
                slice: id,
                index,
                key,
            };
            self.deliver(event, driving);
        }
    }

    /// Report pass progress on the driving slice.
    pub fn note_progress(&mut self, id: SliceId, value: f64) {
        if self.slice(id).is_some() {
            self.sink.notify(SliceEvent::Progress { slice: id, value });
        }
    }

    /// Set a slice's status, recompute its edge flags against the folder's
    /// global extremes and accuracy coverage, and broadcast. Entering a
    /// terminal status flushes every slice's deferred events first.
    #[allow(clippy::too_many_arguments)]
    pub fn set_status(
        &mut self,
        id: SliceId,
        status: SliceStatus,
        folder_newest: Option<MessageKey>,
        folder_oldest: Option<MessageKey>,
        accuracy: &AccuracyTracker,
        config: &SyncConfig,
        now: TimestampMs,
    ) {
        if matches!(status, SliceStatus::Synced | SliceStatus::SyncFailed) {
            self.flush_deferred();
        }
        let Some(slice) = self.slice_mut(id) else {
            return;
        };
        slice.status = status;
        slice.at_top = slice.newest().is_some() && slice.newest() == folder_newest;
        slice.at_bottom = slice.oldest().is_some() && slice.oldest() == folder_oldest;
        slice.can_grow_upward = slice.at_top && !accuracy.synced_to_today(now);
        slice.can_grow_downward =
            !(slice.at_bottom && accuracy.synced_to_dawn_of_time(config.oldest_sync_date, now));
        let event = SliceEvent::Status {
            slice: id,
            status,
            at_top: slice.at_top,
            at_bottom: slice.at_bottom,
            can_grow_upward: slice.can_grow_upward,
            can_grow_downward: slice.can_grow_downward,
        };
        self.sink.notify(event);
    }

    fn flush_deferred(&mut self) {
        let mut pending = Vec::new();
        for slice in &mut self.slices {
            pending.append(&mut slice.deferred);
        }
        for event in pending {
            self.sink.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::DAY_MS;
    use crate::records::MessageId;

    fn header(id: u64, date: i64) -> HeaderRecord {
        HeaderRecord {
            id: MessageId(id),
            srvid: None,
            date,
            author: "a@example.com".into(),
            subject: format!("m{id}"),
            flags: vec![],
            snippet: String::new(),
            has_attachments: false,
            body_size_estimate: 0,
        }
    }

    fn registry() -> (SliceRegistry, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (SliceRegistry::new(sink.clone()), sink)
    }

    fn set_synced(registry: &mut SliceRegistry, id: SliceId) {
        let accuracy = AccuracyTracker::new();
        registry.set_status(
            id,
            SliceStatus::Synced,
            None,
            None,
            &accuracy,
            &SyncConfig::default(),
            0,
        );
    }

    #[test]
    fn adds_keep_descending_order() {
        let (mut registry, _sink) = registry();
        let id = registry.open(10, &SyncConfig::default());
        for (mid, date) in [(2, 200), (1, 100), (3, 300)] {
            registry.note_added(&header(mid, date), None);
        }
        let dates: Vec<i64> = registry.headers(id).unwrap().iter().map(|h| h.date).collect();
        assert_eq!(dates, vec![300, 200, 100]);
    }

    #[test]
    fn accumulating_fill_emits_one_splice() {
        let (mut registry, sink) = registry();
        let id = registry.open(10, &SyncConfig::default());
        registry.begin_fill(id);
        for mid in 1..=5u64 {
            registry.note_added(&header(mid, i64::try_from(mid).unwrap() * DAY_MS), None);
        }
        assert!(sink.events().is_empty(), "adds buffered during fill");
        registry.finish_fill(id, false);

        let events = sink.events_for(id);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SliceEvent::Splice { added, removed, more_coming, .. } => {
                assert_eq!(added.len(), 5);
                assert_eq!(*removed, 0);
                assert!(!more_coming);
                assert!(added.windows(2).all(|w| w[0].key() > w[1].key()));
            }
            other => panic!("expected a splice, got {other:?}"),
        }
    }

    #[test]
    fn batch_fill_splices_at_the_insertion_position() {
        let (mut registry, sink) = registry();
        let id = registry.open(10, &SyncConfig::default());
        registry.note_added(&header(1, 2000), None);

        // A later fill delivering only older records lands below the held
        // record, and the splice must say so.
        registry.begin_fill(id);
        registry.note_added(&header(2, 500), None);
        registry.finish_fill(id, false);

        let dates: Vec<i64> = registry.headers(id).unwrap().iter().map(|h| h.date).collect();
        assert_eq!(dates, vec![2000, 500]);
        match sink.events_for(id).last() {
            Some(SliceEvent::Splice { index, removed, added, .. }) => {
                assert_eq!(*index, 1);
                assert_eq!(*removed, 0);
                assert_eq!(added.len(), 1);
            }
            other => panic!("expected a splice, got {other:?}"),
        }
    }

    #[test]
    fn shrink_releases_both_edges_and_reopens_growth() {
        let (mut registry, sink) = registry();
        let id = registry.open(10, &SyncConfig::default());
        for mid in 1..=5u64 {
            registry.note_added(&header(mid, i64::try_from(mid).unwrap() * 100), None);
        }
        // Held newest-first: 500, 400, 300, 200, 100. Keep indices 1..=3.
        registry.request_shrink(id, 1, Some(3));

        let dates: Vec<i64> = registry.headers(id).unwrap().iter().map(|h| h.date).collect();
        assert_eq!(dates, vec![400, 300, 200]);

        let events = sink.events_for(id);
        let tail = &events[events.len() - 3];
        let head = &events[events.len() - 2];
        assert!(matches!(
            tail,
            SliceEvent::Splice { index: 4, removed: 1, more_coming: true, .. }
        ));
        assert!(matches!(
            head,
            SliceEvent::Splice { index: 0, removed: 1, more_coming: false, .. }
        ));
        match events.last() {
            Some(SliceEvent::Status {
                at_top,
                at_bottom,
                can_grow_upward,
                can_grow_downward,
                ..
            }) => {
                assert!(!*at_top && !*at_bottom);
                assert!(*can_grow_upward && *can_grow_downward);
            }
            other => panic!("expected a status, got {other:?}"),
        }
        assert_eq!(
            registry.live_windows(),
            vec![(
                MessageKey::new(200, MessageId(2)),
                MessageKey::new(400, MessageId(4))
            )]
        );
    }

    #[test]
    fn shrink_of_an_empty_slice_is_ignored() {
        let (mut registry, sink) = registry();
        let id = registry.open(10, &SyncConfig::default());
        registry.request_shrink(id, 0, None);
        registry.note_added(&header(1, 100), None);
        registry.request_shrink(id, 0, None);
        // Nothing trimmed: no splice beyond the single add.
        assert_eq!(sink.events_for(id).len(), 1);
        assert_eq!(registry.held_count(id), Some(1));
    }

    #[test]
    fn passive_slices_see_events_only_after_status_change() {
        let (mut registry, sink) = registry();
        let driving = registry.open(10, &SyncConfig::default());
        let passive = registry.open(10, &SyncConfig::default());

        registry.note_added(&header(1, DAY_MS), Some(driving));
        assert_eq!(sink.events_for(driving).len(), 1);
        assert!(sink.events_for(passive).is_empty(), "passive deferred");

        set_synced(&mut registry, driving);
        let passive_events = sink.events_for(passive);
        assert_eq!(passive_events.len(), 1);
        assert!(matches!(passive_events[0], SliceEvent::Added { .. }));
    }

    #[test]
    fn removal_and_modification_report_positions() {
        let (mut registry, sink) = registry();
        let id = registry.open(10, &SyncConfig::default());
        for mid in 1..=3u64 {
            registry.note_added(&header(mid, i64::try_from(mid).unwrap() * 100), None);
        }
        let mut updated = header(2, 200);
        updated.flags.push("\\Seen".into());
        registry.note_modified(&updated, None);
        registry.note_removed(MessageKey::new(300, MessageId(3)), None);

        let events = sink.events_for(id);
        assert!(matches!(events[3], SliceEvent::Modified { index: 1, .. }));
        assert!(matches!(events[4], SliceEvent::Removed { index: 0, .. }));
        assert_eq!(registry.held_count(id), Some(2));
    }

    #[test]
    fn dead_slice_receives_nothing() {
        let (mut registry, sink) = registry();
        let id = registry.open(10, &SyncConfig::default());
        registry.die(id);
        registry.note_added(&header(1, DAY_MS), None);
        assert!(sink.events().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn out_of_window_adds_are_ignored() {
        let (mut registry, _sink) = registry();
        let id = registry.open(10, &SyncConfig::default());
        registry.note_added(&header(5, 500), None);
        // The slice is at the top, so newer records are welcome.
        registry.note_added(&header(6, 600), None);
        // Older than the window with at_bottom unset: ignored.
        registry.note_added(&header(1, 100), None);
        assert_eq!(registry.held_count(id), Some(2));
    }

    #[test]
    fn live_windows_report_held_bounds() {
        let (mut registry, _sink) = registry();
        let _id = registry.open(10, &SyncConfig::default());
        registry.note_added(&header(1, 100), None);
        registry.note_added(&header(2, 200), None);
        assert_eq!(
            registry.live_windows(),
            vec![(
                MessageKey::new(100, MessageId(1)),
                MessageKey::new(200, MessageId(2))
            )]
        );
    }
}
