//! Date-range folder synchronization.
//!
//! A sync pass walks backwards through time in day windows, reconciling
//! each window's remote search results against local storage. Windows that
//! would return too many messages are bisected with a density-interpolated
//! day step; empty windows grow the step geometrically under tiered
//! ceilings so sparse history does not cost one search per day.
//!
//! Every processed window commits its deletions, additions, flag refreshes
//! and accuracy-range update as one batch; a window that fails commits
//! nothing and the pass surfaces the failure on the driving slice.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::accuracy::FullSync;
use crate::config::SyncConfig;
use crate::date::{
    TimestampMs, day_span, days_in_past, make_days_before, now_ms, quantize_to_server_midnight,
};
use crate::error::{Error, Result};
use crate::folder::{Folder, FolderState};
use crate::persist::BlockPersist;
use crate::records::{BlockedRecord, BodyRecord, HeaderRecord, MessageKey};
use crate::remote::{RemoteBody, RemoteFolder, RemoteHeader};
use crate::slice::{SliceId, SliceStatus};

/// Which way a slice grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowDirection {
    /// Toward older messages, below the slice's oldest held record.
    Past,
    /// Toward the present, above the slice's newest held record.
    Future,
}

/// Counters describing what a sync pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Messages fetched and stored.
    pub added: u32,
    /// Messages whose flags were refreshed.
    pub updated: u32,
    /// Messages deleted because the remote no longer has them.
    pub removed: u32,
    /// Windows processed.
    pub steps: u32,
    /// Windows shrunk instead of processed.
    pub bisections: u32,
}

impl SyncStats {
    fn absorb(&mut self, other: Self) {
        self.added += other.added;
        self.updated += other.updated;
        self.removed += other.removed;
        self.steps += other.steps;
        self.bisections += other.bisections;
    }
}

/// Drives synchronization of one folder against its remote counterpart.
#[derive(Debug)]
pub struct SyncEngine<P, R> {
    folder: Arc<Folder<P>>,
    remote: Arc<R>,
}

impl<P: BlockPersist, R: RemoteFolder> SyncEngine<P, R> {
    /// Pair a folder with its remote counterpart.
    #[must_use]
    pub const fn new(folder: Arc<Folder<P>>, remote: Arc<R>) -> Self {
        Self { folder, remote }
    }

    /// The folder this engine synchronizes.
    #[must_use]
    pub fn folder(&self) -> &Arc<Folder<P>> {
        &self.folder
    }

    /// Open a slice over the folder and bring it current.
    ///
    /// A folder with no local messages gets an initial sync; a small
    /// folder is synced in its entirety. Otherwise the slice fills from
    /// local storage and only touches the network when the covering
    /// accuracy ranges are staler than the open-refresh threshold.
    ///
    /// # Errors
    ///
    /// Remote or substrate failures; the slice is left in `SyncFailed`
    /// with whatever local data was delivered.
    pub async fn open_slice(&self, desired_size: usize) -> Result<SliceId> {
        let mut guard = self.folder.begin("open-slice").await;
        let config = guard.config.clone();
        let state = &mut *guard;
        let slice = state.slices.open(desired_size, &config);
        let desired = state.slices.desired_size(slice).unwrap_or(config.initial_fill_size);
        let known = state.store.known_count();
        guard.abandon();

        if known == 0 {
            return self.initial_sync(slice, desired, &config).await.map(|_| slice);
        }

        // Fill from local storage first; the consumer sees data
        // immediately even when a refresh follows.
        let oldest_shown = self.fill_local(slice, None, desired).await?;
        let now = now_ms();
        let refresh_from =
            oldest_shown.map_or_else(|| make_days_before(now, config.initial_sync_days), |k| k.date);

        let span = {
            let guard = self.folder.begin("open-refresh-check").await;
            let span = guard.accuracy.range_needing_refresh(
                refresh_from - config.search_ambiguity_ms,
                now,
                config.open_refresh_thresh_ms,
                now,
            );
            guard.abandon();
            span
        };

        match span {
            None => {
                self.broadcast(slice, SliceStatus::Synced).await;
                Ok(slice)
            }
            Some(_) => self
                .refresh_range(
                    slice,
                    refresh_from - config.search_ambiguity_ms,
                    now,
                    &config,
                    config.open_refresh_thresh_ms,
                )
                .await
                .map(|_| slice),
        }
    }

    /// Initial sync of a never-synced folder: start with a small window
    /// and deepen until the slice's fill target is met or the folder is
    /// known in full.
    async fn initial_sync(
        &self,
        slice: SliceId,
        desired: usize,
        config: &SyncConfig,
    ) -> Result<SyncStats> {
        let remote_total = match self.remote.message_count().await {
            Ok(n) => n,
            Err(e) => {
                self.fail(slice).await;
                return Err(e);
            }
        };
        // Small folders are synced completely, oldest history included.
        let desired = if remote_total <= config.sync_whole_folder_at_n_messages {
            usize::MAX
        } else {
            desired
        };

        self.set_accumulating(slice, true).await;
        let result = self
            .sync_span(
                slice,
                config.oldest_sync_date,
                None,
                desired,
                config.initial_sync_days,
                config,
            )
            .await;
        self.set_accumulating(slice, false).await;
        match result {
            Ok(stats) => {
                self.broadcast(slice, SliceStatus::Synced).await;
                Ok(stats)
            }
            Err(e) => {
                self.fail(slice).await;
                Err(e)
            }
        }
    }

    /// Grow a slice by its desired fill size in the given direction, from
    /// local storage when fresh coverage exists, otherwise by syncing the
    /// uncovered territory first.
    ///
    /// # Errors
    ///
    /// Remote or substrate failures; the slice reports `SyncFailed`.
    pub async fn grow_slice(&self, slice: SliceId, direction: GrowDirection) -> Result<SyncStats> {
        match direction {
            GrowDirection::Past => self.grow_past(slice).await,
            GrowDirection::Future => self.grow_future(slice).await,
        }
    }

    /// Downward growth: deepen below the oldest held record.
    async fn grow_past(&self, slice: SliceId) -> Result<SyncStats> {
        let (anchor, desired, config) = {
            let guard = self.folder.begin("grow-plan").await;
            let anchor = guard.slices.oldest_held(slice);
            let desired = guard
                .slices
                .desired_size(slice)
                .unwrap_or(guard.config.initial_fill_size);
            let config = guard.config.clone();
            guard.abandon();
            (anchor, desired, config)
        };
        let Some(anchor) = anchor else {
            // Nothing held yet; growing an empty slice is an initial sync.
            return self.initial_sync(slice, desired, &config).await;
        };

        // Local coverage check: enough already-stored headers below the
        // anchor, all inside coverage fresher than the grow threshold.
        let locally_satisfied = {
            let mut guard = self.folder.begin("grow-local-check").await;
            let persist = guard.persist();
            let state = &mut *guard;
            let locals = state
                .store
                .headers_before(persist, Some(anchor), desired)
                .await?;
            let satisfied = locals.len() >= desired
                && locals.last().is_some_and(|oldest| {
                    let now = now_ms();
                    state
                        .accuracy
                        .range_needing_refresh(
                            oldest.date,
                            anchor.date,
                            config.grow_refresh_thresh_ms,
                            now,
                        )
                        .is_none()
                });
            guard.abandon();
            satisfied
        };

        if locally_satisfied {
            self.fill_local(slice, Some(anchor), desired).await?;
            self.broadcast(slice, SliceStatus::Synced).await;
            return Ok(SyncStats::default());
        }

        self.broadcast(slice, SliceStatus::Synchronizing).await;
        // Accumulate while the sync runs; the fill below re-reads the
        // newly stored records and emits them as one positioned splice.
        self.set_accumulating(slice, true).await;
        let result = self
            .sync_span(
                slice,
                config.oldest_sync_date,
                Some(anchor.date),
                desired,
                config.initial_sync_growth_days,
                &config,
            )
            .await;
        match result {
            Ok(stats) => {
                self.fill_local(slice, Some(anchor), desired).await?;
                self.broadcast(slice, SliceStatus::Synced).await;
                Ok(stats)
            }
            Err(e) => {
                self.fail(slice).await;
                Err(e)
            }
        }
    }

    /// Upward growth: re-deliver newer local records when their coverage
    /// is fresh, otherwise refresh the span above the newest held record
    /// first. Folds the released-then-regrown case after a shrink.
    async fn grow_future(&self, slice: SliceId) -> Result<SyncStats> {
        let (anchor, desired, config) = {
            let guard = self.folder.begin("grow-up-plan").await;
            let anchor = guard.slices.newest_held(slice);
            let desired = guard
                .slices
                .desired_size(slice)
                .unwrap_or(guard.config.initial_fill_size);
            let config = guard.config.clone();
            guard.abandon();
            (anchor, desired, config)
        };
        let Some(anchor) = anchor else {
            return self.initial_sync(slice, desired, &config).await;
        };

        let now = now_ms();
        let span = {
            let guard = self.folder.begin("grow-up-check").await;
            let span = guard.accuracy.range_needing_refresh(
                anchor.date,
                now,
                config.grow_refresh_thresh_ms,
                now,
            );
            guard.abandon();
            span
        };
        let stats = match span {
            None => SyncStats::default(),
            Some(span) => {
                self.broadcast(slice, SliceStatus::Synchronizing).await;
                self.refresh_range(
                    slice,
                    span.start_ts,
                    now,
                    &config,
                    config.grow_refresh_thresh_ms,
                )
                .await?
            }
        };
        self.fill_local_newer(slice, anchor, desired).await?;
        self.broadcast(slice, SliceStatus::Synced).await;
        Ok(stats)
    }

    /// Release the records a slice holds outside the inclusive held-index
    /// range `[first, last]` (`None` keeps through the oldest), then drop
    /// cached blocks no remaining live window touches.
    pub async fn shrink_slice(&self, slice: SliceId, first: usize, last: Option<usize>) {
        let mut guard = self.folder.begin("slice-shrink").await;
        let state = &mut *guard;
        state.slices.request_shrink(slice, first, last);
        let evicted = state.store.flush_excess(&state.slices.live_windows());
        if evicted > 0 {
            debug!(slice = %slice, evicted, "shrink released cached blocks");
        }
        guard.abandon();
    }

    /// Refresh the span a slice displays, closing every stale or missing
    /// coverage gap.
    ///
    /// Fresh coverage costs no network calls at all.
    ///
    /// # Errors
    ///
    /// Remote or substrate failures; the slice reports `SyncFailed`.
    pub async fn refresh_slice(&self, slice: SliceId) -> Result<SyncStats> {
        let (oldest, config) = {
            let guard = self.folder.begin("refresh-plan").await;
            let oldest = guard.slices.oldest_held(slice);
            let config = guard.config.clone();
            guard.abandon();
            (oldest, config)
        };
        let now = now_ms();
        let from = oldest.map_or_else(
            || make_days_before(now, config.initial_sync_days),
            |k| k.date - config.search_ambiguity_ms,
        );
        self.refresh_range(slice, from, now, &config, config.open_refresh_thresh_ms)
            .await
    }

    /// Close all stale-coverage gaps in `[from, until)`, re-querying after
    /// each closed gap until the whole span is covered fresh. `thresh` is
    /// the staleness cutoff in milliseconds beyond which coverage counts
    /// as a gap.
    async fn refresh_range(
        &self,
        slice: SliceId,
        from: TimestampMs,
        until: TimestampMs,
        config: &SyncConfig,
        thresh: i64,
    ) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        loop {
            let now = now_ms();
            let span = {
                let guard = self.folder.begin("refresh-check").await;
                let span = guard.accuracy.range_needing_refresh(from, until, thresh, now);
                guard.abandon();
                span
            };
            let Some(span) = span else {
                self.broadcast(slice, SliceStatus::Synced).await;
                return Ok(stats);
            };
            trace!(slice = %slice, start = span.start_ts, end = span.end_ts, "refreshing gap");
            self.broadcast(slice, SliceStatus::Synchronizing).await;
            let step = day_span(span.start_ts, span.end_ts).max(1);
            match self
                .sync_span(slice, span.start_ts, Some(span.end_ts), usize::MAX, step, config)
                .await
            {
                Ok(s) => stats.absorb(s),
                Err(e) => {
                    self.fail(slice).await;
                    return Err(e);
                }
            }
        }
    }

    /// The step loop: walk `[target_since, before)` backwards in day
    /// windows until the span is covered, `desired` records have been
    /// seen, or the folder proves fully known.
    #[allow(clippy::too_many_lines)]
    async fn sync_span(
        &self,
        driving: SliceId,
        target_since: TimestampMs,
        before: Option<TimestampMs>,
        desired: usize,
        initial_day_step: i64,
        config: &SyncConfig,
    ) -> Result<SyncStats> {
        let remote_total = self.remote.message_count().await?;
        let token = FullSync {
            highest_modseq: self.remote.change_token().await?,
            updated: now_ms(),
        };
        let tz = self.remote.tz_offset_ms();
        let now = now_ms();
        let pass_anchor = before.unwrap_or(now);

        let mut stats = SyncStats::default();
        let mut seen = 0usize;
        let mut win_before = before;
        let mut day_step = initial_day_step.max(1);

        loop {
            let anchor = win_before.unwrap_or(now);
            let mut win_since =
                quantize_to_server_midnight(make_days_before(anchor, day_step), tz);
            win_since = win_since.max(target_since);
            let days = day_span(win_since, anchor).max(1);

            let srvids = self.remote.search(Some(win_since), win_before).await?;
            trace!(
                since = win_since,
                before = ?win_before,
                found = srvids.len(),
                day_step,
                "search window"
            );

            // Too dense to process at once: interpolate a smaller day step
            // from the observed density and retry. Only a window already
            // down to a day gets processed regardless.
            if srvids.len() > config.bisect_at_n_messages && days > 1 {
                stats.bisections += 1;
                #[allow(
                    clippy::cast_precision_loss,
                    clippy::cast_possible_truncation
                )]
                let interpolated = if days > 1000 {
                    30
                } else {
                    let shrink =
                        config.bisect_at_n_messages as f64 / (srvids.len() as f64 * 2.0);
                    (days as f64 * shrink).ceil() as i64
                };
                day_step = interpolated.clamp(1, (days - 2).max(1));
                debug!(found = srvids.len(), days, day_step, "bisecting window");
                continue;
            }

            // Process the window under the folder mutex; one atomic commit
            // covers the diff and the accuracy update together.
            let mut guard = self.folder.begin("sync-step").await;
            let persist = guard.persist();
            let state = &mut *guard;

            let outcome = self
                .process_window(state, persist, driving, win_since, win_before, &srvids)
                .await;
            let (step_stats, locals_seen) = match outcome {
                Ok(v) => v,
                Err(e) => {
                    // The step is treated as not-happened: nothing durable
                    // changed, the accuracy tracker was not touched.
                    guard.abandon();
                    return Err(e);
                }
            };
            stats.absorb(step_stats);
            seen += step_stats.added as usize + locals_seen;

            state
                .accuracy
                .mark_synced(win_since, win_before.unwrap_or(now), &token);

            // The folder is fully known when the remote's own count
            // matches ours and this window reached our oldest message.
            let mut done = false;
            if remote_total == state.store.known_count()
                && state.store.oldest_key().is_none_or(|k| k.date >= win_since)
            {
                state.accuracy.mark_synced_to_dawn_of_time(config.oldest_sync_date);
                done = true;
            }
            state.last_synced_at = Some(now_ms());

            #[allow(clippy::cast_precision_loss)]
            let progress = if pass_anchor > target_since {
                ((pass_anchor - win_since) as f64 / (pass_anchor - target_since) as f64).min(1.0)
            } else {
                1.0
            };
            state.slices.note_progress(driving, progress);
            guard.commit().await?;
            stats.steps += 1;

            self.maybe_purge().await?;

            if done || seen >= desired || win_since <= target_since {
                debug!(
                    ?stats,
                    seen,
                    done,
                    "sync pass complete"
                );
                return Ok(stats);
            }

            // Advance into older territory; a fruitless window grows the
            // step under the tiered ceilings.
            win_before = Some(win_since);
            if srvids.is_empty() {
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
                let grown =
                    (day_step as f64 * config.time_scale_factor_on_no_messages).ceil() as i64;
                let ceiling = config.day_step_ceiling(days_in_past(win_since, now));
                day_step = grown.min(ceiling).max(1);
            }
        }
    }

    /// Reconcile one window's remote search result against local storage.
    /// Returns the per-window stats and how many already-local messages
    /// the window covered.
    async fn process_window(
        &self,
        state: &mut FolderState,
        persist: &P,
        driving: SliceId,
        win_since: TimestampMs,
        win_before: Option<TimestampMs>,
        srvids: &[String],
    ) -> Result<(SyncStats, usize)> {
        let config = state.config.clone();
        let wide_since = win_since - config.search_ambiguity_ms;
        let wide_before = win_before.map(|b| b + config.search_ambiguity_ms);

        let locals = state
            .store
            .headers_in_range(persist, Some(wide_since), wide_before, config.too_many_messages)
            .await?;
        let remote_set: HashSet<&str> = srvids.iter().map(String::as_str).collect();
        let local_srvids: HashSet<&str> =
            locals.iter().filter_map(|h| h.srvid.as_deref()).collect();

        let mut stats = SyncStats::default();

        // Stage every remote fetch before the first store mutation. A
        // fetch failure then aborts the whole window with nothing applied,
        // so an abandoned step truly never happened.
        let new_srvids: Vec<String> = srvids
            .iter()
            .filter(|s| !local_srvids.contains(s.as_str()))
            .cloned()
            .collect();
        let mut staged_new = Vec::new();
        if !new_srvids.is_empty() {
            for remote_header in self.remote.fetch_headers(&new_srvids).await? {
                let body = self.fetch_body_staged(&remote_header.srvid).await?;
                staged_new.push((remote_header, body));
            }
        }

        let shared: Vec<String> = srvids
            .iter()
            .filter(|s| local_srvids.contains(s.as_str()))
            .cloned()
            .collect();
        let shared_flags = if shared.is_empty() {
            Vec::new()
        } else {
            self.remote.fetch_flags(&shared).await?
        };

        // Local messages the remote no longer reports, inside the strict
        // window, are deletions. Widened-edge locals are exempt: the
        // server's day quantization legitimately excludes them.
        let mut deletions = Vec::new();
        for local in &locals {
            let strict = local.date >= win_since
                && win_before.is_none_or(|b| local.date < b);
            if strict && local.srvid.as_deref().is_some_and(|s| !remote_set.contains(s)) {
                deletions.push(local.key());
            }
        }
        for key in deletions {
            if state.store.delete_message(persist, key).await?.is_some() {
                state.slices.note_removed(key, Some(driving));
                stats.removed += 1;
            }
        }

        for (remote_header, body) in staged_new {
            let header = self
                .store_new_message(state, persist, remote_header, body)
                .await?;
            state.slices.note_added(&header, Some(driving));
            stats.added += 1;
        }

        // Messages on both sides get a lightweight flag refresh.
        for (srvid, remote_flags) in shared_flags {
            let Some(local) = locals
                .iter()
                .find(|h| h.srvid.as_deref() == Some(srvid.as_str()))
            else {
                continue;
            };
            if local.flags != remote_flags {
                let updated = state
                    .store
                    .modify_header(persist, local.key(), |h| {
                        h.flags = remote_flags.clone();
                    })
                    .await?;
                if let Some(updated) = updated {
                    state.slices.note_modified(&updated, Some(driving));
                    stats.updated += 1;
                }
            }
        }

        Ok((stats, locals.len()))
    }

    /// Fetch a body for staging, tolerating messages that vanished between
    /// search and fetch; the orphaned header gets deleted by a later
    /// refresh.
    async fn fetch_body_staged(&self, srvid: &str) -> Result<Option<RemoteBody>> {
        match self.remote.fetch_body(srvid).await {
            Ok(body) => Ok(Some(body)),
            Err(Error::Moot(reason)) => {
                warn!(srvid, reason, "body fetch mooted");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Store a newly discovered message: header first, then its body.
    async fn store_new_message(
        &self,
        state: &mut FolderState,
        persist: &P,
        remote_header: RemoteHeader,
        body: Option<RemoteBody>,
    ) -> Result<HeaderRecord> {
        let id = state.store.issue_header_id();
        let header = HeaderRecord {
            id,
            srvid: Some(remote_header.srvid),
            date: remote_header.date,
            author: remote_header.author,
            subject: remote_header.subject,
            flags: remote_header.flags,
            snippet: remote_header.snippet,
            has_attachments: remote_header.has_attachments,
            body_size_estimate: body.as_ref().map_or(0, |b| b.size_estimate),
        };
        state.store.add_header(persist, header.clone()).await?;
        if let Some(body) = body {
            let record = BodyRecord {
                id,
                date: header.date,
                to: body.to,
                cc: body.cc,
                bcc: body.bcc,
                attachments: body.attachments,
                related_parts: body.related_parts,
                references: body.references,
                size_estimate: body.size_estimate.max(1),
                body_reps: body.body_reps,
            };
            state.store.add_body(persist, record).await?;
        }
        Ok(header)
    }

    /// Run a purge pass when enough body blocks have been allocated.
    async fn maybe_purge(&self) -> Result<()> {
        let mut guard = self.folder.begin("purge").await;
        let persist = guard.persist();
        let config = guard.config.clone();
        let state = &mut *guard;
        if !state.store.take_purge_due(&config) {
            guard.abandon();
            return Ok(());
        }
        let report = state
            .store
            .purge_excess(persist, &mut state.accuracy, &config, now_ms())
            .await?;
        if report.deleted == 0 {
            guard.abandon();
            return Ok(());
        }
        guard.commit().await
    }

    /// Deliver `limit` locally stored headers at or below `anchor` to the
    /// slice as one batch splice. Returns the oldest delivered key.
    async fn fill_local(
        &self,
        slice: SliceId,
        anchor: Option<MessageKey>,
        limit: usize,
    ) -> Result<Option<MessageKey>> {
        let mut guard = self.folder.begin("slice-fill").await;
        let persist = guard.persist();
        let state = &mut *guard;
        let headers = state.store.headers_before(persist, anchor, limit).await?;
        let oldest = headers.last().map(BlockedRecord::key);
        state.slices.begin_fill(slice);
        for header in &headers {
            state.slices.note_added(header, None);
        }
        state.slices.finish_fill(slice, false);
        guard.abandon();
        Ok(oldest)
    }

    /// Deliver up to `limit` locally stored headers strictly newer than
    /// `anchor` to the slice as one batch splice above the held records.
    async fn fill_local_newer(
        &self,
        slice: SliceId,
        anchor: MessageKey,
        limit: usize,
    ) -> Result<()> {
        let mut guard = self.folder.begin("slice-fill-up").await;
        let persist = guard.persist();
        let state = &mut *guard;
        let headers = state.store.headers_after(persist, anchor, limit).await?;
        state.slices.begin_fill(slice);
        for header in &headers {
            state.slices.note_added(header, None);
        }
        state.slices.finish_fill(slice, false);
        guard.abandon();
        Ok(())
    }

    async fn set_accumulating(&self, slice: SliceId, on: bool) {
        let mut guard = self.folder.begin("slice-fill-mode").await;
        if on {
            guard.slices.begin_fill(slice);
        } else {
            guard.slices.finish_fill(slice, false);
        }
        guard.abandon();
    }

    async fn broadcast(&self, slice: SliceId, status: SliceStatus) {
        let mut guard = self.folder.begin("slice-status").await;
        let state = &mut *guard;
        let newest = state.store.newest_key();
        let oldest = state.store.oldest_key();
        state.slices.set_status(
            slice,
            status,
            newest,
            oldest,
            &state.accuracy,
            &state.config,
            now_ms(),
        );
        guard.abandon();
    }

    async fn fail(&self, slice: SliceId) {
        self.set_accumulating(slice, false).await;
        self.broadcast(slice, SliceStatus::SyncFailed).await;
    }
}
