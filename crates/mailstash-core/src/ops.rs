//! The mutation operation queue.
//!
//! User mutations (tag changes, deletes, moves, downloads) apply locally
//! first so the UI sees them immediately, then replay against the remote
//! store. An operation's progress is tracked by three independent axes:
//! the user's desired end state ([`Lifecycle`]), how far the local apply
//! got ([`LocalStatus`]), and how far the server apply got
//! ([`ServerStatus`]). Retryable server failures re-queue with a delay up
//! to a try budget; exhaustion parks the operation in the designated
//! terminal gave-up state (lifecycle `Moot`, local `Unknown`, server
//! `Moot`) rather than leaving it ambiguous.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::folder::Folder;
use crate::persist::BlockPersist;
use crate::records::{BlockedRecord, BodyRecord, FolderId, HeaderRecord, MessageKey, Suid};
use crate::remote::RemoteFolder;

/// Stable operation identifier used for undo addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LongtermId(pub u64);

impl std::fmt::Display for LongtermId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// The user's desired end state for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Apply wanted.
    Do,
    /// Fully applied.
    Done,
    /// Rollback wanted.
    Undo,
    /// Fully rolled back.
    Undone,
    /// Given up or vanished target; terminal, never retried.
    Moot,
}

/// Progress of the local (block store) apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalStatus {
    /// Not started.
    None,
    /// Apply in progress.
    Doing,
    /// Applied.
    Done,
    /// Rollback in progress.
    Undoing,
    /// Rolled back.
    Undone,
    /// Ambiguous after a failure; paired with server `Moot` as the
    /// terminal gave-up state.
    Unknown,
}

/// Progress of the server (remote folder) apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Not started.
    None,
    /// State uncertain; must be verified before applying.
    Check,
    /// Verification in progress.
    Checking,
    /// Apply in progress.
    Doing,
    /// Applied.
    Done,
    /// Rollback in progress.
    Undoing,
    /// Rolled back.
    Undone,
    /// No server work will ever happen (given up, or nothing to do).
    Moot,
}

/// Whether a state triple is reachable by the queue's transitions.
///
/// The undo axes move together: a local rollback never starts while the
/// lifecycle still wants `Do`, and the gave-up state is exactly
/// `(Moot, Unknown, Moot)`.
#[must_use]
pub const fn state_is_valid(
    lifecycle: Lifecycle,
    local: LocalStatus,
    server: ServerStatus,
) -> bool {
    match lifecycle {
        Lifecycle::Do => matches!(
            (local, server),
            (LocalStatus::None | LocalStatus::Doing, ServerStatus::None)
                | (
                    LocalStatus::Done,
                    ServerStatus::None
                        | ServerStatus::Check
                        | ServerStatus::Checking
                        | ServerStatus::Doing
                )
        ),
        Lifecycle::Done => matches!(
            (local, server),
            (LocalStatus::Done, ServerStatus::Done | ServerStatus::Moot)
        ),
        Lifecycle::Undo => matches!(
            (local, server),
            (
                LocalStatus::Done,
                ServerStatus::None
                    | ServerStatus::Check
                    | ServerStatus::Done
                    | ServerStatus::Undoing
                    | ServerStatus::Undone
            ) | (LocalStatus::Undoing, ServerStatus::None | ServerStatus::Undone)
        ),
        Lifecycle::Undone => matches!(
            (local, server),
            (
                LocalStatus::Undone,
                ServerStatus::None | ServerStatus::Undone | ServerStatus::Moot
            )
        ),
        Lifecycle::Moot => matches!(
            (local, server),
            (LocalStatus::Unknown, ServerStatus::Moot)
        ),
    }
}

/// A message addressed by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpTarget {
    /// Folder the message lives in.
    pub folder: FolderId,
    /// The message's sort/lookup key.
    pub key: MessageKey,
}

impl OpTarget {
    /// The target's globally addressable name.
    #[must_use]
    pub const fn suid(&self) -> Suid {
        Suid {
            folder: self.folder,
            id: self.key.id,
        }
    }
}

/// What an operation does.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Add and remove flag strings on messages.
    ModifyTags {
        /// Affected messages.
        targets: Vec<OpTarget>,
        /// Flags to add.
        add: Vec<String>,
        /// Flags to remove.
        remove: Vec<String>,
    },
    /// Delete messages.
    Delete {
        /// Affected messages.
        targets: Vec<OpTarget>,
    },
    /// Move messages to another folder.
    Move {
        /// Affected messages.
        targets: Vec<OpTarget>,
        /// Destination folder.
        dest: FolderId,
    },
    /// Download one body part's content.
    Download {
        /// The message.
        target: OpTarget,
        /// Part reference within the body.
        part_ref: String,
    },
}

impl OpKind {
    const fn label(&self) -> &'static str {
        match self {
            Self::ModifyTags { .. } => "modify-tags",
            Self::Delete { .. } => "delete",
            Self::Move { .. } => "move",
            Self::Download { .. } => "download",
        }
    }

    /// Folder the server apply talks to.
    fn primary_folder(&self) -> Option<FolderId> {
        match self {
            Self::ModifyTags { targets, .. }
            | Self::Delete { targets }
            | Self::Move { targets, .. } => targets.first().map(|t| t.folder),
            Self::Download { target, .. } => Some(target.folder),
        }
    }
}

/// Terminal outcome delivered to completion watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// Applied locally and on the server.
    Done,
    /// Rolled back.
    Undone,
    /// Nothing to do; the target vanished or the undo never started.
    Moot,
    /// Retries exhausted or unrecoverable failure.
    GaveUp(String),
}

/// A record removed by a local apply, kept for undo.
#[derive(Debug, Clone)]
struct RemovedMessage {
    folder: FolderId,
    header: HeaderRecord,
    body: Option<BodyRecord>,
    /// Where the message went, for moves.
    moved_to: Option<OpTarget>,
}

/// One queued mutation job.
#[derive(Debug)]
pub struct Operation {
    /// Stable id for undo addressing.
    pub longterm_id: LongtermId,
    /// What the operation does.
    pub kind: OpKind,
    /// Desired end state.
    pub lifecycle: Lifecycle,
    /// Local apply progress.
    pub local_status: LocalStatus,
    /// Server apply progress.
    pub server_status: ServerStatus,
    /// Server attempts made so far.
    pub try_count: u32,
    /// Rollback data captured by the local apply.
    removed: Vec<RemovedMessage>,
    /// Server ids the server apply should address, captured locally.
    srvids: Vec<String>,
}

impl Operation {
    fn new(longterm_id: LongtermId, kind: OpKind) -> Self {
        Self {
            longterm_id,
            kind,
            lifecycle: Lifecycle::Do,
            local_status: LocalStatus::None,
            server_status: ServerStatus::None,
            try_count: 0,
            removed: Vec::new(),
            srvids: Vec::new(),
        }
    }

    fn set_state(&mut self, lifecycle: Lifecycle, local: LocalStatus, server: ServerStatus) {
        debug_assert!(
            state_is_valid(lifecycle, local, server),
            "invalid operation state {lifecycle:?}/{local:?}/{server:?}"
        );
        self.lifecycle = lifecycle;
        self.local_status = local;
        self.server_status = server;
    }

    fn give_up(&mut self) {
        self.set_state(Lifecycle::Moot, LocalStatus::Unknown, ServerStatus::Moot);
    }

    const fn is_terminal(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Done | Lifecycle::Undone | Lifecycle::Moot)
    }
}

/// One folder's storage paired with its remote counterpart.
struct Account<P, R> {
    folder: Arc<Folder<P>>,
    remote: Arc<R>,
}

/// The per-account operation queue.
pub struct OperationQueue<P, R> {
    accounts: HashMap<FolderId, Account<P, R>>,
    ops: HashMap<LongtermId, Operation>,
    /// Operations whose server apply is still pending, in enqueue order.
    server_queue: VecDeque<LongtermId>,
    watchers: HashMap<LongtermId, Vec<oneshot::Sender<OpOutcome>>>,
    config: SyncConfig,
    next_id: u64,
}

impl<P, R> std::fmt::Debug for OperationQueue<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("ops", &self.ops.len())
            .field("server_queue", &self.server_queue)
            .finish_non_exhaustive()
    }
}

impl<P: BlockPersist, R: RemoteFolder> OperationQueue<P, R> {
    /// Create a queue over the given folders and their remotes.
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        Self {
            accounts: HashMap::new(),
            ops: HashMap::new(),
            server_queue: VecDeque::new(),
            watchers: HashMap::new(),
            config,
            next_id: 1,
        }
    }

    /// Register a folder and its remote so operations can address it.
    pub fn register(&mut self, folder: Arc<Folder<P>>, remote: Arc<R>) {
        self.accounts
            .insert(folder.id(), Account { folder, remote });
    }

    /// A completion receiver for the given operation; resolves when the
    /// operation reaches a terminal state.
    pub fn completion(&mut self, id: LongtermId) -> oneshot::Receiver<OpOutcome> {
        let (tx, rx) = oneshot::channel();
        self.watchers.entry(id).or_default().push(tx);
        rx
    }

    /// Current state triple of an operation.
    #[must_use]
    pub fn state(&self, id: LongtermId) -> Option<(Lifecycle, LocalStatus, ServerStatus)> {
        self.ops
            .get(&id)
            .map(|op| (op.lifecycle, op.local_status, op.server_status))
    }

    fn resolve(&mut self, id: LongtermId, outcome: &OpOutcome) {
        debug!(op = %id, ?outcome, "operation resolved");
        for tx in self.watchers.remove(&id).unwrap_or_default() {
            // A dropped receiver is not our problem.
            let _ = tx.send(outcome.clone());
        }
    }

    /// Enqueue an operation: the local apply runs immediately (mutexed),
    /// the server apply is queued for [`Self::wait_for_drain`].
    ///
    /// # Errors
    ///
    /// Local-apply substrate failures; the operation is parked in the
    /// gave-up state and the error returned.
    pub async fn enqueue(&mut self, kind: OpKind) -> Result<LongtermId> {
        let id = LongtermId(self.next_id);
        self.next_id += 1;
        debug!(op = %id, kind = kind.label(), "operation enqueued");
        let mut op = Operation::new(id, kind);

        op.set_state(Lifecycle::Do, LocalStatus::Doing, ServerStatus::None);
        match self.local_apply(&mut op).await {
            Ok(()) => {
                op.set_state(Lifecycle::Do, LocalStatus::Done, ServerStatus::None);
                self.server_queue.push_back(id);
                self.ops.insert(id, op);
                Ok(id)
            }
            Err(e) => {
                warn!(op = %id, error = %e, "local apply failed");
                op.give_up();
                self.ops.insert(id, op);
                self.resolve(id, &OpOutcome::GaveUp(e.to_string()));
                Err(e)
            }
        }
    }

    /// Request rollback of an operation.
    ///
    /// A never-started operation is dropped; a locally applied one is
    /// rolled back locally; one already applied on the server gets a
    /// server rollback on the next drain. Undo of a terminal operation is
    /// accepted as a no-op.
    ///
    /// # Errors
    ///
    /// Local-undo substrate failures.
    pub async fn undo(&mut self, id: LongtermId) -> Result<()> {
        let Some(mut op) = self.ops.remove(&id) else {
            debug!(op = %id, "undo of unknown operation ignored");
            return Ok(());
        };
        if op.is_terminal() && op.lifecycle != Lifecycle::Done {
            // Already undone or mooted; silently accepted.
            self.ops.insert(id, op);
            return Ok(());
        }

        match op.server_status {
            ServerStatus::None => {
                // Never reached the server: local rollback suffices.
                self.server_queue.retain(|queued| *queued != id);
                if op.local_status == LocalStatus::Done {
                    op.set_state(Lifecycle::Undo, LocalStatus::Undoing, ServerStatus::None);
                    self.local_undo(&mut op).await?;
                }
                op.set_state(Lifecycle::Undone, LocalStatus::Undone, ServerStatus::None);
                self.ops.insert(id, op);
                self.resolve(id, &OpOutcome::Undone);
            }
            _ => {
                // Server work happened or is queued to be checked; the
                // rollback resolves relative to that attempt on drain.
                op.lifecycle = Lifecycle::Undo;
                if !self.server_queue.contains(&id) {
                    self.server_queue.push_back(id);
                }
                self.ops.insert(id, op);
            }
        }
        Ok(())
    }

    /// Run the server queue to completion, honoring retry delays.
    ///
    /// # Errors
    ///
    /// Substrate failures during local rollbacks; individual server
    /// failures resolve their operations instead of failing the drain.
    pub async fn wait_for_drain(&mut self) -> Result<()> {
        while let Some(id) = self.server_queue.pop_front() {
            let Some(mut op) = self.ops.remove(&id) else {
                continue;
            };
            let undo_wanted = op.lifecycle == Lifecycle::Undo;
            let result = if undo_wanted && op.server_status == ServerStatus::Done {
                op.set_state(Lifecycle::Undo, op.local_status, ServerStatus::Undoing);
                self.server_undo(&mut op).await
            } else if undo_wanted {
                // Undo requested before the server attempt started.
                if op.local_status == LocalStatus::Done {
                    op.set_state(Lifecycle::Undo, LocalStatus::Undoing, ServerStatus::None);
                    self.local_undo(&mut op).await?;
                }
                op.set_state(Lifecycle::Undone, LocalStatus::Undone, ServerStatus::None);
                self.ops.insert(id, op);
                self.resolve(id, &OpOutcome::Undone);
                continue;
            } else {
                // A deferred attempt may have half-landed on the server;
                // verify the targets still exist before replaying.
                let mut result = Ok(());
                if op.server_status == ServerStatus::Check && !op.srvids.is_empty() {
                    op.set_state(Lifecycle::Do, LocalStatus::Done, ServerStatus::Checking);
                    result = self.server_check(&op).await;
                }
                if result.is_ok() {
                    op.set_state(Lifecycle::Do, LocalStatus::Done, ServerStatus::Doing);
                    result = self.server_apply(&mut op).await;
                }
                result
            };

            match result {
                Ok(()) => {
                    if undo_wanted {
                        op.set_state(Lifecycle::Undo, op.local_status, ServerStatus::Undone);
                        if op.local_status == LocalStatus::Done {
                            op.set_state(
                                Lifecycle::Undo,
                                LocalStatus::Undoing,
                                ServerStatus::Undone,
                            );
                            self.local_undo(&mut op).await?;
                        }
                        op.set_state(
                            Lifecycle::Undone,
                            LocalStatus::Undone,
                            ServerStatus::Undone,
                        );
                        self.ops.insert(id, op);
                        self.resolve(id, &OpOutcome::Undone);
                    } else {
                        op.set_state(Lifecycle::Done, LocalStatus::Done, ServerStatus::Done);
                        self.ops.insert(id, op);
                        self.resolve(id, &OpOutcome::Done);
                    }
                }
                Err(Error::Moot(reason)) => {
                    // Success with no effect; the target is gone.
                    debug!(op = %id, reason, "server apply moot");
                    op.set_state(Lifecycle::Done, LocalStatus::Done, ServerStatus::Moot);
                    self.ops.insert(id, op);
                    self.resolve(id, &OpOutcome::Moot);
                }
                Err(e) if e.is_deferrable() => {
                    op.try_count += 1;
                    if op.try_count >= self.config.max_op_try_count {
                        warn!(op = %id, tries = op.try_count, "retries exhausted");
                        op.give_up();
                        self.ops.insert(id, op);
                        self.resolve(id, &OpOutcome::GaveUp(e.to_string()));
                    } else {
                        debug!(op = %id, tries = op.try_count, error = %e, "deferring");
                        // An interrupted undo replays against the Done it
                        // saw; an interrupted do is uncertain and must be
                        // re-verified on pickup.
                        let server = if undo_wanted {
                            ServerStatus::Done
                        } else {
                            ServerStatus::Check
                        };
                        op.set_state(op.lifecycle, op.local_status, server);
                        self.ops.insert(id, op);
                        self.server_queue.push_back(id);
                        tokio::time::sleep(Duration::from_millis(self.config.op_defer_delay_ms))
                            .await;
                    }
                }
                Err(e) => {
                    warn!(op = %id, error = %e, "server apply failed hard");
                    op.give_up();
                    self.ops.insert(id, op);
                    self.resolve(id, &OpOutcome::GaveUp(e.to_string()));
                }
            }
        }
        Ok(())
    }

    fn account(&self, folder: FolderId) -> Result<&Account<P, R>> {
        self.accounts
            .get(&folder)
            .ok_or_else(|| Error::GiveUp(format!("no account for folder {folder}")))
    }

    /// Verify that at least one server-side target of an uncertain
    /// operation still exists.
    async fn server_check(&self, op: &Operation) -> Result<()> {
        let Some(folder) = op.kind.primary_folder() else {
            return Ok(());
        };
        let account = self.account(folder)?;
        let present = account.remote.fetch_flags(&op.srvids).await?;
        if present.is_empty() {
            return Err(Error::Moot("no retry target exists any more".to_owned()));
        }
        Ok(())
    }

    async fn local_apply(&self, op: &mut Operation) -> Result<()> {
        match op.kind.clone() {
            OpKind::ModifyTags { targets, add, remove } => {
                for target in targets {
                    let account = self.account(target.folder)?;
                    let mut guard = account.folder.begin("op-modify-tags").await;
                    let persist = guard.persist();
                    let state = &mut *guard;
                    let updated = state
                        .store
                        .modify_header(persist, target.key, |h| {
                            h.flags.retain(|f| !remove.contains(f));
                            for flag in &add {
                                if !h.flags.contains(flag) {
                                    h.flags.push(flag.clone());
                                }
                            }
                        })
                        .await?;
                    if let Some(updated) = updated {
                        if let Some(srvid) = &updated.srvid {
                            op.srvids.push(srvid.clone());
                        }
                        state.slices.note_modified(&updated, None);
                    }
                    guard.commit().await?;
                }
                Ok(())
            }
            OpKind::Delete { targets } => {
                for target in targets {
                    let account = self.account(target.folder)?;
                    let mut guard = account.folder.begin("op-delete").await;
                    let persist = guard.persist();
                    let state = &mut *guard;
                    if let Some((header, body)) =
                        state.store.delete_message(persist, target.key).await?
                    {
                        if let Some(srvid) = &header.srvid {
                            op.srvids.push(srvid.clone());
                        }
                        state.slices.note_removed(target.key, None);
                        op.removed.push(RemovedMessage {
                            folder: target.folder,
                            header,
                            body,
                            moved_to: None,
                        });
                    }
                    guard.commit().await?;
                }
                Ok(())
            }
            OpKind::Move { targets, dest } => {
                for target in targets {
                    let source = self.account(target.folder)?;
                    let mut guard = source.folder.begin("op-move-out").await;
                    let persist = guard.persist();
                    let state = &mut *guard;
                    let removed = state.store.delete_message(persist, target.key).await?;
                    if removed.is_some() {
                        state.slices.note_removed(target.key, None);
                    }
                    guard.commit().await?;
                    let Some((header, body)) = removed else {
                        continue;
                    };
                    if let Some(srvid) = &header.srvid {
                        op.srvids.push(srvid.clone());
                    }

                    let dest_account = self.account(dest)?;
                    let mut guard = dest_account.folder.begin("op-move-in").await;
                    let persist = guard.persist();
                    let state = &mut *guard;
                    let new_id = state.store.issue_header_id();
                    let mut moved_header = header.clone();
                    moved_header.id = new_id;
                    let moved_key = moved_header.key();
                    state.store.add_header(persist, moved_header.clone()).await?;
                    if let Some(body) = &body {
                        let mut moved_body = body.clone();
                        moved_body.id = new_id;
                        state.store.add_body(persist, moved_body).await?;
                    }
                    state.slices.note_added(&moved_header, None);
                    guard.commit().await?;

                    op.removed.push(RemovedMessage {
                        folder: target.folder,
                        header,
                        body,
                        moved_to: Some(OpTarget {
                            folder: dest,
                            key: moved_key,
                        }),
                    });
                }
                Ok(())
            }
            // Downloads have no local side until the bytes arrive.
            OpKind::Download { .. } => Ok(()),
        }
    }

    async fn local_undo(&self, op: &mut Operation) -> Result<()> {
        match op.kind.clone() {
            OpKind::ModifyTags { targets, add, remove } => {
                for target in targets {
                    let account = self.account(target.folder)?;
                    let mut guard = account.folder.begin("op-undo-tags").await;
                    let persist = guard.persist();
                    let state = &mut *guard;
                    let updated = state
                        .store
                        .modify_header(persist, target.key, |h| {
                            h.flags.retain(|f| !add.contains(f));
                            for flag in &remove {
                                if !h.flags.contains(flag) {
                                    h.flags.push(flag.clone());
                                }
                            }
                        })
                        .await?;
                    if let Some(updated) = updated {
                        state.slices.note_modified(&updated, None);
                    }
                    guard.commit().await?;
                }
                Ok(())
            }
            OpKind::Delete { .. } | OpKind::Move { .. } => {
                for removed in std::mem::take(&mut op.removed) {
                    // For moves, first take the copy back out of the
                    // destination folder.
                    if let Some(moved_to) = removed.moved_to {
                        let dest = self.account(moved_to.folder)?;
                        let mut guard = dest.folder.begin("op-undo-move-out").await;
                        let persist = guard.persist();
                        let state = &mut *guard;
                        if state.store.delete_message(persist, moved_to.key).await?.is_some() {
                            state.slices.note_removed(moved_to.key, None);
                        }
                        guard.commit().await?;
                    }

                    let account = self.account(removed.folder)?;
                    let mut guard = account.folder.begin("op-undo-restore").await;
                    let persist = guard.persist();
                    let state = &mut *guard;
                    state.store.add_header(persist, removed.header.clone()).await?;
                    if let Some(body) = removed.body {
                        state.store.add_body(persist, body).await?;
                    }
                    state.slices.note_added(&removed.header, None);
                    guard.commit().await?;
                }
                Ok(())
            }
            OpKind::Download { target, .. } => {
                let account = self.account(target.folder)?;
                let mut guard = account.folder.begin("op-undo-download").await;
                let persist = guard.persist();
                let state = &mut *guard;
                state
                    .store
                    .modify_body(persist, target.key, |body| {
                        for part in body.attachments.iter_mut().chain(&mut body.related_parts) {
                            part.content = None;
                        }
                    })
                    .await?;
                guard.commit().await?;
                Ok(())
            }
        }
    }

    async fn server_apply(&self, op: &mut Operation) -> Result<()> {
        match op.kind.clone() {
            OpKind::ModifyTags { targets, add, remove } => {
                let Some(target) = targets.first() else {
                    return Ok(());
                };
                let account = self.account(target.folder)?;
                account.remote.store_flags(&op.srvids, &add, &remove).await
            }
            OpKind::Delete { targets } => {
                let Some(target) = targets.first() else {
                    return Ok(());
                };
                let account = self.account(target.folder)?;
                account.remote.delete_messages(&op.srvids).await
            }
            OpKind::Move { targets, dest } => {
                let Some(target) = targets.first() else {
                    return Ok(());
                };
                let account = self.account(target.folder)?;
                let mapping = account.remote.move_messages(&op.srvids, dest).await?;
                // Adopt the server's new names so the moved copies stay
                // addressable.
                let dest_account = self.account(dest)?;
                let mut guard = dest_account.folder.begin("op-move-rename").await;
                let persist = guard.persist();
                let state = &mut *guard;
                for removed in &op.removed {
                    let Some(moved_to) = removed.moved_to else {
                        continue;
                    };
                    let Some(old_srvid) = removed.header.srvid.as_deref() else {
                        continue;
                    };
                    if let Some((_, new_srvid)) =
                        mapping.iter().find(|(old, _)| old == old_srvid)
                    {
                        state
                            .store
                            .modify_header(persist, moved_to.key, |h| {
                                h.srvid = Some(new_srvid.clone());
                            })
                            .await?;
                    }
                }
                guard.commit().await?;
                op.srvids = mapping.into_iter().map(|(_, new)| new).collect();
                Ok(())
            }
            OpKind::Download { target, part_ref } => {
                let account = self.account(target.folder)?;
                let mut guard = account.folder.begin("op-download-lookup").await;
                let persist = guard.persist();
                let header = guard.store.header(persist, target.key).await;
                guard.abandon();
                let Some(srvid) = header?.and_then(|h| h.srvid) else {
                    return Err(Error::Moot(format!("message {} vanished", target.suid())));
                };

                let bytes = account.remote.fetch_body_part(&srvid, &part_ref).await?;

                let mut guard = account.folder.begin("op-download-store").await;
                let persist = guard.persist();
                let state = &mut *guard;
                state
                    .store
                    .modify_body(persist, target.key, |body| {
                        if let Some(part) = body
                            .attachments
                            .iter_mut()
                            .chain(&mut body.related_parts)
                            .find(|p| p.part_ref == part_ref)
                        {
                            part.content = Some(bytes.clone());
                        }
                    })
                    .await?;
                guard.commit().await
            }
        }
    }

    async fn server_undo(&self, op: &mut Operation) -> Result<()> {
        match op.kind.clone() {
            OpKind::ModifyTags { targets, add, remove } => {
                let Some(target) = targets.first() else {
                    return Ok(());
                };
                let account = self.account(target.folder)?;
                account.remote.store_flags(&op.srvids, &remove, &add).await
            }
            OpKind::Move { targets, dest } => {
                // Move the copies back from the destination.
                let Some(target) = targets.first() else {
                    return Ok(());
                };
                let dest_account = self.account(dest)?;
                dest_account
                    .remote
                    .move_messages(&op.srvids, target.folder)
                    .await?;
                Ok(())
            }
            OpKind::Delete { .. } => {
                // A server-side delete cannot be taken back.
                Err(Error::GiveUp("server delete is not undoable".to_owned()))
            }
            // Nothing server-side to undo for a download.
            OpKind::Download { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::{DAY_MS, now_ms};
    use crate::persist::MemoryPersist;
    use crate::remote::MemoryRemoteFolder;
    use crate::slice::RecordingSink;
    use crate::sync::SyncEngine;

    async fn synced_folder(
        messages: u64,
    ) -> (
        Arc<Folder<MemoryPersist>>,
        Arc<MemoryRemoteFolder>,
        Vec<OpTarget>,
    ) {
        let remote = Arc::new(MemoryRemoteFolder::new(0));
        let now = now_ms();
        for i in 0..messages {
            remote.deliver(
                now - 2 * DAY_MS + i64::try_from(i).unwrap() * 1000,
                "sender@example.com",
                &format!("message {i}"),
            );
        }
        let folder = Arc::new(
            Folder::open(
                FolderId(1),
                Arc::new(MemoryPersist::new()),
                Arc::new(RecordingSink::new()),
                SyncConfig::default(),
            )
            .await
            .unwrap(),
        );
        let engine = SyncEngine::new(folder.clone(), remote.clone());
        engine.open_slice(50).await.unwrap();

        let mut guard = folder.begin("collect-targets").await;
        let persist = guard.persist();
        let headers = guard
            .store
            .headers_before(persist, None, usize::MAX)
            .await
            .unwrap();
        let targets = headers
            .iter()
            .map(|h| OpTarget {
                folder: FolderId(1),
                key: h.key(),
            })
            .collect();
        guard.abandon();
        (folder, remote, targets)
    }

    async fn empty_folder(id: FolderId) -> Arc<Folder<MemoryPersist>> {
        Arc::new(
            Folder::open(
                id,
                Arc::new(MemoryPersist::new()),
                Arc::new(RecordingSink::new()),
                SyncConfig::default(),
            )
            .await
            .unwrap(),
        )
    }

    fn quick_config() -> SyncConfig {
        SyncConfig {
            op_defer_delay_ms: 1,
            ..SyncConfig::default()
        }
    }

    async fn flags_of(folder: &Folder<MemoryPersist>, target: OpTarget) -> Vec<String> {
        let mut guard = folder.begin("read-flags").await;
        let persist = guard.persist();
        let header = guard
            .store
            .header(persist, target.key)
            .await
            .unwrap()
            .unwrap();
        guard.abandon();
        header.flags
    }

    #[tokio::test]
    async fn modify_tags_applies_locally_then_on_server() {
        let (folder, remote, targets) = synced_folder(2).await;
        let mut queue = OperationQueue::new(quick_config());
        queue.register(folder.clone(), remote.clone());

        let id = queue
            .enqueue(OpKind::ModifyTags {
                targets: vec![targets[0]],
                add: vec!["\\Seen".into()],
                remove: vec![],
            })
            .await
            .unwrap();
        // Local apply is visible before any drain.
        assert_eq!(flags_of(&folder, targets[0]).await, vec!["\\Seen".to_owned()]);
        assert_eq!(
            queue.state(id),
            Some((Lifecycle::Do, LocalStatus::Done, ServerStatus::None))
        );

        let completion = queue.completion(id);
        queue.wait_for_drain().await.unwrap();
        assert_eq!(completion.await.unwrap(), OpOutcome::Done);
        assert_eq!(
            queue.state(id),
            Some((Lifecycle::Done, LocalStatus::Done, ServerStatus::Done))
        );
    }

    #[tokio::test]
    async fn undo_before_server_apply_drops_the_server_work() {
        let (folder, remote, targets) = synced_folder(1).await;
        let searches = remote.search_count();
        let mut queue = OperationQueue::new(quick_config());
        queue.register(folder.clone(), remote.clone());

        let id = queue
            .enqueue(OpKind::ModifyTags {
                targets: vec![targets[0]],
                add: vec!["\\Flagged".into()],
                remove: vec![],
            })
            .await
            .unwrap();
        queue.undo(id).await.unwrap();
        assert!(flags_of(&folder, targets[0]).await.is_empty());

        queue.wait_for_drain().await.unwrap();
        assert_eq!(
            queue.state(id),
            Some((Lifecycle::Undone, LocalStatus::Undone, ServerStatus::None))
        );
        // The remote never saw the flag.
        let flags = remote.fetch_flags(&["r1".to_owned()]).await.unwrap();
        assert_eq!(flags, vec![("r1".to_owned(), vec![])]);
        assert_eq!(remote.search_count(), searches);
    }

    #[tokio::test]
    async fn move_do_then_undo_restores_both_folders() {
        let (source, remote, targets) = synced_folder(3).await;
        let dest = empty_folder(FolderId(2)).await;
        let dest_remote = Arc::new(MemoryRemoteFolder::new(0));
        let mut queue = OperationQueue::new(quick_config());
        queue.register(source.clone(), remote.clone());
        queue.register(dest.clone(), dest_remote);

        let before: Vec<MessageKey> = targets.iter().map(|t| t.key).collect();
        let id = queue
            .enqueue(OpKind::Move {
                targets: vec![targets[1]],
                dest: FolderId(2),
            })
            .await
            .unwrap();

        {
            let guard = source.begin("inspect").await;
            assert_eq!(guard.store.known_count(), 2);
            guard.abandon();
            let guard = dest.begin("inspect").await;
            assert_eq!(guard.store.known_count(), 1);
            guard.abandon();
        }

        queue.undo(id).await.unwrap();
        queue.wait_for_drain().await.unwrap();

        let mut guard = source.begin("inspect").await;
        let persist = guard.persist();
        assert_eq!(guard.store.known_count(), 3);
        let after: Vec<MessageKey> = guard
            .store
            .headers_before(persist, None, usize::MAX)
            .await
            .unwrap()
            .iter()
            .map(BlockedRecord::key)
            .collect();
        guard.abandon();
        assert_eq!(after, before);
        let guard = dest.begin("inspect").await;
        assert_eq!(guard.store.known_count(), 0);
        guard.abandon();
    }

    #[tokio::test]
    async fn deferred_failures_retry_then_give_up() {
        let (folder, _remote, targets) = synced_folder(1).await;
        // A remote that always defers.
        #[derive(Debug)]
        struct DeferringRemote;
        impl RemoteFolder for DeferringRemote {
            fn tz_offset_ms(&self) -> i64 {
                0
            }
            async fn message_count(&self) -> Result<u32> {
                Err(Error::Defer("busy".into()))
            }
            async fn change_token(&self) -> Result<String> {
                Err(Error::Defer("busy".into()))
            }
            async fn search(
                &self,
                _since: Option<i64>,
                _before: Option<i64>,
            ) -> Result<Vec<String>> {
                Err(Error::Defer("busy".into()))
            }
            async fn fetch_headers(
                &self,
                _srvids: &[String],
            ) -> Result<Vec<crate::remote::RemoteHeader>> {
                Err(Error::Defer("busy".into()))
            }
            async fn fetch_flags(
                &self,
                _srvids: &[String],
            ) -> Result<Vec<(String, Vec<String>)>> {
                Err(Error::Defer("busy".into()))
            }
            async fn fetch_body(&self, _srvid: &str) -> Result<crate::remote::RemoteBody> {
                Err(Error::Defer("busy".into()))
            }
            async fn fetch_body_part(&self, _srvid: &str, _part_ref: &str) -> Result<Vec<u8>> {
                Err(Error::Defer("busy".into()))
            }
            async fn store_flags(
                &self,
                _srvids: &[String],
                _add: &[String],
                _remove: &[String],
            ) -> Result<()> {
                Err(Error::Defer("busy".into()))
            }
            async fn delete_messages(&self, _srvids: &[String]) -> Result<()> {
                Err(Error::Defer("busy".into()))
            }
            async fn move_messages(
                &self,
                _srvids: &[String],
                _dest: FolderId,
            ) -> Result<Vec<(String, String)>> {
                Err(Error::Defer("busy".into()))
            }
        }

        let mut queue = OperationQueue::new(quick_config());
        queue.register(folder, Arc::new(DeferringRemote));

        let id = queue
            .enqueue(OpKind::ModifyTags {
                targets: vec![targets[0]],
                add: vec!["\\Seen".into()],
                remove: vec![],
            })
            .await
            .unwrap();
        let completion = queue.completion(id);
        queue.wait_for_drain().await.unwrap();

        assert!(matches!(completion.await.unwrap(), OpOutcome::GaveUp(_)));
        // The designated terminal gave-up state.
        assert_eq!(
            queue.state(id),
            Some((Lifecycle::Moot, LocalStatus::Unknown, ServerStatus::Moot))
        );
    }

    #[tokio::test]
    async fn retry_after_deferral_verifies_targets_first() {
        use std::sync::atomic::{AtomicU32, Ordering};

        // A remote whose first flag store defers, leaving the server state
        // uncertain; the retry must check the targets before replaying.
        #[derive(Debug, Default)]
        struct FlakyRemote {
            store_calls: AtomicU32,
            check_calls: AtomicU32,
        }
        impl RemoteFolder for FlakyRemote {
            fn tz_offset_ms(&self) -> i64 {
                0
            }
            async fn message_count(&self) -> Result<u32> {
                Ok(1)
            }
            async fn change_token(&self) -> Result<String> {
                Ok("1".into())
            }
            async fn search(
                &self,
                _since: Option<i64>,
                _before: Option<i64>,
            ) -> Result<Vec<String>> {
                Ok(vec![])
            }
            async fn fetch_headers(
                &self,
                _srvids: &[String],
            ) -> Result<Vec<crate::remote::RemoteHeader>> {
                Ok(vec![])
            }
            async fn fetch_flags(
                &self,
                srvids: &[String],
            ) -> Result<Vec<(String, Vec<String>)>> {
                self.check_calls.fetch_add(1, Ordering::SeqCst);
                Ok(srvids.iter().map(|s| (s.clone(), vec![])).collect())
            }
            async fn fetch_body(&self, _srvid: &str) -> Result<crate::remote::RemoteBody> {
                Err(Error::GiveUp("unused".into()))
            }
            async fn fetch_body_part(&self, _srvid: &str, _part_ref: &str) -> Result<Vec<u8>> {
                Err(Error::GiveUp("unused".into()))
            }
            async fn store_flags(
                &self,
                _srvids: &[String],
                _add: &[String],
                _remove: &[String],
            ) -> Result<()> {
                if self.store_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Error::Defer("busy".into()));
                }
                Ok(())
            }
            async fn delete_messages(&self, _srvids: &[String]) -> Result<()> {
                Err(Error::GiveUp("unused".into()))
            }
            async fn move_messages(
                &self,
                _srvids: &[String],
                _dest: FolderId,
            ) -> Result<Vec<(String, String)>> {
                Err(Error::GiveUp("unused".into()))
            }
        }

        let (folder, _remote, targets) = synced_folder(1).await;
        let flaky = Arc::new(FlakyRemote::default());
        let mut queue = OperationQueue::new(quick_config());
        queue.register(folder, flaky.clone());

        let id = queue
            .enqueue(OpKind::ModifyTags {
                targets: vec![targets[0]],
                add: vec!["\\Seen".into()],
                remove: vec![],
            })
            .await
            .unwrap();
        let completion = queue.completion(id);
        queue.wait_for_drain().await.unwrap();

        assert_eq!(completion.await.unwrap(), OpOutcome::Done);
        // One verification between the two apply attempts.
        assert_eq!(flaky.check_calls.load(Ordering::SeqCst), 1);
        assert_eq!(flaky.store_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            queue.state(id),
            Some((Lifecycle::Done, LocalStatus::Done, ServerStatus::Done))
        );
    }

    #[tokio::test]
    async fn vanished_target_is_success_with_no_effect() {
        let (folder, remote, targets) = synced_folder(1).await;
        let mut queue = OperationQueue::new(quick_config());
        queue.register(folder.clone(), remote.clone());

        // The message vanishes before the download runs.
        let part_target = targets[0];
        {
            let mut guard = folder.begin("vanish").await;
            let persist = guard.persist();
            guard
                .store
                .delete_message(persist, part_target.key)
                .await
                .unwrap();
            guard.commit().await.unwrap();
        }

        let id = queue
            .enqueue(OpKind::Download {
                target: part_target,
                part_ref: "2.1".into(),
            })
            .await
            .unwrap();
        let completion = queue.completion(id);
        queue.wait_for_drain().await.unwrap();
        assert_eq!(completion.await.unwrap(), OpOutcome::Moot);
        assert_eq!(
            queue.state(id),
            Some((Lifecycle::Done, LocalStatus::Done, ServerStatus::Moot))
        );
    }

    #[test]
    fn transition_table_rejects_contradictory_states() {
        // The gave-up triple is the only valid Moot shape.
        assert!(state_is_valid(
            Lifecycle::Moot,
            LocalStatus::Unknown,
            ServerStatus::Moot
        ));
        assert!(!state_is_valid(
            Lifecycle::Moot,
            LocalStatus::Done,
            ServerStatus::Moot
        ));
        // A rollback cannot be in progress while the user still wants Do.
        assert!(!state_is_valid(
            Lifecycle::Do,
            LocalStatus::Undoing,
            ServerStatus::None
        ));
        // Undone lifecycle requires the local side to be rolled back.
        assert!(!state_is_valid(
            Lifecycle::Undone,
            LocalStatus::Done,
            ServerStatus::Undone
        ));
        // The happy path is valid at every stage.
        assert!(state_is_valid(
            Lifecycle::Do,
            LocalStatus::None,
            ServerStatus::None
        ));
        assert!(state_is_valid(
            Lifecycle::Do,
            LocalStatus::Done,
            ServerStatus::Doing
        ));
        assert!(state_is_valid(
            Lifecycle::Done,
            LocalStatus::Done,
            ServerStatus::Done
        ));
    }
}
