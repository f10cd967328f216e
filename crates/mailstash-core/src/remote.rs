//! The remote mail store collaborator.
//!
//! The engine never speaks a wire protocol; it drives an abstract
//! [`RemoteFolder`] capability. Date-range searches use the IMAP
//! convention: `since` inclusive, `before` exclusive, both interpreted in
//! the server's local day (callers quantize using [`tz_offset_ms`]).
//!
//! [`tz_offset_ms`]: RemoteFolder::tz_offset_ms

use std::collections::HashMap;
use std::sync::Mutex;

use crate::date::{TimestampMs, in_date_range};
use crate::error::{Error, Result};
use crate::records::{BodyRep, FolderId, PartInfo};

/// Header-level data as reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHeader {
    /// Server-assigned identifier, stable per message.
    pub srvid: String,
    /// Received date in milliseconds.
    pub date: TimestampMs,
    /// Display author.
    pub author: String,
    /// Subject line.
    pub subject: String,
    /// Flag strings.
    pub flags: Vec<String>,
    /// Short body preview.
    pub snippet: String,
    /// Whether any attachment exists.
    pub has_attachments: bool,
}

/// Body-level data as reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteBody {
    /// To recipients.
    pub to: Vec<String>,
    /// Cc recipients.
    pub cc: Vec<String>,
    /// Bcc recipients.
    pub bcc: Vec<String>,
    /// Attachment descriptors (content not downloaded).
    pub attachments: Vec<PartInfo>,
    /// Inline related parts.
    pub related_parts: Vec<PartInfo>,
    /// Message-id references for threading.
    pub references: Vec<String>,
    /// Estimated serialized size in bytes.
    pub size_estimate: u32,
    /// Ordered body representations.
    pub body_reps: Vec<BodyRep>,
}

/// Abstract remote folder capability.
///
/// Implementations map failures onto the engine's taxonomy: connection
/// loss is [`Error::Aborted`] (the step is treated as not-happened),
/// transient unavailability is [`Error::Defer`], a vanished target is
/// [`Error::Moot`], and anything unrecoverable is [`Error::GiveUp`].
#[allow(async_fn_in_trait)]
pub trait RemoteFolder: Send + Sync {
    /// The server's timezone offset from UTC in milliseconds, used to
    /// quantize date-range bounds to the server's midnight.
    fn tz_offset_ms(&self) -> i64;

    /// Total message count the folder reports.
    ///
    /// # Errors
    ///
    /// Per the trait-level failure taxonomy.
    async fn message_count(&self) -> Result<u32>;

    /// Highest remote change token currently advertised; opaque to us.
    ///
    /// # Errors
    ///
    /// Per the trait-level failure taxonomy.
    async fn change_token(&self) -> Result<String>;

    /// Server ids of non-deleted messages in `[since, before)`; either
    /// bound may be open.
    ///
    /// # Errors
    ///
    /// Per the trait-level failure taxonomy.
    async fn search(
        &self,
        since: Option<TimestampMs>,
        before: Option<TimestampMs>,
    ) -> Result<Vec<String>>;

    /// Fetch header data for the given server ids. Ids the server no
    /// longer knows are silently absent from the result.
    ///
    /// # Errors
    ///
    /// Per the trait-level failure taxonomy.
    async fn fetch_headers(&self, srvids: &[String]) -> Result<Vec<RemoteHeader>>;

    /// Fetch current flags for the given server ids, as `(srvid, flags)`
    /// pairs; vanished ids are absent.
    ///
    /// # Errors
    ///
    /// Per the trait-level failure taxonomy.
    async fn fetch_flags(&self, srvids: &[String]) -> Result<Vec<(String, Vec<String>)>>;

    /// Fetch body data for one message.
    ///
    /// # Errors
    ///
    /// [`Error::Moot`] when the message vanished; otherwise per the
    /// trait-level taxonomy.
    async fn fetch_body(&self, srvid: &str) -> Result<RemoteBody>;

    /// Download one body part's content.
    ///
    /// # Errors
    ///
    /// [`Error::Moot`] when the message or part vanished; otherwise per
    /// the trait-level taxonomy.
    async fn fetch_body_part(&self, srvid: &str, part_ref: &str) -> Result<Vec<u8>>;

    /// Add and remove flags on the given messages.
    ///
    /// # Errors
    ///
    /// Per the trait-level failure taxonomy.
    async fn store_flags(&self, srvids: &[String], add: &[String], remove: &[String])
    -> Result<()>;

    /// Delete the given messages server-side.
    ///
    /// # Errors
    ///
    /// Per the trait-level failure taxonomy.
    async fn delete_messages(&self, srvids: &[String]) -> Result<()>;

    /// Move the given messages to another folder; returns `(old srvid,
    /// new srvid)` pairs so that undo can address the moved copies.
    ///
    /// # Errors
    ///
    /// Per the trait-level failure taxonomy.
    async fn move_messages(
        &self,
        srvids: &[String],
        dest: FolderId,
    ) -> Result<Vec<(String, String)>>;
}

/// One message held by the in-memory remote double.
#[derive(Debug, Clone)]
pub struct MemoryRemoteMessage {
    /// Header-level data.
    pub header: RemoteHeader,
    /// Body-level data.
    pub body: RemoteBody,
}

#[derive(Debug, Default)]
struct MemoryRemoteInner {
    messages: Vec<MemoryRemoteMessage>,
    moved: HashMap<FolderId, Vec<MemoryRemoteMessage>>,
    change_token: u64,
    next_srvid: u64,
    search_calls: u64,
    /// Errors injected ahead of the next search calls, consumed in order.
    search_failures: Vec<Error>,
    /// Errors injected ahead of the next header fetches, consumed in order.
    fetch_failures: Vec<Error>,
}

/// In-memory remote folder for tests: a scriptable message list with
/// failure injection and call counting.
#[derive(Debug, Default)]
pub struct MemoryRemoteFolder {
    tz_offset_ms: i64,
    inner: Mutex<MemoryRemoteInner>,
}

impl MemoryRemoteFolder {
    /// Create an empty remote folder with the given timezone offset.
    #[must_use]
    pub fn new(tz_offset_ms: i64) -> Self {
        Self {
            tz_offset_ms,
            inner: Mutex::default(),
        }
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryRemoteInner> {
        // Poisoning only happens if a test already panicked.
        self.inner.lock().unwrap()
    }

    /// Add a message with an auto-assigned server id; returns the id.
    pub fn deliver(&self, date: TimestampMs, author: &str, subject: &str) -> String {
        let mut inner = self.lock();
        inner.next_srvid += 1;
        inner.change_token += 1;
        let srvid = format!("r{}", inner.next_srvid);
        inner.messages.push(MemoryRemoteMessage {
            header: RemoteHeader {
                srvid: srvid.clone(),
                date,
                author: author.to_owned(),
                subject: subject.to_owned(),
                flags: Vec::new(),
                snippet: String::new(),
                has_attachments: false,
            },
            body: RemoteBody {
                to: vec!["us@example.com".to_owned()],
                size_estimate: 1024,
                body_reps: vec![BodyRep::PlainChunks(vec![subject.to_owned()])],
                ..RemoteBody::default()
            },
        });
        srvid
    }

    /// Remove a message server-side (as if another client deleted it).
    pub fn expunge(&self, srvid: &str) {
        let mut inner = self.lock();
        inner.change_token += 1;
        inner.messages.retain(|m| m.header.srvid != srvid);
    }

    /// Set a message's flags server-side.
    pub fn set_flags(&self, srvid: &str, flags: &[&str]) {
        let mut inner = self.lock();
        inner.change_token += 1;
        if let Some(message) = inner.messages.iter_mut().find(|m| m.header.srvid == srvid) {
            message.header.flags = flags.iter().map(|&f| f.to_owned()).collect();
        }
    }

    /// Queue an error to be returned by the next search call.
    pub fn fail_next_search(&self, error: Error) {
        self.lock().search_failures.push(error);
    }

    /// Queue an error to be returned by the next header fetch.
    pub fn fail_next_fetch_headers(&self, error: Error) {
        self.lock().fetch_failures.push(error);
    }

    /// Number of search calls served so far.
    #[must_use]
    pub fn search_count(&self) -> u64 {
        self.lock().search_calls
    }

    /// Messages that have been moved into `dest`, in move order.
    #[must_use]
    pub fn moved_into(&self, dest: FolderId) -> Vec<MemoryRemoteMessage> {
        self.lock().moved.get(&dest).cloned().unwrap_or_default()
    }
}

impl RemoteFolder for MemoryRemoteFolder {
    fn tz_offset_ms(&self) -> i64 {
        self.tz_offset_ms
    }

    async fn message_count(&self) -> Result<u32> {
        Ok(u32::try_from(self.lock().messages.len()).unwrap_or(u32::MAX))
    }

    async fn change_token(&self) -> Result<String> {
        Ok(self.lock().change_token.to_string())
    }

    async fn search(
        &self,
        since: Option<TimestampMs>,
        before: Option<TimestampMs>,
    ) -> Result<Vec<String>> {
        let mut inner = self.lock();
        inner.search_calls += 1;
        if !inner.search_failures.is_empty() {
            return Err(inner.search_failures.remove(0));
        }
        Ok(inner
            .messages
            .iter()
            .filter(|m| in_date_range(m.header.date, since, before))
            .map(|m| m.header.srvid.clone())
            .collect())
    }

    async fn fetch_headers(&self, srvids: &[String]) -> Result<Vec<RemoteHeader>> {
        let mut inner = self.lock();
        if !inner.fetch_failures.is_empty() {
            return Err(inner.fetch_failures.remove(0));
        }
        Ok(inner
            .messages
            .iter()
            .filter(|m| srvids.contains(&m.header.srvid))
            .map(|m| m.header.clone())
            .collect())
    }

    async fn fetch_flags(&self, srvids: &[String]) -> Result<Vec<(String, Vec<String>)>> {
        let inner = self.lock();
        Ok(inner
            .messages
            .iter()
            .filter(|m| srvids.contains(&m.header.srvid))
            .map(|m| (m.header.srvid.clone(), m.header.flags.clone()))
            .collect())
    }

    async fn fetch_body(&self, srvid: &str) -> Result<RemoteBody> {
        let inner = self.lock();
        inner
            .messages
            .iter()
            .find(|m| m.header.srvid == srvid)
            .map(|m| m.body.clone())
            .ok_or_else(|| Error::Moot(format!("message {srvid} vanished")))
    }

    async fn fetch_body_part(&self, srvid: &str, part_ref: &str) -> Result<Vec<u8>> {
        let inner = self.lock();
        let message = inner
            .messages
            .iter()
            .find(|m| m.header.srvid == srvid)
            .ok_or_else(|| Error::Moot(format!("message {srvid} vanished")))?;
        message
            .body
            .attachments
            .iter()
            .chain(&message.body.related_parts)
            .find(|p| p.part_ref == part_ref)
            .map(|p| {
                p.content
                    .clone()
                    .unwrap_or_else(|| format!("content of {part_ref}").into_bytes())
            })
            .ok_or_else(|| Error::Moot(format!("part {part_ref} of {srvid} vanished")))
    }

    async fn store_flags(
        &self,
        srvids: &[String],
        add: &[String],
        remove: &[String],
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.change_token += 1;
        for message in &mut inner.messages {
            if srvids.contains(&message.header.srvid) {
                message.header.flags.retain(|f| !remove.contains(f));
                for flag in add {
                    if !message.header.flags.contains(flag) {
                        message.header.flags.push(flag.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn delete_messages(&self, srvids: &[String]) -> Result<()> {
        let mut inner = self.lock();
        inner.change_token += 1;
        inner.messages.retain(|m| !srvids.contains(&m.header.srvid));
        Ok(())
    }

    async fn move_messages(
        &self,
        srvids: &[String],
        dest: FolderId,
    ) -> Result<Vec<(String, String)>> {
        let mut inner = self.lock();
        inner.change_token += 1;
        let mut mapping = Vec::new();
        let mut kept = Vec::new();
        let messages = std::mem::take(&mut inner.messages);
        for mut message in messages {
            if srvids.contains(&message.header.srvid) {
                inner.next_srvid += 1;
                let new_srvid = format!("r{}", inner.next_srvid);
                mapping.push((message.header.srvid.clone(), new_srvid.clone()));
                message.header.srvid = new_srvid;
                inner.moved.entry(dest).or_default().push(message);
            } else {
                kept.push(message);
            }
        }
        inner.messages = kept;
        Ok(mapping)
    }
}
