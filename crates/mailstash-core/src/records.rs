//! Message record types and identity.
//!
//! A message is named by a folder-local monotonically increasing integer id
//! combined with its received date; the pair sorts young-to-old (descending
//! date, then descending id). Headers and bodies are stored in separate
//! block directories because list rendering touches many headers while
//! reading touches one body.

use serde::{Deserialize, Serialize};

use crate::date::TimestampMs;

/// Identifier of a folder within an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId(pub u64);

impl std::fmt::Display for FolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a header or body block within a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Folder-local message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The sort/lookup key of a message: received date plus folder-local id.
///
/// Natural `Ord` is chronological (older first); collections that present
/// messages young-to-old iterate in reverse of this ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MessageKey {
    /// Received date in milliseconds.
    pub date: TimestampMs,
    /// Folder-local id, tie-breaker for identical dates.
    pub id: MessageId,
}

impl MessageKey {
    /// Create a key.
    #[must_use]
    pub const fn new(date: TimestampMs, id: MessageId) -> Self {
        Self { date, id }
    }
}

/// Globally addressable message name: folder plus folder-local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Suid {
    /// Owning folder.
    pub folder: FolderId,
    /// Message id within that folder.
    pub id: MessageId,
}

impl std::fmt::Display for Suid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.folder, self.id)
    }
}

/// A record that can live in a block directory.
///
/// Header and body records share identical insert/split/delete machinery;
/// this trait is the only thing the generic block code needs from them.
pub trait BlockedRecord: Clone + Send {
    /// The record's sort/lookup key. Immutable for the record's lifetime.
    fn key(&self) -> MessageKey;

    /// Estimated serialized size in bytes, used for block budgeting.
    fn size_estimate(&self) -> u32;

    /// Server-assigned identifier, if the protocol names messages
    /// differently than we do. Only headers carry one.
    fn server_id(&self) -> Option<&str> {
        None
    }
}

/// Summary record backing message lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    /// Folder-local id. Immutable.
    pub id: MessageId,
    /// Server-assigned identifier, when the protocol has one. Immutable.
    pub srvid: Option<String>,
    /// Received date in milliseconds. Immutable.
    pub date: TimestampMs,
    /// Display author.
    pub author: String,
    /// Subject line.
    pub subject: String,
    /// Flag/tag strings (`\Seen`, `\Flagged`, user labels).
    pub flags: Vec<String>,
    /// Short body preview.
    pub snippet: String,
    /// Whether any attachment exists.
    pub has_attachments: bool,
    /// Estimated size of the corresponding body record.
    pub body_size_estimate: u32,
}

impl HeaderRecord {
    /// Estimated serialized size of a header record; headers are small and
    /// uniform enough that a fixed estimate works.
    pub const EST_SIZE: u32 = 200;
}

impl BlockedRecord for HeaderRecord {
    fn key(&self) -> MessageKey {
        MessageKey::new(self.date, self.id)
    }

    fn size_estimate(&self) -> u32 {
        Self::EST_SIZE
    }

    fn server_id(&self) -> Option<&str> {
        self.srvid.as_deref()
    }
}

/// One representation of the message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyRep {
    /// Structured plain-text chunks produced by the quoting analyzer.
    PlainChunks(Vec<String>),
    /// Already-sanitized HTML.
    SanitizedHtml(String),
}

/// An attachment or related-part descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    /// Protocol part reference used to fetch the content.
    pub part_ref: String,
    /// Display filename.
    pub name: String,
    /// MIME type string.
    pub mime_type: String,
    /// Estimated encoded size in bytes.
    pub size_estimate: u32,
    /// Downloaded content, if any.
    pub content: Option<Vec<u8>>,
}

impl PartInfo {
    /// Whether the part content has been downloaded.
    #[must_use]
    pub const fn is_downloaded(&self) -> bool {
        self.content.is_some()
    }
}

/// Full message content, one-to-one with a [`HeaderRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyRecord {
    /// Folder-local id, matching the header.
    pub id: MessageId,
    /// Received date, denormalized from the header for block splitting.
    pub date: TimestampMs,
    /// To recipients.
    pub to: Vec<String>,
    /// Cc recipients.
    pub cc: Vec<String>,
    /// Bcc recipients.
    pub bcc: Vec<String>,
    /// Attachment descriptors.
    pub attachments: Vec<PartInfo>,
    /// Inline related parts (referenced images and the like).
    pub related_parts: Vec<PartInfo>,
    /// Message-id references for threading.
    pub references: Vec<String>,
    /// Estimated serialized size in bytes.
    pub size_estimate: u32,
    /// Ordered body representations.
    pub body_reps: Vec<BodyRep>,
}

impl BlockedRecord for BodyRecord {
    fn key(&self) -> MessageKey {
        MessageKey::new(self.date, self.id)
    }

    fn size_estimate(&self) -> u32 {
        self.size_estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(date: i64, id: u64) -> MessageKey {
        MessageKey::new(date, MessageId(id))
    }

    #[test]
    fn key_orders_by_date_then_id() {
        assert!(key(100, 1) < key(200, 1));
        assert!(key(100, 1) < key(100, 2));
        assert!(key(200, 1) > key(100, 99));
    }

    #[test]
    fn suid_formats_folder_and_id() {
        let suid = Suid {
            folder: FolderId(7),
            id: MessageId(42),
        };
        assert_eq!(suid.to_string(), "7/42");
    }
}
