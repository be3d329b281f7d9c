//! Thread data model
//!
//! A [`Thread`] is one conversation's ordered history. It travels between the
//! tiers wrapped in a [`CacheRecord`] (with an absolute expiry) or an
//! [`ArchivalRecord`] (no expiry).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message (instructions)
    System,
    /// User message
    User,
    /// Assistant message
    Assistant,
    /// Tool response
    Tool,
}

impl MessageRole {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown message role: '{}'", other)),
        }
    }
}

/// A single entry in a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// When the message was produced
    pub timestamp: DateTime<Utc>,
    /// Tool call ID (for tool responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Name (for tool calls)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    /// Create a message with an explicit role
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Create a tool response message
    #[must_use]
    pub fn tool_response(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }
}

/// One conversation's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    /// Opaque identifier, immutable once assigned
    pub id: String,
    /// Ordered, append-only message history
    pub messages: Vec<Message>,
    /// Set once at first creation
    pub created_at: DateTime<Utc>,
    /// Time of the most recent mutation
    pub last_updated_at: DateTime<Utc>,
    /// Number of cache/archive reconciliations this thread went through
    #[serde(default)]
    pub merge_count: u64,
}

impl Thread {
    /// Create an empty thread with the given id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: Vec::new(),
            created_at: now,
            last_updated_at: now,
            merge_count: 0,
        }
    }

    /// Create an empty thread with a freshly generated id
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Append messages, preserving their order
    pub fn append(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
        self.last_updated_at = Utc::now();
    }

    /// Number of messages
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

/// A thread as held by the cache tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Cached thread
    pub thread: Thread,
    /// Absolute expiry; the record is logically absent afterwards
    pub expires_at: DateTime<Utc>,
}

impl CacheRecord {
    /// Wrap a thread with an expiry of `now + ttl`
    #[must_use]
    pub fn new(thread: Thread, ttl: std::time::Duration) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or(Duration::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { thread, expires_at }
    }

    /// Whether the record has expired at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time left before expiry, zero if already expired
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

/// A thread as held by the archival tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivalRecord {
    /// Durable copy of the thread
    pub thread: Thread,
    /// When the record was last written
    pub archived_at: DateTime<Utc>,
}

impl ArchivalRecord {
    /// Wrap a thread, stamped with the current time
    #[must_use]
    pub fn new(thread: Thread) -> Self {
        Self {
            thread,
            archived_at: Utc::now(),
        }
    }
}

/// Where a listed thread was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadLocation {
    /// Tracked by this process
    Active,
    /// Cache tier only
    Cache,
    /// Archival tier only
    Archive,
}

impl ThreadLocation {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cache => "cache",
            Self::Archive => "archive",
        }
    }
}

/// Listing view of a thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    /// Thread id
    pub id: String,
    /// Where the thread was found
    pub location: ThreadLocation,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the most recent mutation
    pub last_updated_at: DateTime<Utc>,
    /// Number of messages
    pub message_count: usize,
    /// Reconciliation counter
    pub merge_count: u64,
    /// Whether the latest state is known to be archived
    pub persisted: bool,
    /// Cache expiry, when cached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ThreadSummary {
    /// Summarize a thread found at `location`
    #[must_use]
    pub fn from_thread(thread: &Thread, location: ThreadLocation) -> Self {
        Self {
            id: thread.id.clone(),
            location,
            created_at: thread.created_at,
            last_updated_at: thread.last_updated_at,
            message_count: thread.message_count(),
            merge_count: thread.merge_count,
            persisted: location == ThreadLocation::Archive,
            expires_at: None,
        }
    }
}
