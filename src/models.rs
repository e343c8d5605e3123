use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type Id = i64;

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

#[derive(Debug, thiserror::Error)]
#[error("invalid value: {0}")]
pub struct InvalidEnumValue(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Beginner => "Beginner",
            Difficulty::Intermediate => "Intermediate",
            Difficulty::Advanced => "Advanced",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = InvalidEnumValue;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Beginner" => Ok(Difficulty::Beginner),
            "Intermediate" => Ok(Difficulty::Intermediate),
            "Advanced" => Ok(Difficulty::Advanced),
            other => Err(InvalidEnumValue(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    #[default]
    Open,
    InProgress,
    WaitingForUser,
    Resolved,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Open => "OPEN",
            ConversationStatus::InProgress => "IN_PROGRESS",
            ConversationStatus::WaitingForUser => "WAITING_FOR_USER",
            ConversationStatus::Resolved => "RESOLVED",
            ConversationStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = InvalidEnumValue;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(ConversationStatus::Open),
            "IN_PROGRESS" => Ok(ConversationStatus::InProgress),
            "WAITING_FOR_USER" => Ok(ConversationStatus::WaitingForUser),
            "RESOLVED" => Ok(ConversationStatus::Resolved),
            "CLOSED" => Ok(ConversationStatus::Closed),
            other => Err(InvalidEnumValue(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: Id,
    /// Stable external identifier, unique across all challenges.
    pub challenge_id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub difficulty: Difficulty,
    pub points: i64,
    pub tags: Vec<String>,
    pub learning_objectives: Vec<String>,
    pub hints: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChallenge {
    pub challenge_id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub learning_objectives: Vec<String>,
    #[serde(default)]
    pub hints: Vec<String>,
}

/// Partial patch for a challenge; unknown fields are rejected at the
/// validation boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateChallenge {
    pub challenge_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub difficulty: Option<Difficulty>,
    pub points: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub learning_objectives: Option<Vec<String>>,
    pub hints: Option<Vec<String>>,
}

impl Challenge {
    /// Explicit merge: only supplied fields overwrite; `updated_at` advances.
    pub fn apply(&mut self, upd: UpdateChallenge) {
        if let Some(challenge_id) = upd.challenge_id {
            self.challenge_id = challenge_id;
        }
        if let Some(title) = upd.title {
            self.title = title;
        }
        if let Some(description) = upd.description {
            self.description = description;
        }
        if let Some(category) = upd.category {
            self.category = category;
        }
        if let Some(difficulty) = upd.difficulty {
            self.difficulty = difficulty;
        }
        if let Some(points) = upd.points {
            self.points = points;
        }
        if let Some(tags) = upd.tags {
            self.tags = tags;
        }
        if let Some(learning_objectives) = upd.learning_objectives {
            self.learning_objectives = learning_objectives;
        }
        if let Some(hints) = upd.hints {
            self.hints = hints;
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Id,
    /// Stable external identifier, unique across all conversations.
    pub identifier: String,
    pub challenge_id: Id,
    pub topic: String,
    pub category: String,
    pub status: ConversationStatus,
    pub assignee: Option<String>,
    /// Username of the creating user; always the resolved identity.
    pub user: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConversation {
    pub identifier: String,
    /// Internal id of the challenge this conversation belongs to.
    pub challenge_id: Id,
    pub topic: String,
    pub category: String,
    #[serde(default)]
    pub status: ConversationStatus,
    #[serde(default)]
    pub assignee: Option<String>,
}

/// Support-only patch: assignee and status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateConversation {
    pub assignee: Option<String>,
    pub status: Option<ConversationStatus>,
}

impl Conversation {
    pub fn apply(&mut self, upd: UpdateConversation) {
        if let Some(assignee) = upd.assignee {
            self.assignee = Some(assignee);
        }
        if let Some(status) = upd.status {
            self.status = status;
        }
        self.updated_at = Utc::now();
    }
}

/// Read representation of a conversation with its posts eagerly loaded,
/// ordered by creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub posts: Vec<Post>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Id,
    pub conversation_id: Id,
    /// Authoring username; always the resolved identity.
    pub user: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPost {
    pub content: String,
}

/// Pagination envelope returned by every list endpoint. `total` counts the
/// filtered collection, not the whole table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

/// Sanitized pagination window; `limit` is clamped to [1, 100].
#[derive(Debug, Clone, Copy)]
pub struct PageParams {
    pub offset: i64,
    pub limit: i64,
}

impl PageParams {
    pub fn new(offset: Option<i64>, limit: Option<i64>) -> Self {
        Self {
            offset: offset.unwrap_or(0).max(0),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChallengeFilter {
    pub difficulty: Option<Difficulty>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub status: Option<ConversationStatus>,
    pub category: Option<String>,
    /// External challenge id; matched through the owning challenge.
    pub challenge_id: Option<String>,
}
