use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level collaborative session containing ideas and derived topics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Discussion {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub idea_count: u64,
    #[serde(default)]
    pub topic_count: u64,
    #[serde(default)]
    pub require_verification: bool,
    #[serde(default)]
    pub share_url: Option<String>,
}

/// A server-computed cluster of semantically similar ideas.
///
/// `count` is authoritative from the backend; the client only displays it.
/// Identity key is `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub id: String,
    #[serde(default)]
    pub representative_text: String,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub sample_ideas: Vec<IdeaSummary>,
}

/// A single submitted contribution, optionally assigned to a topic.
/// `topic_id == None` means the idea is still drifting (unclustered).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdeaSummary {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub submitter: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub submitted_at: Option<i64>,
    #[serde(default)]
    pub topic_id: Option<String>,
    #[serde(default)]
    pub tags: Option<IdeaTags>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdeaTags {
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Discussion,
    Topic,
    Idea,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Discussion => "discussion",
            EntityKind::Topic => "topic",
            EntityKind::Idea => "idea",
        }
    }
}

/// Addressing unit for interaction state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn discussion(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Discussion, id)
    }

    pub fn topic(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Topic, id)
    }

    pub fn idea(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Idea, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Aggregate engagement counters plus caller-specific flags for one entity.
///
/// Entries are immutable snapshots replaced wholesale on refresh; the only
/// other mutation path is an optimistic local toggle, which also replaces
/// the whole snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InteractionState {
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub pin_count: u64,
    #[serde(default)]
    pub save_count: u64,
    #[serde(default)]
    pub last_activity_at: Option<i64>,
    #[serde(default)]
    pub liked: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub saved: bool,
    #[serde(default)]
    pub own_view_count: u64,
    #[serde(default)]
    pub last_viewed_at: Option<i64>,
    #[serde(default = "default_true")]
    pub can_like: bool,
    #[serde(default = "default_true")]
    pub can_pin: bool,
    #[serde(default = "default_true")]
    pub can_save: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterPredicate {
    pub field: String,
    pub op: String,
    pub value: String,
}

/// View-owned pagination/sort/filter state.
///
/// `page` is zero-based here; the wire query is one-based. Push events must
/// never reset this struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaginationState {
    pub page: u32,
    pub page_size: u32,
    pub sort_field: String,
    pub sort_direction: SortDirection,
    pub search: String,
    pub filters: Vec<FilterPredicate>,
}

impl Default for PaginationState {
    fn default() -> Self {
        Self {
            page: 0,
            page_size: 20,
            sort_field: "count".to_string(),
            sort_direction: SortDirection::Desc,
            search: String::new(),
            filters: Vec::new(),
        }
    }
}

/// Identity state of the caller, as resolved by the (out-of-scope) auth UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    Loading,
    Unauthenticated,
    Authenticated,
}
