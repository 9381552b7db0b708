use serde::{Deserialize, Serialize};

use crate::model::IdeaSummary;

/// Messages sent from the client to the push server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter the room for one discussion.
    Join { discussion_id: String },
    /// Leave the room on clean teardown.
    Leave { discussion_id: String },
}

/// Messages received from the push server, in server-send order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Discussion-wide "go refetch topics" signal. Some server builds attach
    /// a payload here; it is never trusted, so none is modeled.
    TopicsUpdated,
    /// A batch of ideas finished server-side processing.
    BatchProcessed {
        #[serde(default)]
        ideas: Vec<IdeaSummary>,
        #[serde(default)]
        count: u64,
        #[serde(default)]
        unclustered_count: Option<u64>,
        #[serde(default)]
        incremental_update: bool,
    },
    /// Single-idea arrival notice.
    NewIdea {
        #[serde(default)]
        idea: Option<IdeaSummary>,
    },
    /// Ack for immediate submission feedback.
    IdeaSubmitted {
        #[serde(default)]
        idea_id: Option<String>,
    },
    /// Authoritative drifting-count refresh.
    UnprocessedCountUpdated {
        total_unprocessed: u64,
        #[serde(default)]
        needs_embedding: u64,
        #[serde(default)]
        needs_clustering: u64,
    },
    /// Non-fatal batch-level failure, surfaced as a warning.
    ProcessingError { error: String },
    /// Non-fatal per-idea failure, surfaced as a warning.
    IdeaProcessingError {
        idea_id: String,
        error: String,
    },
}
