//! Lifecycle of a single discussion view: identity and token resolution,
//! realtime channel wiring, snapshot refreshes, and the read model exposed
//! to the presentation layer.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::{ApiClient, ApiError, IdeaAck};
use crate::auth::ParticipationTokenManager;
use crate::channel::{ChannelEvent, ChannelStatus, RealtimeChannel};
use crate::interactions::{required_refs, InteractionStateCache};
use crate::model::{
    Discussion, FilterPredicate, IdentityState, PaginationState, SortDirection, Topic,
};
use crate::protocol::ServerMessage;
use crate::sync;

const MAX_WARNINGS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Idle,
    LoadingDiscussion,
    LoadingTopics,
    Ready,
    Failed,
}

/// The consistent read model published to the presentation layer.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub discussion: Option<Discussion>,
    pub topics: Vec<Arc<Topic>>,
    pub page_count: u32,
    pub total_row_count: u64,
    pub unclustered_count: u64,
    pub phase: LoadPhase,
    pub channel_status: ChannelStatus,
    pub warnings: Vec<String>,
    pub last_submitted_id: Option<String>,
}

impl ViewState {
    fn initial() -> Self {
        Self {
            discussion: None,
            topics: Vec::new(),
            page_count: 0,
            total_row_count: 0,
            unclustered_count: 0,
            phase: LoadPhase::Idle,
            channel_status: ChannelStatus::Disconnected,
            warnings: Vec::new(),
            last_submitted_id: None,
        }
    }
}

struct Inner {
    discussion_id: String,
    api: Arc<ApiClient>,
    tokens: Arc<ParticipationTokenManager>,
    interactions: Arc<InteractionStateCache>,
    identity: Mutex<IdentityState>,
    pagination: Mutex<PaginationState>,
    state: watch::Sender<ViewState>,
}

impl Inner {
    fn push_warning(&self, warning: String) {
        tracing::warn!(
            target = "driftwood::controller",
            discussion_id = %self.discussion_id,
            %warning,
            "view warning"
        );
        self.state.send_modify(|view| {
            view.warnings.push(warning);
            if view.warnings.len() > MAX_WARNINGS {
                let excess = view.warnings.len() - MAX_WARNINGS;
                view.warnings.drain(..excess);
            }
        });
    }

    fn set_channel_status(&self, status: ChannelStatus) {
        self.state.send_if_modified(|view| {
            if view.channel_status == status {
                return false;
            }
            view.channel_status = status;
            true
        });
    }

    /// Fetch the current page and commit it unless a newer fetch has been
    /// started in the meantime. Background refreshes never touch pagination.
    async fn refresh_topics(&self, is_initial: bool) -> Result<(), ApiError> {
        let pagination = self.pagination.lock().clone();
        let snapshot = self
            .api
            .fetch_topics(&self.discussion_id, &pagination)
            .await?;
        if !self.api.is_current(snapshot.seq) {
            tracing::debug!(
                target = "driftwood::controller",
                seq = snapshot.seq,
                "discarding superseded topic snapshot"
            );
            return Ok(());
        }

        let page = snapshot.page;
        self.state.send_if_modified(|view| {
            let list_changed = is_initial || sync::changed(&view.topics, &page.rows);
            let counts_changed = view.unclustered_count != page.unclustered_count
                || view.page_count != page.page_count
                || view.total_row_count != page.total_row_count;
            if !list_changed && !counts_changed {
                return false;
            }
            if list_changed {
                view.topics = sync::merge(&view.topics, page.rows.clone(), is_initial);
            }
            view.unclustered_count = page.unclustered_count;
            view.page_count = page.page_count;
            view.total_row_count = page.total_row_count;
            true
        });

        let visible = self.state.borrow().topics.clone();
        self.interactions
            .load_bulk(required_refs(&self.discussion_id, &visible))
            .await;
        Ok(())
    }

    async fn background_refresh(&self) {
        if let Err(err) = self.refresh_topics(false).await {
            // Prior data stays on screen; the user can refresh manually.
            self.push_warning(format!("topic refresh failed: {err}"));
        }
    }

    async fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::TopicsUpdated => {
                // Payload-less invalidation signal; always refetch.
                self.background_refresh().await;
            }
            ServerMessage::BatchProcessed {
                ideas,
                count,
                unclustered_count,
                incremental_update: _,
            } => {
                let newly_processed = if count > 0 { count } else { ideas.len() as u64 };
                let drifting = ideas.iter().filter(|idea| idea.topic_id.is_none()).count() as u64;
                let clustered_any = ideas.iter().any(|idea| idea.topic_id.is_some());
                self.state.send_modify(|view| {
                    if let Some(discussion) = view.discussion.as_mut() {
                        discussion.idea_count += newly_processed;
                    }
                    match unclustered_count {
                        // The server-provided count is authoritative.
                        Some(total) => view.unclustered_count = total,
                        None => view.unclustered_count += drifting,
                    }
                });
                if clustered_any {
                    self.background_refresh().await;
                }
            }
            ServerMessage::NewIdea { .. } => {
                self.state.send_modify(|view| {
                    if let Some(discussion) = view.discussion.as_mut() {
                        discussion.idea_count += 1;
                    }
                });
            }
            ServerMessage::IdeaSubmitted { idea_id } => {
                self.state.send_modify(|view| {
                    view.last_submitted_id = idea_id.clone();
                });
            }
            ServerMessage::UnprocessedCountUpdated {
                total_unprocessed, ..
            } => {
                self.state.send_if_modified(|view| {
                    if view.unclustered_count == total_unprocessed {
                        return false;
                    }
                    view.unclustered_count = total_unprocessed;
                    true
                });
            }
            ServerMessage::ProcessingError { error } => {
                self.push_warning(format!("processing error: {error}"));
            }
            ServerMessage::IdeaProcessingError { idea_id, error } => {
                self.push_warning(format!("idea {idea_id} failed processing: {error}"));
            }
        }
    }
}

pub struct DiscussionSyncController {
    inner: Arc<Inner>,
    state_rx: watch::Receiver<ViewState>,
    channel: Mutex<Option<RealtimeChannel>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DiscussionSyncController {
    /// Open a discussion view: resolve the participation token, start the
    /// push channel, then load the discussion and the first topic page.
    /// The channel comes up first so events arriving during the initial
    /// load window are not lost.
    ///
    /// A missing discussion (404) is fatal and returned as an error; token
    /// issuance failure is not, it only produces a warning.
    pub async fn open(
        api: Arc<ApiClient>,
        tokens: Arc<ParticipationTokenManager>,
        interactions: Arc<InteractionStateCache>,
        discussion_id: String,
        identity: IdentityState,
    ) -> Result<Self, ApiError> {
        let (state_tx, state_rx) = watch::channel(ViewState::initial());
        let inner = Arc::new(Inner {
            discussion_id: discussion_id.clone(),
            api,
            tokens,
            interactions,
            identity: Mutex::new(identity),
            pagination: Mutex::new(PaginationState::default()),
            state: state_tx,
        });

        if let Err(err) = inner
            .tokens
            .ensure_token(&discussion_id, identity)
            .await
        {
            inner.push_warning(format!("anonymous participation unavailable: {err}"));
        }

        let (channel, events) = RealtimeChannel::connect(
            inner.api.config().ws_url().clone(),
            discussion_id.clone(),
        );
        let status_rx = channel.status();
        let pump = tokio::spawn(pump_events(inner.clone(), events, status_rx));

        inner
            .state
            .send_modify(|view| view.phase = LoadPhase::LoadingDiscussion);
        let discussion = match inner.api.fetch_discussion(&discussion_id).await {
            Ok(discussion) => discussion,
            Err(err) => {
                inner.state.send_modify(|view| view.phase = LoadPhase::Failed);
                channel.close();
                pump.abort();
                return Err(err);
            }
        };
        inner.state.send_modify(|view| {
            view.discussion = Some(discussion);
            view.phase = LoadPhase::LoadingTopics;
        });

        if let Err(err) = inner.refresh_topics(true).await {
            inner.state.send_modify(|view| view.phase = LoadPhase::Failed);
            channel.close();
            pump.abort();
            return Err(err);
        }
        inner.state.send_modify(|view| view.phase = LoadPhase::Ready);

        Ok(Self {
            inner,
            state_rx,
            channel: Mutex::new(Some(channel)),
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }

    /// Watch handle for the read model.
    pub fn state(&self) -> watch::Receiver<ViewState> {
        self.state_rx.clone()
    }

    pub fn pagination(&self) -> PaginationState {
        self.inner.pagination.lock().clone()
    }

    pub async fn set_page(&self, page: u32) -> Result<(), ApiError> {
        self.inner.pagination.lock().page = page;
        self.inner.refresh_topics(false).await
    }

    pub async fn set_sort(
        &self,
        field: impl Into<String>,
        direction: SortDirection,
    ) -> Result<(), ApiError> {
        {
            let mut pagination = self.inner.pagination.lock();
            pagination.sort_field = field.into();
            pagination.sort_direction = direction;
            pagination.page = 0;
        }
        self.inner.refresh_topics(false).await
    }

    pub async fn set_search(&self, search: impl Into<String>) -> Result<(), ApiError> {
        {
            let mut pagination = self.inner.pagination.lock();
            pagination.search = search.into();
            pagination.page = 0;
        }
        self.inner.refresh_topics(false).await
    }

    pub async fn set_filters(&self, filters: Vec<FilterPredicate>) -> Result<(), ApiError> {
        {
            let mut pagination = self.inner.pagination.lock();
            pagination.filters = filters;
            pagination.page = 0;
        }
        self.inner.refresh_topics(false).await
    }

    /// Manual refresh, e.g. after a surfaced fetch error.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        self.inner.refresh_topics(false).await
    }

    /// Identity transitions from the (out-of-scope) auth layer. Moving to
    /// authenticated always clears the stored participation token.
    pub async fn set_identity(&self, identity: IdentityState) {
        *self.inner.identity.lock() = identity;
        if let Err(err) = self
            .inner
            .tokens
            .ensure_token(&self.inner.discussion_id, identity)
            .await
        {
            self.inner
                .push_warning(format!("anonymous participation unavailable: {err}"));
        }
    }

    /// Submit an idea, signing with the participation token while
    /// unauthenticated. A 401 invalidates the held token so the next
    /// submission attempt issues a fresh one.
    pub async fn submit_idea(&self, text: &str) -> Result<IdeaAck, ApiError> {
        let identity = *self.inner.identity.lock();
        let token = self
            .inner
            .tokens
            .ensure_token(&self.inner.discussion_id, identity)
            .await
            .map_err(|err| ApiError::Token(err.to_string()))?;

        let result = self
            .inner
            .api
            .submit_idea(&self.inner.discussion_id, text, token.as_deref())
            .await;
        if matches!(result, Err(ApiError::Unauthorized))
            && identity == IdentityState::Unauthenticated
        {
            self.inner.tokens.invalidate(&self.inner.discussion_id);
        }
        result
    }

    /// Trigger server-side regrouping (authenticated only; the server
    /// enforces it).
    pub async fn trigger_clustering(&self) -> Result<(), ApiError> {
        self.inner
            .api
            .trigger_clustering(&self.inner.discussion_id)
            .await
    }

    /// Tear the view down: leave the room, invalidate in-flight fetches,
    /// drop per-view caches. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.inner.api.supersede_all();
        self.inner.interactions.clear();
        tracing::debug!(
            target = "driftwood::controller",
            discussion_id = %self.inner.discussion_id,
            "view closed"
        );
    }
}

impl Drop for DiscussionSyncController {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumes channel events strictly in arrival order and mirrors the
/// connection status into the read model.
async fn pump_events(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut status_rx: watch::Receiver<ChannelStatus>,
) {
    let mut status_open = true;
    loop {
        if status_open {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ChannelEvent::Message(message)) => {
                        inner.handle_server_message(message).await
                    }
                    Some(ChannelEvent::Warning(warning)) => inner.push_warning(warning),
                    None => break,
                },
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        status_open = false;
                    } else {
                        let status = status_rx.borrow().clone();
                        inner.set_channel_status(status);
                    }
                }
            }
        } else {
            match events.recv().await {
                Some(ChannelEvent::Message(message)) => {
                    inner.handle_server_message(message).await
                }
                Some(ChannelEvent::Warning(warning)) => inner.push_warning(warning),
                None => break,
            }
        }
    }
}
