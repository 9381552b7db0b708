use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::timeout;
use url::Url;

use driftwood_client_core::api::{ApiBackend, ApiClient, ApiError, IdeaAck, TopicPage};
use driftwood_client_core::auth::{MemoryTokenStore, ParticipationTokenManager, TokenStore};
use driftwood_client_core::config::Config;
use driftwood_client_core::controller::{DiscussionSyncController, LoadPhase};
use driftwood_client_core::interactions::{
    InteractionBackend, InteractionEntry, InteractionStateCache,
};
use driftwood_client_core::model::{
    Discussion, EntityRef, IdentityState, InteractionState, Topic,
};

struct NullInteractionBackend;

#[async_trait]
impl InteractionBackend for NullInteractionBackend {
    async fn fetch_bulk(
        &self,
        _base_url: &Url,
        refs: &[EntityRef],
    ) -> Result<Vec<InteractionEntry>, ApiError> {
        Ok(refs
            .iter()
            .map(|entity| InteractionEntry {
                entity: entity.clone(),
                state: InteractionState::default(),
            })
            .collect())
    }
}

fn topic(id: &str, count: u64) -> Topic {
    Topic {
        id: id.to_string(),
        representative_text: format!("about {id}"),
        count,
        sample_ideas: Vec::new(),
    }
}

fn page(rows: Vec<Topic>) -> TopicPage {
    TopicPage {
        total_row_count: rows.len() as u64,
        rows,
        page_count: 2,
        unclustered_count: 0,
    }
}

/// Backend whose second topics call blocks until released, to force the
/// slow-response-overtaken-by-newer-request interleaving.
struct GatedBackend {
    topic_calls: AtomicUsize,
    gate: Semaphore,
    gated_call_started: Notify,
    discussion_gate: Semaphore,
    discussion_started: Notify,
    submissions: AtomicUsize,
    reject_first_submission: AtomicBool,
    issued_tokens: AtomicUsize,
}

impl GatedBackend {
    fn new() -> Self {
        Self {
            topic_calls: AtomicUsize::new(0),
            gate: Semaphore::new(0),
            gated_call_started: Notify::new(),
            discussion_gate: Semaphore::new(Semaphore::MAX_PERMITS),
            discussion_started: Notify::new(),
            submissions: AtomicUsize::new(0),
            reject_first_submission: AtomicBool::new(false),
            issued_tokens: AtomicUsize::new(0),
        }
    }

    /// Like `new`, but `get_discussion` parks until a permit is added.
    fn with_gated_discussion() -> Self {
        Self {
            discussion_gate: Semaphore::new(0),
            ..Self::new()
        }
    }
}

#[async_trait]
impl ApiBackend for GatedBackend {
    async fn get_discussion(
        &self,
        _base_url: &Url,
        discussion_id: &str,
    ) -> Result<Discussion, ApiError> {
        self.discussion_started.notify_one();
        let _permit = self
            .discussion_gate
            .acquire()
            .await
            .map_err(|_| ApiError::NotFound)?;
        Ok(Discussion {
            id: discussion_id.to_string(),
            title: "Gated".into(),
            prompt: None,
            idea_count: 0,
            topic_count: 2,
            require_verification: false,
            share_url: None,
        })
    }

    async fn get_topics(
        &self,
        _base_url: &Url,
        _discussion_id: &str,
        query: &[(String, String)],
    ) -> Result<TopicPage, ApiError> {
        let call = self.topic_calls.fetch_add(1, Ordering::SeqCst);
        match call {
            // Initial load during open().
            0 => Ok(page(vec![topic("t1", 1)])),
            // The slow background refresh: park until the test releases it.
            1 => {
                self.gated_call_started.notify_one();
                let _permit = self.gate.acquire().await.map_err(|_| ApiError::NotFound)?;
                Ok(page(vec![topic("stale", 99)]))
            }
            // The pagination change that supersedes the slow call.
            _ => {
                let requested_page = query
                    .iter()
                    .find(|(k, _)| k == "page")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                assert_eq!(requested_page, "2");
                Ok(page(vec![topic("t2", 5)]))
            }
        }
    }

    async fn submit_idea(
        &self,
        _base_url: &Url,
        _discussion_id: &str,
        _text: &str,
        participation_token: Option<&str>,
    ) -> Result<IdeaAck, ApiError> {
        assert!(participation_token.is_some(), "anonymous submission without token");
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        if n == 0 && self.reject_first_submission.load(Ordering::SeqCst) {
            return Err(ApiError::Unauthorized);
        }
        Ok(IdeaAck {
            idea_id: Some(format!("idea-{n}")),
        })
    }

    async fn trigger_clustering(
        &self,
        _base_url: &Url,
        _discussion_id: &str,
    ) -> Result<(), ApiError> {
        Ok(())
    }

    async fn initiate_anonymous(
        &self,
        _base_url: &Url,
        _discussion_id: &str,
        _api_key: &str,
    ) -> Result<String, ApiError> {
        let n = self.issued_tokens.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("anon-{n}"))
    }
}

/// Websocket fake that records every text frame the client sends.
async fn spawn_ws_server() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::routing::get;

    async fn record(mut socket: WebSocket, tx: mpsc::UnboundedSender<String>) {
        while let Some(Ok(frame)) = socket.recv().await {
            if let Message::Text(text) = frame {
                let _ = tx.send(text);
            }
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let app = axum::Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade| {
            let tx = tx.clone();
            async move { ws.on_upgrade(move |socket| record(socket, tx)) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, rx)
}

struct Harness {
    controller: DiscussionSyncController,
    backend: Arc<GatedBackend>,
    store: Arc<MemoryTokenStore>,
}

async fn open_harness() -> Harness {
    let backend = Arc::new(GatedBackend::new());
    // Port 1 refuses websocket connects; the controller must work REST-only.
    let config = Config::new("http://127.0.0.1:1")
        .unwrap()
        .with_api_key(Some("test-key".into()));
    let api = Arc::new(ApiClient::with_backend(config, backend.clone()));
    let store = Arc::new(MemoryTokenStore::new());
    let tokens = Arc::new(ParticipationTokenManager::new(store.clone(), api.clone()));
    let interactions = Arc::new(InteractionStateCache::new(
        Url::parse("http://127.0.0.1:1/").unwrap(),
        Arc::new(NullInteractionBackend),
    ));

    let controller = DiscussionSyncController::open(
        api,
        tokens,
        interactions,
        "d1".into(),
        IdentityState::Unauthenticated,
    )
    .await
    .expect("open failed");

    Harness {
        controller,
        backend,
        store,
    }
}

#[tokio::test]
async fn open_reaches_ready_with_initial_page() {
    let harness = open_harness().await;
    let state = harness.controller.state();
    let view = state.borrow().clone();

    assert_eq!(view.phase, LoadPhase::Ready);
    assert_eq!(view.discussion.as_ref().unwrap().title, "Gated");
    assert_eq!(view.topics.len(), 1);
    assert_eq!(view.topics[0].id, "t1");

    harness.controller.close();
}

#[tokio::test]
async fn channel_joins_room_before_initial_load_finishes() {
    let (addr, mut client_messages) = spawn_ws_server().await;
    let backend = Arc::new(GatedBackend::with_gated_discussion());
    let config = Config::new(format!("http://{addr}"))
        .unwrap()
        .with_api_key(Some("test-key".into()));
    let api = Arc::new(ApiClient::with_backend(config, backend.clone()));
    let tokens = Arc::new(ParticipationTokenManager::new(
        Arc::new(MemoryTokenStore::new()),
        api.clone(),
    ));
    let interactions = Arc::new(InteractionStateCache::new(
        Url::parse(&format!("http://{addr}/")).unwrap(),
        Arc::new(NullInteractionBackend),
    ));

    let open = tokio::spawn(DiscussionSyncController::open(
        api,
        tokens,
        interactions,
        "d1".into(),
        IdentityState::Unauthenticated,
    ));

    timeout(Duration::from_secs(5), backend.discussion_started.notified())
        .await
        .expect("discussion fetch never started");

    // Push events can arrive during the initial load, so the room join must
    // already be on the wire while the discussion fetch is still pending.
    let join = timeout(Duration::from_secs(5), client_messages.recv())
        .await
        .expect("join not sent during initial load")
        .unwrap();
    assert!(join.contains("\"join\""));

    backend.discussion_gate.add_permits(1);
    let controller = timeout(Duration::from_secs(5), open)
        .await
        .expect("open never finished")
        .unwrap()
        .unwrap();
    assert_eq!(controller.state().borrow().phase, LoadPhase::Ready);
    controller.close();
}

#[tokio::test]
async fn superseded_fetch_never_overwrites_newer_page() {
    let harness = open_harness().await;
    let controller = Arc::new(harness.controller);

    // Kick off the refresh that will hang inside the backend.
    let slow = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.refresh().await })
    };
    timeout(Duration::from_secs(5), harness.backend.gated_call_started.notified())
        .await
        .expect("slow refresh never started");

    // A newer request: the user pages forward while the refresh is stuck.
    controller.set_page(1).await.unwrap();
    let state = controller.state();
    assert_eq!(state.borrow().topics[0].id, "t2");

    // Release the stale response; it must be discarded, not committed.
    harness.backend.gate.add_permits(1);
    timeout(Duration::from_secs(5), slow)
        .await
        .expect("slow refresh never finished")
        .unwrap()
        .unwrap();

    let view = state.borrow().clone();
    assert_eq!(view.topics.len(), 1);
    assert_eq!(view.topics[0].id, "t2");
    assert_eq!(view.topics[0].count, 5);

    controller.close();
}

#[tokio::test]
async fn pagination_survives_background_refreshes() {
    let harness = open_harness().await;
    harness.backend.gate.add_permits(10);

    harness.controller.set_page(1).await.unwrap();
    let before = harness.controller.pagination();

    harness.controller.refresh().await.unwrap();
    let after = harness.controller.pagination();

    assert_eq!(before, after);
    assert_eq!(after.page, 1);

    harness.controller.close();
}

#[tokio::test]
async fn rejected_submission_invalidates_token_for_retry() {
    let harness = open_harness().await;
    harness
        .backend
        .reject_first_submission
        .store(true, Ordering::SeqCst);

    // open() already issued a token for the unauthenticated identity.
    assert_eq!(harness.backend.issued_tokens.load(Ordering::SeqCst), 1);

    let err = harness.controller.submit_idea("first try").await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
    assert!(harness.store.get("d1").is_none(), "401 must clear the token");

    // The retry issues a fresh token and succeeds.
    let ack = harness.controller.submit_idea("second try").await.unwrap();
    assert_eq!(ack.idea_id.as_deref(), Some("idea-1"));
    assert_eq!(harness.backend.issued_tokens.load(Ordering::SeqCst), 2);

    harness.controller.close();
}

#[tokio::test]
async fn authenticated_identity_clears_participation_token() {
    let harness = open_harness().await;
    assert!(harness.store.get("d1").is_some());

    harness
        .controller
        .set_identity(IdentityState::Authenticated)
        .await;

    assert!(harness.store.get("d1").is_none());
    harness.controller.close();
}
