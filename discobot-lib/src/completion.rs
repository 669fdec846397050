//! Chat completion proxy.
//!
//! One completion at a time per session. The agent-side SSE reader runs in
//! a detached task whose lifetime is bound to the completion slot, not to
//! any HTTP request: clients can disconnect and rejoin while the agent
//! keeps streaming. Every chunk lands in a per-session buffer (replayed to
//! late joiners) and on a live broadcast channel, both updated under one
//! lock so no chunk can fall between a replay snapshot and the live tail.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use sandbox_runtime::{Provider, ProxyRequest};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::EventBroker;
use crate::message::{Chunk, MessageAssembler, Part};
use crate::model::{EVENT_SESSION_UPDATED, MessageRole, SessionStatus};
use crate::store::Store;
use crate::id;

/// Live-chunk channel capacity. Generous: the replay buffer is the source
/// of truth and this channel only bridges attached clients.
const CHUNK_CHANNEL_CAPACITY: usize = 1024;

struct Slot {
    running: bool,
    completion_id: Option<String>,
    buffer: Vec<Chunk>,
    tx: broadcast::Sender<Chunk>,
    cancel: CancellationToken,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            running: false,
            completion_id: None,
            buffer: Vec::new(),
            tx: broadcast::channel(CHUNK_CHANNEL_CAPACITY).0,
            cancel: CancellationToken::new(),
        }
    }
}

/// Replay snapshot plus (when a completion is in flight) the live tail.
pub struct Attached {
    pub replay: Vec<Chunk>,
    pub live: Option<broadcast::Receiver<Chunk>>,
}

pub struct CompletionService {
    store: Store,
    broker: Arc<EventBroker>,
    provider: Arc<dyn Provider>,
    entries: DashMap<String, Arc<Mutex<Slot>>>,
    /// Ceiling on waiting for the session to reach `running` before the
    /// agent stream is opened.
    session_ready_timeout: Duration,
}

impl CompletionService {
    pub fn new(
        store: Store,
        broker: Arc<EventBroker>,
        provider: Arc<dyn Provider>,
        session_ready_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            provider,
            entries: DashMap::new(),
            session_ready_timeout,
        })
    }

    fn entry(&self, session_id: &str) -> Arc<Mutex<Slot>> {
        self.entries
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Claim the session's completion slot. Fails with
    /// `completion_in_progress` (carrying the live completion ID) if taken.
    fn begin(&self, session_id: &str) -> Result<(String, CancellationToken)> {
        let entry = self.entry(session_id);
        let mut slot = entry.lock().unwrap_or_else(|e| e.into_inner());
        if slot.running {
            let completion_id = slot.completion_id.clone().unwrap_or_default();
            return Err(Error::conflict_with(
                "completion_in_progress",
                json!({ "completionId": completion_id }),
            ));
        }
        let completion_id = id::new_id();
        slot.running = true;
        slot.completion_id = Some(completion_id.clone());
        // A new completion clears the previous buffer and retires any
        // receivers still tailing the old channel.
        slot.buffer.clear();
        slot.tx = broadcast::channel(CHUNK_CHANNEL_CAPACITY).0;
        slot.cancel = CancellationToken::new();
        Ok((completion_id, slot.cancel.clone()))
    }

    /// Append a chunk to the buffer and fan it to live receivers. Both
    /// happen under the slot lock so attach() can never interleave between
    /// them. Single writer: only the completion task calls this.
    fn push(&self, session_id: &str, chunk: Chunk) {
        let entry = self.entry(session_id);
        let mut slot = entry.lock().unwrap_or_else(|e| e.into_inner());
        let _ = slot.tx.send(chunk.clone());
        slot.buffer.push(chunk);
    }

    fn release(&self, session_id: &str) {
        let entry = self.entry(session_id);
        let mut slot = entry.lock().unwrap_or_else(|e| e.into_inner());
        slot.running = false;
    }

    /// Atomic replay-snapshot + live-subscribe; the lock guarantees the
    /// first live chunk follows the last replayed one with nothing lost.
    pub fn attach(&self, session_id: &str) -> Attached {
        let entry = self.entry(session_id);
        let slot = entry.lock().unwrap_or_else(|e| e.into_inner());
        Attached {
            replay: slot.buffer.clone(),
            live: slot.running.then(|| slot.tx.subscribe()),
        }
    }

    /// `(running, completion_id)` for conflict checks and status surfaces.
    pub fn status(&self, session_id: &str) -> (bool, Option<String>) {
        let entry = self.entry(session_id);
        let slot = entry.lock().unwrap_or_else(|e| e.into_inner());
        (slot.running, slot.completion_id.clone())
    }

    /// Start a completion: claim the slot, persist the user message, spawn
    /// the agent-side reader. Returns the completion ID.
    pub async fn start(
        self: &Arc<Self>,
        session_id: &str,
        user_parts: Vec<Part>,
        agent_payload: serde_json::Value,
    ) -> Result<String> {
        let (completion_id, cancel) = self.begin(session_id)?;

        if let Err(err) = self
            .store
            .create_message(session_id, MessageRole::User, &user_parts)
            .await
        {
            self.release(session_id);
            return Err(err);
        }

        let service = Arc::clone(self);
        let session_id = session_id.to_string();
        let completion = completion_id.clone();
        tokio::spawn(async move {
            service
                .run(&session_id, &completion, agent_payload, cancel)
                .await;
        });
        Ok(completion_id)
    }

    /// Cancel the in-flight completion: abort the agent via its HTTP
    /// surface and trip the local reader, which emits the synthetic
    /// `finish{stop}` and persists what was assembled so far.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let cancel = {
            let entry = self.entry(session_id);
            let slot = entry.lock().unwrap_or_else(|e| e.into_inner());
            if !slot.running {
                return Err(Error::conflict("no_active_completion"));
            }
            slot.cancel.clone()
        };
        let request = ProxyRequest::post_json("/chat/cancel", &json!({}));
        if let Err(err) = self.provider.http_proxy(session_id, request).await {
            tracing::warn!(session_id, error = %err, "agent-side cancel failed");
        }
        cancel.cancel();
        Ok(())
    }

    // -- completion task ----------------------------------------------------

    async fn run(
        self: Arc<Self>,
        session_id: &str,
        completion_id: &str,
        agent_payload: serde_json::Value,
        cancel: CancellationToken,
    ) {
        let mut assembler = MessageAssembler::new();

        let outcome = tokio::select! {
            r = self.stream_from_agent(session_id, &agent_payload, &mut assembler) => r,
            _ = cancel.cancelled() => Err(CompletionEnd::Cancelled),
        };

        match outcome {
            Ok(()) => {}
            Err(CompletionEnd::Cancelled) => {
                let chunk = Chunk::finish("stop");
                assembler.apply(&chunk);
                self.push(session_id, chunk);
            }
            Err(CompletionEnd::Failed(message)) => {
                // Stream errors never become HTTP errors mid-stream; the
                // client sees an error chunk and a clean [DONE].
                tracing::warn!(session_id, completion_id, error = %message, "completion failed");
                let chunk = Chunk::error(message);
                assembler.apply(&chunk);
                self.push(session_id, chunk);
            }
        }

        let parts = assembler.into_parts();
        if let Err(err) = self
            .store
            .create_message(session_id, MessageRole::Assistant, &parts)
            .await
        {
            tracing::error!(session_id, error = %err, "failed to persist assistant message");
        }

        self.release(session_id);

        if let Ok(session) = self.store.get_session(session_id).await {
            let _ = self
                .broker
                .publish(
                    &session.project_id,
                    EVENT_SESSION_UPDATED,
                    &json!({ "session": session }),
                )
                .await;
        }
    }

    /// Drive the agent SSE stream into the buffer and the assembler.
    async fn stream_from_agent(
        &self,
        session_id: &str,
        agent_payload: &serde_json::Value,
        assembler: &mut MessageAssembler,
    ) -> std::result::Result<(), CompletionEnd> {
        self.wait_for_session_ready(session_id).await?;

        let request = ProxyRequest::post_json("/chat", agent_payload)
            .header("accept", "text/event-stream");
        let response = self
            .provider
            .http_proxy(session_id, request)
            .await
            .map_err(|err| CompletionEnd::Failed(format!("agent stream open failed: {err}")))?;
        if response.status >= 400 {
            return Err(CompletionEnd::Failed(format!(
                "agent returned HTTP {}",
                response.status
            )));
        }

        let mut body = response.body;
        let mut parser = SseParser::default();
        while let Some(chunk_bytes) = body.next().await {
            let bytes =
                chunk_bytes.map_err(|err| CompletionEnd::Failed(format!("agent stream: {err}")))?;
            for payload in parser.feed(&bytes) {
                if payload == "[DONE]" {
                    if !assembler.is_finished() {
                        // Agent hung up without a terminal chunk.
                        let chunk = Chunk::finish("stop");
                        assembler.apply(&chunk);
                        self.push(session_id, chunk);
                    }
                    return Ok(());
                }
                let Some(chunk) = Chunk::parse(&payload) else {
                    tracing::debug!(session_id, "skipping unparseable agent chunk");
                    continue;
                };
                assembler.apply(&chunk);
                let terminal = chunk.is_terminal();
                self.push(session_id, chunk);
                if terminal {
                    return Ok(());
                }
            }
        }
        if !assembler.is_finished() {
            return Err(CompletionEnd::Failed("agent stream ended early".into()));
        }
        Ok(())
    }

    /// Sessions created by this chat call may still be provisioning; poll
    /// until the state machine reaches `running`.
    async fn wait_for_session_ready(
        &self,
        session_id: &str,
    ) -> std::result::Result<(), CompletionEnd> {
        let deadline = tokio::time::Instant::now() + self.session_ready_timeout;
        loop {
            let session = self
                .store
                .get_session(session_id)
                .await
                .map_err(|err| CompletionEnd::Failed(err.to_string()))?;
            match session.status {
                SessionStatus::Running => return Ok(()),
                SessionStatus::Error => {
                    return Err(CompletionEnd::Failed(
                        session
                            .error_message
                            .unwrap_or_else(|| "session is in error state".into()),
                    ));
                }
                SessionStatus::Closed => {
                    return Err(CompletionEnd::Failed("session is closed".into()));
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CompletionEnd::Failed(
                    "timed out waiting for session to start".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

enum CompletionEnd {
    Cancelled,
    Failed(String),
}

// ---------------------------------------------------------------------------
// SSE parsing
// ---------------------------------------------------------------------------

/// Incremental `text/event-stream` parser; yields `data:` payloads.
#[derive(Default)]
pub struct SseParser {
    buf: String,
}

impl SseParser {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut payloads = Vec::new();
        while let Some(idx) = self.buf.find("\n\n") {
            let frame: String = self.buf.drain(..idx + 2).collect();
            let mut data_lines = Vec::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
                }
            }
            if !data_lines.is_empty() {
                payloads.push(data_lines.join("\n"));
            }
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkspaceSource;
    use sandbox_runtime::{CreateOpts, MockProvider};

    async fn fixture(provider: Arc<dyn Provider>) -> (Store, Arc<EventBroker>, Arc<CompletionService>, String, String) {
        let store = Store::open_in_memory().await.unwrap();
        let broker = EventBroker::new(
            store.clone(),
            128,
            Duration::from_millis(25),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        let service = CompletionService::new(
            store.clone(),
            broker.clone(),
            provider,
            Duration::from_secs(5),
        );

        let user = store.ensure_user("github", "1", "a").await.unwrap();
        let project = store.create_project("p", "P", &user.id).await.unwrap();
        let ws = store
            .create_workspace(&project.id, "main", "/tmp/ws", WorkspaceSource::Local, None)
            .await
            .unwrap();
        let session = store
            .create_session(&project.id, &ws.id, None, "s", None)
            .await
            .unwrap();
        store
            .update_session_status(&session.id, SessionStatus::Running, None)
            .await
            .unwrap();
        (store, broker, service, project.id, session.id)
    }

    async fn drain_to_terminal(attached: &mut Attached) -> Vec<Chunk> {
        let mut chunks = attached.replay.clone();
        if chunks.iter().any(Chunk::is_terminal) {
            return chunks;
        }
        let live = attached.live.as_mut().expect("live stream");
        loop {
            match live.recv().await {
                Ok(chunk) => {
                    let terminal = chunk.is_terminal();
                    chunks.push(chunk);
                    if terminal {
                        return chunks;
                    }
                }
                Err(_) => return chunks,
            }
        }
    }

    #[tokio::test]
    async fn happy_path_streams_persists_and_emits() {
        let provider = Arc::new(MockProvider::new());
        let (store, broker, service, project, session_id) = fixture(provider.clone()).await;
        provider
            .create(&session_id, &CreateOpts::default())
            .await
            .unwrap();
        provider.start(&session_id).await.unwrap();
        let mut events = broker.subscribe(&project);

        let completion_id = service
            .start(
                &session_id,
                vec![Part::text("hi")],
                json!({"messages": []}),
            )
            .await
            .unwrap();
        assert!(!completion_id.is_empty());

        let mut attached = service.attach(&session_id);
        let chunks = drain_to_terminal(&mut attached).await;
        assert!(chunks.iter().any(|c| matches!(
            c,
            Chunk::Known(crate::message::KnownChunk::TextDelta { .. })
        )));
        assert!(chunks.last().unwrap().is_terminal());

        // Wait for the task to persist and release.
        for _ in 0..100 {
            if !service.status(&session_id).0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let messages = store.list_messages(&session_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(
            Part::collect_text(&messages[1].parts),
            "Hello from the sandbox."
        );

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, EVENT_SESSION_UPDATED);
    }

    #[tokio::test]
    async fn second_start_conflicts_with_completion_id() {
        let provider = Arc::new(MockProvider::new());
        let (_store, _broker, service, _project, sid) = fixture(provider.clone()).await;
        provider.create(&sid, &CreateOpts::default()).await.unwrap();
        provider.start(&sid).await.unwrap();

        let first = service
            .start(&sid, vec![Part::text("one")], json!({}))
            .await
            .unwrap();
        let err = service
            .start(&sid, vec![Part::text("two")], json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "completion_in_progress");
        match err {
            Error::Conflict { details: Some(details), .. } => {
                assert_eq!(details["completionId"], first);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_attach_replays_from_the_beginning() {
        // Replay law: a later-connecting client observes the full stream.
        let provider = Arc::new(MockProvider::new());
        let (_store, _broker, service, _project, sid) = fixture(provider.clone()).await;
        provider.create(&sid, &CreateOpts::default()).await.unwrap();
        provider.start(&sid).await.unwrap();

        service
            .start(&sid, vec![Part::text("hi")], json!({}))
            .await
            .unwrap();

        // Let the whole completion finish with no client attached.
        for _ in 0..200 {
            if !service.status(&sid).0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let attached = service.attach(&sid);
        assert!(attached.live.is_none());
        assert!(attached.replay.len() >= 4);
        assert!(matches!(
            attached.replay.first().unwrap(),
            Chunk::Known(crate::message::KnownChunk::Start { .. })
        ));
        assert!(attached.replay.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn cancel_without_completion_conflicts() {
        let provider = Arc::new(MockProvider::new());
        let (_store, _broker, service, _project, sid) = fixture(provider.clone()).await;
        provider.create(&sid, &CreateOpts::default()).await.unwrap();
        provider.start(&sid).await.unwrap();

        let err = service.cancel(&sid).await.unwrap_err();
        assert_eq!(err.code(), "no_active_completion");
    }

    #[tokio::test]
    async fn cancel_emits_synthetic_finish_and_persists() {
        // A script with no terminal chunk keeps the completion open until
        // cancelled.
        let provider = Arc::new(MockProvider::with_chat_script(vec![
            json!({"type": "text-start", "id": "t"}),
            json!({"type": "text-delta", "id": "t", "delta": "partial"}),
        ]));
        let (store, _broker, service, _project, sid) = fixture(provider.clone()).await;
        provider.create(&sid, &CreateOpts::default()).await.unwrap();
        provider.start(&sid).await.unwrap();

        service
            .start(&sid, vec![Part::text("hi")], json!({}))
            .await
            .unwrap();
        // Let the partial chunks arrive.
        tokio::time::sleep(Duration::from_millis(100)).await;
        service.cancel(&sid).await.unwrap();

        for _ in 0..100 {
            if !service.status(&sid).0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let attached = service.attach(&sid);
        assert!(attached.replay.last().unwrap().is_terminal());

        let messages = store.list_messages(&sid).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(Part::collect_text(&messages[1].parts), "partial");
    }

    #[test]
    fn sse_parser_handles_split_frames() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"data: {\"a\"").is_empty());
        let payloads = parser.feed(b":1}\n\ndata: [DONE]\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn sse_parser_joins_multiline_data() {
        let mut parser = SseParser::default();
        let payloads = parser.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(payloads, vec!["line1\nline2"]);
    }
}
