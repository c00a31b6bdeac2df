//! The streaming chat session: one open answer stream at a time, frames fed
//! through the turn dispatcher as they arrive.

use crate::citations::CitationSet;
use crate::client::{ChatTransport, QueryRequest};
use crate::config::AppConfig;
use crate::dispatcher::{SessionEvent, TurnDispatcher, TurnState};
use crate::error::{ChatError, ChatResult};
use crate::sse::{FramingMode, StreamFrame, frame_stream};
use crate::store::CredentialStore;
use crate::types::ChatMessage;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

type FrameStream = Pin<Box<dyn Stream<Item = ChatResult<StreamFrame>> + Send>>;

pub struct StreamingChatSession {
    transport: Box<dyn ChatTransport>,
    store: Arc<dyn CredentialStore>,
    dispatcher: TurnDispatcher,
    active: Option<FrameStream>,
    conversation_id: Option<String>,
    persist_transcript: bool,
    framing: FramingMode,
    stream_timeout: Duration,
    max_message_length: usize,
    tool_groups: Vec<String>,
    tool_names: Vec<String>,
    enabled_tools: Vec<String>,
    top_k: u32,
    mode: Option<String>,
}

impl StreamingChatSession {
    pub fn new(
        config: &AppConfig,
        transport: Box<dyn ChatTransport>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let dispatcher = TurnDispatcher::new(
            config.system_prompt.clone(),
            config.allowed_domains.clone(),
            config.history_window,
        );
        Self {
            transport,
            store,
            dispatcher,
            active: None,
            conversation_id: None,
            persist_transcript: false,
            framing: config.framing,
            stream_timeout: config.stream_timeout,
            max_message_length: config.max_message_length,
            tool_groups: config.tool_groups.clone(),
            tool_names: config.tool_names.clone(),
            enabled_tools: config.enabled_tools.clone(),
            top_k: config.top_k,
            mode: config.mode.clone(),
        }
    }

    /// Keeps the conversation in the store between runs and reloads any
    /// previously saved one. Without this every session starts a new
    /// conversation and leaves the saved one untouched.
    pub fn with_persisted_transcript(mut self) -> Self {
        self.persist_transcript = true;
        self.conversation_id = self.store.conversation_id();
        let saved = self.store.transcript();
        if !saved.is_empty() {
            tracing::info!(messages = saved.len(), "restored saved conversation");
            self.dispatcher.restore(saved);
        }
        self
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        self.dispatcher.transcript()
    }

    pub fn citations(&self) -> Option<&CitationSet> {
        self.dispatcher.citations()
    }

    pub fn state(&self) -> TurnState {
        self.dispatcher.state()
    }

    pub fn is_first_turn(&self) -> bool {
        self.dispatcher.is_first_turn()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    /// Starts a turn: closes any open stream, records the user message and
    /// opens the answer stream. Request failures come back as events, not
    /// errors, so the transcript always shows what happened.
    pub async fn begin(&mut self, text: &str) -> ChatResult<Vec<SessionEvent>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        if text.chars().count() > self.max_message_length {
            return Err(ChatError::Input(format!(
                "Message is too long (limit {} characters).",
                self.max_message_length
            )));
        }

        let mut events = self.cancel();
        let turn = self.dispatcher.begin_turn(text);
        events.extend(turn.events);

        if self.conversation_id.is_none() {
            match self.transport.start_conversation().await {
                Ok(Some(id)) => self.remember_conversation(id),
                Ok(None) => {}
                Err(err) => {
                    events.extend(self.fail_request(err));
                    return Ok(events);
                }
            }
        }

        let request = QueryRequest {
            message: turn.message,
            context_history: turn.context,
            tool_groups: self.tool_groups.clone(),
            tool_names: self.tool_names.clone(),
            enabled_tools: self.enabled_tools.clone(),
            top_k: Some(self.top_k),
            conversation_id: self.conversation_id.clone(),
            mode: self.mode.clone(),
        };

        match self.transport.open_stream(&request).await {
            Ok(bytes) => {
                self.dispatcher.mark_sent();
                self.active = Some(Box::pin(frame_stream(bytes, self.framing)));
            }
            Err(err) => events.extend(self.fail_request(err)),
        }
        Ok(events)
    }

    /// Waits for the next frame of the open stream. `None` once no stream is open.
    pub async fn next_events(&mut self) -> Option<Vec<SessionEvent>> {
        let stream = self.active.as_mut()?;
        let next = tokio::time::timeout(self.stream_timeout, stream.next()).await;

        let events = match next {
            Ok(Some(Ok(frame))) => {
                self.capture_conversation(&frame);
                self.dispatcher.on_frame(&frame)
            }
            Ok(Some(Err(err))) => {
                tracing::warn!(%err, "answer stream failed");
                self.dispatcher.on_failure(None)
            }
            Ok(None) => {
                tracing::debug!("answer stream ended");
                self.dispatcher.on_end_of_input()
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.stream_timeout, "answer stream went quiet");
                self.dispatcher.on_failure(None)
            }
        };

        if !self.dispatcher.state().is_active() {
            self.finish_turn();
        }
        Some(events)
    }

    /// Runs a whole turn, handing every event to `on_event`.
    pub async fn send<F>(&mut self, text: &str, mut on_event: F) -> ChatResult<()>
    where
        F: FnMut(&SessionEvent),
    {
        for event in self.begin(text).await? {
            on_event(&event);
        }
        while let Some(events) = self.next_events().await {
            for event in &events {
                on_event(event);
            }
        }
        Ok(())
    }

    /// Closes the open stream, if any, and abandons its turn.
    pub fn cancel(&mut self) -> Vec<SessionEvent> {
        if self.active.take().is_some() {
            tracing::info!("closed previous answer stream");
        }
        self.dispatcher.abort()
    }

    fn fail_request(&mut self, err: ChatError) -> Vec<SessionEvent> {
        tracing::error!(%err, "chat request failed");
        let events = self.dispatcher.on_failure(Some(&err.to_string()));
        self.dispatcher.reset();
        events
    }

    fn finish_turn(&mut self) {
        self.active = None;
        let completed = self.dispatcher.state() == TurnState::Done;
        self.dispatcher.reset();
        if completed
            && self.persist_transcript
            && let Err(err) = self.store.save_transcript(self.dispatcher.context())
        {
            tracing::warn!(%err, "could not save conversation");
        }
    }

    fn capture_conversation(&mut self, frame: &StreamFrame) {
        if self.conversation_id.is_some() {
            return;
        }
        if let Some(id) = frame
            .payload
            .get("conversation_id")
            .and_then(|value| value.as_str())
        {
            self.remember_conversation(id.to_string());
        }
    }

    fn remember_conversation(&mut self, id: String) {
        tracing::debug!(conversation_id = %id, "conversation established");
        if self.persist_transcript
            && let Err(err) = self.store.save_conversation_id(&id)
        {
            tracing::warn!(%err, "could not save conversation id");
        }
        self.conversation_id = Some(id);
    }
}
