//! Turn state machine.
//!
//! Frames go in, renderer-independent [`SessionEvent`]s come out. Nothing in
//! here touches the network or a terminal, so the transcript rules can be
//! exercised directly.

use crate::citations::CitationSet;
use crate::sse::{DEFAULT_EVENT, StreamFrame};
use crate::types::{ChatMessage, Role};
use serde_json::Value;

pub const DEFAULT_BUSY_LABEL: &str = "Consulting Home Affairs Database...";
pub const THINKING_LABEL: &str = "Thinking...";
pub const NO_RESPONSE_MESSAGE: &str =
    "Sorry, I couldn't generate a response. Please try rephrasing your question.";
pub const ERROR_MESSAGE: &str = "Sorry, an error occurred while processing your request.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingResponse,
    Streaming,
    Done,
    Error,
}

impl TurnState {
    pub fn is_active(self) -> bool {
        matches!(self, TurnState::AwaitingResponse | TurnState::Streaming)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusyIndicator {
    Hidden,
    Shown(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    MessageAppended { index: usize, message: ChatMessage },
    /// Full replacement of the message body, never a patch.
    MessageUpdated { index: usize, content: String },
    CitationsReplaced(CitationSet),
    StatusChanged(BusyIndicator),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Start,
    Thinking,
    ToolStart,
    AnswerChunk,
    Sources,
    AnswerDone,
    Done,
    Error,
    Other,
}

impl FrameKind {
    pub fn classify(frame: &StreamFrame) -> Self {
        match frame.event.as_str() {
            "start" => FrameKind::Start,
            "thinking" => FrameKind::Thinking,
            "tool_start" => FrameKind::ToolStart,
            "answer_chunk" | "chunk" => FrameKind::AnswerChunk,
            "sources" => FrameKind::Sources,
            "answer_done" | "answer" => FrameKind::AnswerDone,
            "done" => FrameKind::Done,
            "error" => FrameKind::Error,
            DEFAULT_EVENT | "" => Self::classify_by_shape(&frame.payload),
            _ => FrameKind::Other,
        }
    }

    // Older hub builds send bare payloads and let the keys speak for themselves.
    fn classify_by_shape(payload: &Value) -> Self {
        if payload.get("chunk").is_some() {
            FrameKind::AnswerChunk
        } else if payload.get("sources").is_some() {
            FrameKind::Sources
        } else if payload.get("answer").is_some() {
            FrameKind::AnswerDone
        } else if payload.get("intent").is_some() {
            FrameKind::Start
        } else if payload.get("error").is_some() {
            FrameKind::Error
        } else {
            FrameKind::Other
        }
    }

    pub fn is_content(self) -> bool {
        matches!(self, FrameKind::AnswerChunk | FrameKind::AnswerDone)
    }
}

/// What to put on the wire for a freshly started turn.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingTurn {
    pub message: String,
    pub context: Vec<ChatMessage>,
    pub events: Vec<SessionEvent>,
}

struct InProgress {
    index: usize,
    content: String,
}

pub struct TurnDispatcher {
    state: TurnState,
    transcript: Vec<ChatMessage>,
    context: Vec<ChatMessage>,
    citations: Option<CitationSet>,
    in_progress: Option<InProgress>,
    busy_visible: bool,
    first_turn: bool,
    system_prompt: String,
    allowed_domains: Vec<String>,
    history_window: usize,
}

impl TurnDispatcher {
    pub fn new(
        system_prompt: impl Into<String>,
        allowed_domains: Vec<String>,
        history_window: usize,
    ) -> Self {
        Self {
            state: TurnState::Idle,
            transcript: Vec::new(),
            context: Vec::new(),
            citations: None,
            in_progress: None,
            busy_visible: false,
            first_turn: true,
            system_prompt: system_prompt.into(),
            allowed_domains,
            history_window,
        }
    }

    /// Seeds transcript and context from a previously saved conversation.
    pub fn restore(&mut self, messages: Vec<ChatMessage>) {
        self.transcript = messages.clone();
        self.context = messages;
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    /// Messages that count as conversation history: user turns and
    /// completed answers, never fallbacks or aborted partials.
    pub fn context(&self) -> &[ChatMessage] {
        &self.context
    }

    pub fn citations(&self) -> Option<&CitationSet> {
        self.citations.as_ref()
    }

    pub fn is_first_turn(&self) -> bool {
        self.first_turn
    }

    /// Starts a turn. An active turn is aborted first.
    pub fn begin_turn(&mut self, text: &str) -> OutgoingTurn {
        let mut events = self.abort();

        let skip = self.context.len().saturating_sub(self.history_window);
        let context = self.context[skip..].to_vec();

        let user = ChatMessage::user(text);
        self.context.push(user.clone());
        events.push(self.append(user));
        events.push(self.show_busy(DEFAULT_BUSY_LABEL.to_string()));

        self.in_progress = None;
        self.state = TurnState::AwaitingResponse;

        let message = if self.first_turn && !self.system_prompt.is_empty() {
            format!("{}\n\nUser Question: {}", self.system_prompt, text)
        } else {
            text.to_string()
        };

        OutgoingTurn {
            message,
            context,
            events,
        }
    }

    /// The hub accepted the request; the preamble is not sent again.
    pub fn mark_sent(&mut self) {
        self.first_turn = false;
    }

    pub fn on_frame(&mut self, frame: &StreamFrame) -> Vec<SessionEvent> {
        if !self.state.is_active() {
            tracing::debug!(event = %frame.event, state = ?self.state, "frame outside an active turn");
            return Vec::new();
        }
        self.state = TurnState::Streaming;

        let kind = FrameKind::classify(frame);
        let payload = &frame.payload;
        match kind {
            FrameKind::Start => {
                tracing::debug!(payload = %payload, "turn started");
                Vec::new()
            }
            FrameKind::Thinking => {
                let label = str_field(payload, &["message", "content", "status"])
                    .unwrap_or(THINKING_LABEL)
                    .to_string();
                self.relabel(label)
            }
            FrameKind::ToolStart => {
                let label = match str_field(payload, &["tool", "tool_name", "name"]) {
                    Some(tool) => format!("Searching with {tool}..."),
                    None => "Searching...".to_string(),
                };
                self.relabel(label)
            }
            FrameKind::AnswerChunk => {
                match str_field(payload, &["chunk", "content", "text"]) {
                    Some(piece) => self.append_chunk(piece),
                    None => Vec::new(),
                }
            }
            FrameKind::Sources => {
                let records = payload
                    .get("sources")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let set = CitationSet::from_sources(records, &self.allowed_domains);
                self.citations = Some(set.clone());
                vec![SessionEvent::CitationsReplaced(set)]
            }
            FrameKind::AnswerDone => match str_field(payload, &["answer"]) {
                Some(answer) => self.replace_answer(answer.to_string()),
                None => Vec::new(),
            },
            FrameKind::Done => self.complete(),
            FrameKind::Error => {
                let detail = str_field(payload, &["message", "error", "detail"]);
                tracing::warn!(detail = ?detail, "hub reported an error frame");
                self.fail(None)
            }
            FrameKind::Other => {
                tracing::debug!(event = %frame.event, "ignoring frame");
                Vec::new()
            }
        }
    }

    /// The stream ran out. Same as a `done` frame unless the turn already ended.
    pub fn on_end_of_input(&mut self) -> Vec<SessionEvent> {
        self.complete()
    }

    /// Request or stream failure. `detail` is shown to the user verbatim when
    /// no partial answer exists.
    pub fn on_failure(&mut self, detail: Option<&str>) -> Vec<SessionEvent> {
        self.fail(detail)
    }

    /// Drops the active turn without a fallback message.
    pub fn abort(&mut self) -> Vec<SessionEvent> {
        if !self.state.is_active() {
            return Vec::new();
        }
        tracing::debug!("aborting active turn");
        let mut events = Vec::new();
        events.extend(self.hide_busy());
        self.in_progress = None;
        self.state = TurnState::Idle;
        events
    }

    /// Returns a finished or failed turn to idle.
    pub fn reset(&mut self) {
        if !self.state.is_active() {
            self.state = TurnState::Idle;
        }
        self.in_progress = None;
    }

    fn complete(&mut self) -> Vec<SessionEvent> {
        if !self.state.is_active() {
            return Vec::new();
        }
        let mut events = Vec::new();
        events.extend(self.hide_busy());
        match self.in_progress.take() {
            Some(answer) => self.context.push(ChatMessage::assistant(answer.content)),
            None => events.push(self.append(ChatMessage::assistant(NO_RESPONSE_MESSAGE))),
        }
        self.state = TurnState::Done;
        events
    }

    fn fail(&mut self, detail: Option<&str>) -> Vec<SessionEvent> {
        if !self.state.is_active() {
            return Vec::new();
        }
        let mut events = Vec::new();
        events.extend(self.hide_busy());
        if self.in_progress.take().is_none() {
            let content = match detail {
                Some(detail) => format!("Sorry, an error occurred: {detail}"),
                None => ERROR_MESSAGE.to_string(),
            };
            events.push(self.append(ChatMessage::assistant(content)));
        }
        self.state = TurnState::Error;
        events
    }

    fn append_chunk(&mut self, piece: &str) -> Vec<SessionEvent> {
        let mut events = self.ensure_answer();
        if let Some(answer) = self.in_progress.as_mut() {
            answer.content.push_str(piece);
            events.push(self.render_answer());
        }
        events
    }

    fn replace_answer(&mut self, answer: String) -> Vec<SessionEvent> {
        let mut events = self.ensure_answer();
        if let Some(current) = self.in_progress.as_mut() {
            current.content = answer;
            events.push(self.render_answer());
        }
        events
    }

    fn ensure_answer(&mut self) -> Vec<SessionEvent> {
        if self.in_progress.is_some() {
            return Vec::new();
        }
        let mut events = Vec::new();
        events.extend(self.hide_busy());
        let event = self.append(ChatMessage::assistant(String::new()));
        self.in_progress = Some(InProgress {
            index: self.transcript.len() - 1,
            content: String::new(),
        });
        events.push(event);
        events
    }

    fn render_answer(&mut self) -> SessionEvent {
        let answer = self
            .in_progress
            .as_ref()
            .map(|a| (a.index, a.content.clone()))
            .unwrap_or_default();
        let (index, content) = answer;
        if let Some(message) = self.transcript.get_mut(index) {
            debug_assert_eq!(message.role, Role::Assistant);
            message.content = content.clone();
        }
        SessionEvent::MessageUpdated { index, content }
    }

    fn append(&mut self, message: ChatMessage) -> SessionEvent {
        self.transcript.push(message.clone());
        SessionEvent::MessageAppended {
            index: self.transcript.len() - 1,
            message,
        }
    }

    fn relabel(&mut self, label: String) -> Vec<SessionEvent> {
        // Once the answer is on screen the indicator stays hidden.
        if self.in_progress.is_some() {
            return Vec::new();
        }
        vec![self.show_busy(label)]
    }

    fn show_busy(&mut self, label: String) -> SessionEvent {
        self.busy_visible = true;
        SessionEvent::StatusChanged(BusyIndicator::Shown(label))
    }

    fn hide_busy(&mut self) -> Option<SessionEvent> {
        if !self.busy_visible {
            return None;
        }
        self.busy_visible = false;
        Some(SessionEvent::StatusChanged(BusyIndicator::Hidden))
    }
}

fn str_field<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher() -> TurnDispatcher {
        TurnDispatcher::new(
            "Only answer from had.gov.hk.",
            vec!["https://www.had.gov.hk/".to_string()],
            10,
        )
    }

    fn frame(event: &str, payload: Value) -> StreamFrame {
        StreamFrame::new(event, payload)
    }

    fn assistant_count(d: &TurnDispatcher) -> usize {
        d.transcript()
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count()
    }

    #[test]
    fn preamble_only_on_first_sent_turn() {
        let mut d = dispatcher();
        let first = d.begin_turn("How do I book a community hall?");
        assert!(first.message.starts_with("Only answer from had.gov.hk."));
        assert!(first.message.ends_with("User Question: How do I book a community hall?"));
        assert_eq!(d.transcript()[0].content, "How do I book a community hall?");
        d.mark_sent();
        d.on_frame(&frame("answer_chunk", json!({"chunk": "Apply online."})));
        d.on_end_of_input();

        let second = d.begin_turn("And the fee?");
        assert_eq!(second.message, "And the fee?");
        assert_eq!(
            second.context,
            vec![
                ChatMessage::user("How do I book a community hall?"),
                ChatMessage::assistant("Apply online."),
            ]
        );
    }

    #[test]
    fn failed_send_keeps_preamble_for_retry() {
        let mut d = dispatcher();
        d.begin_turn("first");
        d.on_failure(Some("HTTP 500: boom"));
        d.reset();
        assert!(d.begin_turn("again").message.contains("User Question: again"));
    }

    #[test]
    fn chunks_accumulate_into_one_message() {
        let mut d = dispatcher();
        d.begin_turn("q");
        let first = d.on_frame(&frame("answer_chunk", json!({"chunk": "Hello"})));
        assert_eq!(
            first,
            vec![
                SessionEvent::StatusChanged(BusyIndicator::Hidden),
                SessionEvent::MessageAppended {
                    index: 1,
                    message: ChatMessage::assistant(""),
                },
                SessionEvent::MessageUpdated {
                    index: 1,
                    content: "Hello".into(),
                },
            ]
        );
        let second = d.on_frame(&frame("answer_chunk", json!({"content": " world"})));
        assert_eq!(
            second,
            vec![SessionEvent::MessageUpdated {
                index: 1,
                content: "Hello world".into(),
            }]
        );
        assert_eq!(d.state(), TurnState::Streaming);
        d.on_frame(&frame("done", json!({"status": "ok"})));
        assert_eq!(d.state(), TurnState::Done);
        assert_eq!(d.transcript()[1].content, "Hello world");
    }

    #[test]
    fn end_without_answer_adds_exactly_one_fallback() {
        let mut d = dispatcher();
        d.begin_turn("q");
        d.on_frame(&frame("thinking", json!({"message": "Looking up"})));
        let events = d.on_end_of_input();
        assert!(events.contains(&SessionEvent::StatusChanged(BusyIndicator::Hidden)));
        assert_eq!(assistant_count(&d), 1);
        assert_eq!(d.transcript()[1].content, NO_RESPONSE_MESSAGE);

        assert!(d.on_end_of_input().is_empty());
        assert_eq!(assistant_count(&d), 1);
    }

    #[test]
    fn done_then_end_of_input_is_single_fallback() {
        let mut d = dispatcher();
        d.begin_turn("q");
        d.on_frame(&frame("done", json!({"ok": true})));
        d.on_end_of_input();
        assert_eq!(assistant_count(&d), 1);
        assert_eq!(d.context().len(), 1);
    }

    #[test]
    fn status_frames_relabel_without_hiding() {
        let mut d = dispatcher();
        d.begin_turn("q");
        assert_eq!(
            d.on_frame(&frame("tool_start", json!({"tool": "web_search"}))),
            vec![SessionEvent::StatusChanged(BusyIndicator::Shown(
                "Searching with web_search...".into()
            ))]
        );
        assert_eq!(
            d.on_frame(&frame("thinking", json!({}))),
            vec![SessionEvent::StatusChanged(BusyIndicator::Shown(
                THINKING_LABEL.into()
            ))]
        );
        assert_eq!(d.state(), TurnState::Streaming);
    }

    #[test]
    fn error_frame_keeps_partial_answer() {
        let mut d = dispatcher();
        d.begin_turn("q");
        d.on_frame(&frame("answer_chunk", json!({"chunk": "Partial"})));
        let events = d.on_frame(&frame("error", json!({"message": "upstream timeout"})));
        assert!(events.is_empty());
        assert_eq!(d.state(), TurnState::Error);
        assert_eq!(d.transcript()[1].content, "Partial");
        assert_eq!(d.context().len(), 1);
        d.reset();
        assert_eq!(d.state(), TurnState::Idle);
    }

    #[test]
    fn failure_before_answer_surfaces_detail() {
        let mut d = dispatcher();
        d.begin_turn("q");
        d.on_failure(Some("HTTP 403: forbidden"));
        assert_eq!(
            d.transcript()[1].content,
            "Sorry, an error occurred: HTTP 403: forbidden"
        );
    }

    #[test]
    fn sources_replace_citations_wholesale() {
        let mut d = dispatcher();
        d.begin_turn("q");
        d.on_frame(&frame(
            "sources",
            json!({"sources": [
                {"url": "https://www.had.gov.hk/x", "title": "X"},
                {"url": "https://evil.example/y"}
            ]}),
        ));
        assert_eq!(d.citations().map(|c| c.citations().len()), Some(1));

        let events = d.on_frame(&frame("sources", json!({"sources": []})));
        assert_eq!(
            events,
            vec![SessionEvent::CitationsReplaced(CitationSet::NoneAvailable)]
        );
        assert!(!d.citations().is_some_and(CitationSet::opens_panel));
    }

    #[test]
    fn answer_done_replaces_accumulated_text() {
        let mut d = dispatcher();
        d.begin_turn("q");
        d.on_frame(&frame("answer_chunk", json!({"chunk": "Draft"})));
        d.on_frame(&frame("answer_done", json!({"answer": "Final answer"})));
        d.on_frame(&frame("done", json!({"ok": true})));
        assert_eq!(d.context().last(), Some(&ChatMessage::assistant("Final answer")));
    }

    #[test]
    fn legacy_payloads_are_classified_by_shape() {
        assert_eq!(
            FrameKind::classify(&frame(DEFAULT_EVENT, json!({"chunk": "a"}))),
            FrameKind::AnswerChunk
        );
        assert_eq!(
            FrameKind::classify(&frame(DEFAULT_EVENT, json!({"sources": []}))),
            FrameKind::Sources
        );
        assert_eq!(
            FrameKind::classify(&frame(DEFAULT_EVENT, json!({"answer": "a"}))),
            FrameKind::AnswerDone
        );
        assert_eq!(
            FrameKind::classify(&frame(DEFAULT_EVENT, json!({"intent": "faq"}))),
            FrameKind::Start
        );
        assert_eq!(
            FrameKind::classify(&frame("tool_end", json!({"chunk": "a"}))),
            FrameKind::Other
        );
    }

    #[test]
    fn abort_discards_turn_and_ignores_late_frames() {
        let mut d = dispatcher();
        d.begin_turn("first");
        d.on_frame(&frame("answer_chunk", json!({"chunk": "half"})));
        let next = d.begin_turn("second");
        assert!(next.context.iter().all(|m| m.content != "half"));
        assert_eq!(d.state(), TurnState::AwaitingResponse);

        d.abort();
        assert!(d.on_frame(&frame("answer_chunk", json!({"chunk": "late"}))).is_empty());
        assert!(d.transcript().iter().all(|m| m.content != "late"));
    }

    #[test]
    fn context_is_bounded_to_window() {
        let mut d = TurnDispatcher::new("", Vec::new(), 3);
        for i in 0..4 {
            d.begin_turn(&format!("q{i}"));
            d.on_frame(&frame("answer_chunk", json!({"chunk": format!("a{i}")})));
            d.on_end_of_input();
        }
        let turn = d.begin_turn("last");
        assert_eq!(turn.message, "last");
        let contents: Vec<_> = turn.context.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["a2", "q3", "a3"]);
    }
}
