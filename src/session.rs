use crate::io_struct::{ChatReqInput, ConversationMessage};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// Shown as the assistant turn whenever a generation request or its stream
/// fails; partial content is discarded.
pub const FALLBACK_REPLY: &str = "Sorry, I encountered an error. Please try again.";

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, SessionError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat endpoint returned status {0}")]
    Status(u16),
}

/// How a session submits a conversation and receives the reply stream.
/// Production uses [`HttpChatTransport`]; tests script the outcome.
pub trait ChatTransport {
    fn send(
        &self,
        messages: &[ConversationMessage],
    ) -> impl Future<Output = Result<ChunkStream, SessionError>> + Send;
}

/// Posts the conversation to the gateway's chat endpoint and exposes the
/// response body as the chunk stream.
#[derive(Debug, Clone)]
pub struct HttpChatTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpChatTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        HttpChatTransport {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

impl ChatTransport for HttpChatTransport {
    async fn send(&self, messages: &[ConversationMessage]) -> Result<ChunkStream, SessionError> {
        let body = ChatReqInput {
            messages: messages.to_vec(),
        };
        let resp = self.client.post(&self.endpoint).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(SessionError::Status(resp.status().as_u16()));
        }
        Ok(Box::pin(resp.bytes_stream().map(|r| r.map_err(SessionError::from))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    Idle,
    Sending,
    Streaming,
}

/// Keystrokes the input field understands. A plain Enter commits the buffer;
/// Shift+Enter inserts a literal newline instead.
#[derive(Debug, Clone, Copy)]
pub enum KeyInput {
    Char(char),
    Enter { shift: bool },
}

/// One chat view: the conversation so far, the input buffer, and the state
/// of the in-flight turn.
///
/// The render observer is invoked with the full message list and the loading
/// flag after every state change, including once per received chunk while a
/// reply is streaming in. The conversation only grows; each user turn is
/// followed by exactly one assistant turn (streamed, finished, or the
/// fallback on error). A failed turn never poisons the session.
pub struct ChatSession<T: ChatTransport> {
    transport: T,
    messages: Vec<ConversationMessage>,
    input: String,
    state: TurnState,
    render: Box<dyn FnMut(&[ConversationMessage], bool)>,
}

impl<T: ChatTransport> ChatSession<T> {
    pub fn new(transport: T, render: impl FnMut(&[ConversationMessage], bool) + 'static) -> Self {
        ChatSession {
            transport,
            messages: Vec::new(),
            input: String::new(),
            state: TurnState::Idle,
            render: Box::new(render),
        }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn is_loading(&self) -> bool {
        self.state != TurnState::Idle
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    pub async fn handle_key(&mut self, key: KeyInput) {
        match key {
            KeyInput::Char(c) => self.input.push(c),
            KeyInput::Enter { shift: true } => self.input.push('\n'),
            KeyInput::Enter { shift: false } => self.submit().await,
        }
    }

    /// Guard half of a submission: trims the input, refuses empty input and
    /// re-entrant submits, and otherwise appends the user message and enters
    /// the loading state. Returns whether a turn was started.
    pub fn begin_submit(&mut self) -> bool {
        if self.is_loading() {
            return false;
        }
        let text = self.input.trim();
        if text.is_empty() {
            return false;
        }
        let text = text.to_string();
        self.messages.push(ConversationMessage::user(text));
        self.input.clear();
        self.state = TurnState::Sending;
        self.emit();
        true
    }

    /// Run one full turn: submit the conversation and consume the reply
    /// stream to completion, re-rendering after every chunk. No-op if the
    /// input is empty after trimming or a turn is already in flight.
    pub async fn submit(&mut self) {
        if !self.begin_submit() {
            return;
        }
        self.drive_turn().await;
    }

    async fn drive_turn(&mut self) {
        let sent = self.transport.send(&self.messages).await;
        match sent {
            Ok(mut stream) => {
                let mut raw = Vec::new();
                loop {
                    match stream.next().await {
                        Some(Ok(chunk)) => {
                            self.state = TurnState::Streaming;
                            raw.extend_from_slice(&chunk);
                            // decode from the full byte accumulation, not per
                            // chunk: a multi-byte character split across two
                            // chunks is whole again once its tail arrives
                            let assistant = String::from_utf8_lossy(&raw).into_owned();
                            self.render_partial(&assistant);
                        }
                        Some(Err(e)) => {
                            log::warn!("chat stream failed: {}", e);
                            self.fail_turn();
                            return;
                        }
                        // stream closure is the only completion signal
                        None => break,
                    }
                }
                let assistant = String::from_utf8_lossy(&raw).into_owned();
                self.messages.push(ConversationMessage::assistant(assistant));
                self.state = TurnState::Idle;
                self.emit();
            }
            Err(e) => {
                log::warn!("chat request failed: {}", e);
                self.fail_turn();
            }
        }
    }

    fn fail_turn(&mut self) {
        self.messages.push(ConversationMessage::assistant(FALLBACK_REPLY));
        self.state = TurnState::Idle;
        self.emit();
    }

    // Full re-render per chunk: prior messages plus the partial assistant
    // message, not a diff.
    fn render_partial(&mut self, assistant: &str) {
        let mut view = self.messages.clone();
        view.push(ConversationMessage::assistant(assistant));
        (self.render)(&view, true);
    }

    fn emit(&mut self) {
        let loading = self.is_loading();
        (self.render)(&self.messages, loading);
    }
}
