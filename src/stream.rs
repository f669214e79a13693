//! Consumer for the Dify streaming response body.
//!
//! The body is a sequence of byte chunks carrying newline-delimited
//! `data: <json>` records. Chunk boundaries fall anywhere, including inside
//! a multi-byte character, so bytes are buffered and only complete lines
//! are decoded.

use crate::dify::StreamEvent;
use crate::format::TextFormatter;
use crate::session::ChatSession;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use std::error::Error as StdError;
use thiserror::Error;

const DATA_PREFIX: &str = "data: ";

#[derive(Debug, Error)]
pub enum StreamError {
    /// The upstream sent an explicit `error` event.
    #[error("upstream error event: {0}")]
    Upstream(String),
    /// Reading the response body failed mid-stream.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn StdError + Send + Sync>),
}

/// Rendering target for one streamed answer. Abstracts the original
/// widget's DOM updates so the consumer is testable without a UI.
pub trait MessageSink {
    /// A new bot message has started.
    fn open_message(&mut self);
    /// Re-render the whole message with the given HTML. Called once per
    /// delta with the full formatted accumulation, not the delta alone.
    fn update_message(&mut self, html: &str);
    /// The message is complete; `conversation_id` is the session's current
    /// (possibly just-updated) conversation identifier.
    fn finalize_message(&mut self, conversation_id: &str);
    /// The stream failed; `message` is safe to show the user.
    fn report_error(&mut self, message: &str);
}

/// Splits raw bytes into complete lines, retaining a trailing partial line
/// across chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            match std::str::from_utf8(line) {
                Ok(text) => lines.push(text.trim_end_matches('\r').to_string()),
                Err(e) => warn!("Skipping non-UTF-8 stream line: {}", e),
            }
        }
        lines
    }
}

/// Decode one line of the stream. Returns `None` for anything that is not a
/// well-formed, recognized event record; such lines are skipped, never fatal.
pub fn parse_stream_line(line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix(DATA_PREFIX)?;
    match serde_json::from_str::<StreamEvent>(data) {
        Ok(event) => event.into_known(),
        Err(e) => {
            warn!("Skipping malformed stream record: {} (data: {})", e, data);
            None
        }
    }
}

/// Drives a [`MessageSink`] from a streaming response body, owning the
/// pending-text accumulator for the one answer in flight.
pub struct StreamConsumer<'a, S: MessageSink> {
    session: &'a mut ChatSession,
    sink: &'a mut S,
    formatter: TextFormatter,
    pending: String,
    message_open: bool,
}

impl<'a, S: MessageSink> StreamConsumer<'a, S> {
    pub fn new(session: &'a mut ChatSession, sink: &'a mut S, formatter: TextFormatter) -> Self {
        Self {
            session,
            sink,
            formatter,
            pending: String::new(),
            message_open: false,
        }
    }

    /// Read the body to completion, one chunk at a time, in arrival order.
    ///
    /// An upstream `error` event or a transport failure terminates the read
    /// after notifying the sink. End-of-data with a message still open
    /// leaves it rendered as-is; the well-behaved upstream sends
    /// `message_end` first.
    pub async fn consume<B, C, E>(&mut self, mut body: B) -> Result<(), StreamError>
    where
        B: Stream<Item = Result<C, E>> + Unpin,
        C: AsRef<[u8]>,
        E: StdError + Send + Sync + 'static,
    {
        let mut buffer = LineBuffer::new();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    self.sink.report_error("connection to the chat service was lost");
                    return Err(StreamError::Transport(Box::new(e)));
                }
            };
            for line in buffer.push(chunk.as_ref()) {
                if let Some(event) = parse_stream_line(&line) {
                    self.handle_event(event)?;
                }
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: StreamEvent) -> Result<(), StreamError> {
        match event {
            StreamEvent::Message { answer } => {
                if !self.message_open {
                    self.sink.open_message();
                    self.message_open = true;
                }
                self.pending.push_str(&answer);
                let html = self.formatter.format(&self.pending);
                self.sink.update_message(&html);
            }
            StreamEvent::MessageEnd { conversation_id } => {
                if let Some(id) = conversation_id {
                    debug!("Conversation id updated to {}", id);
                    self.session.set_conversation_id(id);
                }
                self.pending.clear();
                self.message_open = false;
                self.sink.finalize_message(self.session.conversation_id());
            }
            StreamEvent::Error { message } => {
                self.sink.report_error(&message);
                return Err(StreamError::Upstream(message));
            }
            StreamEvent::Unknown => {}
        }
        Ok(())
    }
}
