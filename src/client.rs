//! Chat endpoint client
//!
//! Posts a prompt (typed text or a recorded utterance) together with the
//! recent conversation to the chat endpoint. The endpoint answers with the
//! synthesized reply as a raw PCM body; the transcript of the prompt and the
//! reply text travel in percent-encoded `X-Transcript` / `X-Response` headers.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use crate::config::ChatConfig;
use crate::{Error, Result};

/// Header carrying the transcript of the prompt
pub const TRANSCRIPT_HEADER: &str = "X-Transcript";

/// Header carrying the reply text
pub const RESPONSE_HEADER: &str = "X-Response";

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person talking to the assistant
    User,
    /// The assistant
    Assistant,
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who said it
    pub role: Role,
    /// What was said
    pub content: String,
}

impl ChatMessage {
    /// A user turn
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An assistant turn
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Prompt sent to the endpoint
#[derive(Debug, Clone)]
pub enum ChatInput {
    /// Typed text, used as the transcript as-is
    Text(String),
    /// Recorded utterance as WAV bytes, transcribed by the endpoint
    Audio(Vec<u8>),
}

/// Error body returned by the endpoint
#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Reply to one chat request
pub struct ChatReply {
    /// What the endpoint understood
    pub transcript: String,
    /// What the assistant answered
    pub response: String,
    audio: reqwest::Response,
}

impl std::fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatReply")
            .field("transcript", &self.transcript)
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

impl ChatReply {
    /// The synthesized reply as a raw `f32le` PCM byte stream
    #[must_use]
    pub fn into_audio_stream(self) -> BoxStream<'static, Result<Bytes>> {
        self.audio.bytes_stream().map_err(Error::from).boxed()
    }
}

/// Talks to the chat endpoint and keeps the conversation history
pub struct ChatClient {
    client: reqwest::Client,
    endpoint: String,
    history: Vec<ChatMessage>,
    history_limit: usize,
}

impl ChatClient {
    /// Create a client for the configured endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            history: Vec::new(),
            history_limit: config.history_limit,
        })
    }

    /// Conversation so far, oldest first
    #[must_use]
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Forget the conversation
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Send a prompt with the current history
    ///
    /// On success the exchange is appended to the history. The audio body is
    /// not read; stream it with [`ChatReply::into_audio_stream`].
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the endpoint rejects it
    pub async fn send(&mut self, input: ChatInput) -> Result<ChatReply> {
        let form = self.build_form(input)?;

        tracing::debug!(
            endpoint = %self.endpoint,
            history = self.history.len(),
            "sending chat request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "chat request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            tracing::error!(status = %status, message = %message, "chat endpoint error");
            return Err(Error::Chat {
                status: status.as_u16(),
                message,
            });
        }

        let transcript = decode_header(response.headers(), TRANSCRIPT_HEADER)?;
        let reply = decode_header(response.headers(), RESPONSE_HEADER)?;

        tracing::info!(transcript = %transcript, response = %reply, "chat reply received");

        self.remember(&transcript, &reply);

        Ok(ChatReply {
            transcript,
            response: reply,
            audio: response,
        })
    }

    fn build_form(&self, input: ChatInput) -> Result<Form> {
        let mut form = match input {
            ChatInput::Text(text) => Form::new().text("input", text),
            ChatInput::Audio(wav) => Form::new().part(
                "input",
                Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")?,
            ),
        };

        for message in &self.history {
            form = form.text("message", serde_json::to_string(message)?);
        }

        Ok(form)
    }

    /// Append an exchange, keeping at most `history_limit` exchanges
    fn remember(&mut self, transcript: &str, response: &str) {
        self.history.push(ChatMessage::user(transcript));
        self.history.push(ChatMessage::assistant(response));

        let max_messages = self.history_limit.saturating_mul(2);
        if self.history.len() > max_messages {
            let excess = self.history.len() - max_messages;
            self.history.drain(..excess);
        }
    }
}

/// Read a percent-encoded header value
fn decode_header(headers: &HeaderMap, name: &str) -> Result<String> {
    let raw = headers
        .get(name)
        .ok_or_else(|| Error::Chat {
            status: 200,
            message: format!("missing {name} header"),
        })?
        .to_str()
        .map_err(|e| Error::Chat {
            status: 200,
            message: format!("invalid {name} header: {e}"),
        })?;

    urlencoding::decode(raw)
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| Error::Chat {
            status: 200,
            message: format!("invalid {name} header encoding: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::header::HeaderValue;

    use super::*;

    fn client(history_limit: usize) -> ChatClient {
        ChatClient::new(&ChatConfig {
            endpoint: "http://localhost:5173/api/chat".to_string(),
            timeout: Duration::from_secs(5),
            history_limit,
        })
        .unwrap()
    }

    #[test]
    fn messages_serialize_like_the_form_schema() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);

        let parsed: ChatMessage = serde_json::from_str(r#"{"role":"user","content":"yo"}"#).unwrap();
        assert_eq!(parsed, ChatMessage::user("yo"));
    }

    #[test]
    fn history_keeps_latest_exchanges() {
        let mut client = client(2);
        for i in 0..5 {
            client.remember(&format!("q{i}"), &format!("a{i}"));
        }

        let contents: Vec<&str> = client.history().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q3", "a3", "q4", "a4"]);
        assert_eq!(client.history()[0].role, Role::User);

        client.clear_history();
        assert!(client.history().is_empty());
    }

    #[test]
    fn unbounded_history_limit_keeps_everything() {
        let mut client = client(usize::MAX);
        for i in 0..3 {
            client.remember(&format!("q{i}"), &format!("a{i}"));
        }
        assert_eq!(client.history().len(), 6);
    }

    #[test]
    fn headers_are_percent_decoded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            TRANSCRIPT_HEADER,
            HeaderValue::from_static("what%E2%80%99s%20up%3F"),
        );

        assert_eq!(
            decode_header(&headers, TRANSCRIPT_HEADER).unwrap(),
            "what\u{2019}s up?"
        );
        assert!(decode_header(&headers, RESPONSE_HEADER).is_err());
    }
}
