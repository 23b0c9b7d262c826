//! Shared test utilities
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use parley::{ChatMessage, MemoryOutput, StreamingPlayer};

/// Player rate used across the suite
pub const RATE: u32 = 24000;

/// Encode samples as raw `f32le` bytes
#[must_use]
pub fn pcm_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Distinct, exactly representable sample values
#[must_use]
pub fn ramp(len: usize) -> Vec<f32> {
    #[allow(clippy::cast_precision_loss)]
    (0..len).map(|i| i as f32 / 1024.0).collect()
}

/// Player backed by a headless output
#[must_use]
pub fn memory_player() -> (StreamingPlayer, MemoryOutput) {
    let output = MemoryOutput::new();
    (StreamingPlayer::new(Arc::new(output.clone()), RATE), output)
}

/// Poll `condition` until it holds, panicking after five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// What the fake chat endpoint received in one request
#[derive(Debug, Clone, Default)]
pub struct ReceivedRequest {
    /// `input` sent as a text field
    pub text: Option<String>,
    /// `input` sent as a file: (file name, content type, bytes)
    pub audio: Option<(String, String, Vec<u8>)>,
    /// Decoded `message` fields, in order
    pub messages: Vec<ChatMessage>,
}

#[derive(Clone)]
struct FakeChat {
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    reply: Arc<Vec<f32>>,
    chunk_size: usize,
}

/// Serve a fake chat endpoint on an ephemeral port
///
/// Replies with `reply` as PCM split into `chunk_size` byte pieces. The
/// transcript echoes text input (or `"<audio N bytes>"`), and the response is
/// `"echo: <transcript>"`. The text `"fail"` yields a 500 and a missing
/// `input` a 400, both with a JSON error body.
pub async fn spawn_chat_server(
    reply: Vec<f32>,
    chunk_size: usize,
) -> (String, Arc<Mutex<Vec<ReceivedRequest>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let state = FakeChat {
        received: Arc::clone(&received),
        reply: Arc::new(reply),
        chunk_size,
    };

    let app = Router::new()
        .route("/api/chat", post(chat_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/api/chat"), received)
}

async fn chat_handler(State(fake): State<FakeChat>, mut multipart: Multipart) -> Response {
    let mut request = ReceivedRequest::default();

    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "input" => {
                if let Some(file_name) = field.file_name().map(ToString::to_string) {
                    let content_type = field.content_type().unwrap_or_default().to_string();
                    let bytes = field.bytes().await.unwrap().to_vec();
                    request.audio = Some((file_name, content_type, bytes));
                } else {
                    request.text = Some(field.text().await.unwrap());
                }
            }
            "message" => {
                let raw = field.text().await.unwrap();
                request.messages.push(serde_json::from_str(&raw).unwrap());
            }
            _ => {}
        }
    }

    fake.received.lock().unwrap().push(request.clone());

    let transcript = match (&request.text, &request.audio) {
        (Some(text), _) => text.clone(),
        (None, Some((_, _, bytes))) => format!("<audio {} bytes>", bytes.len()),
        (None, None) => return error(StatusCode::BAD_REQUEST, "Invalid request"),
    };

    if transcript == "fail" {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "model unavailable");
    }

    let response = format!("echo: {transcript}");
    let body = pcm_bytes(&fake.reply);
    let pieces: Vec<Result<Vec<u8>, std::io::Error>> = body
        .chunks(fake.chunk_size.max(1))
        .map(|c| Ok(c.to_vec()))
        .collect();

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .header("X-Transcript", urlencoding::encode(&transcript).into_owned())
        .header("X-Response", urlencoding::encode(&response).into_owned())
        .body(Body::from_stream(futures::stream::iter(pieces)))
        .unwrap()
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
}
