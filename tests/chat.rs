//! Chat client integration tests against a local fake endpoint

use std::time::Duration;

use futures::TryStreamExt;
use parley::config::ChatConfig;
use parley::{ChatClient, ChatInput, ChatMessage, Error, PlaybackOutcome, Role};

mod common;
use common::{memory_player, pcm_bytes, ramp, spawn_chat_server, wait_until};

fn chat_config(endpoint: String, history_limit: usize) -> ChatConfig {
    ChatConfig {
        endpoint,
        timeout: Duration::from_secs(5),
        history_limit,
    }
}

#[tokio::test]
async fn text_prompt_returns_decoded_headers_and_audio() {
    let reply = ramp(500);
    let (url, received) = spawn_chat_server(reply.clone(), 1000).await;
    let mut client = ChatClient::new(&chat_config(url, 20)).unwrap();

    let answer = client
        .send(ChatInput::Text("what’s 2 + 2?".to_string()))
        .await
        .unwrap();

    assert_eq!(answer.transcript, "what’s 2 + 2?");
    assert_eq!(answer.response, "echo: what’s 2 + 2?");

    let body: Vec<u8> = answer
        .into_audio_stream()
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .unwrap();
    assert_eq!(body, pcm_bytes(&reply));

    let requests = received.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].text.as_deref(), Some("what’s 2 + 2?"));
    assert!(requests[0].messages.is_empty());
}

#[tokio::test]
async fn history_is_sent_and_trimmed() {
    let (url, received) = spawn_chat_server(ramp(10), 64).await;
    let mut client = ChatClient::new(&chat_config(url, 2)).unwrap();

    for prompt in ["one", "two", "three", "four"] {
        client.send(ChatInput::Text(prompt.to_string())).await.unwrap();
    }

    let requests = received.lock().unwrap().clone();
    assert_eq!(requests.len(), 4);
    assert!(requests[0].messages.is_empty());
    assert_eq!(
        requests[1].messages,
        vec![ChatMessage::user("one"), ChatMessage::assistant("echo: one")]
    );
    let last: Vec<&str> = requests[3].messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(last, vec!["two", "echo: two", "three", "echo: three"]);

    assert_eq!(client.history().len(), 4);
    assert_eq!(client.history()[0], ChatMessage::user("three"));
    assert_eq!(client.history()[3].role, Role::Assistant);
}

#[tokio::test]
async fn audio_prompt_is_uploaded_as_wav_file() {
    let (url, received) = spawn_chat_server(ramp(10), 64).await;
    let mut client = ChatClient::new(&chat_config(url, 20)).unwrap();
    let wav = parley::voice::samples_to_wav(&[0.1; 160], 16000).unwrap();

    let answer = client.send(ChatInput::Audio(wav.clone())).await.unwrap();
    assert_eq!(answer.transcript, format!("<audio {} bytes>", wav.len()));

    let requests = received.lock().unwrap().clone();
    let (file_name, content_type, bytes) = requests[0].audio.clone().unwrap();
    assert_eq!(file_name, "audio.wav");
    assert_eq!(content_type, "audio/wav");
    assert_eq!(bytes, wav);
}

#[tokio::test]
async fn endpoint_errors_keep_history_untouched() {
    let (url, _received) = spawn_chat_server(ramp(10), 64).await;
    let mut client = ChatClient::new(&chat_config(url, 20)).unwrap();

    client.send(ChatInput::Text("hello".to_string())).await.unwrap();
    let err = client
        .send(ChatInput::Text("fail".to_string()))
        .await
        .unwrap_err();

    match err {
        Error::Chat { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "model unavailable");
        }
        other => panic!("expected chat error, got {other:?}"),
    }
    assert_eq!(client.history().len(), 2);
}

#[tokio::test]
async fn unreachable_endpoint_is_http_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut client = ChatClient::new(&chat_config(format!("http://{addr}/api/chat"), 20)).unwrap();
    let err = client
        .send(ChatInput::Text("hello".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Http(_)));
}

#[tokio::test]
async fn reply_streams_gaplessly_through_the_player() {
    let reply = ramp(2000);
    // 4001 bytes per piece: every network chunk splits a sample
    let (url, _received) = spawn_chat_server(reply.clone(), 4001).await;
    let mut client = ChatClient::new(&chat_config(url, 20)).unwrap();
    let (player, output) = memory_player();

    let answer = client.send(ChatInput::Text("sing".to_string())).await.unwrap();
    let task = {
        let player = player.clone();
        tokio::spawn(async move { player.play(answer.into_audio_stream(), || {}).await })
    };

    wait_until(|| output.samples().len() == reply.len()).await;
    assert!(player.is_playing());
    output.advance(1.0);

    let PlaybackOutcome::Finished(summary) = task.await.unwrap().unwrap() else {
        panic!("expected finished");
    };
    assert_eq!(summary.samples, reply.len());
    assert_eq!(summary.discarded_bytes, 0);
    assert_eq!(output.samples(), reply);

    for pair in output.records().windows(2) {
        assert!((pair[1].start_time - pair[0].end_time()).abs() < 1e-9);
    }
}
