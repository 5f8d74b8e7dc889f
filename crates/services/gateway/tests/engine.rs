//! StreamSession over the real WebSocket connector

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::StubEngine;
use voxrelay_core::{
    AudioFormat, EngineRequest, Metrics, SessionConfig, SessionEvent, SessionState, StreamSession,
};
use voxrelay_gateway::engine::WebSocketConnector;

#[tokio::test]
async fn test_audio_session_over_websocket() {
    let engine = StubEngine::start().await;
    let connector = Arc::new(WebSocketConnector::new(engine.url(), Duration::from_secs(2)));
    let session = StreamSession::new("sess_ws", SessionConfig::default(), connector)
        .with_metrics(Arc::new(Metrics::new()));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session
        .events()
        .on_all(move |event| sink.lock().unwrap().push(event.clone()));

    session.initiate().await.unwrap();
    let audio_id = session.setup_start_audio(AudioFormat::default()).await.unwrap();
    for chunk in [[1u8; 320], [2u8; 320], [3u8; 320]] {
        assert!(session.stream_audio(&chunk).await.unwrap());
    }
    session.close().await.unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(
        engine.request_kinds(),
        vec![
            "sessionStart",
            "promptStart",
            "contentStart",
            "audioInput",
            "audioInput",
            "audioInput",
            "contentEnd",
            "promptEnd",
            "sessionEnd",
        ]
    );
    let sent_audio: Vec<String> = engine
        .requests()
        .into_iter()
        .filter_map(|r| match r {
            EngineRequest::AudioInput { content_name, content, .. } => {
                assert_eq!(content_name, audio_id);
                Some(content)
            }
            _ => None,
        })
        .collect();
    assert_eq!(sent_audio.len(), 3);

    let events = events.lock().unwrap().clone();
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error { .. })));
    let audio_ends = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ContentEnd { content_id, .. } if *content_id == audio_id))
        .count();
    assert_eq!(audio_ends, 1);
    assert_eq!(events.last(), Some(&SessionEvent::StreamComplete));
}

#[tokio::test]
async fn test_text_wait_resolves_over_websocket() {
    let engine = StubEngine::start().await;
    let connector = Arc::new(WebSocketConnector::new(engine.url(), Duration::from_secs(2)));
    let session = StreamSession::new("sess_text", SessionConfig::default(), connector)
        .with_metrics(Arc::new(Metrics::new()));

    session.initiate().await.unwrap();
    let wait = session
        .send_text_content("answer_1", "Abrimos a las 9.", voxrelay_core::Role::Assistant)
        .await
        .unwrap();
    let event = wait.wait_timeout(Duration::from_secs(5)).await.unwrap();
    assert!(matches!(event, SessionEvent::ContentEnd { ref content_id, .. } if content_id == "answer_1"));

    session.force_close().await.unwrap();
    assert!(session.is_closed());
}
