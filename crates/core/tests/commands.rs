//! Client command handling end to end

mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use common::{errors, record_events, session, MockEngine};
use voxrelay_core::{
    ClientCommand, CommandHandler, CommandOutcome, ContentType, EngineRequest, Error, KnowledgeBase,
    Metrics, Result, SessionEvent, SessionRegistry, SessionState, NO_ANSWER_FOUND,
};

struct EmptyKnowledgeBase;

#[async_trait]
impl KnowledgeBase for EmptyKnowledgeBase {
    async fn query(&self, _question: &str) -> Result<String> {
        Ok(NO_ANSWER_FOUND.to_string())
    }
}

struct BrokenKnowledgeBase;

#[async_trait]
impl KnowledgeBase for BrokenKnowledgeBase {
    async fn query(&self, _question: &str) -> Result<String> {
        Err(Error::Connection("knowledge service unavailable".to_string()))
    }
}

fn handler(id: &str, engine: &MockEngine, knowledge: Arc<dyn KnowledgeBase>) -> (CommandHandler, Arc<SessionRegistry>) {
    let registry = Arc::new(SessionRegistry::with_metrics(Arc::new(Metrics::new())));
    let session = registry.register(session(id, engine)).unwrap();
    (CommandHandler::new(session, registry.clone(), knowledge), registry)
}

fn audio_input(bytes: &[u8]) -> ClientCommand {
    ClientCommand::AudioInput {
        data: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes),
    }
}

#[tokio::test(start_paused = true)]
async fn test_last_activity_strictly_increases() {
    let engine = MockEngine::new();
    let (handler, registry) = handler("sess_touch", &engine, Arc::new(EmptyKnowledgeBase));

    let mut previous = registry.last_activity("sess_touch").unwrap();
    let commands = vec![
        ClientCommand::AudioStart {
            config: Default::default(),
        },
        audio_input(&[0u8; 64]),
        audio_input(&[1u8; 64]),
        audio_input(&[2u8; 64]),
        ClientCommand::UserText {
            text: "hola".to_string(),
        },
        ClientCommand::UserText {
            text: "adios".to_string(),
        },
    ];

    for command in commands {
        handler.handle(command).await;
        let current = registry.last_activity("sess_touch").unwrap();
        assert!(current > previous);
        previous = current;
    }

    handler.handle_audio(&[3u8; 64]).await;
    assert!(registry.last_activity("sess_touch").unwrap() > previous);
}

#[tokio::test(start_paused = true)]
async fn test_user_text_with_empty_knowledge_base() {
    let engine = MockEngine::new();
    let (handler, registry) = handler("sess_text", &engine, Arc::new(EmptyKnowledgeBase));
    let events = record_events(handler.session());

    let outcome = handler
        .handle(ClientCommand::UserText {
            text: "¿Cuál es el horario?".to_string(),
        })
        .await;
    assert_eq!(outcome, CommandOutcome::Continue);
    assert_eq!(handler.session().state(), SessionState::PromptEnded);

    let requests = engine.requests();
    let injected = requests.iter().find_map(|r| match r {
        EngineRequest::TextInput { content, .. } => Some(content.as_str()),
        _ => None,
    });
    assert_eq!(injected, Some(NO_ANSWER_FOUND));

    let outcome = handler.handle(ClientCommand::StopAudio).await;
    assert_eq!(outcome, CommandOutcome::Closed);
    assert_eq!(handler.session().state(), SessionState::Closed);
    let kinds = engine.request_kinds();
    assert_eq!(kinds[kinds.len() - 2..], ["promptEnd", "sessionEnd"]);

    let events = events.lock().clone();
    assert!(errors(&events).is_empty(), "unexpected errors: {:?}", errors(&events));
    assert_eq!(events.last(), Some(&SessionEvent::StreamComplete));
    assert_eq!(engine.closes(), 1);

    handler.disconnect().await.unwrap();
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_audio_turn_command_sequence() {
    let engine = MockEngine::new();
    let (handler, registry) = handler("sess_turn", &engine, Arc::new(EmptyKnowledgeBase));
    let events = record_events(handler.session());

    let commands = vec![
        ClientCommand::PromptStart,
        ClientCommand::SystemPrompt {
            content: "test".to_string(),
            prompt_id: None,
        },
        ClientCommand::AudioStart {
            config: Default::default(),
        },
        audio_input(&[0u8; 320]),
        audio_input(&[1u8; 320]),
        audio_input(&[2u8; 320]),
    ];
    for command in commands {
        assert_eq!(handler.handle(command).await, CommandOutcome::Continue);
    }
    assert_eq!(handler.session().state(), SessionState::AudioOpen);

    let outcome = handler.handle(ClientCommand::StopAudio).await;
    assert_eq!(outcome, CommandOutcome::Closed);
    assert_eq!(handler.session().state(), SessionState::Closed);

    let requests = engine.requests();
    assert!(requests
        .iter()
        .any(|r| matches!(r, EngineRequest::TextInput { content, .. } if content == "test")));
    let chunks = requests
        .iter()
        .filter(|r| matches!(r, EngineRequest::AudioInput { .. }))
        .count();
    assert_eq!(chunks, 3);

    let events = events.lock().clone();
    assert!(errors(&events).is_empty(), "unexpected errors: {:?}", errors(&events));
    let audio_starts = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ContentStart { content_type: ContentType::Audio, .. }))
        .count();
    let audio_ends = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ContentEnd { content_type: ContentType::Audio, .. }))
        .count();
    assert_eq!((audio_starts, audio_ends), (1, 1));
    assert_eq!(events.last(), Some(&SessionEvent::StreamComplete));

    handler.disconnect().await.unwrap();
    assert!(registry.is_empty());
    assert_eq!(engine.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_disconnect_keeps_reconnected_session() {
    let old_engine = MockEngine::new();
    let new_engine = MockEngine::new();
    let (old_handler, registry) = handler("sess_back", &old_engine, Arc::new(EmptyKnowledgeBase));
    old_handler.handle(ClientCommand::PromptStart).await;

    // The caller comes back under the same id before the old socket finished
    registry.remove("sess_back");
    let replacement = registry.register(session("sess_back", &new_engine)).unwrap();

    old_handler.disconnect().await.unwrap();
    assert_eq!(old_engine.closes(), 1);
    let current = registry.lookup("sess_back").unwrap();
    assert!(Arc::ptr_eq(&current, &replacement));
    assert_eq!(new_engine.closes(), 0);
}

#[tokio::test]
async fn test_failures_become_error_events() {
    let engine = MockEngine::new();
    let (handler, _registry) = handler("sess_err", &engine, Arc::new(BrokenKnowledgeBase));
    let events = record_events(handler.session());

    // Audio before audioStart
    handler.handle(audio_input(&[0u8; 8])).await;
    // Not base64
    handler
        .handle(ClientCommand::AudioInput {
            data: "%%%".to_string(),
        })
        .await;
    // Knowledge lookup fails
    let outcome = handler
        .handle(ClientCommand::UserText {
            text: "hola".to_string(),
        })
        .await;
    assert_eq!(outcome, CommandOutcome::Continue);

    let errors = errors(&events.lock());
    let sources: Vec<String> = errors
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Error { source, .. } => Some(source.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(sources, vec!["audioInput", "audioInput", "userText"]);
    assert!(matches!(
        &errors[2],
        SessionEvent::Error { details: Some(details), .. } if details["kind"] == "toolInvocation"
    ));

    handler.session().force_close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_mid_audio_cleans_up() {
    let engine = MockEngine::new();
    let (handler, registry) = handler("sess_gone", &engine, Arc::new(EmptyKnowledgeBase));

    handler
        .handle(ClientCommand::AudioStart {
            config: Default::default(),
        })
        .await;
    handler.handle_audio(&[0u8; 320]).await;
    assert_eq!(handler.session().state(), SessionState::AudioOpen);

    let outcome = handler.disconnect().await.unwrap();
    assert_eq!(outcome, voxrelay_core::CloseOutcome::Graceful);
    assert!(registry.lookup("sess_gone").is_none());
    assert_eq!(engine.closes(), 1);

    let kinds = engine.request_kinds();
    assert_eq!(kinds[kinds.len() - 3..], ["contentEnd", "promptEnd", "sessionEnd"]);

    // A second disconnect is harmless
    handler.disconnect().await.unwrap();
    assert_eq!(engine.closes(), 1);
    assert!(tokio::time::timeout(Duration::from_millis(10), handler.session().wait_closed())
        .await
        .is_ok());
}
