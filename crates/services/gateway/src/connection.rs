//! One caller WebSocket connection
//!
//! Each connection owns exactly one session. Inbound text frames are client
//! commands, binary frames are raw audio. Every event published on the
//! session's bus is forwarded to the caller as a JSON text frame.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc;

use voxrelay_core::{
    ClientCommand, CommandHandler, CommandOutcome, Error, SessionEvent, SessionHandle,
    StreamSession,
};

use crate::api::AppState;

/// Generate an id for callers that did not pick one
pub fn new_session_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("sess_{}", &uuid[..12])
}

/// Build, register and initiate the session for a new caller
async fn open_session(state: &AppState, requested_id: Option<String>) -> Result<SessionHandle, (String, Error)> {
    let session_id = requested_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(new_session_id);

    let mut session = StreamSession::new(
        session_id.clone(),
        state.config.session.clone(),
        state.connector.clone(),
    )
    .with_metrics(state.metrics());
    if let Some(tools) = &state.tools {
        session = session.with_tools(tools.clone());
    }

    let session = state
        .registry
        .register(session)
        .map_err(|e| (session_id.clone(), e))?;

    if let Err(e) = session.initiate().await {
        state.registry.remove_session(&session);
        let _ = session.force_close().await;
        return Err((session_id, e));
    }
    Ok(session)
}

/// Drive one caller connection until it closes
pub async fn handle_socket(socket: WebSocket, state: AppState, requested_id: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let session = match open_session(&state, requested_id).await {
        Ok(session) => session,
        Err((session_id, e)) => {
            tracing::warn!(session_id = %session_id, error = %e, "Rejecting caller connection");
            let source = match e {
                Error::Connection(_) => "inferenceEngine",
                _ => "registry",
            };
            if let Ok(json) = serde_json::to_string(&SessionEvent::error(source, &e)) {
                let _ = ws_tx.send(Message::Text(json)).await;
            }
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Cow::Owned(e.kind().to_string()),
                })))
                .await;
            return;
        }
    };

    let session_id = session.id().to_string();
    tracing::info!(session_id = %session_id, "Caller connected");

    // Bus handlers are synchronous; hand frames to a forward task
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let subscriptions = session.events().on_all(move |event| match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => tracing::error!("Failed to encode session event: {}", e),
    });

    let forward_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                tracing::debug!("Caller socket write failed: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let handler = CommandHandler::new(session.clone(), state.registry.clone(), state.knowledge.clone());
    read_loop(&handler, &mut ws_rx).await;

    if let Err(e) = handler.disconnect().await {
        tracing::warn!(session_id = %session_id, error = %e, "Session cleanup did not finish cleanly");
    }

    // Dropping the handlers drops the last sender, which ends the forward task
    for (name, id) in subscriptions {
        session.events().off(name, id);
    }
    let _ = forward_task.await;

    tracing::info!(session_id = %session_id, "Caller connection finished");
}

async fn read_loop(handler: &CommandHandler, ws_rx: &mut futures::stream::SplitStream<WebSocket>) {
    let session: Arc<StreamSession> = handler.session().clone();
    let closed = session.wait_closed();
    tokio::pin!(closed);

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut closed => {
                tracing::debug!(session_id = %session.id(), "Session closed underneath the caller");
                break;
            }
            frame = ws_rx.next() => frame,
        };

        let outcome = match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => handler.handle(command).await,
                Err(e) => {
                    handler.reject(&Error::InvalidPayload(e.to_string()));
                    CommandOutcome::Continue
                }
            },
            Some(Ok(Message::Binary(chunk))) => handler.handle_audio(&chunk).await,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => CommandOutcome::Continue,
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(session_id = %session.id(), "Caller closed the socket");
                break;
            }
            Some(Err(e)) => {
                tracing::debug!(session_id = %session.id(), "Caller socket error: {}", e);
                break;
            }
        };

        if outcome == CommandOutcome::Closed {
            break;
        }
    }
}
