use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::models::messages::{PongMessage, ReceivedMessage, SendMessage, SyncMessage, UpdateMessage};
use crate::models::{GatewayError, CLOSE_GOING_AWAY};
use crate::utils::scope_guard::ScopeGuard;
use crate::ws::broadcaster::{encode, forward_updates};
use crate::ws::connctx::ConnCtx;
use crate::ws::registry::SessionRegistry;
use crate::ws::session::Session;

type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Send a close frame and drop the socket
pub async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame { code, reason: Cow::Owned(reason.to_string()) };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame ({}): {}", code, e);
    }
}

/// Attach an authenticated socket to its document session and pump messages
/// until either side goes away
pub async fn serve_connection(socket: WebSocket, registry: Arc<SessionRegistry>, ctx: ConnCtx) {
    let session = match registry.join(&ctx.doc_name, &ctx).await {
        Ok(session) => session,
        Err(e) => {
            error!("Connection {} could not join {}: {}", ctx.id, ctx.doc_name, e);
            close_with(socket, e.close_code(), &e.to_string()).await;
            return;
        }
    };

    // Runs on every exit path, including when this future is dropped
    let _leave = {
        let registry = registry.clone();
        let (doc_name, conn) = (ctx.doc_name.clone(), ctx.id);
        ScopeGuard::new(move || registry.leave(&doc_name, conn))
    };

    // Subscribe before announcing our version so nothing falls in between
    let rx = session.subscribe();
    let (sender, mut receiver) = socket.split();
    let sender: WsSink = Arc::new(Mutex::new(sender));

    let hello = SendMessage::Sync(SyncMessage { version: session.version() });
    if !send(&sender, &hello).await {
        return;
    }
    info!("Connection {} ({}) attached to {}", ctx.id, ctx.uid, ctx.doc_name);

    let mut send_task = tokio::spawn(forward_updates(session.clone(), ctx.id, rx, sender.clone()));

    let recv_session = session.clone();
    let recv_sender = sender.clone();
    let recv_ctx = ctx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if !handle_text(&recv_session, &recv_ctx, &text, &recv_sender).await {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) => warn!("Ignoring binary frame from connection {}", recv_ctx.id),
                // Ping/pong frames are answered by the websocket layer
                Ok(_) => {}
                Err(e) => {
                    debug!("Connection {} read error: {}", recv_ctx.id, e);
                    break;
                }
            }
        }
    });

    let mut closing = registry.closing();
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
        _ = async move { let _ = closing.wait_for(|closing| *closing).await; } => {
            send_task.abort();
            recv_task.abort();
            let frame = CloseFrame { code: CLOSE_GOING_AWAY, reason: Cow::Borrowed("server shutting down") };
            let _ = sender.lock().await.send(Message::Close(Some(frame))).await;
        }
    };
    info!("Connection {} to {} terminated", ctx.id, ctx.doc_name);
}

/// Handle one client frame. Returns false when the connection should end.
async fn handle_text(session: &Arc<Session>, ctx: &ConnCtx, text: &str, sender: &WsSink) -> bool {
    let msg: ReceivedMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Failed to parse message from connection {}: {}", ctx.id, e);
            return true;
        }
    };

    match msg {
        ReceivedMessage::Sync(sync) => match session.updates_since(&sync.version) {
            Ok(update) => send(sender, &SendMessage::Update(UpdateMessage { update })).await,
            Err(e) => {
                warn!("Connection {} sent an unusable version for {}: {}", ctx.id, ctx.doc_name, e);
                true
            }
        },
        ReceivedMessage::Update(update) => match session.apply_local(ctx.id, &update.update) {
            Ok(applied) => {
                if !applied {
                    debug!("Update from connection {} carried nothing new", ctx.id);
                }
                true
            }
            Err(GatewayError::ProtocolViolation(reason)) => {
                warn!("Dropping malformed update from connection {}: {}", ctx.id, reason);
                true
            }
            Err(e) => {
                error!("Connection {} cannot write to {}: {}", ctx.id, ctx.doc_name, e);
                false
            }
        },
        ReceivedMessage::Presence(presence) => {
            session.relay_presence(ctx.id, presence.payload);
            true
        }
        ReceivedMessage::Ping => {
            let pong = SendMessage::Pong(PongMessage { date: Utc::now().to_rfc3339() });
            send(sender, &pong).await
        }
    }
}

async fn send(sender: &WsSink, msg: &SendMessage) -> bool {
    let Some(frame) = encode(msg) else {
        return true;
    };
    sender.lock().await.send(frame).await.is_ok()
}
