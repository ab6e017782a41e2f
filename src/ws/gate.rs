use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::HeaderMap,
    response::Response,
};
use tracing::{info, warn};

use crate::models::{GatewayError, CLOSE_POLICY};
use crate::services::auth_service::{Identity, TokenVerifier};
use crate::ws::connctx::ConnCtx;
use crate::ws::connection::{close_with, serve_connection};
use crate::AppState;

/// Resolve the identity behind an upgrade request
pub fn authenticate(verifier: &TokenVerifier, headers: &HeaderMap) -> Result<Identity, GatewayError> {
    let token = verifier
        .token_from_headers(headers)
        .ok_or_else(|| GatewayError::AuthenticationFailure("no auth token presented".to_string()))?;
    verifier.verify(&token)
}

/// WebSocket entry point for `/yjs/*doc_name`.
///
/// Every request is upgraded so the client receives a proper close code;
/// a rejected connection never touches the session registry.
pub async fn ws_handler(
    Path(doc_name): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = authenticate(&state.verifier, &headers);
    let doc_name = doc_name.trim_matches('/').to_string();

    ws.on_upgrade(move |socket| async move {
        let identity = match identity {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Rejecting connection to {}: {}", doc_name, e);
                close_with(socket, e.close_code(), &e.to_string()).await;
                return;
            }
        };
        if doc_name.is_empty() {
            warn!("Rejecting connection from {}: no document name", identity.uid);
            close_with(socket, CLOSE_POLICY, "document name required").await;
            return;
        }

        let ctx = ConnCtx::new(&identity, &doc_name);
        info!("WebSocket connection {} established for {} by {}", ctx.id, doc_name, identity.uid);
        serve_connection(socket, state.registry.clone(), ctx).await;
    })
}
