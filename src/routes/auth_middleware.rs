use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};
use crate::AppState;

/// Verify the caller's token and expose its principals to downstream handlers
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {

    // 1. Get the auth token from the request
    let token = match state.verifier.token_from_headers(req.headers()) {
        Some(token) => token,
        None => return Err(StatusCode::UNAUTHORIZED),
    };

    // 2. Validate it
    let identity = match state.verifier.verify(&token) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("API request rejected: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };
    debug!("API request by {}", identity.uid);

    // 3. Set the principals and uid into request extensions for downstream handlers
    {
        let extensions = req.extensions_mut();
        extensions.insert(identity.prpls.clone());
        extensions.insert(identity.uid.clone());
    }

    Ok(next.run(req).await)
}
