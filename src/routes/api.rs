use crate::{handlers::{diagnostics, health_check, ready_check}, routes::auth_middleware::auth_middleware, AppState};
use axum::{routing::get, Router, middleware};

/// Create API routes
pub fn create_api_routes(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware)) // Applies to all routes added above
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::testing::{app_state, token_for};
    use axum::{body::Body, http::{header, Request, StatusCode}};
    use tower::ServiceExt;

    fn get_with_cookie(uri: &str, token: Option<String>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::COOKIE, format!("auth_token={}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_and_ready_are_public() {
        let app = create_api_routes(app_state());
        let health = app.clone().oneshot(get_with_cookie("/health", None)).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        let ready = app.oneshot(get_with_cookie("/ready", None)).await.unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_fails_once_shutting_down() {
        let state = app_state();
        state.registry.shutdown().await;
        let ready = create_api_routes(state).oneshot(get_with_cookie("/ready", None)).await.unwrap();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn diagnostics_requires_cloud_admin() {
        let app = create_api_routes(app_state());

        let anonymous = app.clone().oneshot(get_with_cookie("/v1/diagnostics", None)).await.unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let member = token_for("bob", &["Editor"], 3600);
        let forbidden = app.clone().oneshot(get_with_cookie("/v1/diagnostics", Some(member))).await.unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let admin = token_for("root", &["CloudAdmin"], 3600);
        let ok = app.oneshot(get_with_cookie("/v1/diagnostics", Some(admin))).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
