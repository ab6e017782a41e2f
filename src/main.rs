mod auth;
mod config;
mod db;
mod docs;
mod handlers;
mod models;
mod routes;
mod services;
mod utils;
mod ws;

use axum::{http::HeaderValue, routing::get, Router};
use config::Config;
use db::{memstore::MemoryStore, pgstore::PgDocStore, DocStore};
use docs::ApiDoc;
use routes::create_api_routes;
use services::{auth_service::TokenVerifier, persistence::PersistenceAdapter};
use std::panic;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use ws::{RegistrySettings, SessionRegistry};

/// Shared state handed to every route
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub verifier: TokenVerifier,
}

/// Assemble the websocket endpoint, the API and the docs into one router
pub fn build_app(state: AppState, config: &Config) -> Router {
    let api_routes = create_api_routes(state.clone());

    let app = Router::new()
        .route("/yjs/*doc_name", get(ws::ws_handler))
        .with_state(state)
        // Mount API routes
        .nest("/api", api_routes)
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Add tracing layer
        .layer(TraceLayer::new_for_http());

    match cors_layer(config) {
        Some(cors) => app.layer(cors),
        None if config.is_development() => app.layer(CorsLayer::permissive()),
        None => app,
    }
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .as_deref()?
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }
    Some(CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_credentials(true))
}

async fn open_store(config: &Config) -> Arc<dyn DocStore> {
    match config.db_connect_options() {
        Some(options) => match PgDocStore::connect(options).await {
            Ok(store) => {
                info!("Database initialized successfully");
                Arc::new(store)
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Documents will only be kept in memory");
                Arc::new(MemoryStore::new())
            }
        },
        None => {
            warn!("No database configured - documents will only be kept in memory");
            Arc::new(MemoryStore::new())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "colab_gateway=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // Persistence and the session registry on top of it
    let store = open_store(&config).await;
    let adapter = Arc::new(PersistenceAdapter::from_config(store, &config));
    if let Err(e) = adapter.start().await {
        error!("Cross-process updates disabled: {}", e);
    }
    let registry = SessionRegistry::new(adapter.clone(), RegistrySettings::from_config(&config));
    info!("Gateway instance {} ready", adapter.instance_id());

    let state = AppState {
        registry: registry.clone(),
        verifier: TokenVerifier::from_config(&config),
    };
    let app_routes = build_app(state, &config);

    // Start the HTTP/WebSocket server
    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("🚀 Server running on http://{}", config.server_address());
    info!("📡 WebSocket available at ws://{}/yjs/{{doc_name}}", config.server_address());
    info!("📚 Swagger UI available at http://{}/swagger", config.server_address());

    let shutdown_registry = registry.clone();
    let served = axum::serve(listener, app_routes)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested, saving open documents");
            shutdown_registry.shutdown().await;
        })
        .await;

    adapter.shutdown();
    if let Err(e) = served {
        error!("Server error: {}", e);
    }
    info!("Server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::messages::{ReceivedMessage, SendMessage, UpdateMessage};
    use crate::ws::testing::{app_state, client_update, text_of, token_for};
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server() -> String {
        let app = build_app(app_state(), &Config::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{}", addr)
    }

    async fn connect(base: &str, doc: &str, cookie: Option<&str>) -> Client {
        let mut request = format!("{}/yjs/{}", base, doc).into_client_request().unwrap();
        if let Some(cookie) = cookie {
            request.headers_mut().insert("cookie", cookie.parse().unwrap());
        }
        let (client, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        client
    }

    async fn next_message(client: &mut Client) -> SendMessage {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), client.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    async fn close_code(client: &mut Client) -> u16 {
        match tokio::time::timeout(Duration::from_secs(5), client.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => u16::from(frame.code),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_missing_or_invalid_auth_with_4000() {
        let base = spawn_server().await;

        let mut anonymous = connect(&base, "doc1", None).await;
        assert_eq!(close_code(&mut anonymous).await, 4000);

        let mut forged = connect(&base, "doc1", Some("auth_token=garbage")).await;
        assert_eq!(close_code(&mut forged).await, 4000);

        let expired = format!("auth_token={}", token_for("alice", &[], -3600));
        let mut late = connect(&base, "doc1", Some(&expired)).await;
        assert_eq!(close_code(&mut late).await, 4000);
    }

    #[tokio::test]
    async fn relays_updates_to_peers_but_not_back_to_sender() {
        let base = spawn_server().await;
        let cookie = format!("theme=dark; auth_token={}", token_for("alice", &[], 3600));

        let mut a = connect(&base, "doc1", Some(&cookie)).await;
        assert!(matches!(next_message(&mut a).await, SendMessage::Sync(_)));
        let mut b = connect(&base, "doc1", Some(&cookie)).await;
        assert!(matches!(next_message(&mut b).await, SendMessage::Sync(_)));

        let update = ReceivedMessage::Update(UpdateMessage { update: client_update("hi") });
        a.send(Message::text(serde_json::to_string(&update).unwrap())).await.unwrap();

        match next_message(&mut b).await {
            SendMessage::Update(msg) => assert_eq!(text_of(&msg.update), "hi"),
            other => panic!("unexpected {:?}", other),
        }

        a.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
        // The first thing A hears back is the pong, never its own update
        assert!(matches!(next_message(&mut a).await, SendMessage::Pong(_)));
    }

    #[tokio::test]
    async fn late_joiner_catches_up_through_sync() {
        let base = spawn_server().await;
        let cookie = format!("auth_token={}", token_for("alice", &[], 3600));

        let mut a = connect(&base, "doc2", Some(&cookie)).await;
        next_message(&mut a).await;
        let update = ReceivedMessage::Update(UpdateMessage { update: client_update("early") });
        a.send(Message::text(serde_json::to_string(&update).unwrap())).await.unwrap();
        a.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
        next_message(&mut a).await;

        let mut c = connect(&base, "doc2", Some(&cookie)).await;
        next_message(&mut c).await;
        c.send(Message::text(r#"{"type":"sync"}"#)).await.unwrap();
        match next_message(&mut c).await {
            SendMessage::Update(msg) => assert_eq!(text_of(&msg.update), "early"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
