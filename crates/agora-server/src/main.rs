use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use agora_api::auth::{self, AppState, AppStateInner};
use agora_api::middleware::require_auth;
use agora_api::{conversations, notifications, unread};
use agora_gateway::connection::{self, MessageGateway};
use agora_gateway::notify::{self, Notifier};
use agora_gateway::registry::Registry;

#[derive(Clone)]
struct ServerState {
    app: AppState,
    gateway: Arc<MessageGateway>,
    registry: Registry,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("AGORA_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("AGORA_DB_PATH").unwrap_or_else(|_| "agora.db".into());
    let host = std::env::var("AGORA_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("AGORA_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(agora_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state. The registry is the only state shared across connection
    // tasks; everything is constructed here and injected, no globals.
    let registry = Registry::new();
    let notifier = Notifier::new(db.clone(), registry.clone());
    let gateway = Arc::new(MessageGateway::new(
        db.clone(),
        registry.clone(),
        jwt_secret.clone(),
    ));
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        notifier,
        jwt_secret: jwt_secret.clone(),
    });

    let state = ServerState {
        app: app_state.clone(),
        gateway,
        registry,
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations", post(conversations::create_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::get_messages),
        )
        .route("/messages/{message_id}", put(conversations::update_message))
        .route("/messages/{message_id}", delete(conversations::delete_message))
        .route("/messages/unread-count", get(unread::get_unread_count))
        .route("/notifications", get(notifications::list_notifications))
        .route(
            "/notifications/unread-count",
            get(notifications::get_unread_count),
        )
        .route(
            "/notifications/{notification_id}/read",
            post(notifications::mark_read),
        )
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route(
            "/notifications/{notification_id}",
            delete(notifications::delete_notification),
        )
        .route("/admin/notifications", post(notifications::push_notification))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_routes = Router::new()
        .route("/gateway/messages", get(messages_ws))
        .route("/gateway/notifications", get(notifications_ws))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Agora server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn messages_ws(
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.gateway))
}

async fn notifications_ws(
    State(state): State<ServerState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| notify::handle_connection(socket, state.registry, state.jwt_secret))
}
