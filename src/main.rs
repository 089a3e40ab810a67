use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use nostr_relay_core::config::{init_tracing, Config};
use nostr_relay_core::connection::Connection;
use nostr_relay_core::relay::{
    load_active_relays, RelayConfig, RelayContext, RelayRegistry, DEFAULT_RELAY_ID,
};
use nostr_relay_core::store::{EventStore, PgEventStore};

#[derive(Clone)]
struct AppState {
    store: Arc<dyn EventStore>,
    registry: RelayRegistry,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = Config::from_env();
    let pool = PgPoolOptions::new()
        .max_connections(50)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    let pg_store = PgEventStore::new(pool.clone());
    pg_store
        .init_schema()
        .await
        .expect("failed to initialize schema");

    let registry = RelayRegistry::new();
    let configured = load_active_relays(&pool)
        .await
        .expect("failed to load relay configs");
    if configured.is_empty() {
        info!("no relays configured in the database; serving a single default relay");
        registry
            .insert(RelayConfig {
                id: DEFAULT_RELAY_ID.to_string(),
                name: "default".to_string(),
                description: String::new(),
                pubkey: String::new(),
                contact: String::new(),
                active: true,
                spec: Default::default(),
            })
            .await;
    } else {
        for relay in configured {
            info!("serving relay {}", relay.id);
            registry.insert(relay).await;
        }
    }

    let state = AppState {
        store: Arc::new(pg_store),
        registry,
    };

    let app = Router::new()
        .route("/", get(handler))
        .route("/:relay_id", get(handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn handler(
    relay_path: Option<Path<String>>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let relay_id = relay_path
        .map(|Path(p)| p)
        .unwrap_or_else(|| DEFAULT_RELAY_ID.to_string());

    let Some(ctx) = state.registry.get(&relay_id).await else {
        return (axum::http::StatusCode::NOT_FOUND, "unknown relay").into_response();
    };

    if let Some(ws) = ws {
        let store = state.store.clone();
        return ws
            .on_upgrade(move |socket| handle_socket(socket, relay_id, ctx, store))
            .into_response();
    }

    if let Some(accept) = headers.get("accept") {
        if accept
            .to_str()
            .unwrap_or("")
            .contains("application/nostr+json")
        {
            return Json(ctx.config.info_json()).into_response();
        }
    }

    format!("{} (nostr-relay-core)", ctx.config.name).into_response()
}

async fn handle_socket(
    socket: WebSocket,
    relay_id: String,
    ctx: Arc<RelayContext>,
    store: Arc<dyn EventStore>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Single outbound channel carrying transport frames: both the
    // connection's replies (OK/EVENT/EOSE/NOTICE, as text) and the
    // heartbeat ping funnel through here, so there is one writer task and
    // one place a slow peer backs up.
    let (tx_internal, mut rx_internal) = tokio::sync::mpsc::channel::<Message>(100);

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx_internal.recv().await {
            if let Err(e) = sender.send(msg).await {
                warn!("failed to send message: {e}");
                break;
            }
        }
    });

    let tx_ping = tx_internal.clone();
    let mut heartbeat_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            if tx_ping.send(Message::Ping(Vec::new())).await.is_err() {
                break;
            }
        }
    });

    let queue_bound = ctx.policy.spec().outbound_queue_bound;
    let (conn_id, mut broadcast_rx) = ctx.broadcaster.attach(queue_bound).await;

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<String>(queue_bound.max(1));
    let tx_frames = tx_internal.clone();
    let mut frame_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if tx_frames.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::new(conn_id, relay_id, ctx.clone(), store, outbound_tx);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        connection.handle_text(&text).await;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("websocket error: {e}");
                        break;
                    }
                    None => break,
                }
            }
            event = broadcast_rx.recv() => {
                match event {
                    Some(event) => connection.notify(&event).await,
                    None => break,
                }
            }
        }
    }

    send_task.abort();
    heartbeat_task.abort();
    frame_task.abort();
    ctx.broadcaster.detach(conn_id).await;
}
