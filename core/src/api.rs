use std::{convert::Infallible, net::TcpListener, sync::Arc};

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Form, Json, Router,
};
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ExamplePayload,
    context::Context,
    embed::ui_router,
    publish::{PublishError, Published},
    store::Snapshot,
};

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<Context>,
}

impl AppState {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let ui: Router<AppState> = ui_router().with_state(());
    Router::new()
        .route("/api/health", get(health))
        .route("/topics", get(topics))
        .route("/messages", get(messages))
        .route("/publish", post(publish))
        .route("/events/messages", get(events))
        .route("/ws", get(ws_handler))
        .merge(ui)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

fn err(status: StatusCode, msg: &str) -> (StatusCode, Json<ErrorResp>) {
    (status, Json(ErrorResp { error: msg.into() }))
}

#[derive(Serialize)]
struct TopicInfo<'a> {
    key: &'a str,
    project: &'a str,
    topic: &'a str,
    subscription: &'a str,
    payloads: &'a [ExamplePayload],
}

async fn topics(State(state): State<AppState>) -> Response {
    let list: Vec<TopicInfo<'_>> = state
        .ctx
        .registry()
        .bindings()
        .map(|b| TopicInfo {
            key: &b.key,
            project: &b.project,
            topic: &b.topic,
            subscription: &b.subscription,
            payloads: &b.payloads,
        })
        .collect();
    Json(list).into_response()
}

async fn messages(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.ctx.snapshot())
}

#[derive(Deserialize)]
struct PublishForm {
    topic: String,
    #[serde(default)]
    payload: String,
}

async fn publish(
    State(state): State<AppState>,
    Form(form): Form<PublishForm>,
) -> Result<Json<Published>, (StatusCode, Json<ErrorResp>)> {
    match state.ctx.publish(&form.topic, form.payload.as_bytes()).await {
        Ok(published) => {
            info!(topic = %published.topic, id = %published.id, "published message");
            Ok(Json(published))
        }
        Err(e @ PublishError::UnknownTopic(_)) => Err(err(StatusCode::NOT_FOUND, &e.to_string())),
        Err(e) => {
            error!(topic = %form.topic, error = %e, "publish failed");
            Err(err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
        }
    }
}

async fn events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<ErrorResp>)> {
    let viewer = state.ctx.watch().map_err(|e| {
        warn!(error = %e, "could not serialize snapshot");
        err(StatusCode::INTERNAL_SERVER_ERROR, "snapshot")
    })?;
    debug!(viewer = %viewer.id(), "sse viewer connected");
    let stream = viewer.map(|json| {
        Ok::<_, Infallible>(Event::default()
            .event("messages")
            .data(String::from_utf8_lossy(&json)))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(stream: WebSocket, state: AppState) {
    let mut viewer = match state.ctx.watch() {
        Ok(viewer) => viewer,
        Err(e) => {
            warn!(error = %e, "could not serialize snapshot");
            return;
        }
    };
    debug!(viewer = %viewer.id(), "websocket viewer connected");
    let (mut sender, mut receiver) = stream.split();
    loop {
        tokio::select! {
            snapshot = viewer.recv() => {
                let Some(snapshot) = snapshot else { break };
                let text = String::from_utf8_lossy(&snapshot).into_owned();
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(viewer = %viewer.id(), "websocket viewer disconnected");
}

/// Serve the API on an already bound listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    listener.set_nonblocking(true)?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::Server::from_tcp(listener)?
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
