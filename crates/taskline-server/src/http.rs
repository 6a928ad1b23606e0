use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use taskline_core::workspace::prepare_turn_folder;
use taskline_core::{now_ms, Action, ActionDispatcher, AddTaskRequest, StreamGuard, TaskActor};
use taskline_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use taskline_orchestrator::SubtaskEdit;
use taskline_types::{ChatOptions, StreamEvent};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::Level;

use crate::AppState;

#[derive(Debug, Deserialize)]
struct ImproveInput {
    question: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    attaches: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SupplementInput {
    question: String,
}

#[derive(Debug, Deserialize)]
struct HumanReplyInput {
    agent: String,
    reply: String,
}

#[derive(Debug, Deserialize)]
struct InstallMcpInput {
    #[serde(default, alias = "mcpServers")]
    servers: Value,
}

#[derive(Debug, Deserialize)]
struct UpdateTaskInput {
    #[serde(default)]
    task: Vec<SubtaskEdit>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let reaper_state = state.clone();
    let app = app_router(state);
    let reaper = tokio::spawn(async move {
        if !reaper_state.config.reaper_enabled {
            return;
        }
        loop {
            tokio::time::sleep(reaper_state.config.reap_interval()).await;
            let stale = reaper_state
                .registry
                .reap_idle(reaper_state.config.task_idle_ms)
                .await;
            for actor in stale {
                let detail = format!("idle_ms={}", actor.idle_ms(now_ms()));
                emit_event(
                    Level::INFO,
                    ProcessKind::Server,
                    ObservabilityEvent::new("server.reaper", "actor.reaped")
                        .project(actor.id())
                        .task(&actor.options().task_id)
                        .status("timeout")
                        .detail(&detail),
                );
                actor.cleanup().await;
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    reaper.abort();
    result?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(start_chat))
        .route(
            "/chat/{id}",
            post(improve_chat).put(supplement_chat).delete(stop_chat),
        )
        .route("/chat/{id}/human-reply", post(human_reply))
        .route("/chat/{id}/install-mcp", post(install_mcp))
        .route("/chat/{id}/add-task", post(add_task))
        .route("/chat/{id}/remove-task/{task_id}", delete(remove_task))
        .route("/chat/{id}/skip-task", post(skip_task))
        .route("/task/{id}", put(update_task))
        .route("/task/{id}/start", post(start_task))
        .route("/task/{id}/pause", post(pause_task))
        .route("/task/{id}/resume", post(resume_task))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let task_ids = state.registry.ids().await;
    Json(json!({
        "ok": true,
        "active_tasks": task_ids.len(),
        "task_ids": task_ids,
    }))
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Task not found",
            "code": "TASK_NOT_FOUND",
            "project_id": id,
        })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn conflict(actor: &TaskActor) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "code": "TASK_CONFLICT",
            "project_id": actor.id(),
            "task_id": actor.options().task_id,
            "status": actor.status().await.as_str(),
            "created_at_ms": actor.created_at_ms(),
            "idle_ms": actor.idle_ms(now_ms()),
        })),
    )
        .into_response()
}

async fn live_actor(state: &AppState, id: &str) -> Result<Arc<TaskActor>, Response> {
    state.registry.get(id).await.ok_or_else(|| not_found(id))
}

fn log_command(actor: &TaskActor, action: &Action, detail: &str) {
    emit_event(
        Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent::new("server.http", "command.enqueued")
            .project(actor.id())
            .task(&actor.options().task_id)
            .action(action.name())
            .detail(detail),
    );
}

fn submit(actor: &TaskActor, action: Action) -> Response {
    log_command(actor, &action, "");
    if !actor.enqueue(action) {
        return not_found(actor.id());
    }
    Json(json!({ "ok": true })).into_response()
}

async fn start_chat(State(state): State<AppState>, Json(options): Json<ChatOptions>) -> Response {
    if options.project_id.trim().is_empty() {
        return bad_request("project_id is required");
    }
    if options.question.trim().is_empty() {
        return bad_request("question is required");
    }
    let question_digest = redact_text(&options.question);
    let actor = match state.registry.acquire(options).await {
        Ok(actor) => actor,
        Err(existing) => return conflict(&existing).await,
    };
    emit_event(
        Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent::new("server.http", "chat.started")
            .project(actor.id())
            .task(&actor.options().task_id)
            .detail(&question_digest),
    );

    let handle = ActionDispatcher::spawn(actor, state.services.clone(), state.config.clone());
    let guarded = StreamGuard::new(state.config.stream_idle_timeout(), handle.connection)
        .wrap(ReceiverStream::new(handle.events));
    let stream = guarded.map(|event: StreamEvent| {
        Ok::<Event, Infallible>(Event::default().data(event.to_sse_data()))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.config.keep_alive()))
        .into_response()
}

async fn improve_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ImproveInput>,
) -> Response {
    if input.question.trim().is_empty() {
        return bad_request("question is required");
    }
    let actor = match live_actor(&state, &id).await {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };

    let new_task_id = input.task_id.filter(|turn| !turn.trim().is_empty());
    if let Some(turn_id) = new_task_id.as_deref() {
        match prepare_turn_folder(
            &state.config.workspace_root,
            actor.options(),
            actor.id(),
            turn_id,
        )
        .await
        {
            Ok(folder) => actor.set_pending_folder(folder).await,
            Err(err) => {
                tracing::warn!("failed to prepare turn folder for {}: {}", actor.id(), err);
            }
        }
    }
    submit(
        &actor,
        Action::Improve {
            question: input.question,
            new_task_id,
            attachments: input.attaches,
        },
    )
}

async fn supplement_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<SupplementInput>,
) -> Response {
    if input.question.trim().is_empty() {
        return bad_request("question is required");
    }
    match live_actor(&state, &id).await {
        Ok(actor) => submit(
            &actor,
            Action::Supplement {
                question: input.question,
            },
        ),
        Err(resp) => resp,
    }
}

async fn stop_chat(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let actor = match live_actor(&state, &id).await {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    log_command(&actor, &Action::Stop, "");
    if !actor.enqueue(Action::Stop) {
        return not_found(&id);
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn human_reply(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<HumanReplyInput>,
) -> Response {
    if input.agent.trim().is_empty() {
        return bad_request("agent is required");
    }
    match live_actor(&state, &id).await {
        Ok(actor) => submit(
            &actor,
            Action::HumanReply {
                agent: input.agent,
                reply: input.reply,
            },
        ),
        Err(resp) => resp,
    }
}

async fn install_mcp(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<InstallMcpInput>,
) -> Response {
    match live_actor(&state, &id).await {
        Ok(actor) => submit(
            &actor,
            Action::InstallMcp {
                servers: input.servers,
            },
        ),
        Err(resp) => resp,
    }
}

async fn add_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<AddTaskRequest>,
) -> Response {
    if input.content.trim().is_empty() {
        return bad_request("content is required");
    }
    match live_actor(&state, &id).await {
        Ok(actor) => submit(&actor, Action::AddTask(input)),
        Err(resp) => resp,
    }
}

async fn remove_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, String)>,
) -> Response {
    match live_actor(&state, &id).await {
        Ok(actor) => submit(&actor, Action::RemoveTask { task_id }),
        Err(resp) => resp,
    }
}

async fn skip_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match live_actor(&state, &id).await {
        Ok(actor) => submit(&actor, Action::SkipTask),
        Err(resp) => resp,
    }
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<UpdateTaskInput>,
) -> Response {
    match live_actor(&state, &id).await {
        Ok(actor) => submit(&actor, Action::UpdateTask { edits: input.task }),
        Err(resp) => resp,
    }
}

async fn start_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match live_actor(&state, &id).await {
        Ok(actor) => submit(&actor, Action::Start),
        Err(resp) => resp,
    }
}

async fn pause_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match live_actor(&state, &id).await {
        Ok(actor) => submit(&actor, Action::Pause),
        Err(resp) => resp,
    }
}

async fn resume_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match live_actor(&state, &id).await {
        Ok(actor) => submit(&actor, Action::Resume),
        Err(resp) => resp,
    }
}
