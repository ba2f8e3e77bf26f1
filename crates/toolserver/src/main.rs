use actix_cors::Cors;
use actix_web::{
    get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use toolcore::{FlowError, Graph, HistoryFilter, RunStatus, Subscription, Value};
use toolruntime::{FlowRuntime, ModuleRegistry, RuntimeConfig, ToolRegistry};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Application state shared across handlers
struct AppState {
    runtime: Arc<FlowRuntime>,
}

/// Request body for run submission
#[derive(Debug, Deserialize)]
struct SubmitRequest {
    graph: Graph,
    #[serde(default)]
    inputs: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    run_id: Uuid,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    run_id: Uuid,
    cancelled: bool,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    tool: Option<String>,
    status: Option<RunStatus>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(err: &FlowError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
    };
    match err {
        FlowError::Graph(_) => HttpResponse::UnprocessableEntity().json(body),
        FlowError::RunNotFound(_) => HttpResponse::NotFound().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "toolflow"
    }))
}

/// List registered tool descriptors
#[get("/api/tools")]
async fn list_tools(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let tools: Vec<_> = data
        .runtime
        .descriptors()
        .iter()
        .map(|d| d.as_ref().clone())
        .collect();
    Ok(HttpResponse::Ok().json(tools))
}

/// Submit a graph for execution
#[post("/api/runs")]
async fn submit_run(
    data: web::Data<AppState>,
    req: web::Json<SubmitRequest>,
) -> ActixResult<impl Responder> {
    let SubmitRequest { graph, inputs } = req.into_inner();
    info!(
        "Submitting graph: {} ({} nodes)",
        graph.name.as_deref().unwrap_or(&graph.id),
        graph.nodes.len()
    );

    match data.runtime.submit(graph, inputs).await {
        Ok(run_id) => Ok(HttpResponse::Accepted().json(SubmitResponse { run_id })),
        Err(e) => {
            warn!("Submission rejected: {}", e);
            Ok(error_response(&e))
        }
    }
}

/// Snapshot of a run's execution context
#[get("/api/runs/{id}")]
async fn get_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    match data.runtime.status(path.into_inner()).await {
        Ok(context) => Ok(HttpResponse::Ok().json(context)),
        Err(e) => Ok(error_response(&e)),
    }
}

#[post("/api/runs/{id}/cancel")]
async fn cancel_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.runtime.cancel(run_id).await {
        Ok(cancelled) => Ok(HttpResponse::Ok().json(CancelResponse { run_id, cancelled })),
        Err(e) => Ok(error_response(&e)),
    }
}

#[get("/api/history")]
async fn query_history(
    data: web::Data<AppState>,
    query: web::Query<HistoryQuery>,
) -> ActixResult<impl Responder> {
    let query = query.into_inner();
    let filter = HistoryFilter {
        tool: query.tool,
        status: query.status,
        since: query.since,
        until: query.until,
    };
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);

    match data.runtime.history(&filter, limit).await {
        Ok(records) => Ok(HttpResponse::Ok().json(records)),
        Err(e) => {
            error!("History query failed: {}", e);
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: e.to_string(),
            }))
        }
    }
}

/// Forward events to a WebSocket client until it leaves or, for a
/// single-run feed, the run's terminal event has been sent.
async fn pump_events(
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
    mut events: Subscription,
    stop_at_terminal: bool,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if session.text(json).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Failed to serialize event: {}", e),
                }
                if stop_at_terminal && event.is_terminal() {
                    break;
                }
            }

            // Handle incoming WebSocket messages (ping/pong)
            Some(Ok(msg)) = msg_stream.recv() => {
                match msg {
                    Message::Ping(bytes) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }

            else => break,
        }
    }

    info!("WebSocket client disconnected");
    let _ = session.close(None).await;
}

/// WebSocket feed for one run
#[get("/api/runs/{id}/events")]
async fn run_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    path: web::Path<Uuid>,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let run_id = path.into_inner();
    // Attach first so no event slips between the status check and the subscription.
    let events = match data.runtime.subscribe(run_id).await {
        Ok(events) => events,
        Err(e) => return Ok(error_response(&e)),
    };
    let snapshot = match data.runtime.status(run_id).await {
        Ok(snapshot) => snapshot,
        Err(e) => return Ok(error_response(&e)),
    };

    let (res, session, msg_stream) = actix_ws::handle(&req, stream)?;
    info!(%run_id, "WebSocket client connected");

    if snapshot.is_frozen() {
        // Finished runs have nothing left to stream; send the final state and close.
        actix_web::rt::spawn(async move {
            let mut session = session;
            if let Ok(json) = serde_json::to_string(&snapshot) {
                let _ = session.text(json).await;
            }
            let _ = session.close(None).await;
        });
    } else {
        actix_web::rt::spawn(pump_events(session, msg_stream, events, true));
    }

    Ok(res)
}

/// WebSocket feed for every run
#[get("/api/events")]
async fn all_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, session, msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected to global feed");

    let events = data.runtime.subscribe_all();
    actix_web::rt::spawn(pump_events(session, msg_stream, events, false));

    Ok(res)
}

fn build_runtime() -> anyhow::Result<FlowRuntime> {
    let config_path = std::env::var("TOOLFLOW_CONFIG").ok().map(PathBuf::from);
    let config = RuntimeConfig::load(config_path.as_deref())?;

    let mut tools = ToolRegistry::new();
    let mut modules = ModuleRegistry::new();
    toolmodules::register_all(&mut tools, &mut modules);

    Ok(FlowRuntime::from_config(config, tools, modules)?)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting toolflow server");

    let runtime = build_runtime()?;
    info!("Runtime initialized with {} tools", runtime.tools().len());

    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(list_tools)
            .service(submit_run)
            .service(get_run)
            .service(cancel_run)
            .service(run_events)
            .service(all_events)
            .service(query_history)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
