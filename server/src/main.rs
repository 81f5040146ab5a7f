use std::{
	collections::HashMap,
	sync::{Arc, Mutex as StdMutex},
	time::Instant,
};

use anyhow::{Context, Result};
use axum::{routing::{get, post}, Json, Router, response::{IntoResponse, Response}};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use tower_http::trace::TraceLayer;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sled::Db;
use uuid::Uuid;
use tokio::{io::{AsyncBufReadExt, BufReader}, signal, task};
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod agent;
mod authorizer;
mod config;
mod episode;
mod kg;
mod recorder;
mod scanner;
mod tools;
mod watcher;

use agent::{ChatMessage, ChatModel, FileAgent, OpenAiCompatModel};
use authorizer::PathAuthorizer;
use recorder::EpisodeRecorder;
use scanner::ScanReport;
use tools::{ToolContext, ToolDefinition, ToolRegistry};

#[derive(Parser, Debug)]
#[command(name = "file-agent-server", version, about = "File agent that mirrors allow-listed directories into a graph of episodes")]
struct Cli {
	/// Bind address for the HTTP server (overrides HTTP_BIND / PORT)
	#[arg(long)]
	bind: Option<String>,

	/// Data directory root; the graph store lives in <data-dir>/graph
	#[arg(long, env = "DATA_DIR")]
	data_dir: Option<String>,

	/// Comma-separated allowed roots
	#[arg(long, env = "ALLOWED_PATHS")]
	allowed_paths: Option<String>,

	/// Skip the initial scan
	#[arg(long)]
	no_scan: bool,

	/// Do not start the live watcher
	#[arg(long)]
	no_watch: bool,

	/// Also serve JSON-RPC tools/list and tools/call on stdin/stdout
	#[arg(long)]
	stdio: bool,
}

struct AppState {
	start_time: Instant,
	db: Db,
	config: config::Config,
	authorizer: Arc<PathAuthorizer>,
	registry: Arc<ToolRegistry>,
	tool_ctx: ToolContext,
	agent: Option<Arc<FileAgent>>,
	last_scan: StdMutex<Option<ScanReport>>,
	watching: StdMutex<bool>,
}

#[derive(Serialize)]
struct Health { status: &'static str }

#[derive(Serialize)]
struct StatusResponse {
	#[serde(rename = "uptimeMs")]
	uptime_ms: u128,
	bind: String,
	#[serde(rename = "allowedRoots")]
	allowed_roots: Vec<String>,
	graph: kg::GraphCounts,
	#[serde(rename = "agentEnabled")]
	agent_enabled: bool,
	watching: bool,
	#[serde(rename = "lastScan")]
	last_scan: Option<ScanReport>,
}

#[derive(Deserialize)]
struct ToolCallRequest {
	name: String,
	#[serde(default)]
	arguments: JsonValue,
}

#[derive(Deserialize)]
struct ChatRequest {
	#[serde(default)]
	model: Option<String>,
	messages: Vec<ChatMessage>,
}

#[inline]
fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>, details: Option<serde_json::Value>) -> Response {
	let body = serde_json::json!({ "error": { "code": code, "message": message.into(), "details": details } });
	(status, Json(body)).into_response()
}

#[tokio::main]
async fn main() -> Result<()> {
	init_tracing();
	let cli = Cli::parse();
	let mut cfg = config::Config::load()?;
	apply_cli(&mut cfg, &cli)?;
	if cfg.allowed_roots.is_empty() {
		warn!("ALLOWED_PATHS is empty; every path will be denied");
	}

	std::fs::create_dir_all(&cfg.data_dir).with_context(|| format!("creating data dir {}", cfg.data_dir))?;
	let db = sled::open(cfg.graph_dir()).context("opening graph store")?;
	let state = build_state(cfg.clone(), db);
	let recorder = Arc::new(EpisodeRecorder::new(Arc::new(state.db.clone())).with_retries(cfg.store_retries));

	let _watcher = if cli.no_watch {
		None
	} else {
		let dispatcher = watcher::EventDispatcher::new(state.authorizer.clone(), recorder.clone(), cfg.watch_workers, Handle::current());
		match watcher::LiveWatcher::start(state.authorizer.roots(), dispatcher) {
			Ok(w) => {
				if let Ok(mut flag) = state.watching.lock() { *flag = true; }
				Some(w)
			}
			Err(err) => {
				error!(error = %err, "live watcher unavailable");
				None
			}
		}
	};

	let mut tasks = Vec::new();

	if cfg.scan_on_startup && !cli.no_scan {
		let scan_state = state.clone();
		let scan_recorder = recorder.clone();
		tasks.push(task::spawn(async move {
			let roots = scan_state.authorizer.roots().to_vec();
			let auth = scan_state.authorizer.clone();
			match task::spawn_blocking(move || scanner::scan(&roots, &auth, &scan_recorder)).await {
				Ok(report) => {
					if let Ok(mut slot) = scan_state.last_scan.lock() { *slot = Some(report); }
				}
				Err(err) => error!(error = %err, "initial scan task failed"),
			}
		}));
	}

	if cli.stdio {
		let stdio_state = state.clone();
		tasks.push(task::spawn(async move { run_stdio(stdio_state).await; }));
	}

	let bind_addr = cfg.bind;
	info!(%bind_addr, roots = state.authorizer.roots().len(), agent = state.agent.is_some(), "Starting HTTP server");
	let listener = tokio::net::TcpListener::bind(bind_addr).await.with_context(|| format!("binding {}", bind_addr))?;
	axum::serve(listener, build_router(state.clone()))
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("http server")?;

	info!("Shutdown signal received");
	for t in tasks { t.abort(); }
	if let Err(err) = state.db.flush_async().await {
		warn!(error = %err, "graph store flush failed");
	}
	Ok(())
}

fn apply_cli(cfg: &mut config::Config, cli: &Cli) -> Result<()> {
	if let Some(bind) = cli.bind.as_deref().filter(|b| !b.is_empty()) {
		cfg.bind = bind.parse().with_context(|| format!("invalid --bind {}", bind))?;
	}
	if let Some(dir) = &cli.data_dir { cfg.data_dir = dir.clone(); }
	if let Some(raw) = &cli.allowed_paths { cfg.allowed_roots = config::parse_allowed_paths(raw); }
	if cli.no_scan { cfg.scan_on_startup = false; }
	Ok(())
}

fn build_state(cfg: config::Config, db: Db) -> Arc<AppState> {
	let model = OpenAiCompatModel::from_config(&cfg.llm).map(|m| Arc::new(m) as Arc<dyn ChatModel>);
	if model.is_none() {
		warn!("OPENROUTER_API_KEY not set; chat endpoint disabled");
	}
	assemble_state(cfg, db, model)
}

fn assemble_state(cfg: config::Config, db: Db, model: Option<Arc<dyn ChatModel>>) -> Arc<AppState> {
	let authorizer = Arc::new(PathAuthorizer::new(cfg.allowed_roots.clone()));
	let registry = Arc::new(ToolRegistry::new());
	let tool_ctx = ToolContext { authorizer: authorizer.clone(), db: db.clone() };
	let agent = model.map(|model| {
		info!(model = %model.default_model(), base_url = %cfg.llm.base_url, "agent enabled");
		Arc::new(FileAgent::new(model, registry.clone(), tool_ctx.clone(), cfg.llm.max_steps))
	});
	Arc::new(AppState {
		start_time: Instant::now(),
		db,
		config: cfg,
		authorizer,
		registry,
		tool_ctx,
		agent,
		last_scan: StdMutex::new(None),
		watching: StdMutex::new(false),
	})
}

fn init_tracing() {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	// stderr only: stdout carries JSON-RPC when --stdio is on
	let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr);
	tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

fn build_router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/status", get(status))
		.route("/tools", get(list_tools_route))
		.route("/tools/call", post(call_tool_route))
		.route("/v1/chat/completions", post(chat_completions))
		.route("/episodes", get(episodes_route))
		.route("/graph", get(graph_snapshot))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

async fn health() -> Json<Health> { Json(Health { status: "ok" }) }

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
	let graph = kg::graph_counts(&state.db).unwrap_or_default();
	Json(StatusResponse {
		uptime_ms: state.start_time.elapsed().as_millis(),
		bind: state.config.bind.to_string(),
		allowed_roots: state.authorizer.roots().iter().map(|r| r.display().to_string()).collect(),
		graph,
		agent_enabled: state.agent.is_some(),
		watching: state.watching.lock().map(|w| *w).unwrap_or(false),
		last_scan: state.last_scan.lock().ok().and_then(|s| *s),
	})
}

async fn list_tools_route(State(state): State<Arc<AppState>>) -> Json<Vec<ToolDefinition>> {
	Json(state.registry.list_tools())
}

/// Run a tool on the blocking pool and render its result string.
async fn run_tool(state: &Arc<AppState>, name: String, arguments: JsonValue) -> Result<String, task::JoinError> {
	let (registry, ctx) = (state.registry.clone(), state.tool_ctx.clone());
	task::spawn_blocking(move || tools::render(registry.call(&name, arguments, &ctx))).await
}

async fn call_tool_route(State(state): State<Arc<AppState>>, Json(req): Json<ToolCallRequest>) -> Response {
	if !state.registry.has_tool(&req.name) {
		return json_error(StatusCode::NOT_FOUND, "UNKNOWN_TOOL", format!("unknown tool: {}", req.name), None);
	}
	match run_tool(&state, req.name.clone(), req.arguments).await {
		Ok(result) => Json(serde_json::json!({ "name": req.name, "result": result })).into_response(),
		Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "TOOL_PANIC", err.to_string(), None),
	}
}

async fn chat_completions(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> Response {
	let Some(agent) = state.agent.clone() else {
		return json_error(StatusCode::SERVICE_UNAVAILABLE, "AGENT_DISABLED", "no LLM credentials configured", None);
	};
	if req.messages.is_empty() {
		return json_error(StatusCode::BAD_REQUEST, "INVALID_INPUT", "messages must not be empty", None);
	}
	match agent.run(req.messages, req.model.as_deref()).await {
		Ok(reply) => Json(serde_json::json!({
			"id": format!("chatcmpl-{}", Uuid::new_v4()),
			"object": "chat.completion",
			"created": chrono::Utc::now().timestamp(),
			"model": reply.model,
			"choices": [{
				"index": 0,
				"message": { "role": "assistant", "content": reply.content },
				"finish_reason": "stop"
			}]
		})).into_response(),
		Err(err) => {
			error!(error = %err, "agent run failed");
			json_error(StatusCode::INTERNAL_SERVER_ERROR, "AGENT_ERROR", err.to_string(), None)
		}
	}
}

async fn episodes_route(State(state): State<Arc<AppState>>, Query(params): Query<HashMap<String, String>>) -> Response {
	let limit = params.get("limit").and_then(|v| v.parse::<usize>().ok()).unwrap_or(50).clamp(1, 1000);
	let result = match params.get("path").filter(|p| !p.is_empty()) {
		Some(path) => kg::episodes_for_path(&state.db, path, limit),
		None => kg::recent_episodes(&state.db, limit),
	};
	match result {
		Ok(episodes) => Json(serde_json::json!({ "episodes": episodes })).into_response(),
		Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", err.to_string(), None),
	}
}

async fn graph_snapshot(State(state): State<Arc<AppState>>, Query(params): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
	use petgraph::graph::Graph;
	let limit = params.get("limit").and_then(|v| v.parse::<usize>().ok()).unwrap_or(500);
	let edges = kg::containment_edges(&state.db, limit).unwrap_or_default();
	let mut g: Graph<String, &'static str> = Graph::new();
	let mut nodes = HashMap::new();
	for (child, parent) in &edges {
		let c = *nodes.entry(child.clone()).or_insert_with(|| g.add_node(child.clone()));
		let p = *nodes.entry(parent.clone()).or_insert_with(|| g.add_node(parent.clone()));
		g.add_edge(c, p, "CONTAINED_IN");
	}
	let nodes_out: Vec<String> = g.node_indices().map(|i| g[i].clone()).collect();
	let edges_out: Vec<(String, String, &str)> = g.edge_indices()
		.filter_map(|e| g.edge_endpoints(e).map(|(s, t)| (g[s].clone(), g[t].clone(), g[e])))
		.collect();
	Json(serde_json::json!({ "nodes": nodes_out, "edges": edges_out }))
}

async fn run_stdio(state: Arc<AppState>) {
	let stdin = tokio::io::stdin();
	let mut reader = BufReader::new(stdin).lines();
	while let Ok(Some(line)) = reader.next_line().await {
		let line = line.trim();
		if line.is_empty() { continue; }
		let Ok(msg) = serde_json::from_str::<serde_json::Value>(line) else { continue };
		if let Some(out) = handle_rpc(&state, &msg).await {
			match serde_json::to_string(&out) {
				Ok(s) => println!("{}", s),
				Err(err) => error!(error = %err, "cannot encode JSON-RPC reply"),
			}
		}
	}
}

/// One JSON-RPC request in, at most one reply out. Notifications get none.
async fn handle_rpc(state: &Arc<AppState>, msg: &serde_json::Value) -> Option<serde_json::Value> {
	let id = msg.get("id").filter(|v| !v.is_null())?.clone();
	let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
	let params = msg.get("params").cloned().unwrap_or(serde_json::json!({}));
	let mut out = serde_json::json!({ "jsonrpc": "2.0", "id": id });
	match method {
		"initialize" => {
			out["result"] = serde_json::json!({
				"serverInfo": { "name": "file-agent-server", "version": env!("CARGO_PKG_VERSION") },
				"protocolVersion": "2024-11-05",
				"capabilities": { "tools": { "listChanged": false } }
			});
		}
		"tools/list" => {
			out["result"] = serde_json::json!({ "tools": state.registry.list_tools() });
		}
		"tools/call" => {
			let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string();
			let arguments = params.get("arguments").cloned().unwrap_or(serde_json::json!({}));
			if !state.registry.has_tool(&name) {
				out["error"] = serde_json::json!({ "code": -32602, "message": format!("Unknown tool: {}", name) });
			} else {
				match run_tool(state, name, arguments).await {
					Ok(text) => {
						let is_error = text.starts_with("Error:");
						out["result"] = serde_json::json!({ "content": [ { "type": "text", "text": text } ], "isError": is_error });
					}
					Err(err) => out["error"] = serde_json::json!({ "code": -32000, "message": err.to_string() }),
				}
			}
		}
		_ => {
			out["error"] = serde_json::json!({ "code": -32601, "message": format!("Unknown method: {}", method) });
		}
	}
	Some(out)
}

async fn shutdown_signal() {
	if let Err(err) = signal::ctrl_c().await {
		error!(error = %err, "cannot listen for ctrl-c");
	}
}
