use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_BIND: &str = "127.0.0.1:8000";
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_LLM_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_LLM_MODEL: &str = "openai/gpt-4-turbo";

#[derive(Debug, Clone)]
pub struct LlmConfig {
	pub api_key: Option<String>,
	pub base_url: String,
	pub model: String,
	pub max_steps: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub bind: SocketAddr,
	pub data_dir: String,
	pub allowed_roots: Vec<PathBuf>,
	pub llm: LlmConfig,
	pub watch_workers: usize,
	pub store_retries: u32,
	pub scan_on_startup: bool,
}

impl Config {
	pub fn load() -> anyhow::Result<Self> {
		let _ = dotenvy::dotenv();
		let port = std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok());
		let bind = if let Some(p) = port { format!("127.0.0.1:{}", p) } else { std::env::var("HTTP_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string()) };
		let bind: SocketAddr = bind.parse()?;
		let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
		let allowed_roots = parse_allowed_paths(&std::env::var("ALLOWED_PATHS").unwrap_or_default());
		let llm = LlmConfig {
			api_key: std::env::var("OPENROUTER_API_KEY").ok().filter(|k| !k.trim().is_empty()),
			base_url: std::env::var("LLM_BASE_URL").unwrap_or_else(|_| DEFAULT_LLM_BASE_URL.to_string()),
			model: std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string()),
			max_steps: env_parse("AGENT_MAX_STEPS").unwrap_or(8),
		};
		Ok(Self {
			bind,
			data_dir,
			allowed_roots,
			llm,
			watch_workers: env_parse::<usize>("WATCH_WORKERS").unwrap_or(4).max(1),
			store_retries: env_parse("STORE_RETRIES").unwrap_or(0),
			scan_on_startup: env_parse("SCAN_ON_STARTUP").unwrap_or(true),
		})
	}

	/// Location of the sled graph store under the data directory.
	pub fn graph_dir(&self) -> PathBuf {
		PathBuf::from(&self.data_dir).join("graph")
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
			data_dir: DEFAULT_DATA_DIR.to_string(),
			allowed_roots: Vec::new(),
			llm: LlmConfig { api_key: None, base_url: DEFAULT_LLM_BASE_URL.to_string(), model: DEFAULT_LLM_MODEL.to_string(), max_steps: 8 },
			watch_workers: 4,
			store_retries: 0,
			scan_on_startup: true,
		}
	}
}

/// Split a comma-separated allow-list, dropping blank segments.
pub fn parse_allowed_paths(raw: &str) -> Vec<PathBuf> {
	raw.split(',').map(str::trim).filter(|p| !p.is_empty()).map(PathBuf::from).collect()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
	std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
