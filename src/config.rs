//! Service configuration loaded from environment variables

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the KPI query core.
///
/// Everything is read from the environment once at startup; a `.env` file is
/// honoured when present. An empty API key puts the LLM client into fallback
/// mode rather than failing startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Google Gemini API key. Empty string disables live generation.
    pub llm_api_key: String,
    /// Gemini model name, e.g. "gemini-2.0-flash-exp".
    pub llm_model: String,
    /// Base URL of the generateContent endpoint family.
    pub llm_base_url: String,
    /// Path of the durable connection-store document.
    pub store_path: PathBuf,
    /// Bound on how long a single database connect may block.
    pub connect_timeout: Duration,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let timeout_secs = std::env::var("ASKDB_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10);

        Self {
            llm_api_key: std::env::var("GOOGLE_API_KEY").unwrap_or_default(),
            llm_model: std::env::var("ASKDB_LLM_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash-exp".to_string()),
            llm_base_url: std::env::var("ASKDB_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            store_path: std::env::var("ASKDB_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/database.json")),
            connect_timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            llm_api_key: String::new(),
            llm_model: "gemini-2.0-flash-exp".to_string(),
            llm_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            store_path: PathBuf::from("config/database.json"),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Initialize tracing with an env-filter. Intended for the embedding server
/// binary; the library itself only emits events.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
