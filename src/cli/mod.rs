use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address and port for the HTTP server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "0.0.0.0:3000")]
    pub server_addr: String,

    /// Directory of static front-end files served for unmatched paths. Skipped if it does not exist.
    #[arg(long, env = "STATIC_DIR", default_value = "frontend")]
    pub static_dir: String,

    /// Serve HTTPS. Requires --tls-cert-path and --tls-key-path.
    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    /// Path to the TLS certificate file (PEM format).
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Path to the TLS private key file (PEM format).
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for chat completion (gemini, openai, ollama)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "gemini")]
    pub chat_llm_type: String,

    /// Base URL for the Chat LLM provider API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// API Key for the Chat LLM provider.
    #[arg(long, env = "CHAT_API_KEY", default_value = "", hide_env_values = true)]
    pub chat_api_key: String,

    /// Gemini API key, used when CHAT_API_KEY is empty.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    /// Model name for chat completion (e.g., gemini-2.5-flash, gpt-4o-mini, llama3)
    #[arg(long, env = "CHAT_MODEL")] // No default, rely on adapter defaults if None
    pub chat_model: Option<String>,

    /// Seconds to wait for the chat model before giving up on a message.
    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value = "60")]
    pub llm_timeout_secs: u64,

    /// Optional JSON file overriding the system instruction: { "system_instruction": "..." }
    #[arg(long, env = "PROMPTS_PATH")]
    pub prompts_path: Option<String>,

    // --- History Store Args ---
    /// History chat store type (memory)
    #[arg(long, env = "HISTORY_TYPE", default_value = "memory")]
    pub history_type: String,

    /// Turns kept per session. Rounded down to whole user/assistant pairs.
    #[arg(long, env = "HISTORY_MAX_TURNS", default_value = "20")]
    pub history_max_turns: usize,

    /// Maximum live sessions; the least recently active is evicted beyond it. 0 means unbounded.
    #[arg(long, env = "SESSION_CAPACITY", default_value = "0")]
    pub session_capacity: usize,

    /// Sessions idle longer than this many seconds are dropped. 0 disables expiry.
    #[arg(long, env = "SESSION_IDLE_TTL_SECS", default_value = "0")]
    pub session_idle_ttl_secs: u64,

    /// How often the idle-session sweeper runs, in seconds.
    #[arg(long, env = "SESSION_SWEEP_SECS", default_value = "60")]
    pub session_sweep_secs: u64,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    /// CHAT_API_KEY, falling back to GEMINI_API_KEY. `None` when neither is set.
    pub fn resolved_chat_api_key(&self) -> Option<String> {
        Some(self.chat_api_key.clone())
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.gemini_api_key.clone().filter(|k| !k.trim().is_empty()))
    }

    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        if !self.enable_tls {
            return None;
        }
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["care-chat"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn chat_key_takes_precedence_over_gemini_key() {
        let args = parse(&["--chat-api-key", "primary", "--gemini-api-key", "fallback"]);
        assert_eq!(args.resolved_chat_api_key().as_deref(), Some("primary"));

        let args = parse(&["--chat-api-key", " ", "--gemini-api-key", "fallback"]);
        assert_eq!(args.resolved_chat_api_key().as_deref(), Some("fallback"));
    }

    #[test]
    fn tls_needs_both_paths() {
        let args = parse(&["--enable-tls", "--tls-cert-path", "cert.pem"]);
        assert!(args.tls_paths().is_none());

        let args = parse(&["--enable-tls", "--tls-cert-path", "cert.pem", "--tls-key-path", "key.pem"]);
        assert_eq!(args.tls_paths(), Some(("cert.pem", "key.pem")));
    }
}
