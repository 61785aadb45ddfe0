pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod server;

use agent::ChatAgent;
use cli::Args;
use history::spawn_eviction_sweeper;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Chat Model: {}", args.chat_model.as_deref().unwrap_or("adapter default"));
    info!("Chat API Key: {}", if args.resolved_chat_api_key().is_some() { "Configured" } else { "MISSING" });
    info!("LLM Timeout: {}s", args.llm_timeout_secs);
    info!("History Store Type: {}", args.history_type);
    info!("History Max Turns: {}", args.history_max_turns);
    info!("Session Capacity: {}", if args.session_capacity == 0 { "unbounded".to_string() } else { args.session_capacity.to_string() });
    info!("Session Idle TTL: {}s", args.session_idle_ttl_secs);
    info!("Static Dir: {}", args.static_dir);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let agent = Arc::new(ChatAgent::new(&args)?);

    if args.session_idle_ttl_secs > 0 {
        let every = Duration::from_secs(args.session_sweep_secs.max(1));
        info!("Idle session sweeper running every {:?}", every);
        spawn_eviction_sweeper(Arc::clone(agent.history_store()), every);
    }

    let server = Server::new(agent, args);
    server.run().await?;

    Ok(())
}
