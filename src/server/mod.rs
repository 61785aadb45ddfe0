pub mod api;

use crate::agent::ChatAgent;
use crate::cli::Args;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

pub use api::{ build_router, AppState };

pub struct Server {
    agent: Arc<ChatAgent>,
    args: Args,
}

impl Server {
    pub fn new(agent: Arc<ChatAgent>, args: Args) -> Self {
        Self { agent, args }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let state = AppState { agent: Arc::clone(&self.agent) };
        let static_dir = Some(self.args.static_dir.as_str())
            .filter(|dir| !dir.trim().is_empty())
            .map(Path::new);
        let app = build_router(state, static_dir);

        api::start_http_server(app, &self.args).await
    }
}
