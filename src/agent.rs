use crate::cli::Args;
use crate::config::prompt::{ self, PromptConfig };
use crate::error::ChatError;
use crate::history::{ build_prompt, initialize_history_store, HistoryStore };
use crate::llm::{ LlmConfig, LlmType };
use crate::llm::chat::{ ChatClient, new_client as new_chat_client };
use crate::models::chat::{ Transcript, Turn };

use chrono::{ DateTime, Utc };
use dashmap::DashMap;
use log::{ debug, error, info, warn };
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of one successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub reply: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

enum ChatBackend {
    Ready(Arc<dyn ChatClient>),
    Unconfigured(String),
}

type ExchangeGates = DashMap<String, Arc<Mutex<()>>>;

/// Holds a session's exchange gate and drops it from the table once nobody
/// else holds or awaits it.
struct GateLease<'a> {
    gates: &'a ExchangeGates,
    session_id: &'a str,
    gate: Arc<Mutex<()>>,
}

impl<'a> GateLease<'a> {
    fn acquire(gates: &'a ExchangeGates, session_id: &'a str) -> Self {
        let gate = gates.entry(session_id.to_string()).or_default().value().clone();
        Self { gates, session_id, gate }
    }
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        // Two references left means the table's and ours.
        self.gates.remove_if(self.session_id, |_, gate| {
            Arc::ptr_eq(gate, &self.gate) && Arc::strong_count(gate) == 2
        });
    }
}

/// Runs chat exchanges: transcript → prompt → model → transcript.
///
/// Exchanges on the same session id are serialized, so each one sees the pair
/// appended by the one before it. Different sessions never wait on each other.
pub struct ChatAgent {
    chat_backend: ChatBackend,
    history_store: Arc<dyn HistoryStore>,
    prompt_config: Arc<PromptConfig>,
    llm_timeout: Duration,
    exchange_gates: ExchangeGates,
}

impl ChatAgent {
    pub fn new(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let chat_backend = Self::initialize_chat_backend(args)?;
        let history_store = initialize_history_store(args)?;
        let prompt_config = prompt::resolve_prompts(args.prompts_path.as_deref())?;

        Ok(Self {
            chat_backend,
            history_store,
            prompt_config,
            llm_timeout: Duration::from_secs(args.llm_timeout_secs.max(1)),
            exchange_gates: DashMap::new(),
        })
    }

    /// Assembles an agent from ready-made parts. A `None` client makes every
    /// exchange fail with [`ChatError::MisconfiguredService`].
    pub fn from_parts(
        chat_client: Option<Arc<dyn ChatClient>>,
        history_store: Arc<dyn HistoryStore>,
        prompt_config: Arc<PromptConfig>,
        llm_timeout: Duration
    ) -> Self {
        let chat_backend = match chat_client {
            Some(client) => ChatBackend::Ready(client),
            None => ChatBackend::Unconfigured("no chat client configured".to_string()),
        };
        Self {
            chat_backend,
            history_store,
            prompt_config,
            llm_timeout,
            exchange_gates: DashMap::new(),
        }
    }

    fn initialize_chat_backend(args: &Args) -> Result<ChatBackend, Box<dyn Error + Send + Sync>> {
        let llm_type: LlmType = args.chat_llm_type.parse()?;
        let chat_config = LlmConfig {
            llm_type: llm_type.clone(),
            base_url: args.chat_base_url.clone(),
            api_key: args.resolved_chat_api_key(),
            completion_model: args.chat_model.clone(),
        };

        if llm_type.requires_api_key() && chat_config.api_key.is_none() {
            warn!(
                "No API key configured for chat provider '{}'. Chat requests will fail until one is set.",
                llm_type
            );
            return Ok(ChatBackend::Unconfigured("API key not configured".to_string()));
        }

        match new_chat_client(&chat_config) {
            Ok(client) => {
                info!(
                    "Chat client configured: Type={}, Model={}, BaseURL={}",
                    llm_type,
                    client.get_model(),
                    client.get_base_url().as_deref().unwrap_or("adapter default")
                );
                Ok(ChatBackend::Ready(client))
            }
            Err(e) => {
                error!("Failed to build chat client '{}': {}", llm_type, e);
                Ok(ChatBackend::Unconfigured("Chat client not configured".to_string()))
            }
        }
    }

    pub fn history_store(&self) -> &Arc<dyn HistoryStore> {
        &self.history_store
    }

    pub fn is_configured(&self) -> bool {
        matches!(self.chat_backend, ChatBackend::Ready(_))
    }

    pub fn transcript(&self, session_id: &str) -> Transcript {
        self.history_store.get(session_id)
    }

    pub async fn process_message(
        &self,
        session_id: &str,
        message: &str
    ) -> Result<ChatReply, ChatError> {
        if message.trim().is_empty() {
            return Err(ChatError::InvalidRequest("Message is required".to_string()));
        }
        if session_id.trim().is_empty() {
            return Err(ChatError::InvalidRequest("Session id is required".to_string()));
        }
        let chat_client = match &self.chat_backend {
            ChatBackend::Ready(client) => client.as_ref(),
            ChatBackend::Unconfigured(reason) => {
                return Err(ChatError::MisconfiguredService(reason.clone()));
            }
        };

        let lease = GateLease::acquire(&self.exchange_gates, session_id);
        let _exchange = lease.gate.lock().await;
        self.execute_exchange(chat_client, session_id, message).await
    }

    async fn execute_exchange(
        &self,
        chat_client: &dyn ChatClient,
        session_id: &str,
        message: &str
    ) -> Result<ChatReply, ChatError> {
        let transcript = self.history_store.get(session_id);
        let prompt = build_prompt(&self.prompt_config.system_instruction, &transcript, message);
        let user_turn = Turn::user(message);
        debug!(
            "Session {}: calling {} with {} prior turns ({} prompt chars)",
            session_id,
            chat_client.get_model(),
            transcript.len(),
            prompt.len()
        );

        let response = match tokio::time::timeout(self.llm_timeout, chat_client.complete(&prompt)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                // Provider errors can embed request URLs and keys; keep them in the log only.
                error!("Chat model call failed for session {}: {}", session_id, e);
                return Err(ChatError::ServiceUnavailable("model call failed".to_string()));
            }
            Err(_) => {
                warn!(
                    "Chat model call for session {} timed out after {:?}",
                    session_id,
                    self.llm_timeout
                );
                return Err(
                    ChatError::ServiceUnavailable(
                        format!("model call timed out after {}s", self.llm_timeout.as_secs())
                    )
                );
            }
        };

        if response.response.trim().is_empty() {
            warn!("Chat model returned an empty reply for session {}", session_id);
            return Err(ChatError::ServiceUnavailable("model returned an empty reply".to_string()));
        }

        self.history_store.append(
            session_id,
            user_turn,
            Turn::assistant(response.response.clone())
        );
        info!("Session {}: exchange recorded", session_id);

        Ok(ChatReply {
            reply: response.response,
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        })
    }

    pub fn clear_session(&self, session_id: &str) {
        self.history_store.clear(session_id);
        info!("Session {}: history cleared", session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ EvictionPolicy, MemoryHistoryStore };
    use crate::llm::chat::CompletionResponse;
    use crate::models::chat::Role;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::error::Error as StdError;
    use std::sync::Mutex as StdMutex;

    enum Scripted {
        Reply(&'static str),
        Fail(&'static str),
        Hang,
    }

    /// Replays scripted outcomes in order; echoes the prompt length once the script runs out.
    #[derive(Default)]
    struct ScriptedClient {
        script: StdMutex<VecDeque<Scripted>>,
        prompts: StdMutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Scripted>) -> Self {
            Self { script: StdMutex::new(script.into()), ..Self::default() }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn complete(
            &self,
            prompt: &str
        ) -> Result<CompletionResponse, Box<dyn StdError + Send + Sync>> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let next = self.script.lock().unwrap().pop_front();
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match next {
                Some(Scripted::Reply(text)) => Ok(CompletionResponse { response: text.to_string() }),
                Some(Scripted::Fail(reason)) => Err(reason.into()),
                Some(Scripted::Hang) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                None => Ok(CompletionResponse { response: format!("reply to {} chars", prompt.len()) }),
            }
        }

        fn get_model(&self) -> String {
            "scripted".to_string()
        }

        fn get_base_url(&self) -> Option<String> {
            None
        }
    }

    fn agent_with(client: Arc<ScriptedClient>, timeout: Duration) -> ChatAgent {
        let chat_client: Arc<dyn ChatClient> = client;
        ChatAgent::from_parts(
            Some(chat_client),
            Arc::new(MemoryHistoryStore::new(20, EvictionPolicy::Unbounded)),
            Arc::new(PromptConfig { system_instruction: "SYS".to_string() }),
            timeout
        )
    }

    #[tokio::test]
    async fn records_exchange_and_returns_reply() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Reply("Rest and fluids.")]));
        let agent = agent_with(Arc::clone(&client), DEFAULT_LLM_TIMEOUT);

        let reply = agent.process_message("s1", "What are cold symptoms?").await.unwrap();
        assert_eq!(reply.reply, "Rest and fluids.");
        assert_eq!(reply.session_id, "s1");

        let transcript = agent.transcript("s1");
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.turns()[0].role, Role::User);
        assert_eq!(transcript.turns()[0].content, "What are cold symptoms?");
        assert_eq!(transcript.turns()[1].content, "Rest and fluids.");
        assert_eq!(client.prompts(), vec!["SYS\n\nUser: What are cold symptoms?\nAssistant:".to_string()]);
    }

    #[tokio::test]
    async fn second_prompt_carries_first_exchange() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Reply("hey"), Scripted::Reply("ok")]));
        let agent = agent_with(Arc::clone(&client), DEFAULT_LLM_TIMEOUT);

        agent.process_message("s1", "hi").await.unwrap();
        agent.process_message("s1", "more").await.unwrap();

        assert_eq!(client.prompts()[1], "SYS\n\nUser: hi\nAssistant: hey\nUser: more\nAssistant:");
    }

    #[tokio::test]
    async fn rejects_blank_input_without_calling_model() {
        let client = Arc::new(ScriptedClient::default());
        let agent = agent_with(Arc::clone(&client), DEFAULT_LLM_TIMEOUT);

        assert!(matches!(agent.process_message("s1", "  \n").await, Err(ChatError::InvalidRequest(_))));
        assert!(matches!(agent.process_message("", "hello").await, Err(ChatError::InvalidRequest(_))));
        assert!(client.prompts().is_empty());
        assert!(agent.history_store().is_empty());
    }

    #[tokio::test]
    async fn model_failure_leaves_transcript_untouched() {
        let client = Arc::new(
            ScriptedClient::new(vec![Scripted::Reply("first"), Scripted::Fail("quota exceeded")])
        );
        let agent = agent_with(Arc::clone(&client), DEFAULT_LLM_TIMEOUT);

        agent.process_message("s1", "one").await.unwrap();
        let before = agent.transcript("s1");

        let err = agent.process_message("s1", "two").await.unwrap_err();
        assert_eq!(err, ChatError::ServiceUnavailable("model call failed".to_string()));
        assert_eq!(agent.transcript("s1"), before);

        // A retry of the same message is not duplicated.
        agent.process_message("s1", "two").await.unwrap();
        let transcript = agent.transcript("s1");
        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript.turns()[2].content, "two");
    }

    #[tokio::test]
    async fn empty_model_reply_is_not_recorded() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Reply("   ")]));
        let agent = agent_with(client, DEFAULT_LLM_TIMEOUT);

        let err = agent.process_message("s1", "hello").await.unwrap_err();
        assert!(matches!(err, ChatError::ServiceUnavailable(_)));
        assert!(agent.history_store().lookup("s1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_service_unavailable() {
        let client = Arc::new(ScriptedClient::new(vec![Scripted::Hang]));
        let agent = agent_with(client, Duration::from_secs(5));

        let err = agent.process_message("s1", "hello").await.unwrap_err();
        assert_eq!(err, ChatError::ServiceUnavailable("model call timed out after 5s".to_string()));
        assert!(agent.history_store().lookup("s1").is_none());
    }

    #[tokio::test]
    async fn missing_client_is_misconfigured() {
        let agent = ChatAgent::from_parts(
            None,
            Arc::new(MemoryHistoryStore::new(20, EvictionPolicy::Unbounded)),
            Arc::new(PromptConfig::default()),
            DEFAULT_LLM_TIMEOUT
        );
        assert!(!agent.is_configured());
        assert!(
            matches!(agent.process_message("s1", "hello").await, Err(ChatError::MisconfiguredService(_)))
        );
    }

    #[tokio::test]
    async fn eleven_exchanges_then_clear() {
        let client = Arc::new(ScriptedClient::default());
        let agent = agent_with(client, DEFAULT_LLM_TIMEOUT);

        agent.process_message("s1", "What are cold symptoms?").await.unwrap();
        for n in 2..=11 {
            agent.process_message("s1", &format!("question {}", n)).await.unwrap();
        }
        let transcript = agent.transcript("s1");
        assert_eq!(transcript.len(), 20);
        assert_eq!(transcript.turns()[0].content, "question 2");

        agent.clear_session("s1");
        assert!(agent.transcript("s1").is_empty());
        agent.clear_session("s1");
        assert!(agent.transcript("s1").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_session_exchanges_do_not_lose_updates() {
        let client = Arc::new(ScriptedClient {
            delay: Some(Duration::from_millis(5)),
            ..ScriptedClient::default()
        });
        let agent = Arc::new(agent_with(Arc::clone(&client), DEFAULT_LLM_TIMEOUT));

        let handles: Vec<_> = (0..6)
            .map(|n| {
                let agent = Arc::clone(&agent);
                tokio::spawn(async move {
                    agent.process_message("shared", &format!("m{}", n)).await.unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(agent.transcript("shared").len(), 12);
        // Each prompt saw every exchange recorded before it.
        let mut prior_turns: Vec<usize> = client
            .prompts()
            .iter()
            .map(|p| p.matches("\nAssistant: ").count())
            .collect();
        prior_turns.sort();
        assert_eq!(prior_turns, vec![0, 1, 2, 3, 4, 5]);
        assert!(agent.exchange_gates.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sessions_progress_independently() {
        let client = Arc::new(ScriptedClient::default());
        let agent = Arc::new(agent_with(client, DEFAULT_LLM_TIMEOUT));

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let agent = Arc::clone(&agent);
                tokio::spawn(async move {
                    let session_id = format!("s{}", n);
                    for i in 0..3 {
                        agent.process_message(&session_id, &format!("q{}", i)).await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        for n in 0..4 {
            let transcript = agent.transcript(&format!("s{}", n));
            assert_eq!(transcript.len(), 6);
            assert_eq!(transcript.turns()[4].content, "q2");
        }
    }
}
