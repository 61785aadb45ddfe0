use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use log::info;

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful medical assistant chatbot. You provide general health information, answer medical questions, and offer health advice.

Important guidelines:
- Provide accurate, helpful medical information
- Always remind users that you're not a replacement for professional medical advice
- For serious symptoms, recommend consulting a healthcare professional
- Be empathetic and supportive
- Keep responses clear and concise
- If unsure, acknowledge limitations

Remember: You provide information only, not diagnoses or treatment plans.";

#[derive(Debug)]
pub enum PromptError {
    EmptyInstruction(String),
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::EmptyInstruction(path) =>
                write!(f, "Prompt file '{}' has an empty system_instruction", path),
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PromptConfig {
    pub system_instruction: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self { system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string() }
    }
}

pub fn load_prompts<P: AsRef<Path>>(path: P) -> Result<Arc<PromptConfig>, PromptError> {
    let file_content = fs::read_to_string(&path)?;
    let config: PromptConfig = serde_json::from_str(&file_content)?;
    if config.system_instruction.trim().is_empty() {
        return Err(PromptError::EmptyInstruction(path.as_ref().display().to_string()));
    }
    Ok(Arc::new(config))
}

/// The file at `path` when one is given, the built-in instruction otherwise.
pub fn resolve_prompts(path: Option<&str>) -> Result<Arc<PromptConfig>, PromptError> {
    match path.filter(|p| !p.trim().is_empty()) {
        Some(path) => {
            let config = load_prompts(path)?;
            info!("Loaded system instruction from {}", path);
            Ok(config)
        }
        None => Ok(Arc::new(PromptConfig::default())),
    }
}
