//! Chatrelay LLM - Generation capabilities, remote and local

pub mod moderation;
pub mod openai;
pub mod process;
pub mod provider;
pub mod types;

pub use moderation::OpenAiModeration;
pub use openai::OpenAiProvider;
pub use process::{ProcessModel, ProcessRuntime};
pub use provider::{
    LlmError, LlmResult, LoadedModel, LocalRuntime, ModerationClassifier, RemoteProvider,
};
pub use types::*;
