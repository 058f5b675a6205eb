//! Prompt assembly with token budgeting

use chatrelay_core::{BackendDescriptor, Message, Persona};
use chatrelay_llm::ChatMessage;

const CHARS_PER_TOKEN: f32 = 4.0;
/// Per-message framing overhead.
const MESSAGE_OVERHEAD: usize = 10;

pub struct ContextManager {
    max_tokens: usize,
}

/// Prompt ready for a backend.
#[derive(Clone, Debug)]
pub struct AssembledPrompt {
    pub messages: Vec<ChatMessage>,
    pub estimated_tokens: usize,
    /// History messages dropped to fit the budget.
    pub trimmed: usize,
}

impl ContextManager {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    /// Budget for the prompt: the context window minus room for the reply.
    pub fn for_backend(backend: &BackendDescriptor) -> Self {
        Self::new(
            backend
                .context_limit
                .saturating_sub(backend.max_output_tokens) as usize,
        )
    }

    pub fn estimate_tokens(text: &str) -> usize {
        (text.len() as f32 / CHARS_PER_TOKEN).ceil() as usize
    }

    pub fn message_tokens(message: &ChatMessage) -> usize {
        Self::estimate_tokens(&message.content) + MESSAGE_OVERHEAD
    }

    /// System prompt, then windowed history, then the new user message.
    ///
    /// Oldest history goes first when over budget. The system prompt and the
    /// user message are always kept, even if they alone exceed the budget.
    pub fn assemble(&self, persona: &Persona, history: &[Message], user: &str) -> AssembledPrompt {
        let system = (!persona.system_prompt.trim().is_empty())
            .then(|| ChatMessage::system(persona.system_prompt.clone()));
        let user = ChatMessage::user(user);

        let fixed = system.as_ref().map_or(0, Self::message_tokens) + Self::message_tokens(&user);
        let history: Vec<ChatMessage> = history.iter().map(ChatMessage::from).collect();
        let mut history_tokens: usize = history.iter().map(Self::message_tokens).sum();

        let mut skip = 0;
        while skip < history.len() && fixed + history_tokens > self.max_tokens {
            history_tokens -= Self::message_tokens(&history[skip]);
            skip += 1;
        }
        if skip > 0 {
            tracing::info!(
                persona = %persona.id,
                "Trimmed {} history message(s) to fit {} tokens",
                skip,
                self.max_tokens
            );
        }

        let mut messages = Vec::with_capacity(history.len() - skip + 2);
        messages.extend(system);
        messages.extend(history.into_iter().skip(skip));
        messages.push(user);

        AssembledPrompt {
            messages,
            estimated_tokens: fixed + history_tokens,
            trimmed: skip,
        }
    }
}
