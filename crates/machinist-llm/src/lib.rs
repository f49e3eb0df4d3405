pub mod providers;
pub mod retry;
pub mod streaming;

use machinist_core::config::ModelConfig;
use machinist_core::traits::LlmClient;

pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client for the configured provider.
///
/// Everything speaks the OpenAI-compatible wire format — local llama.cpp,
/// vLLM, Ollama, and hosted endpoints alike — so the provider name only
/// matters for defaults.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    let client = Box::new(OpenAiClient::new());
    match &config.retry {
        Some(retry) => Box::new(RetryingClient::new(client, retry.clone())),
        None => client,
    }
}
