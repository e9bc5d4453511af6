mod base_url;
mod error;
mod llm;
mod retry;

pub use base_url::check_base_url;
pub use error::AdapterError;
pub use llm::create_backend;
pub use retry::{call_with_retry, RetryPolicy};

pub use storyloom_core::gateway::{LanguageModel, LanguageModelError, ModelReply};
