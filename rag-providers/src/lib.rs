//! Chat-completion and embedding providers for the research service.
//!
//! [`rag_core::agent::provider::Provider`] is implemented once against both
//! an OpenAI-style endpoint and an Azure OpenAI endpoint, selected at
//! construction time from [`rag_core::config::Config`]: both a deployment
//! name and an API version present means Azure, otherwise plain OpenAI.

pub mod embedder;
pub mod mock;
pub mod openai;
mod sse;

pub use embedder::OpenAiEmbedder;
pub use mock::MockProvider;
pub use openai::{Endpoint, OpenAiProvider};

/// HTTP client tuning shared by the chat-completion and embedding clients.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub pool_idle_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            pool_idle_timeout_secs: 90,
            pool_max_idle_per_host: 32,
        }
    }
}

impl HttpConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, rag_core::Error> {
        use std::time::Duration;

        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .pool_idle_timeout(Duration::from_secs(self.pool_idle_timeout_secs))
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .build()
            .map_err(rag_core::Error::Http)
    }
}
