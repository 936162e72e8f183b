//! OpenAI (and Azure OpenAI) embeddings, against the same two endpoint
//! shapes the chat-completion provider speaks.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use rag_core::collaborators::Embedder;
use rag_core::config::Config;
use rag_core::error::{Error, Result};

use crate::openai::Endpoint;
use crate::HttpConfig;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Embeds text via an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    endpoint: Endpoint,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: Endpoint,
        model: impl Into<String>,
        dimension: usize,
    ) -> Result<Self> {
        let client = HttpConfig::default().build_client()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint,
            model: model.into(),
            dimension,
        })
    }

    /// Build from process config, mirroring [`crate::OpenAiProvider::from_config`]'s
    /// Azure-vs-OpenAI selection so a single config drives both collaborators.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config
            .llm_api_key
            .clone()
            .ok_or_else(|| Error::Embedding("llm_api_key not configured".to_string()))?;

        let endpoint = match (&config.llm_deployment, &config.llm_api_version) {
            (Some(deployment), Some(api_version)) => {
                let endpoint = config.llm_endpoint.clone().ok_or_else(|| {
                    Error::Embedding("llm_endpoint required for an Azure deployment".to_string())
                })?;
                Endpoint::Azure {
                    endpoint,
                    deployment: deployment.clone(),
                    api_version: api_version.clone(),
                }
            }
            _ => Endpoint::OpenAiStyle {
                base_url: config
                    .llm_endpoint
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            },
        };

        Self::new(
            api_key,
            endpoint,
            config.embeddings_model.clone(),
            config.embedding_dimension,
        )
    }

    fn embeddings_url(&self) -> String {
        match &self.endpoint {
            Endpoint::OpenAiStyle { base_url } => format!("{base_url}/embeddings"),
            Endpoint::Azure {
                endpoint,
                deployment,
                api_version,
            } => format!(
                "{}/openai/deployments/{}/embeddings?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ),
        }
    }

    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match &self.endpoint {
            Endpoint::OpenAiStyle { .. } => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                        .map_err(|err| Error::Internal(err.to_string()))?,
                );
            }
            Endpoint::Azure { .. } => {
                headers.insert(
                    "api-key",
                    HeaderValue::from_str(&self.api_key)
                        .map_err(|err| Error::Internal(err.to_string()))?,
                );
            }
        }
        Ok(headers)
    }

    async fn request(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            input,
            model: &self.model,
        };

        let response = self
            .client
            .post(self.embeddings_url())
            .headers(self.build_headers()?)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!(
                "embeddings endpoint returned {status}: {text}"
            )));
        }

        let mut body: EmbeddingResponse = response.json().await?;
        body.data.sort_by_key(|d| d.index);
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let input = [text.to_string()];
        self.request(&input)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("embeddings endpoint returned no vectors".to_string()))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn azure_embeddings_url_includes_deployment() {
        let embedder = OpenAiEmbedder::new(
            "key",
            Endpoint::Azure {
                endpoint: "https://example.openai.azure.com".to_string(),
                deployment: "text-embedding-3-small".to_string(),
                api_version: "2024-08-01-preview".to_string(),
            },
            "text-embedding-3-small",
            1536,
        )
        .unwrap();
        assert_eq!(
            embedder.embeddings_url(),
            "https://example.openai.azure.com/openai/deployments/text-embedding-3-small/embeddings?api-version=2024-08-01-preview"
        );
    }

    #[test]
    fn dimension_is_reported_from_config() {
        let embedder = OpenAiEmbedder::new(
            "key",
            Endpoint::OpenAiStyle {
                base_url: "https://api.openai.com/v1".to_string(),
            },
            "text-embedding-3-small",
            384,
        )
        .unwrap();
        assert_eq!(embedder.dimension(), 384);
    }
}
