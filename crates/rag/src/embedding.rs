use anyhow::{anyhow, bail, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::env;

use labnav_core::{Embedding, HashEmbedder, HashEmbedderConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hash` (local, deterministic) or `openai`.
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub seed: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 64,
            seed: 1337,
        }
    }
}

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    OpenAi(OpenAiEmbeddingClient),
}

#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        match config.provider.as_str() {
            "openai" => Ok(Self {
                backend: EmbeddingBackend::OpenAi(OpenAiEmbeddingClient::new(&config.model)?),
            }),
            "hash" => Ok(Self::hash(config.dimensions, config.seed)),
            other => bail!("unknown embedding provider {other}"),
        }
    }

    pub fn hash(dimensions: usize, seed: u64) -> Self {
        Self {
            backend: EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig {
                dimensions,
                seed,
            })),
        }
    }

    pub fn provider(&self) -> &'static str {
        match &self.backend {
            EmbeddingBackend::Hash(_) => "hash",
            EmbeddingBackend::OpenAi(_) => "openai",
        }
    }

    /// Output length when it is known without calling the backend.
    pub fn dimensions(&self) -> Option<usize> {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => Some(embedder.dimensions()),
            EmbeddingBackend::OpenAi(_) => None,
        }
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Embedding>> {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => Ok(inputs
                .iter()
                .map(|text| embedder.embed_text(text))
                .collect()),
            EmbeddingBackend::OpenAi(client) => client.embed_batch(inputs),
        }
    }

    pub fn embed(&self, text: &str) -> Result<Embedding> {
        let inputs = vec![text.to_string()];
        self.embed_batch(&inputs)?
            .pop()
            .ok_or_else(|| anyhow!("embedding backend returned no vector"))
    }
}

#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    http: Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(model: &str) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY is required for openai embeddings"))?;
        let base_url =
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Ok(Self {
            http: Client::new(),
            model: model.to_string(),
            api_key,
            base_url,
        })
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Embedding>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let payload = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "openai embeddings request failed: {}",
                response.status()
            ));
        }
        let mut parsed: OpenAiEmbeddingResponse = response.json()?;
        if parsed.data.len() != inputs.len() {
            bail!(
                "openai returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            );
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_backend_embeds_batches_in_order() {
        let client = EmbeddingClient::from_config(&EmbeddingConfig::default()).unwrap();
        assert_eq!(client.provider(), "hash");
        let batch = client
            .embed_batch(&[
                "rna extraction trizol".to_string(),
                "pcr primer design".to_string(),
            ])
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], client.embed("RNA Extraction  TRIzol").unwrap());
        assert_ne!(batch[0], batch[1]);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(EmbeddingClient::from_config(&config).is_err());
    }
}
