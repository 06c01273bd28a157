// Adapter selection for a (provider, model) pair.
// Fixed providers resolve to their concrete adapters; unknown provider ids
// can be served by registered custom OpenAI-compatible endpoints. For
// "openai", GPT-5 and o-series models route to the Responses adapter.

use std::collections::HashMap;

use super::anthropic::AnthropicAdapter;
use super::cerebras::CerebrasAdapter;
use super::error::ProviderError;
use super::gemini::GeminiAdapter;
use super::openai::OpenAiAdapter;
use super::provider::DynAdapter;
use super::responses::ResponsesAdapter;

/// API keys for the fixed provider set
#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub gemini: Option<String>,
    pub cerebras: Option<String>,
}

/// A user-registered OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct CustomEndpoint {
    pub base_url: String,
    pub api_key: String,
}

pub struct AdapterFactory {
    keys: ProviderKeys,
    custom: HashMap<String, CustomEndpoint>,
}

impl AdapterFactory {
    pub fn new(keys: ProviderKeys) -> Self {
        Self {
            keys,
            custom: HashMap::new(),
        }
    }

    /// Register a custom OpenAI-compatible endpoint under a provider id
    pub fn register_custom(&mut self, provider_id: impl Into<String>, endpoint: CustomEndpoint) {
        self.custom.insert(provider_id.into(), endpoint);
    }

    pub fn adapter_for(&self, provider: &str, model: &str) -> Result<DynAdapter, ProviderError> {
        match provider {
            "openai" => {
                let key = self.key("openai", &self.keys.openai)?;
                if ResponsesAdapter::handles_model(model) {
                    Ok(std::sync::Arc::new(ResponsesAdapter::new(
                        model.to_string(),
                        key,
                    )?))
                } else {
                    Ok(std::sync::Arc::new(OpenAiAdapter::new(
                        model.to_string(),
                        key,
                    )?))
                }
            }
            "anthropic" => {
                let key = self.key("anthropic", &self.keys.anthropic)?;
                Ok(std::sync::Arc::new(AnthropicAdapter::new(
                    model.to_string(),
                    key,
                )?))
            }
            "gemini" => {
                let key = self.key("gemini", &self.keys.gemini)?;
                Ok(std::sync::Arc::new(GeminiAdapter::new(
                    model.to_string(),
                    key,
                )?))
            }
            "cerebras" => {
                let key = self.key("cerebras", &self.keys.cerebras)?;
                Ok(std::sync::Arc::new(CerebrasAdapter::new(
                    model.to_string(),
                    key,
                )?))
            }
            other => {
                let endpoint = self.custom.get(other).ok_or_else(|| {
                    ProviderError::Config(format!("unknown provider '{}'", other))
                })?;
                Ok(std::sync::Arc::new(OpenAiAdapter::with_endpoint(
                    other,
                    endpoint.base_url.clone(),
                    model.to_string(),
                    endpoint.api_key.clone(),
                )?))
            }
        }
    }

    fn key(&self, provider: &str, slot: &Option<String>) -> Result<String, ProviderError> {
        slot.clone().ok_or_else(|| {
            ProviderError::Config(format!("no API key configured for provider '{}'", provider))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> AdapterFactory {
        AdapterFactory::new(ProviderKeys {
            openai: Some("sk-openai".to_string()),
            anthropic: Some("sk-ant".to_string()),
            gemini: Some("sk-gem".to_string()),
            cerebras: Some("sk-cer".to_string()),
        })
    }

    #[test]
    fn fixed_providers_resolve() {
        let f = factory();
        assert_eq!(f.adapter_for("openai", "gpt-4o").unwrap().provider_id(), "openai");
        assert_eq!(
            f.adapter_for("anthropic", "claude-3-5-haiku-20241022")
                .unwrap()
                .provider_id(),
            "anthropic"
        );
        assert_eq!(f.adapter_for("gemini", "gemini-2.0-flash").unwrap().provider_id(), "gemini");
        assert_eq!(
            f.adapter_for("cerebras", "llama-3.3-70b").unwrap().provider_id(),
            "cerebras"
        );
    }

    #[test]
    fn gpt5_and_o_series_route_to_responses() {
        let f = factory();
        // Responses adapter reports a larger output ceiling; use that as a
        // cheap fingerprint since the trait object hides the concrete type
        let responses = f.adapter_for("openai", "gpt-5-nano").unwrap();
        let chat = f.adapter_for("openai", "gpt-4o").unwrap();
        assert_eq!(responses.max_output_tokens(), 32_768);
        assert_eq!(chat.max_output_tokens(), 16_384);

        let o_series = f.adapter_for("openai", "o3-mini").unwrap();
        assert_eq!(o_series.max_output_tokens(), 32_768);
    }

    #[test]
    fn custom_endpoint_resolves_to_openai_adapter() {
        let mut f = factory();
        f.register_custom(
            "local-vllm",
            CustomEndpoint {
                base_url: "http://localhost:8000/v1".to_string(),
                api_key: "token".to_string(),
            },
        );

        let adapter = f.adapter_for("local-vllm", "mistral-7b").unwrap();
        assert_eq!(adapter.provider_id(), "local-vllm");
        assert_eq!(adapter.model(), "mistral-7b");
    }

    #[test]
    fn unknown_provider_is_config_error() {
        let f = factory();
        let err = f.adapter_for("nope", "model").err().expect("expected an error");
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[test]
    fn missing_key_is_config_error() {
        let f = AdapterFactory::new(ProviderKeys::default());
        let err = f.adapter_for("openai", "gpt-4o").err().expect("expected an error");
        assert!(matches!(err, ProviderError::Config(_)));
    }
}
