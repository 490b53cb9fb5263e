use thiserror::Error;

pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const BASE_URL_VARS: &[&str] = &["BASE_URL", "OPENAI_BASE_URL"];
pub const MODEL_VAR: &str = "MODEL";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_MCP_CONFIG: &str = "mcp_config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API key not found. Set the {0} environment variable or pass --api-key.")]
    MissingApiKey(&'static str),
}

/// Values given on the command line; any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmOverrides {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

impl LlmSettings {
    /// Flags first, then the process environment, then defaults.
    pub fn from_env(overrides: LlmOverrides) -> Result<Self, ConfigError> {
        Self::resolve(overrides, |name| std::env::var(name).ok())
    }

    pub fn resolve(
        overrides: LlmOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let lookup = |name: &str| env(name).filter(|value| !value.trim().is_empty());

        let api_key = overrides
            .api_key
            .or_else(|| lookup(API_KEY_VAR))
            .ok_or(ConfigError::MissingApiKey(API_KEY_VAR))?;
        let model = overrides
            .model
            .or_else(|| lookup(MODEL_VAR))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = overrides
            .base_url
            .or_else(|| BASE_URL_VARS.iter().find_map(|&name| lookup(name)));

        let settings = Self {
            provider: overrides
                .provider
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            api_key,
            model,
            base_url,
        };
        tracing::debug!(
            provider = %settings.provider,
            model = %settings.model,
            base_url = ?settings.base_url,
            "resolved LLM settings"
        );
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_flags_win_over_env() {
        let overrides = LlmOverrides {
            api_key: Some("flag-key".to_string()),
            model: Some("flag-model".to_string()),
            ..Default::default()
        };
        let settings = LlmSettings::resolve(
            overrides,
            env(&[("OPENAI_API_KEY", "env-key"), ("MODEL", "env-model")]),
        )
        .unwrap();

        assert_eq!(settings.api_key, "flag-key");
        assert_eq!(settings.model, "flag-model");
        assert_eq!(settings.provider, "openai");
        assert_eq!(settings.base_url, None);
    }

    #[test]
    fn test_env_and_defaults() {
        let settings = LlmSettings::resolve(
            LlmOverrides::default(),
            env(&[
                ("OPENAI_API_KEY", "env-key"),
                ("OPENAI_BASE_URL", "http://localhost:11434/v1"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.api_key, "env-key");
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.base_url.as_deref(), Some("http://localhost:11434/v1"));
    }

    #[test]
    fn test_base_url_takes_precedence_over_openai_base_url() {
        let settings = LlmSettings::resolve(
            LlmOverrides::default(),
            env(&[
                ("OPENAI_API_KEY", "k"),
                ("BASE_URL", "http://a/v1"),
                ("OPENAI_BASE_URL", "http://b/v1"),
            ]),
        )
        .unwrap();
        assert_eq!(settings.base_url.as_deref(), Some("http://a/v1"));
    }

    #[test]
    fn test_missing_key_names_the_variable() {
        let err = LlmSettings::resolve(LlmOverrides::default(), env(&[("OPENAI_API_KEY", "  ")]))
            .unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}
