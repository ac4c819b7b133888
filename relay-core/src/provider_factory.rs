use std::sync::Arc;

use secrecy::SecretString;

use crate::config::Config;
use crate::error::{CoreResult, RelayError};
use crate::http_client::HttpClient;
use crate::provider::{ChatProvider, NullProvider};
use crate::providers::openai::OpenAI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Null,
}

impl ProviderKind {
    pub fn parse(name: &str) -> CoreResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "null" => Ok(Self::Null),
            other => Err(RelayError::Validation(format!(
                "unknown upstream provider '{other}' (expected \"openai\" or \"null\")"
            ))),
        }
    }
}

/// Build the upstream provider named by `cfg.upstream.provider`, reading the
/// API key from the process environment.
pub fn build_chat_provider(cfg: &Config) -> CoreResult<Arc<dyn ChatProvider>> {
    build_chat_provider_with(cfg, |k| std::env::var(k).ok())
}

/// Same as [`build_chat_provider`] with an explicit environment lookup.
pub fn build_chat_provider_with<F>(cfg: &Config, lookup: F) -> CoreResult<Arc<dyn ChatProvider>>
where
    F: Fn(&str) -> Option<String>,
{
    let up = &cfg.upstream;
    match ProviderKind::parse(&up.provider)? {
        ProviderKind::Null => {
            tracing::warn!("using null provider; responses are canned");
            Ok(Arc::new(NullProvider))
        }
        ProviderKind::OpenAI => {
            let key = lookup(&up.api_key_env)
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .ok_or_else(|| {
                    RelayError::Validation(format!(
                        "missing API key: set {} for the openai provider",
                        up.api_key_env
                    ))
                })?;
            let http = HttpClient::from_cfg(&cfg.http)?;
            tracing::info!(base = %up.base, model = %up.model, "openai provider ready");
            Ok(Arc::new(OpenAI::new(
                http,
                SecretString::new(key.into()),
                up.base.clone(),
                up.org.clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_for(provider: &str) -> Config {
        let mut cfg = Config::default();
        cfg.upstream.provider = provider.to_string();
        cfg
    }

    #[test]
    fn null_provider_needs_no_key() {
        let p = build_chat_provider_with(&cfg_for("null"), |_| None).unwrap();
        assert_eq!(p.name(), "null");
    }

    #[test]
    fn openai_requires_key() {
        let err = build_chat_provider_with(&cfg_for("openai"), |_| None)
            .err()
            .unwrap();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("OPENAI_API_KEY"));

        let err = build_chat_provider_with(&cfg_for("openai"), |_| Some("  ".into()))
            .err()
            .unwrap();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn openai_reads_configured_env_var() {
        let mut cfg = cfg_for("OpenAI");
        cfg.upstream.api_key_env = "RELAY_KEY".into();
        let p = build_chat_provider_with(&cfg, |k| (k == "RELAY_KEY").then(|| "sk-test".into()))
            .unwrap();
        assert_eq!(p.name(), "openai");
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = build_chat_provider_with(&cfg_for("anthropic"), |_| Some("k".into()))
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Validation(_)));
    }
}
