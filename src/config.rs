//! Configuração do cliente carregada a partir de `cpr.toml`.
//!
//! A struct [`CprConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `CPR_API_URL` e `CPR_TOKEN_PATH` têm precedência
//! sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::api::ClientConfig;
use crate::workflow::PollerConfig;

/// Configuração de nível superior carregada de `cpr.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct CprConfig {
    /// URL base do backend (sem barra final).
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Arquivo onde o par de tokens sobrevive entre execuções.
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,

    /// Timeout total de cada requisição, em segundos.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout de conexão, em segundos.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Intervalo base entre consultas de status, em milissegundos.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Teto do backoff entre consultas com falha, em milissegundos.
    #[serde(default = "default_poll_max_interval_ms")]
    pub poll_max_interval_ms: u64,

    /// Falhas consecutivas toleradas antes de desistir do polling.
    #[serde(default = "default_poll_max_failures")]
    pub poll_max_failures: u32,

    /// Tempo máximo de um polling, em segundos.
    #[serde(default = "default_poll_max_duration_secs")]
    pub poll_max_duration_secs: u64,
}

fn default_api_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_token_path() -> PathBuf {
    PathBuf::from(".cpr/credentials.json")
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_poll_max_interval_ms() -> u64 {
    16_000
}

fn default_poll_max_failures() -> u32 {
    5
}

fn default_poll_max_duration_secs() -> u64 {
    600
}

impl Default for CprConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_path: default_token_path(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_max_interval_ms: default_poll_max_interval_ms(),
            poll_max_failures: default_poll_max_failures(),
            poll_max_duration_secs: default_poll_max_duration_secs(),
        }
    }
}

impl CprConfig {
    /// Carrega a configuração de `cpr.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("cpr.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<CprConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo.
        if let Ok(url) = std::env::var("CPR_API_URL")
            && !url.is_empty()
        {
            config.api_url = url;
        }
        if let Ok(token_path) = std::env::var("CPR_TOKEN_PATH")
            && !token_path.is_empty()
        {
            config.token_path = PathBuf::from(token_path);
        }

        Ok(config)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.api_url.trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..ClientConfig::default()
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_interval: Duration::from_millis(self.poll_max_interval_ms.max(self.poll_interval_ms)),
            max_consecutive_failures: self.poll_max_failures.max(1),
            max_duration: Duration::from_secs(self.poll_max_duration_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = CprConfig::default();
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.token_path, PathBuf::from(".cpr/credentials.json"));
        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.poll_max_failures, 5);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            api_url = "https://api.example.com/"
            poll_interval_ms = 500
        "#;
        let config: CprConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.client_config().base_url, "https://api.example.com");
    }

    #[test]
    fn poller_config_is_sane() {
        let config = CprConfig {
            poll_interval_ms: 3000,
            poll_max_interval_ms: 1000,
            poll_max_failures: 0,
            ..CprConfig::default()
        };
        let poller = config.poller_config();
        assert_eq!(poller.interval, Duration::from_millis(3000));
        // The cap never sits below the base interval.
        assert_eq!(poller.max_interval, Duration::from_millis(3000));
        assert_eq!(poller.max_consecutive_failures, 1);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpr.toml");
        std::fs::write(&path, "poll_max_failures = 9\n").unwrap();
        let config = CprConfig::load_from(&path).unwrap();
        assert_eq!(config.poll_max_failures, 9);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpr.toml");
        std::fs::write(&path, "poll_max_failures = \"many\"\n").unwrap();
        assert!(CprConfig::load_from(&path).is_err());
    }
}
