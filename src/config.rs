use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

// ── Defaults ─────────────────────────────────────────────────────────────────

const DEFAULT_MODEL_ID: &str = "gemini-2.5-pro";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_TESSERACT_CMD: &str = "tesseract";
const DEFAULT_TESSERACT_LANG: &str = "eng";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

// ── Config ───────────────────────────────────────────────────────────────────

/// Process-wide settings, read once at startup and shared read-only afterwards.
#[derive(Clone)]
pub struct Config {
    pub api_key: String,
    pub model_id: String,
    pub gemini_base_url: Url,
    pub extraction_timeout: Duration,
    pub tesseract_cmd: String,
    pub tesseract_lang: String,
    pub few_shot_path: Option<PathBuf>,
    pub bind_addr: SocketAddr,
    pub max_upload_bytes: usize,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &"<redacted>")
            .field("model_id", &self.model_id)
            .field("gemini_base_url", &self.gemini_base_url.as_str())
            .field("extraction_timeout", &self.extraction_timeout)
            .field("tesseract_cmd", &self.tesseract_cmd)
            .field("tesseract_lang", &self.tesseract_lang)
            .field("few_shot_path", &self.few_shot_path)
            .field("bind_addr", &self.bind_addr)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("GEMINI_API_KEY").ok_or(ConfigError::Missing("GEMINI_API_KEY"))?;

        let gemini_base_url = get("GEMINI_BASE_URL")
            .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string());
        let gemini_base_url = Url::parse(&gemini_base_url).map_err(|e| ConfigError::Invalid {
            name: "GEMINI_BASE_URL",
            reason: e.to_string(),
        })?;

        let timeout_secs = parse_or("EXTRACTION_TIMEOUT_SECS", get("EXTRACTION_TIMEOUT_SECS"), DEFAULT_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "EXTRACTION_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
            name: "BIND_ADDR",
            reason: e.to_string(),
        })?;

        Ok(Self {
            api_key,
            model_id: get("LANGEXTRACT_MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            gemini_base_url,
            extraction_timeout: Duration::from_secs(timeout_secs),
            tesseract_cmd: get("TESSERACT_CMD").unwrap_or_else(|| DEFAULT_TESSERACT_CMD.to_string()),
            tesseract_lang: get("TESSERACT_LANG").unwrap_or_else(|| DEFAULT_TESSERACT_LANG.to_string()),
            few_shot_path: get("FEW_SHOT_EXAMPLES_PATH").map(PathBuf::from),
            bind_addr,
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", get("MAX_UPLOAD_BYTES"), DEFAULT_MAX_UPLOAD_BYTES)?,
        })
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}
