use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{
    header::{AUTHORIZATION, COOKIE},
    HeaderMap, HeaderName, HeaderValue,
};
use base64::{engine::general_purpose, Engine as _};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::proxy::engine::DEFAULT_MAX_BODY_BYTES;
use crate::proxy::rewrite::DEFAULT_KIBANA_URL;
use crate::search::pagination::DEFAULT_KEEP_ALIVE;

pub const DEFAULT_LISTEN: &str = "localhost:9222";

/// Main configuration structure. Every field has a default so a partial
/// YAML file, or none at all, is valid.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub kibana_url: String,
    pub cookie: Option<String>,
    pub headers: BTreeMap<String, Vec<String>>,
    pub debug: bool,
    pub listen: String,
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub pit_keep_alive: Duration,
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kibana_url: DEFAULT_KIBANA_URL.to_string(),
            cookie: None,
            headers: BTreeMap::new(),
            debug: false,
            listen: DEFAULT_LISTEN.to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pit_keep_alive: DEFAULT_KEEP_ALIVE,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.base_url()?;
        self.extra_headers()?;

        if self.pit_keep_alive < Duration::from_secs(1) {
            anyhow::bail!(
                "PIT keep-alive must be at least 1s, got {}",
                format_duration(&self.pit_keep_alive)
            );
        }
        if self.request_timeout.is_zero() {
            anyhow::bail!("Request timeout cannot be zero");
        }
        if self.max_body_bytes == 0 {
            anyhow::bail!("Max body size cannot be zero");
        }

        Ok(())
    }

    /// Parsed Kibana base URL.
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.kibana_url)
            .with_context(|| format!("failed to parse kibana URL {:?}", self.kibana_url))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!("Kibana URL must be http or https, got {}", url.scheme());
        }
        if url.host_str().is_none() {
            anyhow::bail!("Kibana URL has no host: {}", self.kibana_url);
        }

        Ok(url)
    }

    /// Headers added to every tunneled request: configured headers, the
    /// session cookie, and basic auth taken from URL credentials.
    pub fn extra_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        for (name, values) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name: {}", name))?;
            for value in values {
                let value = HeaderValue::from_str(value)
                    .with_context(|| format!("Invalid value for header {}", name))?;
                headers.append(name.clone(), value);
            }
        }

        if let Some(cookie) = self.cookie.as_deref().filter(|c| !c.is_empty()) {
            let value = HeaderValue::from_str(cookie).context("Invalid cookie value")?;
            headers.append(COOKIE, value);
        }

        let url = self.base_url()?;
        if !url.username().is_empty() {
            let credentials = format!("{}:{}", url.username(), url.password().unwrap_or_default());
            let encoded = general_purpose::STANDARD.encode(credentials);
            let mut value = HeaderValue::from_str(&format!("Basic {}", encoded))
                .context("Invalid basic auth credentials")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(headers)
    }
}

/// Parse a `Name: value` header flag.
pub fn parse_header_flag(flag: &str) -> Result<(String, String)> {
    let (name, value) = flag
        .split_once(':')
        .with_context(|| format!("header {:?} is not in Name: value form", flag))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("header {:?} has an empty name", flag);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Render a duration in Elasticsearch time units, preferring whole minutes.
pub fn format_duration(duration: &Duration) -> String {
    duration_serde::format(duration)
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn format(duration: &Duration) -> String {
        let secs = duration.as_secs();
        if duration.subsec_millis() != 0 {
            format!("{}ms", duration.as_millis())
        } else if secs >= 3600 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs >= 60 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(
        s: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            let num: u64 = num.parse()?;
            Ok(Duration::from_secs(num.checked_mul(60).ok_or("duration overflow")?))
        } else if let Some(num) = s.strip_suffix('h') {
            let num: u64 = num.parse()?;
            Ok(Duration::from_secs(num.checked_mul(3600).ok_or("duration overflow")?))
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }
}

/// clap value parser for duration flags such as `--timeout 45s`.
pub fn parse_duration_flag(s: &str) -> std::result::Result<Duration, String> {
    duration_serde::parse_duration(s).map_err(|e| format!("invalid duration {:?}: {}", s, e))
}
