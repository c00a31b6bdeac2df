//! Runtime configuration.
//!
//! Values come from the process environment (after `.env` has been loaded by
//! the binary). Everything is read through a lookup function so callers can
//! build a config from any key/value source.

use crate::error::{ChatError, ChatResult};
use crate::sse::FramingMode;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://hub.wyniai.com";
pub const DEFAULT_QUERY_PATH: &str = "/api/v1/developer/agent/query/stream";
pub const DEFAULT_LOGIN_PATH: &str = "/api/v1/auth/login";
pub const DEFAULT_RELAY_TENANT: &str = "homeaffairshk";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the Hong Kong Home Affairs AI Assistant. Your knowledge is strictly limited to the official websites of the Home Affairs Department (had.gov.hk) and the Home and Youth Affairs Bureau (hyab.gov.hk). When answering, search only these domains using the context of 'home affair Hong Kong'. Provide concise answers and always include the direct links to the relevant pages as citations.";

pub const DEFAULT_ALLOWED_DOMAINS: [&str; 2] = ["https://www.had.gov.hk/", "https://www.hyab.gov.hk/"];

const DEFAULT_TOP_K: u32 = 5;
const DEFAULT_HISTORY_WINDOW: usize = 10;
const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TOKEN_EXPIRY_DAYS: i64 = 30;
const DEFAULT_MAX_MESSAGE_LENGTH: usize = 20_000;

/// How the session authenticates against the hub.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Developer API key, sent as the bearer token directly.
    ApiKey(String),
    /// Email/password exchanged for a bearer token.
    Login { email: String, password: String },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::ApiKey(_) => f.write_str("ApiKey(***)"),
            Credential::Login { email, .. } => f
                .debug_struct("Login")
                .field("email", email)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_base_url: String,
    pub credential: Credential,
    pub tenant_subdomain: Option<String>,
    pub query_path: String,
    pub login_path: String,
    /// Optional endpoint that hands out a conversation id before the first turn.
    pub session_path: Option<String>,
    pub mode: Option<String>,
    pub tool_groups: Vec<String>,
    pub tool_names: Vec<String>,
    pub enabled_tools: Vec<String>,
    pub top_k: u32,
    pub system_prompt: String,
    pub allowed_domains: Vec<String>,
    pub history_window: usize,
    pub framing: FramingMode,
    pub stream_timeout: Duration,
    pub token_expiry_days: i64,
    pub max_message_length: usize,
}

impl AppConfig {
    pub fn from_env() -> ChatResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> ChatResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let credential = match (get("HA_API_KEY"), get("HA_API_EMAIL"), get("HA_API_PASSWORD")) {
            (Some(key), _, _) => {
                ensure_not_placeholder("HA_API_KEY", &key)?;
                Credential::ApiKey(key)
            }
            (None, Some(email), Some(password)) => {
                ensure_not_placeholder("HA_API_EMAIL", &email)?;
                ensure_not_placeholder("HA_API_PASSWORD", &password)?;
                Credential::Login { email, password }
            }
            _ => {
                return Err(ChatError::Config(
                    "No credentials configured. Set HA_API_KEY, or HA_API_EMAIL and HA_API_PASSWORD."
                        .to_string(),
                ));
            }
        };

        let api_base_url = get("HA_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        ensure_not_placeholder("HA_API_BASE_URL", &api_base_url)?;

        let framing = match get("HA_FRAMING") {
            Some(value) => value.parse::<FramingMode>()?,
            None => FramingMode::default(),
        };

        let allowed_domains = get("HA_ALLOWED_DOMAINS")
            .map(|value| split_list(&value))
            .unwrap_or_else(|| DEFAULT_ALLOWED_DOMAINS.iter().map(|d| d.to_string()).collect());

        Ok(Self {
            api_base_url,
            credential,
            tenant_subdomain: get("HA_TENANT_SUBDOMAIN"),
            query_path: get("HA_QUERY_PATH").unwrap_or_else(|| DEFAULT_QUERY_PATH.to_string()),
            login_path: get("HA_LOGIN_PATH").unwrap_or_else(|| DEFAULT_LOGIN_PATH.to_string()),
            session_path: get("HA_SESSION_PATH"),
            mode: get("HA_MODE"),
            tool_groups: get("HA_TOOL_GROUPS")
                .map(|value| split_list(&value))
                .unwrap_or_else(|| vec!["web".to_string()]),
            tool_names: get("HA_TOOL_NAMES")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
            enabled_tools: get("HA_ENABLED_TOOLS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
            top_k: parse_number("HA_TOP_K", get("HA_TOP_K"), DEFAULT_TOP_K)?,
            system_prompt: get("HA_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            allowed_domains,
            history_window: parse_number(
                "HA_HISTORY_WINDOW",
                get("HA_HISTORY_WINDOW"),
                DEFAULT_HISTORY_WINDOW,
            )?,
            framing,
            stream_timeout: Duration::from_secs(parse_number(
                "HA_STREAM_TIMEOUT_SECS",
                get("HA_STREAM_TIMEOUT_SECS"),
                DEFAULT_STREAM_TIMEOUT_SECS,
            )?),
            token_expiry_days: parse_number(
                "HA_TOKEN_EXPIRY_DAYS",
                get("HA_TOKEN_EXPIRY_DAYS"),
                DEFAULT_TOKEN_EXPIRY_DAYS,
            )?,
            max_message_length: parse_number(
                "HA_MAX_MESSAGE_LENGTH",
                get("HA_MAX_MESSAGE_LENGTH"),
                DEFAULT_MAX_MESSAGE_LENGTH,
            )?,
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}{}", self.api_base_url, path)
    }
}

/// Settings for the relay binary.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub upstream_url: String,
    pub tenant_subdomain: String,
}

impl RelayConfig {
    pub fn from_env() -> ChatResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> ChatResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = lookup("HA_RELAY_ADDR")
            .unwrap_or_else(|| "127.0.0.1:3001".to_string())
            .parse::<SocketAddr>()
            .map_err(|err| ChatError::Config(format!("HA_RELAY_ADDR: {err}")))?;

        let upstream_url = match lookup("HA_RELAY_UPSTREAM") {
            Some(url) => url,
            None => {
                let base = lookup("HA_API_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
                format!("{}{}", base.trim_end_matches('/'), DEFAULT_QUERY_PATH)
            }
        };

        Ok(Self {
            bind_addr,
            upstream_url,
            tenant_subdomain: lookup("HA_RELAY_TENANT")
                .unwrap_or_else(|| DEFAULT_RELAY_TENANT.to_string()),
        })
    }
}

fn ensure_not_placeholder(key: &str, value: &str) -> ChatResult<()> {
    let lowered = value.to_ascii_lowercase();
    if lowered.contains("your-") || lowered.contains("your_") || lowered.contains("-here") {
        return Err(ChatError::Config(format!(
            "{key} still holds the template placeholder '{value}'"
        )));
    }
    Ok(())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T>(key: &str, value: Option<String>, default: T) -> ChatResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|err| ChatError::Config(format!("{key}: {err}"))),
        None => Ok(default),
    }
}
