use std::{
    env, fs,
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};

use crate::{errors::Error, Result};

/// How updates reach the pipeline. Fixed for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    /// Long-polling, one loop per identity.
    Polling,
    /// Telegram pushes updates to our HTTP listener.
    Webhook,
}

/// Typed configuration, loaded from the environment (and `.env` if present).
#[derive(Clone, Debug)]
pub struct Config {
    // Identities
    pub telegram_bot_token: String,
    pub minion_tokens: Vec<String>,
    pub admin_users: Vec<i64>,

    // Transport
    pub transport: TransportMode,
    pub webhook_base_url: Option<String>,
    pub webhook_listen: SocketAddr,

    // Polling
    pub poll_timeout: Duration,
    pub poll_retry_interval: Duration,
}

/// Settings consumed by each polling loop.
#[derive(Clone, Copy, Debug)]
pub struct PollingSettings {
    /// Long-wait passed to the fetch call.
    pub timeout: Duration,
    /// Fixed backoff after a failed cycle.
    pub retry_interval: Duration,
}

/// Settings for the push-mode listener.
#[derive(Clone, Debug)]
pub struct WebhookSettings {
    /// Externally reachable base URL, without a trailing slash.
    pub base_url: String,
    pub listen: SocketAddr,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let minion_tokens = parse_csv(env_str("XBOT_MINION_TOKENS"));
        let admin_users = parse_csv_i64(env_str("TELEGRAM_ALLOWED_USERS"));

        let transport = if env_bool("XBOT_USE_WEBHOOK").unwrap_or(false) {
            TransportMode::Webhook
        } else {
            TransportMode::Polling
        };

        let webhook_base_url = env_str("XBOT_WEBHOOK_BASE_URL")
            .and_then(non_empty)
            .map(|u| normalize_base_url(&u));
        if transport == TransportMode::Webhook && webhook_base_url.is_none() {
            return Err(Error::Config(
                "XBOT_WEBHOOK_BASE_URL is required when XBOT_USE_WEBHOOK is set".to_string(),
            ));
        }

        let host = env_str("XBOT_WEBHOOK_HOST").unwrap_or("0.0.0.0".to_string());
        let host: IpAddr = host
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("XBOT_WEBHOOK_HOST is not an ip address: {host}")))?;
        let port = env_u64("XBOT_WEBHOOK_PORT").unwrap_or(8080);
        let port = u16::try_from(port)
            .map_err(|_| Error::Config(format!("XBOT_WEBHOOK_PORT out of range: {port}")))?;
        let webhook_listen = SocketAddr::new(host, port);

        let poll_timeout = Duration::from_secs(env_u64("XBOT_POLL_TIMEOUT_SECS").unwrap_or(30));
        let poll_retry_interval =
            Duration::from_millis(env_u64("XBOT_POLL_RETRY_MS").unwrap_or(1000));

        Ok(Self {
            telegram_bot_token,
            minion_tokens,
            admin_users,
            transport,
            webhook_base_url,
            webhook_listen,
            poll_timeout,
            poll_retry_interval,
        })
    }

    pub fn polling(&self) -> PollingSettings {
        PollingSettings {
            timeout: self.poll_timeout,
            retry_interval: self.poll_retry_interval,
        }
    }

    pub fn webhook(&self) -> Result<WebhookSettings> {
        let base_url = self.webhook_base_url.clone().ok_or_else(|| {
            Error::Config("webhook mode requires a base url".to_string())
        })?;
        Ok(WebhookSettings {
            base_url: normalize_base_url(&base_url),
            listen: self.webhook_listen,
        })
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    parse_csv(v)
        .into_iter()
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
