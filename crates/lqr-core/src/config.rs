use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{
    errors::Error,
    messaging::throttled::ThrottleConfig,
    relay::RelaySettings,
    storage::StoreOptions,
    Result,
};

/// Typed configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub telegram_safe_limit: usize,

    // Relay
    pub responders: Vec<i64>,
    pub question_limit: u32,
    pub strict_reply_matching: bool,
    pub escalation_contact: Option<String>,

    // Storage
    pub database_path: PathBuf,
    pub storage_timeout: Duration,

    // Outbound throttling
    pub outbound_global_interval: Duration,
    pub outbound_per_chat_interval: Duration,
}

impl Config {
    /// Load from the process environment, after applying `.env` if present.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        // Required
        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        let responders = parse_csv_i64(get("RELAY_RESPONDERS"));
        if responders.is_empty() {
            return Err(Error::Config(
                "RELAY_RESPONDERS environment variable is required".to_string(),
            ));
        }

        let question_limit = parse_num::<u32>(get("QUESTION_LIMIT")).unwrap_or(3);
        if question_limit == 0 {
            return Err(Error::Config("QUESTION_LIMIT must be at least 1".to_string()));
        }
        let strict_reply_matching = parse_bool(get("STRICT_REPLY_MATCHING")).unwrap_or(false);
        let escalation_contact = get("ESCALATION_CONTACT");

        let database_path =
            PathBuf::from(get("DATABASE_PATH").unwrap_or_else(|| "lqr.sqlite3".to_string()));
        let storage_timeout =
            Duration::from_millis(parse_num::<u64>(get("STORAGE_TIMEOUT_MS")).unwrap_or(5_000));

        let telegram_safe_limit = parse_num::<usize>(get("TELEGRAM_SAFE_LIMIT")).unwrap_or(4000);

        let throttle = ThrottleConfig::default();
        let outbound_global_interval = parse_num::<u64>(get("OUTBOUND_GLOBAL_INTERVAL_MS"))
            .map(Duration::from_millis)
            .unwrap_or(throttle.global_min_interval);
        let outbound_per_chat_interval = parse_num::<u64>(get("OUTBOUND_PER_CHAT_INTERVAL_MS"))
            .map(Duration::from_millis)
            .unwrap_or(throttle.per_chat_min_interval);

        Ok(Self {
            telegram_bot_token,
            telegram_safe_limit,
            responders,
            question_limit,
            strict_reply_matching,
            escalation_contact,
            database_path,
            storage_timeout,
            outbound_global_interval,
            outbound_per_chat_interval,
        })
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            responders: self.responders.clone(),
            strict_reply_matching: self.strict_reply_matching,
            max_message_len: self.telegram_safe_limit,
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            quota_limit: self.question_limit,
            timeout: self.storage_timeout,
        }
    }

    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            global_min_interval: self.outbound_global_interval,
            per_chat_min_interval: self.outbound_per_chat_interval,
        }
    }
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

fn parse_bool(v: Option<String>) -> Option<bool> {
    v.map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_num<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
    v.and_then(|s| s.trim().parse::<T>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply_when_only_required_vars_set() {
        let cfg = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("RELAY_RESPONDERS", "308383825, 321005569"),
        ]))
        .unwrap();

        assert_eq!(cfg.responders, vec![308383825, 321005569]);
        assert_eq!(cfg.question_limit, 3);
        assert!(!cfg.strict_reply_matching);
        assert_eq!(cfg.escalation_contact, None);
        assert_eq!(cfg.database_path, PathBuf::from("lqr.sqlite3"));
        assert_eq!(cfg.storage_timeout, Duration::from_secs(5));
        assert_eq!(cfg.store_options().quota_limit, 3);
        assert_eq!(cfg.relay_settings().responders.len(), 2);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("RELAY_RESPONDERS", "1"),
            ("QUESTION_LIMIT", "5"),
            ("STRICT_REPLY_MATCHING", "yes"),
            ("ESCALATION_CONTACT", "+7(999)916-04-83"),
            ("DATABASE_PATH", ":memory:"),
            ("STORAGE_TIMEOUT_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(cfg.question_limit, 5);
        assert!(cfg.relay_settings().strict_reply_matching);
        assert_eq!(cfg.escalation_contact.as_deref(), Some("+7(999)916-04-83"));
        assert_eq!(cfg.store_options().timeout, Duration::from_millis(250));
    }

    #[test]
    fn missing_token_or_responders_is_a_config_error() {
        let err = Config::from_lookup(lookup(&[("RELAY_RESPONDERS", "1")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("RELAY_RESPONDERS", " , x"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_limit_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("RELAY_RESPONDERS", "1"),
            ("QUESTION_LIMIT", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn dotenv_lines_strip_quotes_and_comments() {
        let parsed = parse_dotenv("# comment\nA=1\n B = \"two\" \nC='3'\nnoequals\n=x\n");
        assert_eq!(
            parsed,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two".to_string()),
                ("C".to_string(), "3".to_string()),
            ]
        );
    }
}
