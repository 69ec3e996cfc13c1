use std::collections::BTreeMap;
use std::time::Duration;

/// Prefix of the environment variables the host reads its settings from.
pub const ENVIRONMENT_PREFIX: &str = "ASPNETCORE_";

/// Setting keys understood by the web host.
pub struct WebHostDefaults;

impl WebHostDefaults {
    pub const APPLICATION_KEY: &'static str = "applicationName";
    pub const ENVIRONMENT_KEY: &'static str = "environment";
    pub const DETAILED_ERRORS_KEY: &'static str = "detailedErrors";
    pub const CAPTURE_STARTUP_ERRORS_KEY: &'static str = "captureStartupErrors";
    pub const WEB_ROOT_KEY: &'static str = "webroot";
    pub const CONTENT_ROOT_KEY: &'static str = "contentRoot";
    pub const PREVENT_HOSTING_STARTUP_KEY: &'static str = "preventHostingStartup";
    pub const SUPPRESS_STATUS_MESSAGES_KEY: &'static str = "suppressStatusMessages";
    pub const PREFER_HOSTING_URLS_KEY: &'static str = "preferHostingUrls";
    pub const SHUTDOWN_TIMEOUT_KEY: &'static str = "shutdownTimeoutSeconds";
    pub const SERVER_URLS_KEY: &'static str = "urls";
    /// Older spelling of [`SERVER_URLS_KEY`](Self::SERVER_URLS_KEY), read
    /// only when the new key is absent.
    pub const LEGACY_SERVER_URLS_KEY: &'static str = "server.urls";
}

/// Case-insensitive string settings.
///
/// Keys are compared ignoring ASCII case, so `URLS`, `urls` and `Urls` are
/// the same setting. Later writes replace earlier ones.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    values: BTreeMap<String, (String, String)>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings from in-memory pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut config = Configuration::new();
        for (key, value) in pairs {
            config.set(key, value);
        }
        config
    }

    /// Settings from the process environment (with `.env` support).
    ///
    /// Only `ASPNETCORE_`-prefixed variables are kept, with the prefix
    /// stripped and `__` turned into `:`.
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_env_vars(std::env::vars(), ENVIRONMENT_PREFIX)
    }

    /// Same as [`from_env`](Self::from_env) over an explicit variable list.
    pub fn from_env_vars<I>(vars: I, prefix: &str) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Configuration::new();
        for (name, value) in vars {
            let Some(stripped) = strip_prefix_ignore_case(&name, prefix) else {
                continue;
            };
            if stripped.is_empty() {
                continue;
            }
            config.set(stripped.replace("__", ":"), value);
        }
        config
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.values
            .insert(key.to_ascii_lowercase(), (key, value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values
            .remove(&key.to_ascii_lowercase())
            .map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(&key.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy every setting of `other` over this one.
    pub fn merge(&mut self, other: &Configuration) {
        for (lower, entry) in &other.values {
            self.values.insert(lower.clone(), entry.clone());
        }
    }

    /// Pairs with the key spelled as it was first written.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .values()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Boolean setting: `true` (any case) or `1`.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).is_some_and(parse_bool)
    }
}

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let head = name.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &name[prefix.len()..])
}

pub(crate) fn parse_bool(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case("true") || value == "1"
}

/// `;`-separated url list, trimmed, empty entries dropped.
pub(crate) fn split_urls(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Default grace period for [`WebHost::stop`](crate::WebHost::stop).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default environment name.
pub const DEFAULT_ENVIRONMENT: &str = "Production";

/// Host options resolved from settings.
#[derive(Debug, Clone)]
pub struct WebHostOptions {
    pub application_name: Option<String>,
    pub environment: String,
    pub detailed_errors: bool,
    pub capture_startup_errors: bool,
    pub web_root: Option<String>,
    pub content_root: Option<String>,
    pub prevent_hosting_startup: bool,
    pub suppress_status_messages: bool,
    pub prefer_hosting_urls: bool,
    pub shutdown_timeout: Duration,
    /// Hosting urls, already split.
    pub urls: Vec<String>,
}

impl Default for WebHostOptions {
    fn default() -> Self {
        WebHostOptions::new(&Configuration::new(), None)
    }
}

impl WebHostOptions {
    /// Resolve every key from `primary`, then `fallback`.
    pub fn new(primary: &Configuration, fallback: Option<&Configuration>) -> Self {
        let lookup = |key: &str| -> Option<String> {
            primary
                .get(key)
                .or_else(|| fallback.and_then(|config| config.get(key)))
                .map(str::to_owned)
        };
        let flag = |key: &str| lookup(key).as_deref().is_some_and(parse_bool);

        let urls = lookup(WebHostDefaults::SERVER_URLS_KEY)
            .or_else(|| lookup(WebHostDefaults::LEGACY_SERVER_URLS_KEY))
            .map(|value| split_urls(&value))
            .unwrap_or_default();

        let shutdown_timeout = lookup(WebHostDefaults::SHUTDOWN_TIMEOUT_KEY)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        WebHostOptions {
            application_name: lookup(WebHostDefaults::APPLICATION_KEY)
                .filter(|name| !name.is_empty()),
            environment: lookup(WebHostDefaults::ENVIRONMENT_KEY)
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_owned()),
            detailed_errors: flag(WebHostDefaults::DETAILED_ERRORS_KEY),
            capture_startup_errors: flag(WebHostDefaults::CAPTURE_STARTUP_ERRORS_KEY),
            web_root: lookup(WebHostDefaults::WEB_ROOT_KEY).filter(|root| !root.is_empty()),
            content_root: lookup(WebHostDefaults::CONTENT_ROOT_KEY)
                .filter(|root| !root.is_empty()),
            prevent_hosting_startup: flag(WebHostDefaults::PREVENT_HOSTING_STARTUP_KEY),
            suppress_status_messages: flag(WebHostDefaults::SUPPRESS_STATUS_MESSAGES_KEY),
            prefer_hosting_urls: flag(WebHostDefaults::PREFER_HOSTING_URLS_KEY),
            shutdown_timeout,
            urls,
        }
    }
}
