use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::beanstalk::DEFAULT_PORT;
use crate::error::{QueueError, Result};
use crate::job::JobPriority;

/// Environment variable overriding [`ServiceConfig::host`].
pub const ENV_HOST: &str = "TUBEQ_HOST";
/// Environment variable overriding [`ServiceConfig::port`].
pub const ENV_PORT: &str = "TUBEQ_PORT";

/// Longest tube name the broker accepts.
const MAX_TUBE_NAME_LEN: usize = 200;

/// Service configuration, loaded once at process start and shared read-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Tube registrations keyed by tube name (case-insensitive).
    pub tubes: BTreeMap<String, TubeConfig>,
    /// Tubes the dispatcher watches. `None` watches every registered tube.
    pub watch: Option<Vec<String>>,
    /// Retry backoff table in seconds, ascending.
    pub plot: Vec<u32>,
    /// Emit an audit record for every enqueue and dispatch outcome.
    pub debug: bool,
    /// Level at which audit records are emitted.
    pub loglevel: String,
    /// Priority used for enqueues and retry releases.
    pub default_priority: u32,
    /// Time-to-run applied to enqueues that do not set one.
    pub default_ttr_secs: u32,
    /// Broker-side wait for each reservation attempt.
    pub reserve_timeout_secs: u64,
    /// Drop the broker's implicit `default` tube from the watch list.
    pub ignore_default_tube: bool,
    /// Tube receiving copies of unroutable jobs before they are deleted.
    pub poison_tube: Option<String>,
    /// Subscriber settings for the process-wide tracing output.
    pub logging: LoggingConfig,
}

/// One tube registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TubeConfig {
    /// Name under which the handler is registered in the handler catalog.
    pub consumer: String,
    #[serde(default)]
    pub desc: String,
    /// Backoff table overriding the service-wide `plot` for this tube.
    #[serde(default)]
    pub plot: Option<Vec<u32>>,
}

impl TubeConfig {
    pub fn new(consumer: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            desc: desc.into(),
            plot: None,
        }
    }

    pub fn with_plot(mut self, plot: Vec<u32>) -> Self {
        self.plot = Some(plot);
        self
    }
}

/// Tracing subscriber settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `tubeq=debug,warn`.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            tubes: BTreeMap::new(),
            watch: None,
            plot: vec![10, 30, 60, 120],
            debug: true,
            loglevel: "info".to_string(),
            default_priority: JobPriority::DEFAULT.0,
            default_ttr_secs: 60,
            reserve_timeout_secs: 5,
            ignore_default_tube: true,
            poison_tube: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Read, apply environment overrides, and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a file. The format is inferred from the extension: `.toml`,
    /// `.yaml`/`.yml` or `.json`; anything else is tried in each format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| QueueError::Config(format!("{}: {err}", path.display())))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase());
        Self::parse(&raw, ext.as_deref())
    }

    pub fn parse(raw: &str, format: Option<&str>) -> Result<Self> {
        match format {
            Some("toml") => toml::from_str(raw).map_err(|e| QueueError::Config(e.to_string())),
            Some("yaml" | "yml") => {
                serde_yaml::from_str(raw).map_err(|e| QueueError::Config(e.to_string()))
            }
            Some("json") => serde_json::from_str(raw).map_err(|e| QueueError::Config(e.to_string())),
            _ => Self::parse_auto(raw),
        }
    }

    fn parse_auto(raw: &str) -> Result<Self> {
        if let Ok(config) = serde_json::from_str(raw) {
            return Ok(config);
        }
        if let Ok(config) = toml::from_str(raw) {
            return Ok(config);
        }
        serde_yaml::from_str(raw)
            .map_err(|_| QueueError::Config("failed to parse config as any supported format".into()))
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST).filter(|h| !h.trim().is_empty()) {
            self.host = host.trim().to_string();
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| QueueError::Config(format!("{ENV_PORT}: invalid port `{port}`")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(QueueError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(QueueError::Config("port must be non-zero".into()));
        }
        if self.reserve_timeout_secs == 0 {
            return Err(QueueError::Config(
                "reserve_timeout_secs must be at least 1; reserve is a blocking wait".into(),
            ));
        }
        validate_plot("plot", &self.plot)?;

        let mut seen = BTreeSet::new();
        for (name, tube) in &self.tubes {
            validate_tube_name(name)?;
            if !seen.insert(normalize_tube(name)) {
                return Err(QueueError::Config(format!(
                    "tube `{name}` is declared more than once (names are case-insensitive)"
                )));
            }
            if tube.consumer.trim().is_empty() {
                return Err(QueueError::Config(format!("tube `{name}` has no consumer")));
            }
            if let Some(plot) = &tube.plot {
                validate_plot(&format!("tubes.{name}.plot"), plot)?;
            }
        }

        if let Some(watch) = &self.watch {
            for name in watch {
                if !seen.contains(&normalize_tube(name)) {
                    return Err(QueueError::Config(format!(
                        "watched tube `{name}` is not declared under `tubes`"
                    )));
                }
            }
        }

        if let Some(poison) = &self.poison_tube {
            validate_tube_name(poison)?;
            if self.watched_tubes().contains(&normalize_tube(poison)) {
                return Err(QueueError::Config(format!(
                    "poison tube `{poison}` must not be watched"
                )));
            }
        }

        parse_level(&self.loglevel)?;
        Ok(())
    }

    /// Normalized names of the tubes the dispatcher watches.
    pub fn watched_tubes(&self) -> BTreeSet<String> {
        match &self.watch {
            Some(watch) => watch.iter().map(|n| normalize_tube(n)).collect(),
            None => self.tubes.keys().map(|n| normalize_tube(n)).collect(),
        }
    }

    pub fn default_priority(&self) -> JobPriority {
        JobPriority(self.default_priority)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout_secs)
    }

    /// Level for audit records.
    pub fn audit_level(&self) -> tracing::Level {
        parse_level(&self.loglevel).unwrap_or(tracing::Level::INFO)
    }
}

/// Upper-case a tube name for lookup.
pub fn normalize_tube(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

fn validate_plot(field: &str, plot: &[u32]) -> Result<()> {
    if plot.is_empty() {
        return Err(QueueError::Config(format!("{field} must not be empty")));
    }
    if plot.windows(2).any(|w| w[1] < w[0]) {
        return Err(QueueError::Config(format!("{field} must be ascending: {plot:?}")));
    }
    Ok(())
}

fn validate_tube_name(name: &str) -> Result<()> {
    let name = name.trim();
    let valid_char = |c: char| c.is_ascii_alphanumeric() || "-+/;.$_()".contains(c);
    if name.is_empty()
        || name.len() > MAX_TUBE_NAME_LEN
        || name.starts_with('-')
        || !name.chars().all(valid_char)
    {
        return Err(QueueError::Config(format!("invalid tube name `{name}`")));
    }
    Ok(())
}

fn parse_level(raw: &str) -> Result<tracing::Level> {
    raw.parse()
        .map_err(|_| QueueError::Config(format!("loglevel `{raw}` is not a tracing level")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn sample() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.tubes.insert("mail".into(), TubeConfig::new("MailSender", "outbound mail"));
        config.tubes.insert("ORDERS".into(), TubeConfig::new("OrderSync", "order sync"));
        config
    }

    #[test]
    fn defaults_match_service_conventions() {
        let config = ServiceConfig::default();
        assert_eq!(config.port, 11300);
        assert_eq!(config.plot, vec![10, 30, 60, 120]);
        assert!(config.debug);
        assert_eq!(config.default_priority(), JobPriority(1024));
        assert_eq!(config.default_ttr_secs, 60);
    }

    #[test]
    fn parse_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
host = "queue.internal"
plot = [5, 15]
debug = false

[tubes.mail]
consumer = "MailSender"
desc = "outbound mail"
plot = [1, 2, 3]
"#
        )
        .unwrap();

        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.host, "queue.internal");
        assert_eq!(config.port, 11300);
        assert_eq!(config.plot, vec![5, 15]);
        assert!(!config.debug);
        assert_eq!(config.tubes["mail"].plot, Some(vec![1, 2, 3]));
        config.validate().unwrap();
    }

    #[test]
    fn parse_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "host: 10.0.0.2\nport: 11301\ntubes:\n  ORDERS:\n    consumer: OrderSync\n    desc: order sync\nwatch: [orders]\n"
        )
        .unwrap();

        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 11301);
        assert_eq!(config.watched_tubes().into_iter().collect::<Vec<_>>(), vec!["ORDERS"]);
        config.validate().unwrap();
    }

    #[test]
    fn parse_without_extension_tries_each_format() {
        let config = ServiceConfig::parse(r#"{"host": "h", "tubes": {}}"#, None).unwrap();
        assert_eq!(config.host, "h");
        assert!(ServiceConfig::parse("::: nope :::", None).is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [(ENV_HOST, "broker.svc"), (ENV_PORT, "12000")].into();
        let mut config = sample();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.host, "broker.svc");
        assert_eq!(config.port, 12000);

        let bad: HashMap<&str, &str> = [(ENV_PORT, "eleven")].into();
        assert!(config
            .apply_overrides(|key| bad.get(key).map(|v| v.to_string()))
            .is_err());
    }

    #[test]
    fn rejects_case_insensitive_duplicates() {
        let mut config = sample();
        config.tubes.insert("MAIL".into(), TubeConfig::new("Other", ""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_plots() {
        let mut config = sample();
        config.plot = vec![];
        assert!(config.validate().is_err());

        config.plot = vec![30, 10];
        assert!(config.validate().is_err());

        config.plot = vec![10, 30];
        config.tubes.get_mut("mail").unwrap().plot = Some(vec![5, 1]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_undeclared_watch_and_watched_poison_tube() {
        let mut config = sample();
        config.watch = Some(vec!["GHOST".into()]);
        assert!(config.validate().is_err());

        config.watch = None;
        config.poison_tube = Some("mail".into());
        assert!(config.validate().is_err());

        config.poison_tube = Some("POISON".into());
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_reserve_timeout() {
        let mut config = sample();
        config.reserve_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reserve_timeout_secs"), "{err}");

        config.reserve_timeout_secs = 1;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_invalid_names_and_levels() {
        let mut config = sample();
        config.tubes.insert("-bad".into(), TubeConfig::new("X", ""));
        assert!(config.validate().is_err());

        let mut config = sample();
        config.loglevel = "queue".into();
        assert!(config.validate().is_err());

        config.loglevel = "debug".into();
        config.validate().unwrap();
        assert_eq!(config.audit_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn watched_tubes_default_to_all_normalized() {
        let config = sample();
        let watched: Vec<_> = config.watched_tubes().into_iter().collect();
        assert_eq!(watched, vec!["MAIL", "ORDERS"]);
    }
}
