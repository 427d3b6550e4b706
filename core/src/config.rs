use std::{collections::HashSet, fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    backends::{emulator::DEFAULT_ENDPOINT, Backend},
    cli::Cli,
    hub::DEFAULT_VIEWER_BUFFER,
    ingest::{AckPolicy, DEFAULT_PULL_BATCH},
    store::{TopicKey, DEFAULT_MAX_MESSAGES},
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid port {0}")]
    InvalidPort(u16),
    #[error("max_messages must be at least 1")]
    NoRetention,
    #[error("pull_batch must be at least 1")]
    EmptyBatch,
    #[error("no topics configured")]
    NoTopics,
    #[error("topic '{0}' has no project and no default project is set")]
    MissingProject(String),
    #[error("topic '{0}' is configured more than once")]
    DuplicateTopic(TopicKey),
}

/// Named example payload offered by the UI's publish form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamplePayload {
    pub name: String,
    pub payload: String,
}

/// A topic to tail, with its project resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub name: String,
    pub project: String,
    pub subscription: Option<String>,
    pub payloads: Vec<ExamplePayload>,
    qualified: bool,
}

impl TopicConfig {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project: project.into(),
            subscription: None,
            payloads: Vec::new(),
            qualified: false,
        }
    }

    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    /// Key this topic as `project/name`, as done when topics span projects.
    pub fn qualified(mut self) -> Self {
        self.qualified = true;
        self
    }

    pub fn key(&self) -> TopicKey {
        if self.qualified {
            format!("{}/{}", self.project, self.name)
        } else {
            self.name.clone()
        }
    }

    /// Subscription name to use when none is configured.
    pub fn default_subscription(&self) -> String {
        if self.qualified {
            format!("sub-{}-{}", self.project, self.name)
        } else {
            format!("sub-{}", self.name)
        }
    }

    pub fn subscription_name(&self) -> String {
        self.subscription
            .clone()
            .unwrap_or_else(|| self.default_subscription())
    }
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Messages retained per topic.
    pub max_messages: usize,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    pub backend: Backend,
    /// Emulator address, `host:port` or a full URL.
    pub endpoint: String,
    /// Messages requested per pull.
    pub pull_batch: usize,
    pub ack: AckPolicy,
    /// Snapshots a live viewer may have queued before it is dropped.
    pub viewer_buffer: usize,
    pub topics: Vec<TopicConfig>,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    max_messages: Option<usize>,
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    queue: FileQueue,
    #[serde(default)]
    hub: FileHub,
    #[serde(default)]
    topics: Vec<FileTopic>,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileQueue {
    #[serde(default)]
    backend: Backend,
    endpoint: Option<String>,
    pull_batch: Option<usize>,
    #[serde(default)]
    ack: AckPolicy,
}

#[derive(Deserialize, Default)]
struct FileHub {
    viewer_buffer: Option<usize>,
}

#[derive(Deserialize)]
struct FileTopic {
    name: String,
    project: Option<String>,
    subscription: Option<String>,
    #[serde(default)]
    payloads: Vec<ExamplePayload>,
}

fn default_port() -> u16 {
    8080
}

fn default_logging() -> bool {
    true
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("PUBSUBVIEW_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config.toml"));

        let text = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        let file_cfg: FileConfig = toml::from_str(&text)?;

        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut max_messages = file_cfg.max_messages.unwrap_or(DEFAULT_MAX_MESSAGES);
        let mut project = file_cfg.project;
        let mut backend = file_cfg.queue.backend;
        let mut endpoint = file_cfg
            .queue
            .endpoint
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        // environment overrides
        if let Ok(p) = std::env::var("PUBSUBVIEW_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("PUBSUBVIEW_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(m) = std::env::var("PUBSUBVIEW_MAX_MESSAGES") {
            if let Ok(m) = m.parse::<usize>() {
                max_messages = m;
            }
        }
        if let Ok(p) = std::env::var("PUBSUBVIEW_PROJECT") {
            if !p.is_empty() {
                project = Some(p);
            }
        }
        if let Ok(host) = std::env::var("PUBSUB_EMULATOR_HOST") {
            if !host.is_empty() {
                endpoint = host;
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }
        if let Some(m) = cli.max_messages {
            max_messages = m;
        }
        if let Some(b) = cli.backend {
            backend = b;
        }

        if !(1024..=65535).contains(&port) {
            return Err(ConfigError::InvalidPort(port));
        }
        if max_messages == 0 {
            return Err(ConfigError::NoRetention);
        }
        let pull_batch = file_cfg.queue.pull_batch.unwrap_or(DEFAULT_PULL_BATCH);
        if pull_batch == 0 {
            return Err(ConfigError::EmptyBatch);
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let topics = resolve_topics(project.as_deref(), file_cfg.topics)?;

        Ok(Self {
            bind,
            max_messages,
            logging_enabled: logging,
            backend,
            endpoint,
            pull_batch,
            ack: file_cfg.queue.ack,
            viewer_buffer: file_cfg.hub.viewer_buffer.unwrap_or(DEFAULT_VIEWER_BUFFER),
            topics,
        })
    }
}

/// Attach a project to every topic and check that keys are unique. Keys are
/// qualified with the project as soon as any topic names its own project.
fn resolve_topics(
    default_project: Option<&str>,
    topics: Vec<FileTopic>,
) -> Result<Vec<TopicConfig>, ConfigError> {
    if topics.is_empty() {
        return Err(ConfigError::NoTopics);
    }
    let multi_project = topics.iter().any(|t| t.project.is_some());
    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(topics.len());
    for t in topics {
        let project = t
            .project
            .or_else(|| default_project.map(str::to_string))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ConfigError::MissingProject(t.name.clone()))?;
        let mut topic = TopicConfig {
            name: t.name,
            project,
            subscription: t.subscription.filter(|s| !s.is_empty()),
            payloads: t.payloads,
            qualified: false,
        };
        if multi_project {
            topic = topic.qualified();
        }
        if !seen.insert(topic.key()) {
            return Err(ConfigError::DuplicateTopic(topic.key()));
        }
        resolved.push(topic);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    const ENV: [&str; 7] = [
        "PUBSUBVIEW_CONFIG",
        "PUBSUBVIEW_PORT",
        "PUBSUBVIEW_LOGGING",
        "PUBSUBVIEW_MAX_MESSAGES",
        "PUBSUBVIEW_PROJECT",
        "PUBSUB_EMULATOR_HOST",
        "BIND",
    ];

    fn clear_env() {
        for var in ENV {
            std::env::remove_var(var);
        }
    }

    fn load_str(contents: &str) -> Result<Config, ConfigError> {
        load_with(contents, Cli::default())
    }

    fn load_with(contents: &str, cli: Cli) -> Result<Config, ConfigError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, contents).unwrap();
        let cli = Cli {
            config: Some(path),
            ..cli
        };
        Config::load(&cli)
    }

    const MINIMAL: &str = "project = \"local\"\n[[topics]]\nname = \"orders\"\n";

    #[test]
    #[serial]
    fn minimal_config_uses_defaults() {
        clear_env();
        let cfg = load_str(MINIMAL).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8080");
        assert_eq!(cfg.max_messages, 10);
        assert!(cfg.logging_enabled);
        assert_eq!(cfg.backend, Backend::Emulator);
        assert_eq!(cfg.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(cfg.ack, AckPolicy::BeforeStore);
        assert_eq!(cfg.topics.len(), 1);
        assert_eq!(cfg.topics[0].key(), "orders");
        assert_eq!(cfg.topics[0].subscription_name(), "sub-orders");
    }

    #[test]
    #[serial]
    fn full_config_parses() {
        clear_env();
        let cfg = load_str(
            r#"
project = "local"
max_messages = 3

[server]
port = 5555

[logging]
enabled = false

[queue]
backend = "memory"
endpoint = "emulator:9000"
pull_batch = 5
ack = "after-store"

[hub]
viewer_buffer = 4

[[topics]]
name = "orders"
subscription = "orders-tail"

[[topics.payloads]]
name = "new order"
payload = '{"id": 1}'
"#,
        )
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5555");
        assert_eq!(cfg.max_messages, 3);
        assert!(!cfg.logging_enabled);
        assert_eq!(cfg.backend, Backend::Memory);
        assert_eq!(cfg.endpoint, "emulator:9000");
        assert_eq!(cfg.pull_batch, 5);
        assert_eq!(cfg.ack, AckPolicy::AfterStore);
        assert_eq!(cfg.viewer_buffer, 4);
        let topic = &cfg.topics[0];
        assert_eq!(topic.subscription_name(), "orders-tail");
        assert_eq!(topic.payloads[0].name, "new order");
        assert_eq!(topic.payloads[0].payload, "{\"id\": 1}");
    }

    #[test]
    #[serial]
    fn missing_file_fails() {
        clear_env();
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/pubsubview.toml")),
            ..Default::default()
        };
        assert!(matches!(Config::load(&cli), Err(ConfigError::Read { .. })));
    }

    #[test]
    #[serial]
    fn malformed_file_fails() {
        clear_env();
        assert!(matches!(
            load_str("topics = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    #[serial]
    fn invalid_port_fails() {
        clear_env();
        let contents = format!("{MINIMAL}[server]\nport = 80\n");
        assert!(matches!(
            load_str(&contents),
            Err(ConfigError::InvalidPort(80))
        ));
    }

    #[test]
    #[serial]
    fn zero_retention_fails() {
        clear_env();
        let contents = format!("max_messages = 0\n{MINIMAL}");
        assert!(matches!(load_str(&contents), Err(ConfigError::NoRetention)));
    }

    #[test]
    #[serial]
    fn topics_are_required() {
        clear_env();
        assert!(matches!(
            load_str("project = \"local\"\n"),
            Err(ConfigError::NoTopics)
        ));
    }

    #[test]
    #[serial]
    fn topic_without_project_fails() {
        clear_env();
        assert!(matches!(
            load_str("[[topics]]\nname = \"orders\"\n"),
            Err(ConfigError::MissingProject(name)) if name == "orders"
        ));
    }

    #[test]
    #[serial]
    fn project_from_env() {
        clear_env();
        std::env::set_var("PUBSUBVIEW_PROJECT", "from-env");
        let cfg = load_str("[[topics]]\nname = \"orders\"\n").unwrap();
        assert_eq!(cfg.topics[0].project, "from-env");
        clear_env();
    }

    #[test]
    #[serial]
    fn duplicate_topic_fails() {
        clear_env();
        let contents = format!("{MINIMAL}[[topics]]\nname = \"orders\"\nsubscription = \"other\"\n");
        assert!(matches!(
            load_str(&contents),
            Err(ConfigError::DuplicateTopic(key)) if key == "orders"
        ));
    }

    #[test]
    #[serial]
    fn multi_project_keys_are_qualified() {
        clear_env();
        let cfg = load_str(
            r#"
project = "main"

[[topics]]
name = "orders"

[[topics]]
name = "orders"
project = "billing"
"#,
        )
        .unwrap();
        let keys: Vec<_> = cfg.topics.iter().map(TopicConfig::key).collect();
        assert_eq!(keys, ["main/orders", "billing/orders"]);
        assert_eq!(cfg.topics[1].subscription_name(), "sub-billing-orders");
    }

    #[test]
    #[serial]
    fn empty_subscription_means_default() {
        clear_env();
        let contents = "project = \"p\"\n[[topics]]\nname = \"a\"\nsubscription = \"\"\n";
        let cfg = load_str(contents).unwrap();
        assert_eq!(cfg.topics[0].subscription, None);
        assert_eq!(cfg.topics[0].subscription_name(), "sub-a");
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        let contents = format!("max_messages = 4\n{MINIMAL}[server]\nport = 1111\n");
        std::env::set_var("PUBSUBVIEW_PORT", "2222");
        std::env::set_var("PUBSUBVIEW_MAX_MESSAGES", "6");
        std::env::set_var("PUBSUB_EMULATOR_HOST", "localhost:9999");
        let cli = Cli {
            port: Some(3333),
            ..Default::default()
        };
        let cfg = load_with(&contents, cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3333");
        assert_eq!(cfg.max_messages, 6);
        assert_eq!(cfg.endpoint, "localhost:9999");
        clear_env();
    }

    #[test]
    #[serial]
    fn cli_backend_and_retention_win() {
        clear_env();
        std::env::set_var("PUBSUBVIEW_MAX_MESSAGES", "6");
        let cli = Cli {
            max_messages: Some(2),
            backend: Some(Backend::Memory),
            bind: Some("0.0.0.0:9000".into()),
            ..Default::default()
        };
        let cfg = load_with(MINIMAL, cli).unwrap();
        assert_eq!(cfg.max_messages, 2);
        assert_eq!(cfg.backend, Backend::Memory);
        assert_eq!(cfg.bind, "0.0.0.0:9000");
        clear_env();
    }
}
