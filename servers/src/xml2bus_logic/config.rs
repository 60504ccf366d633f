use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use lib_xml2bus::core::{OverflowPolicy, DEFAULT_QUEUE_CAPACITY};
use lib_xml2bus::ingestors::xml_stream::DEFAULT_MAX_TOKEN_LEN;
use lib_xml2bus::ingestors::{AcceptErrorPolicy, SessionConfig, DEFAULT_XML_PORT};

const DEFAULT_CONFIG_FILE: &str = "server_xml2bus.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "XML paging stream to message bus bridge", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "XML2BUS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "XML2BUS_XML_HOST", help = "Interface the XML listener binds to.")]
    pub xml_host: Option<String>,

    #[clap(long, env = "XML2BUS_XML_PORT", help = "Port the paging system connects to.")]
    pub xml_port: Option<u16>,

    #[clap(long, env = "XML2BUS_HTTP_PORT", help = "Port of the administrative web server.")]
    pub http_port: Option<u16>,

    #[clap(long, env = "XML2BUS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "XML2BUS_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "XML2BUS_QUEUE_CAPACITY", help = "Records held between the listener and the publisher.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "XML2BUS_OVERFLOW_POLICY", help = "Full queue behaviour: 'block' or 'drop-after=<ms>'.")]
    pub overflow_policy: Option<OverflowPolicy>,

    #[clap(long, env = "XML2BUS_WRITE_TIMEOUT_SECS", help = "Deadline in seconds for writing a probe response.")]
    pub write_timeout_secs: Option<u64>,

    #[clap(long, env = "XML2BUS_IDLE_TIMEOUT_SECS", help = "Close connections silent for this many seconds.")]
    pub idle_timeout_secs: Option<u64>,

    #[clap(long, env = "XML2BUS_MAX_TOKEN_BYTES", help = "Largest single XML token accepted from a peer.")]
    pub max_token_bytes: Option<usize>,

    #[clap(long, env = "XML2BUS_ACCEPT_ERRORS", help = "Accept error handling: 'tolerant' or 'strict'.")]
    pub accept_errors: Option<AcceptErrorPolicy>,

    #[clap(long, env = "XML2BUS_BUS_URL", help = "Redis URL of the message bus. Records are only logged when unset.")]
    pub bus_url: Option<String>,

    #[clap(long, env = "XML2BUS_CLUSTER_ID", help = "Cluster id attached to published records.")]
    pub cluster_id: Option<String>,

    #[clap(long, env = "XML2BUS_CLIENT_ID", help = "Client id attached to published records.")]
    pub client_id: Option<String>,

    #[clap(long, env = "XML2BUS_SUBJECT", help = "Stream the records are published to.")]
    pub subject: Option<String>,

    #[clap(long, env = "XML2BUS_ASYNC_PUBLISH", help = "Publish without waiting for each acknowledgement.")]
    pub async_publish: Option<bool>,

    #[clap(long, env = "XML2BUS_RECONNECT_DELAY_MS", help = "Delay in milliseconds before reconnecting to the bus.")]
    pub reconnect_delay_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            xml_host: other.xml_host.or(self.xml_host),
            xml_port: other.xml_port.or(self.xml_port),
            http_port: other.http_port.or(self.http_port),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            overflow_policy: other.overflow_policy.or(self.overflow_policy),
            write_timeout_secs: other.write_timeout_secs.or(self.write_timeout_secs),
            idle_timeout_secs: other.idle_timeout_secs.or(self.idle_timeout_secs),
            max_token_bytes: other.max_token_bytes.or(self.max_token_bytes),
            accept_errors: other.accept_errors.or(self.accept_errors),
            bus_url: other.bus_url.or(self.bus_url),
            cluster_id: other.cluster_id.or(self.cluster_id),
            client_id: other.client_id.or(self.client_id),
            subject: other.subject.or(self.subject),
            async_publish: other.async_publish.or(self.async_publish),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
        }
    }

    /// Built-in values, lowest precedence.
    pub fn defaults() -> Config {
        Config {
            xml_host: Some("0.0.0.0".to_string()),
            xml_port: Some(DEFAULT_XML_PORT),
            http_port: Some(80),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            overflow_policy: Some(OverflowPolicy::Block),
            write_timeout_secs: Some(5),
            max_token_bytes: Some(DEFAULT_MAX_TOKEN_LEN),
            accept_errors: Some(AcceptErrorPolicy::Tolerant),
            cluster_id: Some("test-cluster".to_string()),
            client_id: Some("stan-pub".to_string()),
            subject: Some("Hospital.System".to_string()),
            async_publish: Some(false),
            reconnect_delay_ms: Some(1000),
            ..Default::default()
        }
    }

    pub fn xml_addr(&self) -> String {
        format!(
            "{}:{}",
            self.xml_host.as_deref().unwrap_or("0.0.0.0"),
            self.xml_port.unwrap_or(DEFAULT_XML_PORT)
        )
    }

    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            write_timeout: self
                .write_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.write_timeout),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            max_token_len: self.max_token_bytes.unwrap_or(defaults.max_token_len),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.unwrap_or(1000))
    }
}

/// # Load Config
///
/// Resolves the effective configuration. Precedence, highest first: CLI
/// arguments and environment variables, the JSON config file, built-in
/// defaults.
///
/// # Errors
/// Fails when the config file exists but cannot be read or parsed.
pub fn load_config() -> Result<Config> {
    load_config_from(Config::parse())
}

/// Same as [`load_config`] with the CLI/env layer supplied by the caller.
pub fn load_config_from(cli: Config) -> Result<Config> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path)? {
        current_config = current_config.merge(file_config);
    }
    Ok(current_config.merge(cli))
}

fn read_config_file(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let file_config = serde_json::from_str::<Config>(&config_str)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(Some(file_config))
}
