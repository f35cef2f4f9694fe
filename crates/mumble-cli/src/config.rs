//! Configuration system for the mumble CLI.

use mumble_core::P2pConfig;
use mumble_discovery::BootstrapCandidate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// mumble node configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity and role
    #[serde(default)]
    pub node: NodeConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Gossip configuration
    #[serde(default)]
    pub gossip: GossipConfig,
    /// Discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Relay role and store-for-later bounds
    #[serde(default)]
    pub relay: RelayConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Wallet private key file (hex)
    #[serde(default = "default_private_key_path")]
    pub private_key_file: PathBuf,
    /// Shared group key file (hex)
    #[serde(default = "default_group_key_path")]
    pub group_key_file: PathBuf,
    /// Host advertised to peers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertised_host: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Bootstrap connections to establish before joining
    #[serde(default = "default_alpha")]
    pub alpha: usize,
    /// TCP connect timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Handshake timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Ping interval (seconds)
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Silence before a peer is dropped (seconds)
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
}

/// Gossip configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Forwards allowed for messages we originate
    #[serde(default = "default_ttl")]
    pub default_ttl: u8,
    /// Maintenance interval (seconds)
    #[serde(default = "default_gossip_interval_secs")]
    pub interval_secs: u64,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Static bootstrap nodes (`host:port` or `0xwallet@host:port`)
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    /// Enable LAN broadcast discovery
    #[serde(default = "default_true")]
    pub lan_enabled: bool,
    /// LAN discovery UDP port
    #[serde(default = "default_lan_port")]
    pub lan_port: u16,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Forward gossip for others and collect relay receipts
    #[serde(default)]
    pub enabled: bool,
    /// Receipts held for submission
    #[serde(default = "default_max_pending_receipts")]
    pub max_pending_receipts: usize,
    /// Messages held per offline recipient
    #[serde(default = "default_max_pending_per_recipient")]
    pub max_pending_per_recipient: usize,
    /// How long a held message is kept (hours)
    #[serde(default = "default_pending_ttl_hours")]
    pub pending_ttl_hours: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_private_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".mumble/private_key")
}

fn default_group_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".mumble/group_key")
}

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", mumble_core::node::DEFAULT_P2P_PORT)
}

fn default_alpha() -> usize {
    3
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_peer_timeout_secs() -> u64 {
    120
}

fn default_ttl() -> u8 {
    10
}

fn default_gossip_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_lan_port() -> u16 {
    mumble_discovery::DEFAULT_LAN_PORT
}

fn default_max_pending_receipts() -> usize {
    10_000
}

fn default_max_pending_per_recipient() -> usize {
    100
}

fn default_pending_ttl_hours() -> u64 {
    24
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_key_file: default_private_key_path(),
            group_key_file: default_group_key_path(),
            advertised_host: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            alpha: default_alpha(),
            connect_timeout_secs: default_timeout_secs(),
            handshake_timeout_secs: default_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_ttl(),
            interval_secs: default_gossip_interval_secs(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            lan_enabled: true,
            lan_port: default_lan_port(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_pending_receipts: default_max_pending_receipts(),
            max_pending_per_recipient: default_max_pending_per_recipient(),
            pending_ttl_hours: default_pending_ttl_hours(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("mumble/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Parse the static bootstrap list
    ///
    /// # Errors
    ///
    /// Returns an error naming the first malformed entry.
    pub fn bootstrap_candidates(&self) -> anyhow::Result<Vec<BootstrapCandidate>> {
        self.discovery
            .bootstrap_nodes
            .iter()
            .map(|entry| entry.parse::<BootstrapCandidate>().map_err(anyhow::Error::from))
            .collect()
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.network.alpha == 0 {
            anyhow::bail!("network.alpha must be at least 1");
        }
        if self.network.peer_timeout_secs <= self.network.ping_interval_secs {
            anyhow::bail!("network.peer_timeout_secs must exceed network.ping_interval_secs");
        }
        if self.discovery.lan_port == 0 {
            anyhow::bail!("discovery.lan_port must be non-zero");
        }
        if self.relay.max_pending_receipts == 0 || self.relay.max_pending_per_recipient == 0 {
            anyhow::bail!("relay queue bounds must be at least 1");
        }

        for node in &self.discovery.bootstrap_nodes {
            Self::validate_bootstrap_entry(node)?;
        }

        Ok(())
    }

    /// Validate `host:port` or `0xwallet@host:port`
    fn validate_bootstrap_entry(entry: &str) -> anyhow::Result<()> {
        let addr = entry.rsplit_once('@').map_or(entry, |(_, addr)| addr);

        let Some((host, port_str)) = addr.rsplit_once(':') else {
            anyhow::bail!("Bootstrap node '{}' missing port (expected format: host:port)", entry);
        };

        let port: u16 = port_str
            .parse()
            .map_err(|_| anyhow::anyhow!("Bootstrap node '{}' has invalid port: {}", entry, port_str))?;
        if port == 0 {
            anyhow::bail!("Bootstrap node '{}' has invalid port: 0", entry);
        }
        if host.is_empty() {
            anyhow::bail!("Bootstrap node '{}' has empty hostname", entry);
        }
        if host.contains("..") || host.contains('/') || host.contains('\\') {
            anyhow::bail!("Bootstrap node '{}' contains invalid characters", entry);
        }

        entry
            .parse::<BootstrapCandidate>()
            .map_err(|e| anyhow::anyhow!("Bootstrap node '{}': {}", entry, e))?;
        Ok(())
    }

    /// Build the manager configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address or a bootstrap entry is malformed.
    pub fn to_p2p_config(&self) -> anyhow::Result<P2pConfig> {
        let mut p2p = P2pConfig {
            listen_addr: self.parse_listen_addr()?,
            advertised_host: self.node.advertised_host.clone(),
            is_relay: self.relay.enabled,
            bootstrap_nodes: self.bootstrap_candidates()?,
            max_pending_receipts: self.relay.max_pending_receipts,
            ..P2pConfig::default()
        };

        p2p.network.alpha = self.network.alpha;
        p2p.network.connect_timeout = Duration::from_secs(self.network.connect_timeout_secs);
        p2p.network.handshake_timeout = Duration::from_secs(self.network.handshake_timeout_secs);
        p2p.network.ping_interval = Duration::from_secs(self.network.ping_interval_secs);
        p2p.network.peer_timeout = Duration::from_secs(self.network.peer_timeout_secs);

        p2p.gossip.default_ttl = self.gossip.default_ttl;
        p2p.gossip.interval = Duration::from_secs(self.gossip.interval_secs);

        p2p.lan.enabled = self.discovery.lan_enabled;
        p2p.lan.port = self.discovery.lan_port;

        p2p.pending.max_per_recipient = self.relay.max_pending_per_recipient;
        p2p.pending.message_ttl = Duration::from_secs(self.relay.pending_ttl_hours * 3600);

        Ok(p2p)
    }
}
