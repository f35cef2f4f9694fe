//! MumbleChat P2P node CLI
//!
//! Runs a wallet-addressed overlay node, sends one-off messages and manages
//! the wallet key the node is identified by.

mod config;

use clap::{Parser, Subcommand};
use mumble_core::{DeliveryPath, IncomingMessage, P2pManager, Services};
use mumble_crypto::{ChaChaEncryptionService, EncryptionService, GroupKey, WalletAddress, WalletIdentity, now_millis};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use config::Config;

/// mumble - wallet-addressed peer-to-peer messaging
#[derive(Parser)]
#[command(name = "mumble")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Daemon {
        /// Bind address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,

        /// Enable relay mode
        #[arg(long)]
        relay: bool,

        /// Group key (hex) used to print incoming messages in clear
        /// (defaults to the configured group key file)
        #[arg(long)]
        key: Option<String>,
    },

    /// Join the network, send one message and leave
    Send {
        /// Recipient wallet address
        #[arg(required = true)]
        recipient: String,

        /// Message text
        #[arg(required = true)]
        message: String,

        /// Group key (hex) shared with the recipient (defaults to the
        /// configured group key file)
        #[arg(long)]
        key: Option<String>,

        /// Seconds to wait for bootstrap and acknowledgement
        #[arg(long, default_value_t = 5)]
        wait: u64,

        /// Private key file (overrides the config file)
        #[arg(long)]
        identity: Option<PathBuf>,
    },

    /// Show local node configuration
    Status,

    /// Generate a new wallet identity
    Keygen {
        /// Output file for private key (defaults to the configured key file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite existing key files
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Daemon { bind, relay, key } => {
            run_daemon(bind, relay, key, &config).await?;
        }
        Commands::Send {
            recipient,
            message,
            key,
            wait,
            identity,
        } => {
            let key_file = identity.unwrap_or_else(|| config.node.private_key_file.clone());
            let group_key = resolve_group_key(key.as_deref(), &config.node.group_key_file)?
                .ok_or_else(|| anyhow::anyhow!("no group key (pass --key or run `mumble keygen`)"))?;
            send_message(&recipient, &message, &group_key, Duration::from_secs(wait), &key_file, &config).await?;
        }
        Commands::Status => {
            show_status(&config)?;
        }
        Commands::Keygen { output, force } => {
            let path = output.unwrap_or_else(|| config.node.private_key_file.clone());
            generate_identity(&path, force)?;
            generate_group_key(&config.node.group_key_file, force)?;
        }
    }

    Ok(())
}

/// Run a node until Ctrl+C
async fn run_daemon(bind: Option<String>, relay: bool, key: Option<String>, config: &Config) -> anyhow::Result<()> {
    let mut p2p = config.to_p2p_config()?;
    if let Some(bind) = bind {
        p2p.listen_addr = bind.parse()?;
    }
    p2p.is_relay |= relay;

    let group_key = resolve_group_key(key.as_deref(), &config.node.group_key_file)?;
    let identity = load_or_create_identity(&config.node.private_key_file)?;

    let manager = P2pManager::new(identity, p2p, Services::new())?;
    let mut incoming = manager.subscribe_messages();
    let mut receipts = manager.subscribe_receipts();
    manager.connect().await?;

    println!("Wallet:      {}", manager.wallet());
    println!("Node ID:     {}", manager.node_id());
    if let Some(addr) = manager.local_addr() {
        println!("Listening:   {addr}");
    }
    println!("Relay mode:  {}", manager.config().is_relay);
    println!("Peers:       {}", manager.connected_peer_count());
    println!("\nPress Ctrl+C to stop...");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            received = incoming.recv() => match received {
                Ok(message) => print_incoming(&message, group_key.as_ref()),
                Err(RecvError::Lagged(skipped)) => tracing::warn!("Dropped {} incoming messages", skipped),
                Err(RecvError::Closed) => break,
            },
            receipt = receipts.recv() => match receipt {
                Ok(receipt) => println!(
                    "[receipt] relayed {} -> {} ({})",
                    receipt.sender,
                    receipt.recipient,
                    hex::encode(&receipt.message_hash[..8])
                ),
                Err(RecvError::Lagged(skipped)) => tracing::warn!("Dropped {} receipt notifications", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!("\nShutting down...");
    manager.disconnect().await?;
    Ok(())
}

fn print_incoming(message: &IncomingMessage, key: Option<&GroupKey>) {
    let route = if message.via_gossip { "gossip" } else { "direct" };
    let body = match key {
        Some(key) => match ChaChaEncryptionService.decrypt(key, &message.payload) {
            Ok(plaintext) => String::from_utf8_lossy(&plaintext).into_owned(),
            Err(e) => format!("<undecryptable: {e}>"),
        },
        None => format!("<{} encrypted bytes>", message.payload.ciphertext().len()),
    };
    println!("[{}] {} ({}, via {}): {}", message.message_id, message.from, route, message.received_from, body);
}

/// Join, send one message, wait for an acknowledgement and leave
async fn send_message(
    recipient: &str,
    text: &str,
    group_key: &GroupKey,
    wait: Duration,
    key_file: &Path,
    config: &Config,
) -> anyhow::Result<()> {
    let recipient: WalletAddress = recipient.parse()?;
    let payload = ChaChaEncryptionService.encrypt(group_key, text.as_bytes())?;

    let mut p2p = config.to_p2p_config()?;
    // A one-shot sender does not need the well-known port
    p2p.listen_addr.set_port(0);
    p2p.lan.enabled = false;

    let identity = load_identity(key_file)?;
    let manager = P2pManager::new(identity, p2p, Services::new())?;
    manager.connect().await?;

    // Give LAN / DHT discovery a moment to find the recipient
    let deadline = tokio::time::Instant::now() + wait;
    while !manager.is_connected_to(&recipient) && tokio::time::Instant::now() < deadline {
        if manager.dht().get_node(&recipient).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let message_id = format!("{}-{}", manager.wallet(), now_millis());
    let result = manager.send_message(recipient, &payload, message_id.as_str()).await?;

    match result.path {
        DeliveryPath::Direct | DeliveryPath::DhtLocated => {
            println!("Sent {message_id} directly to {recipient}");
            let acked = wait_for_ack(&manager, &message_id, deadline).await;
            if acked {
                println!("Acknowledged by {recipient}");
            } else {
                println!("No acknowledgement yet");
            }
        }
        DeliveryPath::Gossip { via } => println!("Sent {message_id} via gossip (first hop {via})"),
        DeliveryPath::RelayService => println!("Sent {message_id} through the relay service"),
        DeliveryPath::Queued => {
            println!("No route to {recipient}; message {message_id} was not delivered");
        }
        DeliveryPath::Duplicate => println!("Message {message_id} was already sent"),
    }

    manager.disconnect().await?;
    Ok(())
}

async fn wait_for_ack(manager: &P2pManager, message_id: &str, deadline: tokio::time::Instant) -> bool {
    let deadline = deadline.max(tokio::time::Instant::now() + Duration::from_secs(1));
    while tokio::time::Instant::now() < deadline {
        if manager.is_acknowledged(message_id) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Show local configuration and identity
fn show_status(config: &Config) -> anyhow::Result<()> {
    println!("mumble Node Status");
    println!("==================");

    let key_file = &config.node.private_key_file;
    match load_identity(key_file) {
        Ok(identity) => println!("Wallet:      {}", identity.address()),
        Err(_) => println!("Wallet:      (no key at {}; run `mumble keygen`)", key_file.display()),
    }
    println!("Listen:      {}", config.parse_listen_addr()?);
    println!("Relay mode:  {}", config.relay.enabled);
    println!(
        "Group key:   {}",
        if config.node.group_key_file.exists() {
            config.node.group_key_file.display().to_string()
        } else {
            "(none; run `mumble keygen`)".to_string()
        }
    );
    println!(
        "LAN:         {}",
        if config.discovery.lan_enabled {
            format!("enabled (UDP {})", config.discovery.lan_port)
        } else {
            "disabled".to_string()
        }
    );

    let candidates = config.bootstrap_candidates()?;
    if candidates.is_empty() {
        println!("Bootstrap:   none (genesis unless relays are found)");
    } else {
        println!("Bootstrap:");
        for candidate in candidates {
            println!("  {candidate}");
        }
    }
    Ok(())
}

/// Generate a wallet identity and save its private key
fn generate_identity(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    println!("Generating new wallet identity...");
    let identity = WalletIdentity::generate();
    write_private_key(path, &identity)?;

    println!("Wallet:      {}", identity.address());
    println!("Public key:  {}", identity.public_key_hex());
    println!("Private key saved to: {}", path.display());
    println!("\n⚠️  Keep this file secure! It contains your private key.");
    Ok(())
}

/// Generate a shared group key unless one is already present
fn generate_group_key(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        println!("Group key:   keeping existing {}", path.display());
        return Ok(());
    }

    let key = ChaChaEncryptionService.generate_group_key();
    let encoded = Zeroizing::new(hex::encode(key.as_bytes()));
    write_secret(path, encoded.as_bytes())?;
    println!("Group key saved to: {} (share it with your contacts)", path.display());
    Ok(())
}

/// `--key` wins over the group key file; a missing file is not an error
fn resolve_group_key(key: Option<&str>, path: &Path) -> anyhow::Result<Option<GroupKey>> {
    if let Some(key) = key {
        return Ok(Some(GroupKey::from_hex(key.trim())?));
    }
    if !path.exists() {
        return Ok(None);
    }
    let contents = Zeroizing::new(fs::read_to_string(path)?);
    let key = GroupKey::from_hex(contents.trim())
        .map_err(|e| anyhow::anyhow!("invalid group key in {}: {}", path.display(), e))?;
    Ok(Some(key))
}

fn load_identity(path: &Path) -> anyhow::Result<WalletIdentity> {
    let contents = Zeroizing::new(fs::read_to_string(path)?);
    WalletIdentity::from_private_key_hex(contents.trim())
        .map_err(|e| anyhow::anyhow!("invalid private key in {}: {}", path.display(), e))
}

fn load_or_create_identity(path: &Path) -> anyhow::Result<WalletIdentity> {
    if path.exists() {
        return load_identity(path);
    }
    let identity = WalletIdentity::generate();
    write_private_key(path, &identity)?;
    tracing::info!("Created new identity {} at {}", identity.address(), path.display());
    Ok(identity)
}

fn write_private_key(path: &Path, identity: &WalletIdentity) -> anyhow::Result<()> {
    let encoded = identity.private_key_hex();
    write_secret(path, encoded.as_bytes())
}

/// Write an owner-only file, creating parent directories
fn write_secret(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/private_key");

        let identity = WalletIdentity::generate();
        write_private_key(&path, &identity).unwrap();

        let loaded = load_identity(&path).unwrap();
        assert_eq!(loaded.address(), identity.address());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private_key");
        write_private_key(&path, &WalletIdentity::generate()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private_key");

        let first = load_or_create_identity(&path).unwrap();
        let second = load_or_create_identity(&path).unwrap();
        assert_eq!(first.address(), second.address());
    }

    #[test]
    fn test_keygen_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private_key");

        generate_identity(&path, false).unwrap();
        let original = fs::read_to_string(&path).unwrap();

        assert!(generate_identity(&path, false).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), original);

        generate_identity(&path, true).unwrap();
        assert_ne!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_group_key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group_key");

        assert!(resolve_group_key(None, &path).unwrap().is_none());

        generate_group_key(&path, false).unwrap();
        let original = fs::read_to_string(&path).unwrap();
        assert!(resolve_group_key(None, &path).unwrap().is_some());

        // Existing key is kept without --force
        generate_group_key(&path, false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), original);

        // Explicit key overrides the file
        let explicit = "11".repeat(32);
        let key = resolve_group_key(Some(&explicit), &path).unwrap().unwrap();
        assert_eq!(hex::encode(key.as_bytes()), explicit);
    }

    #[test]
    fn test_garbage_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private_key");
        fs::write(&path, "not hex").unwrap();
        assert!(load_identity(&path).is_err());
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from([
            "mumble",
            "send",
            "0x00000000000000000000000000000000000000aa",
            "hello",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Send { wait: 5, key: None, .. }));
    }
}
