use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 50 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Hostname announced in greetings and used for generated ids.
    pub hostname: String,

    /// DATA / APPEND byte cap.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,

    pub storage: StorageConfig,

    pub smtp: Option<SmtpConfig>,
    pub imap: Option<ImapConfig>,
    pub tls: Option<TlsConfig>,

    /// Compatibility shim: at mailbox open, mark messages carrying
    /// neither \Seen nor \Recent as seen.
    #[serde(default)]
    pub auto_seen_on_open: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub maildir_root: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SmtpConfig {
    /// Port 25 style listener: plaintext, STARTTLS offered when TLS is
    /// configured.
    pub bind_addr: Option<SocketAddr>,
    /// Port 587 style submission listener, same upgrade policy.
    pub submission_addr: Option<SocketAddr>,
    /// Port 465 style implicit-TLS listener.
    pub tls_addr: Option<SocketAddr>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImapConfig {
    /// Port 993 style implicit-TLS listener.
    pub tls_addr: Option<SocketAddr>,
    /// Optional plaintext listener; STARTTLS is offered and LOGIN is
    /// refused until the upgrade when TLS is configured.
    pub bind_addr: Option<SocketAddr>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    pub certs: PathBuf,
    pub key: PathBuf,
}

fn default_max_message_size() -> u64 {
    DEFAULT_MAX_MESSAGE_SIZE
}

pub fn read_config(config_file: PathBuf) -> Result<Config> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}
