pub mod index;
pub mod maildir;
pub mod notify;
pub mod reconcile;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::StorageConfig;

pub use index::Index;
pub use maildir::MaildirStore;
pub use notify::MailboxWatcher;

pub const INBOX: &str = "INBOX";

/// Folders that exist for every user even before a first message lands
/// in them.
pub const DEFAULT_FOLDERS: [&str; 5] = ["INBOX", "Sent", "Drafts", "Trash", "Spam"];

/// Errors surfaced by the index and the body store. The protocol
/// sessions map these onto wire status codes.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// `INBOX` is a case-insensitive sentinel; all other folder names keep
/// their spelling.
pub fn canonical_folder(name: &str) -> String {
    if name.eq_ignore_ascii_case(INBOX) {
        INBOX.to_string()
    } else {
        name.to_string()
    }
}

// ---- flags ----

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Recent,
    Keyword(String),
}

pub type FlagSet = BTreeSet<Flag>;

impl Flag {
    /// Standard Maildir info letter, if the flag has one.
    pub fn maildir_letter(&self) -> Option<char> {
        match self {
            Flag::Draft => Some('D'),
            Flag::Flagged => Some('F'),
            Flag::Answered => Some('R'),
            Flag::Seen => Some('S'),
            Flag::Deleted => Some('T'),
            Flag::Recent | Flag::Keyword(_) => None,
        }
    }

    pub fn from_maildir_letter(c: char) -> Option<Flag> {
        match c {
            'D' => Some(Flag::Draft),
            'F' => Some(Flag::Flagged),
            'R' => Some(Flag::Answered),
            'S' => Some(Flag::Seen),
            'T' => Some(Flag::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::Keyword(k) => write!(f, "{}", k),
        }
    }
}

impl FromStr for Flag {
    type Err = ();

    fn from_str(s: &str) -> Result<Flag, ()> {
        if s.is_empty() {
            return Err(());
        }
        Ok(match s {
            _ if s.eq_ignore_ascii_case("\\Seen") => Flag::Seen,
            _ if s.eq_ignore_ascii_case("\\Answered") => Flag::Answered,
            _ if s.eq_ignore_ascii_case("\\Flagged") => Flag::Flagged,
            _ if s.eq_ignore_ascii_case("\\Deleted") => Flag::Deleted,
            _ if s.eq_ignore_ascii_case("\\Draft") => Flag::Draft,
            _ if s.eq_ignore_ascii_case("\\Recent") => Flag::Recent,
            _ => Flag::Keyword(s.to_string()),
        })
    }
}

/// Parse a whitespace-delimited flag list as stored in the index.
/// Stray whitespace is stripped and empty entries are skipped.
pub fn parse_flags(s: &str) -> FlagSet {
    s.split_whitespace()
        .filter_map(|w| w.trim().parse().ok())
        .collect()
}

pub fn format_flags(flags: &FlagSet) -> String {
    flags
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a comma-delimited address list as stored in the index.
pub fn parse_addr_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .map(|a| a.to_string())
        .collect()
}

pub fn format_addr_list(addrs: &[String]) -> String {
    addrs.join(",")
}

// ---- entities ----

#[derive(Clone, Debug)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub totp_secret: Option<String>,
    pub quota_bytes: u64,
    pub active: bool,
    pub admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Domain {
    pub name: String,
    pub active: bool,
}

#[derive(Clone, Debug)]
pub struct Alias {
    pub source: String,
    pub target: String,
    pub domain: String,
}

/// One message's metadata as held by the index. Body bytes live in the
/// Maildir store only.
#[derive(Clone, Debug, PartialEq)]
pub struct MailRow {
    pub id: String,
    pub user_email: String,
    pub folder: String,
    pub uid: u32,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub size: u64,
    pub flags: FlagSet,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
pub struct FolderState {
    pub uid_validity: u32,
    pub uid_next: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct Quota {
    pub used: u64,
    pub limit: u64,
}

// ---- the store handle passed to every session ----

pub struct Storage {
    pub index: Index,
    pub maildir: MaildirStore,
    pub watcher: MailboxWatcher,
}

impl Storage {
    pub fn open(config: &StorageConfig, hostname: &str) -> Result<Arc<Self>> {
        let index = Index::open(&config.db_path)?;
        let maildir = MaildirStore::new(&config.maildir_root, hostname);
        Ok(Arc::new(Storage {
            index,
            maildir,
            watcher: MailboxWatcher::default(),
        }))
    }
}
