pub mod anonymous;
pub mod anystate;
pub mod authenticated;
pub mod selected;

use std::sync::Arc;

use crate::auth::Authenticator;
use crate::imap::capability::ServerCapability;
use crate::storage::Storage;

/// Server-wide handles shared by every dispatch path.
#[derive(Clone)]
pub struct ServerContext {
    pub storage: Arc<Storage>,
    pub auth: Authenticator,
    pub caps: ServerCapability,
    pub hostname: String,
    pub max_size: u64,
    pub auto_seen: bool,
}
