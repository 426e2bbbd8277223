use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use super::canonical_folder;

/// In-process wake-up registry keyed by (user, folder). Delivery calls
/// `wake` so that sessions idling on the mailbox emit their untagged
/// updates without polling.
#[derive(Clone, Default)]
pub struct MailboxWatcher {
    inner: Arc<Mutex<HashMap<(String, String), broadcast::Sender<()>>>>,
}

impl MailboxWatcher {
    pub fn subscribe(&self, user: &str, folder: &str) -> broadcast::Receiver<()> {
        let key = (user.to_string(), canonical_folder(folder));
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key)
            .or_insert_with(|| broadcast::channel(16).0)
            .subscribe()
    }

    pub fn wake(&self, user: &str, folder: &str) {
        let key = (user.to_string(), canonical_folder(folder));
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = map.get(&key) {
            // Nobody listening is fine.
            let _ = tx.send(());
        }
    }
}
