//! Local delivery: resolve each accepted recipient, write the body
//! through the Maildir store and insert one index row per recipient.
//! A failure on one recipient never aborts the others.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

use crate::imf;
use crate::storage::{Flag, Index, MailRow, Storage, User, INBOX};

#[derive(Clone, Copy, Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub skipped: usize,
}

/// Resolve an address to a local user, following at most one alias
/// hop. A dangling alias target is non-deliverable.
pub fn resolve_local(index: &Index, addr: &str) -> Option<User> {
    if let Ok(user) = index.get_user(addr) {
        return Some(user);
    }
    let alias = index.get_alias(addr).ok()?;
    match index.get_user(&alias.target) {
        Ok(user) => Some(user),
        Err(_) => {
            warn!(source = %alias.source, target = %alias.target, "alias points at no local user");
            None
        }
    }
}

pub async fn deliver(
    storage: &Storage,
    hostname: &str,
    from: &str,
    rcpts: &[String],
    raw: &[u8],
) -> Result<DeliveryReport> {
    let bytes = prepare_bytes(raw, from, rcpts.first().map(|r| r.as_str()), hostname);
    let snap = imf::snapshot(&bytes);
    let now = Utc::now();

    let mut report = DeliveryReport::default();
    for rcpt in rcpts {
        let user = match resolve_local(&storage.index, rcpt) {
            Some(u) => u,
            None => {
                warn!(rcpt = %rcpt, "recipient vanished since RCPT, dropping");
                report.skipped += 1;
                continue;
            }
        };
        match deliver_one(storage, &user, &snap, from, rcpt, &bytes).await {
            Ok(()) => {
                storage.watcher.wake(&user.email, INBOX);
                report.delivered += 1;
            }
            Err(e) => {
                warn!(rcpt = %rcpt, error = %e, "delivery to recipient failed");
                report.skipped += 1;
            }
        }
    }
    Ok(report)
}

async fn deliver_one(
    storage: &Storage,
    user: &User,
    snap: &imf::HeaderSnapshot,
    envelope_from: &str,
    rcpt: &str,
    bytes: &[u8],
) -> Result<()> {
    if user.quota_bytes > 0 {
        let quota = storage.index.get_quota(&user.email)?;
        if quota.used + bytes.len() as u64 > quota.limit {
            anyhow::bail!(
                "quota exceeded ({} + {} > {})",
                quota.used,
                bytes.len(),
                quota.limit
            );
        }
    }

    storage.maildir.ensure_maildir(&user.email, INBOX).await?;
    let id = storage.maildir.store(&user.email, INBOX, bytes).await?;

    let row = MailRow {
        id: id.clone(),
        user_email: user.email.clone(),
        folder: INBOX.to_string(),
        uid: 0,
        from: snap
            .from
            .clone()
            .or_else(|| (!envelope_from.is_empty()).then(|| envelope_from.to_string()))
            .unwrap_or_else(|| "unknown@unknown".to_string()),
        to: if snap.to.is_empty() {
            vec![rcpt.to_string()]
        } else {
            snap.to.clone()
        },
        cc: snap.cc.clone(),
        bcc: snap.bcc.clone(),
        subject: snap
            .subject
            .clone()
            .unwrap_or_else(|| "(no subject)".to_string()),
        size: bytes.len() as u64,
        flags: [Flag::Recent].into_iter().collect(),
        received_at: Utc::now(),
    };
    if let Err(e) = storage.index.store_mail(&row) {
        // Leave the body file for the reconciler rather than lose mail.
        warn!(id = %id, error = %e, "index insert failed, body left for reconciliation");
        return Err(e.into());
    }
    debug!(user = %user.email, id = %id, "delivered");
    Ok(())
}

/// Prepend a synthesized header block when the body has no
/// recognisable one; otherwise the bytes are stored untouched.
fn prepare_bytes(raw: &[u8], from: &str, first_rcpt: Option<&str>, hostname: &str) -> Vec<u8> {
    if imf::has_header_block(raw) {
        return raw.to_vec();
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut bytes = imf::synthesize_header_block(
        raw,
        from,
        first_rcpt.unwrap_or("unknown@unknown"),
        hostname,
        Utc::now(),
        nanos,
    );
    bytes.extend_from_slice(b"\r\n");
    bytes.extend_from_slice(raw);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::{Alias, Domain};
    use std::sync::Arc;

    async fn fixture() -> (tempfile::TempDir, Arc<Storage>) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::open(
            &StorageConfig {
                db_path: tmp.path().join("index.db"),
                maildir_root: tmp.path().join("maildir"),
            },
            "mx.example.com",
        )
        .unwrap();
        storage
            .index
            .create_domain(&Domain {
                name: "example.com".into(),
                active: true,
            })
            .unwrap();
        storage
            .index
            .create_user(&User {
                id: 0,
                email: "alice@example.com".into(),
                password_hash: "x".into(),
                totp_secret: None,
                quota_bytes: 0,
                active: true,
                admin: false,
                created_at: Utc::now(),
            })
            .unwrap();
        (tmp, storage)
    }

    #[tokio::test]
    async fn delivers_to_local_user() {
        let (_tmp, storage) = fixture().await;
        let raw = b"From: bob@other.tld\r\nTo: alice@example.com\r\nSubject: Hi\r\n\r\nbody\r\n";
        let report = deliver(
            &storage,
            "mx.example.com",
            "bob@other.tld",
            &["alice@example.com".to_string()],
            raw,
        )
        .await
        .unwrap();
        assert_eq!(report.delivered, 1);

        let rows = storage
            .index
            .list_mails("alice@example.com", INBOX, 10, 0)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subject, "Hi");
        assert_eq!(rows[0].size, raw.len() as u64);
        assert!(rows[0].flags.contains(&Flag::Recent));
        let stored = storage
            .maildir
            .read("alice@example.com", INBOX, &rows[0].id)
            .await
            .unwrap();
        assert_eq!(stored, raw);
    }

    #[tokio::test]
    async fn headerless_body_gets_synthesized_headers() {
        let (_tmp, storage) = fixture().await;
        let report = deliver(
            &storage,
            "mx.example.com",
            "bob@other.tld",
            &["alice@example.com".to_string()],
            b"just a body line\r\n",
        )
        .await
        .unwrap();
        assert_eq!(report.delivered, 1);

        let rows = storage
            .index
            .list_mails("alice@example.com", INBOX, 10, 0)
            .unwrap();
        let stored = storage
            .maildir
            .read("alice@example.com", INBOX, &rows[0].id)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&stored);
        assert!(text.contains("From: bob@other.tld\r\n"));
        assert!(text.contains("Subject: (no subject)\r\n"));
        assert!(text.ends_with("just a body line\r\n"));
        assert_eq!(rows[0].size, stored.len() as u64);
    }

    #[tokio::test]
    async fn alias_resolves_one_hop() {
        let (_tmp, storage) = fixture().await;
        storage
            .index
            .create_alias(&Alias {
                source: "team@example.com".into(),
                target: "alice@example.com".into(),
                domain: "example.com".into(),
            })
            .unwrap();
        let report = deliver(
            &storage,
            "mx.example.com",
            "bob@other.tld",
            &["team@example.com".to_string()],
            b"Subject: x\r\n\r\ny\r\n",
        )
        .await
        .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(
            storage
                .index
                .list_mails("alice@example.com", INBOX, 10, 0)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn unknown_recipient_is_skipped_not_fatal() {
        let (_tmp, storage) = fixture().await;
        let report = deliver(
            &storage,
            "mx.example.com",
            "bob@other.tld",
            &[
                "ghost@example.com".to_string(),
                "alice@example.com".to_string(),
            ],
            b"Subject: x\r\n\r\ny\r\n",
        )
        .await
        .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn quota_blocks_delivery() {
        let (_tmp, storage) = fixture().await;
        storage.index.update_quota("alice@example.com", 10).unwrap();
        let report = deliver(
            &storage,
            "mx.example.com",
            "bob@other.tld",
            &["alice@example.com".to_string()],
            b"Subject: way past ten bytes\r\n\r\nbody\r\n",
        )
        .await
        .unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.skipped, 1);
        assert!(matches!(
            storage.index.get_quota("alice@example.com"),
            Ok(q) if q.used == 0
        ));
    }
}
