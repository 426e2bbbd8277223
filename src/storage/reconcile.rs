//! Fuses filesystem truth with index truth every time a mailbox is
//! opened: index rows appear for orphan files, impossible flag states
//! are repaired, and the resulting rows are returned in the order that
//! becomes the session's sequence-number basis.

use tracing::warn;

use crate::imf;

use super::{canonical_folder, Flag, Index, MailRow, MaildirStore, StorageError};

/// Reconcile one (user, folder) pair and return its rows sorted by
/// `received_at` descending. Safe to run while other sessions hold
/// views of the same mailbox: row writes are atomic and duplicate
/// inserts from a concurrent open are ignored.
pub async fn open_folder(
    index: &Index,
    maildir: &MaildirStore,
    user: &str,
    folder: &str,
    auto_seen: bool,
) -> Result<Vec<MailRow>, StorageError> {
    let folder = canonical_folder(folder);
    let rows = index.list_mails(user, &folder, u32::MAX, 0)?;
    let entries = maildir.list(user, &folder).await?;

    // Ingest files the index does not know about.
    for entry in &entries {
        if rows.iter().any(|r| r.id == entry.id) {
            continue;
        }
        let raw = match maildir.read(user, &folder, &entry.id).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(user, folder = %folder, id = %entry.id, error = %e, "unreadable message file, skipping");
                continue;
            }
        };
        let row = ingest(user, &folder, entry, &raw);
        match index.store_mail(&row) {
            Ok(_) => {}
            // Another session's reconciler got there first.
            Err(StorageError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }
    }

    let mut rows = index.list_mails(user, &folder, u32::MAX, 0)?;

    for row in rows.iter_mut() {
        let location = maildir.find(user, &folder, &row.id).await?;
        let in_new = matches!(location, Some((_, false, _)));

        // A file still in new/ is by definition unseen.
        if in_new && row.flags.contains(&Flag::Seen) {
            row.flags.remove(&Flag::Seen);
            index.update_mail_flags(&row.id, &row.flags)?;
        }

        // Legacy rows carrying neither \Seen nor \Recent are treated as
        // already read when the compatibility shim is on.
        if auto_seen && !row.flags.contains(&Flag::Seen) && !row.flags.contains(&Flag::Recent) {
            row.flags.insert(Flag::Seen);
            index.update_mail_flags(&row.id, &row.flags)?;
            if in_new {
                maildir.move_to_cur(user, &folder, &row.id, &row.flags).await?;
            }
        }
    }

    rows.sort_by(|a, b| b.received_at.cmp(&a.received_at).then(b.uid.cmp(&a.uid)));
    Ok(rows)
}

/// Build an index row for a file the index has never seen.
fn ingest(user: &str, folder: &str, entry: &super::maildir::MaildirEntry, raw: &[u8]) -> MailRow {
    let snap = if raw.starts_with(imf::MULTIPART_MARKER) {
        imf::HeaderSnapshot::default()
    } else {
        imf::snapshot(raw)
    };

    let from = match &snap.from {
        Some(f) => imf::bare_address(f),
        None => "unknown@unknown".to_string(),
    };
    let to = if snap.to.is_empty() {
        vec![user.to_string()]
    } else {
        snap.to.iter().map(|a| imf::bare_address(a)).collect()
    };
    let subject = snap
        .subject
        .clone()
        .unwrap_or_else(|| "(no subject)".to_string());

    let mut flags = entry.flags.clone();
    if !flags.contains(&Flag::Seen) {
        flags.insert(Flag::Recent);
    }

    MailRow {
        id: entry.id.clone(),
        user_email: user.to_string(),
        folder: folder.to_string(),
        uid: 0,
        from,
        to,
        cc: snap.cc.iter().map(|a| imf::bare_address(a)).collect(),
        bcc: snap.bcc.iter().map(|a| imf::bare_address(a)).collect(),
        subject,
        size: raw.len() as u64,
        flags,
        received_at: entry.mtime,
    }
}

#[cfg(test)]
mod tests {
    use super::super::{FlagSet, MaildirStore, User};
    use super::*;
    use chrono::Utc;

    async fn fixture() -> (tempfile::TempDir, Index, MaildirStore) {
        let tmp = tempfile::tempdir().unwrap();
        let index = Index::open_in_memory().unwrap();
        index
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
        let maildir = MaildirStore::new(tmp.path(), "mx.example.com");
        (tmp, index, maildir)
    }

    #[tokio::test]
    async fn orphan_file_gets_a_row() {
        let (_tmp, index, maildir) = fixture().await;
        let id = maildir
            .store(
                "alice@example.com",
                "INBOX",
                b"From: bob@other.tld\r\nSubject: found\r\n\r\nhello\r\n",
            )
            .await
            .unwrap();

        let rows = open_folder(&index, &maildir, "alice@example.com", "INBOX", false)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].from, "bob@other.tld");
        assert_eq!(rows[0].subject, "found");
        assert!(rows[0].flags.contains(&Flag::Recent));
        assert!(!rows[0].flags.contains(&Flag::Seen));
    }

    #[tokio::test]
    async fn headerless_file_gets_defaults() {
        let (_tmp, index, maildir) = fixture().await;
        maildir
            .store(
                "alice@example.com",
                "INBOX",
                b"This is a multi-part message in MIME format.\r\nrest\r\n",
            )
            .await
            .unwrap();

        let rows = open_folder(&index, &maildir, "alice@example.com", "INBOX", false)
            .await
            .unwrap();
        assert_eq!(rows[0].from, "unknown@unknown");
        assert_eq!(rows[0].to, vec!["alice@example.com".to_string()]);
        assert_eq!(rows[0].subject, "(no subject)");
    }

    #[tokio::test]
    async fn seen_file_in_cur_keeps_seen() {
        let (_tmp, index, maildir) = fixture().await;
        let id = maildir
            .store("alice@example.com", "INBOX", b"From: b@c.d\r\n\r\nx")
            .await
            .unwrap();
        maildir
            .move_to_cur(
                "alice@example.com",
                "INBOX",
                &id,
                &[Flag::Seen].into_iter().collect(),
            )
            .await
            .unwrap();

        let rows = open_folder(&index, &maildir, "alice@example.com", "INBOX", false)
            .await
            .unwrap();
        assert!(rows[0].flags.contains(&Flag::Seen));
        assert!(!rows[0].flags.contains(&Flag::Recent));
    }

    #[tokio::test]
    async fn seen_flag_on_new_file_is_repaired() {
        let (_tmp, index, maildir) = fixture().await;
        let id = maildir
            .store("alice@example.com", "INBOX", b"From: b@c.d\r\n\r\nx")
            .await
            .unwrap();
        // Index claims \Seen while the file still sits in new/.
        let rows = open_folder(&index, &maildir, "alice@example.com", "INBOX", false)
            .await
            .unwrap();
        let mut bad: FlagSet = rows[0].flags.clone();
        bad.insert(Flag::Seen);
        index.update_mail_flags(&id, &bad).unwrap();

        let rows = open_folder(&index, &maildir, "alice@example.com", "INBOX", false)
            .await
            .unwrap();
        assert!(!rows[0].flags.contains(&Flag::Seen));
    }

    #[tokio::test]
    async fn auto_seen_shim_marks_legacy_rows() {
        let (_tmp, index, maildir) = fixture().await;
        let id = maildir
            .store("alice@example.com", "INBOX", b"From: b@c.d\r\n\r\nx")
            .await
            .unwrap();
        let rows = open_folder(&index, &maildir, "alice@example.com", "INBOX", false)
            .await
            .unwrap();
        // Strip both \Seen and \Recent to fabricate a legacy row.
        index.update_mail_flags(&id, &FlagSet::new()).unwrap();
        let rows_off = open_folder(&index, &maildir, "alice@example.com", "INBOX", false)
            .await
            .unwrap();
        assert!(rows_off[0].flags.is_empty(), "shim off leaves the row alone");

        let rows_on = open_folder(&index, &maildir, "alice@example.com", "INBOX", true)
            .await
            .unwrap();
        assert!(rows_on[0].flags.contains(&Flag::Seen));
        let (_, cur, _) = maildir
            .find("alice@example.com", "INBOX", &id)
            .await
            .unwrap()
            .unwrap();
        assert!(cur, "auto-seen moves the file out of new/");
        drop(rows);
    }

    #[tokio::test]
    async fn ordering_is_received_at_descending() {
        let (_tmp, index, maildir) = fixture().await;
        for i in 0..3 {
            maildir
                .store(
                    "alice@example.com",
                    "INBOX",
                    format!("From: b@c.d\r\nSubject: {}\r\n\r\nx", i).as_bytes(),
                )
                .await
                .unwrap();
        }
        let rows = open_folder(&index, &maildir, "alice@example.com", "INBOX", false)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        for pair in rows.windows(2) {
            assert!(pair[0].received_at >= pair[1].received_at);
        }
    }
}
