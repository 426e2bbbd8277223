use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    canonical_folder, format_addr_list, format_flags, parse_addr_list, parse_flags, Alias, Domain,
    FlagSet, FolderState, MailRow, Quota, StorageError, User, DEFAULT_FOLDERS,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    email         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    totp_secret   TEXT,
    quota_bytes   INTEGER NOT NULL DEFAULT 0,
    active        INTEGER NOT NULL DEFAULT 1,
    admin         INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS domains (
    name   TEXT PRIMARY KEY,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS aliases (
    source TEXT PRIMARY KEY,
    target TEXT NOT NULL,
    domain TEXT NOT NULL REFERENCES domains(name)
);
CREATE TABLE IF NOT EXISTS mails (
    id          TEXT NOT NULL,
    user_email  TEXT NOT NULL REFERENCES users(email),
    folder      TEXT NOT NULL COLLATE NOCASE,
    uid         INTEGER NOT NULL,
    from_addr   TEXT NOT NULL DEFAULT '',
    to_addrs    TEXT NOT NULL DEFAULT '',
    cc_addrs    TEXT NOT NULL DEFAULT '',
    bcc_addrs   TEXT NOT NULL DEFAULT '',
    subject     TEXT NOT NULL DEFAULT '',
    size        INTEGER NOT NULL DEFAULT 0,
    flags       TEXT NOT NULL DEFAULT '',
    received_at TEXT NOT NULL,
    PRIMARY KEY (user_email, folder, id)
);
CREATE INDEX IF NOT EXISTS mails_by_folder
    ON mails (user_email, folder, received_at DESC);
CREATE TABLE IF NOT EXISTS folders (
    user_email   TEXT NOT NULL,
    folder       TEXT NOT NULL COLLATE NOCASE,
    uid_validity INTEGER NOT NULL,
    uid_next     INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (user_email, folder)
);
"#;

/// The relational metadata index. A single connection behind a mutex
/// gives the single-writer semantics the rest of the server relies on;
/// readers queue briefly behind writers.
#[derive(Clone)]
pub struct Index {
    conn: Arc<Mutex<Connection>>,
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn mail_from_row(row: &Row<'_>) -> rusqlite::Result<MailRow> {
    Ok(MailRow {
        id: row.get(0)?,
        user_email: row.get(1)?,
        folder: row.get(2)?,
        uid: row.get(3)?,
        from: row.get(4)?,
        to: parse_addr_list(&row.get::<_, String>(5)?),
        cc: parse_addr_list(&row.get::<_, String>(6)?),
        bcc: parse_addr_list(&row.get::<_, String>(7)?),
        subject: row.get(8)?,
        size: row.get::<_, i64>(9)? as u64,
        flags: parse_flags(&row.get::<_, String>(10)?),
        received_at: parse_ts(&row.get::<_, String>(11)?),
    })
}

const MAIL_COLS: &str =
    "id, user_email, folder, uid, from_addr, to_addrs, cc_addrs, bcc_addrs, subject, size, flags, received_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        totp_secret: row.get(3)?,
        quota_bytes: row.get::<_, i64>(4)? as u64,
        active: row.get(5)?,
        admin: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?),
    })
}

const USER_COLS: &str =
    "id, email, password_hash, totp_secret, quota_bytes, active, admin, created_at";

impl Index {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "foreign_keys", "on")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Index {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- users ----

    pub fn create_user(&self, user: &User) -> Result<(), StorageError> {
        self.conn()
            .execute(
                "INSERT INTO users (email, password_hash, totp_secret, quota_bytes, active, admin, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user.email,
                    user.password_hash,
                    user.totp_secret,
                    user.quota_bytes as i64,
                    user.active,
                    user.admin,
                    fmt_ts(user.created_at),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::AlreadyExists
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    pub fn get_user(&self, email: &str) -> Result<User, StorageError> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM users WHERE email = ?1", USER_COLS),
                params![email],
                user_from_row,
            )
            .optional()?
            .ok_or(StorageError::NotFound)
    }

    pub fn update_user(&self, user: &User) -> Result<(), StorageError> {
        let n = self.conn().execute(
            "UPDATE users SET password_hash = ?2, totp_secret = ?3, quota_bytes = ?4,
                    active = ?5, admin = ?6 WHERE email = ?1",
            params![
                user.email,
                user.password_hash,
                user.totp_secret,
                user.quota_bytes as i64,
                user.active,
                user.admin,
            ],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    pub fn delete_user(&self, email: &str) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM mails WHERE user_email = ?1", params![email])?;
        tx.execute("DELETE FROM folders WHERE user_email = ?1", params![email])?;
        let n = tx.execute("DELETE FROM users WHERE email = ?1", params![email])?;
        tx.commit()?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    pub fn list_users(&self, limit: u32, offset: u32) -> Result<Vec<User>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users ORDER BY email LIMIT ?1 OFFSET ?2",
            USER_COLS
        ))?;
        let users = stmt
            .query_map(params![limit, offset], user_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    // ---- domains ----

    pub fn create_domain(&self, domain: &Domain) -> Result<(), StorageError> {
        self.conn()
            .execute(
                "INSERT INTO domains (name, active) VALUES (?1, ?2)",
                params![domain.name, domain.active],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::AlreadyExists
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    pub fn get_domain(&self, name: &str) -> Result<Domain, StorageError> {
        self.conn()
            .query_row(
                "SELECT name, active FROM domains WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Domain {
                        name: row.get(0)?,
                        active: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or(StorageError::NotFound)
    }

    pub fn delete_domain(&self, name: &str) -> Result<(), StorageError> {
        let n = self
            .conn()
            .execute("DELETE FROM domains WHERE name = ?1", params![name])?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    pub fn list_domains(&self) -> Result<Vec<Domain>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT name, active FROM domains ORDER BY name")?;
        let domains = stmt
            .query_map([], |row| {
                Ok(Domain {
                    name: row.get(0)?,
                    active: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(domains)
    }

    // ---- aliases ----

    pub fn create_alias(&self, alias: &Alias) -> Result<(), StorageError> {
        self.conn()
            .execute(
                "INSERT INTO aliases (source, target, domain) VALUES (?1, ?2, ?3)",
                params![alias.source, alias.target, alias.domain],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::AlreadyExists
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    pub fn get_alias(&self, source: &str) -> Result<Alias, StorageError> {
        self.conn()
            .query_row(
                "SELECT source, target, domain FROM aliases WHERE source = ?1",
                params![source],
                |row| {
                    Ok(Alias {
                        source: row.get(0)?,
                        target: row.get(1)?,
                        domain: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or(StorageError::NotFound)
    }

    pub fn delete_alias(&self, source: &str) -> Result<(), StorageError> {
        let n = self
            .conn()
            .execute("DELETE FROM aliases WHERE source = ?1", params![source])?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    pub fn list_aliases(&self, domain: &str) -> Result<Vec<Alias>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT source, target, domain FROM aliases WHERE domain = ?1 ORDER BY source")?;
        let aliases = stmt
            .query_map(params![domain], |row| {
                Ok(Alias {
                    source: row.get(0)?,
                    target: row.get(1)?,
                    domain: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(aliases)
    }

    // ---- mails ----

    /// Insert an index row, allocating the message's UID from the
    /// folder's counter in the same transaction.
    pub fn store_mail(&self, mail: &MailRow) -> Result<u32, StorageError> {
        let folder = canonical_folder(&mail.folder);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let uid = next_uid(&tx, &mail.user_email, &folder)?;
        tx.execute(
            "INSERT INTO mails (id, user_email, folder, uid, from_addr, to_addrs, cc_addrs,
                                bcc_addrs, subject, size, flags, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                mail.id,
                mail.user_email,
                folder,
                uid,
                mail.from,
                format_addr_list(&mail.to),
                format_addr_list(&mail.cc),
                format_addr_list(&mail.bcc),
                mail.subject,
                mail.size as i64,
                format_flags(&mail.flags),
                fmt_ts(mail.received_at),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::AlreadyExists
            } else {
                e.into()
            }
        })?;
        tx.execute(
            "UPDATE folders SET uid_next = ?3 WHERE user_email = ?1 AND folder = ?2",
            params![mail.user_email, folder, uid + 1],
        )?;
        tx.commit()?;
        Ok(uid)
    }

    /// Message ids are globally unique by construction, so a bare id
    /// lookup is unambiguous.
    pub fn get_mail(&self, id: &str) -> Result<MailRow, StorageError> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM mails WHERE id = ?1", MAIL_COLS),
                params![id],
                mail_from_row,
            )
            .optional()?
            .ok_or(StorageError::NotFound)
    }

    pub fn list_mails(
        &self,
        user: &str,
        folder: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MailRow>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM mails WHERE user_email = ?1 AND folder = ?2
             ORDER BY received_at DESC, uid DESC LIMIT ?3 OFFSET ?4",
            MAIL_COLS
        ))?;
        let mails = stmt
            .query_map(
                params![user, canonical_folder(folder), limit, offset],
                mail_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mails)
    }

    pub fn update_mail_flags(&self, id: &str, flags: &FlagSet) -> Result<(), StorageError> {
        let n = self.conn().execute(
            "UPDATE mails SET flags = ?2 WHERE id = ?1",
            params![id, format_flags(flags)],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    /// Removes the row only; deleting the body file is the caller's
    /// responsibility.
    pub fn delete_mail(&self, id: &str) -> Result<(), StorageError> {
        let n = self
            .conn()
            .execute("DELETE FROM mails WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    /// Substring match over subject, sender and recipients,
    /// case-insensitively.
    pub fn search_mails(
        &self,
        user: &str,
        query: &str,
        folder: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MailRow>, StorageError> {
        let pattern = format!("%{}%", like_escape(query));
        let conn = self.conn();
        let mut sql = format!(
            "SELECT {} FROM mails WHERE user_email = ?1
               AND (subject LIKE ?2 ESCAPE '\\'
                    OR from_addr LIKE ?2 ESCAPE '\\'
                    OR to_addrs LIKE ?2 ESCAPE '\\')",
            MAIL_COLS
        );
        if folder.is_some() {
            sql.push_str(" AND folder = ?5");
        }
        sql.push_str(" ORDER BY received_at DESC LIMIT ?3 OFFSET ?4");
        let mut stmt = conn.prepare(&sql)?;
        let mails = match folder {
            Some(f) => stmt
                .query_map(
                    params![user, pattern, limit, offset, canonical_folder(f)],
                    mail_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![user, pattern, limit, offset], mail_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(mails)
    }

    // ---- folders ----

    /// Union of the default folder set and every folder mentioned by an
    /// existing row or counter.
    pub fn list_folders(&self, user: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn();
        let mut folders: Vec<String> = DEFAULT_FOLDERS.iter().map(|f| f.to_string()).collect();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT folder FROM mails WHERE user_email = ?1
             UNION SELECT folder FROM folders WHERE user_email = ?1",
        )?;
        let found = stmt
            .query_map(params![user], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for f in found {
            if !folders.iter().any(|k| k.eq_ignore_ascii_case(&f)) {
                folders.push(f);
            }
        }
        Ok(folders)
    }

    pub fn folder_exists(&self, user: &str, folder: &str) -> Result<bool, StorageError> {
        let folder = canonical_folder(folder);
        Ok(self
            .list_folders(user)?
            .iter()
            .any(|f| f.eq_ignore_ascii_case(&folder)))
    }

    /// Get (or lazily create) the folder's UIDVALIDITY and UIDNEXT.
    pub fn folder_state(&self, user: &str, folder: &str) -> Result<FolderState, StorageError> {
        let folder = canonical_folder(folder);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let state = folder_state_tx(&tx, user, &folder)?;
        tx.commit()?;
        Ok(state)
    }

    /// Materialize a folder. Fails with `AlreadyExists` when a counter
    /// row (or the default set) already knows it.
    pub fn create_folder(&self, user: &str, folder: &str) -> Result<(), StorageError> {
        let folder = canonical_folder(folder);
        if self.folder_exists(user, &folder)? {
            return Err(StorageError::AlreadyExists);
        }
        self.conn().execute(
            "INSERT INTO folders (user_email, folder, uid_validity, uid_next)
             VALUES (?1, ?2, ?3, 1)",
            params![user, folder, Utc::now().timestamp() as u32],
        )?;
        Ok(())
    }

    /// Drop a folder's rows and its UID counter. A later recreation
    /// allocates a fresh UIDVALIDITY.
    pub fn delete_folder(&self, user: &str, folder: &str) -> Result<(), StorageError> {
        let folder = canonical_folder(folder);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM mails WHERE user_email = ?1 AND folder = ?2",
            params![user, folder],
        )?;
        tx.execute(
            "DELETE FROM folders WHERE user_email = ?1 AND folder = ?2",
            params![user, folder],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn rename_folder(&self, user: &str, from: &str, to: &str) -> Result<(), StorageError> {
        let from = canonical_folder(from);
        let to = canonical_folder(to);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE mails SET folder = ?3 WHERE user_email = ?1 AND folder = ?2",
            params![user, from, to],
        )?;
        tx.execute(
            "UPDATE folders SET folder = ?3 WHERE user_email = ?1 AND folder = ?2",
            params![user, from, to],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ---- quota ----

    pub fn get_quota(&self, user: &str) -> Result<Quota, StorageError> {
        let limit = self.get_user(user)?.quota_bytes;
        let used: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(size), 0) FROM mails WHERE user_email = ?1",
            params![user],
            |row| row.get(0),
        )?;
        Ok(Quota {
            used: used as u64,
            limit,
        })
    }

    pub fn update_quota(&self, user: &str, limit: u64) -> Result<(), StorageError> {
        let n = self.conn().execute(
            "UPDATE users SET quota_bytes = ?2 WHERE email = ?1",
            params![user, limit as i64],
        )?;
        if n == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}

fn folder_state_tx(
    tx: &rusqlite::Transaction<'_>,
    user: &str,
    folder: &str,
) -> Result<FolderState, StorageError> {
    let existing = tx
        .query_row(
            "SELECT uid_validity, uid_next FROM folders WHERE user_email = ?1 AND folder = ?2",
            params![user, folder],
            |row| {
                Ok(FolderState {
                    uid_validity: row.get(0)?,
                    uid_next: row.get(1)?,
                })
            },
        )
        .optional()?;
    match existing {
        Some(state) => Ok(state),
        None => {
            let state = FolderState {
                uid_validity: Utc::now().timestamp() as u32,
                uid_next: 1,
            };
            tx.execute(
                "INSERT INTO folders (user_email, folder, uid_validity, uid_next)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user, folder, state.uid_validity, state.uid_next],
            )?;
            Ok(state)
        }
    }
}

fn next_uid(
    tx: &rusqlite::Transaction<'_>,
    user: &str,
    folder: &str,
) -> Result<u32, StorageError> {
    Ok(folder_state_tx(tx, user, folder)?.uid_next)
}

fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::super::Flag;
    use super::*;

    fn test_user(email: &str) -> User {
        User {
            id: 0,
            email: email.to_string(),
            password_hash: "$argon2id$test".to_string(),
            totp_secret: None,
            quota_bytes: 0,
            active: true,
            admin: false,
            created_at: Utc::now(),
        }
    }

    fn test_mail(id: &str, user: &str, folder: &str) -> MailRow {
        MailRow {
            id: id.to_string(),
            user_email: user.to_string(),
            folder: folder.to_string(),
            uid: 0,
            from: "bob@other.tld".to_string(),
            to: vec![user.to_string()],
            cc: vec![],
            bcc: vec![],
            subject: "Hi".to_string(),
            size: 42,
            flags: [Flag::Recent].into_iter().collect(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn user_crud() {
        let idx = Index::open_in_memory().unwrap();
        idx.create_user(&test_user("alice@example.com")).unwrap();
        assert!(matches!(
            idx.create_user(&test_user("alice@example.com")),
            Err(StorageError::AlreadyExists)
        ));
        let mut u = idx.get_user("alice@example.com").unwrap();
        assert!(u.active);
        u.quota_bytes = 1024;
        idx.update_user(&u).unwrap();
        assert_eq!(idx.get_user("alice@example.com").unwrap().quota_bytes, 1024);
        assert_eq!(idx.list_users(10, 0).unwrap().len(), 1);
        idx.delete_user("alice@example.com").unwrap();
        assert!(matches!(
            idx.get_user("alice@example.com"),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn mail_uid_allocation_is_monotonic() {
        let idx = Index::open_in_memory().unwrap();
        idx.create_user(&test_user("alice@example.com")).unwrap();
        let a = idx
            .store_mail(&test_mail("m1", "alice@example.com", "INBOX"))
            .unwrap();
        let b = idx
            .store_mail(&test_mail("m2", "alice@example.com", "INBOX"))
            .unwrap();
        assert_eq!((a, b), (1, 2));

        idx.delete_mail("m2").unwrap();
        let c = idx
            .store_mail(&test_mail("m3", "alice@example.com", "INBOX"))
            .unwrap();
        assert_eq!(c, 3, "expunged uids are never reused");
        assert_eq!(
            idx.folder_state("alice@example.com", "INBOX").unwrap().uid_next,
            4
        );
    }

    #[test]
    fn duplicate_id_in_folder_rejected() {
        let idx = Index::open_in_memory().unwrap();
        idx.create_user(&test_user("alice@example.com")).unwrap();
        idx.store_mail(&test_mail("m1", "alice@example.com", "INBOX"))
            .unwrap();
        assert!(matches!(
            idx.store_mail(&test_mail("m1", "alice@example.com", "INBOX")),
            Err(StorageError::AlreadyExists)
        ));
    }

    #[test]
    fn uidvalidity_changes_on_recreate() {
        let idx = Index::open_in_memory().unwrap();
        idx.create_user(&test_user("alice@example.com")).unwrap();
        idx.create_folder("alice@example.com", "Archive").unwrap();
        let before = idx.folder_state("alice@example.com", "Archive").unwrap();
        idx.delete_folder("alice@example.com", "Archive").unwrap();
        // Counter row is gone; the next open mints a new validity.
        let after = idx.folder_state("alice@example.com", "Archive").unwrap();
        assert!(after.uid_validity >= before.uid_validity);
        assert_eq!(after.uid_next, 1);
    }

    #[test]
    fn list_folders_includes_defaults_and_used() {
        let idx = Index::open_in_memory().unwrap();
        idx.create_user(&test_user("alice@example.com")).unwrap();
        idx.store_mail(&test_mail("m1", "alice@example.com", "Lists"))
            .unwrap();
        let folders = idx.list_folders("alice@example.com").unwrap();
        assert!(folders.iter().any(|f| f == "INBOX"));
        assert!(folders.iter().any(|f| f == "Trash"));
        assert!(folders.iter().any(|f| f == "Lists"));
    }

    #[test]
    fn search_is_case_insensitive() {
        let idx = Index::open_in_memory().unwrap();
        idx.create_user(&test_user("alice@example.com")).unwrap();
        idx.store_mail(&test_mail("m1", "alice@example.com", "INBOX"))
            .unwrap();
        let hits = idx
            .search_mails("alice@example.com", "hi", None, 10, 0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        let hits = idx
            .search_mails("alice@example.com", "100%", None, 10, 0)
            .unwrap();
        assert!(hits.is_empty(), "LIKE wildcards must be escaped");
    }

    #[test]
    fn quota_sums_sizes() {
        let idx = Index::open_in_memory().unwrap();
        idx.create_user(&test_user("alice@example.com")).unwrap();
        idx.store_mail(&test_mail("m1", "alice@example.com", "INBOX"))
            .unwrap();
        idx.store_mail(&test_mail("m2", "alice@example.com", "INBOX"))
            .unwrap();
        let q = idx.get_quota("alice@example.com").unwrap();
        assert_eq!(q.used, 84);
        assert_eq!(q.limit, 0);
    }

    #[test]
    fn alias_and_domain_crud() {
        let idx = Index::open_in_memory().unwrap();
        idx.create_domain(&Domain {
            name: "example.com".into(),
            active: true,
        })
        .unwrap();
        idx.create_alias(&Alias {
            source: "team@example.com".into(),
            target: "alice@example.com".into(),
            domain: "example.com".into(),
        })
        .unwrap();
        assert_eq!(
            idx.get_alias("team@example.com").unwrap().target,
            "alice@example.com"
        );
        assert_eq!(idx.list_aliases("example.com").unwrap().len(), 1);
        idx.delete_alias("team@example.com").unwrap();
        assert!(matches!(
            idx.get_alias("team@example.com"),
            Err(StorageError::NotFound)
        ));
    }
}
