use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{canonical_folder, Flag, FlagSet, StorageError, INBOX};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// On-disk container for raw message bytes, one file per message under
/// `new/`, `cur/`, `tmp/`. `INBOX` lives at the top of the user
/// directory, every other folder in a `.Folder` dot-dir.
#[derive(Clone)]
pub struct MaildirStore {
    root: PathBuf,
    hostname: String,
}

/// One file found while walking a folder.
#[derive(Clone, Debug)]
pub struct MaildirEntry {
    pub id: String,
    pub cur: bool,
    pub flags: FlagSet,
    pub mtime: DateTime<Utc>,
}

impl MaildirStore {
    pub fn new(root: &Path, hostname: &str) -> Self {
        MaildirStore {
            root: root.to_path_buf(),
            hostname: hostname.to_string(),
        }
    }

    fn user_dir(&self, user: &str) -> PathBuf {
        self.root.join(user)
    }

    fn folder_dir(&self, user: &str, folder: &str) -> PathBuf {
        let folder = canonical_folder(folder);
        if folder == INBOX {
            self.user_dir(user)
        } else {
            self.user_dir(user).join(format!(".{}", folder))
        }
    }

    /// Idempotent: creates `new/`, `cur/` and `tmp/` for the folder.
    pub async fn ensure_maildir(&self, user: &str, folder: &str) -> Result<(), StorageError> {
        let dir = self.folder_dir(user, folder);
        for sub in ["new", "cur", "tmp"] {
            fs::create_dir_all(dir.join(sub)).await?;
        }
        Ok(())
    }

    fn gen_id(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}.M{}Q{}.{}",
            now.as_secs(),
            now.subsec_micros(),
            seq,
            self.hostname
        )
    }

    /// Write the message to `tmp/`, fsync, then rename into `new/`.
    /// Readers never observe a partial file.
    pub async fn store(
        &self,
        user: &str,
        folder: &str,
        bytes: &[u8],
    ) -> Result<String, StorageError> {
        self.ensure_maildir(user, folder).await?;
        let dir = self.folder_dir(user, folder);
        let id = self.gen_id();
        let tmp = dir.join("tmp").join(&id);
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, dir.join("new").join(&id)).await?;
        Ok(id)
    }

    /// Locate a message file in `new/` or in `cur/` under any flag
    /// suffix. Returns the full path, whether it sits in `cur/`, and
    /// the flags encoded in its name.
    pub async fn find(
        &self,
        user: &str,
        folder: &str,
        id: &str,
    ) -> Result<Option<(PathBuf, bool, FlagSet)>, StorageError> {
        let dir = self.folder_dir(user, folder);
        let in_new = dir.join("new").join(id);
        match fs::metadata(&in_new).await {
            Ok(_) => return Ok(Some((in_new, false, FlagSet::new()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let cur = dir.join("cur");
        let mut entries = match fs::read_dir(&cur).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let (base, flags) = split_info(&name);
            if base == id {
                return Ok(Some((entry.path(), true, flags)));
            }
        }
        Ok(None)
    }

    pub async fn read(&self, user: &str, folder: &str, id: &str) -> Result<Vec<u8>, StorageError> {
        match self.find(user, folder, id).await? {
            Some((path, _, _)) => Ok(fs::read(path).await?),
            None => Err(StorageError::NotFound),
        }
    }

    /// Rename `new/<id>` (or a prior `cur/` name) to
    /// `cur/<id>:2,<letters>` with the standard letter encoding.
    pub async fn move_to_cur(
        &self,
        user: &str,
        folder: &str,
        id: &str,
        flags: &FlagSet,
    ) -> Result<(), StorageError> {
        let (path, _, _) = self
            .find(user, folder, id)
            .await?
            .ok_or(StorageError::NotFound)?;
        let dir = self.folder_dir(user, folder);
        let target = dir
            .join("cur")
            .join(format!("{}:2,{}", id, flag_letters(flags)));
        if path != target {
            fs::rename(&path, &target).await?;
        }
        Ok(())
    }

    pub async fn list(&self, user: &str, folder: &str) -> Result<Vec<MaildirEntry>, StorageError> {
        let dir = self.folder_dir(user, folder);
        let mut out = Vec::new();
        for (sub, cur) in [("new", false), ("cur", true)] {
            let mut entries = match fs::read_dir(dir.join(sub)).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let (base, flags) = split_info(&name);
                let meta = entry.metadata().await?;
                let mtime = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                out.push(MaildirEntry {
                    id: base.to_string(),
                    cur,
                    flags,
                    mtime,
                });
            }
        }
        Ok(out)
    }

    pub async fn delete(&self, user: &str, folder: &str, id: &str) -> Result<(), StorageError> {
        let (path, _, _) = self
            .find(user, folder, id)
            .await?
            .ok_or(StorageError::NotFound)?;
        fs::remove_file(path).await?;
        Ok(())
    }

    /// Remove a folder's dot-dir wholesale. Refused for `INBOX`.
    pub async fn remove_folder(&self, user: &str, folder: &str) -> Result<(), StorageError> {
        if canonical_folder(folder) == INBOX {
            return Err(StorageError::NotFound);
        }
        match fs::remove_dir_all(self.folder_dir(user, folder)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn rename_folder(
        &self,
        user: &str,
        from: &str,
        to: &str,
    ) -> Result<(), StorageError> {
        let src = self.folder_dir(user, from);
        match fs::metadata(&src).await {
            Ok(_) => Ok(fs::rename(src, self.folder_dir(user, to)).await?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Split `id[:2,<letters>]` into the base id and the decoded flags.
pub fn split_info(name: &str) -> (&str, FlagSet) {
    match name.split_once(":2,") {
        Some((base, letters)) => (
            base,
            letters.chars().filter_map(Flag::from_maildir_letter).collect(),
        ),
        None => (name, FlagSet::new()),
    }
}

/// Encode flags as the sorted standard letter map.
pub fn flag_letters(flags: &FlagSet) -> String {
    let mut letters: Vec<char> = flags.iter().filter_map(|f| f.maildir_letter()).collect();
    letters.sort_unstable();
    letters.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MaildirStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MaildirStore::new(dir.path(), "mx.example.com");
        (dir, store)
    }

    #[tokio::test]
    async fn store_lands_in_new() {
        let (_tmp, md) = store();
        let id = md
            .store("alice@example.com", "INBOX", b"Subject: x\r\n\r\nbody")
            .await
            .unwrap();
        let (_, cur, _) = md
            .find("alice@example.com", "INBOX", &id)
            .await
            .unwrap()
            .unwrap();
        assert!(!cur);
        assert_eq!(
            md.read("alice@example.com", "INBOX", &id).await.unwrap(),
            b"Subject: x\r\n\r\nbody"
        );
    }

    #[tokio::test]
    async fn move_to_cur_encodes_flags() {
        let (_tmp, md) = store();
        let id = md
            .store("alice@example.com", "INBOX", b"x")
            .await
            .unwrap();
        let flags: FlagSet = [Flag::Seen, Flag::Answered].into_iter().collect();
        md.move_to_cur("alice@example.com", "INBOX", &id, &flags)
            .await
            .unwrap();
        let (path, cur, found) = md
            .find("alice@example.com", "INBOX", &id)
            .await
            .unwrap()
            .unwrap();
        assert!(cur);
        assert_eq!(found, flags);
        assert!(path.to_string_lossy().ends_with(":2,RS"));
        // Readable regardless of location.
        assert_eq!(md.read("alice@example.com", "INBOX", &id).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn folders_use_dot_dirs() {
        let (tmp, md) = store();
        md.ensure_maildir("alice@example.com", "Archive").await.unwrap();
        assert!(tmp
            .path()
            .join("alice@example.com/.Archive/new")
            .is_dir());
        md.ensure_maildir("alice@example.com", "inbox").await.unwrap();
        assert!(tmp.path().join("alice@example.com/new").is_dir());
    }

    #[tokio::test]
    async fn list_reports_both_dirs() {
        let (_tmp, md) = store();
        let a = md.store("alice@example.com", "INBOX", b"a").await.unwrap();
        let b = md.store("alice@example.com", "INBOX", b"b").await.unwrap();
        md.move_to_cur(
            "alice@example.com",
            "INBOX",
            &b,
            &[Flag::Seen].into_iter().collect(),
        )
        .await
        .unwrap();
        let entries = md.list("alice@example.com", "INBOX").await.unwrap();
        assert_eq!(entries.len(), 2);
        let ea = entries.iter().find(|e| e.id == a).unwrap();
        let eb = entries.iter().find(|e| e.id == b).unwrap();
        assert!(!ea.cur && ea.flags.is_empty());
        assert!(eb.cur && eb.flags.contains(&Flag::Seen));
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let (_tmp, md) = store();
        let id = md.store("alice@example.com", "INBOX", b"x").await.unwrap();
        md.delete("alice@example.com", "INBOX", &id).await.unwrap();
        assert!(matches!(
            md.read("alice@example.com", "INBOX", &id).await,
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn split_info_parses_suffix() {
        let (base, flags) = split_info("123.M4Q5.host:2,FST");
        assert_eq!(base, "123.M4Q5.host");
        assert_eq!(flags.len(), 3);
        let (base, flags) = split_info("123.M4Q5.host");
        assert_eq!(base, "123.M4Q5.host");
        assert!(flags.is_empty());
    }
}
