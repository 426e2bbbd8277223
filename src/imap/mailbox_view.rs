//! A per-session view of one mailbox: the ordered snapshot taken at
//! SELECT, the sequence-number/UID mapping, and the FETCH / STORE /
//! SEARCH / COPY / EXPUNGE machinery operating on it.

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::imap::attributes;
use crate::imap::grammar::{FetchItem, SearchKey, Section, SequenceSet, StoreOp};
use crate::imap::response::{Body, Code, Data, FetchAttr, Status};
use crate::imap::search::{self, MatchContext};
use crate::storage::{
    canonical_folder, reconcile, Flag, FlagSet, MailRow, Storage, StorageError,
};

/// Flags every mailbox permits regardless of what its messages carry.
const DEFAULT_FLAGS: [Flag; 5] = [
    Flag::Seen,
    Flag::Answered,
    Flag::Flagged,
    Flag::Deleted,
    Flag::Draft,
];

pub struct MailboxView {
    pub user: String,
    pub folder: String,
    pub read_only: bool,
    uidvalidity: u32,
    uidnext: u32,
    rows: Vec<MailRow>,
}

/// COPY/MOVE into a missing mailbox is told apart so the session can
/// answer `NO [TRYCREATE]`.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("no such mailbox")]
    TryCreate,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MailboxView {
    /// Open a view: reconcile, snapshot, and produce the untagged
    /// SELECT/EXAMINE responses. `\Recent` is cleared in the index for
    /// a read-write open but stays visible in this session's snapshot.
    pub async fn open(
        storage: &Storage,
        user: &str,
        folder: &str,
        read_only: bool,
        auto_seen: bool,
    ) -> Result<(Self, Vec<Body>)> {
        let folder = canonical_folder(folder);
        if !storage.index.folder_exists(user, &folder)? {
            anyhow::bail!("no such mailbox: {}", folder);
        }
        let rows =
            reconcile::open_folder(&storage.index, &storage.maildir, user, &folder, auto_seen)
                .await?;
        let state = storage.index.folder_state(user, &folder)?;

        if !read_only {
            for row in rows.iter().filter(|r| r.flags.contains(&Flag::Recent)) {
                let mut stored = row.flags.clone();
                stored.remove(&Flag::Recent);
                storage.index.update_mail_flags(&row.id, &stored)?;
            }
        }

        let view = MailboxView {
            user: user.to_string(),
            folder,
            read_only,
            uidvalidity: state.uid_validity,
            uidnext: state.uid_next,
            rows,
        };

        let mut body = vec![
            Body::Data(Data::Exists(view.rows.len() as u32)),
            Body::Data(Data::Recent(view.recent_count())),
            Body::Data(Data::Flags(view.flag_list())),
        ];
        if let Some(unseen) = view.first_unseen() {
            body.push(Body::Status(Status::ok(
                None,
                Some(Code::Unseen(unseen)),
                "First unseen message",
            )));
        }
        let mut permanent: Vec<String> =
            view.flag_list().iter().map(|f| f.to_string()).collect();
        permanent.push("\\*".to_string());
        body.push(Body::Status(Status::ok(
            None,
            Some(Code::PermanentFlags(permanent)),
            "Flags permitted",
        )));
        body.push(Body::Status(Status::ok(
            None,
            Some(Code::UidNext(view.uidnext)),
            "Predicted next UID",
        )));
        body.push(Body::Status(Status::ok(
            None,
            Some(Code::UidValidity(view.uidvalidity)),
            "UIDs valid",
        )));

        Ok((view, body))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    fn recent_count(&self) -> u32 {
        self.rows
            .iter()
            .filter(|r| r.flags.contains(&Flag::Recent))
            .count() as u32
    }

    fn first_unseen(&self) -> Option<u32> {
        self.rows
            .iter()
            .position(|r| !r.flags.contains(&Flag::Seen))
            .map(|i| i as u32 + 1)
    }

    fn flag_list(&self) -> Vec<Flag> {
        let mut flags: Vec<Flag> = DEFAULT_FLAGS.to_vec();
        for row in &self.rows {
            for flag in &row.flags {
                if matches!(flag, Flag::Keyword(_)) && !flags.contains(flag) {
                    flags.push(flag.clone());
                }
            }
        }
        flags
    }

    fn max_uid(&self) -> u32 {
        self.rows.iter().map(|r| r.uid).max().unwrap_or(0)
    }

    /// Indices of the snapshot rows addressed by a sequence or UID
    /// set, ascending.
    fn resolve(&self, set: &SequenceSet, uid: bool) -> Vec<usize> {
        let max_seq = self.rows.len() as u32;
        let max_uid = self.max_uid();
        self.rows
            .iter()
            .enumerate()
            .filter(|(i, row)| {
                if uid {
                    set.contains(row.uid, max_uid)
                } else {
                    set.contains(*i as u32 + 1, max_seq)
                }
            })
            .map(|(i, _)| i)
            .collect()
    }

    // ---- FETCH ----

    pub async fn fetch(
        &mut self,
        storage: &Storage,
        set: &SequenceSet,
        items: &[FetchItem],
        uid: bool,
    ) -> Result<Vec<Body>> {
        let mut items = items.to_vec();
        // UID FETCH implies the UID item.
        if uid && !items.contains(&FetchItem::Uid) {
            items.insert(0, FetchItem::Uid);
        }
        let wants_flags = items.iter().any(|i| matches!(i, FetchItem::Flags));
        let need_raw = items.iter().any(|item| {
            matches!(
                item,
                FetchItem::Envelope
                    | FetchItem::Rfc822
                    | FetchItem::Rfc822Header
                    | FetchItem::Rfc822Text
                    | FetchItem::Body
                    | FetchItem::BodyStructure
                    | FetchItem::BodySection { .. }
            )
        });

        let mut out = Vec::new();
        for index in self.resolve(set, uid) {
            let seq = index as u32 + 1;
            let (id, row_uid) = {
                let row = &self.rows[index];
                (row.id.clone(), row.uid)
            };

            let raw = if need_raw {
                match storage.maildir.read(&self.user, &self.folder, &id).await {
                    Ok(raw) => Some(raw),
                    Err(e) => {
                        warn!(id = %id, error = %e, "fetch: unreadable message");
                        out.push(Body::Status(Status::no(
                            None,
                            None,
                            &format!("Message {} is unavailable", seq),
                        )));
                        continue;
                    }
                }
            } else {
                None
            };

            match self
                .fetch_one(storage, index, &items, raw.as_deref(), wants_flags)
                .await
            {
                Ok(attrs) => out.push(Body::Data(Data::Fetch { seq, attrs })),
                Err(e) => {
                    warn!(uid = row_uid, error = %e, "fetch: attribute resolution failed");
                    out.push(Body::Status(Status::no(
                        None,
                        None,
                        &format!("Message {} is unavailable", seq),
                    )));
                }
            }
        }
        Ok(out)
    }

    async fn fetch_one(
        &mut self,
        storage: &Storage,
        index: usize,
        items: &[FetchItem],
        raw: Option<&[u8]>,
        wants_flags: bool,
    ) -> Result<Vec<FetchAttr>> {
        let parsed = match raw {
            Some(raw) => Some(
                mailparse::parse_mail(raw).map_err(|e| anyhow!("unparseable message: {}", e))?,
            ),
            None => None,
        };

        let mut attrs = Vec::new();
        let mut saw_implicit_seen = false;
        for item in items {
            let row = &self.rows[index];
            match item {
                FetchItem::Uid => attrs.push(FetchAttr::Uid(row.uid)),
                FetchItem::Flags => attrs.push(FetchAttr::Flags(row.flags.clone())),
                FetchItem::InternalDate => {
                    attrs.push(FetchAttr::InternalDate(row.received_at))
                }
                FetchItem::Rfc822Size => attrs.push(FetchAttr::Rfc822Size(row.size)),
                FetchItem::Envelope => {
                    let parsed = parsed.as_ref().ok_or_else(|| anyhow!("no body"))?;
                    attrs.push(FetchAttr::Envelope(attributes::envelope(parsed)));
                }
                FetchItem::Body => {
                    let parsed = parsed.as_ref().ok_or_else(|| anyhow!("no body"))?;
                    attrs.push(FetchAttr::Body(attributes::body_structure(parsed)));
                }
                FetchItem::BodyStructure => {
                    let parsed = parsed.as_ref().ok_or_else(|| anyhow!("no body"))?;
                    attrs.push(FetchAttr::BodyStructure(attributes::body_structure(parsed)));
                }
                FetchItem::Rfc822 => {
                    let raw = raw.ok_or_else(|| anyhow!("no body"))?;
                    attrs.push(FetchAttr::Rfc822(raw.to_vec()));
                    saw_implicit_seen = true;
                }
                FetchItem::Rfc822Header => {
                    let raw = raw.ok_or_else(|| anyhow!("no body"))?;
                    attrs.push(FetchAttr::Rfc822Header(
                        attributes::header_slice(raw).to_vec(),
                    ));
                }
                FetchItem::Rfc822Text => {
                    let raw = raw.ok_or_else(|| anyhow!("no body"))?;
                    attrs.push(FetchAttr::Rfc822Text(attributes::text_slice(raw).to_vec()));
                    saw_implicit_seen = true;
                }
                FetchItem::BodySection {
                    section,
                    partial,
                    peek,
                } => {
                    let raw = raw.ok_or_else(|| anyhow!("no body"))?;
                    let parsed = parsed.as_ref().ok_or_else(|| anyhow!("no body"))?;
                    let data = attributes::section_bytes(raw, parsed, section);
                    let (data, origin) = match (data, partial) {
                        (Some(bytes), Some((origin, len))) => {
                            let start = (*origin as usize).min(bytes.len());
                            let end = (start + *len as usize).min(bytes.len());
                            (Some(bytes[start..end].to_vec()), Some(*origin))
                        }
                        (data, _) => (data, None),
                    };
                    attrs.push(FetchAttr::BodySection {
                        spec: render_section(section),
                        origin,
                        data,
                    });
                    if !peek {
                        saw_implicit_seen = true;
                    }
                }
            }
        }

        if saw_implicit_seen && !self.read_only {
            let changed = self.acquire_seen(storage, index).await?;
            if changed && !wants_flags {
                attrs.push(FetchAttr::Flags(self.rows[index].flags.clone()));
            }
        }
        Ok(attrs)
    }

    /// Non-PEEK body access: add `\Seen`, drop `\Recent`, and move the
    /// file out of `new/`.
    async fn acquire_seen(&mut self, storage: &Storage, index: usize) -> Result<bool> {
        let row = &mut self.rows[index];
        if row.flags.contains(&Flag::Seen) {
            return Ok(false);
        }
        row.flags.insert(Flag::Seen);
        row.flags.remove(&Flag::Recent);
        storage.index.update_mail_flags(&row.id, &row.flags)?;
        storage
            .maildir
            .move_to_cur(&self.user, &self.folder, &row.id, &row.flags)
            .await?;
        Ok(true)
    }

    // ---- STORE ----

    pub async fn store(
        &mut self,
        storage: &Storage,
        set: &SequenceSet,
        op: StoreOp,
        flags: &[Flag],
        silent: bool,
        uid: bool,
    ) -> Result<Vec<Body>> {
        // \Recent is server-owned; a client cannot set or clear it.
        let requested: FlagSet = flags
            .iter()
            .filter(|f| !matches!(f, Flag::Recent))
            .cloned()
            .collect();

        let mut out = Vec::new();
        for index in self.resolve(set, uid) {
            let seq = index as u32 + 1;
            let row = &mut self.rows[index];
            let mut base = row.flags.clone();
            base.remove(&Flag::Recent);
            let had_seen = base.contains(&Flag::Seen);

            let new_flags: FlagSet = match op {
                StoreOp::Set => requested.clone(),
                StoreOp::Add => base.union(&requested).cloned().collect(),
                StoreOp::Remove => base.difference(&requested).cloned().collect(),
            };

            storage.index.update_mail_flags(&row.id, &new_flags)?;
            if !had_seen && new_flags.contains(&Flag::Seen) {
                storage
                    .maildir
                    .move_to_cur(&self.user, &self.folder, &row.id, &new_flags)
                    .await?;
            }
            row.flags = new_flags.clone();

            if !silent {
                let mut attrs = Vec::new();
                if uid {
                    attrs.push(FetchAttr::Uid(row.uid));
                }
                attrs.push(FetchAttr::Flags(new_flags));
                out.push(Body::Data(Data::Fetch { seq, attrs }));
            }
        }
        Ok(out)
    }

    // ---- SEARCH ----

    pub async fn search(
        &self,
        storage: &Storage,
        criteria: &SearchKey,
        uid: bool,
    ) -> Result<Body> {
        let need_body = search::needs_body(criteria);
        let max_seq = self.rows.len() as u32;
        let max_uid = self.max_uid();

        let mut hits = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            let seq = i as u32 + 1;
            let raw = if need_body {
                match storage.maildir.read(&self.user, &self.folder, &row.id).await {
                    Ok(raw) => Some(raw),
                    Err(e) => {
                        warn!(id = %row.id, error = %e, "search: unreadable message, skipping");
                        continue;
                    }
                }
            } else {
                None
            };
            let ctx = MatchContext {
                row,
                seq,
                max_seq,
                max_uid,
                raw: raw.as_deref(),
            };
            if search::matches(criteria, &ctx) {
                hits.push(if uid { row.uid } else { seq });
            }
        }
        Ok(Body::Data(Data::Search(hits)))
    }

    // ---- COPY / MOVE ----

    pub async fn copy(
        &self,
        storage: &Storage,
        set: &SequenceSet,
        dest: &str,
        uid: bool,
    ) -> Result<usize, CopyError> {
        let dest = canonical_folder(dest);
        if dest.eq_ignore_ascii_case(&self.folder) {
            return Err(CopyError::Other(anyhow!("source and destination are the same")));
        }
        if !storage
            .index
            .folder_exists(&self.user, &dest)
            .map_err(|e| CopyError::Other(e.into()))?
        {
            return Err(CopyError::TryCreate);
        }

        let mut copied = 0;
        for index in self.resolve(set, uid) {
            let row = &self.rows[index];
            let raw = storage
                .maildir
                .read(&self.user, &self.folder, &row.id)
                .await
                .map_err(|e| CopyError::Other(e.into()))?;
            let new_id = storage
                .maildir
                .store(&self.user, &dest, &raw)
                .await
                .map_err(|e| CopyError::Other(e.into()))?;

            // Copies arrive without \Recent.
            let mut flags = row.flags.clone();
            flags.remove(&Flag::Recent);
            if flags.contains(&Flag::Seen) {
                storage
                    .maildir
                    .move_to_cur(&self.user, &dest, &new_id, &flags)
                    .await
                    .map_err(|e| CopyError::Other(e.into()))?;
            }

            let copy = MailRow {
                id: new_id,
                folder: dest.clone(),
                flags,
                ..row.clone()
            };
            storage
                .index
                .store_mail(&copy)
                .map_err(|e| CopyError::Other(e.into()))?;
            copied += 1;
        }
        storage.watcher.wake(&self.user, &dest);
        Ok(copied)
    }

    /// MOVE: copy, then expunge the sources regardless of `\Deleted`.
    pub async fn do_move(
        &mut self,
        storage: &Storage,
        set: &SequenceSet,
        dest: &str,
        uid: bool,
    ) -> Result<Vec<Body>, CopyError> {
        self.copy(storage, set, dest, uid).await?;
        let indices = self.resolve(set, uid);
        self.remove_rows(storage, indices)
            .await
            .map_err(CopyError::Other)
    }

    // ---- EXPUNGE ----

    pub async fn expunge(&mut self, storage: &Storage) -> Result<Vec<Body>> {
        let indices: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.flags.contains(&Flag::Deleted))
            .map(|(i, _)| i)
            .collect();
        self.remove_rows(storage, indices).await
    }

    /// Delete the given snapshot rows (index + body) and emit their
    /// `* n EXPUNGE` lines in descending sequence order.
    async fn remove_rows(&mut self, storage: &Storage, indices: Vec<usize>) -> Result<Vec<Body>> {
        let mut out = Vec::new();
        for &index in indices.iter().rev() {
            let row = &self.rows[index];
            match storage.index.delete_mail(&row.id) {
                Ok(()) | Err(StorageError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
            match storage
                .maildir
                .delete(&self.user, &self.folder, &row.id)
                .await
            {
                Ok(()) | Err(StorageError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
            out.push(Body::Data(Data::Expunge(index as u32 + 1)));
        }
        let mut removed = indices;
        removed.sort_unstable();
        for index in removed.into_iter().rev() {
            self.rows.remove(index);
        }
        Ok(out)
    }

    // ---- NOOP / IDLE updates ----

    /// Diff the snapshot against current storage state: expunges for
    /// vanished rows, EXISTS/RECENT when new mail arrived. New rows are
    /// appended so existing sequence numbers stay stable.
    pub async fn poll_updates(&mut self, storage: &Storage, auto_seen: bool) -> Result<Vec<Body>> {
        let fresh = reconcile::open_folder(
            &storage.index,
            &storage.maildir,
            &self.user,
            &self.folder,
            auto_seen,
        )
        .await?;

        let mut out = Vec::new();

        let vanished: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !fresh.iter().any(|f| f.id == row.id))
            .map(|(i, _)| i)
            .collect();
        for &index in vanished.iter().rev() {
            out.push(Body::Data(Data::Expunge(index as u32 + 1)));
        }
        for index in vanished.into_iter().rev() {
            self.rows.remove(index);
        }

        let mut added: Vec<MailRow> = fresh
            .into_iter()
            .filter(|f| !self.rows.iter().any(|row| row.id == f.id))
            .collect();
        if !added.is_empty() {
            added.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.uid.cmp(&b.uid)));
            if !self.read_only {
                for row in added.iter().filter(|r| r.flags.contains(&Flag::Recent)) {
                    let mut stored = row.flags.clone();
                    stored.remove(&Flag::Recent);
                    storage.index.update_mail_flags(&row.id, &stored)?;
                }
            }
            self.rows.extend(added);
            let state = storage.index.folder_state(&self.user, &self.folder)?;
            self.uidnext = state.uid_next;
            out.push(Body::Data(Data::Exists(self.rows.len() as u32)));
            out.push(Body::Data(Data::Recent(self.recent_count())));
        }

        Ok(out)
    }
}

fn render_section(section: &Section) -> String {
    match section {
        Section::Full => String::new(),
        Section::Header => "HEADER".to_string(),
        Section::Text => "TEXT".to_string(),
        Section::HeaderFields(fields) => {
            format!("HEADER.FIELDS ({})", fields.join(" ").to_ascii_uppercase())
        }
        Section::HeaderFieldsNot(fields) => format!(
            "HEADER.FIELDS.NOT ({})",
            fields.join(" ").to_ascii_uppercase()
        ),
        Section::Part(path, tail) => {
            let base = path
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(".");
            match tail {
                Some(tail) => format!("{}.{}", base, render_section(tail)),
                None => base,
            }
        }
    }
}
