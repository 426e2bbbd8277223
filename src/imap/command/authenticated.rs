//! Dispatch for the authenticated (but unselected) state: mailbox
//! management, LIST/STATUS, APPEND and SELECT/EXAMINE.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::auth::Principal;
use crate::imap::command::{anystate, ServerContext};
use crate::imap::flow::{Permission, Transition};
use crate::imap::grammar::{Command, CommandBody, StatusItem};
use crate::imap::mailbox_view::MailboxView;
use crate::imap::response::{Body, Code, Data, Response, Status};
use crate::imf;
use crate::smtp::delivery;
use crate::storage::{canonical_folder, reconcile, Flag, FlagSet, MailRow, INBOX};

pub async fn dispatch(
    ctx: &ServerContext,
    principal: &Principal,
    cmd: &Command,
) -> Result<(Response, Transition)> {
    if let Some(response) = anystate::dispatch(cmd, ctx.caps) {
        let transition = match cmd.body {
            CommandBody::Logout => Transition::Logout,
            _ => Transition::None,
        };
        return Ok((response, transition));
    }

    let user = &principal.email;
    match &cmd.body {
        CommandBody::Select { mailbox } => select(ctx, user, &cmd.tag, mailbox, false).await,
        CommandBody::Examine { mailbox } => select(ctx, user, &cmd.tag, mailbox, true).await,
        CommandBody::Create { mailbox } => create(ctx, user, &cmd.tag, mailbox).await,
        CommandBody::Delete { mailbox } => delete(ctx, user, &cmd.tag, mailbox).await,
        CommandBody::Rename { from, to } => rename(ctx, user, &cmd.tag, from, to).await,
        CommandBody::Subscribe { mailbox } | CommandBody::Unsubscribe { mailbox } => {
            // Subscriptions are accepted and ignored; LSUB mirrors LIST.
            let _ = mailbox;
            Ok((anystate::ok(&cmd.tag, "completed"), Transition::None))
        }
        CommandBody::List { pattern, .. } => list(ctx, user, &cmd.tag, pattern, false),
        CommandBody::Lsub { pattern, .. } => list(ctx, user, &cmd.tag, pattern, true),
        CommandBody::Status { mailbox, items } => {
            status(ctx, user, &cmd.tag, mailbox, items).await
        }
        CommandBody::Append {
            mailbox,
            flags,
            date,
            message,
        } => {
            append(
                ctx,
                principal,
                &cmd.tag,
                mailbox,
                flags,
                date.as_ref().map(|d| d.with_timezone(&Utc)),
                message,
            )
            .await
        }
        CommandBody::Login { .. } | CommandBody::Authenticate { .. } => Ok((
            anystate::no(&cmd.tag, "Already authenticated"),
            Transition::None,
        )),
        _ => Ok((
            anystate::no(&cmd.tag, "No mailbox selected"),
            Transition::None,
        )),
    }
}

async fn select(
    ctx: &ServerContext,
    user: &str,
    tag: &str,
    mailbox: &str,
    read_only: bool,
) -> Result<(Response, Transition)> {
    match MailboxView::open(&ctx.storage, user, mailbox, read_only, ctx.auto_seen).await {
        Ok((view, body)) => {
            let (code, perm, verb) = if read_only {
                (Code::ReadOnly, Permission::ReadOnly, "EXAMINE")
            } else {
                (Code::ReadWrite, Permission::ReadWrite, "SELECT")
            };
            let completion = Status::ok(
                Some(tag.to_string()),
                Some(code),
                &format!("{} completed", verb),
            );
            Ok((
                Response::new(body, completion),
                Transition::Select(view, perm),
            ))
        }
        Err(e) => {
            warn!(user, mailbox, error = %e, "mailbox open failed");
            Ok((
                anystate::no(tag, "No such mailbox"),
                Transition::None,
            ))
        }
    }
}

async fn create(
    ctx: &ServerContext,
    user: &str,
    tag: &str,
    mailbox: &str,
) -> Result<(Response, Transition)> {
    let folder = canonical_folder(mailbox);
    if folder == INBOX {
        return Ok((anystate::no(tag, "INBOX already exists"), Transition::None));
    }
    match ctx.storage.index.create_folder(user, &folder) {
        Ok(()) => {
            ctx.storage.maildir.ensure_maildir(user, &folder).await?;
            Ok((anystate::ok(tag, "CREATE completed"), Transition::None))
        }
        Err(crate::storage::StorageError::AlreadyExists) => Ok((
            anystate::no(tag, "Mailbox already exists"),
            Transition::None,
        )),
        Err(e) => Err(e.into()),
    }
}

async fn delete(
    ctx: &ServerContext,
    user: &str,
    tag: &str,
    mailbox: &str,
) -> Result<(Response, Transition)> {
    let folder = canonical_folder(mailbox);
    if folder == INBOX {
        return Ok((anystate::no(tag, "INBOX cannot be deleted"), Transition::None));
    }
    if !ctx.storage.index.folder_exists(user, &folder)? {
        return Ok((anystate::no(tag, "No such mailbox"), Transition::None));
    }
    ctx.storage.index.delete_folder(user, &folder)?;
    ctx.storage.maildir.remove_folder(user, &folder).await?;
    info!(user, folder = %folder, "mailbox deleted");
    Ok((anystate::ok(tag, "DELETE completed"), Transition::None))
}

async fn rename(
    ctx: &ServerContext,
    user: &str,
    tag: &str,
    from: &str,
    to: &str,
) -> Result<(Response, Transition)> {
    let from = canonical_folder(from);
    let to = canonical_folder(to);
    if from == INBOX || to == INBOX {
        return Ok((anystate::no(tag, "INBOX cannot be renamed"), Transition::None));
    }
    if !ctx.storage.index.folder_exists(user, &from)? {
        return Ok((anystate::no(tag, "No such mailbox"), Transition::None));
    }
    if ctx.storage.index.folder_exists(user, &to)? {
        return Ok((
            anystate::no(tag, "Target mailbox already exists"),
            Transition::None,
        ));
    }
    ctx.storage.index.rename_folder(user, &from, &to)?;
    ctx.storage.maildir.rename_folder(user, &from, &to).await?;
    Ok((anystate::ok(tag, "RENAME completed"), Transition::None))
}

fn list(
    ctx: &ServerContext,
    user: &str,
    tag: &str,
    pattern: &str,
    lsub: bool,
) -> Result<(Response, Transition)> {
    let verb = if lsub { "LSUB" } else { "LIST" };
    let mut body = Vec::new();

    if pattern.is_empty() {
        // The hierarchy delimiter request.
        body.push(Body::Data(Data::List {
            lsub,
            attrs: vec!["\\Noselect".to_string()],
            delimiter: '/',
            name: String::new(),
        }));
    } else {
        for folder in ctx.storage.index.list_folders(user)? {
            if pattern_match(pattern, &folder) {
                body.push(Body::Data(Data::List {
                    lsub,
                    attrs: vec!["\\Noinferiors".to_string()],
                    delimiter: '/',
                    name: folder,
                }));
            }
        }
    }

    Ok((
        Response::new(
            body,
            Status::ok(Some(tag.to_string()), None, &format!("{} completed", verb)),
        ),
        Transition::None,
    ))
}

async fn status(
    ctx: &ServerContext,
    user: &str,
    tag: &str,
    mailbox: &str,
    items: &[StatusItem],
) -> Result<(Response, Transition)> {
    let folder = canonical_folder(mailbox);
    if !ctx.storage.index.folder_exists(user, &folder)? {
        return Ok((anystate::no(tag, "No such mailbox"), Transition::None));
    }
    let rows = reconcile::open_folder(
        &ctx.storage.index,
        &ctx.storage.maildir,
        user,
        &folder,
        ctx.auto_seen,
    )
    .await?;
    let state = ctx.storage.index.folder_state(user, &folder)?;

    let values = items
        .iter()
        .map(|item| {
            let value = match item {
                StatusItem::Messages => rows.len() as u32,
                StatusItem::Recent => {
                    rows.iter().filter(|r| r.flags.contains(&Flag::Recent)).count() as u32
                }
                StatusItem::Unseen => {
                    rows.iter().filter(|r| !r.flags.contains(&Flag::Seen)).count() as u32
                }
                StatusItem::UidNext => state.uid_next,
                StatusItem::UidValidity => state.uid_validity,
            };
            (*item, value)
        })
        .collect();

    Ok((
        Response::new(
            vec![Body::Data(Data::Status {
                mailbox: folder,
                items: values,
            })],
            Status::ok(Some(tag.to_string()), None, "STATUS completed"),
        ),
        Transition::None,
    ))
}

/// APPEND stores the literal as if it had been delivered to the
/// folder. Appending to `Sent` additionally delivers a copy to every
/// local recipient named in To/Cc/Bcc.
async fn append(
    ctx: &ServerContext,
    principal: &Principal,
    tag: &str,
    mailbox: &str,
    flags: &[Flag],
    date: Option<chrono::DateTime<Utc>>,
    message: &[u8],
) -> Result<(Response, Transition)> {
    let user = &principal.email;
    let folder = canonical_folder(mailbox);
    if !ctx.storage.index.folder_exists(user, &folder)? {
        return Ok((
            Response::status(Status::no(
                Some(tag.to_string()),
                Some(Code::TryCreate),
                "No such mailbox",
            )),
            Transition::None,
        ));
    }
    if message.len() as u64 > ctx.max_size {
        return Ok((
            Response::status(Status::no(
                Some(tag.to_string()),
                Some(Code::TooBig),
                "Message exceeds the append limit",
            )),
            Transition::None,
        ));
    }

    let mut flag_set: FlagSet = flags
        .iter()
        .filter(|f| !matches!(f, Flag::Recent))
        .cloned()
        .collect();
    if !flag_set.contains(&Flag::Seen) {
        flag_set.insert(Flag::Recent);
    }

    let id = ctx.storage.maildir.store(user, &folder, message).await?;
    if flag_set.contains(&Flag::Seen) {
        ctx.storage
            .maildir
            .move_to_cur(user, &folder, &id, &flag_set)
            .await?;
    }

    let snap = imf::snapshot(message);
    let row = MailRow {
        id,
        user_email: user.clone(),
        folder: folder.clone(),
        uid: 0,
        from: snap.from.clone().unwrap_or_else(|| user.clone()),
        to: snap.to.clone(),
        cc: snap.cc.clone(),
        bcc: snap.bcc.clone(),
        subject: snap
            .subject
            .clone()
            .unwrap_or_else(|| "(no subject)".to_string()),
        size: message.len() as u64,
        flags: flag_set,
        received_at: date.unwrap_or_else(Utc::now),
    };
    ctx.storage.index.store_mail(&row)?;
    ctx.storage.watcher.wake(user, &folder);

    if folder.eq_ignore_ascii_case("Sent") {
        let mut rcpts: Vec<String> = Vec::new();
        for addr in snap.to.iter().chain(snap.cc.iter()).chain(snap.bcc.iter()) {
            if !rcpts.iter().any(|r| r.eq_ignore_ascii_case(addr)) {
                rcpts.push(addr.clone());
            }
        }
        if !rcpts.is_empty() {
            let report =
                delivery::deliver(&ctx.storage, &ctx.hostname, user, &rcpts, message).await?;
            info!(
                user = %user,
                delivered = report.delivered,
                skipped = report.skipped,
                "sent-copy fan-out"
            );
        }
    }

    Ok((anystate::ok(tag, "APPEND completed"), Transition::None))
}

/// IMAP LIST wildcards: `*` matches anything, `%` anything but the
/// hierarchy delimiter.
pub fn pattern_match(pattern: &str, name: &str) -> bool {
    fn inner(pattern: &[u8], name: &[u8]) -> bool {
        match pattern.split_first() {
            None => name.is_empty(),
            Some((b'*', rest)) => {
                (0..=name.len()).any(|i| inner(rest, &name[i..]))
            }
            Some((b'%', rest)) => (0..=name.len())
                .filter(|&i| name[..i].iter().all(|&b| b != b'/'))
                .any(|i| inner(rest, &name[i..])),
            Some((&c, rest)) => match name.split_first() {
                Some((&n, name_rest)) => {
                    c.eq_ignore_ascii_case(&n) && inner(rest, name_rest)
                }
                None => false,
            },
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}
