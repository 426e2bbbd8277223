//! Dispatch for the selected state. Anything not specific to an open
//! mailbox falls through to the authenticated dispatch.

use anyhow::Result;

use crate::auth::Principal;
use crate::imap::command::{anystate, authenticated, ServerContext};
use crate::imap::flow::{Permission, Transition};
use crate::imap::grammar::{Command, CommandBody};
use crate::imap::mailbox_view::{CopyError, MailboxView};
use crate::imap::response::{Code, Response, Status};

pub async fn dispatch(
    ctx: &ServerContext,
    principal: &Principal,
    view: &mut MailboxView,
    perm: Permission,
    cmd: &Command,
) -> Result<(Response, Transition)> {
    let tag = &cmd.tag;
    let writable = perm == Permission::ReadWrite;

    match &cmd.body {
        CommandBody::Noop | CommandBody::Check => {
            let updates = view.poll_updates(&ctx.storage, ctx.auto_seen).await?;
            Ok((
                Response::new(updates, Status::ok(Some(tag.clone()), None, "completed")),
                Transition::None,
            ))
        }
        CommandBody::Close => {
            if writable {
                // CLOSE expunges silently.
                view.expunge(&ctx.storage).await?;
            }
            Ok((
                anystate::ok(tag, "CLOSE completed"),
                Transition::Unselect,
            ))
        }
        CommandBody::Unselect => Ok((
            anystate::ok(tag, "UNSELECT completed"),
            Transition::Unselect,
        )),
        CommandBody::Expunge => {
            if !writable {
                return Ok((
                    anystate::no(tag, "Mailbox is read-only"),
                    Transition::None,
                ));
            }
            let expunged = view.expunge(&ctx.storage).await?;
            Ok((
                Response::new(
                    expunged,
                    Status::ok(Some(tag.clone()), None, "EXPUNGE completed"),
                ),
                Transition::None,
            ))
        }
        CommandBody::Fetch { uid, set, items } => {
            let body = view.fetch(&ctx.storage, set, items, *uid).await?;
            Ok((
                Response::new(body, Status::ok(Some(tag.clone()), None, "FETCH completed")),
                Transition::None,
            ))
        }
        CommandBody::Store {
            uid,
            set,
            op,
            silent,
            flags,
        } => {
            if !writable {
                return Ok((
                    anystate::no(tag, "Mailbox is read-only"),
                    Transition::None,
                ));
            }
            let body = view
                .store(&ctx.storage, set, *op, flags, *silent, *uid)
                .await?;
            Ok((
                Response::new(body, Status::ok(Some(tag.clone()), None, "STORE completed")),
                Transition::None,
            ))
        }
        CommandBody::Search { uid, criteria } => {
            let hits = view.search(&ctx.storage, criteria, *uid).await?;
            Ok((
                Response::new(
                    vec![hits],
                    Status::ok(Some(tag.clone()), None, "SEARCH completed"),
                ),
                Transition::None,
            ))
        }
        CommandBody::Copy { uid, set, mailbox } => {
            match view.copy(&ctx.storage, set, mailbox, *uid).await {
                Ok(_) => Ok((anystate::ok(tag, "COPY completed"), Transition::None)),
                Err(CopyError::TryCreate) => Ok((try_create(tag), Transition::None)),
                Err(CopyError::Other(e)) => Err(e),
            }
        }
        CommandBody::Move { uid, set, mailbox } => {
            if !writable {
                return Ok((
                    anystate::no(tag, "Mailbox is read-only"),
                    Transition::None,
                ));
            }
            match view.do_move(&ctx.storage, set, mailbox, *uid).await {
                Ok(expunged) => Ok((
                    Response::new(
                        expunged,
                        Status::ok(Some(tag.clone()), None, "MOVE completed"),
                    ),
                    Transition::None,
                )),
                Err(CopyError::TryCreate) => Ok((try_create(tag), Transition::None)),
                Err(CopyError::Other(e)) => Err(e),
            }
        }
        _ => authenticated::dispatch(ctx, principal, cmd).await,
    }
}

fn try_create(tag: &str) -> Response {
    Response::status(Status::no(
        Some(tag.to_string()),
        Some(Code::TryCreate),
        "No such mailbox",
    ))
}
