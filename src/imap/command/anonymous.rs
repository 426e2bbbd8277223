//! Pre-authentication dispatch: LOGIN and AUTHENTICATE.

use anyhow::Result;
use base64::Engine;
use tracing::{debug, info};

use crate::auth::AuthError;
use crate::imap::command::{anystate, ServerContext};
use crate::imap::flow::Transition;
use crate::imap::grammar::{Command, CommandBody};
use crate::imap::response::{Code, Response, Status};

pub async fn dispatch(ctx: &ServerContext, cmd: &Command) -> Result<(Response, Transition)> {
    if let Some(response) = anystate::dispatch(cmd, ctx.caps) {
        let transition = match cmd.body {
            CommandBody::Logout => Transition::Logout,
            _ => Transition::None,
        };
        return Ok((response, transition));
    }

    match &cmd.body {
        CommandBody::Login { user, password } => login(ctx, &cmd.tag, user, password),
        CommandBody::Authenticate { mechanism, initial } => {
            authenticate(ctx, &cmd.tag, mechanism, initial.as_deref())
        }
        _ => Ok((
            anystate::no(&cmd.tag, "Please authenticate first"),
            Transition::None,
        )),
    }
}

fn login(
    ctx: &ServerContext,
    tag: &str,
    user: &str,
    password: &str,
) -> Result<(Response, Transition)> {
    if ctx.caps.login_disabled {
        return Ok((
            anystate::no(tag, "LOGIN is disabled until STARTTLS"),
            Transition::None,
        ));
    }
    finish(ctx, tag, user, password)
}

/// `AUTHENTICATE PLAIN` with the initial response already collected by
/// the session's continuation handling.
fn authenticate(
    ctx: &ServerContext,
    tag: &str,
    mechanism: &str,
    initial: Option<&str>,
) -> Result<(Response, Transition)> {
    if mechanism != "PLAIN" {
        return Ok((
            anystate::no(tag, "Unsupported authentication mechanism"),
            Transition::None,
        ));
    }
    if ctx.caps.login_disabled {
        return Ok((
            anystate::no(tag, "Authentication is disabled until STARTTLS"),
            Transition::None,
        ));
    }
    let payload = match initial {
        Some(p) => p,
        None => {
            return Ok((
                anystate::bad(tag, "Missing SASL initial response"),
                Transition::None,
            ))
        }
    };
    let decoded = match base64::engine::general_purpose::STANDARD.decode(payload.as_bytes()) {
        Ok(d) => d,
        Err(_) => return Ok((anystate::bad(tag, "Invalid base64"), Transition::None)),
    };
    // authzid NUL authcid NUL password
    let mut parts = decoded.splitn(3, |&b| b == 0);
    let (user, pass) = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(u), Some(p)) => (
            String::from_utf8_lossy(u).into_owned(),
            String::from_utf8_lossy(p).into_owned(),
        ),
        _ => {
            return Ok((
                anystate::bad(tag, "Malformed AUTHENTICATE PLAIN payload"),
                Transition::None,
            ))
        }
    };
    finish(ctx, tag, &user, &pass)
}

fn finish(
    ctx: &ServerContext,
    tag: &str,
    user: &str,
    secret: &str,
) -> Result<(Response, Transition)> {
    match ctx.auth.authenticate(user, secret) {
        Ok(principal) => {
            info!(user = %principal.email, "imap authenticated");
            Ok((
                anystate::ok(tag, "Authentication successful"),
                Transition::Authenticate(principal),
            ))
        }
        Err(AuthError::TotpRequired) => Ok((
            Response::status(Status::no(
                Some(tag.to_string()),
                Some(Code::AuthenticationFailed),
                "TOTP code required",
            )),
            Transition::None,
        )),
        Err(e) => {
            debug!(user, error = %e, "imap authentication failed");
            Ok((
                Response::status(Status::no(
                    Some(tag.to_string()),
                    Some(Code::AuthenticationFailed),
                    "Authentication failed",
                )),
                Transition::None,
            ))
        }
    }
}
