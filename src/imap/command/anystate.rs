//! Commands valid in every state.

use crate::imap::capability::ServerCapability;
use crate::imap::grammar::{Command, CommandBody};
use crate::imap::response::{Body, Data, Response, Status};

/// Handle CAPABILITY / NOOP / LOGOUT if the command is one of them.
/// LOGOUT's response carries the BYE; the caller closes afterwards.
pub fn dispatch(cmd: &Command, caps: ServerCapability) -> Option<Response> {
    match &cmd.body {
        CommandBody::Capability => Some(Response::new(
            vec![Body::Data(Data::Capability(caps.to_vec()))],
            Status::ok(Some(cmd.tag.clone()), None, "CAPABILITY completed"),
        )),
        CommandBody::Noop => Some(Response::status(Status::ok(
            Some(cmd.tag.clone()),
            None,
            "NOOP completed",
        ))),
        CommandBody::Logout => Some(Response::new(
            vec![Body::Status(Status::bye("Logging out"))],
            Status::ok(Some(cmd.tag.clone()), None, "LOGOUT completed"),
        )),
        _ => None,
    }
}

pub fn bad(tag: &str, text: &str) -> Response {
    Response::status(Status::bad(Some(tag.to_string()), None, text))
}

pub fn no(tag: &str, text: &str) -> Response {
    Response::status(Status::no(Some(tag.to_string()), None, text))
}

pub fn ok(tag: &str, text: &str) -> Response {
    Response::status(Status::ok(Some(tag.to_string()), None, text))
}
