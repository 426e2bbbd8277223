use anyhow::{anyhow, Result};
use tracing::error;

use crate::imap::command::{anonymous, anystate, authenticated, selected, ServerContext};
use crate::imap::flow::{State, Transition};
use crate::imap::grammar::{Command, CommandBody};
use crate::imap::response::{Body, Response, Status};

/// What the network loop must do with a finished command.
pub enum Action {
    Respond(Response),
    /// Send the response, then upgrade the stream to TLS.
    StartTls(Response),
    /// Send `+ idling` and enter the IDLE loop.
    Idle { tag: String },
    /// Send the response (it carries the BYE) and close.
    Logout(Response),
}

/// One connection's protocol state machine, independent of the socket.
pub struct Instance {
    pub ctx: ServerContext,
    pub state: State,
}

impl Instance {
    pub fn new(ctx: ServerContext) -> Self {
        Instance {
            ctx,
            state: State::NotAuthenticated,
        }
    }

    /// The (user, folder) pair of the selected mailbox, if any.
    pub fn selected_mailbox(&self) -> Option<(String, String)> {
        match &self.state {
            State::Selected(_, view, _) => Some((view.user.clone(), view.folder.clone())),
            _ => None,
        }
    }

    pub async fn execute(&mut self, cmd: Command) -> Action {
        // Commands that the network loop must see are intercepted
        // before state dispatch.
        match &cmd.body {
            CommandBody::StartTls => {
                let resp = if self.ctx.caps.starttls {
                    Action::StartTls(Response::status(Status::ok(
                        Some(cmd.tag.clone()),
                        None,
                        "Begin TLS negotiation now",
                    )))
                } else {
                    Action::Respond(anystate::no(&cmd.tag, "TLS is not available"))
                };
                return resp;
            }
            CommandBody::Idle => {
                return match self.state {
                    State::Selected(..) => Action::Idle {
                        tag: cmd.tag.clone(),
                    },
                    _ => Action::Respond(anystate::no(&cmd.tag, "IDLE requires a selected mailbox")),
                };
            }
            _ => {}
        }

        let result = match &mut self.state {
            State::NotAuthenticated => anonymous::dispatch(&self.ctx, &cmd).await,
            State::Authenticated(principal) => {
                let principal = principal.clone();
                authenticated::dispatch(&self.ctx, &principal, &cmd).await
            }
            State::Selected(principal, view, perm) => {
                let principal = principal.clone();
                let perm = *perm;
                selected::dispatch(&self.ctx, &principal, view, perm, &cmd).await
            }
            State::Logout => Ok((
                anystate::bad(&cmd.tag, "No commands are allowed in the LOGOUT state"),
                Transition::None,
            )),
        };

        let (response, transition) = match result {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = ?e, command = ?cmd.body, "command failed");
                (
                    anystate::no(&cmd.tag, "Internal error while processing command"),
                    Transition::None,
                )
            }
        };

        let logging_out = matches!(transition, Transition::Logout);
        if let Err(e) = self.state.apply(transition) {
            error!(error = %e, "illegal state transition");
            return Action::Respond(anystate::bad(
                &cmd.tag,
                "Command triggered an illegal state transition",
            ));
        }
        if logging_out {
            Action::Logout(response)
        } else {
            Action::Respond(response)
        }
    }

    /// Untagged updates for the idling client.
    pub async fn poll_idle(&mut self) -> Result<Vec<Body>> {
        let auto_seen = self.ctx.auto_seen;
        let storage = self.ctx.storage.clone();
        match &mut self.state {
            State::Selected(_, view, _) => view.poll_updates(&storage, auto_seen).await,
            _ => Err(anyhow!("not idling on a mailbox")),
        }
    }
}
