use crate::auth::Principal;
use crate::imap::mailbox_view::MailboxView;

/// RFC 3501 section 3 connection states. Commands are dispatched on
/// the current state and produce a transition applied afterwards.
pub enum State {
    NotAuthenticated,
    Authenticated(Principal),
    Selected(Principal, MailboxView, Permission),
    Logout,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

pub enum Transition {
    None,
    Authenticate(Principal),
    Select(MailboxView, Permission),
    Unselect,
    Logout,
}

#[derive(Debug, thiserror::Error)]
#[error("forbidden state transition")]
pub struct ForbiddenTransition;

impl State {
    pub fn apply(&mut self, transition: Transition) -> Result<(), ForbiddenTransition> {
        let old = std::mem::replace(self, State::Logout);
        let new = match (old, transition) {
            (state, Transition::None) => state,
            (State::NotAuthenticated, Transition::Authenticate(principal)) => {
                State::Authenticated(principal)
            }
            (
                State::Authenticated(principal) | State::Selected(principal, ..),
                Transition::Select(view, perm),
            ) => State::Selected(principal, view, perm),
            (State::Selected(principal, ..), Transition::Unselect) => {
                State::Authenticated(principal)
            }
            (_, Transition::Logout) => State::Logout,
            (state, _) => {
                *self = state;
                return Err(ForbiddenTransition);
            }
        };
        *self = new;
        Ok(())
    }
}
