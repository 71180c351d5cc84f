//! Auth collaborator trait.

use cardstack_common::UserId;

/// Session lookup used to scope every remote call.
///
/// A `None` user is an authentication error at the point of use: the engine
/// surfaces it as `Error::Auth` and never retries it.
pub trait AuthProvider: Send + Sync {
    /// The currently signed-in user, if any.
    fn current_user_id(&self) -> Option<UserId>;
}
