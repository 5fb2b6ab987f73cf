//! Resolution of the user that will own the extracted tree.

use nix::unistd::{Uid, User};

use crate::{Error, Result};

/// A resolved local user.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Identity {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
}

impl Identity {
    /// Resolves `name`, or the calling user when `name` is empty.
    pub fn resolve(name: &str) -> Result<Self> {
        if name.is_empty() {
            Self::current()
        } else {
            Self::lookup(name)
        }
    }

    /// The user the process is running as.
    pub fn current() -> Result<Self> {
        let uid = Uid::current();
        match User::from_uid(uid) {
            Ok(Some(user)) => Ok(user.into()),
            Ok(None) => Err(Error::User(format!("no passwd entry for uid {uid}"))),
            Err(e) => Err(Error::User(format!("uid {uid}: {e}"))),
        }
    }

    /// Looks a user up by login name.
    pub fn lookup(name: &str) -> Result<Self> {
        match User::from_name(name) {
            Ok(Some(user)) => Ok(user.into()),
            Ok(None) => Err(Error::User(format!("unknown user {name}"))),
            Err(e) => Err(Error::User(format!("{name}: {e}"))),
        }
    }
}

impl From<User> for Identity {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_matches_process_uid() {
        let me = Identity::current().unwrap();
        assert_eq!(me.uid, Uid::current().as_raw());
        assert_eq!(Identity::resolve("").unwrap(), me);
    }

    #[test]
    fn lookup_by_name_round_trips() {
        let me = Identity::current().unwrap();
        assert_eq!(Identity::lookup(&me.name).unwrap().uid, me.uid);
    }

    #[test]
    fn unknown_user_is_an_error() {
        let err = Identity::lookup("strata-no-such-user-x9").unwrap_err();
        assert!(matches!(err, Error::User(_)));
    }
}
