//! User identity domain model

use serde::{Deserialize, Serialize};

/// An authenticated user as seen by the offline ledger
///
/// Created on the first successful login after process start and never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: i64,
    pub username: String,
}

impl UserIdentity {
    pub fn new(user_id: i64, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_creation() {
        let identity = UserIdentity::new(42, "alice");
        assert_eq!(identity.user_id, 42);
        assert_eq!(identity.username, "alice");
    }
}
