//! Scope-based visibility between sessions.
//!
//! Every session is created with an [`Access`] describing who is on the
//! other end and which scopes it may read.  Every inbound message is stamped
//! with the receiving session's scope.  Before delivering a message the
//! target session asks its [`ScopePolicy`] whether the message's scope is
//! visible to it.

/// Identity and visibility of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Access {
    /// Login or peer description; informational only.
    pub user: String,
    /// Scope stamped on every message received from this session.
    pub scope: String,
    /// Additional scopes this session may read.  `*` reads everything.
    pub read_scopes: Vec<String>,
}

impl Access {
    pub fn new(user: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            scope: scope.into(),
            read_scopes: Vec::new(),
        }
    }

    pub fn with_read_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }
}

/// Decides whether a session may see messages of a given scope.
///
/// Messages produced by the relay itself never reach the policy.
#[cfg_attr(test, mockall::automock)]
pub trait ScopePolicy: Send + Sync {
    fn can_see(&self, access: &Access, scope: &str) -> bool;
}

/// Visibility rules used unless a deployment supplies its own policy:
///
/// - the empty scope and `broadcast` are visible to everyone;
/// - a session sees its own scope;
/// - a read scope of `*`, or one naming the scope, grants visibility.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultScopePolicy;

impl ScopePolicy for DefaultScopePolicy {
    fn can_see(&self, access: &Access, scope: &str) -> bool {
        scope.is_empty()
            || scope == cot_core::domain::BROADCAST_SCOPE
            || scope == access.scope
            || access.read_scopes.iter().any(|s| s == "*" || s == scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unscoped_and_broadcast_are_public() {
        let access = Access::new("alice", "blue");
        assert!(DefaultScopePolicy.can_see(&access, ""));
        assert!(DefaultScopePolicy.can_see(&access, "broadcast"));
    }

    #[test]
    fn test_own_scope_is_visible() {
        let access = Access::new("alice", "blue");
        assert!(DefaultScopePolicy.can_see(&access, "blue"));
        assert!(!DefaultScopePolicy.can_see(&access, "red"));
    }

    #[test]
    fn test_read_scopes_grant_visibility() {
        let access = Access::new("ops", "blue").with_read_scopes(["red"]);
        assert!(DefaultScopePolicy.can_see(&access, "red"));
        assert!(!DefaultScopePolicy.can_see(&access, "green"));

        let admin = Access::new("admin", "").with_read_scopes(["*"]);
        assert!(DefaultScopePolicy.can_see(&admin, "green"));
    }

    #[test]
    fn test_unscoped_session_sees_only_public() {
        let access = Access::default();
        assert!(DefaultScopePolicy.can_see(&access, ""));
        assert!(!DefaultScopePolicy.can_see(&access, "blue"));
    }

    #[test]
    fn test_mock_policy_records_queries() {
        let mut policy = MockScopePolicy::new();
        policy
            .expect_can_see()
            .withf(|access, scope| access.scope == "blue" && scope == "red")
            .times(1)
            .return_const(false);
        assert!(!policy.can_see(&Access::new("a", "blue"), "red"));
    }
}
