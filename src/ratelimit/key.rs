//! Composite key for an identifier and the action it performs.

/// A key that uniquely identifies a rate limit counter.
///
/// Identifiers and actions are opaque and case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// The subject being limited (IP, username, API key)
    pub identifier: String,
    /// The operation category (login, join, password-reset)
    pub action: String,
}

impl LimitKey {
    /// Create a new limit key.
    pub fn new(identifier: &str, action: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            action: action.to_string(),
        }
    }

    /// The counter key in the distributed store.
    ///
    /// Counters live under their own namespace so an identifier can never
    /// collide with the block or whitelist keys of another identifier.
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!("{}counter:{}", prefix, self)
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.identifier, self.action)
    }
}
