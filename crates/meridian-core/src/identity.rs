/// Authenticated caller, as resolved by the relay layer
///
/// The core never authenticates; it receives the already-validated
/// identity together with the group the request was addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// User identifier
    pub user_id: i64,
    /// Display name, carried into sticky-session bindings
    pub username: String,
    /// The user's own group (e.g. "default", "vip")
    pub user_group: String,
    /// Whether the caller holds an admin role
    pub is_admin: bool,
    /// Whether the caller is exempt from the risk guard
    pub risk_exempt: bool,
}

/// API token the request was made with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// Token identifier
    pub token_id: i64,
    /// Token display name, carried into sticky-session bindings
    pub token_name: String,
    /// Remaining quota on the token at request time
    pub remain_quota: i64,
    /// Unlimited tokens skip the remaining-quota check but still
    /// have their balance adjusted
    pub unlimited: bool,
}
