use meridian_core::UpstreamError;

/// Substring fingerprints of "session concurrency window full" style
/// upstream failures
///
/// Upstream adapters do not yet emit a structured code for this
/// condition, so classification is by message text.
const CONCURRENCY_PATTERNS: [&str; 6] = [
    "session concurrency",
    "concurrent session",
    "session window full",
    "too many sessions",
    "session limit exceeded",
    "max sessions reached",
];

/// Whether the failure indicates the channel's session-concurrency
/// window is full; channels that opt in are temporarily excluded
pub fn is_session_concurrency_error(error: &UpstreamError) -> bool {
    let message = error.message.to_lowercase();
    CONCURRENCY_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

const DISABLING_CODES: [&str; 4] = [
    "invalid_api_key",
    "account_deactivated",
    "billing_not_active",
    "pre_consume_token_quota_failed",
];

const DISABLING_TYPES: [&str; 5] = [
    "insufficient_quota",
    "insufficient_user_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];

/// Whether this failure should auto-disable the channel
///
/// Credential and account problems disable; transient failures and
/// caller-side errors (marked skip-retry by the adapter) do not. The
/// actual status flip is an external policy decision; this is only
/// the predicate.
pub fn should_disable_channel(error: &UpstreamError) -> bool {
    if error.skip_retry {
        return false;
    }
    if error.status == Some(401) {
        return true;
    }
    if let Some(code) = &error.code
        && DISABLING_CODES.contains(&code.as_str())
    {
        return true;
    }
    if let Some(error_type) = &error.error_type
        && DISABLING_TYPES.contains(&error_type.as_str())
    {
        return true;
    }
    false
}

/// Whether a successful probe should re-enable a channel: only
/// auto-disabled channels recover automatically, manual disables stay
pub fn should_enable_channel(error: Option<&UpstreamError>, auto_disabled: bool) -> bool {
    error.is_none() && auto_disabled
}
