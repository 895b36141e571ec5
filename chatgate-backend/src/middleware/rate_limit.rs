use crate::error::ChatError;
use crate::models::Identity;
use crate::rate_limit::{Admission, LimitScope, RateLimiter};

/// Admit one request or turn the rejection into a `ChatError`.
///
/// A store failure fails closed (503) instead of letting traffic through.
pub async fn enforce(
    limiter: &RateLimiter,
    scope: LimitScope,
    identity: &Identity,
) -> Result<Admission, ChatError> {
    let admission = limiter.check_and_admit(scope, identity).await?;
    if admission.allowed {
        return Ok(admission);
    }

    Err(ChatError::RateLimited {
        limit: admission.limit.unwrap_or_default(),
        remaining: admission.remaining,
        retry_after_secs: limiter.config().window.as_secs(),
    })
}
