use std::future::Future;

use crate::error::{ServiceError, ServiceResult};

/// Connect with the Azure AD credential first; if that is rejected as
/// unauthorized or forbidden, connect exactly once more with a shared key.
///
/// Any other failure of the AAD attempt is returned as-is and the key attempt
/// never runs. If the key attempt fails too, the error names both attempts.
pub async fn with_key_fallback<T, A, FA, K, FK>(target: &str, aad: A, key: K) -> ServiceResult<T>
where
    A: FnOnce() -> FA,
    FA: Future<Output = ServiceResult<T>>,
    K: FnOnce() -> FK,
    FK: Future<Output = ServiceResult<T>>,
{
    let aad_err = match aad().await {
        Ok(value) => return Ok(value),
        Err(e) if e.kind().is_auth_failure() => e,
        Err(e) => return Err(e),
    };

    tracing::warn!(
        target_resource = target,
        error = %aad_err,
        "Azure AD credential rejected; retrying with shared key"
    );

    key().await.map_err(|key_err| {
        ServiceError::new(
            key_err.kind(),
            format!(
                "connecting to {target} failed with the Azure AD credential ({aad_err}) \
                 and with the shared key ({key_err})"
            ),
        )
    })
}
