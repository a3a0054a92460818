//! Dual-path execution: API preferred, SSH fallback, gated per backend
//!
//! ```text
//! api_only  → API; API failure is final
//! ssh_only  → SSH
//! auto      → API when credentials exist; any API failure falls through to SSH
//! ```

use futures_util::future::BoxFuture;
use tracing::warn;
use virt_types::ExecutionRule;

use crate::error::{DriverError, Result};

/// Resolved execution path for one mutating call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPath {
    ApiOnly,
    SshOnly,
    ApiThenSsh,
}

pub fn resolve_path(rule: ExecutionRule, has_api_credentials: bool) -> ExecPath {
    match rule {
        ExecutionRule::SshOnly => ExecPath::SshOnly,
        ExecutionRule::ApiOnly => ExecPath::ApiOnly,
        ExecutionRule::Auto => {
            if has_api_credentials {
                ExecPath::ApiThenSsh
            } else {
                ExecPath::SshOnly
            }
        }
    }
}

/// Drive one operation through the policy. `api` and `ssh` are only invoked
/// when the resolved path calls for them.
pub async fn run_dual<'a, T>(
    rule: ExecutionRule,
    has_api_credentials: bool,
    operation: &str,
    api: impl FnOnce() -> BoxFuture<'a, Result<T>>,
    ssh: impl FnOnce() -> BoxFuture<'a, Result<T>>,
) -> Result<T> {
    match resolve_path(rule, has_api_credentials) {
        ExecPath::SshOnly => ssh().await,
        ExecPath::ApiOnly => {
            if !has_api_credentials {
                return Err(DriverError::Validation(format!(
                    "execution rule api_only but no API credentials configured ({})",
                    operation
                )));
            }
            api().await
        }
        ExecPath::ApiThenSsh => match api().await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(operation, error = %e, "API path failed, falling back to SSH");
                ssh().await
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_api<'a>() -> BoxFuture<'a, Result<&'static str>> {
        Box::pin(async { Ok("api") })
    }

    fn err_api<'a>() -> BoxFuture<'a, Result<&'static str>> {
        Box::pin(async { Err(DriverError::Transient("api down".into())) })
    }

    fn ok_ssh<'a>() -> BoxFuture<'a, Result<&'static str>> {
        Box::pin(async { Ok("ssh") })
    }

    #[tokio::test]
    async fn auto_prefers_api() {
        let out = run_dual(ExecutionRule::Auto, true, "op", ok_api, ok_ssh)
            .await
            .unwrap();
        assert_eq!(out, "api");
    }

    #[tokio::test]
    async fn auto_falls_back_on_api_failure() {
        let out = run_dual(ExecutionRule::Auto, true, "op", err_api, ok_ssh)
            .await
            .unwrap();
        assert_eq!(out, "ssh");
    }

    #[tokio::test]
    async fn auto_without_credentials_goes_straight_to_ssh() {
        let out = run_dual(ExecutionRule::Auto, false, "op", err_api, ok_ssh)
            .await
            .unwrap();
        assert_eq!(out, "ssh");
    }

    #[tokio::test]
    async fn api_only_failure_is_final() {
        let err = run_dual(ExecutionRule::ApiOnly, true, "op", err_api, ok_ssh)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Transient(_)));
    }

    #[tokio::test]
    async fn api_only_without_credentials_is_a_validation_error() {
        let err = run_dual(ExecutionRule::ApiOnly, false, "op", ok_api, ok_ssh)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
    }

    #[tokio::test]
    async fn ssh_only_never_touches_api() {
        let out = run_dual(ExecutionRule::SshOnly, true, "op", err_api, ok_ssh)
            .await
            .unwrap();
        assert_eq!(out, "ssh");
    }
}
