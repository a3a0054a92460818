//! Per-backend health checker
//!
//! The checker either owns its SSH client or borrows the orchestrator's.
//! Owned mode closes and redials before every check so a stale client never
//! reports on the wrong host after an IP change. Borrowed mode never dials:
//! that guarantee is what lets a single orchestrator SSH channel be trusted
//! as "the correct node".

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use virt_ssh::{SshClient, SshTarget};
use virt_types::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Partial,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub ok: bool,
    pub duration_ms: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub status: HealthState,
    pub checks: Vec<CheckResult>,
    pub hostname: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// API reachability probe target
#[derive(Debug, Clone)]
pub struct ApiProbe {
    pub url: String,
    pub insecure: bool,
}

enum SshAccess {
    Disabled,
    /// Closed and redialed before each check; closed on `close()`
    Owned {
        target: SshTarget,
        client: Option<Arc<SshClient>>,
    },
    /// Never dialed, never closed here
    Borrowed { client: Option<Arc<SshClient>> },
}

pub struct HealthChecker {
    kind: BackendKind,
    // One session at a time per client: held across check + hostname read
    ssh: Mutex<SshAccess>,
    api: Option<ApiProbe>,
}

fn service_command(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Proxmox => "pveversion && systemctl is-active pvedaemon pveproxy pvestatd",
        BackendKind::Docker => "docker version",
        BackendKind::Lxd => "lxc info",
        BackendKind::Incus => "incus info",
    }
}

impl HealthChecker {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            ssh: Mutex::new(SshAccess::Disabled),
            api: None,
        }
    }

    pub fn with_owned_ssh(self, target: SshTarget) -> Self {
        Self {
            ssh: Mutex::new(SshAccess::Owned {
                target,
                client: None,
            }),
            ..self
        }
    }

    pub fn with_borrowed_ssh(self, client: Arc<SshClient>) -> Self {
        Self {
            ssh: Mutex::new(SshAccess::Borrowed {
                client: Some(client),
            }),
            ..self
        }
    }

    pub fn with_api(mut self, url: impl Into<String>, insecure: bool) -> Self {
        self.api = Some(ApiProbe {
            url: url.into(),
            insecure,
        });
        self
    }

    /// Run every enabled probe and fold the verdict.
    pub async fn check(&self) -> HealthResult {
        let mut access = self.ssh.lock().await;
        let mut checks = Vec::new();

        let client = self.ssh_client_for_check(&mut access).await;

        match &client {
            Ok(Some(client)) => {
                checks
                    .push(Self::timed("ssh", async { client.ping().await.map(|_| String::new()) }).await);
                checks.push(
                    Self::timed("service", async {
                        let out = client.execute(service_command(self.kind)).await?;
                        if out.success() {
                            Ok(out.output)
                        } else {
                            Err(virt_ssh::SshError::SessionFailed(format!(
                                "exit {}: {}",
                                out.exit_code, out.output
                            )))
                        }
                    })
                    .await,
                );
            }
            Ok(None) => {}
            Err(message) => {
                checks.push(CheckResult {
                    name: "ssh".to_string(),
                    ok: false,
                    duration_ms: 0,
                    message: message.clone(),
                });
                checks.push(CheckResult {
                    name: "service".to_string(),
                    ok: false,
                    duration_ms: 0,
                    message: "ssh unavailable".to_string(),
                });
            }
        }

        if let Some(api) = &self.api {
            checks.push(self.probe_api(api).await);
        }

        let status = Self::fold(&checks);

        // Hostname rides on the same locked client the checks used
        let hostname = match &client {
            Ok(Some(client)) => match client.execute("hostname").await {
                Ok(out) if out.success() && !out.output.is_empty() => {
                    Some(out.output.lines().last().unwrap_or("").trim().to_string())
                }
                _ => None,
            },
            _ => None,
        };

        drop(access);

        HealthResult {
            status,
            checks,
            hostname,
            checked_at: Utc::now(),
        }
    }

    async fn ssh_client_for_check(
        &self,
        access: &mut SshAccess,
    ) -> std::result::Result<Option<Arc<SshClient>>, String> {
        match access {
            SshAccess::Disabled => Ok(None),
            SshAccess::Borrowed { client } => Ok(client.clone()),
            SshAccess::Owned { target, client } => {
                // The old client may be pinned to an address the host no
                // longer resolves to
                if let Some(old) = client.take() {
                    old.close().await;
                }
                match SshClient::connect(target.clone()).await {
                    Ok(fresh) => {
                        *client = Some(fresh.clone());
                        Ok(Some(fresh))
                    }
                    Err(e) => {
                        warn!(host = %target.host, error = %e, "health checker redial failed");
                        Err(e.to_string())
                    }
                }
            }
        }
    }

    async fn timed<F>(name: &str, probe: F) -> CheckResult
    where
        F: std::future::Future<Output = std::result::Result<String, virt_ssh::SshError>>,
    {
        let started = Instant::now();
        let (ok, message) = match probe.await {
            Ok(message) => (true, message),
            Err(e) => (false, e.to_string()),
        };
        CheckResult {
            name: name.to_string(),
            ok,
            duration_ms: started.elapsed().as_millis() as u64,
            message,
        }
    }

    async fn probe_api(&self, api: &ApiProbe) -> CheckResult {
        let started = Instant::now();
        let outcome = async {
            let client = reqwest::Client::builder()
                .danger_accept_invalid_certs(api.insecure)
                .timeout(Duration::from_secs(30))
                .build()?;
            let response = client.get(&api.url).send().await?;
            Ok::<_, reqwest::Error>(response.status())
        }
        .await;

        match outcome {
            Ok(status) if status.is_success() || status.as_u16() == 401 => {
                // 401 still proves the API endpoint is alive
                CheckResult {
                    name: "api".to_string(),
                    ok: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                    message: format!("HTTP {}", status.as_u16()),
                }
            }
            Ok(status) => CheckResult {
                name: "api".to_string(),
                ok: false,
                duration_ms: started.elapsed().as_millis() as u64,
                message: format!("HTTP {}", status.as_u16()),
            },
            Err(e) => CheckResult {
                name: "api".to_string(),
                ok: false,
                duration_ms: started.elapsed().as_millis() as u64,
                message: e.to_string(),
            },
        }
    }

    /// healthy iff all enabled probes pass; partial iff some pass;
    /// unhealthy iff none pass; unknown iff none were enabled.
    fn fold(checks: &[CheckResult]) -> HealthState {
        if checks.is_empty() {
            return HealthState::Unknown;
        }
        let passed = checks.iter().filter(|c| c.ok).count();
        if passed == checks.len() {
            HealthState::Healthy
        } else if passed > 0 {
            HealthState::Partial
        } else {
            HealthState::Unhealthy
        }
    }

    /// Owned clients are closed; borrowed references are only dropped.
    pub async fn close(&self) {
        let mut access = self.ssh.lock().await;
        match &mut *access {
            SshAccess::Owned { client, .. } => {
                if let Some(client) = client.take() {
                    client.close().await;
                    debug!("health checker closed owned ssh client");
                }
            }
            SshAccess::Borrowed { client } => {
                client.take();
            }
            SshAccess::Disabled => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, ok: bool) -> CheckResult {
        CheckResult {
            name: name.to_string(),
            ok,
            duration_ms: 1,
            message: String::new(),
        }
    }

    #[test]
    fn fold_all_pass() {
        let checks = vec![check("ssh", true), check("api", true)];
        assert_eq!(HealthChecker::fold(&checks), HealthState::Healthy);
    }

    #[test]
    fn fold_some_pass() {
        let checks = vec![check("ssh", true), check("api", false)];
        assert_eq!(HealthChecker::fold(&checks), HealthState::Partial);
    }

    #[test]
    fn fold_none_pass() {
        let checks = vec![check("ssh", false), check("service", false)];
        assert_eq!(HealthChecker::fold(&checks), HealthState::Unhealthy);
    }

    #[test]
    fn fold_no_probes() {
        assert_eq!(HealthChecker::fold(&[]), HealthState::Unknown);
    }

    #[test]
    fn service_commands_per_backend() {
        assert!(service_command(BackendKind::Proxmox).starts_with("pveversion"));
        assert_eq!(service_command(BackendKind::Docker), "docker version");
        assert_eq!(service_command(BackendKind::Lxd), "lxc info");
        assert_eq!(service_command(BackendKind::Incus), "incus info");
    }

    #[tokio::test]
    async fn no_enabled_probes_yields_unknown() {
        let checker = HealthChecker::new(BackendKind::Docker);
        let result = checker.check().await;
        assert_eq!(result.status, HealthState::Unknown);
        assert!(result.checks.is_empty());
        assert!(result.hostname.is_none());
    }
}
