use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use russh::client::{self, AuthResult, Handle};
use russh::ChannelMsg;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Result, SshError};

/// Reachability and credentials for one remote host.
///
/// At least one of `password` / `private_key` must be present; the key is
/// tried first with the password as fallback.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    /// PEM-encoded private key material (not a path)
    pub private_key: Option<String>,
    pub connect_timeout_secs: u64,
    pub execute_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: None,
            private_key: None,
            connect_timeout_secs: 30,
            execute_timeout_secs: 300,
            keepalive_interval_secs: 30,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }
}

/// Result of a remote command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// Self-signed and per-node host keys are the norm on these backends
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// True when the dialed peer address belongs to the configured host.
///
/// Shared health checkers carry clients for several nodes; running a command
/// on the wrong node is worse than failing, so the client fails closed.
pub fn peer_matches(peer: IpAddr, resolved: &[IpAddr]) -> bool {
    resolved.iter().any(|ip| *ip == peer)
}

async fn resolve_host_ips(host: &str, port: u16) -> Result<Vec<IpAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SshError::Resolve {
            host: host.to_string(),
            message: e.to_string(),
        })?;
    Ok(addrs.map(|a| a.ip()).collect())
}

fn wrap_command(cmd: &str) -> String {
    // Non-interactive sessions miss the login PATH; source the standard
    // scripts and extend PATH before running anything.
    format!(
        "source /etc/profile >/dev/null 2>&1; [ -f ~/.bashrc ] && source ~/.bashrc >/dev/null 2>&1; \
         export PATH=$PATH:/usr/local/bin:/snap/bin:/usr/sbin:/sbin; LANG=C {} 2>&1",
        cmd
    )
}

/// Async SSH client for one backend host.
///
/// Holds the russh handle behind a RwLock so a failed session can be
/// replaced without tearing down the wrapper other components hold.
pub struct SshClient {
    target: SshTarget,
    handle: RwLock<Option<Handle<ClientHandler>>>,
    healthy: AtomicBool,
    keepalive: StdMutex<Option<JoinHandle<()>>>,
}

impl SshClient {
    /// Dial, verify the peer address, authenticate, and start the keepalive.
    pub async fn connect(target: SshTarget) -> Result<Arc<Self>> {
        if target.password.is_none() && target.private_key.is_none() {
            return Err(SshError::NoCredentials {
                host: target.host.clone(),
            });
        }

        let handle = Self::dial(&target).await?;

        let client = Arc::new(Self {
            target,
            handle: RwLock::new(Some(handle)),
            healthy: AtomicBool::new(true),
            keepalive: StdMutex::new(None),
        });
        client.spawn_keepalive();
        Ok(client)
    }

    async fn dial(target: &SshTarget) -> Result<Handle<ClientHandler>> {
        let mut addrs = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|e| SshError::Resolve {
                host: target.host.clone(),
                message: e.to_string(),
            })?;
        let addr: SocketAddr = addrs.next().ok_or_else(|| SshError::Resolve {
            host: target.host.clone(),
            message: "no addresses".to_string(),
        })?;

        let expected = resolve_host_ips(&target.host, target.port).await?;
        if !peer_matches(addr.ip(), &expected) {
            return Err(SshError::PeerMismatch {
                host: target.host.clone(),
                actual: addr.ip(),
            });
        }

        let config = Arc::new(client::Config::default());
        let mut handle = timeout(
            Duration::from_secs(target.connect_timeout_secs),
            client::connect(config, addr, ClientHandler),
        )
        .await
        .map_err(|_| SshError::ConnectTimeout {
            host: target.host.clone(),
            port: target.port,
            seconds: target.connect_timeout_secs,
        })??;

        // Key first, password as fallback
        let mut authenticated = false;
        if let Some(key_data) = &target.private_key {
            let secret_key = russh::keys::decode_secret_key(key_data, None)
                .map_err(|e| SshError::KeyInvalid(e.to_string()))?;
            let key_with_alg =
                russh::keys::PrivateKeyWithHashAlg::new(Arc::new(secret_key), None);
            match handle
                .authenticate_publickey(&target.username, key_with_alg)
                .await
            {
                Ok(AuthResult::Success) => authenticated = true,
                Ok(_) => debug!(host = %target.host, "publickey auth rejected, trying password"),
                Err(e) => debug!(host = %target.host, error = %e, "publickey auth errored, trying password"),
            }
        }
        if !authenticated {
            if let Some(password) = &target.password {
                let result = handle
                    .authenticate_password(&target.username, password)
                    .await?;
                if matches!(result, AuthResult::Success) {
                    authenticated = true;
                }
            }
        }
        if !authenticated {
            return Err(SshError::AuthFailed {
                username: target.username.clone(),
            });
        }

        Ok(handle)
    }

    fn spawn_keepalive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.target.keepalive_interval_secs);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = weak.upgrade() else { break };
                if let Err(e) = client.ping().await {
                    warn!(
                        host = %client.target.host,
                        error = %e,
                        "ssh keepalive failed, marking client unhealthy"
                    );
                    client.healthy.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });
        *self.keepalive.lock().unwrap() = Some(task);
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Cheap round trip used by the keepalive loop
    pub async fn ping(&self) -> Result<()> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(SshError::NotConnected)?;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::SessionFailed(e.to_string()))?;
        channel.exec(true, &b"true"[..]).await?;
        while channel.wait().await.is_some() {}
        Ok(())
    }

    /// Run a command under the default execute timeout.
    pub async fn execute(&self, cmd: &str) -> Result<CommandOutput> {
        self.execute_with_timeout(cmd, Duration::from_secs(self.target.execute_timeout_secs))
            .await
    }

    /// Run a command, killing the remote session when the deadline passes.
    ///
    /// A dead session layer gets one transparent reconnect and retry.
    pub async fn execute_with_timeout(
        &self,
        cmd: &str,
        deadline: Duration,
    ) -> Result<CommandOutput> {
        match self.run_once(cmd, deadline).await {
            Err(SshError::SessionFailed(reason)) => {
                debug!(host = %self.target.host, %reason, "session open failed, reconnecting once");
                self.reconnect().await?;
                self.run_once(cmd, deadline).await
            }
            other => other,
        }
    }

    async fn run_once(&self, cmd: &str, deadline: Duration) -> Result<CommandOutput> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(SshError::NotConnected)?;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::SessionFailed(e.to_string()))?;

        channel.request_pty(false, "xterm", 80, 40, 0, 0, &[]).await?;
        channel.exec(true, wrap_command(cmd).as_bytes()).await?;

        let mut output: Vec<u8> = Vec::new();
        let mut exit_code: Option<i32> = None;
        let limit = tokio::time::Instant::now() + deadline;

        loop {
            let remaining = limit.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                // Kill the remote process; the channel dies with it
                let _ = channel.signal(russh::Sig::KILL).await;
                return Err(SshError::ExecuteTimeout {
                    command: cmd.to_string(),
                    seconds: deadline.as_secs(),
                });
            }
            match timeout(remaining, channel.wait()).await {
                Ok(Some(ChannelMsg::Data { ref data })) => output.extend_from_slice(data),
                Ok(Some(ChannelMsg::ExtendedData { ref data, .. })) => {
                    output.extend_from_slice(data)
                }
                Ok(Some(ChannelMsg::ExitStatus { exit_status })) => {
                    exit_code = Some(exit_status as i32)
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    let _ = channel.signal(russh::Sig::KILL).await;
                    return Err(SshError::ExecuteTimeout {
                        command: cmd.to_string(),
                        seconds: deadline.as_secs(),
                    });
                }
            }
        }

        let mut text = String::from_utf8_lossy(&output).into_owned();
        while text.ends_with('\n') || text.ends_with('\r') {
            text.pop();
        }
        Ok(CommandOutput {
            exit_code: exit_code.unwrap_or(0),
            output: text,
        })
    }

    /// Replace the underlying handle with a fresh dial.
    pub async fn reconnect(&self) -> Result<()> {
        let fresh = Self::dial(&self.target).await?;
        let mut guard = self.handle.write().await;
        if let Some(old) = guard.take() {
            let _ = old
                .disconnect(russh::Disconnect::ByApplication, "", "English")
                .await;
        }
        *guard = Some(fresh);
        self.healthy.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Drop the connection and stop the keepalive.
    pub async fn close(&self) {
        if let Some(task) = self.keepalive.lock().unwrap().take() {
            task.abort();
        }
        let mut guard = self.handle.write().await;
        if let Some(handle) = guard.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "English")
                .await;
        }
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn open_session(
        &self,
    ) -> Result<russh::Channel<client::Msg>> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(SshError::NotConnected)?;
        handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::SessionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_match_exact() {
        let resolved: Vec<IpAddr> = vec!["10.0.0.5".parse().unwrap(), "10.0.0.6".parse().unwrap()];
        assert!(peer_matches("10.0.0.5".parse().unwrap(), &resolved));
        assert!(!peer_matches("10.0.0.7".parse().unwrap(), &resolved));
    }

    #[test]
    fn peer_match_empty_resolution_fails_closed() {
        assert!(!peer_matches("10.0.0.5".parse().unwrap(), &[]));
    }

    #[test]
    fn wrapped_command_extends_path() {
        let wrapped = wrap_command("qm list");
        assert!(wrapped.contains("/usr/local/bin:/snap/bin:/usr/sbin:/sbin"));
        assert!(wrapped.ends_with("qm list 2>&1"));
    }

    #[test]
    fn target_requires_credentials() {
        let target = SshTarget::new("10.0.0.1", 22, "root");
        let err = tokio_test::block_on(SshClient::connect(target)).unwrap_err();
        assert!(matches!(err, SshError::NoCredentials { .. }));
    }

    #[test]
    fn command_output_success() {
        let out = CommandOutput {
            exit_code: 0,
            output: String::new(),
        };
        assert!(out.success());
    }
}
