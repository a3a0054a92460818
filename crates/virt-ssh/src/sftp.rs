//! SFTP upload over an established client

use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::AsyncWriteExt;

use crate::client::SshClient;
use crate::error::{Result, SshError};

impl SshClient {
    /// Write `data` to `remote_path`, creating missing parent directories
    /// and applying `mode` explicitly.
    pub async fn upload(&self, data: &[u8], remote_path: &str, mode: u32) -> Result<()> {
        let channel = self.open_session().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::Sftp(format!("subsystem request failed: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Sftp(format!("session failed: {}", e)))?;

        if let Some(parent) = std::path::Path::new(remote_path).parent() {
            let mut built = String::new();
            for component in parent.iter() {
                let part = component.to_string_lossy();
                if part == "/" {
                    continue;
                }
                built.push('/');
                built.push_str(&part);
                // Existing directories are fine
                let _ = sftp.create_dir(&built).await;
            }
        }

        let mut file = sftp
            .create(remote_path)
            .await
            .map_err(|e| SshError::Sftp(format!("open failed: {}", e)))?;
        file.write_all(data)
            .await
            .map_err(|e| SshError::Sftp(format!("write failed: {}", e)))?;
        file.shutdown()
            .await
            .map_err(|e| SshError::Sftp(format!("flush failed: {}", e)))?;

        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        sftp.set_metadata(remote_path, attrs)
            .await
            .map_err(|e| SshError::Sftp(format!("chmod failed: {}", e)))?;

        Ok(())
    }
}
