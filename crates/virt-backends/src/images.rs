//! Remote image cache for the LXD/Incus family
//!
//! Images are downloaded *on the backend host* with curl resume/retry and a
//! hash-derived file name, so two concurrent creates of the same image pull
//! it once. Archives may be a .zip wrapper, a split (metadata.tar.xz +
//! rootfs.squashfs) pair, or a unified tarball.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use virt_ssh::SshClient;
use virt_types::InstanceKind;

use crate::driver::ImageSource;
use crate::error::{DriverError, Result};

/// Aliases created by this control plane carry a recognisable prefix so
/// sweeps never touch operator-managed images.
pub const IMAGE_ALIAS_PREFIX: &str = "oneclickvirt_";

const CDN_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stable identity of (url, architecture, instance kind)
pub fn image_hash(url: &str, architecture: &str, kind: InstanceKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(architecture.as_bytes());
    hasher.update(kind.as_str().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

pub fn image_alias(image: &ImageSource) -> String {
    format!(
        "{}{}",
        IMAGE_ALIAS_PREFIX,
        image_hash(&image.url, &image.architecture, image.instance_kind)
    )
}

/// `/usr/local/bin/{lxd|incus}_{vm|ct}_images`
pub fn cache_dir(cli: &str, kind: InstanceKind) -> String {
    let kind_dir = match kind {
        InstanceKind::Vm => "vm",
        InstanceKind::Container => "ct",
    };
    format!("/usr/local/bin/{}_{}_images", cli, kind_dir)
}

fn archive_file_name(image: &ImageSource) -> String {
    let hash = image_hash(&image.url, &image.architecture, image.instance_kind);
    // Keep the original extension so zip detection stays cheap
    let ext = image
        .url
        .rsplit('/')
        .next()
        .and_then(|tail| tail.split_once('.').map(|(_, ext)| ext.to_string()))
        .unwrap_or_else(|| "tar.xz".to_string());
    format!("{}.{}", hash, ext)
}

/// Probe candidate CDN endpoints with a HEAD request; the first one
/// answering 200 prefixes the download URL. No candidate → raw URL.
pub async fn resolve_download_url(endpoints: &[String], url: &str) -> String {
    if endpoints.is_empty() {
        return url.to_string();
    }
    let client = match reqwest::Client::builder()
        .timeout(CDN_PROBE_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .build()
    {
        Ok(client) => client,
        Err(_) => return url.to_string(),
    };
    for endpoint in endpoints {
        let candidate = format!("{}{}", endpoint.trim_end_matches('/'), prefix_path(url));
        match client.head(&candidate).send().await {
            Ok(response) if response.status().as_u16() == 200 => {
                debug!(endpoint, "cdn endpoint selected");
                return candidate;
            }
            _ => continue,
        }
    }
    url.to_string()
}

fn prefix_path(url: &str) -> String {
    // CDN mirrors take the full origin URL as the path component
    format!("/{}", url.trim_start_matches('/'))
}

/// Remote-side image ensure for one LXD/Incus flavour
pub struct RemoteImageStore {
    cli: &'static str,
}

impl RemoteImageStore {
    pub fn new(cli: &'static str) -> Self {
        Self { cli }
    }

    /// Returns the alias usable in `<cli> launch`, importing first if the
    /// backend does not have it yet.
    pub async fn ensure(
        &self,
        ssh: &SshClient,
        image: &ImageSource,
        cdn_endpoints: &[String],
    ) -> Result<String> {
        let alias = image_alias(image);

        let existing = ssh
            .execute(&format!("{} image info {}", self.cli, alias))
            .await?;
        if existing.success() {
            debug!(alias, "image already imported");
            return Ok(alias);
        }

        let dir = cache_dir(self.cli, image.instance_kind);
        let file = archive_file_name(image);
        let url = resolve_download_url(cdn_endpoints, &image.url).await;

        ssh.execute(&format!("mkdir -p {}", dir)).await?;

        info!(alias, url = %url, "downloading image on remote host");
        let download = ssh
            .execute(&format!(
                "cd {dir} && curl -L -C - --retry 5 --retry-delay 10 -o {file}.part '{url}' && mv -f {file}.part {file}",
                dir = dir,
                file = file,
                url = url
            ))
            .await?;
        if !download.success() {
            return Err(DriverError::Transient(format!(
                "image download failed (exit {}): {}",
                download.exit_code, download.output
            )));
        }

        let import_path = if file.ends_with(".zip") {
            let extract = format!("{}/{}_extract", dir, image_hash(&image.url, &image.architecture, image.instance_kind));
            let unzip = ssh
                .execute(&format!(
                    "rm -rf {extract} && mkdir -p {extract} && cd {dir} && unzip -o {file} -d {extract}",
                    dir = dir,
                    file = file,
                    extract = extract
                ))
                .await?;
            if !unzip.success() {
                return Err(DriverError::Transient(format!(
                    "unzip failed: {}",
                    unzip.output
                )));
            }
            extract
        } else {
            dir.clone()
        };

        self.import(ssh, &import_path, &format!("{}/{}", dir, file), &alias)
            .await?;

        // Extract dirs are temporary; the hashed archive stays as the cache
        if import_path != dir {
            let _ = ssh.execute(&format!("rm -rf {}", import_path)).await;
        }

        Ok(alias)
    }

    /// Detect split vs unified layout and import accordingly
    async fn import(
        &self,
        ssh: &SshClient,
        search_dir: &str,
        unified_archive: &str,
        alias: &str,
    ) -> Result<()> {
        let listing = ssh
            .execute(&format!("ls {} 2>/dev/null", search_dir))
            .await?;
        let has_split = listing.output.contains("metadata.tar.xz")
            && listing.output.contains("rootfs.squashfs");

        let command = if has_split {
            format!(
                "{cli} image import {dir}/metadata.tar.xz {dir}/rootfs.squashfs --alias {alias}",
                cli = self.cli,
                dir = search_dir,
                alias = alias
            )
        } else {
            format!(
                "{cli} image import {archive} --alias {alias}",
                cli = self.cli,
                archive = unified_archive,
                alias = alias
            )
        };

        let imported = ssh.execute(&command).await?;
        if !imported.success() {
            // A racing create may have imported the alias in between
            if imported.output.contains("already exists") {
                return Ok(());
            }
            return Err(DriverError::Transient(format!(
                "image import failed: {}",
                imported.output
            )));
        }
        Ok(())
    }

    pub async fn delete(&self, ssh: &SshClient, reference: &str) -> Result<()> {
        let removed = ssh
            .execute(&format!("{} image delete {}", self.cli, reference))
            .await?;
        if !removed.success() {
            if removed.output.contains("not found") {
                return Err(DriverError::NotFound(reference.to_string()));
            }
            return Err(DriverError::Transient(removed.output));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(url: &str) -> ImageSource {
        ImageSource {
            name: "debian-12-amd64".into(),
            url: url.into(),
            architecture: "amd64".into(),
            instance_kind: InstanceKind::Container,
            os: "debian".into(),
        }
    }

    #[test]
    fn hash_is_stable_and_keyed_on_all_inputs() {
        let a = image_hash("https://x/img.tar.xz", "amd64", InstanceKind::Container);
        let b = image_hash("https://x/img.tar.xz", "amd64", InstanceKind::Container);
        assert_eq!(a, b);
        assert_ne!(
            a,
            image_hash("https://x/img.tar.xz", "arm64", InstanceKind::Container)
        );
        assert_ne!(
            a,
            image_hash("https://x/img.tar.xz", "amd64", InstanceKind::Vm)
        );
    }

    #[test]
    fn alias_carries_prefix() {
        let alias = image_alias(&image("https://x/img.tar.xz"));
        assert!(alias.starts_with("oneclickvirt_"));
    }

    #[test]
    fn cache_dirs_per_flavour_and_kind() {
        assert_eq!(
            cache_dir("lxd", InstanceKind::Vm),
            "/usr/local/bin/lxd_vm_images"
        );
        assert_eq!(
            cache_dir("incus", InstanceKind::Container),
            "/usr/local/bin/incus_ct_images"
        );
    }

    #[test]
    fn archive_name_keeps_extension() {
        assert!(archive_file_name(&image("https://x/img.zip")).ends_with(".zip"));
        assert!(archive_file_name(&image("https://x/img.tar.xz")).ends_with(".tar.xz"));
    }

    #[tokio::test]
    async fn empty_cdn_list_returns_raw_url() {
        let url = resolve_download_url(&[], "https://x/img.tar.xz").await;
        assert_eq!(url, "https://x/img.tar.xz");
    }
}
