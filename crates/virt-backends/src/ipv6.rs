//! Proxmox IPv6 strategies
//!
//! Two mutually exclusive schemes, chosen at runtime per host:
//!
//! * **Mapped external** — an operator-provided address list exists on the
//!   host; each guest gets one external address NATed (ip6tables DNAT/SNAT)
//!   to its stable link address `2001:db8:1::<vmid>`.
//! * **Direct** — guests are assigned addresses straight out of the host
//!   prefix on vmbr2, which only works while `ndpresponder.service` answers
//!   neighbour discovery for them.

use std::net::Ipv6Addr;
use std::str::FromStr;

use ipnetwork::Ipv6Network;
use tracing::{debug, info};

use virt_ssh::SshClient;

use crate::error::{DriverError, Result};

pub const PVE_IPV6_PREFIX_FILE: &str = "/usr/local/bin/pve_ipv6_prefix.txt";
pub const PVE_IPV6_GATEWAY_FILE: &str = "/usr/local/bin/pve_ipv6_gateway.txt";
pub const PVE_IPV6_PREFIXLEN_FILE: &str = "/usr/local/bin/pve_ipv6_prefixlen.txt";
pub const PVE_APPENDED_IPV6_FILE: &str = "/usr/local/bin/pve_appended_ipv6.txt";
pub const PVE_USED_IPV6_FILE: &str = "/usr/local/bin/pve_used_ipv6.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6Strategy {
    MappedExternal,
    Direct,
}

/// Stable inside address for a guest under the mapped scheme
pub fn guest_link_address(vmid: u32) -> String {
    format!("2001:db8:1::{}", vmid)
}

/// Compose `prefix::vmid` for the direct scheme
pub fn direct_address(prefix: &str, prefix_len: u8, vmid: u32) -> Result<String> {
    let network = Ipv6Network::new(
        Ipv6Addr::from_str(prefix)
            .map_err(|e| DriverError::Fatal(format!("bad host IPv6 prefix {}: {}", prefix, e)))?,
        prefix_len,
    )
    .map_err(|e| DriverError::Fatal(format!("bad host IPv6 prefix length: {}", e)))?;
    let base = u128::from(network.network());
    Ok(Ipv6Addr::from(base | vmid as u128).to_string())
}

pub struct ProxmoxIpv6<'a> {
    ssh: &'a SshClient,
}

impl<'a> ProxmoxIpv6<'a> {
    pub fn new(ssh: &'a SshClient) -> Self {
        Self { ssh }
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let out = self
            .ssh
            .execute(&format!("cat {} 2>/dev/null", path))
            .await?;
        if out.success() && !out.output.trim().is_empty() {
            Ok(Some(out.output.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// The appended-content file being present selects the mapped scheme
    pub async fn detect_strategy(&self) -> Result<Ipv6Strategy> {
        let appended = self
            .ssh
            .execute(&format!("test -s {}", PVE_APPENDED_IPV6_FILE))
            .await?;
        if appended.success() {
            Ok(Ipv6Strategy::MappedExternal)
        } else {
            Ok(Ipv6Strategy::Direct)
        }
    }

    pub async fn host_has_ipv6(&self) -> Result<bool> {
        Ok(self.read_file(PVE_IPV6_PREFIX_FILE).await?.is_some())
    }

    /// First address in the appended list not yet present in the used list;
    /// the claim is recorded before the rules go in.
    pub async fn claim_external(&self) -> Result<String> {
        let appended = self
            .read_file(PVE_APPENDED_IPV6_FILE)
            .await?
            .ok_or_else(|| DriverError::Fatal("appended IPv6 list missing".to_string()))?;
        let used = self
            .read_file(PVE_USED_IPV6_FILE)
            .await?
            .unwrap_or_default();
        let used: Vec<&str> = used.lines().map(str::trim).collect();

        let candidate = appended
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .find(|line| !used.contains(line))
            .ok_or_else(|| {
                DriverError::Fatal("appended IPv6 list exhausted".to_string())
            })?
            .to_string();

        let recorded = self
            .ssh
            .execute(&format!("echo '{}' >> {}", candidate, PVE_USED_IPV6_FILE))
            .await?;
        if !recorded.success() {
            return Err(DriverError::Transient(format!(
                "failed to record claimed IPv6: {}",
                recorded.output
            )));
        }
        debug!(address = %candidate, "claimed external IPv6");
        Ok(candidate)
    }

    /// Install the DNAT/SNAT pair between the guest's link address and its
    /// external address.
    pub async fn apply_mapped(&self, vmid: u32, external: &str) -> Result<String> {
        let inside = guest_link_address(vmid);
        let rules = format!(
            "ip6tables -t nat -A PREROUTING -d {ext} -j DNAT --to-destination {inside} && \
             ip6tables -t nat -A POSTROUTING -s {inside} -j SNAT --to-source {ext}",
            ext = external,
            inside = inside
        );
        let applied = self.ssh.execute(&rules).await?;
        if !applied.success() {
            return Err(DriverError::Transient(format!(
                "ip6tables NAT install failed: {}",
                applied.output
            )));
        }
        info!(vmid, external, "installed IPv6 NAT pair");
        Ok(inside)
    }

    pub async fn remove_mapped(&self, vmid: u32, external: &str) -> Result<()> {
        let inside = guest_link_address(vmid);
        let rules = format!(
            "ip6tables -t nat -D PREROUTING -d {ext} -j DNAT --to-destination {inside}; \
             ip6tables -t nat -D POSTROUTING -s {inside} -j SNAT --to-source {ext}; \
             sed -i '\\|^{ext}$|d' {used}",
            ext = external,
            inside = inside,
            used = PVE_USED_IPV6_FILE
        );
        // Removal is best-effort: missing rules are already gone
        let _ = self.ssh.execute(&rules).await?;
        Ok(())
    }

    /// Direct assignment requires the NDP responder to be answering for the
    /// prefix on vmbr2.
    pub async fn direct_guest_address(&self, vmid: u32) -> Result<String> {
        let responder = self
            .ssh
            .execute("systemctl is-active ndpresponder.service")
            .await?;
        if responder.output.trim() != "active" {
            return Err(DriverError::Fatal(
                "direct IPv6 assignment requires ndpresponder.service to be active".to_string(),
            ));
        }

        let prefix = self
            .read_file(PVE_IPV6_PREFIX_FILE)
            .await?
            .ok_or_else(|| DriverError::Fatal("host IPv6 prefix file missing".to_string()))?;
        let prefix_len: u8 = self
            .read_file(PVE_IPV6_PREFIXLEN_FILE)
            .await?
            .unwrap_or_else(|| "64".to_string())
            .parse()
            .map_err(|_| DriverError::Fatal("unparseable IPv6 prefix length".to_string()))?;

        direct_address(&prefix, prefix_len, vmid)
    }

    pub async fn gateway(&self) -> Result<Option<String>> {
        self.read_file(PVE_IPV6_GATEWAY_FILE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_address_embeds_vmid() {
        assert_eq!(guest_link_address(105), "2001:db8:1::105");
    }

    #[test]
    fn direct_address_composition() {
        let addr = direct_address("2a01:4f8:1:2::", 64, 105).unwrap();
        assert_eq!(addr, "2a01:4f8:1:2::69");
    }

    #[test]
    fn bad_prefix_is_fatal() {
        let err = direct_address("not-an-address", 64, 1).unwrap_err();
        assert!(matches!(err, DriverError::Fatal(_)));
    }
}
