//! Proxmox VE driver
//!
//! Guests are integer VMIDs in a fixed range. NAT guests hang off vmbr1 with
//! an internal address derived from the VMID; IPv6 uses one of the two
//! strategies in [`crate::ipv6`].

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use virt_health::{HealthChecker, HealthResult};
use virt_ssh::{CommandOutput, SshClient};
use virt_types::{BackendKind, DiscoveredInstance, InstanceKind, NetworkType};

use crate::driver::{
    validate_create, BackendDriver, CreateRequest, CreatedInstance, ImageInfo, InstanceSpecExt,
};
use crate::error::{DriverError, Result};
use crate::images::resolve_download_url;
use crate::ipv6::{Ipv6Strategy, ProxmoxIpv6};
use crate::policy::run_dual;
use crate::profile::BackendProfile;
use crate::pve_api::ProxmoxApi;

/// Fixed VMID range; keeps the vmbr1 address formula in one /16
pub const VMID_MIN: u32 = 100;
pub const VMID_MAX: u32 = 65535;

const NAT_BRIDGE: &str = "vmbr1";
const NAT_GATEWAY: &str = "172.16.1.1";
const TEMPLATE_CACHE: &str = "/var/lib/vz/template/cache";

/// vmbr1 address formula: the VMID's two low bytes land in the host /16
pub fn nat_ip_for_vmid(vmid: u32) -> String {
    format!("172.16.{}.{}", (vmid >> 8) & 0xff, vmid & 0xff)
}

pub struct ProxmoxDriver {
    profile: BackendProfile,
    ssh: Arc<SshClient>,
    api: Option<ProxmoxApi>,
}

impl ProxmoxDriver {
    pub fn new(profile: BackendProfile, ssh: Arc<SshClient>) -> Result<Self> {
        let api = if profile.api_token.is_some() {
            Some(ProxmoxApi::new(&profile)?)
        } else {
            None
        };
        Ok(Self { profile, ssh, api })
    }

    fn api(&self) -> Result<&ProxmoxApi> {
        self.api
            .as_ref()
            .ok_or_else(|| DriverError::Validation("no Proxmox API credentials".to_string()))
    }

    fn dual<'a, T: Send + 'a>(
        &'a self,
        operation: &'a str,
        api: impl FnOnce() -> BoxFuture<'a, Result<T>> + Send + 'a,
        ssh: impl FnOnce() -> BoxFuture<'a, Result<T>> + Send + 'a,
    ) -> BoxFuture<'a, Result<T>> {
        Box::pin(run_dual(
            self.profile.execution_rule,
            self.profile.has_api_credentials(),
            operation,
            api,
            ssh,
        ))
    }

    /// Guests are addressed by VMID on the wire; names resolve through the
    /// inventory.
    async fn resolve(&self, name: &str) -> Result<(u32, bool)> {
        for guest in self.discover().await? {
            if guest.name == name {
                let vmid: u32 = guest.uuid.parse().map_err(|_| {
                    DriverError::Transient(format!("non-numeric vmid for {}", name))
                })?;
                return Ok((vmid, guest.kind == InstanceKind::Vm));
            }
        }
        Err(DriverError::NotFound(format!("guest {}", name)))
    }

    async fn next_vmid(&self) -> Result<u32> {
        let vmid = self
            .dual(
                "next-vmid",
                || Box::pin(async { self.api()?.next_vmid().await }),
                || {
                    Box::pin(async {
                        let out = self.ssh.execute("pvesh get /cluster/nextid").await?;
                        out.output
                            .trim()
                            .parse::<u32>()
                            .map_err(|_| DriverError::Transient(format!("bad nextid: {}", out.output)))
                    })
                },
            )
            .await?;
        if !(VMID_MIN..=VMID_MAX).contains(&vmid) {
            return Err(DriverError::Fatal(format!(
                "allocated vmid {} outside managed range {}-{}",
                vmid, VMID_MIN, VMID_MAX
            )));
        }
        Ok(vmid)
    }

    async fn configure_ipv6(&self, vmid: u32) -> Result<Option<String>> {
        let ipv6 = ProxmoxIpv6::new(&self.ssh);
        if self.profile.network_type.is_ipv6_only() && !ipv6.host_has_ipv6().await? {
            return Err(DriverError::Fatal(
                "ipv6_only network requested but the host has no public IPv6".to_string(),
            ));
        }
        match ipv6.detect_strategy().await? {
            Ipv6Strategy::MappedExternal => {
                let external = ipv6.claim_external().await?;
                ipv6.apply_mapped(vmid, &external).await?;
                Ok(Some(external))
            }
            Ipv6Strategy::Direct => {
                let address = ipv6.direct_guest_address(vmid).await?;
                Ok(Some(address))
            }
        }
    }

    async fn ssh_create(&self, request: &CreateRequest, vmid: u32) -> Result<()> {
        let spec = &request.spec;
        let ip = nat_ip_for_vmid(vmid);
        let command = match spec.kind {
            InstanceKind::Vm => format!(
                "qm create {vmid} --name {name} --cores {cores} --memory {mem} \
                 --net0 virtio,bridge={bridge} --scsihw virtio-scsi-pci --ostype l26 --onboot 1 && \
                 qm set {vmid} --ipconfig0 ip={ip}/16,gw={gw} && \
                 qm start {vmid}",
                vmid = vmid,
                name = spec.name,
                cores = spec.resources.cpu_cores,
                mem = spec.resources.memory_mb,
                bridge = NAT_BRIDGE,
                ip = ip,
                gw = NAT_GATEWAY,
            ),
            InstanceKind::Container => format!(
                "pct create {vmid} {template} --hostname {name} --cores {cores} --memory {mem} \
                 --rootfs local:{disk} --net0 name=eth0,bridge={bridge},ip={ip}/16,gw={gw} \
                 --unprivileged 1 --features nesting=1 --onboot 1 && \
                 pct start {vmid}",
                vmid = vmid,
                template = self.template_path(&request.image.url),
                name = spec.name,
                cores = spec.resources.cpu_cores,
                mem = spec.resources.memory_mb,
                disk = spec.disk_gib(),
                bridge = NAT_BRIDGE,
                ip = ip,
                gw = NAT_GATEWAY,
            ),
        };
        let out = self.ssh.execute(&command).await?;
        if !out.success() {
            if out.output.contains("already exists") {
                return Err(DriverError::AlreadyExists(spec.name.clone()));
            }
            return Err(DriverError::Transient(format!(
                "guest create failed (exit {}): {}",
                out.exit_code, out.output
            )));
        }
        Ok(())
    }

    async fn api_create(&self, request: &CreateRequest, vmid: u32) -> Result<()> {
        let spec = &request.spec;
        let api = self.api()?;
        let ip = nat_ip_for_vmid(vmid);
        match spec.kind {
            InstanceKind::Vm => {
                let form = [
                    ("vmid", vmid.to_string()),
                    ("name", spec.name.clone()),
                    ("cores", spec.resources.cpu_cores.to_string()),
                    ("memory", spec.resources.memory_mb.to_string()),
                    ("net0", format!("virtio,bridge={}", NAT_BRIDGE)),
                    ("ipconfig0", format!("ip={}/16,gw={}", ip, NAT_GATEWAY)),
                    ("scsihw", "virtio-scsi-pci".to_string()),
                    ("ostype", "l26".to_string()),
                    ("onboot", "1".to_string()),
                ];
                api.create_guest(true, &form).await?;
                api.guest_action(true, vmid, "start").await?;
            }
            InstanceKind::Container => {
                let form = [
                    ("vmid", vmid.to_string()),
                    ("hostname", spec.name.clone()),
                    ("cores", spec.resources.cpu_cores.to_string()),
                    ("memory", spec.resources.memory_mb.to_string()),
                    ("ostemplate", self.template_path(&request.image.url)),
                    ("rootfs", format!("local:{}", spec.disk_gib())),
                    (
                        "net0",
                        format!(
                            "name=eth0,bridge={},ip={}/16,gw={}",
                            NAT_BRIDGE, ip, NAT_GATEWAY
                        ),
                    ),
                    ("unprivileged", "1".to_string()),
                    ("onboot", "1".to_string()),
                ];
                api.create_guest(false, &form).await?;
                api.guest_action(false, vmid, "start").await?;
            }
        }
        Ok(())
    }

    fn template_path(&self, url: &str) -> String {
        let file = url.rsplit('/').next().unwrap_or("image.tar.zst");
        format!("{}/{}", TEMPLATE_CACHE, file)
    }

    async fn lifecycle_ssh(&self, verb: &str, vmid: u32, is_vm: bool) -> Result<()> {
        let cli = if is_vm { "qm" } else { "pct" };
        let out = self.ssh.execute(&format!("{} {} {}", cli, verb, vmid)).await?;
        if !out.success() {
            if out.output.contains("does not exist") {
                return Err(DriverError::NotFound(format!("vmid {}", vmid)));
            }
            return Err(DriverError::Transient(format!(
                "{} {} failed: {}",
                cli, verb, out.output
            )));
        }
        Ok(())
    }

    fn parse_qm_list(output: &str) -> Vec<DiscoveredInstance> {
        // VMID NAME STATUS MEM(MB) BOOTDISK(GB) PID
        let line_re = Regex::new(r"^\s*(\d+)\s+(\S+)\s+(\S+)\s+(\d+)").unwrap();
        output
            .lines()
            .filter_map(|line| line_re.captures(line))
            .map(|caps| {
                let vmid = caps[1].to_string();
                DiscoveredInstance {
                    uuid: vmid.clone(),
                    name: caps[2].to_string(),
                    status: caps[3].to_string(),
                    kind: InstanceKind::Vm,
                    cpu_cores: 0,
                    memory_mb: caps[4].parse().unwrap_or(0),
                    disk_mb: 0,
                    private_ip: vmid.parse().ok().map(nat_ip_for_vmid),
                    public_ip: None,
                    ipv6: None,
                    ssh_port: None,
                    mac: None,
                    image: None,
                    os: None,
                    raw: Value::Null,
                }
            })
            .collect()
    }

    fn parse_pct_list(output: &str) -> Vec<DiscoveredInstance> {
        // VMID Status Lock Name
        let line_re = Regex::new(r"^\s*(\d+)\s+(\S+)\s+\S*\s*(\S+)\s*$").unwrap();
        output
            .lines()
            .filter_map(|line| line_re.captures(line))
            .map(|caps| {
                let vmid = caps[1].to_string();
                DiscoveredInstance {
                    uuid: vmid.clone(),
                    name: caps[3].to_string(),
                    status: caps[2].to_lowercase(),
                    kind: InstanceKind::Container,
                    cpu_cores: 0,
                    memory_mb: 0,
                    disk_mb: 0,
                    private_ip: vmid.parse().ok().map(nat_ip_for_vmid),
                    public_ip: None,
                    ipv6: None,
                    ssh_port: None,
                    mac: None,
                    image: None,
                    os: None,
                    raw: Value::Null,
                }
            })
            .collect()
    }

    fn discovered_from_cluster(entry: &Value) -> Option<DiscoveredInstance> {
        let vmid = entry.get("vmid")?.as_u64()? as u32;
        let kind = match entry.get("type")?.as_str()? {
            "qemu" => InstanceKind::Vm,
            "lxc" => InstanceKind::Container,
            _ => return None,
        };
        Some(DiscoveredInstance {
            uuid: vmid.to_string(),
            name: entry
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: entry
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            kind,
            cpu_cores: entry.get("maxcpu").and_then(Value::as_u64).unwrap_or(0) as u32,
            memory_mb: entry.get("maxmem").and_then(Value::as_u64).unwrap_or(0) / (1024 * 1024),
            disk_mb: entry.get("maxdisk").and_then(Value::as_u64).unwrap_or(0) / (1024 * 1024),
            private_ip: Some(nat_ip_for_vmid(vmid)),
            public_ip: None,
            ipv6: None,
            ssh_port: None,
            mac: None,
            image: None,
            os: None,
            raw: entry.clone(),
        })
    }
}

#[async_trait]
impl BackendDriver for ProxmoxDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Proxmox
    }

    fn supported_instance_kinds(&self) -> &'static [InstanceKind] {
        &[InstanceKind::Vm, InstanceKind::Container]
    }

    async fn list_instances(&self) -> Result<Vec<DiscoveredInstance>> {
        self.discover().await
    }

    async fn get_instance(&self, name: &str) -> Result<DiscoveredInstance> {
        self.discover()
            .await?
            .into_iter()
            .find(|guest| guest.name == name)
            .ok_or_else(|| DriverError::NotFound(format!("guest {}", name)))
    }

    async fn create_instance(&self, request: &CreateRequest) -> Result<CreatedInstance> {
        validate_create(request, self.supported_instance_kinds())?;

        if self.profile.network_type == NetworkType::Ipv6Only {
            let ipv6 = ProxmoxIpv6::new(&self.ssh);
            if !ipv6.host_has_ipv6().await? {
                return Err(DriverError::Fatal(
                    "ipv6_only network requested but the host has no public IPv6".to_string(),
                ));
            }
        }

        let vmid = self.next_vmid().await?;
        info!(vmid, name = %request.spec.name, "creating proxmox guest");

        self.dual(
            "create-instance",
            || Box::pin(self.api_create(request, vmid)),
            || Box::pin(self.ssh_create(request, vmid)),
        )
        .await?;

        let ipv6_address = if request.configure_ipv6 || self.profile.network_type.has_ipv6() {
            match self.configure_ipv6(vmid).await {
                Ok(address) => address,
                Err(e @ DriverError::Fatal(_)) => return Err(e),
                Err(e) => {
                    warn!(vmid, error = %e, "IPv6 configuration failed, continuing without");
                    None
                }
            }
        } else {
            None
        };

        Ok(CreatedInstance {
            private_ip: Some(nat_ip_for_vmid(vmid)),
            ipv6: ipv6_address,
            mac: None,
            vmid: Some(vmid),
        })
    }

    async fn start_instance(&self, name: &str) -> Result<()> {
        let (vmid, is_vm) = self.resolve(name).await?;
        self.dual(
            "start-instance",
            || Box::pin(async move { self.api()?.guest_action(is_vm, vmid, "start").await.map(|_| ()) }),
            || Box::pin(self.lifecycle_ssh("start", vmid, is_vm)),
        )
        .await
    }

    async fn stop_instance(&self, name: &str) -> Result<()> {
        let (vmid, is_vm) = self.resolve(name).await?;
        self.dual(
            "stop-instance",
            || Box::pin(async move { self.api()?.guest_action(is_vm, vmid, "stop").await.map(|_| ()) }),
            || Box::pin(self.lifecycle_ssh("stop", vmid, is_vm)),
        )
        .await
    }

    async fn restart_instance(&self, name: &str) -> Result<()> {
        let (vmid, is_vm) = self.resolve(name).await?;
        self.dual(
            "restart-instance",
            || Box::pin(async move { self.api()?.guest_action(is_vm, vmid, "reboot").await.map(|_| ()) }),
            || Box::pin(self.lifecycle_ssh("reboot", vmid, is_vm)),
        )
        .await
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        let (vmid, is_vm) = self.resolve(name).await?;
        self.dual(
            "delete-instance",
            || {
                Box::pin(async move {
                    let api = self.api()?;
                    let _ = api.guest_action(is_vm, vmid, "stop").await;
                    api.delete_guest(is_vm, vmid).await.map(|_| ())
                })
            },
            || {
                Box::pin(async move {
                    let cli = if is_vm { "qm" } else { "pct" };
                    let _ = self.ssh.execute(&format!("{} stop {}", cli, vmid)).await;
                    let out = self
                        .ssh
                        .execute(&format!("{} destroy {} --purge", cli, vmid))
                        .await?;
                    if !out.success() && !out.output.contains("does not exist") {
                        return Err(DriverError::Transient(format!(
                            "destroy failed: {}",
                            out.output
                        )));
                    }
                    Ok(())
                })
            },
        )
        .await
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let out = self
            .ssh
            .execute(&format!("ls -l --block-size=1 {} | tail -n +2", TEMPLATE_CACHE))
            .await?;
        Ok(out
            .output
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                let name = fields.last()?.to_string();
                let size = fields.get(4).and_then(|s| s.parse().ok());
                Some(ImageInfo {
                    reference: name,
                    size_bytes: size,
                    architecture: None,
                })
            })
            .collect())
    }

    async fn ensure_image(&self, image: &crate::driver::ImageSource) -> Result<String> {
        let path = self.template_path(&image.url);
        let existing = self.ssh.execute(&format!("test -s {}", path)).await?;
        if existing.success() {
            return Ok(path);
        }
        let url = resolve_download_url(&self.profile.cdn_endpoints, &image.url).await;
        let out = self
            .ssh
            .execute(&format!(
                "mkdir -p {cache} && curl -L -C - --retry 5 --retry-delay 10 -o {path}.part '{url}' && mv -f {path}.part {path}",
                cache = TEMPLATE_CACHE,
                path = path,
                url = url
            ))
            .await?;
        if !out.success() {
            return Err(DriverError::Transient(format!(
                "template download failed: {}",
                out.output
            )));
        }
        Ok(path)
    }

    async fn delete_image(&self, reference: &str) -> Result<()> {
        let out = self
            .ssh
            .execute(&format!("rm -f {}/{}", TEMPLATE_CACHE, reference))
            .await?;
        if !out.success() {
            return Err(DriverError::Transient(out.output));
        }
        Ok(())
    }

    async fn set_password(&self, name: &str, username: &str, password: &str) -> Result<()> {
        let (vmid, is_vm) = self.resolve(name).await?;
        let command = if is_vm {
            format!(
                "qm guest passwd {} {} --password '{}'",
                vmid, username, password
            )
        } else {
            format!(
                "pct exec {} -- bash -c \"echo '{}:{}' | chpasswd\"",
                vmid, username, password
            )
        };
        let out = self.ssh.execute(&command).await?;
        if !out.success() {
            return Err(DriverError::Transient(format!(
                "password set failed: {}",
                out.output
            )));
        }
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        Ok(self.ssh.execute(command).await?)
    }

    async fn discover(&self) -> Result<Vec<DiscoveredInstance>> {
        self.dual(
            "discover",
            || {
                Box::pin(async {
                    let entries = self.api()?.cluster_vms().await?;
                    Ok(entries
                        .iter()
                        .filter_map(Self::discovered_from_cluster)
                        .collect())
                })
            },
            || {
                Box::pin(async {
                    let vms = self.ssh.execute("qm list 2>/dev/null | tail -n +2").await?;
                    let cts = self.ssh.execute("pct list 2>/dev/null | tail -n +2").await?;
                    let mut guests = Self::parse_qm_list(&vms.output);
                    guests.extend(Self::parse_pct_list(&cts.output));
                    Ok(guests)
                })
            },
        )
        .await
    }

    async fn health(&self) -> HealthResult {
        HealthChecker::new(BackendKind::Proxmox)
            .with_borrowed_ssh(self.ssh.clone())
            .with_api(
                format!("{}/version", self.profile.api_base()),
                self.profile.insecure_tls,
            )
            .check()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nat_ip_formula() {
        assert_eq!(nat_ip_for_vmid(100), "172.16.0.100");
        assert_eq!(nat_ip_for_vmid(256), "172.16.1.0");
        assert_eq!(nat_ip_for_vmid(5123), "172.16.20.3");
    }

    #[test]
    fn qm_list_parses() {
        let output = "\
  100 web-01               running    2048              32.00 12345
  101 db-01                stopped    4096              64.00 0";
        let guests = ProxmoxDriver::parse_qm_list(output);
        assert_eq!(guests.len(), 2);
        assert_eq!(guests[0].uuid, "100");
        assert_eq!(guests[0].name, "web-01");
        assert_eq!(guests[0].status, "running");
        assert_eq!(guests[0].private_ip.as_deref(), Some("172.16.0.100"));
    }

    #[test]
    fn pct_list_parses() {
        let output = "\
  105        running                 ct-demo
  106        stopped                 ct-idle";
        let guests = ProxmoxDriver::parse_pct_list(output);
        assert_eq!(guests.len(), 2);
        assert_eq!(guests[0].name, "ct-demo");
        assert_eq!(guests[0].kind, InstanceKind::Container);
    }

    #[test]
    fn cluster_entry_maps() {
        let entry = json!({
            "vmid": 100,
            "type": "qemu",
            "name": "web-01",
            "status": "running",
            "maxcpu": 2,
            "maxmem": 2147483648u64,
            "maxdisk": 34359738368u64
        });
        let guest = ProxmoxDriver::discovered_from_cluster(&entry).unwrap();
        assert_eq!(guest.cpu_cores, 2);
        assert_eq!(guest.memory_mb, 2048);
        assert_eq!(guest.disk_mb, 32768);
        assert_eq!(guest.kind, InstanceKind::Vm);
    }
}
