//! Remote application of port mappings
//!
//! Three methods: an iptables DNAT/FORWARD/MASQUERADE triplet (Proxmox
//! default, fallback elsewhere), an LXD/Incus proxy device, and `native`
//! (externally managed: recorded in the database, never applied remotely).

use tracing::{debug, info};

use virt_ssh::SshClient;
use virt_types::{PortMappingMethod, Protocol};

use crate::error::{ResourceError, Result};

pub const IPTABLES_PERSIST: &str = "iptables-save > /etc/iptables/rules.v4";

/// One mapping to realise on a backend host
#[derive(Debug, Clone)]
pub struct MappingParams<'a> {
    pub instance_name: &'a str,
    /// CLI word for proxy devices (`lxc` / `incus`)
    pub cli: &'a str,
    /// Address the host listens on; None binds the wildcard
    pub host_ip: Option<&'a str>,
    pub guest_ip: &'a str,
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
    pub ipv6: bool,
}

impl<'a> MappingParams<'a> {
    fn nat_binary(&self) -> &'static str {
        if self.ipv6 {
            "ip6tables"
        } else {
            "iptables"
        }
    }
}

/// The three rules per (host-port, concrete protocol); `both` doubles them.
pub fn iptables_add_commands(params: &MappingParams<'_>) -> Vec<String> {
    let binary = params.nat_binary();
    params
        .protocol
        .expand()
        .iter()
        .flat_map(|proto| {
            [
                format!(
                    "{bin} -t nat -A PREROUTING -p {proto} --dport {hp} -j DNAT --to-destination {ip}:{gp}",
                    bin = binary,
                    proto = proto,
                    hp = params.host_port,
                    ip = params.guest_ip,
                    gp = params.guest_port,
                ),
                format!(
                    "{bin} -A FORWARD -d {ip} -p {proto} --dport {gp} -j ACCEPT",
                    bin = binary,
                    proto = proto,
                    ip = params.guest_ip,
                    gp = params.guest_port,
                ),
                format!(
                    "{bin} -t nat -A POSTROUTING -s {ip} -p {proto} --sport {gp} -j MASQUERADE",
                    bin = binary,
                    proto = proto,
                    ip = params.guest_ip,
                    gp = params.guest_port,
                ),
            ]
        })
        .collect()
}

/// Removal inverts addition rule for rule.
pub fn iptables_remove_commands(params: &MappingParams<'_>) -> Vec<String> {
    iptables_add_commands(params)
        .into_iter()
        .map(|rule| rule.replacen(" -A ", " -D ", 1))
        .collect()
}

pub fn proxy_device_name(protocol: &str, host_port: u16) -> String {
    format!("proxy-{}-{}", protocol, host_port)
}

pub fn proxy_add_commands(params: &MappingParams<'_>) -> Vec<String> {
    let listen_ip = params.host_ip.unwrap_or("0.0.0.0");
    params
        .protocol
        .expand()
        .iter()
        .map(|proto| {
            format!(
                "{cli} config device add {name} {device} proxy \
                 listen={proto}:{lip}:{hp} connect={proto}:0.0.0.0:{gp} nat=true",
                cli = params.cli,
                name = params.instance_name,
                device = proxy_device_name(proto, params.host_port),
                proto = proto,
                lip = listen_ip,
                hp = params.host_port,
                gp = params.guest_port,
            )
        })
        .collect()
}

/// Contiguous allocations ride one proxy device per protocol.
pub fn proxy_add_range_commands(
    cli: &str,
    instance_name: &str,
    host_ip: Option<&str>,
    start: u16,
    end: u16,
    protocol: Protocol,
) -> Vec<String> {
    let listen_ip = host_ip.unwrap_or("0.0.0.0");
    protocol
        .expand()
        .iter()
        .map(|proto| {
            format!(
                "{cli} config device add {name} {device} proxy \
                 listen={proto}:{lip}:{start}-{end} connect={proto}:0.0.0.0:{start}-{end} nat=true",
                cli = cli,
                name = instance_name,
                device = proxy_device_name(proto, start),
                proto = proto,
                lip = listen_ip,
                start = start,
                end = end,
            )
        })
        .collect()
}

pub fn proxy_remove_commands(params: &MappingParams<'_>) -> Vec<String> {
    params
        .protocol
        .expand()
        .iter()
        .map(|proto| {
            format!(
                "{cli} config device remove {name} {device}",
                cli = params.cli,
                name = params.instance_name,
                device = proxy_device_name(proto, params.host_port),
            )
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallKind {
    Ufw,
    Firewalld,
    None,
}

pub fn firewall_open_commands(kind: FirewallKind, port: u16, protocol: Protocol) -> Vec<String> {
    match kind {
        FirewallKind::None => Vec::new(),
        FirewallKind::Ufw => protocol
            .expand()
            .iter()
            .map(|proto| format!("ufw allow {}/{}", port, proto))
            .collect(),
        FirewallKind::Firewalld => {
            let mut commands: Vec<String> = protocol
                .expand()
                .iter()
                .map(|proto| format!("firewall-cmd --permanent --add-port={}/{}", port, proto))
                .collect();
            commands.push("firewall-cmd --reload".to_string());
            commands
        }
    }
}

pub struct PortPlanner;

impl PortPlanner {
    pub async fn detect_firewall(ssh: &SshClient) -> Result<FirewallKind> {
        let ufw = ssh
            .execute("command -v ufw >/dev/null && ufw status | head -1")
            .await?;
        if ufw.success() && ufw.output.to_lowercase().contains("active") {
            return Ok(FirewallKind::Ufw);
        }
        let firewalld = ssh.execute("firewall-cmd --state 2>/dev/null").await?;
        if firewalld.success() && firewalld.output.trim() == "running" {
            return Ok(FirewallKind::Firewalld);
        }
        Ok(FirewallKind::None)
    }

    /// Apply one mapping on the remote, then open the host port on whatever
    /// firewall is present. `native` records nothing remotely.
    pub async fn apply(
        ssh: &SshClient,
        method: PortMappingMethod,
        params: &MappingParams<'_>,
    ) -> Result<()> {
        match method {
            PortMappingMethod::Native => {
                info!(
                    host_port = params.host_port,
                    "mapping method is native (externally managed), skipping remote configuration"
                );
                return Ok(());
            }
            PortMappingMethod::Iptables => {
                for command in iptables_add_commands(params) {
                    Self::run(ssh, &command).await?;
                }
                Self::run(ssh, IPTABLES_PERSIST).await?;
            }
            PortMappingMethod::DeviceProxy => {
                for command in proxy_add_commands(params) {
                    Self::run(ssh, &command).await?;
                }
            }
        }

        let firewall = Self::detect_firewall(ssh).await?;
        for command in firewall_open_commands(firewall, params.host_port, params.protocol) {
            // Firewall openings are additive; a duplicate rule is harmless
            let _ = ssh.execute(&command).await?;
        }
        Ok(())
    }

    /// Remove one mapping from the remote. Missing rules and devices are
    /// treated as already gone.
    pub async fn remove(
        ssh: &SshClient,
        method: PortMappingMethod,
        params: &MappingParams<'_>,
    ) -> Result<()> {
        match method {
            PortMappingMethod::Native => {
                debug!(host_port = params.host_port, "native mapping, nothing to remove");
                Ok(())
            }
            PortMappingMethod::Iptables => {
                for command in iptables_remove_commands(params) {
                    let _ = ssh.execute(&command).await?;
                }
                Self::run(ssh, IPTABLES_PERSIST).await?;
                Ok(())
            }
            PortMappingMethod::DeviceProxy => {
                for command in proxy_remove_commands(params) {
                    let out = ssh.execute(&command).await?;
                    if !out.success() && !out.output.contains("not found") {
                        return Err(ResourceError::RemoteApply(out.output));
                    }
                }
                Ok(())
            }
        }
    }

    async fn run(ssh: &SshClient, command: &str) -> Result<()> {
        let out = ssh.execute(command).await?;
        if !out.success() {
            return Err(ResourceError::RemoteApply(format!(
                "`{}` failed (exit {}): {}",
                command, out.exit_code, out.output
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(protocol: Protocol, ipv6: bool) -> MappingParams<'static> {
        MappingParams {
            instance_name: "demo",
            cli: "lxc",
            host_ip: Some("203.0.113.10"),
            guest_ip: "172.16.0.100",
            host_port: 20022,
            guest_port: 22,
            protocol,
            ipv6,
        }
    }

    #[test]
    fn iptables_triplet_per_protocol() {
        let commands = iptables_add_commands(&params(Protocol::Tcp, false));
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains("-t nat -A PREROUTING -p tcp --dport 20022"));
        assert!(commands[0].contains("-j DNAT --to-destination 172.16.0.100:22"));
        assert!(commands[1].contains("-A FORWARD -d 172.16.0.100 -p tcp --dport 22 -j ACCEPT"));
        assert!(commands[2].contains("-t nat -A POSTROUTING -s 172.16.0.100 -p tcp --sport 22 -j MASQUERADE"));
    }

    #[test]
    fn both_protocol_doubles_the_rules() {
        let commands = iptables_add_commands(&params(Protocol::Both, false));
        assert_eq!(commands.len(), 6);
        assert!(commands.iter().any(|c| c.contains("-p tcp")));
        assert!(commands.iter().any(|c| c.contains("-p udp")));
    }

    #[test]
    fn ipv6_uses_ip6tables() {
        let commands = iptables_add_commands(&params(Protocol::Tcp, true));
        assert!(commands.iter().all(|c| c.starts_with("ip6tables ")));
    }

    #[test]
    fn removal_inverts_addition() {
        let add = iptables_add_commands(&params(Protocol::Tcp, false));
        let remove = iptables_remove_commands(&params(Protocol::Tcp, false));
        for (a, r) in add.iter().zip(&remove) {
            assert_eq!(a.replacen(" -A ", " -D ", 1), *r);
        }
    }

    #[test]
    fn proxy_device_command_shape() {
        let commands = proxy_add_commands(&params(Protocol::Tcp, false));
        assert_eq!(
            commands[0],
            "lxc config device add demo proxy-tcp-20022 proxy \
             listen=tcp:203.0.113.10:20022 connect=tcp:0.0.0.0:22 nat=true"
        );
    }

    #[test]
    fn proxy_range_command_shape() {
        let commands =
            proxy_add_range_commands("incus", "demo", None, 20100, 20110, Protocol::Udp);
        assert_eq!(
            commands[0],
            "incus config device add demo proxy-udp-20100 proxy \
             listen=udp:0.0.0.0:20100-20110 connect=udp:0.0.0.0:20100-20110 nat=true"
        );
    }

    #[test]
    fn firewall_commands() {
        assert!(firewall_open_commands(FirewallKind::None, 20022, Protocol::Tcp).is_empty());
        assert_eq!(
            firewall_open_commands(FirewallKind::Ufw, 20022, Protocol::Tcp),
            vec!["ufw allow 20022/tcp".to_string()]
        );
        let firewalld = firewall_open_commands(FirewallKind::Firewalld, 20022, Protocol::Both);
        assert_eq!(firewalld.last().unwrap(), "firewall-cmd --reload");
        assert_eq!(firewalld.len(), 3);
    }
}
