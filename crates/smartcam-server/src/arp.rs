/// ARP-based network scanner.
///
/// Runs `arp-scan` over the configured subnet (layer 2 only, no port
/// probing). When the tool is missing or fails, falls back to the kernel
/// neighbour table via `ip neigh show`, then to `/proc/net/arp`. The
/// neighbour table may be stale; active scanning is preferred.

use std::process::Command;

use anyhow::{bail, Context};
use tracing::{debug, info, warn};

use smartcam_core::fault::FaultKind;
use smartcam_core::prober::{ArpEntry, NetworkScanner};

use crate::config::DiscoverySection;

const PROC_NET_ARP: &str = "/proc/net/arp";

pub struct ArpScanner {
    arp_scan_path: String,
    interface: String,
    subnet: String,
    use_sudo: bool,
}

impl ArpScanner {
    pub fn new(config: &DiscoverySection) -> Self {
        Self {
            arp_scan_path: config.arp_scan_path.clone(),
            interface: config.interface.clone(),
            subnet: config.subnet.clone(),
            use_sudo: config.use_sudo,
        }
    }

    fn arp_scan_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.use_sudo {
            args.push(self.arp_scan_path.clone());
        }
        if !self.interface.is_empty() {
            args.push("--interface".to_string());
            args.push(self.interface.clone());
        }
        args.push("--timeout".to_string());
        args.push("1000".to_string());
        if self.subnet.is_empty() {
            args.push("--localnet".to_string());
        } else {
            args.push(self.subnet.clone());
        }
        args
    }

    fn run_arp_scan(&self) -> anyhow::Result<Vec<ArpEntry>> {
        let program = if self.use_sudo { "sudo" } else { self.arp_scan_path.as_str() };
        let output = Command::new(program)
            .args(self.arp_scan_args())
            .output()
            .with_context(|| format!("failed to run {}", self.arp_scan_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("arp-scan exited with {}: {}", output.status, stderr.trim());
        }

        Ok(parse_arp_scan_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn read_neighbour_table(&self) -> anyhow::Result<Vec<ArpEntry>> {
        match Command::new("ip").args(["neigh", "show"]).output() {
            Ok(output) if output.status.success() => {
                return Ok(parse_ip_neigh_output(&String::from_utf8_lossy(&output.stdout)));
            }
            Ok(output) => debug!(status = %output.status, "ip neigh show failed"),
            Err(e) => debug!(error = %e, "ip not available"),
        }

        let table = std::fs::read_to_string(PROC_NET_ARP)
            .with_context(|| format!("failed to read {}", PROC_NET_ARP))?;
        Ok(parse_proc_net_arp(&table))
    }
}

impl NetworkScanner for ArpScanner {
    fn scan(&self) -> anyhow::Result<Vec<ArpEntry>> {
        match self.run_arp_scan() {
            Ok(entries) => {
                info!(devices = entries.len(), subnet = %self.subnet, "ARP scan completed");
                return Ok(entries);
            }
            Err(e) => warn!(
                kind = %FaultKind::Resolution,
                error = %e,
                "arp-scan unavailable, falling back to system neighbour table"
            ),
        }

        let entries = self.read_neighbour_table()?;
        info!(devices = entries.len(), "Read system neighbour table (fallback)");
        Ok(entries)
    }
}

/// Parse `arp-scan` output:
///
/// ```text
/// 192.168.2.1     00:1a:2b:3c:4d:5e       TP-LINK TECHNOLOGIES
/// 192.168.2.45    a8:42:a1:b9:53:23       (Unknown)
/// ```
///
/// Header and summary lines do not parse as an address pair and are skipped.
pub fn parse_arp_scan_output(output: &str) -> Vec<ArpEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let ip = parts.next()?;
            let mac = parts.next()?;
            ArpEntry::parse(ip, mac)
        })
        .collect()
}

/// Parse `ip neigh show` output:
///
/// ```text
/// 192.168.2.45 dev wlan0 lladdr a8:42:a1:b9:53:23 REACHABLE
/// 192.168.2.77 dev wlan0  FAILED
/// ```
pub fn parse_ip_neigh_output(output: &str) -> Vec<ArpEntry> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let ip = parts.first()?;
            let at = parts.iter().position(|p| *p == "lladdr")?;
            ArpEntry::parse(ip, parts.get(at + 1)?)
        })
        .collect()
}

/// Parse `/proc/net/arp`. Incomplete entries (flags 0x0) are skipped.
pub fn parse_proc_net_arp(table: &str) -> Vec<ArpEntry> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 || parts[2] == "0x0" {
                return None;
            }
            ArpEntry::parse(parts[0], parts[3])
        })
        .filter(|entry| entry.mac != "000000000000")
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arp_scan_output() {
        let output = "\
Interface: wlan0, type: EN10MB, MAC: dc:a6:32:00:00:01, IPv4: 192.168.2.1
Starting arp-scan 1.9.7 with 256 hosts (https://github.com/royhills/arp-scan)
192.168.2.10\ta8:42:a1:b9:53:23\tEspressif Inc.
192.168.2.11\tA8:42:A1:B9:53:30\t(Unknown)

2 packets received by filter, 0 packets dropped by kernel
Ending arp-scan 1.9.7: 256 hosts scanned in 1.952 seconds (131.15 hosts/sec). 2 responded
";
        let entries = parse_arp_scan_output(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ip.to_string(), "192.168.2.10");
        assert_eq!(entries[0].mac, "A842A1B95323");
        assert_eq!(entries[1].mac, "A842A1B95330");
    }

    #[test]
    fn parses_ip_neigh_and_skips_failed() {
        let output = "\
192.168.2.10 dev wlan0 lladdr a8:42:a1:b9:53:23 REACHABLE
192.168.2.77 dev wlan0  FAILED
fe80::1 dev wlan0 lladdr dc:a6:32:00:00:01 router STALE
";
        let entries = parse_ip_neigh_output(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mac, "A842A1B95323");
        assert!(entries[1].ip.is_ipv6());
    }

    #[test]
    fn parses_proc_net_arp() {
        let table = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.2.10     0x1         0x2         a8:42:a1:b9:53:23     *        wlan0
192.168.2.99     0x1         0x0         00:00:00:00:00:00     *        wlan0
";
        let entries = parse_proc_net_arp(table);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ip.to_string(), "192.168.2.10");
    }

    #[test]
    fn arp_scan_args_follow_config() {
        let scanner = ArpScanner::new(&DiscoverySection {
            interface: "wlan0".to_string(),
            subnet: "192.168.2.0/24".to_string(),
            use_sudo: true,
            ..DiscoverySection::default()
        });
        assert_eq!(
            scanner.arp_scan_args(),
            ["arp-scan", "--interface", "wlan0", "--timeout", "1000", "192.168.2.0/24"]
        );

        let local = ArpScanner::new(&DiscoverySection::default());
        assert_eq!(local.arp_scan_args(), ["--timeout", "1000", "--localnet"]);
    }
}
