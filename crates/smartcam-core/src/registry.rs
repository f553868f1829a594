/// Static device registry: the allowed fleet by role and MAC.
///
/// Built once at startup from the `[[devices]]` configuration. Entries with
/// a malformed MAC, an empty name, or a MAC already claimed by an earlier
/// entry are skipped with a warning; the rest of the fleet is kept.

use std::collections::HashSet;

use tracing::warn;

use crate::device::{normalize_mac, DeviceConfig, DeviceRole};
use crate::fault::FaultKind;

/// A camera entry with its stable id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraEntry {
    pub id: u32,
    pub config: DeviceConfig,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    cameras: Vec<CameraEntry>,
    sensors: Vec<DeviceConfig>,
    server: Option<DeviceConfig>,
}

impl DeviceRegistry {
    pub fn new(entries: impl IntoIterator<Item = DeviceConfig>) -> Self {
        let mut registry = Self::default();
        let mut seen = HashSet::new();

        for mut entry in entries {
            let Some(mac) = normalize_mac(&entry.mac) else {
                warn!(
                    kind = %FaultKind::Configuration,
                    name = %entry.name,
                    mac = %entry.mac,
                    "Skipping device with malformed MAC"
                );
                continue;
            };
            if entry.name.trim().is_empty() {
                warn!(kind = %FaultKind::Configuration, mac = %mac, "Skipping device without a name");
                continue;
            }
            if !seen.insert(mac.clone()) {
                warn!(
                    kind = %FaultKind::Configuration,
                    name = %entry.name,
                    mac = %mac,
                    "Skipping duplicate MAC"
                );
                continue;
            }
            entry.mac = mac;

            match entry.role {
                DeviceRole::Camera => {
                    let id = registry.cameras.len() as u32 + 1;
                    registry.cameras.push(CameraEntry { id, config: entry });
                }
                DeviceRole::Sensor => registry.sensors.push(entry),
                DeviceRole::Server => {
                    if registry.server.is_some() {
                        warn!(
                            kind = %FaultKind::Configuration,
                            name = %entry.name,
                            "Only one server entry is used, ignoring"
                        );
                    } else {
                        registry.server = Some(entry);
                    }
                }
            }
        }

        registry
    }

    pub fn cameras(&self) -> &[CameraEntry] {
        &self.cameras
    }

    pub fn sensors(&self) -> &[DeviceConfig] {
        &self.sensors
    }

    pub fn server(&self) -> Option<&DeviceConfig> {
        self.server.as_ref()
    }

    pub fn camera(&self, id: u32) -> Option<&CameraEntry> {
        self.cameras.iter().find(|c| c.id == id)
    }

    /// Find any configured device by MAC (any separator, any case).
    pub fn lookup(&self, mac: &str) -> Option<&DeviceConfig> {
        let mac = normalize_mac(mac)?;
        self.cameras
            .iter()
            .map(|c| &c.config)
            .chain(self.sensors.iter())
            .chain(self.server.iter())
            .find(|d| d.mac == mac)
    }

    pub fn camera_id(&self, mac: &str) -> Option<u32> {
        let mac = normalize_mac(mac)?;
        self.cameras.iter().find(|c| c.config.mac == mac).map(|c| c.id)
    }

    /// Whether `mac` is configured with exactly `role`.
    pub fn is_allowed(&self, mac: &str, role: DeviceRole) -> bool {
        self.lookup(mac).is_some_and(|d| d.role == role)
    }

    pub fn len(&self) -> usize {
        self.cameras.len() + self.sensors.len() + usize::from(self.server.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, mac: &str, role: DeviceRole) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            mac: mac.to_string(),
            role,
            port: 81,
            stream_path: "/stream".to_string(),
        }
    }

    #[test]
    fn camera_ids_follow_config_order() {
        let registry = DeviceRegistry::new(vec![
            entry("esp32cam 1", "aa:aa:aa:aa:aa:01", DeviceRole::Camera),
            entry("sensor", "cc:cc:cc:cc:cc:01", DeviceRole::Sensor),
            entry("esp32cam 2", "aa:aa:aa:aa:aa:02", DeviceRole::Camera),
        ]);

        assert_eq!(registry.camera_id("AA:AA:AA:AA:AA:01"), Some(1));
        assert_eq!(registry.camera_id("aa-aa-aa-aa-aa-02"), Some(2));
        assert_eq!(registry.sensors().len(), 1);
    }

    #[test]
    fn malformed_and_duplicate_entries_are_skipped() {
        let registry = DeviceRegistry::new(vec![
            entry("bad", "not-a-mac", DeviceRole::Camera),
            entry("cam", "aa:aa:aa:aa:aa:01", DeviceRole::Camera),
            entry("dup", "AAAAAAAAAA01", DeviceRole::Sensor),
            entry("", "aa:aa:aa:aa:aa:03", DeviceRole::Camera),
        ]);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.cameras()[0].config.name, "cam");
        assert_eq!(registry.cameras()[0].id, 1);
    }

    #[test]
    fn is_allowed_checks_role() {
        let registry = DeviceRegistry::new(vec![
            entry("cam", "aa:aa:aa:aa:aa:01", DeviceRole::Camera),
            entry("sensor", "cc:cc:cc:cc:cc:01", DeviceRole::Sensor),
        ]);

        assert!(registry.is_allowed("aa:aa:aa:aa:aa:01", DeviceRole::Camera));
        assert!(!registry.is_allowed("cc:cc:cc:cc:cc:01", DeviceRole::Camera));
        assert!(!registry.is_allowed("ee:ee:ee:ee:ee:ee", DeviceRole::Camera));
    }
}
