use std::collections::HashMap;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, error};

use smartcam_core::publisher::{ServiceAdvertiser, ServiceRecord};

/// DNS-SD advertiser backed by an `mdns-sd` daemon.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
}

impl MdnsAdvertiser {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
        })
    }

    /// Stop the daemon. Call after every record has been withdrawn.
    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            error!("Failed to shut down mDNS daemon: {}", e);
        }
    }
}

impl ServiceAdvertiser for MdnsAdvertiser {
    fn register(&self, record: &ServiceRecord) -> anyhow::Result<()> {
        let addresses = record
            .addresses
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let properties: HashMap<String, String> = record
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut info = ServiceInfo::new(
            &record.service_type,
            &record.instance_name,
            &record.host_name,
            addresses.as_str(),
            record.port,
            properties,
        )?;
        if record.addresses.is_empty() {
            info = info.enable_addr_auto();
        }

        self.daemon.register(info)?;
        debug!(service = %record.service_name, "mDNS record published");
        Ok(())
    }

    fn unregister(&self, service_name: &str) -> anyhow::Result<()> {
        self.daemon.unregister(service_name)?;
        Ok(())
    }
}
