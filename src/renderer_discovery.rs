//! mDNS discovery of cast renderers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent};

use crate::error::DiscoveryError;
use crate::renderer_registry::{DiscoverySink, RendererDiscoverer, RendererItem, RendererKind};

const DISCOVERY_POLL: Duration = Duration::from_millis(250);

/// Browses one mDNS service type and reports resolved services as cast
/// renderers until stopped.
pub struct MdnsRendererDiscoverer {
    name: String,
    service_type: String,
    daemon: Option<ServiceDaemon>,
    worker: Option<JoinHandle<()>>,
    stop_requested: Arc<AtomicBool>,
}

impl MdnsRendererDiscoverer {
    pub fn new(service_type: impl Into<String>) -> Self {
        let service_type = service_type.into();
        Self {
            name: format!("mdns:{}", service_type),
            service_type,
            daemon: None,
            worker: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl RendererDiscoverer for MdnsRendererDiscoverer {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, sink: DiscoverySink) -> Result<(), DiscoveryError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let mdns = ServiceDaemon::new()?;
        let browse_receiver = match mdns.browse(&self.service_type) {
            Ok(receiver) => receiver,
            Err(err) => {
                let _ = mdns.shutdown();
                return Err(err.into());
            }
        };

        self.stop_requested.store(false, Ordering::SeqCst);
        let stop_requested = Arc::clone(&self.stop_requested);
        let service_type = self.service_type.clone();
        let worker = thread::Builder::new()
            .name("mdns-discovery".to_string())
            .spawn(move || {
                // Removal events only carry the full service name.
                let mut ids_by_fullname: HashMap<String, String> = HashMap::new();
                while !stop_requested.load(Ordering::SeqCst) {
                    let Ok(event) = browse_receiver.recv_timeout(DISCOVERY_POLL) else {
                        continue;
                    };
                    match event {
                        ServiceEvent::ServiceResolved(service) => {
                            if let Some(item) = renderer_from_resolved_service(&service) {
                                ids_by_fullname
                                    .insert(service.get_fullname().to_string(), item.id.clone());
                                sink.item_added(item);
                            }
                        }
                        ServiceEvent::ServiceRemoved(_, fullname) => {
                            if let Some(id) = ids_by_fullname.remove(&fullname) {
                                sink.item_removed(&id);
                            }
                        }
                        _ => {}
                    }
                }
                debug!("MdnsRendererDiscoverer: browse loop for {} exited", service_type);
            });
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                let _ = mdns.shutdown();
                return Err(DiscoveryError::StartFailed {
                    name: self.name.clone(),
                    reason: err.to_string(),
                });
            }
        };

        self.daemon = Some(mdns);
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(mdns) = self.daemon.take() {
            if let Err(err) = mdns.stop_browse(&self.service_type) {
                debug!(
                    "MdnsRendererDiscoverer: failed to stop mDNS browse cleanly: {}",
                    err
                );
            }
            let _ = mdns.shutdown();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("MdnsRendererDiscoverer: browse thread panicked");
            }
        }
    }
}

impl Drop for MdnsRendererDiscoverer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn instance_name_from_fullname(fullname: &str) -> String {
    let trimmed = fullname.trim();
    trimmed
        .find("._")
        .map(|split| trimmed[..split].trim())
        .filter(|value| !value.is_empty())
        .unwrap_or(trimmed)
        .trim_matches('.')
        .to_string()
}

fn non_empty_property(service: &mdns_sd::ResolvedService, key: &str) -> Option<String> {
    service
        .get_property_val_str(key)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn renderer_from_resolved_service(service: &mdns_sd::ResolvedService) -> Option<RendererItem> {
    let mut v4_addresses: Vec<_> = service.get_addresses_v4().iter().copied().collect();
    v4_addresses.sort();
    let address = v4_addresses.first().map(ToString::to_string)?;

    let host = service.get_hostname().trim_end_matches('.').to_string();
    let port = service.get_port();
    let name = non_empty_property(service, "fn")
        .unwrap_or_else(|| instance_name_from_fullname(service.get_fullname()));
    let model = non_empty_property(service, "md").unwrap_or_default();
    let id = non_empty_property(service, "id")
        .unwrap_or_else(|| format!("{}:{}:{}", host, address, port));
    Some(RendererItem {
        id,
        name,
        kind: RendererKind::Cast,
        address,
        port,
        model,
    })
}
