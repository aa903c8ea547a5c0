//! mDNS service advertisement and browsing for peers of the same service type.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::netif;

pub const DEFAULT_SERVICE_TYPE: &str = "_reelshare._tcp.local.";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mdns: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

/// Advertises this node and browses for others. One instance name per process.
pub struct PeerDiscovery {
    daemon: ServiceDaemon,
    service_type: String,
    instance: String,
    registered: Mutex<Option<String>>,
}

impl PeerDiscovery {
    pub fn new(service_type: impl Into<String>) -> Result<Self, DiscoveryError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            service_type: service_type.into(),
            instance: format!("ReelPeer-{}", &id[..12]),
            registered: Mutex::new(None),
        })
    }

    pub fn instance_name(&self) -> &str {
        &self.instance
    }

    /// Advertise on `port`. Already registered: no-op. Failures are logged.
    pub fn register(&self, port: u16) {
        let Ok(mut registered) = self.registered.lock() else {
            return;
        };
        if registered.is_some() {
            debug!(instance = %self.instance, "already registered");
            return;
        }
        let Some(ip) = netif::best_local_ip() else {
            warn!("no local address, service not registered");
            return;
        };
        let host = format!("{}.local.", self.instance);
        let info = match ServiceInfo::new(
            &self.service_type,
            &self.instance,
            &host,
            &ip.to_string(),
            port,
            HashMap::<String, String>::new(),
        ) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "invalid service info");
                return;
            }
        };
        let fullname = info.get_fullname().to_string();
        match self.daemon.register(info) {
            Ok(()) => {
                info!(service = %fullname, %ip, port, "service registered");
                *registered = Some(fullname);
            }
            Err(e) => warn!(error = %e, "service registration failed"),
        }
    }

    pub fn unregister(&self) {
        let Ok(mut registered) = self.registered.lock() else {
            return;
        };
        if let Some(fullname) = registered.take() {
            match self.daemon.unregister(&fullname) {
                Ok(_) => info!(service = %fullname, "service unregistered"),
                Err(e) => warn!(service = %fullname, error = %e, "unregister failed"),
            }
        }
    }

    /// Browse for peers. Each item is the full current set of resolved, non-loopback addresses.
    /// Dropping the returned handle stops the browse.
    pub fn discover_peers(&self) -> Result<DiscoveredPeers, DiscoveryError> {
        let events = self.daemon.browse(&self.service_type)?;
        let (tx, rx) = mpsc::channel(16);
        let own = self.instance.clone();
        let task = tokio::spawn(async move {
            let mut state = ResolvedPeers::default();
            while let Ok(event) = events.recv_async().await {
                let change = match event {
                    ServiceEvent::ServiceFound(_, fullname) => {
                        debug!(service = %fullname, "service found, resolving");
                        continue;
                    }
                    ServiceEvent::ServiceResolved(info) => {
                        if info.get_fullname().starts_with(&own) {
                            continue;
                        }
                        PeerChange::Resolved {
                            fullname: info.get_fullname().to_string(),
                            addrs: info.get_addresses().iter().copied().collect(),
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => PeerChange::Removed { fullname },
                    ServiceEvent::SearchStopped(ty) => {
                        debug!(service_type = %ty, "search stopped");
                        break;
                    }
                    _ => continue,
                };
                if state.apply(change) && tx.send(state.addresses()).await.is_err() {
                    break;
                }
            }
        });
        Ok(DiscoveredPeers {
            rx,
            task,
            daemon: self.daemon.clone(),
            service_type: self.service_type.clone(),
        })
    }

    /// Unregister and stop the daemon thread.
    pub fn shutdown(&self) {
        self.unregister();
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mdns daemon shutdown failed");
        }
    }
}

/// Live browse results. Ends when the browse is stopped.
pub struct DiscoveredPeers {
    rx: mpsc::Receiver<BTreeSet<IpAddr>>,
    task: JoinHandle<()>,
    daemon: ServiceDaemon,
    service_type: String,
}

impl DiscoveredPeers {
    pub async fn recv(&mut self) -> Option<BTreeSet<IpAddr>> {
        self.rx.recv().await
    }
}

impl Drop for DiscoveredPeers {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            debug!(error = %e, "stop_browse failed");
        }
        self.task.abort();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerChange {
    Resolved { fullname: String, addrs: Vec<IpAddr> },
    Removed { fullname: String },
}

/// Addresses per advertised service, loopback excluded.
#[derive(Debug, Default)]
struct ResolvedPeers {
    by_service: BTreeMap<String, BTreeSet<IpAddr>>,
}

impl ResolvedPeers {
    fn apply(&mut self, change: PeerChange) -> bool {
        match change {
            PeerChange::Resolved { fullname, addrs } => {
                let addrs: BTreeSet<IpAddr> = addrs.into_iter().filter(|a| !a.is_loopback()).collect();
                if addrs.is_empty() {
                    return self.by_service.remove(&fullname).is_some();
                }
                if self.by_service.get(&fullname) == Some(&addrs) {
                    return false;
                }
                self.by_service.insert(fullname, addrs);
                true
            }
            PeerChange::Removed { fullname } => self.by_service.remove(&fullname).is_some(),
        }
    }

    fn addresses(&self) -> BTreeSet<IpAddr> {
        self.by_service.values().flatten().copied().collect()
    }
}
