//! Direct device-to-device link state: peers on the link and the group owner address.

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reel_core::address::is_direct_link;
use reel_core::{InterfaceAddr, DIRECT_LINK_GATEWAY};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::netif;

pub const ARP_TABLE: &str = "/proc/net/arp";
const INCOMPLETE_HW_ADDR: &str = "00:00:00:00:00:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    PeersChanged,
    ConnectionChanged { connected: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPeer {
    pub address: Ipv4Addr,
    pub hw_addr: String,
    pub device: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub group_owner: Ipv4Addr,
    pub is_group_owner: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("{0} not supported by this driver")]
    Unsupported(&'static str),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("link driver closed")]
    Closed,
}

/// Platform facility behind the direct link. Signals arrive on the subscribed channel.
#[async_trait]
pub trait LinkDriver: Send + Sync + 'static {
    async fn subscribe(&self) -> Result<mpsc::Receiver<LinkSignal>, LinkError>;
    async fn unsubscribe(&self);
    async fn request_peers(&self) -> Result<Vec<LinkPeer>, LinkError>;
    async fn request_connection_info(&self) -> Result<Option<ConnectionInfo>, LinkError>;
    async fn discover(&self) -> Result<(), LinkError>;
    async fn connect(&self, peer: &LinkPeer) -> Result<(), LinkError>;
}

/// State wrapper over a [`LinkDriver`]. Performs no data transfer.
pub struct DirectLink<D: LinkDriver> {
    driver: Arc<D>,
    peers: Arc<watch::Sender<Vec<LinkPeer>>>,
    connection: Arc<watch::Sender<Option<ConnectionInfo>>>,
    events: Mutex<Option<JoinHandle<()>>>,
}

impl<D: LinkDriver> DirectLink<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
            peers: Arc::new(watch::Sender::new(Vec::new())),
            connection: Arc::new(watch::Sender::new(None)),
            events: Mutex::new(None),
        }
    }

    /// Register for link and peer-list signals. Calling twice is a no-op.
    pub async fn initialize(&self) -> Result<(), LinkError> {
        if self.events.lock().map(|e| e.is_some()).unwrap_or(true) {
            return Ok(());
        }
        let mut signals = self.driver.subscribe().await?;
        let driver = self.driver.clone();
        let peers = self.peers.clone();
        let connection = self.connection.clone();
        let task = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                debug!(?signal, "link signal");
                match signal {
                    LinkSignal::PeersChanged => match driver.request_peers().await {
                        Ok(list) => {
                            peers.send_replace(list);
                        }
                        Err(e) => warn!(error = %e, "peer list request failed"),
                    },
                    LinkSignal::ConnectionChanged { connected: true } => {
                        match driver.request_connection_info().await {
                            Ok(Some(info)) => {
                                info!(group_owner = %info.group_owner, is_group_owner = info.is_group_owner, "direct link up");
                                connection.send_replace(Some(info));
                            }
                            Ok(None) => {
                                connection.send_replace(None);
                            }
                            Err(e) => {
                                warn!(error = %e, "connection info request failed");
                                connection.send_replace(None);
                            }
                        }
                    }
                    LinkSignal::ConnectionChanged { connected: false } => {
                        if connection.send_replace(None).is_some() {
                            info!("direct link down");
                        }
                    }
                }
            }
        });
        if let Ok(mut events) = self.events.lock() {
            *events = Some(task);
        }
        Ok(())
    }

    /// Ask the driver to scan for peers. Outcome is logged only.
    pub fn discover_peers(&self) {
        let driver = self.driver.clone();
        tokio::spawn(async move {
            match driver.discover().await {
                Ok(()) => debug!("peer discovery requested"),
                Err(e) => warn!(error = %e, "peer discovery failed"),
            }
        });
    }

    /// Ask the driver to connect to `peer`. Outcome is logged only.
    pub fn connect(&self, peer: LinkPeer) {
        let driver = self.driver.clone();
        tokio::spawn(async move {
            match driver.connect(&peer).await {
                Ok(()) => info!(peer = %peer.address, "connect requested"),
                Err(e) => warn!(peer = %peer.address, error = %e, "connect failed"),
            }
        });
    }

    /// Deregister from the driver and reset published state.
    pub async fn cleanup(&self) {
        let task = self.events.lock().ok().and_then(|mut e| e.take());
        if let Some(task) = task {
            task.abort();
            self.driver.unsubscribe().await;
        }
        self.peers.send_replace(Vec::new());
        self.connection.send_replace(None);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.borrow().is_some()
    }

    /// Gateway of the established link, if any.
    pub fn group_owner_address(&self) -> Option<Ipv4Addr> {
        let current = *self.connection.borrow();
        current.map(|c| c.group_owner)
    }

    pub fn peers(&self) -> Vec<LinkPeer> {
        self.peers.borrow().clone()
    }

    pub fn subscribe_peers(&self) -> watch::Receiver<Vec<LinkPeer>> {
        self.peers.subscribe()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<Option<ConnectionInfo>> {
        self.connection.subscribe()
    }
}

/// Parse the kernel neighbor table, skipping the header and incomplete entries.
pub fn parse_arp_table(text: &str) -> Vec<LinkPeer> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 6 {
                return None;
            }
            let address = cols[0].parse().ok()?;
            let hw_addr = cols[3];
            if hw_addr == INCOMPLETE_HW_ADDR {
                return None;
            }
            Some(LinkPeer {
                address,
                hw_addr: hw_addr.to_string(),
                device: cols[5].to_string(),
            })
        })
        .collect()
}

/// The local address that indicates an established direct link, if any.
pub fn find_link(addrs: &[InterfaceAddr]) -> Option<&InterfaceAddr> {
    addrs
        .iter()
        .find(|a| a.interface.starts_with("p2p") || is_direct_link(a.ip))
}

/// Driver that watches local interfaces for a direct-link interface instead of talking to a
/// platform service. Link formation itself is left to the OS.
pub struct InterfaceDriver {
    poll: Duration,
    arp_path: PathBuf,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl InterfaceDriver {
    pub fn new(poll: Duration) -> Self {
        Self {
            poll,
            arp_path: PathBuf::from(ARP_TABLE),
            poller: Mutex::new(None),
        }
    }

    async fn current_link() -> Option<InterfaceAddr> {
        let addrs = tokio::task::spawn_blocking(netif::interface_addrs).await.ok()?;
        find_link(&addrs).cloned()
    }

    async fn neighbors(arp_path: &Path, device: &str) -> io::Result<Vec<LinkPeer>> {
        let text = tokio::fs::read_to_string(arp_path).await?;
        Ok(parse_arp_table(&text)
            .into_iter()
            .filter(|p| p.device == device)
            .collect())
    }
}

#[async_trait]
impl LinkDriver for InterfaceDriver {
    async fn subscribe(&self) -> Result<mpsc::Receiver<LinkSignal>, LinkError> {
        let (tx, rx) = mpsc::channel(8);
        let poll = self.poll.max(Duration::from_millis(100));
        let arp_path = self.arp_path.clone();
        let task = tokio::spawn(async move {
            let mut link: Option<InterfaceAddr> = None;
            let mut peers: Vec<LinkPeer> = Vec::new();
            loop {
                let now = Self::current_link().await;
                if now.is_some() != link.is_some() {
                    let connected = now.is_some();
                    if tx.send(LinkSignal::ConnectionChanged { connected }).await.is_err() {
                        break;
                    }
                }
                link = now;
                let current = match &link {
                    Some(l) => Self::neighbors(&arp_path, &l.interface).await.unwrap_or_default(),
                    None => Vec::new(),
                };
                if current != peers {
                    peers = current;
                    if tx.send(LinkSignal::PeersChanged).await.is_err() {
                        break;
                    }
                }
                tokio::time::sleep(poll).await;
            }
        });
        if let Ok(mut p) = self.poller.lock() {
            if let Some(old) = p.replace(task) {
                old.abort();
            }
        }
        Ok(rx)
    }

    async fn unsubscribe(&self) {
        if let Some(task) = self.poller.lock().ok().and_then(|mut p| p.take()) {
            task.abort();
        }
    }

    async fn request_peers(&self) -> Result<Vec<LinkPeer>, LinkError> {
        match Self::current_link().await {
            Some(link) => Ok(Self::neighbors(&self.arp_path, &link.interface).await?),
            None => Ok(Vec::new()),
        }
    }

    async fn request_connection_info(&self) -> Result<Option<ConnectionInfo>, LinkError> {
        Ok(Self::current_link().await.map(|link| ConnectionInfo {
            group_owner: DIRECT_LINK_GATEWAY,
            is_group_owner: link.ip == DIRECT_LINK_GATEWAY,
        }))
    }

    async fn discover(&self) -> Result<(), LinkError> {
        // passive: the poller already reports whatever the OS has formed
        Ok(())
    }

    async fn connect(&self, _peer: &LinkPeer) -> Result<(), LinkError> {
        Err(LinkError::Unsupported("connect"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDriver {
        signals: Mutex<Option<mpsc::Sender<LinkSignal>>>,
        peers: Vec<LinkPeer>,
        info: Option<ConnectionInfo>,
    }

    impl FakeDriver {
        fn new(peers: Vec<LinkPeer>, info: Option<ConnectionInfo>) -> Self {
            Self {
                signals: Mutex::new(None),
                peers,
                info,
            }
        }
    }

    #[async_trait]
    impl LinkDriver for Arc<FakeDriver> {
        async fn subscribe(&self) -> Result<mpsc::Receiver<LinkSignal>, LinkError> {
            let (tx, rx) = mpsc::channel(8);
            *self.signals.lock().unwrap() = Some(tx);
            Ok(rx)
        }
        async fn unsubscribe(&self) {
            self.signals.lock().unwrap().take();
        }
        async fn request_peers(&self) -> Result<Vec<LinkPeer>, LinkError> {
            Ok(self.peers.clone())
        }
        async fn request_connection_info(&self) -> Result<Option<ConnectionInfo>, LinkError> {
            Ok(self.info)
        }
        async fn discover(&self) -> Result<(), LinkError> {
            Ok(())
        }
        async fn connect(&self, _peer: &LinkPeer) -> Result<(), LinkError> {
            Err(LinkError::Unsupported("connect"))
        }
    }

    fn signal(fake: &FakeDriver) -> mpsc::Sender<LinkSignal> {
        fake.signals.lock().unwrap().clone().unwrap()
    }

    fn peer(ip: [u8; 4]) -> LinkPeer {
        LinkPeer {
            address: Ipv4Addr::from(ip),
            hw_addr: "aa:bb:cc:dd:ee:ff".into(),
            device: "p2p-wlan0-0".into(),
        }
    }

    async fn changed<T>(rx: &mut watch::Receiver<T>) {
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn republishes_peers_and_connection() {
        let info = ConnectionInfo {
            group_owner: DIRECT_LINK_GATEWAY,
            is_group_owner: false,
        };
        let fake = Arc::new(FakeDriver::new(vec![peer([192, 168, 49, 20])], Some(info)));
        let link = DirectLink::new(fake.clone());
        link.initialize().await.unwrap();
        link.initialize().await.unwrap();
        let mut peers = link.subscribe_peers();
        let mut conn = link.subscribe_connection();

        signal(&fake).send(LinkSignal::PeersChanged).await.unwrap();
        changed(&mut peers).await;
        assert_eq!(link.peers(), vec![peer([192, 168, 49, 20])]);

        signal(&fake).send(LinkSignal::ConnectionChanged { connected: true }).await.unwrap();
        changed(&mut conn).await;
        assert!(link.is_connected());
        assert_eq!(link.group_owner_address(), Some(DIRECT_LINK_GATEWAY));

        signal(&fake).send(LinkSignal::ConnectionChanged { connected: false }).await.unwrap();
        changed(&mut conn).await;
        assert!(!link.is_connected());
        assert_eq!(link.group_owner_address(), None);
    }

    #[tokio::test]
    async fn cleanup_resets_state() {
        let fake = Arc::new(FakeDriver::new(vec![peer([192, 168, 49, 30])], None));
        let link = DirectLink::new(fake.clone());
        link.initialize().await.unwrap();
        let mut peers = link.subscribe_peers();
        signal(&fake).send(LinkSignal::PeersChanged).await.unwrap();
        changed(&mut peers).await;
        link.connect(peer([192, 168, 49, 30]));
        link.cleanup().await;
        assert!(link.peers().is_empty());
        assert!(fake.signals.lock().unwrap().is_none());
    }

    #[test]
    fn arp_table() {
        let text = "IP address       HW type     Flags       HW address            Mask     Device\n\
                    192.168.49.20    0x1         0x2         aa:bb:cc:dd:ee:01     *        p2p-wlan0-0\n\
                    192.168.49.21    0x1         0x0         00:00:00:00:00:00     *        p2p-wlan0-0\n\
                    10.0.0.1         0x1         0x2         aa:bb:cc:dd:ee:02     *        eth0\n\
                    garbage\n";
        let peers = parse_arp_table(text);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].address, Ipv4Addr::new(192, 168, 49, 20));
        assert_eq!(peers[0].device, "p2p-wlan0-0");
        assert_eq!(peers[1].device, "eth0");
    }

    #[test]
    fn link_detection() {
        let addrs = vec![
            InterfaceAddr::new("eth0", Ipv4Addr::new(10, 0, 0, 5)),
            InterfaceAddr::new("wlan1", Ipv4Addr::new(192, 168, 49, 33)),
        ];
        assert_eq!(find_link(&addrs).map(|a| a.interface.as_str()), Some("wlan1"));
        let named = vec![InterfaceAddr::new("p2p-wlan0-3", Ipv4Addr::new(172, 16, 0, 2))];
        assert!(find_link(&named).is_some());
        assert!(find_link(&addrs[..1]).is_none());
    }
}
