//! LAN presence beacon: periodic UDP announce of local file ids, listener keeping the peer map.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reel_core::protocol::MAX_ANNOUNCE_LEN;
use reel_core::{Announce, DEFAULT_BEACON_PORT};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::netif;
use crate::store::ChunkStore;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Local bind address for both sending and receiving.
    pub bind: SocketAddr,
    /// Where announces go; normally the limited broadcast address on the beacon port.
    pub destination: SocketAddr,
    pub interval: Duration,
    /// Forget peers not heard from for this long. `None` keeps them until `stop()`.
    pub peer_ttl: Option<Duration>,
    /// Extra multicast group to join and announce to.
    pub multicast_group: Option<Ipv4Addr>,
    /// Address to announce instead of the interface-derived one.
    pub advertise_ip: Option<Ipv4Addr>,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self::on_port(DEFAULT_BEACON_PORT)
    }
}

impl BeaconConfig {
    pub fn on_port(port: u16) -> Self {
        Self {
            bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            destination: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
            interval: DEFAULT_INTERVAL,
            peer_ttl: None,
            multicast_group: None,
            advertise_ip: None,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            interval: cfg.beacon_interval(),
            peer_ttl: cfg.peer_ttl(),
            multicast_group: cfg.multicast_group,
            ..Self::on_port(cfg.beacon_port)
        }
    }

    fn port(&self) -> u16 {
        self.destination.port()
    }
}

/// What one peer last said about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: Ipv4Addr,
    pub advertised_files: BTreeSet<String>,
}

pub type PeerMap = BTreeMap<Ipv4Addr, PeerRecord>;

struct Running {
    shutdown: watch::Sender<bool>,
    socket: Arc<UdpSocket>,
    tasks: Vec<JoinHandle<()>>,
    multicast_group: Option<Ipv4Addr>,
}

/// Owns the socket and both loops while started. The listener is the only writer of the peer map.
pub struct Beacon {
    config: BeaconConfig,
    store: ChunkStore,
    peers: Arc<watch::Sender<PeerMap>>,
    running: Mutex<Option<Running>>,
}

impl Beacon {
    pub fn new(config: BeaconConfig, store: ChunkStore) -> Self {
        Self {
            config,
            store,
            peers: Arc::new(watch::Sender::new(PeerMap::new())),
            running: Mutex::new(None),
        }
    }

    /// Bind and launch the listener and broadcaster. A running beacon is restarted.
    pub async fn start(&self) -> io::Result<()> {
        self.stop().await;
        let socket = UdpSocket::bind(self.config.bind).await?;
        socket.set_broadcast(true)?;
        let mut multicast_group = None;
        if let Some(group) = self.config.multicast_group {
            match socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                Ok(()) => multicast_group = Some(group),
                Err(e) => warn!(%group, error = %e, "multicast join failed, broadcast only"),
            }
        }
        let bound = socket.local_addr()?;
        let socket = Arc::new(socket);
        let own_ip = self.config.advertise_ip.or_else(netif::best_local_ip);
        let (own_tx, own_rx) = watch::channel(own_ip);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut destinations = vec![self.config.destination];
        if let Some(g) = multicast_group {
            destinations.push(SocketAddr::V4(SocketAddrV4::new(g, self.config.port())));
        }

        let listener = tokio::spawn(listen_loop(
            socket.clone(),
            own_rx,
            self.peers.clone(),
            self.config.peer_ttl,
            shutdown_rx.clone(),
        ));
        let announcer = tokio::spawn(announce_loop(
            socket.clone(),
            self.store.clone(),
            self.config.advertise_ip,
            own_tx,
            destinations,
            self.config.interval,
            shutdown_rx,
        ));
        info!(bind = %bound, own_ip = ?own_ip, "beacon started");
        *self.running.lock().await = Some(Running {
            shutdown,
            socket,
            tasks: vec![listener, announcer],
            multicast_group,
        });
        Ok(())
    }

    /// Stop both loops, close the socket and forget every peer. Safe to call at any time.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            let _ = task.await;
        }
        if let Some(group) = running.multicast_group {
            if let Err(e) = running.socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                debug!(%group, error = %e, "multicast leave failed");
            }
        }
        drop(running.socket);
        self.peers.send_replace(PeerMap::new());
        info!("beacon stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Observe the peer map; every update is a complete snapshot.
    pub fn subscribe(&self) -> watch::Receiver<PeerMap> {
        self.peers.subscribe()
    }

    pub fn snapshot(&self) -> PeerMap {
        self.peers.borrow().clone()
    }

    pub fn discovered_ips(&self) -> BTreeSet<Ipv4Addr> {
        self.peers.borrow().keys().copied().collect()
    }

    /// Peers currently advertising `file`.
    pub fn peers_with(&self, file: &str) -> Vec<Ipv4Addr> {
        self.peers
            .borrow()
            .values()
            .filter(|r| r.advertised_files.contains(file))
            .map(|r| r.address)
            .collect()
    }
}

async fn next_sweep(sweep: &mut Option<Interval>) {
    match sweep {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn listen_loop(
    socket: Arc<UdpSocket>,
    own_ip: watch::Receiver<Option<Ipv4Addr>>,
    peers: Arc<watch::Sender<PeerMap>>,
    ttl: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 2 * MAX_ANNOUNCE_LEN];
    let mut last_seen: HashMap<Ipv4Addr, Instant> = HashMap::new();
    let mut sweep = ttl.map(|t| {
        let mut i = tokio::time::interval((t / 2).max(Duration::from_millis(50)));
        i.set_missed_tick_behavior(MissedTickBehavior::Delay);
        i
    });
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = next_sweep(&mut sweep) => {
                if let Some(ttl) = ttl {
                    expire(&peers, &mut last_seen, ttl);
                }
            }
            res = socket.recv_from(&mut buf) => match res {
                Ok((n, from)) => {
                    let Some(ann) = Announce::parse(&buf[..n]) else {
                        trace!(%from, "dropping foreign or malformed packet");
                        continue;
                    };
                    if Some(ann.ip) == *own_ip.borrow() {
                        continue;
                    }
                    last_seen.insert(ann.ip, Instant::now());
                    if upsert(&peers, ann) {
                        debug!(%from, peers = peers.borrow().len(), "peer map updated");
                    }
                }
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(error = %e, "beacon receive failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Insert or refresh one peer. Publishes only when the record actually changed.
fn upsert(peers: &watch::Sender<PeerMap>, ann: Announce) -> bool {
    let record = PeerRecord {
        address: ann.ip,
        advertised_files: ann.files,
    };
    peers.send_if_modified(|map| {
        if map.get(&record.address) == Some(&record) {
            return false;
        }
        info!(peer = %record.address, files = record.advertised_files.len(), "peer announced");
        map.insert(record.address, record);
        true
    })
}

fn expire(peers: &watch::Sender<PeerMap>, last_seen: &mut HashMap<Ipv4Addr, Instant>, ttl: Duration) {
    let now = Instant::now();
    let stale: Vec<Ipv4Addr> = last_seen
        .iter()
        .filter(|(_, seen)| now.duration_since(**seen) > ttl)
        .map(|(ip, _)| *ip)
        .collect();
    if stale.is_empty() {
        return;
    }
    for ip in &stale {
        last_seen.remove(ip);
    }
    peers.send_if_modified(|map| {
        let before = map.len();
        for ip in &stale {
            if map.remove(ip).is_some() {
                info!(peer = %ip, "peer expired");
            }
        }
        map.len() != before
    });
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    store: ChunkStore,
    fixed_ip: Option<Ipv4Addr>,
    own_ip: watch::Sender<Option<Ipv4Addr>>,
    destinations: Vec<SocketAddr>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        // interfaces come and go; re-resolve every round
        let ip = match fixed_ip {
            Some(ip) => Some(ip),
            None => tokio::task::spawn_blocking(netif::best_local_ip).await.ok().flatten(),
        };
        own_ip.send_if_modified(|cur| {
            let changed = *cur != ip;
            *cur = ip;
            changed
        });
        let Some(ip) = ip else {
            debug!("no usable local address, skipping announce");
            continue;
        };
        let s = store.clone();
        let files = tokio::task::spawn_blocking(move || s.inventory())
            .await
            .unwrap_or_default();
        let packet = Announce::new(ip, files).encode();
        for dest in &destinations {
            if let Err(e) = socket.send_to(packet.as_bytes(), dest).await {
                if *shutdown.borrow() {
                    return;
                }
                warn!(%dest, error = %e, "announce send failed");
            }
        }
        trace!(len = packet.len(), "announce sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(ip: [u8; 4], files: &[&str]) -> Announce {
        Announce::new(Ipv4Addr::from(ip), files.iter().copied())
    }

    #[test]
    fn upsert_publishes_only_changes() {
        let tx = watch::Sender::new(PeerMap::new());
        let mut rx = tx.subscribe();
        assert!(upsert(&tx, ann([10, 0, 0, 2], &["movie"])));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(!upsert(&tx, ann([10, 0, 0, 2], &["movie"])));
        assert!(!rx.has_changed().unwrap());
        assert!(upsert(&tx, ann([10, 0, 0, 2], &["movie", "clip"])));
        assert_eq!(tx.borrow()[&Ipv4Addr::new(10, 0, 0, 2)].advertised_files.len(), 2);
    }

    #[test]
    fn expire_drops_stale_peers() {
        let tx = watch::Sender::new(PeerMap::new());
        upsert(&tx, ann([10, 0, 0, 2], &["a"]));
        upsert(&tx, ann([10, 0, 0, 3], &["b"]));
        let mut seen = HashMap::new();
        seen.insert(Ipv4Addr::new(10, 0, 0, 2), Instant::now() - Duration::from_secs(60));
        seen.insert(Ipv4Addr::new(10, 0, 0, 3), Instant::now());
        expire(&tx, &mut seen, Duration::from_secs(10));
        let keys: Vec<_> = tx.borrow().keys().copied().collect();
        assert_eq!(keys, [Ipv4Addr::new(10, 0, 0, 3)]);
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let beacon = Beacon::new(BeaconConfig::on_port(0), ChunkStore::new(dir.path()));
        beacon.stop().await;
        beacon.stop().await;
        assert!(!beacon.is_running().await);
        assert!(beacon.snapshot().is_empty());
    }

    #[tokio::test]
    async fn bind_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut cfg = BeaconConfig::on_port(0);
        cfg.bind = taken.local_addr().unwrap();
        let beacon = Beacon::new(cfg, ChunkStore::new(dir.path()));
        assert!(beacon.start().await.is_err());
        assert!(!beacon.is_running().await);
    }

    #[tokio::test]
    async fn ignores_own_announce() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("movie.mp4"), b"x").unwrap();
        let scratch = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = scratch.local_addr().unwrap();
        drop(scratch);
        let cfg = BeaconConfig {
            bind: addr,
            destination: addr,
            interval: Duration::from_millis(50),
            peer_ttl: None,
            multicast_group: None,
            advertise_ip: Some(Ipv4Addr::new(10, 9, 9, 9)),
        };
        let beacon = Beacon::new(cfg, ChunkStore::new(dir.path()));
        beacon.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(beacon.snapshot().is_empty());
        beacon.stop().await;
    }
}
