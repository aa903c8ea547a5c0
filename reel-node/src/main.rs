//! reel-node: LAN media node (beacon, mDNS, seeder, range server) and one-shot fetch client.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use reel_node::direct_link::{DirectLink, InterfaceDriver};
use reel_node::service_discovery::{DiscoveredPeers, PeerDiscovery};
use reel_node::{config, logging, Beacon, BeaconConfig, ChunkStore, Config, DownloadJob, Fetcher, RangeServer, Seeder};
use tokio::task::JoinSet;
use tracing::{info, warn};

const LINK_POLL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "reel-node", version, about = "LAN peer-to-peer media node")]
struct Cli {
    /// Config file; default search is ~/.config/reelshare then /etc/reelshare.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run beacon, seeder, range server, mDNS registration and direct-link monitor.
    Serve,
    /// Fetch one title from a peer's seeder and verify it.
    Fetch {
        host: String,
        title: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        parallelism: Option<usize>,
    },
    /// Listen for peers for a while and print what was found.
    Peers {
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref());
    logging::init(&cfg.log_level);

    match cli.command {
        Command::Serve => serve(cfg).await,
        Command::Fetch {
            host,
            title,
            port,
            parallelism,
        } => fetch(cfg, host, title, port, parallelism).await,
        Command::Peers { wait_secs } => peers(cfg, Duration::from_secs(wait_secs)).await,
    }
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&cfg.media_dir)
        .await
        .with_context(|| format!("create media dir {}", cfg.media_dir.display()))?;
    let store = ChunkStore::new(&cfg.media_dir);
    let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    let seeder = Seeder::bind(SocketAddr::new(any, cfg.seeder_port), store.clone())
        .await
        .context("bind seeder")?;
    let seeder_port = seeder.local_addr()?.port();
    let range = RangeServer::bind(SocketAddr::new(any, cfg.range_port), cfg.media_dir.clone())
        .await
        .context("bind range server")?;
    let mut servers = JoinSet::new();
    servers.spawn(seeder.run());
    servers.spawn(range.run());

    let beacon = Beacon::new(BeaconConfig::from_config(&cfg), store.clone());
    beacon.start().await.context("start beacon")?;

    let discovery = match PeerDiscovery::new(cfg.service_type.clone()) {
        Ok(d) => {
            d.register(seeder_port);
            Some(d)
        }
        Err(e) => {
            warn!(error = %e, "mDNS unavailable");
            None
        }
    };

    let link = DirectLink::new(InterfaceDriver::new(LINK_POLL));
    match link.initialize().await {
        Ok(()) => link.discover_peers(),
        Err(e) => warn!(error = %e, "direct link monitor unavailable"),
    }

    info!(media = %cfg.media_dir.display(), "node running");
    let outcome = tokio::select! {
        r = shutdown_signal() => r,
        Some(exited) = servers.join_next() => Err(anyhow::anyhow!("server exited: {exited:?}")),
    };

    info!("shutting down");
    beacon.stop().await;
    link.cleanup().await;
    if let Some(d) = discovery {
        d.shutdown();
    }
    servers.abort_all();
    outcome
}

async fn fetch(
    cfg: Config,
    host: String,
    title: String,
    port: Option<u16>,
    parallelism: Option<usize>,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&cfg.media_dir)
        .await
        .with_context(|| format!("create media dir {}", cfg.media_dir.display()))?;
    let fetcher = Fetcher::new(ChunkStore::new(&cfg.media_dir), cfg.connect_timeout(), cfg.read_timeout())?;
    let job = DownloadJob::new(title.clone(), host, port.unwrap_or(cfg.seeder_port))
        .with_parallelism(parallelism.unwrap_or_else(|| cfg.parallelism()));
    let report = fetcher.fetch(&job).await.with_context(|| format!("fetch {title}"))?;
    println!(
        "{}\tdownloaded={} skipped={} verified={}",
        report.path.display(),
        report.downloaded,
        report.skipped,
        report.verified
    );
    Ok(())
}

async fn peers(cfg: Config, wait: Duration) -> anyhow::Result<()> {
    let beacon = Beacon::new(BeaconConfig::from_config(&cfg), ChunkStore::new(&cfg.media_dir));
    let beacon_up = match beacon.start().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, port = cfg.beacon_port, "beacon unavailable");
            false
        }
    };
    let discovery = PeerDiscovery::new(cfg.service_type.clone()).ok();
    let mut browse = discovery.as_ref().and_then(|d| match d.discover_peers() {
        Ok(b) => Some(b),
        Err(e) => {
            warn!(error = %e, "mDNS browse failed");
            None
        }
    });
    if !beacon_up && browse.is_none() {
        bail!("neither beacon nor mDNS could be started");
    }

    let mut mdns = BTreeSet::new();
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            next = next_browse(&mut browse) => match next {
                Some(set) => mdns = set,
                None => browse = None,
            },
        }
    }

    for record in beacon.snapshot().values() {
        let files: Vec<&str> = record.advertised_files.iter().map(String::as_str).collect();
        println!("{}\tbeacon\t{}", record.address, files.join(","));
    }
    for ip in &mdns {
        println!("{ip}\tmdns");
    }
    beacon.stop().await;
    drop(browse);
    if let Some(d) = discovery {
        d.shutdown();
    }
    Ok(())
}

async fn next_browse(browse: &mut Option<DiscoveredPeers>) -> Option<BTreeSet<IpAddr>> {
    match browse {
        Some(b) => b.recv().await,
        None => std::future::pending().await,
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
