//! reelshare node: everything that touches sockets or the media directory.

pub mod beacon;
pub mod config;
pub mod direct_link;
pub mod fetcher;
pub mod http;
pub mod logging;
pub mod netif;
pub mod range_server;
pub mod seeder;
pub mod service_discovery;
pub mod store;

pub use beacon::{Beacon, BeaconConfig, PeerMap, PeerRecord};
pub use config::Config;
pub use fetcher::{DownloadJob, FetchError, FetchReport, Fetcher};
pub use range_server::RangeServer;
pub use seeder::Seeder;
pub use store::ChunkStore;
