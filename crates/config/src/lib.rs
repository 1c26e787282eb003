pub use std::net::Ipv4Addr;
use std::time::Duration;

pub const LOCALHOST: &str = "localhost";
pub const ANY_IFACE: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);
pub const FALLBACK_BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Well-known UDP port for peer membership messages.
pub const DISCOVERY_PORT: u16 = 8888;
/// Localhost TCP port the daemon accepts CLI actions on.
pub const CONTROL_PORT: u16 = 7711;

pub const CHUNK_SIZE: usize = 256_000;
pub const MAX_DATAGRAM: usize = 1024;

pub const DEFAULT_TTL: u32 = 3;
pub const PROCESSED_IDS_CAP: usize = 100;

pub const UDP_RECV_TIMEOUT: Duration = Duration::from_secs(3);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const PEER_TIMEOUT: Duration = Duration::from_secs(300);

pub const DOWNLOAD_WORKERS: usize = 4;
pub const MAX_RETRY_ATTEMPTS: u32 = 3;
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);

pub const SEARCH_WORKERS: usize = 5;
pub const SEARCH_CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);
pub const SEARCH_READ_TIMEOUT: Duration = Duration::from_secs(3);
