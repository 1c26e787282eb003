use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
/// An action serialized by the CLI and sent to the daemon
pub enum Action {
    /// Broadcast a discovery request to find peers
    Discover,
    /// Query every known peer for its shared file list
    Search,
    /// Show the files found by the last search
    Ls,
    /// Download a found file from the peers that share it
    Download {
        file_name: String,
        save_path: Option<PathBuf>,
        wait: bool, // Block the reply until the download finishes
    },
    /// Show known peer addresses
    Peers,
    /// Register a peer directly, bypassing discovery
    AddPeer { addr: String },
    /// Show local address, serving port, peers and active downloads
    Status,
}
