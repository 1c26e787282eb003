use serde::{Deserialize, Serialize};

use crate::entities::found_file::FoundFile;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
/// The daemon's reply to one [`Action`](crate::entities::Action)
pub enum Response {
    Ok,
    Err(String),
    /// Search hits, newest search wins
    Files { found: Vec<FoundFile> },
    /// Known peer addresses as `host:port`
    Peers { peers: Vec<String> },
    Status {
        local_addr: String,
        serving_port: u16,
        peers: Vec<String>,
        downloading: Vec<String>,
    },
}
