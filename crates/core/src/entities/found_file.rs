use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// One search hit: a file name and the `host:port` of the peer serving it.
pub struct FoundFile {
    pub name: String,
    pub peer: String,
}
