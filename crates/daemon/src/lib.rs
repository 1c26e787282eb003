use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;

use chunkcast_config::LOCALHOST;
use chunkcast_core::entities::{Action, FoundFile, Response};
use chunkcast_core::helpers::create_buffer;
use chunkcast_core::progress::{DownloadStatus, ProgressSink};
use chunkcast_core::utils::Logger;

pub mod catalog;
pub mod discovery;
pub mod download;
pub mod net;
pub mod search;
pub mod server;

use discovery::DiscoveryService;
use download::{download_file, DownloadRequest};
use server::FileServer;

pub(crate) static LOGGER: Logger = Logger::verbose("daemon");

/// Everything the control surface needs a handle on.
pub struct NodeState {
    pub server: Arc<FileServer>,
    pub discovery: Arc<DiscoveryService>,
    pub dest_dir: PathBuf,
    pub sink: Arc<dyn ProgressSink>,
    /// Hits of the most recent search.
    pub found: Mutex<Vec<FoundFile>>,
    /// Files with a download currently running.
    pub downloading: Arc<Mutex<Vec<String>>>,
    pub search_cancel: Arc<AtomicBool>,
}

/// Accept CLI connections and process one action per connection.
pub fn run_control_loop(state: Arc<NodeState>, port: u16) -> io::Result<()> {
    let listener = TcpListener::bind((LOCALHOST, port))?;
    LOGGER.info(format!("control interface on {}:{}", LOCALHOST, port));
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = state.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_control(&state, stream) {
                        LOGGER.error(format!("control connection failed: {}", e));
                    }
                });
            }
            Err(e) => {
                LOGGER.error(format!("control accept failed: {}", e));
            }
        }
    }
    Ok(())
}

fn handle_control(state: &Arc<NodeState>, mut stream: TcpStream) -> io::Result<()> {
    let mut buf = create_buffer(4096);
    let size = stream.read(&mut buf)?;
    let action: Action = serde_json::from_slice(&buf[..size])?;
    LOGGER.debug(format!("control action: {:?}", action));
    let response = action_processor(state, &action);
    let serialized = serde_json::to_string(&response)?;
    stream.write_all(serialized.as_bytes())
}

/// Processing an action from the CLI
pub fn action_processor(state: &Arc<NodeState>, action: &Action) -> Response {
    match action {
        Action::Discover => {
            state.discovery.send_discovery_request();
            Response::Ok
        }
        Action::Search => {
            let peers = state.discovery.peer_addresses();
            if peers.is_empty() {
                // Kick off discovery so a retry has something to query.
                state.discovery.send_discovery_request();
                return Response::Err(String::from(
                    "No peers known yet; sent a discovery request, try again shortly.",
                ));
            }
            let hits = search::search_peers(&peers, &state.sink, &state.search_cancel);
            *state.found.lock().unwrap() = hits.clone();
            Response::Files { found: hits }
        }
        Action::Ls => Response::Files {
            found: state.found.lock().unwrap().clone(),
        },
        Action::Download {
            file_name,
            save_path,
            wait,
        } => download_action(state, file_name, save_path.clone(), *wait),
        Action::Peers => Response::Peers {
            peers: state.discovery.peer_addresses(),
        },
        Action::AddPeer { addr } => match net::parse_peer_key(addr) {
            Some(SocketAddr::V4(v4)) => {
                state.discovery.add_peer(*v4.ip(), v4.port());
                Response::Ok
            }
            _ => Response::Err(format!(
                "Invalid peer address '{}', expected IP:PORT.",
                addr
            )),
        },
        Action::Status => Response::Status {
            local_addr: state.discovery.local_info(),
            serving_port: state.server.port(),
            peers: state.discovery.peer_addresses(),
            downloading: state.downloading.lock().unwrap().clone(),
        },
    }
}

fn download_action(
    state: &Arc<NodeState>,
    file_name: &str,
    save_path: Option<PathBuf>,
    wait: bool,
) -> Response {
    let peers: Vec<String> = state
        .found
        .lock()
        .unwrap()
        .iter()
        .filter(|found| found.name == file_name)
        .map(|found| found.peer.clone())
        .collect();
    if peers.is_empty() {
        return Response::Err(format!(
            "'{}' is not in the last search results. Run a search first.",
            file_name
        ));
    }
    {
        let mut downloading = state.downloading.lock().unwrap();
        if downloading.iter().any(|name| name == file_name) {
            return Response::Err(format!("'{}' is already being downloaded.", file_name));
        }
        downloading.push(file_name.to_string());
    }

    let request = DownloadRequest {
        file_name: file_name.to_string(),
        peers,
        dest_dir: save_path.unwrap_or_else(|| state.dest_dir.clone()),
    };
    let sink = state.sink.clone();
    let downloading = state.downloading.clone();
    let name = file_name.to_string();
    let worker = thread::spawn(move || {
        let status = download_file(request, sink);
        downloading.lock().unwrap().retain(|line| *line != name);
        status
    });

    if wait {
        match worker.join() {
            Ok(DownloadStatus::Completed) => Response::Ok,
            Ok(status) => Response::Err(status.to_string()),
            Err(_) => Response::Err(String::from("download worker panicked")),
        }
    } else {
        Response::Ok
    }
}
