use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{io, thread};

use chunkcast_config::{ANY_IFACE, CHUNK_SIZE};
use chunkcast_core::helpers::{chunk_count, create_buffer};
use chunkcast_core::wire;

use crate::catalog::{self, ShareFolder};
use crate::LOGGER;

pub const CMD_FILE_LIST: &str = "REQUEST_FILE_LIST";
pub const CMD_FILE_INFO: &str = "REQUEST_FILE_INFO";
pub const CMD_CHUNK: &str = "REQUEST_CHUNK";
pub const FILE_LIST_MARKER: &str = "FILE_LIST";

/// Source of the TCP port this node serves files on, announced in
/// discovery traffic.
pub trait ServingPort: Send + Sync {
    fn serving_port(&self) -> u16;
}

/// TCP side of the node: answers file-list, file-info and chunk requests
/// from other peers. Bound to an OS-assigned port; one handler thread per
/// accepted connection.
pub struct FileServer {
    listener: TcpListener,
    port: u16,
    share: Arc<dyn ShareFolder>,
    running: AtomicBool,
}

impl FileServer {
    pub fn bind(share: Arc<dyn ShareFolder>) -> io::Result<Self> {
        let listener = TcpListener::bind((ANY_IFACE, 0))?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            port,
            share,
            running: AtomicBool::new(true),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept loop. Runs until [`shutdown`](Self::shutdown).
    pub fn run(&self) {
        LOGGER.info(format!("file server listening on port {}", self.port));
        for stream in self.listener.incoming() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let share = self.share.clone();
                    thread::spawn(move || {
                        let peer = stream
                            .peer_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_else(|_| String::from("unknown"));
                        if let Err(e) = handle_connection(stream, share) {
                            LOGGER.error(format!("connection from {} aborted: {}", peer, e));
                        }
                    });
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        LOGGER.error(format!("accept failed: {}", e));
                    }
                }
            }
        }
        LOGGER.info("file server stopped");
    }

    /// Stop the accept loop. The self-connect unblocks a pending accept.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = TcpStream::connect(("127.0.0.1", self.port));
    }
}

impl ServingPort for FileServer {
    fn serving_port(&self) -> u16 {
        self.port
    }
}

/// Read one command string and dispatch it. Any I/O error aborts this
/// connection only; sockets and file handles close on every exit path.
fn handle_connection(mut stream: TcpStream, share: Arc<dyn ShareFolder>) -> io::Result<()> {
    let command = wire::read_string(&mut stream)?;
    let command = command.trim();

    if command == CMD_FILE_LIST {
        send_file_list(&mut stream, share.as_ref())
    } else if let Some(name) = command.strip_prefix(CMD_FILE_INFO) {
        send_file_info(&mut stream, share.as_ref(), name.trim())
    } else if let Some(rest) = command.strip_prefix(CMD_CHUNK) {
        send_chunk(&mut stream, share.as_ref(), rest.trim())
    } else {
        LOGGER.info(format!("unknown command: {}", command));
        wire::write_string(&mut stream, "ERROR: unknown command")
    }
}

fn send_file_list(stream: &mut TcpStream, share: &dyn ShareFolder) -> io::Result<()> {
    let names = catalog::list_files(share);
    LOGGER.debug(format!("serving file list with {} names", names.len()));
    wire::write_string(stream, FILE_LIST_MARKER)?;
    wire::write_u32(stream, names.len() as u32)?;
    for name in &names {
        wire::write_string(stream, name)?;
    }
    stream.flush()
}

fn send_file_info(stream: &mut TcpStream, share: &dyn ShareFolder, name: &str) -> io::Result<()> {
    let length = shared_file_len(share, name);
    match length {
        Some(len) => {
            LOGGER.debug(format!("file info '{}' -> {} bytes", name, len));
            wire::write_u64(stream, len)?;
        }
        None => {
            LOGGER.info(format!("file info requested for unshared '{}'", name));
            wire::write_u64(stream, wire::NO_SUCH_FILE)?;
        }
    }
    stream.flush()
}

/// `<name> <id>` tail of a chunk command. The id is the last
/// space-separated token so names may contain spaces.
fn parse_chunk_request(tail: &str) -> Option<(&str, i64)> {
    let (name, id) = tail.rsplit_once(' ')?;
    let id: i64 = id.parse().ok()?;
    Some((name.trim(), id))
}

fn send_chunk(stream: &mut TcpStream, share: &dyn ShareFolder, tail: &str) -> io::Result<()> {
    let refused = |stream: &mut TcpStream| -> io::Result<()> {
        wire::write_u32(stream, wire::NO_SUCH_CHUNK)?;
        stream.flush()
    };

    let (name, id) = match parse_chunk_request(tail) {
        Some(parsed) => parsed,
        None => {
            LOGGER.info(format!("malformed chunk request: {}", tail));
            return refused(stream);
        }
    };
    let length = match shared_file_len(share, name) {
        Some(len) => len,
        None => {
            LOGGER.info(format!("chunk requested for unshared '{}'", name));
            return refused(stream);
        }
    };
    let chunks = chunk_count(length, CHUNK_SIZE) as i64;
    if id < 0 || id >= chunks {
        LOGGER.info(format!(
            "chunk {} of '{}' out of range (have {})",
            id, name, chunks
        ));
        return refused(stream);
    }

    let mut file = File::open(share.dir().join(name))?;
    file.seek(SeekFrom::Start(id as u64 * CHUNK_SIZE as u64))?;
    let mut buf = create_buffer(CHUNK_SIZE);
    let mut filled = 0;
    // The final chunk is short; read until the buffer is full or EOF.
    loop {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    wire::write_u32(stream, id as u32)?;
    wire::write_u32(stream, filled as u32)?;
    stream.write_all(&buf[..filled])?;
    stream.flush()?;

    let ack = wire::read_u32(stream)?;
    if ack != id as u32 {
        LOGGER.error(format!(
            "ack mismatch for chunk {} of '{}': got {}",
            id, name, ack
        ));
    }
    Ok(())
}

fn shared_file_len(share: &dyn ShareFolder, name: &str) -> Option<u64> {
    if !catalog::is_plain_name(name) {
        return None;
    }
    let path = share.dir().join(name);
    let meta = std::fs::metadata(&path).ok()?;
    if meta.is_file() {
        Some(meta.len())
    } else {
        None
    }
}
