//! Multi-source parallel download engine.
//!
//! A job validates the file length against every candidate peer, creates
//! the destination file at its full size, then pulls chunks over a bounded
//! worker pool. Peers that keep failing are blacklisted for the rest of
//! the job only; the file is written under a single lock so chunk
//! completion order never matters.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::{fs, io};

use chunkcast_config::{CHUNK_SIZE, DOWNLOAD_WORKERS, MAX_RETRY_ATTEMPTS, TRANSFER_TIMEOUT};
use chunkcast_core::helpers::chunk_count;
use chunkcast_core::progress::{DownloadStatus, ProgressSink};
use chunkcast_core::wire;
use rand::seq::SliceRandom;
use rand::thread_rng;
use threadpool::ThreadPool;

use crate::net::parse_peer_key;
use crate::server::{CMD_CHUNK, CMD_FILE_INFO};
use crate::LOGGER;

/// What a download job needs to start: the file, the candidate peer keys
/// from the last search, and where to put the result.
pub struct DownloadRequest {
    pub file_name: String,
    pub peers: Vec<String>,
    pub dest_dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    /// The peer answered with the negative sentinel.
    #[error("peer does not have the chunk")]
    Refused,
    #[error("malformed chunk reply: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A validated peer: its canonical key plus the parsed address.
#[derive(Clone)]
struct Peer {
    key: String,
    addr: SocketAddr,
}

/// Shared state of one running job.
struct DownloadJob {
    file_name: String,
    chunks: u32,
    file: Mutex<fs::File>,
    completed: Mutex<HashSet<u32>>,
    done_count: AtomicU32,
    /// Consecutive failures per peer key; reset on success.
    failures: Mutex<HashMap<String, u32>>,
    /// Set when a local write fails; the whole job reports Error.
    local_io_failed: AtomicBool,
}

impl DownloadJob {
    fn record_failure(&self, peer: &str) {
        let mut failures = self.failures.lock().unwrap();
        *failures.entry(peer.to_string()).or_insert(0) += 1;
    }

    fn reset_failures(&self, peer: &str) {
        self.failures.lock().unwrap().insert(peer.to_string(), 0);
    }

    fn is_blacklisted(&self, peer: &str) -> bool {
        self.failures
            .lock()
            .unwrap()
            .get(peer)
            .is_some_and(|count| *count >= MAX_RETRY_ATTEMPTS)
    }

    /// Seek + write under the single file lock. The file was pre-sized, so
    /// interior seeks never race with a length change.
    fn write_chunk(&self, id: u32, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(id as u64 * CHUNK_SIZE as u64))?;
        file.write_all(bytes)
    }

    /// Mark a chunk complete; returns the new completion count.
    fn mark_done(&self, id: u32) -> u32 {
        let mut completed = self.completed.lock().unwrap();
        if !completed.insert(id) {
            return self.done_count.load(Ordering::SeqCst);
        }
        self.done_count.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Run one download job to its terminal status. Everything recoverable is
/// handled inside; the caller only sees the status that was also posted to
/// the sink.
pub fn download_file(request: DownloadRequest, sink: Arc<dyn ProgressSink>) -> DownloadStatus {
    let file_name = request.file_name.clone();
    let status = run_job(request, &sink);
    sink.update_progress(&file_name, status);
    status
}

fn run_job(request: DownloadRequest, sink: &Arc<dyn ProgressSink>) -> DownloadStatus {
    let DownloadRequest {
        file_name,
        peers,
        dest_dir,
    } = request;

    // Peer keys that do not parse as IPv4 host:port are dropped up front.
    let candidates: Vec<Peer> = peers
        .iter()
        .filter_map(|key| {
            let addr = parse_peer_key(key);
            if addr.is_none() {
                LOGGER.debug(format!("dropping unparseable peer {}", key));
            }
            Some(Peer {
                key: key.clone(),
                addr: addr?,
            })
        })
        .collect();

    // Phase 1: size agreement. The first peer to report a length declares
    // it; only peers reporting the same length stay in the job.
    let (length, validated) = match size_agreement(&file_name, &candidates, sink) {
        Some(agreed) => agreed,
        None => {
            sink.log(&format!("no peer could provide '{}'", file_name));
            return DownloadStatus::FileNotFound;
        }
    };
    sink.log(&format!(
        "'{}' is {} bytes on {} peer(s)",
        file_name,
        length,
        validated.len()
    ));

    // Phase 2: create the destination at full size so every chunk write
    // can seek straight to its offset.
    let path = dest_dir.join(&file_name);
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .and_then(|file| {
            file.set_len(length)?;
            Ok(file)
        }) {
        Ok(file) => file,
        Err(e) => {
            sink.log(&format!("cannot prepare '{}': {}", path.display(), e));
            return DownloadStatus::Error;
        }
    };

    // An empty file is complete the moment it exists.
    if length == 0 {
        return DownloadStatus::Completed;
    }

    let chunks = chunk_count(length, CHUNK_SIZE);
    let job = Arc::new(DownloadJob {
        file_name: file_name.clone(),
        chunks,
        file: Mutex::new(file),
        completed: Mutex::new(HashSet::new()),
        done_count: AtomicU32::new(0),
        failures: Mutex::new(HashMap::new()),
        local_io_failed: AtomicBool::new(false),
    });
    sink.update_progress(&file_name, DownloadStatus::Percent(0));

    if chunks == 1 && length < CHUNK_SIZE as u64 {
        small_file_download(&job, &validated, length, sink)
    } else {
        parallel_download(&job, &validated, sink)
    }
}

/// Ask every candidate for the file length. The first positive reply
/// declares the length; only peers reporting the same length stay in the
/// job. All-zero replies declare an empty file with no peers to pull from.
fn size_agreement(
    file_name: &str,
    candidates: &[Peer],
    sink: &Arc<dyn ProgressSink>,
) -> Option<(u64, Vec<Peer>)> {
    let mut replies: Vec<(Peer, u64)> = Vec::new();
    for peer in candidates {
        match request_file_info(peer.addr, file_name) {
            Ok(Some(length)) => replies.push((peer.clone(), length)),
            Ok(None) => {
                LOGGER.debug(format!("{} does not share '{}'", peer.key, file_name));
            }
            Err(e) => {
                sink.log(&format!("size query to {} failed: {}", peer.key, e));
            }
        }
    }

    let declared = match replies.iter().find(|(_, length)| *length > 0) {
        Some((_, length)) => *length,
        // Every reply was zero bytes: nothing to transfer.
        None if !replies.is_empty() => return Some((0, Vec::new())),
        None => return None,
    };
    let validated: Vec<Peer> = replies
        .iter()
        .filter(|(_, length)| *length == declared)
        .map(|(peer, _)| peer.clone())
        .collect();
    for (peer, length) in &replies {
        if *length != declared {
            sink.log(&format!(
                "excluding {}: reports {} bytes, expected {}",
                peer.key, length, declared
            ));
        }
    }
    Some((declared, validated))
}

/// One request/reply on a fresh connection: `None` means the peer does not
/// share the file.
fn request_file_info(addr: SocketAddr, file_name: &str) -> io::Result<Option<u64>> {
    let mut stream = TcpStream::connect_timeout(&addr, TRANSFER_TIMEOUT)?;
    stream.set_read_timeout(Some(TRANSFER_TIMEOUT))?;
    stream.set_write_timeout(Some(TRANSFER_TIMEOUT))?;
    wire::write_string(&mut stream, &format!("{} {}", CMD_FILE_INFO, file_name))?;
    stream.flush()?;
    let length = wire::read_u64(&mut stream)?;
    if length == wire::NO_SUCH_FILE {
        Ok(None)
    } else {
        Ok(Some(length))
    }
}

/// An open chunk reply whose payload has been read but not yet
/// acknowledged. The ack goes back only after the bytes hit the disk.
struct ChunkTransfer {
    stream: TcpStream,
    id: u32,
    bytes: Vec<u8>,
}

impl ChunkTransfer {
    fn ack(mut self) {
        if let Err(e) = wire::write_u32(&mut self.stream, self.id) {
            LOGGER.debug(format!("ack for chunk {} not delivered: {}", self.id, e));
        }
    }
}

fn request_chunk(addr: SocketAddr, file_name: &str, id: u32) -> Result<ChunkTransfer, FetchError> {
    let mut stream = TcpStream::connect_timeout(&addr, TRANSFER_TIMEOUT)?;
    stream.set_read_timeout(Some(TRANSFER_TIMEOUT))?;
    stream.set_write_timeout(Some(TRANSFER_TIMEOUT))?;
    wire::write_string(&mut stream, &format!("{} {} {}", CMD_CHUNK, file_name, id))?;
    stream.flush()?;

    let returned = wire::read_u32(&mut stream)?;
    if returned == wire::NO_SUCH_CHUNK {
        return Err(FetchError::Refused);
    }
    if returned != id {
        return Err(FetchError::Malformed("reply for a different chunk"));
    }
    let size = wire::read_u32(&mut stream)?;
    if size as usize > CHUNK_SIZE {
        return Err(FetchError::Malformed("chunk larger than chunk size"));
    }
    let bytes = wire::read_blob(&mut stream, size as usize)?;
    Ok(ChunkTransfer {
        stream,
        id,
        bytes,
    })
}

/// Single-chunk fast path: try peers in order, no worker pool.
fn small_file_download(
    job: &Arc<DownloadJob>,
    validated: &[Peer],
    length: u64,
    sink: &Arc<dyn ProgressSink>,
) -> DownloadStatus {
    for peer in validated {
        if job.is_blacklisted(&peer.key) {
            continue;
        }
        match request_chunk(peer.addr, &job.file_name, 0) {
            Ok(transfer) => {
                let take = (length as usize).min(transfer.bytes.len());
                match job.write_chunk(0, &transfer.bytes[..take]) {
                    Ok(()) => {
                        transfer.ack();
                        job.reset_failures(&peer.key);
                        job.mark_done(0);
                        sink.update_progress(&job.file_name, DownloadStatus::Percent(100));
                        return DownloadStatus::Completed;
                    }
                    Err(e) => {
                        sink.log(&format!("cannot write '{}': {}", job.file_name, e));
                        return DownloadStatus::Error;
                    }
                }
            }
            Err(e) => {
                LOGGER.debug(format!(
                    "chunk 0 of '{}' from {} failed: {}",
                    job.file_name, peer.key, e
                ));
                job.record_failure(&peer.key);
            }
        }
    }
    DownloadStatus::Incomplete
}

/// General path: every chunk id goes through the worker pool in shuffled
/// order; each worker rotates through its own shuffled view of the peers.
fn parallel_download(
    job: &Arc<DownloadJob>,
    validated: &[Peer],
    sink: &Arc<dyn ProgressSink>,
) -> DownloadStatus {
    let mut order: Vec<u32> = (0..job.chunks).collect();
    order.shuffle(&mut thread_rng());

    let pool = ThreadPool::new(DOWNLOAD_WORKERS);
    for id in order {
        let job = job.clone();
        let peers = validated.to_vec();
        let sink = sink.clone();
        pool.execute(move || download_chunk(&job, &peers, id, &sink));
    }
    pool.join();

    if job.local_io_failed.load(Ordering::SeqCst) {
        DownloadStatus::Error
    } else if job.completed.lock().unwrap().len() == job.chunks as usize {
        DownloadStatus::Completed
    } else {
        LOGGER.error(format!(
            "'{}' finished with {}/{} chunks",
            job.file_name,
            job.completed.lock().unwrap().len(),
            job.chunks
        ));
        DownloadStatus::Incomplete
    }
}

/// Fetch one chunk, trying up to `MAX_RETRY_ATTEMPTS` peers from a
/// per-chunk shuffled order. A blacklisted peer consumes the attempt.
fn download_chunk(job: &Arc<DownloadJob>, peers: &[Peer], id: u32, sink: &Arc<dyn ProgressSink>) {
    let mut order = peers.to_vec();
    order.shuffle(&mut thread_rng());

    for attempt in 0..MAX_RETRY_ATTEMPTS {
        if job.local_io_failed.load(Ordering::SeqCst) {
            return;
        }
        let peer = &order[attempt as usize % order.len()];
        if job.is_blacklisted(&peer.key) {
            continue;
        }
        match request_chunk(peer.addr, &job.file_name, id) {
            Ok(transfer) => match job.write_chunk(id, &transfer.bytes) {
                Ok(()) => {
                    transfer.ack();
                    job.reset_failures(&peer.key);
                    let done = job.mark_done(id);
                    let percent = (done as u64 * 100 / job.chunks as u64) as u8;
                    sink.update_progress(&job.file_name, DownloadStatus::Percent(percent));
                    return;
                }
                Err(e) => {
                    sink.log(&format!("cannot write chunk {}: {}", id, e));
                    job.local_io_failed.store(true, Ordering::SeqCst);
                    return;
                }
            },
            Err(e) => {
                LOGGER.debug(format!(
                    "chunk {} from {} failed (attempt {}): {}",
                    id,
                    peer.key,
                    attempt + 1,
                    e
                ));
                job.record_failure(&peer.key);
            }
        }
    }
    // Out of attempts; the chunk stays missing.
}
