//! Search: ask every known peer for its shared file list.
//!
//! Queries run on a small worker pool with tight connect and read
//! timeouts, so one silent peer cannot stall the whole sweep.

use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chunkcast_config::{SEARCH_CONNECT_TIMEOUT, SEARCH_READ_TIMEOUT, SEARCH_WORKERS};
use chunkcast_core::entities::FoundFile;
use chunkcast_core::progress::ProgressSink;
use chunkcast_core::wire;
use threadpool::ThreadPool;

use crate::net::parse_peer_key;
use crate::server::{CMD_FILE_LIST, FILE_LIST_MARKER};
use crate::LOGGER;

/// Query `peers` in parallel and collect every advertised file. A cancel
/// flag flip makes not-yet-started queries no-ops; in-flight ones end at
/// their socket timeout.
pub fn search_peers(
    peers: &[String],
    sink: &Arc<dyn ProgressSink>,
    cancel: &Arc<AtomicBool>,
) -> Vec<FoundFile> {
    if peers.is_empty() {
        return Vec::new();
    }
    sink.log(&format!("searching {} peer(s) for files", peers.len()));

    let pool = ThreadPool::new(peers.len().min(SEARCH_WORKERS));
    let found: Arc<Mutex<Vec<FoundFile>>> = Arc::new(Mutex::new(Vec::new()));
    let completed = Arc::new(AtomicUsize::new(0));
    let total = peers.len();

    for peer in peers {
        let peer = peer.clone();
        let found = found.clone();
        let completed = completed.clone();
        let sink = sink.clone();
        let cancel = cancel.clone();
        pool.execute(move || {
            if cancel.load(Ordering::SeqCst) {
                return;
            }
            match request_file_list(&peer) {
                Ok(names) => {
                    let mut found = found.lock().unwrap();
                    for name in names {
                        found.push(FoundFile {
                            name,
                            peer: peer.clone(),
                        });
                    }
                }
                Err(e) => {
                    LOGGER.debug(format!("file list from {} failed: {}", peer, e));
                }
            }
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            sink.log(&format!(
                "search progress: {}% ({}/{} peers)",
                done * 100 / total,
                done,
                total
            ));
        });
    }
    pool.join();

    let mut hits = found.lock().unwrap().clone();
    hits.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.peer.cmp(&b.peer)));
    sink.log(&format!("search finished with {} file(s)", hits.len()));
    hits
}

fn request_file_list(peer: &str) -> io::Result<Vec<String>> {
    let addr = parse_peer_key(peer).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "peer key is not IPv4 host:port")
    })?;
    let mut stream = TcpStream::connect_timeout(&addr, SEARCH_CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(SEARCH_READ_TIMEOUT))?;
    stream.set_write_timeout(Some(SEARCH_READ_TIMEOUT))?;

    wire::write_string(&mut stream, CMD_FILE_LIST)?;
    let marker = wire::read_string(&mut stream)?;
    if marker != FILE_LIST_MARKER {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected file list marker: {}", marker),
        ));
    }
    let count = wire::read_u32(&mut stream)?;
    let mut names = Vec::new();
    for _ in 0..count {
        names.push(wire::read_string(&mut stream)?);
    }
    Ok(names)
}

#[cfg(test)]
mod func_tests {
    use std::fs;
    use std::net::TcpListener;
    use std::thread;

    use chunkcast_core::progress::DownloadStatus;

    use super::*;
    use crate::catalog::FixedShareFolder;
    use crate::server::FileServer;

    struct NullSink;

    impl ProgressSink for NullSink {
        fn log(&self, _message: &str) {}
        fn update_progress(&self, _file_name: &str, _status: DownloadStatus) {}
    }

    fn serve(files: &[&str]) -> (tempfile::TempDir, Arc<FileServer>, String) {
        let dir = tempfile::tempdir().unwrap();
        for name in files {
            fs::write(dir.path().join(name), b"data").unwrap();
        }
        let share = Arc::new(FixedShareFolder::new(dir.path().to_path_buf()));
        let server = Arc::new(FileServer::bind(share).unwrap());
        let runner = server.clone();
        thread::spawn(move || runner.run());
        let key = format!("127.0.0.1:{}", server.port());
        (dir, server, key)
    }

    fn no_cancel() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_search_collects_from_every_peer() {
        let (_a, _sa, peer_a) = serve(&["alpha.txt", "beta.txt"]);
        let (_b, _sb, peer_b) = serve(&["gamma.txt"]);
        let sink: Arc<dyn ProgressSink> = Arc::new(NullSink);

        let hits = search_peers(&[peer_a.clone(), peer_b.clone()], &sink, &no_cancel());
        let names: Vec<&str> = hits.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["alpha.txt", "beta.txt", "gamma.txt"]);
        assert_eq!(hits[0].peer, peer_a);
        assert_eq!(hits[2].peer, peer_b);
    }

    #[test]
    fn test_search_skips_dead_and_invalid_peers() {
        let (_a, _sa, live) = serve(&["only.txt"]);
        let dead_port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let sink: Arc<dyn ProgressSink> = Arc::new(NullSink);

        let hits = search_peers(
            &[
                format!("127.0.0.1:{}", dead_port),
                "garbage".to_string(),
                live,
            ],
            &sink,
            &no_cancel(),
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "only.txt");
    }

    #[test]
    fn test_search_with_no_peers_is_empty() {
        let sink: Arc<dyn ProgressSink> = Arc::new(NullSink);
        assert!(search_peers(&[], &sink, &no_cancel()).is_empty());
    }

    #[test]
    fn test_cancelled_search_returns_nothing() {
        let (_a, _sa, peer) = serve(&["late.txt"]);
        let sink: Arc<dyn ProgressSink> = Arc::new(NullSink);
        let cancel = Arc::new(AtomicBool::new(true));
        assert!(search_peers(&[peer], &sink, &cancel).is_empty());
    }
}
