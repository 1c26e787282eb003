//! Peer discovery over UDP broadcast.
//!
//! Membership is soft state: peers enter the table through discovery
//! responses and heartbeats and leave it when they go quiet for longer
//! than the peer timeout. Discovery requests flood the local network with
//! a decrementing TTL; a bounded set of seen message ids keeps the flood
//! loop-free.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chunkcast_config::{
    ANY_IFACE, CLEANUP_INTERVAL, DEFAULT_TTL, HEARTBEAT_INTERVAL, MAX_DATAGRAM, PEER_TIMEOUT,
    PROCESSED_IDS_CAP, UDP_RECV_TIMEOUT,
};
use uuid::Uuid;

use crate::net::{self, parse_peer_key, peer_key};
use crate::server::ServingPort;
use crate::LOGGER;

const REQUEST_TAG: &str = "DISCOVER_P2P";
const RESPONSE_TAG: &str = "P2P_FILE_SHARING";
const HEARTBEAT_TAG: &str = "P2P_HEARTBEAT";

/// One discovery datagram: ASCII, `;`-separated fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    /// `DISCOVER_P2P;<msg-id>;<ttl>;<origin-ip>;<origin-port>`
    Request {
        msg_id: String,
        ttl: u32,
        origin_ip: String,
        origin_port: u16,
    },
    /// `P2P_FILE_SHARING;<msg-id>;<ttl>;<responder-ip>;<responder-port>`
    Response {
        msg_id: String,
        ttl: u32,
        responder_ip: String,
        responder_port: u16,
    },
    /// `P2P_HEARTBEAT;<sender-ip>;<sender-port>`
    Heartbeat { sender_ip: String, sender_port: u16 },
}

impl DiscoveryMessage {
    pub fn parse(text: &str) -> Option<Self> {
        let parts: Vec<&str> = text.split(';').collect();
        match parts.first().copied() {
            Some(REQUEST_TAG) if parts.len() >= 5 => Some(DiscoveryMessage::Request {
                msg_id: parts[1].to_string(),
                ttl: parts[2].parse().ok()?,
                origin_ip: parts[3].to_string(),
                origin_port: parts[4].parse().ok()?,
            }),
            Some(RESPONSE_TAG) if parts.len() >= 5 => Some(DiscoveryMessage::Response {
                msg_id: parts[1].to_string(),
                ttl: parts[2].parse().ok()?,
                responder_ip: parts[3].to_string(),
                responder_port: parts[4].parse().ok()?,
            }),
            Some(HEARTBEAT_TAG) if parts.len() >= 3 => Some(DiscoveryMessage::Heartbeat {
                sender_ip: parts[1].to_string(),
                sender_port: parts[2].parse().ok()?,
            }),
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            DiscoveryMessage::Request {
                msg_id,
                ttl,
                origin_ip,
                origin_port,
            } => format!(
                "{};{};{};{};{}",
                REQUEST_TAG, msg_id, ttl, origin_ip, origin_port
            ),
            DiscoveryMessage::Response {
                msg_id,
                ttl,
                responder_ip,
                responder_port,
            } => format!(
                "{};{};{};{};{}",
                RESPONSE_TAG, msg_id, ttl, responder_ip, responder_port
            ),
            DiscoveryMessage::Heartbeat {
                sender_ip,
                sender_port,
            } => format!("{};{};{}", HEARTBEAT_TAG, sender_ip, sender_port),
        }
    }
}

/// UDP service maintaining the peer table.
pub struct DiscoveryService {
    socket: RwLock<UdpSocket>,
    port: u16,
    local_ip: Ipv4Addr,
    server: Arc<dyn ServingPort>,
    /// `host:port` -> last seen. Never contains the local address.
    peers: Mutex<HashMap<String, Instant>>,
    /// Recently seen request ids, bounded at `PROCESSED_IDS_CAP`.
    processed_ids: Mutex<HashSet<String>>,
    running: AtomicBool,
}

fn open_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((ANY_IFACE, port))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(UDP_RECV_TIMEOUT))?;
    Ok(socket)
}

impl DiscoveryService {
    pub fn new(port: u16, server: Arc<dyn ServingPort>) -> std::io::Result<Self> {
        let socket = open_socket(port)?;
        Ok(Self {
            socket: RwLock::new(socket),
            port,
            local_ip: net::best_local_ip(),
            server,
            peers: Mutex::new(HashMap::new()),
            processed_ids: Mutex::new(HashSet::new()),
            running: AtomicBool::new(true),
        })
    }

    /// Receive loop. Socket timeouts are normal; a fatal receive error is
    /// answered with one socket-recreate attempt before giving up.
    pub fn run(&self) {
        LOGGER.info(format!("discovery service started on port {}", self.port));
        let mut buf = [0u8; MAX_DATAGRAM];
        while self.running.load(Ordering::SeqCst) {
            let received = {
                let socket = self.socket.read().unwrap();
                socket.recv_from(&mut buf)
            };
            match received {
                Ok((len, src)) => {
                    let text = String::from_utf8_lossy(&buf[..len]).to_string();
                    self.handle_datagram(&text, src);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    LOGGER.error(format!("discovery socket error: {}", e));
                    match open_socket(self.port) {
                        Ok(fresh) => {
                            *self.socket.write().unwrap() = fresh;
                            LOGGER.info("recreated discovery socket");
                        }
                        Err(e) => {
                            LOGGER.error(format!("could not recreate discovery socket: {}", e));
                            break;
                        }
                    }
                }
            }
        }
        LOGGER.info("discovery service stopped");
    }

    /// Classify one datagram and react to it.
    pub fn handle_datagram(&self, text: &str, src: SocketAddr) {
        let message = match DiscoveryMessage::parse(text) {
            Some(message) => message,
            None => {
                LOGGER.debug(format!("unparseable datagram from {}: {}", src, text));
                return;
            }
        };
        match message {
            DiscoveryMessage::Request {
                msg_id,
                ttl,
                origin_ip,
                origin_port,
            } => self.handle_request(&msg_id, ttl, &origin_ip, origin_port),
            DiscoveryMessage::Response {
                responder_ip,
                responder_port,
                ..
            } => self.update_peer(&responder_ip, responder_port),
            DiscoveryMessage::Heartbeat {
                sender_ip,
                sender_port,
            } => self.update_peer(&sender_ip, sender_port),
        }
    }

    fn handle_request(&self, msg_id: &str, ttl: u32, origin_ip: &str, origin_port: u16) {
        if !self.remember_id(msg_id) {
            LOGGER.debug(format!("already processed {}, dropping", msg_id));
            return;
        }
        LOGGER.debug(format!(
            "discovery request {} from {}:{} (ttl {})",
            msg_id, origin_ip, origin_port, ttl
        ));

        // Announce ourselves directly to the origin.
        let response = DiscoveryMessage::Response {
            msg_id: msg_id.to_string(),
            ttl: DEFAULT_TTL,
            responder_ip: self.local_ip.to_string(),
            responder_port: self.server.serving_port(),
        };
        self.send_to(&response.encode(), (origin_ip, origin_port));

        // Limited-scope flooding: pass the request on with one less hop,
        // keeping the original origin.
        if ttl > 1 {
            let forward = DiscoveryMessage::Request {
                msg_id: msg_id.to_string(),
                ttl: ttl - 1,
                origin_ip: origin_ip.to_string(),
                origin_port,
            };
            self.send_to(&forward.encode(), (net::broadcast_addr(), self.port));
            LOGGER.debug(format!("forwarded {} with ttl {}", msg_id, ttl - 1));
        }
    }

    /// Record a message id. Returns false when it was already known.
    fn remember_id(&self, msg_id: &str) -> bool {
        let mut seen = self.processed_ids.lock().unwrap();
        if !seen.insert(msg_id.to_string()) {
            return false;
        }
        if seen.len() > PROCESSED_IDS_CAP {
            if let Some(evict) = seen.iter().find(|id| id.as_str() != msg_id).cloned() {
                seen.remove(&evict);
            }
        }
        true
    }

    fn update_peer(&self, ip: &str, port: u16) {
        if ip == self.local_ip.to_string() && port == self.server.serving_port() {
            LOGGER.debug(format!("ignoring own address {}:{}", ip, port));
            return;
        }
        let key = format!("{}:{}", ip, port);
        let mut peers = self.peers.lock().unwrap();
        if peers.insert(key.clone(), Instant::now()).is_none() {
            LOGGER.info(format!("new peer {}", key));
        } else {
            LOGGER.debug(format!("refreshed peer {}", key));
        }
    }

    /// Insert a peer by caller-supplied address, bypassing discovery.
    pub fn add_peer(&self, ip: Ipv4Addr, port: u16) {
        let key = peer_key(ip, port);
        self.peers.lock().unwrap().insert(key.clone(), Instant::now());
        LOGGER.info(format!("manually added peer {}", key));
    }

    /// Snapshot of the known peer keys.
    pub fn peer_addresses(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.peers.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn local_info(&self) -> String {
        peer_key(self.local_ip, self.server.serving_port())
    }

    /// Drop peers not seen within `timeout`.
    pub fn cleanup_older_than(&self, timeout: Duration) {
        let mut peers = self.peers.lock().unwrap();
        let before = peers.len();
        peers.retain(|_, last_seen| last_seen.elapsed() <= timeout);
        let removed = before - peers.len();
        if removed > 0 {
            LOGGER.info(format!("removed {} inactive peer(s)", removed));
        }
    }

    /// Unicast a heartbeat to every known peer's discovery port.
    pub fn send_heartbeat(&self) {
        let heartbeat = DiscoveryMessage::Heartbeat {
            sender_ip: self.local_ip.to_string(),
            sender_port: self.server.serving_port(),
        }
        .encode();
        for key in self.peer_addresses() {
            match parse_peer_key(&key) {
                Some(addr) => {
                    self.send_to(&heartbeat, (addr.ip(), self.port));
                    LOGGER.debug(format!("sent heartbeat to {}", key));
                }
                None => LOGGER.debug(format!("skipping unparseable peer key {}", key)),
            }
        }
    }

    /// Broadcast a fresh discovery request. The request's own id goes into
    /// the processed set so the broadcast echo is dropped.
    pub fn send_discovery_request(&self) {
        let msg_id = Uuid::new_v4().to_string();
        self.remember_id(&msg_id);
        let request = DiscoveryMessage::Request {
            msg_id: msg_id.clone(),
            ttl: DEFAULT_TTL,
            origin_ip: self.local_ip.to_string(),
            origin_port: self.server.serving_port(),
        };
        self.send_to(&request.encode(), (net::broadcast_addr(), self.port));
        LOGGER.info(format!("broadcast discovery request {}", msg_id));
    }

    fn send_to<A: std::net::ToSocketAddrs>(&self, message: &str, target: A) {
        let socket = self.socket.read().unwrap();
        if let Err(e) = socket.send_to(message.as_bytes(), target) {
            LOGGER.error(format!("discovery send failed: {}", e));
        }
    }

    /// Heartbeat and cleanup tickers on their own threads. They watch the
    /// running flag once a second so shutdown is prompt.
    pub fn start_maintenance(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let service = self.clone();
            thread::spawn(move || {
                while service.sleep_while_running(HEARTBEAT_INTERVAL) {
                    service.send_heartbeat();
                }
            })
        };
        let cleanup = {
            let service = self.clone();
            thread::spawn(move || {
                while service.sleep_while_running(CLEANUP_INTERVAL) {
                    service.cleanup_older_than(PEER_TIMEOUT);
                }
            })
        };
        vec![heartbeat, cleanup]
    }

    /// Sleep for `interval` in one-second slices. Returns false once the
    /// service is shutting down.
    fn sleep_while_running(&self, interval: Duration) -> bool {
        let mut remaining = interval;
        while !remaining.is_zero() {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }
            let step = remaining.min(Duration::from_secs(1));
            thread::sleep(step);
            remaining -= step;
        }
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let msg = DiscoveryMessage::parse("DISCOVER_P2P;abc-123;3;192.168.0.5;4242").unwrap();
        assert_eq!(
            msg,
            DiscoveryMessage::Request {
                msg_id: "abc-123".into(),
                ttl: 3,
                origin_ip: "192.168.0.5".into(),
                origin_port: 4242,
            }
        );
    }

    #[test]
    fn test_parse_response() {
        let msg = DiscoveryMessage::parse("P2P_FILE_SHARING;abc;3;10.0.0.2;5050").unwrap();
        assert_eq!(
            msg,
            DiscoveryMessage::Response {
                msg_id: "abc".into(),
                ttl: 3,
                responder_ip: "10.0.0.2".into(),
                responder_port: 5050,
            }
        );
    }

    #[test]
    fn test_parse_heartbeat() {
        let msg = DiscoveryMessage::parse("P2P_HEARTBEAT;10.0.0.2;5050").unwrap();
        assert_eq!(
            msg,
            DiscoveryMessage::Heartbeat {
                sender_ip: "10.0.0.2".into(),
                sender_port: 5050,
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DiscoveryMessage::parse("").is_none());
        assert!(DiscoveryMessage::parse("HELLO;1;2").is_none());
        assert!(DiscoveryMessage::parse("DISCOVER_P2P;id;3").is_none());
        assert!(DiscoveryMessage::parse("DISCOVER_P2P;id;notanumber;1.2.3.4;80").is_none());
        assert!(DiscoveryMessage::parse("P2P_HEARTBEAT;1.2.3.4;badport").is_none());
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let messages = [
            DiscoveryMessage::Request {
                msg_id: "m1".into(),
                ttl: 2,
                origin_ip: "1.2.3.4".into(),
                origin_port: 80,
            },
            DiscoveryMessage::Response {
                msg_id: "m2".into(),
                ttl: 3,
                responder_ip: "5.6.7.8".into(),
                responder_port: 9000,
            },
            DiscoveryMessage::Heartbeat {
                sender_ip: "9.9.9.9".into(),
                sender_port: 1,
            },
        ];
        for msg in messages {
            assert_eq!(DiscoveryMessage::parse(&msg.encode()).unwrap(), msg);
        }
    }
}

#[cfg(test)]
mod func_tests {
    use super::*;

    struct FixedPort(u16);

    impl ServingPort for FixedPort {
        fn serving_port(&self) -> u16 {
            self.0
        }
    }

    /// Service on an ephemeral port so tests do not collide on 8888.
    fn ephemeral_service(serving_port: u16) -> DiscoveryService {
        let probe = UdpSocket::bind((ANY_IFACE, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        DiscoveryService::new(port, Arc::new(FixedPort(serving_port))).unwrap()
    }

    fn origin_socket() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn src() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn test_request_gets_direct_response() {
        let service = ephemeral_service(4000);
        let (origin, origin_port) = origin_socket();

        let request = DiscoveryMessage::Request {
            msg_id: "req-1".into(),
            ttl: 1,
            origin_ip: "127.0.0.1".into(),
            origin_port,
        };
        service.handle_datagram(&request.encode(), src());

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _) = origin.recv_from(&mut buf).unwrap();
        let reply = DiscoveryMessage::parse(&String::from_utf8_lossy(&buf[..len])).unwrap();
        match reply {
            DiscoveryMessage::Response {
                msg_id,
                responder_port,
                ..
            } => {
                assert_eq!(msg_id, "req-1");
                assert_eq!(responder_port, 4000);
            }
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[test]
    fn test_replayed_request_is_dropped() {
        let service = ephemeral_service(4000);
        let (origin, origin_port) = origin_socket();

        let request = DiscoveryMessage::Request {
            msg_id: "req-dup".into(),
            ttl: 1,
            origin_ip: "127.0.0.1".into(),
            origin_port,
        };
        service.handle_datagram(&request.encode(), src());
        service.handle_datagram(&request.encode(), src());

        let mut buf = [0u8; MAX_DATAGRAM];
        assert!(origin.recv_from(&mut buf).is_ok());
        // The replay must produce neither a second response nor a forward.
        assert!(origin.recv_from(&mut buf).is_err());
        // And no peer-table change either.
        assert!(service.peer_addresses().is_empty());
    }

    #[test]
    fn test_response_and_heartbeat_update_peer_table() {
        let service = ephemeral_service(4000);
        let response = DiscoveryMessage::Response {
            msg_id: "m".into(),
            ttl: 3,
            responder_ip: "10.1.1.1".into(),
            responder_port: 5050,
        };
        service.handle_datagram(&response.encode(), src());
        let heartbeat = DiscoveryMessage::Heartbeat {
            sender_ip: "10.1.1.2".into(),
            sender_port: 6060,
        };
        service.handle_datagram(&heartbeat.encode(), src());

        assert_eq!(service.peer_addresses(), ["10.1.1.1:5050", "10.1.1.2:6060"]);
    }

    #[test]
    fn test_own_address_never_enters_peer_table() {
        let service = ephemeral_service(4000);
        let own_ip = service.local_info();
        let (ip, port) = own_ip.split_once(':').unwrap();
        let heartbeat = DiscoveryMessage::Heartbeat {
            sender_ip: ip.into(),
            sender_port: port.parse().unwrap(),
        };
        service.handle_datagram(&heartbeat.encode(), src());
        assert!(service.peer_addresses().is_empty());
    }

    #[test]
    fn test_cleanup_evicts_stale_peers() {
        let service = ephemeral_service(4000);
        service.add_peer(Ipv4Addr::new(10, 0, 0, 1), 1111);
        assert_eq!(service.peer_addresses().len(), 1);
        service.cleanup_older_than(Duration::ZERO);
        assert!(service.peer_addresses().is_empty());
    }

    #[test]
    fn test_cleanup_keeps_fresh_peers() {
        let service = ephemeral_service(4000);
        service.add_peer(Ipv4Addr::new(10, 0, 0, 1), 1111);
        service.cleanup_older_than(PEER_TIMEOUT);
        assert_eq!(service.peer_addresses(), ["10.0.0.1:1111"]);
    }

    #[test]
    fn test_manual_add_peer() {
        let service = ephemeral_service(4000);
        service.add_peer(Ipv4Addr::new(192, 168, 7, 7), 7777);
        assert_eq!(service.peer_addresses(), ["192.168.7.7:7777"]);
    }

    #[test]
    fn test_processed_ids_stay_bounded() {
        let service = ephemeral_service(4000);
        for i in 0..(PROCESSED_IDS_CAP * 2) {
            // ttl 1 so nothing is forwarded; origin port 9 is discarded.
            let request = DiscoveryMessage::Request {
                msg_id: format!("bulk-{}", i),
                ttl: 1,
                origin_ip: "127.0.0.1".into(),
                origin_port: 9,
            };
            service.handle_datagram(&request.encode(), src());
        }
        let seen = service.processed_ids.lock().unwrap();
        assert!(seen.len() <= PROCESSED_IDS_CAP + 1);
    }
}
