use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::{io, thread};

use chunkcast_config::{CONTROL_PORT, DISCOVERY_PORT};
use chunkcast_core::progress::LoggerSink;
use chunkcast_core::utils::Logger;
use clap::{Arg, Command};

use chunkcast_daemon::catalog::FixedShareFolder;
use chunkcast_daemon::discovery::DiscoveryService;
use chunkcast_daemon::server::FileServer;
use chunkcast_daemon::{run_control_loop, NodeState};

static LOGGER: Logger = Logger::verbose("daemon");

fn create_command() -> Command {
    Command::new("chunkcast-daemon")
        .about("Decentralized LAN file-sharing node")
        .arg(
            Arg::new("SHARE_DIR")
                .help("Directory whose files are offered to peers")
                .required(true)
                .short('s')
                .long("share")
                .value_name("DIR"),
        )
        .arg(
            Arg::new("DEST_DIR")
                .help("Directory downloads are written into")
                .required(true)
                .short('d')
                .long("dest")
                .value_name("DIR"),
        )
        .arg(
            Arg::new("DISCOVERY_PORT")
                .help("UDP port for peer discovery")
                .long("discovery-port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("CONTROL_PORT")
                .help("Localhost TCP port for the CLI")
                .long("control-port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16)),
        )
}

fn main() -> io::Result<()> {
    let matches = create_command().get_matches();

    let share_dir = PathBuf::from(matches.get_one::<String>("SHARE_DIR").unwrap());
    let dest_dir = PathBuf::from(matches.get_one::<String>("DEST_DIR").unwrap());
    for dir in [&share_dir, &dest_dir] {
        if !dir.is_dir() {
            eprintln!("{} is not a directory", dir.display());
            process::exit(1);
        }
    }
    let discovery_port = *matches
        .get_one::<u16>("DISCOVERY_PORT")
        .unwrap_or(&DISCOVERY_PORT);
    let control_port = *matches
        .get_one::<u16>("CONTROL_PORT")
        .unwrap_or(&CONTROL_PORT);

    let share = Arc::new(FixedShareFolder::new(share_dir));
    let server = Arc::new(FileServer::bind(share)?);
    {
        let server = server.clone();
        thread::spawn(move || server.run());
    }

    let discovery = Arc::new(DiscoveryService::new(discovery_port, server.clone())?);
    {
        let discovery = discovery.clone();
        thread::spawn(move || discovery.run());
    }
    discovery.start_maintenance();
    discovery.send_discovery_request();
    LOGGER.info(format!("node is up, serving on port {}", server.port()));

    let state = Arc::new(NodeState {
        server,
        discovery,
        dest_dir,
        sink: Arc::new(LoggerSink::new(&LOGGER)),
        found: Mutex::new(Vec::new()),
        downloading: Arc::new(Mutex::new(Vec::new())),
        search_cancel: Arc::new(AtomicBool::new(false)),
    });
    run_control_loop(state, control_port)
}
