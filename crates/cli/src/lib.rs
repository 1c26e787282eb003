use std::io;
use std::io::prelude::*;
use std::net::TcpStream;
use std::path::PathBuf;

use chunkcast_config::{CONTROL_PORT, LOCALHOST};
use chunkcast_core::entities::{Action, Response};
use chunkcast_core::helpers::create_buffer;
use chunkcast_core::utils::Logger;
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::{from_slice, to_string};

pub static LOGGER: Logger = Logger::compact("cli");

pub fn connect() -> io::Result<TcpStream> {
    LOGGER.debug(format!("connect {}:{}", LOCALHOST, CONTROL_PORT));
    let stream = TcpStream::connect((LOCALHOST, CONTROL_PORT)).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("cannot reach the daemon on port {}: {}", CONTROL_PORT, e),
        )
    })?;
    LOGGER.debug(format!("connected, local={:?}", stream.local_addr()));
    Ok(stream)
}

/// Builds the CLI interface definition for the `chunkcast-cli` client.
///
/// The tool talks to a running daemon over its localhost control port.
/// It can trigger discovery, search the LAN for shared files, list the
/// last results, download a file, and inspect peers and node status.
pub fn create_command() -> Command {
    Command::new("chunkcast-cli")
        .about("Interaction with a running chunkcast daemon")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new("discover").about("Broadcast a discovery request"))
        .subcommand(Command::new("search").about("Ask every known peer for its file list"))
        .subcommand(Command::new("ls").about("Show the files found by the last search"))
        .subcommand(
            Command::new("download")
                .about("Download a found file")
                .arg(
                    Arg::new("FILE_NAME")
                        .help("Name of file to download")
                        .required(true)
                        .short('f')
                        .long("file")
                        .value_name("NAME"),
                )
                .arg(
                    Arg::new("FILE_PATH")
                        .help("Optional save directory")
                        .value_name("OUT_DIR")
                        .short('o')
                        .long("out"),
                )
                .arg(
                    Arg::new("WAIT")
                        .help("Wait (block) until the download finishes")
                        .short('w')
                        .long("wait")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("peers").about("Show known peer addresses"))
        .subcommand(
            Command::new("add-peer")
                .about("Register a peer directly, bypassing discovery")
                .arg(
                    Arg::new("PEER_ADDR")
                        .help("Peer as IP:PORT")
                        .required(true)
                        .value_name("ADDR"),
                ),
        )
        .subcommand(Command::new("status").about("Show node status"))
}

pub fn process_actions(stream: &mut TcpStream, matches: &ArgMatches) -> io::Result<()> {
    let action = match matches.subcommand() {
        Some(("discover", _)) => Action::Discover,
        Some(("search", _)) => Action::Search,
        Some(("ls", _)) => Action::Ls,
        Some(("download", sub)) => {
            let file_name = sub.get_one::<String>("FILE_NAME").unwrap().clone();
            let save_path = sub.get_one::<String>("FILE_PATH").map(PathBuf::from);
            let wait = sub.get_flag("WAIT");
            Action::Download {
                file_name,
                save_path,
                wait,
            }
        }
        Some(("peers", _)) => Action::Peers,
        Some(("add-peer", sub)) => Action::AddPeer {
            addr: sub.get_one::<String>("PEER_ADDR").unwrap().clone(),
        },
        Some(("status", _)) => Action::Status,
        _ => {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "Wrong action!"));
        }
    };

    LOGGER.debug(format!("send {:?}", action));
    let serialized = to_string(&action)?;
    stream.write_all(serialized.as_bytes())?;
    LOGGER.debug("request written, waiting for reply...");
    Ok(())
}

pub fn process_daemon_response(stream: &mut TcpStream) -> io::Result<()> {
    let mut buf = create_buffer(65536);
    let size = stream.read(&mut buf)?;
    let response: Response = from_slice(&buf[..size])?;
    LOGGER.debug(format!("got reply {} bytes", size));

    match response {
        Response::Ok => {
            LOGGER.info("OK");
        }
        Response::Err(e) => {
            LOGGER.error(&e);
            return Err(io::Error::new(io::ErrorKind::Other, e));
        }
        Response::Files { found } => {
            if found.is_empty() {
                LOGGER.info("No files found.");
            } else {
                LOGGER.info("Files available to download:");
                for file in found {
                    println!("\t{}  ({})", file.name, file.peer);
                }
            }
        }
        Response::Peers { peers } => {
            if peers.is_empty() {
                LOGGER.info("No peers known.");
            } else {
                LOGGER.info("Known peers:");
                for peer in peers {
                    println!("\t{}", peer);
                }
            }
        }
        Response::Status {
            local_addr,
            serving_port,
            peers,
            downloading,
        } => {
            LOGGER.info(format!("Local address: {}", local_addr));
            LOGGER.info(format!("Serving port: {}", serving_port));
            LOGGER.info("Peers:");
            for peer in peers {
                println!("\t{}", peer);
            }
            LOGGER.info("Downloading:");
            for file in downloading {
                println!("\t{}", file);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_command_tree_is_consistent() {
        create_command().debug_assert();
    }

    #[test]
    fn test_download_flags_parse() {
        let matches = create_command()
            .try_get_matches_from(["chunkcast-cli", "download", "-f", "a.bin", "-w"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "download");
        assert_eq!(sub.get_one::<String>("FILE_NAME").unwrap(), "a.bin");
        assert!(sub.get_flag("WAIT"));
        assert!(sub.get_one::<String>("FILE_PATH").is_none());
    }
}
