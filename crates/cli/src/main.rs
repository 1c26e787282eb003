use std::io;

use chunkcast_cli::{connect, create_command, process_actions, process_daemon_response};

fn main() -> io::Result<()> {
    let matches = create_command().get_matches();
    let mut stream = connect()?;
    process_actions(&mut stream, &matches)?;
    process_daemon_response(&mut stream)
}
