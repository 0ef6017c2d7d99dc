//! The client side of the wire protocol.

use crate::protocol::{self, parse_size_line, payload_size, Connection};
use crate::{LinefsError, Result};
use std::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// `LinefsClient` issues one PUT or GET against a [`LinefsServer`].
///
/// The server closes the connection after each response, so a client is
/// consumed by the operation it performs; connect again for the next one.
///
/// [`LinefsServer`]: crate::LinefsServer
pub struct LinefsClient {
    conn: Connection,
}

impl LinefsClient {
    /// establishes a socket connection to the server at the given `addr`
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<LinefsClient> {
        let stream = TcpStream::connect(addr)?;
        Ok(LinefsClient {
            conn: Connection::new(stream)?,
        })
    }

    /// uploads `lines` to be stored under `filename`.
    ///
    /// # Errors
    /// `Err(LinefsError::Remote)` if the server answered `ERROR <message>`
    pub fn put(mut self, filename: &str, lines: &[String]) -> Result<()> {
        self.conn
            .send_line(&format!("{} {}", protocol::PUT, filename))?;
        self.conn
            .send_line(&format!("{} {}", protocol::SIZE, payload_size(lines)))?;
        self.conn.send_file(lines, 1)?;

        let reply = self.conn.recv_line()?;
        debug!("PUT {} answered: {}", filename, reply);
        expect_ok(&reply)
    }

    /// downloads the lines stored under `filename`.
    ///
    /// # Errors
    /// `Err(LinefsError::Remote)` if the server answered `ERROR <message>`,
    /// e.g. because the file does not exist
    pub fn get(mut self, filename: &str) -> Result<Vec<String>> {
        self.conn
            .send_line(&format!("{} {}", protocol::GET, filename))?;

        let reply = self.conn.recv_line()?;
        debug!("GET {} answered: {}", filename, reply);
        expect_ok(&reply)?;

        let declared_size = parse_size_line(&self.conn.recv_line()?)?;
        self.conn.recv_file(declared_size)
    }
}

/// maps a server acknowledgement line to `Ok` or the reported error
fn expect_ok(reply: &str) -> Result<()> {
    if reply == protocol::OK {
        return Ok(());
    }
    match reply.strip_prefix(protocol::ERROR) {
        Some(message) => Err(LinefsError::Remote(message.trim_start().to_string())),
        None => Err(LinefsError::Protocol(format!(
            "unexpected reply: {}",
            reply
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expect_ok_accepts_the_ok_token() {
        assert!(expect_ok("OK").is_ok());
    }

    #[test]
    fn expect_ok_relays_server_errors() {
        match expect_ok("ERROR File not found") {
            Err(LinefsError::Remote(message)) => assert_eq!(message, "File not found"),
            other => panic!("expected a remote error, got {:?}", other),
        }
    }

    #[test]
    fn expect_ok_rejects_anything_else() {
        assert!(matches!(
            expect_ok("HELLO"),
            Err(LinefsError::Protocol(_))
        ));
    }
}
