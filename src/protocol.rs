//! The line-oriented wire protocol spoken between clients and the server.
//!
//! Every message is a sequence of UTF-8 bytes terminated by `'\n'`. A file
//! payload is a run of such lines closed by a single line containing the
//! literal [`END`]. The sentinel is authoritative: a payload line that is
//! itself equal to `END` cannot be transmitted and will terminate the
//! transfer early.

use crate::{LinefsError, Result};
use std::fmt;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpStream};

/// command token opening a PUT request
pub const PUT: &str = "PUT";
/// command token opening a GET request
pub const GET: &str = "GET";
/// positive acknowledgement sent by the server
pub const OK: &str = "OK";
/// negative acknowledgement sent by the server, followed by a message
pub const ERROR: &str = "ERROR";
/// header token declaring a payload's byte count
pub const SIZE: &str = "SIZE";
/// sentinel line terminating a file payload
pub const END: &str = "END";

/// the byte count of a payload: every line costs its own length plus one
/// byte for the terminator it carries on the wire
pub fn payload_size(lines: &[String]) -> usize {
    lines.iter().map(|line| line.len() + 1).sum()
}

/// writes `line` followed by the `'\n'` terminator.
///
/// `write_all` retries over partial writes, so this fails only if the
/// underlying stream fails.
pub fn send_line<W: Write>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// reads one line up to and including `'\n'`, returning it with the
/// terminator stripped.
///
/// # Errors
/// fails with an `UnexpectedEof` IO error if the stream ends before a
/// terminator is seen, and with [`LinefsError::Utf8Error`] if the line is
/// not valid UTF-8
pub fn recv_line<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf)?;
    if n == 0 || buf.last() != Some(&b'\n') {
        return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into());
    }
    buf.pop();
    Ok(String::from_utf8(buf)?)
}

/// transmits `lines` in batches of up to `packet_size` lines per write,
/// followed by the [`END`] sentinel.
///
/// Lines equal to `END` must not appear in the payload; the receiver would
/// take the first one as the sentinel.
pub fn send_file<W: Write>(writer: &mut W, lines: &[String], packet_size: usize) -> Result<()> {
    let packet_size = packet_size.max(1);
    for batch in lines.chunks(packet_size) {
        let mut packet = String::new();
        for line in batch {
            packet.push_str(line);
            packet.push('\n');
        }
        writer.write_all(packet.as_bytes())?;
    }
    send_line(writer, END)
}

/// reads payload lines until either the [`END`] sentinel arrives (the
/// sentinel is not appended) or the cumulative byte count reaches
/// `declared_size`.
///
/// The declared size is advisory: an early `END` always wins. When the
/// declared size is reached first, any trailing sentinel is left unread.
pub fn recv_file<R: BufRead>(reader: &mut R, declared_size: usize) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut received = 0;
    while received < declared_size {
        let line = recv_line(reader)?;
        if line == END {
            break;
        }
        received += line.len() + 1;
        lines.push(line);
    }
    Ok(lines)
}

/// parses a `SIZE <N>` header line into the declared byte count
pub fn parse_size_line(line: &str) -> Result<usize> {
    let mut tokens = line.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(SIZE), Some(n), None) => n
            .parse()
            .map_err(|_| LinefsError::Protocol(format!("invalid size header: {}", line))),
        _ => Err(LinefsError::Protocol(format!(
            "expected size header, got: {}",
            line
        ))),
    }
}

/// A fully parsed client command, payload included.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// store the given lines under `filename`
    Put {
        /// the key the payload will be stored under
        filename: String,
        /// the payload
        lines: Vec<String>,
    },
    /// retrieve the lines stored under `filename`
    Get {
        /// the key to look up
        filename: String,
    },
}

/// Reads one complete command from the stream: a `<CMD> <FILENAME>` line,
/// and for PUT the `SIZE <N>` header plus the payload itself.
///
/// # Errors
/// returns [`LinefsError::Protocol`] for any token sequence other than
/// `PUT <filename>` or `GET <filename>`
pub fn read_command<R: BufRead>(reader: &mut R) -> Result<Command> {
    let request_line = recv_line(reader)?;
    let mut tokens = request_line.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(PUT), Some(filename), None) => {
            let filename = filename.to_string();
            let declared_size = parse_size_line(&recv_line(reader)?)?;
            let lines = recv_file(reader, declared_size)?;
            Ok(Command::Put { filename, lines })
        }
        (Some(GET), Some(filename), None) => Ok(Command::Get {
            filename: filename.to_string(),
        }),
        _ => Err(LinefsError::Protocol(format!(
            "unrecognized request line: {}",
            request_line
        ))),
    }
}

/// One side of an accepted (or dialed) TCP connection, with the read half
/// buffered.
///
/// A `Connection` is owned by exactly one component at a time: the acceptor
/// while parsing, then whichever worker currently holds the request.
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    /// wraps a connected stream, splitting it into a buffered read half and
    /// a write half
    pub fn new(stream: TcpStream) -> Result<Connection> {
        let peer = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Connection {
            reader,
            writer: stream,
            peer,
        })
    }

    /// the address of the remote end, captured at construction
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// see [`send_line`]
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        send_line(&mut self.writer, line)
    }

    /// see [`recv_line`]
    pub fn recv_line(&mut self) -> Result<String> {
        recv_line(&mut self.reader)
    }

    /// see [`send_file`]
    pub fn send_file(&mut self, lines: &[String], packet_size: usize) -> Result<()> {
        send_file(&mut self.writer, lines, packet_size)
    }

    /// see [`recv_file`]
    pub fn recv_file(&mut self, declared_size: usize) -> Result<Vec<String>> {
        recv_file(&mut self.reader, declared_size)
    }

    /// see [`read_command`]
    pub fn read_command(&mut self) -> Result<Command> {
        read_command(&mut self.reader)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}
