//! Counter line protocol.
//!
//! Commands are single case-insensitive tokens, one per line:
//!
//! ```text
//! INCR   -> OK
//! DECR   -> OK
//! GET    -> <decimal value>
//! RESET  -> OK
//! QUIT   -> BYE (connection is closed afterwards)
//! other  -> ERR Unknown command
//! ```
//!
//! Line splitting (including the optional `\r`) is done by the connection
//! buffer; this module only sees the bare command bytes.

use crate::counter::Counter;
use bytes::{BufMut, BytesMut};

/// Parsed counter command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Incr,
    Decr,
    Get,
    Reset,
    Quit,
    /// Anything outside the vocabulary.
    Unknown,
}

impl Command {
    /// Parse one line (without its terminator).
    ///
    /// Matching is ASCII case-insensitive and exact: surrounding whitespace
    /// makes the command unknown.
    pub fn parse(line: &[u8]) -> Command {
        if line.eq_ignore_ascii_case(b"INCR") {
            Command::Incr
        } else if line.eq_ignore_ascii_case(b"DECR") {
            Command::Decr
        } else if line.eq_ignore_ascii_case(b"GET") {
            Command::Get
        } else if line.eq_ignore_ascii_case(b"RESET") {
            Command::Reset
        } else if line.eq_ignore_ascii_case(b"QUIT") {
            Command::Quit
        } else {
            Command::Unknown
        }
    }
}

/// Reply produced for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Newline-terminated reply line.
    pub data: BytesMut,
    /// Close the connection once `data` is sent.
    pub close: bool,
}

impl Reply {
    fn line(text: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(text.len() + 1);
        data.put_slice(text);
        data.put_u8(b'\n');
        Self { data, close: false }
    }
}

/// Standard reply payloads.
pub struct Response;

impl Response {
    pub fn ok() -> &'static [u8] {
        b"OK"
    }

    pub fn bye() -> &'static [u8] {
        b"BYE"
    }

    pub fn unknown_command() -> &'static [u8] {
        b"ERR Unknown command"
    }
}

/// Execute a command against the counter.
///
/// Mutations are applied before the reply is built. Exactly one reply line
/// is produced per call.
pub fn execute(command: Command, counter: &mut Counter) -> Reply {
    match command {
        Command::Incr => {
            counter.incr();
            Reply::line(Response::ok())
        }
        Command::Decr => {
            counter.decr();
            Reply::line(Response::ok())
        }
        Command::Get => Reply::line(counter.get().to_string().as_bytes()),
        Command::Reset => {
            counter.reset();
            Reply::line(Response::ok())
        }
        Command::Quit => Reply {
            close: true,
            ..Reply::line(Response::bye())
        },
        Command::Unknown => Reply::line(Response::unknown_command()),
    }
}

/// Parse and execute a single line.
pub fn process_line(line: &[u8], counter: &mut Counter) -> Reply {
    execute(Command::parse(line), counter)
}
