//! Server-side contract: frame decoding and the per-connection loop.
//!
//! A connection handles one outstanding request at a time. The worker reads
//! a frame, hands the decoded request to its handler, writes the reply and
//! loops until EOF. Handler errors become error-text replies, not dropped
//! connections.

use std::{io, net::TcpStream};

use log::debug;

use crate::protocol::{self, Request, MAX_REQUEST_SIZE};

/// Executes decoded requests. One handler instance serves one connection,
/// so it may carry per-connection state (an open transaction, say).
pub trait QueryHandler {
    fn handle(&mut self, request: Request) -> Result<String, String>;
}

/// Drive one connection to completion.
pub fn serve_connection(
    mut stream: TcpStream,
    handler: &mut dyn QueryHandler,
) -> io::Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_owned());
    debug!("serving connection from {peer}");

    while let Some(body) = protocol::read_frame(&mut stream, MAX_REQUEST_SIZE)? {
        let request = protocol::decode_request(&body);
        let reply = match handler.handle(request) {
            Ok(reply) => reply,
            Err(message) => format!("ERROR: {message}"),
        };
        protocol::write_frame(&mut stream, reply.as_bytes())?;
    }
    debug!("connection from {peer} closed");
    Ok(())
}
