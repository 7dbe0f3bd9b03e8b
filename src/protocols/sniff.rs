//! Routing parsers that pick a protocol from a connection's first bytes.

use std::sync::Arc;
use tracing::trace;

use super::{find_crlf, Protocol};
use crate::config::RoutingMode;
use crate::routing::{
    ConnectionId, ParseError, ParseStatus, RoutingDataParser, RoutingDataParserFactory,
};

/// Routing preamble prefix, matched case-insensitively.
const PREAMBLE_PREFIX: &[u8] = b"PROTO ";

/// Longest preamble line accepted before the connection is rejected.
const MAX_PREAMBLE_LENGTH: usize = 64;

/// Classifies on the first byte and consumes nothing.
///
/// Echo requests start with a length, ping commands with a word:
/// - ASCII digit: [`Protocol::Echo`]
/// - ASCII letter: [`Protocol::Ping`]
#[derive(Debug, Default)]
pub struct ProtocolSniffer;

impl RoutingDataParser<Protocol> for ProtocolSniffer {
    fn parse(&mut self, buffer: &[u8]) -> Result<ParseStatus<Protocol>, ParseError> {
        let Some(&first) = buffer.first() else {
            return Ok(ParseStatus::NeedData);
        };

        let protocol = if first.is_ascii_digit() {
            Protocol::Echo
        } else if first.is_ascii_alphabetic() {
            Protocol::Ping
        } else {
            return Err(ParseError::Unrecognized { byte: first });
        };

        Ok(ParseStatus::Classified {
            data: protocol,
            consumed: 0,
        })
    }
}

/// Classifies on an explicit `PROTO <name>\r\n` line.
///
/// The preamble is consumed; whatever follows it goes to the protocol.
#[derive(Debug, Default)]
pub struct PreambleParser {
    conn_id: Option<ConnectionId>,
}

impl PreambleParser {
    pub fn new(conn_id: ConnectionId) -> Self {
        Self {
            conn_id: Some(conn_id),
        }
    }
}

impl RoutingDataParser<Protocol> for PreambleParser {
    fn on_activated(&mut self) {
        if let Some(conn_id) = self.conn_id {
            trace!(conn_id = %conn_id, "Waiting for routing preamble");
        }
    }

    fn parse(&mut self, buffer: &[u8]) -> Result<ParseStatus<Protocol>, ParseError> {
        let Some(line_end) = find_crlf(buffer) else {
            // Reject as soon as the bytes can no longer become a preamble.
            let n = buffer.len().min(PREAMBLE_PREFIX.len());
            if !buffer[..n].eq_ignore_ascii_case(&PREAMBLE_PREFIX[..n]) {
                return Err(ParseError::InvalidPreamble("missing PROTO prefix".to_string()));
            }
            if buffer.len() > MAX_PREAMBLE_LENGTH {
                return Err(ParseError::InvalidPreamble("preamble too long".to_string()));
            }
            return Ok(ParseStatus::NeedData);
        };

        if line_end + 2 > MAX_PREAMBLE_LENGTH {
            return Err(ParseError::InvalidPreamble("preamble too long".to_string()));
        }

        let line = &buffer[..line_end];
        if line.len() < PREAMBLE_PREFIX.len()
            || !line[..PREAMBLE_PREFIX.len()].eq_ignore_ascii_case(PREAMBLE_PREFIX)
        {
            return Err(ParseError::InvalidPreamble("missing PROTO prefix".to_string()));
        }

        let name = std::str::from_utf8(&line[PREAMBLE_PREFIX.len()..])
            .map_err(|_| ParseError::InvalidPreamble("protocol name is not UTF-8".to_string()))?
            .trim();
        let protocol = name.parse()?;

        Ok(ParseStatus::Classified {
            data: protocol,
            consumed: line_end + 2,
        })
    }
}

/// Parser factory for the configured routing mode.
pub fn parser_factory(mode: RoutingMode) -> Arc<dyn RoutingDataParserFactory<Protocol>> {
    match mode {
        RoutingMode::Sniff => Arc::new(
            |_conn_id: ConnectionId| -> Box<dyn RoutingDataParser<Protocol>> {
                Box::new(ProtocolSniffer)
            },
        ),
        RoutingMode::Preamble => Arc::new(
            |conn_id: ConnectionId| -> Box<dyn RoutingDataParser<Protocol>> {
                Box::new(PreambleParser::new(conn_id))
            },
        ),
    }
}
