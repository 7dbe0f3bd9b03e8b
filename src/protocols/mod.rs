//! Protocols served behind the router.
//!
//! - `ping`: line-based PING/PONG health checks
//! - `echo`: length-prefixed echo for throughput testing
//!
//! `sniff` holds the routing parsers that pick one of them for a new
//! connection; [`ProtocolChains`] builds the chosen protocol's handler.

pub mod echo;
pub mod ping;
pub mod sniff;

use std::fmt;
use std::str::FromStr;

use crate::routing::{
    ConnectionId, DownstreamChain, DownstreamPipelineFactory, ParseError, Transport,
};

use echo::EchoChain;
use ping::PingChain;

/// Routing decision for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ping,
    Echo,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Ping => "ping",
            Protocol::Echo => "echo",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("ping") {
            Ok(Protocol::Ping)
        } else if s.eq_ignore_ascii_case("echo") {
            Ok(Protocol::Echo)
        } else {
            Err(ParseError::UnknownProtocol(s.to_string()))
        }
    }
}

/// Builds the handler chain for a routed connection.
pub struct ProtocolChains {
    max_echo_size: usize,
}

impl ProtocolChains {
    pub fn new(max_echo_size: usize) -> Self {
        Self { max_echo_size }
    }
}

impl<T: Transport> DownstreamPipelineFactory<Protocol, T> for ProtocolChains {
    fn build(
        &self,
        conn_id: ConnectionId,
        transport: T,
        protocol: Protocol,
    ) -> Box<dyn DownstreamChain> {
        match protocol {
            Protocol::Ping => Box::new(PingChain::new(conn_id, transport)),
            Protocol::Echo => Box::new(EchoChain::new(conn_id, transport, self.max_echo_size)),
        }
    }
}

/// Find \r\n in buffer, returning the position of \r.
pub(crate) fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use bytes::BytesMut;

    #[test]
    fn test_protocol_names() {
        assert_eq!("PING".parse::<Protocol>().unwrap(), Protocol::Ping);
        assert_eq!("echo".parse::<Protocol>().unwrap(), Protocol::Echo);
        assert!(matches!(
            "smtp".parse::<Protocol>(),
            Err(ParseError::UnknownProtocol(name)) if name == "smtp"
        ));
        assert_eq!(Protocol::Echo.to_string(), "echo");
    }

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"PING\r\n"), Some(4));
        assert_eq!(find_crlf(b"PING\r"), None);
        assert_eq!(find_crlf(b""), None);
    }

    #[test]
    fn test_chains_follow_protocol() {
        let chains = ProtocolChains::new(1024);
        let transport = RecordingTransport::default();

        let mut chain = chains.build(ConnectionId::new(1), transport.clone(), Protocol::Ping);
        chain.activate();
        chain.read(BytesMut::from(&b"PING\r\n"[..]));
        assert_eq!(transport.written(), b"PONG\r\n");

        let transport = RecordingTransport::default();
        let mut chain = chains.build(ConnectionId::new(2), transport.clone(), Protocol::Echo);
        chain.activate();
        chain.read(BytesMut::from(&b"2\r\nhi"[..]));
        assert_eq!(transport.written(), b"2\r\nhi");
    }
}
