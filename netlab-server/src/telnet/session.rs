//! Per-connection negotiation driver

use tracing::trace;

use super::parser::{Segment, TelnetParser};
use super::Command;

/// Fatal negotiation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("peer refused to share its environment")]
    EnvironRefused,

    #[error("peer did not provide a USER variable")]
    MissingUser,
}

/// One side of a telnet handshake
pub trait Negotiator {
    /// Whether the handshake is complete and data may flow
    fn is_ready(&self) -> bool;

    /// React to a complete command, appending any reply bytes to `out`
    fn process_command(&mut self, command: &Command, out: &mut Vec<u8>)
        -> Result<(), NegotiationError>;

    /// Opening bytes for roles that speak first
    fn initiate(&mut self, _out: &mut Vec<u8>) {}
}

/// Result of feeding one chunk into a session
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Feed {
    /// Application bytes, only populated once the session is ready
    pub data: Vec<u8>,
    /// Bytes that must be written back to the peer
    pub reply: Vec<u8>,
    /// True for exactly one feed: the one that completed the handshake
    pub became_ready: bool,
}

/// Incremental telnet session
///
/// Owns the parser and one negotiator. Data arriving before the handshake
/// completes is dropped; afterwards it is handed back to the caller.
#[derive(Debug)]
pub struct TelnetSession<N> {
    parser: TelnetParser,
    negotiator: N,
    announced: bool,
}

impl<N: Negotiator> TelnetSession<N> {
    pub fn new(negotiator: N) -> Self {
        Self {
            parser: TelnetParser::new(),
            negotiator,
            announced: false,
        }
    }

    /// Bytes to send before anything has been received
    pub fn start(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        self.negotiator.initiate(&mut out);
        out
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Feed, NegotiationError> {
        let mut feed = Feed::default();

        for segment in self.parser.parse(chunk) {
            match segment {
                Segment::Data(bytes) => {
                    if self.negotiator.is_ready() {
                        feed.data.extend_from_slice(&bytes);
                    } else {
                        trace!(len = bytes.len(), "Dropping data received before handshake");
                    }
                }
                Segment::Command(command) => {
                    self.negotiator.process_command(&command, &mut feed.reply)?;
                }
            }

            if !self.announced && self.negotiator.is_ready() {
                self.announced = true;
                feed.became_ready = true;
            }
        }

        Ok(feed)
    }

    pub fn is_ready(&self) -> bool {
        self.negotiator.is_ready()
    }

    pub fn negotiator(&self) -> &N {
        &self.negotiator
    }
}
