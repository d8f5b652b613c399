//! Client side of the handshake, used towards a VM console

use tracing::{debug, warn};

use super::session::{NegotiationError, Negotiator};
use super::{negotiate, option_name, Command, Verb, ECHO, SUPPRESS_GO_AHEAD};

/// Accepts the console's go-ahead suppression and lets it echo
///
/// Ready once the console has offered to echo and we agreed.
#[derive(Debug, Default)]
pub struct ClientHandshake {
    ready: bool,
}

impl ClientHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    fn ignore(&self, verb: Verb, option: u8, out: &mut Vec<u8>) {
        if self.ready {
            debug!(?verb, option = option_name(option), "Ignored telnet command");
            return;
        }

        match verb {
            Verb::Do => negotiate(out, Verb::Wont, option),
            Verb::Will => negotiate(out, Verb::Dont, option),
            Verb::Wont | Verb::Dont => {
                debug!(?verb, option = option_name(option), "Ignored telnet command");
            }
        }
    }
}

impl Negotiator for ClientHandshake {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn process_command(
        &mut self,
        command: &Command,
        out: &mut Vec<u8>,
    ) -> Result<(), NegotiationError> {
        let (verb, option) = match command {
            Command::Negotiate { verb, option } => (*verb, *option),
            other => {
                debug!(?other, "Ignored telnet command");
                return Ok(());
            }
        };

        match (option, verb) {
            (SUPPRESS_GO_AHEAD, Verb::Will) => negotiate(out, Verb::Do, SUPPRESS_GO_AHEAD),
            (SUPPRESS_GO_AHEAD, _) => {
                warn!(?verb, "Failed option suppress go ahead");
            }
            (ECHO, Verb::Do) => negotiate(out, Verb::Wont, ECHO),
            (ECHO, Verb::Will) => {
                if self.ready {
                    debug!("Console repeated echo offer");
                } else {
                    negotiate(out, Verb::Do, ECHO);
                    self.ready = true;
                }
            }
            (ECHO, _) => {
                warn!(?verb, "Console refused echo");
            }
            _ => self.ignore(verb, option, out),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telnet::{TelnetSession, DO, DONT, IAC, NAWS, TERMINAL_TYPE, WILL, WONT};

    #[test]
    fn test_full_console_handshake() {
        let mut session = TelnetSession::new(ClientHandshake::new());
        assert!(session.start().is_empty());

        let feed = session
            .feed(&[IAC, WILL, SUPPRESS_GO_AHEAD, IAC, DO, ECHO])
            .unwrap();
        assert_eq!(feed.reply, vec![IAC, DO, SUPPRESS_GO_AHEAD, IAC, WONT, ECHO]);
        assert!(!feed.became_ready);

        let feed = session.feed(&[IAC, WILL, ECHO]).unwrap();
        assert_eq!(feed.reply, vec![IAC, DO, ECHO]);
        assert!(feed.became_ready);
        assert!(session.is_ready());
    }

    #[test]
    fn test_data_before_ready_is_dropped() {
        let mut session = TelnetSession::new(ClientHandshake::new());

        let feed = session.feed(b"noise").unwrap();
        assert!(feed.data.is_empty());

        let mut chunk = vec![IAC, WILL, ECHO];
        chunk.extend_from_slice(b"hello");
        let feed = session.feed(&chunk).unwrap();
        assert!(feed.became_ready);
        assert_eq!(feed.data, b"hello".to_vec());

        let feed = session.feed(b"more").unwrap();
        assert!(!feed.became_ready);
        assert_eq!(feed.data, b"more".to_vec());
    }

    #[test]
    fn test_unknown_options_declined_before_ready() {
        let mut session = TelnetSession::new(ClientHandshake::new());
        let feed = session
            .feed(&[IAC, DO, TERMINAL_TYPE, IAC, WILL, NAWS, IAC, WONT, NAWS])
            .unwrap();
        assert_eq!(
            feed.reply,
            vec![IAC, WONT, TERMINAL_TYPE, IAC, DONT, NAWS]
        );
    }

    #[test]
    fn test_unknown_options_ignored_after_ready() {
        let mut session = TelnetSession::new(ClientHandshake::new());
        session.feed(&[IAC, WILL, ECHO]).unwrap();

        let feed = session.feed(&[IAC, DO, TERMINAL_TYPE]).unwrap();
        assert!(feed.reply.is_empty());
    }

    #[test]
    fn test_handshake_split_byte_by_byte() {
        let stream = [IAC, WILL, SUPPRESS_GO_AHEAD, IAC, DO, ECHO, IAC, WILL, ECHO, b'$'];
        let mut session = TelnetSession::new(ClientHandshake::new());
        let mut reply = Vec::new();
        let mut data = Vec::new();
        let mut ready_count = 0;

        for byte in stream {
            let feed = session.feed(&[byte]).unwrap();
            reply.extend(feed.reply);
            data.extend(feed.data);
            ready_count += feed.became_ready as usize;
        }

        assert_eq!(
            reply,
            vec![IAC, DO, SUPPRESS_GO_AHEAD, IAC, WONT, ECHO, IAC, DO, ECHO]
        );
        assert_eq!(data, b"$".to_vec());
        assert_eq!(ready_count, 1);
    }
}
