//! Server side of the handshake, used towards terminal users
//!
//! The exchange is a fixed sequence; each state names the request we sent
//! last and are waiting on:
//!
//! 1. `DO NEW-ENVIRON`, expecting `WILL NEW-ENVIRON`
//! 2. `SB NEW-ENVIRON SEND VAR "USER"`, expecting the `IS` reply
//! 3. `WILL SUPPRESS-GO-AHEAD`, expecting `DO`
//! 4. `DO ECHO`, expecting the user's terminal to decline local echo
//! 5. `WILL ECHO`, expecting `DO ECHO`; then ready

use tracing::{debug, warn};

use super::session::{NegotiationError, Negotiator};
use super::{
    negotiate, option_name, Command, Verb, ECHO, ENV_ESC, ENV_INFO, ENV_IS, ENV_SEND,
    ENV_USERVAR, ENV_VALUE, ENV_VAR, IAC, NEW_ENVIRON, SB, SE, SUPPRESS_GO_AHEAD,
};

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init,
    DoNewEnviron,
    CheckEnviron,
    GoAhead,
    DoEcho,
    WillEcho,
    Ready,
}

#[derive(Debug)]
pub struct ServerHandshake {
    state: ServerState,
    user: Option<String>,
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandshake {
    pub fn new() -> Self {
        Self {
            state: ServerState::Init,
            user: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// USER reported by the terminal, once known
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn request_user(out: &mut Vec<u8>) {
        out.extend_from_slice(&[IAC, SB, NEW_ENVIRON, ENV_SEND, ENV_VAR]);
        out.extend_from_slice(b"USER");
        out.extend_from_slice(&[IAC, SE]);
    }

    fn decline(&self, command: &Command, out: &mut Vec<u8>) {
        match command {
            Command::Negotiate { verb, option } => {
                if self.state == ServerState::Ready {
                    debug!(?verb, option = option_name(*option), "Ignored telnet command");
                    return;
                }
                match verb {
                    Verb::Will => negotiate(out, Verb::Dont, *option),
                    Verb::Do => negotiate(out, Verb::Wont, *option),
                    Verb::Wont | Verb::Dont => {
                        debug!(?verb, option = option_name(*option), "Ignored telnet command");
                    }
                }
            }
            other => debug!(state = ?self.state, ?other, "Ignored telnet command"),
        }
    }
}

impl Negotiator for ServerHandshake {
    fn is_ready(&self) -> bool {
        self.state == ServerState::Ready
    }

    fn initiate(&mut self, out: &mut Vec<u8>) {
        if self.state == ServerState::Init {
            negotiate(out, Verb::Do, NEW_ENVIRON);
            self.state = ServerState::DoNewEnviron;
        }
    }

    fn process_command(
        &mut self,
        command: &Command,
        out: &mut Vec<u8>,
    ) -> Result<(), NegotiationError> {
        use Command::{Negotiate, Subnegotiation};
        use ServerState::*;

        match (self.state, command) {
            (
                DoNewEnviron,
                Negotiate {
                    verb: Verb::Will,
                    option: NEW_ENVIRON,
                },
            ) => {
                Self::request_user(out);
                self.state = CheckEnviron;
            }
            (
                DoNewEnviron,
                Negotiate {
                    verb: Verb::Wont,
                    option: NEW_ENVIRON,
                },
            ) => return Err(NegotiationError::EnvironRefused),

            (
                CheckEnviron,
                Subnegotiation {
                    option: NEW_ENVIRON,
                    payload,
                },
            ) => {
                let user = environ_user(payload).ok_or(NegotiationError::MissingUser)?;
                debug!(user = %user, "Terminal user identified");
                self.user = Some(user);
                negotiate(out, Verb::Will, SUPPRESS_GO_AHEAD);
                self.state = GoAhead;
            }

            (
                GoAhead,
                Negotiate {
                    verb,
                    option: SUPPRESS_GO_AHEAD,
                },
            ) if matches!(verb, Verb::Do | Verb::Dont) => {
                if *verb == Verb::Dont {
                    warn!("Terminal refused go ahead suppression");
                    negotiate(out, Verb::Wont, SUPPRESS_GO_AHEAD);
                }
                negotiate(out, Verb::Do, ECHO);
                self.state = DoEcho;
            }

            (DoEcho, Negotiate { verb, option: ECHO })
                if matches!(verb, Verb::Will | Verb::Wont) =>
            {
                if *verb == Verb::Will {
                    // Local echo on the terminal would double every keystroke
                    negotiate(out, Verb::Dont, ECHO);
                }
                negotiate(out, Verb::Will, ECHO);
                self.state = WillEcho;
            }

            (
                WillEcho,
                Negotiate {
                    verb: Verb::Do,
                    option: ECHO,
                },
            ) => self.state = Ready,
            (
                WillEcho,
                Negotiate {
                    verb: Verb::Dont,
                    option: ECHO,
                },
            ) => {
                warn!("Terminal refused remote echo");
                negotiate(out, Verb::Wont, ECHO);
                self.state = Ready;
            }
            (
                WillEcho,
                Negotiate {
                    verb: Verb::Wont,
                    option: ECHO,
                },
            ) => {
                // Acknowledgement of an earlier DONT ECHO
            }

            (state, command) => {
                if state != Ready {
                    debug!(?state, "Unexpected command during handshake");
                }
                self.decline(command, out);
            }
        }

        Ok(())
    }
}

/// Extract a non-empty USER value from a NEW-ENVIRON `IS`/`INFO` payload
fn environ_user(payload: &[u8]) -> Option<String> {
    let (&kind, body) = payload.split_first()?;
    if kind != ENV_IS && kind != ENV_INFO {
        return None;
    }

    let mut vars: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut in_value = false;
    let mut bytes = body.iter().copied();

    while let Some(byte) = bytes.next() {
        match byte {
            ENV_VAR | ENV_USERVAR => {
                vars.push((Vec::new(), Vec::new()));
                in_value = false;
            }
            ENV_VALUE => in_value = true,
            _ => {
                let byte = if byte == ENV_ESC {
                    match bytes.next() {
                        Some(escaped) => escaped,
                        None => break,
                    }
                } else {
                    byte
                };
                if let Some((name, value)) = vars.last_mut() {
                    if in_value {
                        value.push(byte);
                    } else {
                        name.push(byte);
                    }
                }
            }
        }
    }

    vars.into_iter()
        .find(|(name, _)| name.as_slice() == b"USER")
        .map(|(_, value)| String::from_utf8_lossy(&value).into_owned())
        .filter(|user| !user.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telnet::{TelnetSession, DO, DONT, NAWS, WILL, WONT};

    fn user_reply(user: &[u8]) -> Vec<u8> {
        let mut msg = vec![IAC, SB, NEW_ENVIRON, ENV_IS, ENV_VAR];
        msg.extend_from_slice(b"USER");
        msg.push(ENV_VALUE);
        msg.extend_from_slice(user);
        msg.extend_from_slice(&[IAC, SE]);
        msg
    }

    #[test]
    fn test_full_terminal_handshake() {
        let mut session = TelnetSession::new(ServerHandshake::new());
        assert_eq!(session.start(), vec![IAC, DO, NEW_ENVIRON]);

        let feed = session.feed(&[IAC, WILL, NEW_ENVIRON]).unwrap();
        let mut expected = vec![IAC, SB, NEW_ENVIRON, ENV_SEND, ENV_VAR];
        expected.extend_from_slice(b"USER");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(feed.reply, expected);

        let feed = session.feed(&user_reply(b"alice")).unwrap();
        assert_eq!(feed.reply, vec![IAC, WILL, SUPPRESS_GO_AHEAD]);
        assert_eq!(session.negotiator().user(), Some("alice"));

        let feed = session.feed(&[IAC, DO, SUPPRESS_GO_AHEAD]).unwrap();
        assert_eq!(feed.reply, vec![IAC, DO, ECHO]);

        let feed = session.feed(&[IAC, WONT, ECHO]).unwrap();
        assert_eq!(feed.reply, vec![IAC, WILL, ECHO]);
        assert!(!session.is_ready());

        let feed = session.feed(&[IAC, DO, ECHO, b'l', b's']).unwrap();
        assert!(feed.became_ready);
        assert_eq!(feed.data, b"ls".to_vec());
        assert_eq!(session.negotiator().state(), ServerState::Ready);
    }

    #[test]
    fn test_terminal_with_local_echo_is_told_to_stop() {
        let mut session = TelnetSession::new(ServerHandshake::new());
        session.start();
        session.feed(&[IAC, WILL, NEW_ENVIRON]).unwrap();
        session.feed(&user_reply(b"bob")).unwrap();
        session.feed(&[IAC, DO, SUPPRESS_GO_AHEAD]).unwrap();

        let feed = session.feed(&[IAC, WILL, ECHO]).unwrap();
        assert_eq!(feed.reply, vec![IAC, DONT, ECHO, IAC, WILL, ECHO]);

        let feed = session.feed(&[IAC, WONT, ECHO, IAC, DO, ECHO]).unwrap();
        assert!(feed.reply.is_empty());
        assert!(feed.became_ready);
    }

    #[test]
    fn test_missing_user_is_fatal() {
        let mut session = TelnetSession::new(ServerHandshake::new());
        session.start();
        session.feed(&[IAC, WILL, NEW_ENVIRON]).unwrap();

        let mut msg = vec![IAC, SB, NEW_ENVIRON, ENV_IS, ENV_VAR];
        msg.extend_from_slice(b"TERM");
        msg.push(ENV_VALUE);
        msg.extend_from_slice(b"xterm");
        msg.extend_from_slice(&[IAC, SE]);

        assert_eq!(session.feed(&msg), Err(NegotiationError::MissingUser));
    }

    #[test]
    fn test_empty_user_is_missing() {
        let mut session = TelnetSession::new(ServerHandshake::new());
        session.start();
        session.feed(&[IAC, WILL, NEW_ENVIRON]).unwrap();
        assert_eq!(
            session.feed(&user_reply(b"")),
            Err(NegotiationError::MissingUser)
        );
    }

    #[test]
    fn test_environ_refused() {
        let mut session = TelnetSession::new(ServerHandshake::new());
        session.start();
        assert_eq!(
            session.feed(&[IAC, WONT, NEW_ENVIRON]),
            Err(NegotiationError::EnvironRefused)
        );
    }

    #[test]
    fn test_unrelated_offers_declined_mid_handshake() {
        let mut session = TelnetSession::new(ServerHandshake::new());
        session.start();
        let feed = session.feed(&[IAC, WILL, NAWS]).unwrap();
        assert_eq!(feed.reply, vec![IAC, DONT, NAWS]);
        assert_eq!(session.negotiator().state(), ServerState::DoNewEnviron);
    }

    #[test]
    fn test_environ_user_handles_escapes_and_uservar() {
        let payload = [
            ENV_IS, ENV_USERVAR, b'X', ENV_VALUE, b'1', ENV_VAR, b'U', b'S', b'E', b'R',
            ENV_VALUE, b'a', ENV_ESC, ENV_VALUE, b'b',
        ];
        assert_eq!(environ_user(&payload).as_deref(), Some("a\x01b"));
        assert_eq!(environ_user(&[ENV_SEND]), None);
    }
}
