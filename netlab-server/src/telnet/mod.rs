//! Telnet option negotiation
//!
//! VM consoles speak raw telnet. The daemon sits in the middle of every
//! console connection: towards the VM it pretends to be a telnet client
//! ([`ClientHandshake`]), towards terminal users it pretends to be a telnet
//! server ([`ServerHandshake`]). Both roles share the byte classifier in
//! [`parser::TelnetParser`] and the driver in [`TelnetSession`].

mod client;
mod parser;
mod server;
mod session;

pub use client::ClientHandshake;
pub use server::ServerHandshake;
pub use session::TelnetSession;

// Commands
pub const SE: u8 = 0xF0;
pub const IP: u8 = 0xF4;
pub const SB: u8 = 0xFA;
pub const WILL: u8 = 0xFB;
pub const WONT: u8 = 0xFC;
pub const DO: u8 = 0xFD;
pub const DONT: u8 = 0xFE;
pub const IAC: u8 = 0xFF;

// Options
pub const ECHO: u8 = 0x01;
pub const SUPPRESS_GO_AHEAD: u8 = 0x03;
pub const STATUS: u8 = 0x05;
pub const TIMING_MARK: u8 = 0x06;
pub const TERMINAL_TYPE: u8 = 0x18;
pub const NAWS: u8 = 0x1F;
pub const TERMINAL_SPEED: u8 = 0x20;
pub const LFLOW: u8 = 0x21;
pub const XDISPLOC: u8 = 0x23;
pub const NEW_ENVIRON: u8 = 0x27;

// NEW-ENVIRON subnegotiation codes
pub const ENV_IS: u8 = 0x00;
pub const ENV_SEND: u8 = 0x01;
pub const ENV_INFO: u8 = 0x02;
pub const ENV_VAR: u8 = 0x00;
pub const ENV_VALUE: u8 = 0x01;
pub const ENV_ESC: u8 = 0x02;
pub const ENV_USERVAR: u8 = 0x03;

/// Ctrl-L, makes the remote shell redraw its screen
pub const CTRL_L: u8 = 0x0C;

/// Option negotiation verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Will,
    Wont,
    Do,
    Dont,
}

impl Verb {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            WILL => Some(Verb::Will),
            WONT => Some(Verb::Wont),
            DO => Some(Verb::Do),
            DONT => Some(Verb::Dont),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Verb::Will => WILL,
            Verb::Wont => WONT,
            Verb::Do => DO,
            Verb::Dont => DONT,
        }
    }
}

/// One complete telnet command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `IAC <verb> <option>`
    Negotiate { verb: Verb, option: u8 },
    /// `IAC SB <option> <payload> IAC SE`, payload already unescaped
    Subnegotiation { option: u8, payload: Vec<u8> },
    /// Any other two-byte command (`IAC NOP`, `IAC IP`, ...)
    Other(u8),
}

impl Command {
    /// Append the wire form of this command to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Command::Negotiate { verb, option } => {
                out.extend_from_slice(&[IAC, verb.byte(), *option]);
            }
            Command::Subnegotiation { option, payload } => {
                out.extend_from_slice(&[IAC, SB]);
                out.extend_from_slice(&escape(&[*option]));
                out.extend_from_slice(&escape(payload));
                out.extend_from_slice(&[IAC, SE]);
            }
            Command::Other(code) => out.extend_from_slice(&[IAC, *code]),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

/// Append `IAC <verb> <option>` to `out`
pub fn negotiate(out: &mut Vec<u8>, verb: Verb, option: u8) {
    out.extend_from_slice(&[IAC, verb.byte(), option]);
}

/// Double every IAC so application bytes survive the peer's parser
pub fn escape(data: &[u8]) -> Vec<u8> {
    let extra = data.iter().filter(|&&b| b == IAC).count();
    if extra == 0 {
        return data.to_vec();
    }

    let mut out = Vec::with_capacity(data.len() + extra);
    for &byte in data {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
    out
}

/// Human-readable option name for logs
pub fn option_name(option: u8) -> &'static str {
    match option {
        ECHO => "ECHO",
        SUPPRESS_GO_AHEAD => "SUPPRESS-GO-AHEAD",
        STATUS => "STATUS",
        TIMING_MARK => "TIMING-MARK",
        TERMINAL_TYPE => "TERMINAL-TYPE",
        NAWS => "NAWS",
        TERMINAL_SPEED => "TERMINAL-SPEED",
        LFLOW => "LFLOW",
        XDISPLOC => "XDISPLOC",
        NEW_ENVIRON => "NEW-ENVIRON",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_doubles_iac() {
        assert_eq!(escape(b"abc"), b"abc".to_vec());
        assert_eq!(escape(&[1, IAC, 2]), vec![1, IAC, IAC, 2]);
    }

    #[test]
    fn test_encode_negotiate() {
        let cmd = Command::Negotiate {
            verb: Verb::Do,
            option: ECHO,
        };
        assert_eq!(cmd.encode(), vec![IAC, DO, ECHO]);
    }

    #[test]
    fn test_encode_subnegotiation_escapes_payload() {
        let cmd = Command::Subnegotiation {
            option: NEW_ENVIRON,
            payload: vec![ENV_SEND, IAC],
        };
        assert_eq!(
            cmd.encode(),
            vec![IAC, SB, NEW_ENVIRON, ENV_SEND, IAC, IAC, IAC, SE]
        );
    }

    #[test]
    fn test_verb_byte_mapping() {
        for byte in [WILL, WONT, DO, DONT] {
            assert_eq!(Verb::from_byte(byte).unwrap().byte(), byte);
        }
        assert!(Verb::from_byte(SB).is_none());
    }
}
