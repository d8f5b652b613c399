//! Byte classifier splitting a telnet stream into data and commands

use super::{Command, Verb, IAC, SB, SE};

/// A run of application bytes or one complete command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Data(Vec<u8>),
    Command(Command),
}

/// Incremental telnet parser
///
/// Bytes are consumed left to right. A command is emitted only once all of
/// its bytes are buffered; whatever is left after a call is a strict prefix
/// of a command (at most a lone IAC, an incomplete option triple, or an
/// unterminated subnegotiation).
#[derive(Debug, Default)]
pub struct TelnetParser {
    buffer: Vec<u8>,
}

impl TelnetParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a command
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Append `chunk` and return every segment that is now complete
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<Segment> {
        self.buffer.extend_from_slice(chunk);

        let buf = &self.buffer;
        let mut segments = Vec::new();
        let mut data = Vec::new();
        let mut pos = 0;

        while pos < buf.len() {
            if buf[pos] != IAC {
                let run = buf[pos..]
                    .iter()
                    .position(|&b| b == IAC)
                    .unwrap_or(buf.len() - pos);
                data.extend_from_slice(&buf[pos..pos + run]);
                pos += run;
                continue;
            }

            let Some(&code) = buf.get(pos + 1) else {
                break;
            };

            let (command, len) = match code {
                IAC => {
                    // Escaped literal 0xFF
                    data.push(IAC);
                    pos += 2;
                    continue;
                }
                SB => match subnegotiation(&buf[pos + 2..]) {
                    Some((command, body_len)) => (command, 2 + body_len),
                    None => break,
                },
                _ => match Verb::from_byte(code) {
                    Some(verb) => match buf.get(pos + 2) {
                        Some(&option) => (Command::Negotiate { verb, option }, 3),
                        None => break,
                    },
                    None => (Command::Other(code), 2),
                },
            };

            if !data.is_empty() {
                segments.push(Segment::Data(std::mem::take(&mut data)));
            }
            segments.push(Segment::Command(command));
            pos += len;
        }

        if !data.is_empty() {
            segments.push(Segment::Data(data));
        }

        self.buffer.drain(..pos);
        segments
    }
}

/// Decode a subnegotiation body starting right after `IAC SB`
///
/// Returns the command and the number of bytes consumed including the
/// closing `IAC SE`, or `None` when the terminator has not arrived yet.
fn subnegotiation(buf: &[u8]) -> Option<(Command, usize)> {
    let mut body = Vec::new();
    let mut i = 0;

    while i < buf.len() {
        if buf[i] != IAC {
            body.push(buf[i]);
            i += 1;
            continue;
        }

        match buf.get(i + 1) {
            None => return None,
            Some(&SE) => {
                let option = body.first().copied().unwrap_or(0);
                let payload = body.get(1..).map(<[u8]>::to_vec).unwrap_or_default();
                return Some((Command::Subnegotiation { option, payload }, i + 2));
            }
            Some(&IAC) => body.push(IAC),
            // Stray command inside a subnegotiation; keep it verbatim
            Some(&other) => body.extend_from_slice(&[IAC, other]),
        }
        i += 2;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telnet::{DO, ECHO, IP, NEW_ENVIRON, SUPPRESS_GO_AHEAD, WILL};

    fn split(segments: Vec<Segment>) -> (Vec<Command>, Vec<u8>) {
        let mut commands = Vec::new();
        let mut data = Vec::new();
        for seg in segments {
            match seg {
                Segment::Data(d) => data.extend(d),
                Segment::Command(c) => commands.push(c),
            }
        }
        (commands, data)
    }

    fn sample_stream() -> Vec<u8> {
        let mut s = Vec::new();
        s.extend_from_slice(b"login: ");
        s.extend_from_slice(&[IAC, WILL, SUPPRESS_GO_AHEAD]);
        s.extend_from_slice(b"a");
        s.extend_from_slice(&[IAC, IAC]);
        s.extend_from_slice(b"b");
        s.extend_from_slice(&[IAC, SB, NEW_ENVIRON, 0, 0, b'U', IAC, IAC, IAC, SE]);
        s.extend_from_slice(&[IAC, IP]);
        s.extend_from_slice(&[IAC, DO, ECHO]);
        s.extend_from_slice(b"tail\r\n");
        s
    }

    #[test]
    fn test_parse_whole_stream() {
        let mut parser = TelnetParser::new();
        let (commands, data) = split(parser.parse(&sample_stream()));

        assert_eq!(
            commands,
            vec![
                Command::Negotiate {
                    verb: Verb::Will,
                    option: SUPPRESS_GO_AHEAD
                },
                Command::Subnegotiation {
                    option: NEW_ENVIRON,
                    payload: vec![0, 0, b'U', IAC],
                },
                Command::Other(IP),
                Command::Negotiate {
                    verb: Verb::Do,
                    option: ECHO
                },
            ]
        );
        assert_eq!(data, b"login: a\xFFbtail\r\n".to_vec());
        assert!(parser.pending().is_empty());
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let stream = sample_stream();

        let mut whole = TelnetParser::new();
        let expected = split(whole.parse(&stream));

        for chunk_size in 1..stream.len() {
            let mut parser = TelnetParser::new();
            let mut segments = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                segments.extend(parser.parse(chunk));
            }
            assert_eq!(split(segments), expected, "chunk size {}", chunk_size);
            assert!(parser.pending().is_empty());
        }
    }

    #[test]
    fn test_double_iac_is_one_data_byte() {
        let mut parser = TelnetParser::new();
        let segments = parser.parse(&[b'x', IAC, IAC, b'y']);
        assert_eq!(segments, vec![Segment::Data(vec![b'x', IAC, b'y'])]);
    }

    #[test]
    fn test_double_iac_split_across_chunks() {
        let mut parser = TelnetParser::new();
        assert_eq!(parser.parse(&[b'x', IAC]), vec![Segment::Data(vec![b'x'])]);
        assert_eq!(parser.pending(), &[IAC]);
        assert_eq!(parser.parse(&[IAC]), vec![Segment::Data(vec![IAC])]);
        assert!(parser.pending().is_empty());
    }

    #[test]
    fn test_partial_negotiation_is_retained() {
        let mut parser = TelnetParser::new();
        assert!(parser.parse(&[IAC, WILL]).is_empty());
        assert_eq!(parser.pending(), &[IAC, WILL]);

        let segments = parser.parse(&[ECHO]);
        assert_eq!(
            segments,
            vec![Segment::Command(Command::Negotiate {
                verb: Verb::Will,
                option: ECHO
            })]
        );
    }

    #[test]
    fn test_unterminated_subnegotiation_is_retained() {
        let mut parser = TelnetParser::new();
        assert!(parser.parse(&[IAC, SB, NEW_ENVIRON, 0, b'a', IAC]).is_empty());
        assert_eq!(parser.pending().len(), 6);

        let segments = parser.parse(&[SE]);
        assert_eq!(
            segments,
            vec![Segment::Command(Command::Subnegotiation {
                option: NEW_ENVIRON,
                payload: vec![0, b'a'],
            })]
        );
        assert!(parser.pending().is_empty());
    }

    #[test]
    fn test_se_byte_inside_subnegotiation_payload() {
        let mut parser = TelnetParser::new();
        let segments = parser.parse(&[IAC, SB, NEW_ENVIRON, SE, IAC, SE, b'z']);
        assert_eq!(
            segments,
            vec![
                Segment::Command(Command::Subnegotiation {
                    option: NEW_ENVIRON,
                    payload: vec![SE],
                }),
                Segment::Data(vec![b'z']),
            ]
        );
    }
}
