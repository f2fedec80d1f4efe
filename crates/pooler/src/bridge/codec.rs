//! Framed codec for control-channel messages.
//!
//! Uses LinesCodec for framing + serde_json for serialization: every message
//! is one JSON object terminated by `\n`. Works over any AsyncRead/AsyncWrite
//! (unix sockets, loopback TCP).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Upper bound for a single control line. Control messages are tiny; anything
/// larger is a misbehaving peer.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Codec that frames messages with a newline delimiter and serializes with JSON.
///
/// Bytes are buffered until a delimiter is seen, so several messages in one
/// read and one message split across reads both decode correctly. Blank lines
/// are skipped. A partial line left at end of stream is never decoded.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            _phantom: PhantomData,
        }
    }
}

fn lines_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => io::Error::new(
            io::ErrorKind::InvalidData,
            format!("control line exceeds {} bytes", MAX_LINE_LENGTH),
        ),
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src).map_err(lines_error)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let item = serde_json::from_str(&line)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    return Ok(Some(item));
                }
                None => return Ok(None),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding control line");
        self.inner.encode(json, dst).map_err(lines_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Command, Envelope};

    fn decode_all(codec: &mut JsonLinesCodec<Envelope>, buf: &mut BytesMut) -> Vec<Command> {
        let mut out = Vec::new();
        while let Some(envelope) = codec.decode(buf).unwrap() {
            out.push(Command::try_from(envelope).unwrap());
        }
        out
    }

    #[test]
    fn encoded_command_is_one_newline_terminated_line() {
        let mut codec = JsonLinesCodec::<Command>::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Command::Register { pid: 7, port: 5501 }, &mut buf)
            .unwrap();

        assert_eq!(&buf[..], b"{\"cmd\":\"register\",\"pid\":7,\"port\":5501}\n");
    }

    #[test]
    fn decodes_several_messages_from_one_read() {
        let mut codec = JsonLinesCodec::<Envelope>::new();
        let mut buf = BytesMut::from(
            &b"{\"cmd\":\"register\",\"pid\":1,\"port\":5501}\n{\"cmd\":\"status\"}\n{\"cmd\":\"unregister\",\"pid\":1}\n"[..],
        );

        let commands = decode_all(&mut codec, &mut buf);

        assert_eq!(
            commands,
            vec![
                Command::Register { pid: 1, port: 5501 },
                Command::Status,
                Command::Unregister { pid: 1 },
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn message_split_at_every_offset_decodes_exactly_once() {
        let line = b"{\"cmd\":\"register\",\"pid\":4242,\"port\":5502}\n";

        for split in 1..line.len() {
            let mut codec = JsonLinesCodec::<Envelope>::new();
            let mut buf = BytesMut::from(&line[..split]);

            assert!(
                codec.decode(&mut buf).unwrap().is_none(),
                "partial line decoded at offset {split}"
            );

            buf.extend_from_slice(&line[split..]);
            let commands = decode_all(&mut codec, &mut buf);

            assert_eq!(commands, vec![Command::Register { pid: 4242, port: 5502 }]);
        }
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut codec = JsonLinesCodec::<Envelope>::new();
        let mut buf = BytesMut::from(&b"\n\r\n{\"cmd\":\"stop\"}\n\n"[..]);

        assert_eq!(decode_all(&mut codec, &mut buf), vec![Command::Stop]);
    }

    #[test]
    fn partial_line_at_eof_is_an_error_not_a_command() {
        let mut codec = JsonLinesCodec::<Envelope>::new();
        let mut buf = BytesMut::from(&b"{\"cmd\":\"stop\"}"[..]);

        assert!(codec.decode_eof(&mut buf).is_err());
    }

    #[test]
    fn malformed_json_is_invalid_data() {
        let mut codec = JsonLinesCodec::<Envelope>::new();
        let mut buf = BytesMut::from(&b"{\"cmd\": \n"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_line_is_rejected() {
        let mut codec = JsonLinesCodec::<Envelope>::new();
        let mut buf = BytesMut::from(vec![b'a'; MAX_LINE_LENGTH + 1].as_slice());

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
