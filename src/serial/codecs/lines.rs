use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::serial::Framing;

/// This codec has a configurable delimiter character for reading,
/// and optionally adds a character to each line it encodes.
///
/// Lines longer than the configured maximum are thrown away up to and
/// including their delimiter.
#[derive(Debug, Clone)]
pub struct LinesCodec {
    /// How far we have looked for a newline into the buffer
    cursor: usize,

    /// How to delimit incoming byte streams.
    /// This delimiter is not included in the yielded frames.
    read_delimiter: u8,

    /// If provided, which byte to append when writing (encoding) messages.
    /// If `None`, forwards the data as-is.
    write_delimiter: Option<u8>,

    /// The longest line we are willing to buffer.
    max_length: usize,

    /// Set while skipping the rest of a line that grew too long.
    discarding: bool,
}

impl LinesCodec {
    /// Create a new codec.
    pub fn new(read_delimiter: u8, write_delimiter: Option<u8>, max_length: usize) -> Self {
        Self {
            cursor: 0,
            read_delimiter,
            write_delimiter,
            max_length,
            discarding: false,
        }
    }
}

impl Default for LinesCodec {
    fn default() -> Self {
        Self::from(&Framing::default())
    }
}

impl From<&Framing> for LinesCodec {
    fn from(framing: &Framing) -> Self {
        Self::new(
            framing.read_delimiter,
            framing.write_delimiter,
            framing.max_line_length,
        )
    }
}

impl Decoder for LinesCodec {
    type Item = Vec<u8>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = src.len();

            let look_at = &src[self.cursor..read_to];

            let Some(position) = look_at.iter().position(|&byte| byte == self.read_delimiter) else {
                if read_to > self.max_length {
                    warn!(
                        "Discarding {read_to} bytes without a delimiter, lines are limited to {} bytes",
                        self.max_length
                    );
                    src.clear();
                    self.cursor = 0;
                    self.discarding = true;
                    return Ok(None);
                }

                // We did not find a full frame.
                // The next time we are called the same buffer `src` will be provided to us (same starting point),
                // but possibly with more data.
                // Since our job is to find the delimiter, we don't need to re-read the bytes we have already looked at.
                self.cursor = read_to;

                // Indicate that we need more bytes to look at.
                return Ok(None);
            };

            // Since we might "start late" in the buffer (from the cursor),
            // the "global" position within the buffer has to be calculated.
            let actual_position = self.cursor + position;

            // Next time we need to start over.
            self.cursor = 0;

            // Split at the delimiter, getting a slice of the bytes before it.
            let line = src.split_to(actual_position);

            // Discard the delimiter by advancing the source buffer beyond it.
            src.advance(1);

            if self.discarding {
                // The tail end of a line we already gave up on.
                self.discarding = false;
                continue;
            }

            if line.len() > self.max_length {
                warn!(
                    "Discarding line of {} bytes, lines are limited to {} bytes",
                    line.len(),
                    self.max_length
                );
                continue;
            }

            return Ok(Some(line[..].to_vec()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        if !src.is_empty() {
            debug!("Dropping {} bytes of unterminated line at end of stream", src.len());
            src.clear();
        }
        self.cursor = 0;
        self.discarding = false;

        Ok(None)
    }
}

impl Encoder<Vec<u8>> for LinesCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.extend_from_slice(&item);

        if let Some(character) = self.write_delimiter {
            dst.extend_from_slice(&[character]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn decode_all(codec: &mut LinesCodec, buffer: &mut BytesMut) -> Vec<Vec<u8>> {
        let mut lines = vec![];
        while let Some(line) = codec.decode(buffer).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn splits_on_newline() {
        let mut codec = LinesCodec::default();
        let mut buffer = BytesMut::from(&b"one\ntwo\nthree"[..]);

        let lines = decode_all(&mut codec, &mut buffer);

        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(&buffer[..], b"three");
    }

    #[test]
    fn line_arriving_in_pieces() {
        let mut codec = LinesCodec::default();
        let mut buffer = BytesMut::new();

        buffer.extend_from_slice(b"{\"volt");
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(b"age\": 3.3");
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(b"}\n{");
        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(b"{\"voltage\": 3.3}".to_vec())
        );
        assert_eq!(&buffer[..], b"{");
    }

    #[test]
    fn custom_read_delimiter() {
        let mut codec = LinesCodec::new(b';', None, 64);
        let mut buffer = BytesMut::from(&b"a;b\nc;"[..]);

        let lines = decode_all(&mut codec, &mut buffer);

        assert_eq!(lines, vec![b"a".to_vec(), b"b\nc".to_vec()]);
    }

    #[test]
    fn overlong_line_is_discarded_through_its_delimiter() {
        let mut codec = LinesCodec::new(b'\n', None, 8);
        let mut buffer = BytesMut::from(&b"0123456789abc"[..]);

        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        assert!(buffer.is_empty());

        buffer.extend_from_slice(b"def\nshort\n");
        let lines = decode_all(&mut codec, &mut buffer);

        assert_eq!(lines, vec![b"short".to_vec()]);
    }

    #[test]
    fn overlong_line_within_one_chunk() {
        let mut codec = LinesCodec::new(b'\n', None, 4);
        let mut buffer = BytesMut::from(&b"toolong\nok\n"[..]);

        let lines = decode_all(&mut codec, &mut buffer);

        assert_eq!(lines, vec![b"ok".to_vec()]);
    }

    #[test]
    fn eof_drops_partial_line() {
        let mut codec = LinesCodec::default();
        let mut buffer = BytesMut::from(&b"done\npartial"[..]);

        assert_eq!(
            codec.decode_eof(&mut buffer).unwrap(),
            Some(b"done".to_vec())
        );
        assert_eq!(codec.decode_eof(&mut buffer).unwrap(), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn encode_appends_write_delimiter() {
        let mut with = LinesCodec::new(b'\n', Some(b'\r'), 64);
        let mut without = LinesCodec::default();

        let mut dst = BytesMut::new();
        with.encode(b"AT".to_vec(), &mut dst).unwrap();
        without.encode(b"AT".to_vec(), &mut dst).unwrap();

        assert_eq!(&dst[..], b"AT\rAT");
    }
}
