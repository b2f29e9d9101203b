//! Framing for the engine's log endpoint.
//!
//! Containers attached to a TTY produce a raw byte stream; everything else
//! is multiplexed into frames of `{stream_type: u8, reserved: [u8; 3],
//! length: u32 BE}` followed by `length` payload bytes. Either way the
//! decoder yields complete lines tagged with the stream they arrived on,
//! tolerating headers and lines split at arbitrary chunk boundaries.

use bytes::{Buf, Bytes, BytesMut};
use memchr::memchr;
use snafu::Snafu;
use std::collections::VecDeque;
use tokio_util::codec::Decoder;

const FRAME_HEADER_LEN: usize = 8;

/// Which stream of the container a line was read from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamLabel {
    Stdout,
    Stderr,
    Tty,
}

impl StreamLabel {
    pub const fn as_str(self) -> &'static str {
        match self {
            StreamLabel::Stdout => "stdout",
            StreamLabel::Stderr => "stderr",
            StreamLabel::Tty => "tty",
        }
    }

    /// Frame header stream types: 0 is stdin (never expected from a logs
    /// endpoint), 1 stdout, 2 stderr. Anything unrecognized is read as
    /// stdout rather than dropped.
    fn from_frame_type(raw: u8) -> Self {
        match raw {
            2 => StreamLabel::Stderr,
            _ => StreamLabel::Stdout,
        }
    }
}

impl std::fmt::Display for StreamLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Snafu)]
pub enum FramingError {
    #[snafu(display("i/o error reading log stream: {source}"))]
    Io { source: std::io::Error },
}

impl From<std::io::Error> for FramingError {
    fn from(source: std::io::Error) -> Self {
        FramingError::Io { source }
    }
}

#[derive(Debug)]
enum Mode {
    /// Raw stream, no framing; lines are labeled `tty`.
    Tty { partial: BytesMut },
    /// 8-byte-header frames; a partial line is buffered per stream label and
    /// joined with the next frame carrying the same label.
    Multiplexed {
        stdout_partial: BytesMut,
        stderr_partial: BytesMut,
    },
}

/// Decoder from the engine's log payload to `(label, line)` pairs.
///
/// Lines are yielded without their trailing newline. A trailing fragment
/// with no newline when the stream ends is not a line and is discarded at
/// EOF, matching the engine's behavior of always terminating lines.
#[derive(Debug)]
pub struct LogStreamDecoder {
    mode: Mode,
    ready: VecDeque<(StreamLabel, Bytes)>,
}

impl LogStreamDecoder {
    pub fn tty() -> Self {
        Self {
            mode: Mode::Tty {
                partial: BytesMut::new(),
            },
            ready: VecDeque::new(),
        }
    }

    pub fn multiplexed() -> Self {
        Self {
            mode: Mode::Multiplexed {
                stdout_partial: BytesMut::new(),
                stderr_partial: BytesMut::new(),
            },
            ready: VecDeque::new(),
        }
    }

    pub fn for_tty(tty: bool) -> Self {
        if tty {
            Self::tty()
        } else {
            Self::multiplexed()
        }
    }

    /// Split complete lines off the front of `partial`, pushing them onto
    /// the ready queue. Whatever remains in `partial` is the unterminated
    /// tail awaiting more bytes.
    fn drain_lines(ready: &mut VecDeque<(StreamLabel, Bytes)>, partial: &mut BytesMut, label: StreamLabel) {
        while let Some(newline) = memchr(b'\n', partial) {
            let mut line = partial.split_to(newline + 1);
            line.truncate(newline);
            ready.push_back((label, line.freeze()));
        }
    }

    fn ingest_tty(&mut self, src: &mut BytesMut) {
        let Mode::Tty { partial } = &mut self.mode else {
            unreachable!("ingest_tty on multiplexed decoder");
        };
        partial.extend_from_slice(src);
        src.clear();
        Self::drain_lines(&mut self.ready, partial, StreamLabel::Tty);
    }

    /// Consume as many whole frames as `src` currently holds.
    fn ingest_frames(&mut self, src: &mut BytesMut) {
        let Mode::Multiplexed {
            stdout_partial,
            stderr_partial,
        } = &mut self.mode
        else {
            unreachable!("ingest_frames on tty decoder");
        };

        while src.len() >= FRAME_HEADER_LEN {
            let length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
            if src.len() < FRAME_HEADER_LEN + length {
                return;
            }

            let label = StreamLabel::from_frame_type(src[0]);
            src.advance(FRAME_HEADER_LEN);
            let payload = src.split_to(length);

            let partial = match label {
                StreamLabel::Stderr => &mut *stderr_partial,
                _ => &mut *stdout_partial,
            };
            partial.extend_from_slice(&payload);
            Self::drain_lines(&mut self.ready, partial, label);
        }
    }
}

impl Decoder for LogStreamDecoder {
    type Item = (StreamLabel, Bytes);
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.ready.pop_front() {
            return Ok(Some(item));
        }

        if let Mode::Tty { .. } = self.mode {
            self.ingest_tty(src);
        } else {
            self.ingest_frames(src);
        }

        Ok(self.ready.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream_type, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn collect(decoder: &mut LogStreamDecoder, buf: &mut BytesMut) -> Vec<(StreamLabel, String)> {
        let mut lines = Vec::new();
        while let Some((label, line)) = decoder.decode(buf).unwrap() {
            lines.push((label, String::from_utf8(line.to_vec()).unwrap()));
        }
        lines
    }

    #[test]
    fn decodes_single_stdout_frame_with_two_lines() {
        let mut buf = BytesMut::from(&frame(1, b"hi\n!\n")[..]);
        let mut decoder = LogStreamDecoder::multiplexed();

        assert_eq!(
            collect(&mut decoder, &mut buf),
            vec![
                (StreamLabel::Stdout, "hi".into()),
                (StreamLabel::Stdout, "!".into()),
            ]
        );
    }

    #[test]
    fn stdin_frame_type_reads_as_stdout() {
        let mut buf = BytesMut::from(&frame(0, b"whoops\n")[..]);
        let mut decoder = LogStreamDecoder::multiplexed();

        assert_eq!(collect(&mut decoder, &mut buf), vec![(StreamLabel::Stdout, "whoops".into())]);
    }

    #[test]
    fn joins_partial_line_across_same_stream_frames() {
        let mut input = frame(1, b"hel");
        input.extend_from_slice(&frame(1, b"lo\n"));
        let mut buf = BytesMut::from(&input[..]);
        let mut decoder = LogStreamDecoder::multiplexed();

        assert_eq!(collect(&mut decoder, &mut buf), vec![(StreamLabel::Stdout, "hello".into())]);
    }

    #[test]
    fn interleaved_streams_keep_independent_partials() {
        let mut input = frame(1, b"out-");
        input.extend_from_slice(&frame(2, b"err line\n"));
        input.extend_from_slice(&frame(1, b"done\n"));
        let mut buf = BytesMut::from(&input[..]);
        let mut decoder = LogStreamDecoder::multiplexed();

        assert_eq!(
            collect(&mut decoder, &mut buf),
            vec![
                (StreamLabel::Stderr, "err line".into()),
                (StreamLabel::Stdout, "out-done".into()),
            ]
        );
    }

    #[test]
    fn tolerates_header_split_across_chunks() {
        let whole = frame(2, b"split\n");
        let mut decoder = LogStreamDecoder::multiplexed();
        let mut buf = BytesMut::new();
        let mut lines = Vec::new();

        // One byte at a time is the worst possible chunking.
        for byte in whole {
            buf.extend_from_slice(&[byte]);
            lines.extend(collect(&mut decoder, &mut buf));
        }

        assert_eq!(lines, vec![(StreamLabel::Stderr, "split".into())]);
    }

    #[test]
    fn tolerates_payload_split_across_chunks() {
        let whole = frame(1, b"abc\ndef\n");
        let (left, right) = whole.split_at(11);
        let mut decoder = LogStreamDecoder::multiplexed();

        let mut buf = BytesMut::from(left);
        let mut lines = collect(&mut decoder, &mut buf);
        buf.extend_from_slice(right);
        lines.extend(collect(&mut decoder, &mut buf));

        assert_eq!(
            lines,
            vec![
                (StreamLabel::Stdout, "abc".into()),
                (StreamLabel::Stdout, "def".into()),
            ]
        );
    }

    #[test]
    fn empty_frames_produce_nothing() {
        let mut buf = BytesMut::from(&frame(1, b"")[..]);
        let mut decoder = LogStreamDecoder::multiplexed();
        assert!(collect(&mut decoder, &mut buf).is_empty());
    }

    #[test]
    fn preserves_line_order_regardless_of_chunking() {
        let mut whole = Vec::new();
        let expected: Vec<(StreamLabel, String)> = (0..20)
            .map(|i| {
                let label = if i % 3 == 0 { 2 } else { 1 };
                whole.extend_from_slice(&frame(label, format!("line {i}\n").as_bytes()));
                (StreamLabel::from_frame_type(label), format!("line {i}"))
            })
            .collect();

        for chunk_size in [1, 3, 7, 64, whole.len()] {
            let mut decoder = LogStreamDecoder::multiplexed();
            let mut buf = BytesMut::new();
            let mut lines = Vec::new();
            for chunk in whole.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                lines.extend(collect(&mut decoder, &mut buf));
            }
            assert_eq!(lines, expected, "chunk_size {chunk_size}");
        }
    }

    #[test]
    fn tty_mode_splits_on_newlines() {
        let mut buf = BytesMut::from(&b"plain\nstream"[..]);
        let mut decoder = LogStreamDecoder::tty();

        assert_eq!(collect(&mut decoder, &mut buf), vec![(StreamLabel::Tty, "plain".into())]);

        buf.extend_from_slice(b" continues\n");
        assert_eq!(
            collect(&mut decoder, &mut buf),
            vec![(StreamLabel::Tty, "stream continues".into())]
        );
    }

    #[test]
    fn tty_mode_handles_empty_lines() {
        let mut buf = BytesMut::from(&b"\n\nx\n"[..]);
        let mut decoder = LogStreamDecoder::tty();

        assert_eq!(
            collect(&mut decoder, &mut buf),
            vec![
                (StreamLabel::Tty, "".into()),
                (StreamLabel::Tty, "".into()),
                (StreamLabel::Tty, "x".into()),
            ]
        );
    }
}
