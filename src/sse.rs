//! Incremental server-sent-event framing for upstream completion bodies.
//!
//! Events are split at the byte level on the blank-line delimiter, so a read
//! boundary that lands inside the delimiter or inside a multi-byte code point
//! never changes what comes out.

use crate::constants::{
    HTML_DOCUMENT_MARKERS, MAX_SSE_FRAME_BYTES, SSE_DATA_PREFIX, SSE_EVENT_DELIMITER,
};
use crate::types::RelayError;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

/// One decoded `data:` payload. Consumed immediately by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub raw_data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preamble {
    Pending,
    Checked,
}

#[derive(Debug)]
pub struct SseCodec {
    max_frame_len: usize,
    preamble: Preamble,
    // Bytes already scanned for a delimiter without finding one.
    scanned: usize,
}

pub type SseFrames<S> = FramedRead<StreamReader<S, Bytes>, SseCodec>;

/// Frames an HTTP body stream into SSE events.
pub fn frame_body<S>(body: S) -> SseFrames<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    FramedRead::new(StreamReader::new(body), SseCodec::new())
}

impl SseCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_SSE_FRAME_BYTES)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            preamble: Preamble::Pending,
            scanned: 0,
        }
    }

    /// Rejects HTML error pages served in place of an event stream.
    ///
    /// Returns `Ok(false)` while the buffered prefix is still too short to decide.
    fn check_preamble(&mut self, buf: &[u8], eof: bool) -> Result<bool, RelayError> {
        let decided = match Self::classify_preamble(buf) {
            PreambleVerdict::Html => {
                let text = String::from_utf8_lossy(buf);
                let text = text.trim_start();
                tracing::error!(
                    "[☁️  -> ⚙️ ] Upstream returned an HTML document instead of an event stream: {}",
                    crate::str_utils::snippet(text, 120)
                );
                return Err(RelayError::MalformedUpstream(format!(
                    "expected text/event-stream, got HTML: {}",
                    crate::str_utils::snippet(text, 200)
                )));
            }
            PreambleVerdict::Stream => true,
            PreambleVerdict::NeedMore => eof,
        };
        if decided {
            self.preamble = Preamble::Checked;
        }
        Ok(decided)
    }

    fn classify_preamble(buf: &[u8]) -> PreambleVerdict {
        let start = match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(i) => i,
            None => return PreambleVerdict::NeedMore,
        };
        let rest = &buf[start..];
        let prefix = SSE_DATA_PREFIX.as_bytes();

        let candidate = if rest.starts_with(prefix) {
            let after = &rest[prefix.len()..];
            let skip = after
                .iter()
                .position(|b| *b != b' ' && *b != b'\t')
                .unwrap_or(after.len());
            &after[skip..]
        } else if prefix.starts_with(rest) {
            return PreambleVerdict::NeedMore;
        } else {
            rest
        };

        if candidate.is_empty() {
            return PreambleVerdict::NeedMore;
        }

        for marker in HTML_DOCUMENT_MARKERS {
            let marker = marker.as_bytes();
            let n = candidate.len().min(marker.len());
            if candidate[..n].eq_ignore_ascii_case(&marker[..n]) {
                if candidate.len() >= marker.len() {
                    return PreambleVerdict::Html;
                }
                return PreambleVerdict::NeedMore;
            }
        }
        PreambleVerdict::Stream
    }

    fn check_frame_len(&self, buffered: usize) -> Result<(), RelayError> {
        if buffered > self.max_frame_len {
            return Err(RelayError::MalformedUpstream(format!(
                "SSE frame exceeded {} bytes without a delimiter",
                self.max_frame_len
            )));
        }
        Ok(())
    }

    fn payload_of(block: &[u8]) -> Option<StreamEvent> {
        let start = block
            .iter()
            .position(|b| *b != b'\n' && *b != b'\r')
            .unwrap_or(block.len());
        let block = &block[start..];
        match block.strip_prefix(SSE_DATA_PREFIX.as_bytes()) {
            Some(data) => Some(StreamEvent {
                raw_data: String::from_utf8_lossy(data).into_owned(),
            }),
            None => {
                if !block.is_empty() {
                    tracing::trace!(
                        "[☁️  -> ⚙️ ] Discarding non-data SSE block ({} bytes)",
                        block.len()
                    );
                }
                None
            }
        }
    }
}

enum PreambleVerdict {
    Html,
    Stream,
    NeedMore,
}

impl Default for SseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SseCodec {
    type Item = StreamEvent;
    type Error = RelayError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<StreamEvent>, RelayError> {
        if self.preamble == Preamble::Pending && !self.check_preamble(buf, false)? {
            self.check_frame_len(buf.len())?;
            return Ok(None);
        }

        loop {
            // The delimiter may straddle the previously scanned region.
            let from = self.scanned.saturating_sub(SSE_EVENT_DELIMITER.len() - 1);
            let found = buf[from..]
                .windows(SSE_EVENT_DELIMITER.len())
                .position(|w| w == SSE_EVENT_DELIMITER);

            match found {
                Some(pos) => {
                    let end = from + pos;
                    let block = buf.split_to(end + SSE_EVENT_DELIMITER.len());
                    self.scanned = 0;
                    if let Some(event) = Self::payload_of(&block[..end]) {
                        return Ok(Some(event));
                    }
                }
                None => {
                    self.check_frame_len(buf.len())?;
                    self.scanned = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<StreamEvent>, RelayError> {
        if self.preamble == Preamble::Pending {
            self.check_preamble(buf, true)?;
        }
        if let Some(event) = self.decode(buf)? {
            return Ok(Some(event));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        // Upstream may omit the final delimiter.
        let tail = buf.split_to(buf.len());
        self.scanned = 0;
        let end = tail
            .iter()
            .rposition(|b| *b != b'\n' && *b != b'\r')
            .map(|i| i + 1)
            .unwrap_or(0);
        match Self::payload_of(&tail[..end]) {
            Some(event) if !event.raw_data.trim().is_empty() => {
                tracing::debug!("[☁️  -> ⚙️ ] Flushing undelimited trailing event");
                Ok(Some(event))
            }
            _ => Ok(None),
        }
    }
}
