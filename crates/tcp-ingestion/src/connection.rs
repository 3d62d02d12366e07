// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-connection line protocol.
//!
//! Each non-empty line gets exactly one reply line, written in read order:
//! `PING` is answered with `PONG`, `STATUS` with the counter line, and
//! anything else is validated as a hex frame. Accepted frames are handed to
//! the forwarder and acknowledged with `OK` right away; the backend result is
//! never reported to the client.

use std::io;
use std::sync::Arc;

use derive_more::Display;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::FrameError;
use crate::forwarder::{ClientDescriptor, Forwarder};
use crate::frame::{preview, validate};
use crate::stats::{Stats, StatsSnapshot};

/// Longest accepted line, in bytes, terminator excluded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

const LINE_PREVIEW_LEN: usize = 50;

/// A reply line, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Reply {
    #[display("PONG")]
    Pong,
    #[display("{}", _0.status_line())]
    Status(StatsSnapshot),
    #[display("OK")]
    Accepted,
    #[display("ERROR: Invalid hex data format")]
    InvalidFrame,
    #[display("ERROR: Backend forwarding initiation failed")]
    ForwardingFailed,
    #[display("ERROR: Server busy")]
    Busy,
}

/// One decoded input line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Text(String),
    Rejected(FrameError),
}

/// [`LinesCodec`] that reports over-long and non-UTF-8 lines as items
/// instead of errors, so the stream keeps going after them.
struct LineDecoder {
    inner: LinesCodec,
    max_length: usize,
}

impl LineDecoder {
    fn new(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    fn classify(
        &self,
        decoded: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Line>, LinesCodecError> {
        match decoded {
            Ok(line) => Ok(line.map(Line::Text)),
            // the codec discards the rest of the line on its own
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                Ok(Some(Line::Rejected(FrameError::LineTooLong {
                    limit: self.max_length,
                })))
            }
            // the offending line has already been consumed up to its newline
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(Line::Rejected(FrameError::NotUtf8)))
            }
            Err(e) => Err(e),
        }
    }
}

impl Decoder for LineDecoder {
    type Item = Line;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, LinesCodecError> {
        let decoded = self.inner.decode(buf);
        self.classify(decoded)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, LinesCodecError> {
        let decoded = self.inner.decode_eof(buf);
        self.classify(decoded)
    }
}

/// Serves one client connection.
#[derive(Clone)]
pub struct ConnectionHandler {
    peer: Option<ClientDescriptor>,
    stats: Arc<Stats>,
    forwarder: Arc<Forwarder>,
}

impl ConnectionHandler {
    pub fn new(
        peer: Option<ClientDescriptor>,
        stats: Arc<Stats>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        Self {
            peer,
            stats,
            forwarder,
        }
    }

    fn peer_name(&self) -> &str {
        self.peer
            .as_ref()
            .map_or("unknown", ClientDescriptor::as_str)
    }

    /// Reads lines until EOF, an I/O error or `stop`, replying to each.
    ///
    /// A line over [`MAX_LINE_LENGTH`] or one that is not valid UTF-8 gets
    /// the invalid-frame reply; reading resumes at the next line.
    pub async fn run<S>(&self, stream: S, stop: CancellationToken) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = FramedRead::new(reader, LineDecoder::new(MAX_LINE_LENGTH));

        loop {
            let next = tokio::select! {
                () = stop.cancelled() => {
                    debug!("Closing connection with {}: daemon stopping", self.peer_name());
                    break;
                }
                next = lines.next() => next,
            };

            let reply = match next {
                None => break,
                Some(Ok(Line::Text(line))) => self.respond(&line),
                Some(Ok(Line::Rejected(err))) => {
                    warn!("Invalid data from {}: {}", self.peer_name(), err);
                    Some(Reply::InvalidFrame)
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e),
                Some(Err(e)) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            };

            if let Some(reply) = reply {
                write_reply(&mut writer, &reply).await?;
            }
        }

        Ok(())
    }

    /// Reply for one received line; `None` for blank lines.
    pub fn respond(&self, line: &str) -> Option<Reply> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        debug!(
            "Received from {}: {}",
            self.peer_name(),
            preview(line, LINE_PREVIEW_LEN)
        );

        if line.eq_ignore_ascii_case("PING") {
            return Some(Reply::Pong);
        }
        if line.eq_ignore_ascii_case("STATUS") {
            return Some(Reply::Status(self.stats.snapshot()));
        }

        let frame = match validate(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Invalid hex data from {}: {}", self.peer_name(), e);
                return Some(Reply::InvalidFrame);
            }
        };

        self.stats.record_message();
        match self.forwarder.submit(frame, self.peer.clone()) {
            Ok(_handle) => Some(Reply::Accepted),
            Err(e) => {
                error!("Error forwarding data from {}: {}", self.peer_name(), e);
                Some(Reply::ForwardingFailed)
            }
        }
    }
}

pub(crate) async fn write_reply<W>(writer: &mut W, reply: &Reply) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = reply.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
