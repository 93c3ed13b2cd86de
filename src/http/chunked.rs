//! Chunked transfer-coding decode/encode helpers (RFC 7230 §4.1).
//!
//! The Download Agent's `GETCHUNKHEAD → PROCESS_CHUNKDATA → GET_CHUNKTRAILER`
//! states (spec.md §4.5.1) are driven by [`ChunkDecoder`]; the Client Job's
//! `SEND_CHUNK_HEADER`/`SEND_CHUNK_DATA` states (spec.md §4.6.3) use
//! [`encode_chunk_header`] and [`FINAL_CHUNK`].

use crate::errors::{AcngError, Result};

pub const FINAL_CHUNK: &[u8] = b"0\r\n\r\n";

pub fn encode_chunk_header(len: usize) -> Vec<u8> {
    format!("{len:x}\r\n").into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDecodeState {
    Size,
    Data(usize),
    DataCrlf,
    Trailer,
    Done,
}

/// Incremental decoder over an input buffer that may arrive in arbitrary
/// fragments. Call [`Self::feed`] with the whole currently-available input;
/// it returns decoded data bytes and the number of input bytes consumed.
#[derive(Debug)]
pub struct ChunkDecoder {
    state: ChunkDecodeState,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkDecodeState::Size,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkDecodeState::Done
    }

    /// Decodes as much as possible from `input`. Returns `(data, consumed)`.
    /// `data` contains only payload bytes (chunk-size/trailer lines are
    /// stripped). May be called again with more bytes appended to continue.
    pub fn feed(&mut self, input: &[u8]) -> Result<(Vec<u8>, usize)> {
        let mut pos = 0;
        let mut out = Vec::new();

        loop {
            match self.state {
                ChunkDecodeState::Done => break,
                ChunkDecodeState::Size => {
                    let Some(line_end) = find_crlf(&input[pos..]) else {
                        break;
                    };
                    let line = &input[pos..pos + line_end];
                    let line_str = std::str::from_utf8(line)
                        .map_err(|_| AcngError::MalformedHttp("bad chunk size".into()))?;
                    let size_str = line_str.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| AcngError::MalformedHttp("bad chunk size".into()))?;
                    pos += line_end + 2;
                    if size == 0 {
                        self.state = ChunkDecodeState::Trailer;
                    } else {
                        self.state = ChunkDecodeState::Data(size);
                    }
                }
                ChunkDecodeState::Data(remaining) => {
                    let available = input.len() - pos;
                    let take = remaining.min(available);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let left = remaining - take;
                    if left > 0 {
                        self.state = ChunkDecodeState::Data(left);
                        break;
                    }
                    self.state = ChunkDecodeState::DataCrlf;
                }
                ChunkDecodeState::DataCrlf => {
                    if input.len() - pos < 2 {
                        break;
                    }
                    pos += 2;
                    self.state = ChunkDecodeState::Size;
                }
                ChunkDecodeState::Trailer => {
                    let Some(line_end) = find_crlf(&input[pos..]) else {
                        break;
                    };
                    let is_blank = line_end == 0;
                    pos += line_end + 2;
                    if is_blank {
                        self.state = ChunkDecodeState::Done;
                        break;
                    }
                    // non-empty trailer line: skip and keep looking for the terminator
                }
            }
        }

        Ok((out, pos))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
