use encoding_rs::{CoderResult, DecoderResult, Encoding, UTF_8};
use thiserror::Error;
use tracing::{trace, warn};

use crate::telemetry::logging::hexdump;

pub const DEFAULT_ENCODING: &str = "utf-8";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported encoding '{0}'")]
    UnsupportedEncoding(String),
    #[error("malformed {encoding} input near byte {offset}")]
    Malformed {
        encoding: &'static str,
        offset: usize,
    },
}

/// Turns the server's binary frames into text.
///
/// Decoding is stateful across frames so a character split over two frames is
/// reassembled; a frame with malformed input is rejected whole and the
/// carried-over state is discarded.
pub struct StreamDecoder {
    encoding: &'static Encoding,
    decoder: encoding_rs::Decoder,
}

impl StreamDecoder {
    pub fn try_for_label(label: Option<&str>) -> Result<Self, DecodeError> {
        let label = label
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .unwrap_or(DEFAULT_ENCODING);
        Encoding::for_label(label.as_bytes())
            .map(Self::with_encoding)
            .ok_or_else(|| DecodeError::UnsupportedEncoding(label.to_string()))
    }

    /// Like `try_for_label`, but an unknown label is logged and replaced by
    /// UTF-8.
    pub fn for_label(label: Option<&str>) -> Self {
        match Self::try_for_label(label) {
            Ok(decoder) => decoder,
            Err(err) => {
                warn!(target: "shellrelay::decoder", error = %err, "falling back to utf-8");
                Self::with_encoding(UTF_8)
            }
        }
    }

    pub fn with_encoding(encoding: &'static Encoding) -> Self {
        Self {
            encoding,
            decoder: encoding.new_decoder_without_bom_handling(),
        }
    }

    pub fn encoding_name(&self) -> &'static str {
        self.encoding.name()
    }

    pub fn decode(&mut self, frame: &[u8]) -> Result<String, DecodeError> {
        let mut text = String::with_capacity(self.capacity_for(frame.len()));
        let mut consumed = 0;
        loop {
            let (result, read) =
                self.decoder
                    .decode_to_string_without_replacement(&frame[consumed..], &mut text, false);
            consumed += read;
            match result {
                DecoderResult::InputEmpty => return Ok(text),
                DecoderResult::OutputFull => {
                    let additional = self.capacity_for(frame.len() - consumed);
                    text.reserve(additional);
                }
                DecoderResult::Malformed(_, _) => {
                    trace!(
                        target: "shellrelay::decoder",
                        "dropping frame:\n{}",
                        hexdump(frame)
                    );
                    self.reset();
                    return Err(DecodeError::Malformed {
                        encoding: self.encoding.name(),
                        offset: consumed,
                    });
                }
            }
        }
    }

    /// Flushes a dangling partial character at end of stream, replacing it.
    pub fn finish(&mut self) -> String {
        let mut text = String::with_capacity(16);
        let (result, _, _) = self.decoder.decode_to_string(&[], &mut text, true);
        if result == CoderResult::OutputFull {
            trace!(target: "shellrelay::decoder", "tail did not fit flush buffer");
        }
        self.reset();
        text
    }

    fn reset(&mut self) {
        self.decoder = self.encoding.new_decoder_without_bom_handling();
    }

    fn capacity_for(&self, len: usize) -> usize {
        self.decoder
            .max_utf8_buffer_length_without_replacement(len)
            .unwrap_or_else(|| len.saturating_mul(3))
            .max(4)
    }
}
