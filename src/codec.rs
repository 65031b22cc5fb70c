//! Text line framing and charset conversion for `textline` endpoints.

use crate::config::EndpointConfiguration;
use crate::error::Error;
use crate::pipeline::{CodecChain, Decoder, DecoderStage};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Delimiter and Charset
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextlineDelimiter {
    /// `\n`; a preceding `\r` is stripped when decoding.
    #[default]
    Line,
    /// NUL byte.
    Nul,
}

impl TextlineDelimiter {
    pub fn byte(self) -> u8 {
        match self {
            TextlineDelimiter::Line => b'\n',
            TextlineDelimiter::Nul => 0,
        }
    }
}

impl FromStr for TextlineDelimiter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "line" => Ok(TextlineDelimiter::Line),
            "nul" | "null" => Ok(TextlineDelimiter::Nul),
            _ => Err(Error::InvalidDelimiter { got: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Charset {
    #[default]
    Utf8,
    Ascii,
    Latin1,
}

impl Charset {
    pub fn name(self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Ascii => "US-ASCII",
            Charset::Latin1 => "ISO-8859-1",
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String, Error> {
        let invalid = || Error::InvalidText {
            charset: self.name(),
        };
        match self {
            Charset::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|_| invalid()),
            Charset::Ascii if bytes.is_ascii() => Ok(bytes.iter().map(|&b| b as char).collect()),
            Charset::Ascii => Err(invalid()),
            Charset::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>, Error> {
        let invalid = || Error::InvalidText {
            charset: self.name(),
        };
        match self {
            Charset::Utf8 => Ok(text.as_bytes().to_vec()),
            Charset::Ascii if text.is_ascii() => Ok(text.as_bytes().to_vec()),
            Charset::Ascii => Err(invalid()),
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).map_err(|_| invalid()))
                .collect(),
        }
    }
}

impl FromStr for Charset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "us-ascii" | "ascii" => Ok(Charset::Ascii),
            "iso-8859-1" | "latin1" | "latin-1" => Ok(Charset::Latin1),
            _ => Err(Error::UnsupportedCharset(s.to_string())),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Line Decoder
// ============================================================================

/// Splits a byte stream on a delimiter. Emitted frames exclude the
/// delimiter. A frame (or unterminated buffer) longer than `max_length`
/// is discarded with [`Error::FrameTooLong`].
#[derive(Debug)]
pub struct LineDecoder {
    delimiter: TextlineDelimiter,
    max_length: usize,
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new(delimiter: TextlineDelimiter, max_length: usize) -> Self {
        Self {
            delimiter,
            max_length,
            buffer: Vec::new(),
        }
    }
}

impl Decoder for LineDecoder {
    fn decode(&mut self, input: Vec<u8>, out: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        if self.buffer.is_empty() {
            self.buffer = input;
        } else {
            self.buffer.extend_from_slice(&input);
        }

        let delimiter = self.delimiter.byte();
        let mut too_long = false;
        while let Some(pos) = self.buffer.iter().position(|&b| b == delimiter) {
            let mut frame: Vec<u8> = self.buffer.drain(..=pos).collect();
            frame.pop();
            if self.delimiter == TextlineDelimiter::Line && frame.last() == Some(&b'\r') {
                frame.pop();
            }
            if frame.len() > self.max_length {
                too_long = true;
                continue;
            }
            out.push(frame);
        }

        if self.buffer.len() > self.max_length {
            self.buffer.clear();
            too_long = true;
        }
        if too_long {
            return Err(Error::FrameTooLong {
                max: self.max_length,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Textline Helpers
// ============================================================================

/// Converts an outbound body for textline mode: decoded with `charset`,
/// delimiter appended when requested and missing, re-encoded.
pub fn textline_body(
    body: &[u8],
    charset: Charset,
    delimiter: TextlineDelimiter,
    auto_append: bool,
) -> Result<Vec<u8>, Error> {
    let mut text = charset.decode(body)?;
    let delimiter = char::from(delimiter.byte());
    if auto_append && !text.ends_with(delimiter) {
        text.push(delimiter);
    }
    charset.encode(&text)
}

impl CodecChain {
    /// Codec stages implied by an endpoint: a line decoder in textline mode,
    /// nothing otherwise.
    pub fn from_configuration(config: &EndpointConfiguration) -> Self {
        let mut chain = CodecChain::new();
        if config.textline {
            let delimiter = config.delimiter;
            let max_length = config.decoder_max_line_length;
            chain = chain.with_decoder(DecoderStage::per_channel(move || {
                LineDecoder::new(delimiter, max_length)
            }));
        }
        chain
    }
}
