//! Line framing and textline body conversion.

mod common;

use common::*;
use sockbridge::codec::textline_body;
use sockbridge::prelude::*;
use sockbridge::{Charset, Decoder, DecoderStage, LineDecoder, Pipeline, SharedDecoder, SharedError, TextlineDelimiter};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn decode_all(decoder: &mut LineDecoder, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for chunk in chunks {
        decoder.decode(chunk.to_vec(), &mut out).unwrap();
    }
    out
}

#[test]
fn line_decoder_splits_frames_across_chunks() {
    let mut decoder = LineDecoder::new(TextlineDelimiter::Line, 64);
    let frames = decode_all(&mut decoder, &[b"hel", b"lo\nwor", b"ld\r\n", b"tail"]);
    assert_eq!(frames, vec![b"hello".to_vec(), b"world".to_vec()]);

    let frames = decode_all(&mut decoder, &[b"\n"]);
    assert_eq!(frames, vec![b"tail".to_vec()]);
}

#[test]
fn nul_delimiter_keeps_carriage_returns() {
    let mut decoder = LineDecoder::new(TextlineDelimiter::Nul, 64);
    let frames = decode_all(&mut decoder, &[b"a\r\0b\0"]);
    assert_eq!(frames, vec![b"a\r".to_vec(), b"b".to_vec()]);
}

#[test]
fn over_long_frame_is_rejected_and_decoding_recovers() {
    let mut decoder = LineDecoder::new(TextlineDelimiter::Line, 4);
    let mut out = Vec::new();
    let err = decoder.decode(b"toolong\nok\n".to_vec(), &mut out).unwrap_err();
    assert!(matches!(err, Error::FrameTooLong { max: 4 }));
    assert_eq!(out, vec![b"ok".to_vec()]);

    let mut out = Vec::new();
    let err = decoder.decode(b"unterminated".to_vec(), &mut out).unwrap_err();
    assert!(matches!(err, Error::FrameTooLong { .. }));

    let mut out = Vec::new();
    decoder.decode(b"next\n".to_vec(), &mut out).unwrap();
    assert_eq!(out, vec![b"next".to_vec()]);
}

#[test]
fn textline_body_appends_missing_delimiter_once() {
    let body = textline_body(b"hello", Charset::Utf8, TextlineDelimiter::Line, true).unwrap();
    assert_eq!(body, b"hello\n");

    let body = textline_body(b"hello\n", Charset::Utf8, TextlineDelimiter::Line, true).unwrap();
    assert_eq!(body, b"hello\n");

    let body = textline_body(b"hello", Charset::Utf8, TextlineDelimiter::Nul, true).unwrap();
    assert_eq!(body, b"hello\0");

    let body = textline_body(b"hello", Charset::Utf8, TextlineDelimiter::Line, false).unwrap();
    assert_eq!(body, b"hello");
}

#[test]
fn textline_body_respects_charset() {
    let latin1 = [b'c', 0xE9];
    let body = textline_body(&latin1, Charset::Latin1, TextlineDelimiter::Line, true).unwrap();
    assert_eq!(body, vec![b'c', 0xE9, b'\n']);

    let err = textline_body(&latin1, Charset::Utf8, TextlineDelimiter::Line, true).unwrap_err();
    assert!(matches!(err, Error::InvalidText { charset: "UTF-8" }));

    let err = textline_body("né".as_bytes(), Charset::Ascii, TextlineDelimiter::Line, true).unwrap_err();
    assert!(matches!(err, Error::InvalidText { charset: "US-ASCII" }));
}

#[test]
fn charset_and_delimiter_names_parse() {
    assert_eq!("utf-8".parse::<Charset>().unwrap(), Charset::Utf8);
    assert_eq!("ISO_8859_1".parse::<Charset>().unwrap(), Charset::Latin1);
    assert_eq!("US-ASCII".parse::<Charset>().unwrap(), Charset::Ascii);
    assert!(matches!("ebcdic".parse::<Charset>(), Err(Error::UnsupportedCharset(_))));

    assert_eq!("LINE".parse::<TextlineDelimiter>().unwrap(), TextlineDelimiter::Line);
    assert_eq!("null".parse::<TextlineDelimiter>().unwrap(), TextlineDelimiter::Nul);
    assert!(matches!(
        "tab".parse::<TextlineDelimiter>(),
        Err(Error::InvalidDelimiter { .. })
    ));
}

// ============================================================================
// Pipeline Decoding
// ============================================================================

struct Uppercase;

impl SharedDecoder for Uppercase {
    fn decode(&self, input: Vec<u8>, out: &mut Vec<Vec<u8>>) -> Result<(), Error> {
        out.push(input.to_ascii_uppercase());
        Ok(())
    }
}

fn short_lines() -> DecoderStage {
    DecoderStage::per_channel(|| LineDecoder::new(TextlineDelimiter::Line, 4))
}

#[test]
fn pipeline_keeps_frames_decoded_alongside_an_error() {
    let mut pipeline = Pipeline::new(Arc::new(SilentHandler::default()))
        .with_decoder(&short_lines())
        .with_decoder(&DecoderStage::shared(Uppercase));

    let decoded = pipeline.decode(b"toolong\nok\n".to_vec());
    assert_eq!(decoded.messages, vec![b"OK".to_vec()]);
    assert!(matches!(decoded.error, Some(Error::FrameTooLong { max: 4 })));

    let decoded = pipeline.decode(b"ab\ncd\n".to_vec());
    assert_eq!(decoded.messages, vec![b"AB".to_vec(), b"CD".to_vec()]);
    assert!(decoded.error.is_none());
}

/// Records messages and errors in arrival order; keeps the channel open.
#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<String>>,
}

impl ChannelHandler for EventLog {
    fn message_received(&self, _channel: &Channel, _sender: SocketAddr, message: Vec<u8>) {
        let text = String::from_utf8_lossy(&message).into_owned();
        self.events.lock().unwrap().push(text);
    }

    fn exception_caught(&self, _channel: &Channel, cause: SharedError) {
        self.events.lock().unwrap().push(format!("error: {cause}"));
    }
}

#[test]
fn valid_line_sharing_a_read_with_an_over_long_one_is_delivered() {
    init_tracing();
    let log = Arc::new(EventLog::default());
    let codecs = CodecChain::new().with_decoder(short_lines());
    let factory = Arc::new(DefaultPipelineFactory::new(codecs, log.clone()));
    let (server, addr) = start_server(listener_config(Protocol::Tcp), factory);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"toolong\nok\n").unwrap();

    assert!(wait_until(Duration::from_secs(3), || log.events.lock().unwrap().len() == 2));
    let events = log.events.lock().unwrap().clone();
    assert_eq!(events[0], "ok");
    assert!(events[1].starts_with("error: "));
    server.stop().unwrap();
}
