//! Framed duplex channel to the display host.
//!
//! Two one-way streams: inputs (gateway to host) carry one command per
//! frame, updates (host to gateway) carry images, audio and text notices.
//!
//! Byte streams use a `[u32 LE length][body]` prefix. Transports that keep
//! message boundaries on their own (message mode) carry bare bodies. Both
//! are exposed as the same `Sink`/`Stream` pair so callers never care which
//! discipline is in use.
//!
//! Update body layout:
//!
//! ```text
//! tag: u32 LE   0 = image/audio, 1 = UTF-8 text, 2 = UTF-16LE text
//! tag 0:        idx, pos_x, pos_y, width, height, format, quality, fullscreen
//!               (8 x i32 LE), then the raw payload
//! tag 1/2:      the text
//! ```

use std::io;
use std::pin::Pin;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt, TryStreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::update_cache::{PendingUpdate, Update, UpdateFormat};

/// Frames above this size mean the stream is out of sync.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const TAG_IMAGE: u32 = 0;
pub const TAG_TEXT_UTF8: u32 = 1;
pub const TAG_TEXT_UTF16: u32 = 2;

/// Size of the metadata block following an image tag.
pub const IMAGE_HEADER_LEN: usize = 8 * 4;

pub type FrameSink = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// The two halves of an established host channel.
pub struct HostChannel {
    pub inputs: FrameSink,
    pub updates: FrameStream,
}

impl HostChannel {
    /// Length-prefixed framing over a pair of byte streams.
    pub fn over_streams<W, R>(inputs: W, updates: R) -> Self
    where
        W: AsyncWrite + Send + 'static,
        R: AsyncRead + Send + 'static,
    {
        Self {
            inputs: Box::pin(FramedWrite::new(inputs, codec())),
            updates: Box::pin(FramedRead::new(updates, codec()).map_ok(BytesMut::freeze)),
        }
    }

    /// Message-mode framing over a transport that already delimits messages.
    pub fn over_messages<S, T>(inputs: S, updates: T) -> Self
    where
        S: Sink<Bytes, Error = io::Error> + Send + 'static,
        T: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inputs: Box::pin(inputs),
            updates: Box::pin(updates.map(|frame| match frame {
                Ok(body) if body.len() > MAX_FRAME_SIZE => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {} bytes exceeds limit", body.len()),
                )),
                other => other,
            })),
        }
    }
}

/// `[u32 LE length][body]` codec shared by both directions.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Text notices from the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostText {
    Reload,
    Clipboard(String),
    Terminal(String),
    PrintJob(String),
}

impl HostText {
    fn parse(text: &str) -> Result<Self, FrameError> {
        if text == "reload" {
            return Ok(Self::Reload);
        }
        match text.split_once('|') {
            Some(("clipboard", rest)) => Ok(Self::Clipboard(rest.to_string())),
            Some(("term", rest)) => Ok(Self::Terminal(rest.to_string())),
            Some(("printjob", rest)) => Ok(Self::PrintJob(rest.to_string())),
            _ => Err(FrameError::UnknownText(text.chars().take(32).collect())),
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            Self::Reload => "reload".to_string(),
            Self::Clipboard(text) => format!("clipboard|{text}"),
            Self::Terminal(text) => format!("term|{text}"),
            Self::PrintJob(name) => format!("printjob|{name}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostFrame {
    Image(PendingUpdate),
    Text(HostText),
}

/// A frame that could not be understood. The stream itself is intact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),
    #[error("unknown frame tag {0}")]
    UnknownTag(u32),
    #[error("unknown payload format {0}")]
    UnknownFormat(i32),
    #[error("invalid text encoding")]
    InvalidText,
    #[error("unknown text notice {0:?}")]
    UnknownText(String),
}

pub fn decode_update(mut body: Bytes) -> Result<HostFrame, FrameError> {
    if body.len() < 4 {
        return Err(FrameError::Truncated(body.len()));
    }
    match body.get_u32_le() {
        TAG_IMAGE => {
            if body.len() < IMAGE_HEADER_LEN {
                return Err(FrameError::Truncated(body.len() + 4));
            }
            let _host_idx = body.get_i32_le();
            let pos_x = body.get_i32_le();
            let pos_y = body.get_i32_le();
            let width = body.get_i32_le();
            let height = body.get_i32_le();
            let format_code = body.get_i32_le();
            let quality = body.get_i32_le();
            let fullscreen = body.get_i32_le() != 0;
            let format =
                UpdateFormat::from_code(format_code).ok_or(FrameError::UnknownFormat(format_code))?;
            Ok(HostFrame::Image(PendingUpdate {
                pos_x,
                pos_y,
                width,
                height,
                format,
                quality,
                fullscreen,
                data: body,
            }))
        }
        TAG_TEXT_UTF8 => {
            let text = std::str::from_utf8(&body).map_err(|_| FrameError::InvalidText)?;
            HostText::parse(text).map(HostFrame::Text)
        }
        TAG_TEXT_UTF16 => {
            if body.len() % 2 != 0 {
                return Err(FrameError::InvalidText);
            }
            let units: Vec<u16> = body
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            let text = String::from_utf16(&units).map_err(|_| FrameError::InvalidText)?;
            HostText::parse(&text).map(HostFrame::Text)
        }
        tag => Err(FrameError::UnknownTag(tag)),
    }
}

fn put_image_header(out: &mut BytesMut, idx: i32, update: &PendingUpdate) {
    out.put_u32_le(TAG_IMAGE);
    out.put_i32_le(idx);
    out.put_i32_le(update.pos_x);
    out.put_i32_le(update.pos_y);
    out.put_i32_le(update.width);
    out.put_i32_le(update.height);
    out.put_i32_le(update.format.code());
    out.put_i32_le(update.quality);
    out.put_i32_le(i32::from(update.fullscreen));
}

/// Body of an image frame as the host sends it.
pub fn encode_image(host_idx: i32, update: &PendingUpdate) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + IMAGE_HEADER_LEN + update.data.len());
    put_image_header(&mut out, host_idx, update);
    out.extend_from_slice(&update.data);
    out.freeze()
}

/// Same layout with the gateway's own index, for binary clients.
pub fn encode_indexed(update: &Update) -> Bytes {
    let pending = PendingUpdate {
        pos_x: update.pos_x,
        pos_y: update.pos_y,
        width: update.width,
        height: update.height,
        format: update.format,
        quality: update.quality,
        fullscreen: update.fullscreen,
        data: update.data.clone(),
    };
    // Clients read the index as a 32-bit field; it wraps after 2^31 updates.
    encode_image(update.idx as i32, &pending)
}

#[cfg(test)]
pub fn encode_text(text: &HostText) -> Bytes {
    let wire = text.to_wire();
    let mut out = BytesMut::with_capacity(4 + wire.len());
    out.put_u32_le(TAG_TEXT_UTF8);
    out.extend_from_slice(wire.as_bytes());
    out.freeze()
}

/// Write one command frame. Callers must not share the sink between tasks.
pub async fn send_command(sink: &mut FrameSink, wire: &str) -> io::Result<()> {
    sink.send(Bytes::copy_from_slice(wire.as_bytes())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;

    fn pending(fullscreen: bool) -> PendingUpdate {
        PendingUpdate {
            pos_x: 10,
            pos_y: 20,
            width: 300,
            height: 200,
            format: UpdateFormat::Webp,
            quality: 75,
            fullscreen,
            data: Bytes::from_static(b"\x00\x01payload"),
        }
    }

    #[test]
    fn test_image_header_layout() {
        let body = encode_image(99, &pending(true));
        assert_eq!(body.len(), 4 + IMAGE_HEADER_LEN + 9);
        assert_eq!(&body[0..4], &0u32.to_le_bytes());
        assert_eq!(&body[4..8], &99i32.to_le_bytes());
        assert_eq!(&body[8..12], &10i32.to_le_bytes());
        assert_eq!(&body[24..28], &2i32.to_le_bytes());
        assert_eq!(&body[32..36], &1i32.to_le_bytes());
        assert_eq!(&body[36..], b"\x00\x01payload");
    }

    #[test]
    fn test_decode_image_ignores_host_index() {
        let frame = decode_update(encode_image(12345, &pending(false))).unwrap();
        assert_eq!(frame, HostFrame::Image(pending(false)));
    }

    #[test]
    fn test_decode_text_notices() {
        let cases = [
            ("reload", HostText::Reload),
            ("clipboard|a|b", HostText::Clipboard("a|b".into())),
            ("term|$ ls\r\n", HostText::Terminal("$ ls\r\n".into())),
            ("printjob|doc.pdf", HostText::PrintJob("doc.pdf".into())),
        ];
        for (wire, expected) in cases {
            let mut body = BytesMut::new();
            body.put_u32_le(TAG_TEXT_UTF8);
            body.extend_from_slice(wire.as_bytes());
            assert_eq!(
                decode_update(body.freeze()).unwrap(),
                HostFrame::Text(expected)
            );
        }
    }

    #[test]
    fn test_decode_utf16_text() {
        let mut body = BytesMut::new();
        body.put_u32_le(TAG_TEXT_UTF16);
        for unit in "term|é".encode_utf16() {
            body.put_u16_le(unit);
        }
        assert_eq!(
            decode_update(body.freeze()).unwrap(),
            HostFrame::Text(HostText::Terminal("é".into()))
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode_update(Bytes::from_static(b"\x00\x00")),
            Err(FrameError::Truncated(2))
        );
        assert_eq!(
            decode_update(Bytes::from_static(b"\x07\x00\x00\x00")),
            Err(FrameError::UnknownTag(7))
        );
        let mut bad_format = pending(false);
        bad_format.format = UpdateFormat::Png;
        let mut body = BytesMut::from(&encode_image(0, &bad_format)[..]);
        body[24..28].copy_from_slice(&42i32.to_le_bytes());
        assert_eq!(
            decode_update(body.freeze()),
            Err(FrameError::UnknownFormat(42))
        );
        assert!(matches!(
            decode_update(encode_text_raw("bogus")),
            Err(FrameError::UnknownText(_))
        ));
    }

    fn encode_text_raw(s: &str) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u32_le(TAG_TEXT_UTF8);
        body.extend_from_slice(s.as_bytes());
        body.freeze()
    }

    #[tokio::test]
    async fn test_length_prefixed_stream() {
        let (gateway_in, host_in) = tokio::io::duplex(1024);
        let (host_out, gateway_out) = tokio::io::duplex(1024);
        let mut channel = HostChannel::over_streams(gateway_in, gateway_out);

        send_command(&mut channel.inputs, "KSC30-1-0").await.unwrap();
        send_command(&mut channel.inputs, "FSU").await.unwrap();

        let mut host_reader = FramedRead::new(host_in, codec());
        let first = host_reader.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"KSC30-1-0");
        let second = host_reader.next().await.unwrap().unwrap();
        assert_eq!(&second[..], b"FSU");

        let mut host_writer = FramedWrite::new(host_out, codec());
        host_writer
            .send(encode_text(&HostText::Reload))
            .await
            .unwrap();
        let body = channel.updates.next().await.unwrap().unwrap();
        assert_eq!(
            decode_update(body).unwrap(),
            HostFrame::Text(HostText::Reload)
        );
    }

    #[tokio::test]
    async fn test_length_prefix_is_little_endian() {
        let (gateway_in, mut host_in) = tokio::io::duplex(64);
        let (_host_out, gateway_out) = tokio::io::duplex(64);
        let mut channel = HostChannel::over_streams(gateway_in, gateway_out);
        send_command(&mut channel.inputs, "CON").await.unwrap();

        let mut raw = [0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut host_in, &mut raw)
            .await
            .unwrap();
        assert_eq!(&raw, b"\x03\x00\x00\x00CON");
    }

    #[tokio::test]
    async fn test_eof_ends_update_stream() {
        let (gateway_in, _host_in) = tokio::io::duplex(64);
        let (host_out, gateway_out) = tokio::io::duplex(64);
        let mut channel = HostChannel::over_streams(gateway_in, gateway_out);
        drop(host_out);
        assert!(channel.updates.next().await.is_none());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let (gateway_in, _host_in) = tokio::io::duplex(64);
        let (mut host_out, gateway_out) = tokio::io::duplex(64);
        let mut channel = HostChannel::over_streams(gateway_in, gateway_out);
        tokio::io::AsyncWriteExt::write_all(&mut host_out, b"\x10\x00\x00\x00abc")
            .await
            .unwrap();
        drop(host_out);
        assert!(channel.updates.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_message_mode() {
        let (in_tx, mut in_rx) = mpsc::channel::<Bytes>(4);
        let (mut out_tx, out_rx) = mpsc::channel::<io::Result<Bytes>>(4);
        let inputs = in_tx.sink_map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e));
        let mut channel = HostChannel::over_messages(inputs, out_rx);

        send_command(&mut channel.inputs, "PLS").await.unwrap();
        assert_eq!(&in_rx.next().await.unwrap()[..], b"PLS");

        out_tx
            .send(Ok(encode_image(1, &pending(true))))
            .await
            .unwrap();
        let body = channel.updates.next().await.unwrap().unwrap();
        assert_eq!(decode_update(body).unwrap(), HostFrame::Image(pending(true)));
    }
}
