//! Framed codecs for client-worker communication.
//!
//! Every frame is length-prefixed (4 bytes) via LengthDelimitedCodec.
//! - `RequestCodec`: one type byte followed by a JSON payload.
//! - `OutputCodec`: a JSON `OutputBatch`, or the raw dead sentinel. Payloads
//!   that fail to decode come out as `OutputFrame::Malformed`.
//! - `JsonCodec<T>`: plain JSON frames (startup handshake on worker stdout).
//!
//! The tokio-util codecs work over AsyncRead/AsyncWrite; `BlockingFramed`
//! drives the same codecs over blocking std streams.

use std::io::{self, Read, Write};
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{EngineCoreInput, EngineCoreRequestType, OutputBatch, OutputFrame};

/// Reserved response payload meaning the worker has permanently stopped.
///
/// Never valid JSON for an `OutputBatch` (those always start with `{`).
pub const ENGINE_CORE_DEAD: &[u8] = b"ENGINE_CORE_DEAD";

fn length_delimited() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .new_codec()
}

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Codec that frames messages with length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: length_delimited(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(invalid_data),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(invalid_data)?;
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Request channel codec: `[type byte][json payload]` inside a length frame.
#[derive(Default)]
pub struct RequestCodec {
    inner: LengthDelimitedCodec,
}

impl RequestCodec {
    pub fn new() -> Self {
        Self {
            inner: length_delimited(),
        }
    }
}

impl Decoder for RequestCodec {
    type Item = EngineCoreInput;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let Some((&tag, payload)) = frame.split_first() else {
            return Err(invalid_data("empty request frame"));
        };
        let request_type = EngineCoreRequestType::from_byte(tag)
            .ok_or_else(|| invalid_data(format!("unknown request type 0x{:02x}", tag)))?;

        let input = match request_type {
            EngineCoreRequestType::Add => {
                EngineCoreInput::Add(serde_json::from_slice(payload).map_err(invalid_data)?)
            }
            EngineCoreRequestType::Abort => {
                EngineCoreInput::Abort(serde_json::from_slice(payload).map_err(invalid_data)?)
            }
            EngineCoreRequestType::Utility => {
                EngineCoreInput::Utility(serde_json::from_slice(payload).map_err(invalid_data)?)
            }
        };
        Ok(Some(input))
    }
}

impl Encoder<EngineCoreInput> for RequestCodec {
    type Error = io::Error;

    fn encode(&mut self, item: EngineCoreInput, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut frame = BytesMut::new();
        frame.put_u8(item.request_type().as_byte());
        let payload = match &item {
            EngineCoreInput::Add(request) => serde_json::to_vec(request),
            EngineCoreInput::Abort(ids) => serde_json::to_vec(ids),
            EngineCoreInput::Utility(call) => serde_json::to_vec(call),
        }
        .map_err(invalid_data)?;
        frame.extend_from_slice(&payload);

        tracing::trace!(
            request_type = ?item.request_type(),
            frame_size_bytes = frame.len(),
            "Encoding request frame"
        );
        self.inner.encode(frame.freeze(), dst)
    }
}

/// Response channel codec.
#[derive(Default)]
pub struct OutputCodec {
    inner: LengthDelimitedCodec,
}

impl OutputCodec {
    pub fn new() -> Self {
        Self {
            inner: length_delimited(),
        }
    }
}

impl Decoder for OutputCodec {
    type Item = OutputFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        // Checked on raw bytes, before any attempt to decode.
        if frame.as_ref() == ENGINE_CORE_DEAD {
            return Ok(Some(OutputFrame::EngineDead));
        }
        match serde_json::from_slice::<OutputBatch>(&frame) {
            Ok(batch) => Ok(Some(OutputFrame::Batch(batch))),
            Err(e) => {
                let call_id = serde_json::from_slice::<serde_json::Value>(&frame)
                    .ok()
                    .and_then(|value| value.get("call_id").and_then(serde_json::Value::as_u64));
                tracing::warn!(
                    error = %e,
                    ?call_id,
                    frame_size_bytes = frame.len(),
                    "Malformed output frame"
                );
                Ok(Some(OutputFrame::Malformed {
                    call_id,
                    error: e.to_string(),
                }))
            }
        }
    }
}

impl Encoder<OutputFrame> for OutputCodec {
    type Error = io::Error;

    fn encode(&mut self, item: OutputFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = match item {
            OutputFrame::EngineDead => Bytes::from_static(ENGINE_CORE_DEAD),
            OutputFrame::Batch(batch) => {
                Bytes::from(serde_json::to_vec(&batch).map_err(invalid_data)?)
            }
            OutputFrame::Malformed { .. } => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "malformed frames cannot be encoded",
                ));
            }
        };
        if payload.len() > 100_000 {
            tracing::debug!(
                frame_size_bytes = payload.len(),
                frame_size_kb = payload.len() / 1024,
                "Large output frame being encoded"
            );
        }
        self.inner.encode(payload, dst)
    }
}

/// Blocking counterpart of `tokio_util::codec::Framed` for std streams.
pub struct BlockingFramed<S, C> {
    stream: S,
    codec: C,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S, C> BlockingFramed<S, C> {
    pub fn new(stream: S, codec: C) -> Self {
        Self {
            stream,
            codec,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: Read, C: Decoder> BlockingFramed<S, C> {
    /// Read the next frame. `None` on clean EOF, mirroring `Stream::next`.
    pub fn next_frame(&mut self) -> Option<Result<C::Item, C::Error>> {
        let mut chunk = [0u8; 8 * 1024];
        loop {
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(item)) => return Some(Ok(item)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if self.read_buf.is_empty() {
                        return None;
                    }
                    return Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed mid-frame",
                    )
                    .into()));
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

impl<S: Write, C> BlockingFramed<S, C> {
    /// Encode and write one frame. Blocks while the peer applies backpressure.
    pub fn send<I>(&mut self, item: I) -> Result<(), C::Error>
    where
        C: Encoder<I>,
    {
        self.write_buf.clear();
        self.codec.encode(item, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf)?;
        self.stream.flush()?;
        Ok(())
    }
}
