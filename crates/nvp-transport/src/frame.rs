//! The scatter-gather frame and its stream codec.
//!
//! Wire layout, all integers big-endian:
//!
//! ```text
//! | u32 frame_len | u32 header_len | header bytes | data bytes |
//! ```
//!
//! `frame_len` counts everything after itself. The header iovec carries the
//! msgpack message; the data iovec carries bulk payload (write data on
//! requests, read data or name lists on responses) and may be empty.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nvp_mempool::{IoBuffer, MemPool};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

use crate::TransportError;

/// Headers are small msgpack tuples; anything bigger is corruption.
pub const MAX_HEADER_LEN: usize = 4096;
/// Upper bound on a full frame.
pub const MAX_FRAME_LEN: usize = 256 << 20;

const LEN_FIELD: usize = 4;

/// The data iovec: either a slice of the receive buffer or a buffer owned
/// by the memory pool (or its heap fallback).
pub enum DataBuf {
    Bytes(Bytes),
    Pooled(IoBuffer),
}

impl DataBuf {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            DataBuf::Bytes(b) => b,
            DataBuf::Pooled(b) => b.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the payload sits in a pool-backed buffer.
    pub fn from_pool(&self) -> bool {
        match self {
            DataBuf::Bytes(_) => false,
            DataBuf::Pooled(b) => b.from_pool(),
        }
    }
}

impl From<Bytes> for DataBuf {
    fn from(b: Bytes) -> Self {
        DataBuf::Bytes(b)
    }
}

impl From<IoBuffer> for DataBuf {
    fn from(b: IoBuffer) -> Self {
        DataBuf::Pooled(b)
    }
}

impl std::fmt::Debug for DataBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataBuf(len={})", self.len())
    }
}

/// One protocol message on the wire: header iovec + optional data iovec.
#[derive(Debug)]
pub struct Frame {
    pub header: Bytes,
    pub data: Option<DataBuf>,
}

impl Frame {
    pub fn new(header: Vec<u8>) -> Frame {
        Frame {
            header: header.into(),
            data: None,
        }
    }

    pub fn with_data(header: Vec<u8>, data: impl Into<DataBuf>) -> Frame {
        Frame {
            header: header.into(),
            data: Some(data.into()),
        }
    }

    pub fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, DataBuf::len)
    }
}

/// Frame codec for [`tokio_util::codec::Framed`] streams.
///
/// With a pool attached, inbound data iovecs land in pool-backed buffers
/// when a block is available (the server's assign-data-in-buf path);
/// otherwise they are zero-copy slices of the receive buffer.
#[derive(Default)]
pub struct FrameCodec {
    pool: Option<Arc<MemPool>>,
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec { pool: None }
    }

    pub fn with_pool(pool: Arc<MemPool>) -> FrameCodec {
        FrameCodec { pool: Some(pool) }
    }

    fn take_data(&self, frame: Bytes) -> DataBuf {
        if let Some(pool) = &self.pool {
            if let Some(mut buf) = pool.alloc(frame.len()) {
                buf.copy_from_slice(&frame);
                return DataBuf::Pooled(buf);
            }
        }
        DataBuf::Bytes(frame)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        if src.len() < LEN_FIELD {
            return Ok(None);
        }
        let mut peek = &src[..];
        let frame_len = peek.get_u32() as usize;
        if frame_len < LEN_FIELD || frame_len > MAX_FRAME_LEN {
            return Err(TransportError::MalformedFrame("frame length out of range"));
        }
        if src.len() < LEN_FIELD + frame_len {
            src.reserve(LEN_FIELD + frame_len - src.len());
            return Ok(None);
        }
        src.advance(LEN_FIELD);
        let mut frame = src.split_to(frame_len).freeze();
        let header_len = frame.get_u32() as usize;
        if header_len > MAX_HEADER_LEN || header_len > frame.len() {
            return Err(TransportError::MalformedFrame("header length out of range"));
        }
        let header = frame.split_to(header_len);
        let data = if frame.is_empty() {
            None
        } else {
            Some(self.take_data(frame))
        };
        Ok(Some(Frame { header, data }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        if item.header.len() > MAX_HEADER_LEN {
            return Err(TransportError::MalformedFrame("header too large"));
        }
        let data_len = item.data_len();
        let frame_len = LEN_FIELD + item.header.len() + data_len;
        if frame_len > MAX_FRAME_LEN {
            return Err(TransportError::MalformedFrame("frame too large"));
        }
        dst.reserve(LEN_FIELD + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_u32(item.header.len() as u32);
        dst.extend_from_slice(&item.header);
        if let Some(data) = &item.data {
            dst.extend_from_slice(data.as_slice());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_header_only() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(vec![0x99, 0x00, 0x01]), &mut buf)
            .unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.header[..], &[0x99, 0x00, 0x01]);
        assert!(frame.data.is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrip_with_data() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let data = vec![0xab; 4096];
        codec
            .encode(
                Frame::with_data(vec![1, 2, 3], Bytes::from(data.clone())),
                &mut buf,
            )
            .unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.header[..], &[1, 2, 3]);
        assert_eq!(frame.data.unwrap().as_slice(), &data[..]);
    }

    #[test]
    fn partial_input_yields_none() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(vec![7; 100]), &mut buf)
            .unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        // frame_len = 4 + 8, header_len claims more than the frame holds
        buf.put_u32(12);
        buf.put_u32(64);
        buf.extend_from_slice(&[0u8; 8]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(vec![1]), &mut buf).unwrap();
        codec.encode(Frame::new(vec![2]), &mut buf).unwrap();
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap().header[..], &[1]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap().header[..], &[2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
