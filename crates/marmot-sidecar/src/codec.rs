//! Length-delimited JSON framing
//!
//! Each frame is a 4-byte big-endian length followed by the JSON encoding of a
//! [`Frame`]. Frames above [`MAX_FRAME_LENGTH`] are refused on both sides.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::protocol::Frame;

/// Largest accepted frame: 16 MiB
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

fn new_length_delimited_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Wraps [`LengthDelimitedCodec`] with JSON serialization of [`Frame`]s
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for FrameCodec {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// New codec
    pub fn new() -> Self {
        Self {
            inner: new_length_delimited_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let frame = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(bytes), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Op, PROTOCOL_VERSION};

    #[test]
    fn test_partial_frames_wait_for_more_bytes() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Hello {
                    protocol_version: PROTOCOL_VERSION,
                },
                &mut buf,
            )
            .unwrap();
        codec
            .encode(
                Frame::Request {
                    id: 1,
                    op: Op::ListGroups,
                },
                &mut buf,
            )
            .unwrap();

        let mut partial = buf.split_to(3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);

        assert!(matches!(
            codec.decode(&mut partial).unwrap(),
            Some(Frame::Hello { .. })
        ));
        assert!(matches!(
            codec.decode(&mut partial).unwrap(),
            Some(Frame::Request { id: 1, .. })
        ));
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_invalid_data() {
        let mut raw = LengthDelimitedCodec::new();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::from_static(b"not json"), &mut buf).unwrap();

        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
