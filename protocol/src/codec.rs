// Copyright 2025 Oxide Computer Company
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Message, MAX_FRM_LEN};

/*
 * A frame is [len | serialized message].
 */

pub struct TalusEncoder {}

impl TalusEncoder {
    pub fn new() -> Self {
        TalusEncoder {}
    }

    fn serialized_size<T: serde::Serialize>(
        m: T,
    ) -> Result<usize, anyhow::Error> {
        let serialized_len: usize = bincode::serialized_size(&m)? as usize;
        let len = serialized_len + 4;

        Ok(len)
    }
}

impl Default for TalusEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Message> for TalusEncoder {
    type Error = anyhow::Error;

    fn encode(
        &mut self,
        m: Message,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let len = TalusEncoder::serialized_size(&m)?;
        if len > MAX_FRM_LEN {
            // Bail out before creating a frame that the decoder will refuse
            // to deserialize
            bail!("frame is {} bytes, more than maximum {}", len, MAX_FRM_LEN);
        }

        let before = dst.len();
        dst.reserve(len);
        dst.put_u32_le(len as u32);
        bincode::serialize_into(dst.writer(), &m)?;
        debug_assert_eq!(dst.len() - before, len);

        Ok(())
    }
}

impl Encoder<&Message> for TalusEncoder {
    type Error = anyhow::Error;

    fn encode(
        &mut self,
        m: &Message,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let len = TalusEncoder::serialized_size(m)?;
        if len > MAX_FRM_LEN {
            bail!("frame is {} bytes, more than maximum {}", len, MAX_FRM_LEN);
        }

        let before = dst.len();
        dst.reserve(len);
        dst.put_u32_le(len as u32);
        bincode::serialize_into(dst.writer(), m)?;
        debug_assert_eq!(dst.len() - before, len);

        Ok(())
    }
}

pub struct TalusDecoder {}

impl TalusDecoder {
    pub fn new() -> Self {
        TalusDecoder {}
    }
}

impl Default for TalusDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TalusDecoder {
    type Item = Message;
    type Error = anyhow::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            /*
             * Wait for the u32 length prefix.
             */
            return Ok(None);
        }

        /*
         * Get the length prefix from the frame.
         */
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[0..4]);
        let len = u32::from_le_bytes(length_bytes) as usize;

        if len > MAX_FRM_LEN {
            bail!("frame is {} bytes, more than maximum {}", len, MAX_FRM_LEN);
        }

        if src.len() < len {
            /*
             * Wait for an entire frame.  Expand the buffer to fit.
             */
            src.reserve(len - src.len());
            return Ok(None);
        }

        // Slice off our frame, leaving `src` pointing at the beginning of
        // the next one (which may not exist yet), then skip the length
        // prefix and deserialize.
        let mut buf = src.split_to(len);
        buf.advance(4);
        let message = bincode::deserialize(&buf)?;

        Ok(Some(message))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Opcode, RequestHeader, Transno, Xid};
    use bytes::Bytes;
    use uuid::Uuid;

    fn sample_request() -> Message {
        Message::Request {
            header: RequestHeader {
                opcode: Opcode::Getattr,
                xid: Xid(77),
                transno: Transno::NONE,
                flags: 0,
                client_id: Uuid::new_v4(),
                handle: Uuid::new_v4(),
            },
            body: Bytes::from_static(b"opaque"),
        }
    }

    #[test]
    fn round_trip_one_frame() {
        let m = sample_request();
        let mut buf = BytesMut::new();
        TalusEncoder::new().encode(&m, &mut buf).unwrap();

        let out = TalusDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(m, out);
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trip_back_to_back_frames() {
        let mut buf = BytesMut::new();
        let mut enc = TalusEncoder::new();
        let a = sample_request();
        let b = Message::Ping {
            xid: Xid(78),
            flags: crate::MSG_LAST_REPLAY,
        };
        enc.encode(&a, &mut buf).unwrap();
        enc.encode(&b, &mut buf).unwrap();

        let mut dec = TalusDecoder::new();
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(dec.decode(&mut buf).unwrap().unwrap(), b);
        assert!(dec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let m = sample_request();
        let mut full = BytesMut::new();
        TalusEncoder::new().encode(&m, &mut full).unwrap();

        let mut dec = TalusDecoder::new();
        let mut partial = BytesMut::from(&full[0..5]);
        assert!(dec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[5..]);
        assert_eq!(dec.decode(&mut partial).unwrap().unwrap(), m);
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_FRM_LEN + 1) as u32);
        buf.put_slice(&[0; 16]);
        assert!(TalusDecoder::new().decode(&mut buf).is_err());
    }
}
