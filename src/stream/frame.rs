use std::sync::Arc;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::slice::{LazySlice, PrefixedSlice, Slice};

const TAG_DATA: u8 = 0;
const TAG_ACK: u8 = 1;
const TAG_CLOSE: u8 = 2;

/// The payload of a stream message.
///
/// ```ascii
/// DATA:  0, application payload
/// ACK:   1, number of selective acks (varint), selectively acked message_seq (varint)*
/// CLOSE: 2
/// ```
///
/// An ACK's cumulative acknowledgement is carried in the header's `reliable_seq`: every frame up
///  to and including it was accepted. The selective acks list accepted frames above that.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Data(Slice),
    Ack(Vec<u32>),
    Close,
}

impl Frame {
    /// bytes a DATA frame adds to its application payload
    pub const DATA_OVERHEAD: usize = 1;

    pub fn to_payload(&self) -> Arc<dyn LazySlice> {
        match self {
            Frame::Data(body) => Arc::new(PrefixedSlice::new(Bytes::from_static(&[TAG_DATA]), body.clone())),
            Frame::Ack(selective) => {
                let mut buf = BytesMut::new();
                buf.put_u8(TAG_ACK);
                buf.put_usize_varint(selective.len());
                for seq in selective {
                    buf.put_u32_varint(*seq);
                }
                Arc::new(Slice::from(buf))
            }
            Frame::Close => Arc::new(Slice::from_static(&[TAG_CLOSE])),
        }
    }

    /// The body of a data frame is a view into `payload`, it is not copied
    pub fn try_deser(payload: &Slice) -> anyhow::Result<Frame> {
        let Some(&tag) = payload.first() else {
            bail!("empty stream frame");
        };

        match tag {
            TAG_DATA => Ok(Frame::Data(payload.slice(1..))),
            TAG_ACK => {
                let mut buf: &[u8] = &payload[1..];
                let num_selective = buf.try_get_usize_varint()?;
                if num_selective > buf.remaining() {
                    bail!("ACK with {} selective acks exceeds the frame", num_selective);
                }
                let mut selective = Vec::with_capacity(num_selective);
                for _ in 0..num_selective {
                    selective.push(buf.try_get_u32_varint()?);
                }
                Ok(Frame::Ack(selective))
            }
            TAG_CLOSE => Ok(Frame::Close),
            other => bail!("unknown stream frame tag {}", other),
        }
    }
}
