use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// Ordering and deduplication token of a message within a stream.
///
/// `message_seq` numbers every message a stream sends (data and close frames), starting at 1.
///  `reliable_seq` is the unit a reliable stream retains until it is acknowledged; it is 0 for
///  unreliable streams. On acknowledgements it carries the cumulative acknowledgement instead.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct SeqNum {
    pub reliable_seq: u32,
    pub message_seq: u32,
}

impl Debug for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}/{}", self.message_seq, self.reliable_seq)
    }
}

impl SeqNum {
    pub fn new(reliable_seq: u32, message_seq: u32) -> SeqNum {
        SeqNum {
            reliable_seq,
            message_seq,
        }
    }

    pub fn unreliable(message_seq: u32) -> SeqNum {
        SeqNum::new(0, message_seq)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_varint(self.reliable_seq);
        buf.put_u32_varint(self.message_seq);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SeqNum> {
        let reliable_seq = buf.try_get_u32_varint()?;
        let message_seq = buf.try_get_u32_varint()?;
        Ok(SeqNum {
            reliable_seq,
            message_seq,
        })
    }
}
