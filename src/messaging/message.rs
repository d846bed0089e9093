use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::messaging::ids::{NodeId, StreamId};
use crate::messaging::seq_num::SeqNum;
use crate::slice::{Border, LazySlice, LazySliceArgs, Slice};
use crate::status::{ContractViolation, StatusOr};
use crate::timer::Timestamp;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Destination {
    pub node: NodeId,
    pub stream_id: StreamId,
    pub seq: SeqNum,
}

impl Destination {
    pub fn new(node: NodeId, stream_id: StreamId, seq: SeqNum) -> Destination {
        Destination {
            node,
            stream_id,
            seq,
        }
    }

    fn ser(&self, buf: &mut impl BufMut) {
        self.node.ser(buf);
        self.stream_id.ser(buf);
        self.seq.ser(buf);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Destination> {
        let node = NodeId::try_deser(buf)?;
        let stream_id = StreamId::try_deser(buf)?;
        let seq = SeqNum::try_deser(buf)?;
        Ok(Destination {
            node,
            stream_id,
            seq,
        })
    }
}

/// The routing header of a message. A single message can fan out to several destinations which
///  then share the same payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoutableMessage {
    pub src: NodeId,
    destinations: Vec<Destination>,
}

impl RoutableMessage {
    pub fn new(src: NodeId, destinations: Vec<Destination>) -> StatusOr<RoutableMessage> {
        if destinations.is_empty() {
            return Err(ContractViolation::EmptyDestinations.into());
        }
        Ok(RoutableMessage {
            src,
            destinations,
        })
    }

    pub fn single(src: NodeId, destination: Destination) -> RoutableMessage {
        RoutableMessage {
            src,
            destinations: vec![destination],
        }
    }

    /// never empty
    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.src.ser(buf);
        buf.put_usize_varint(self.destinations.len());
        for destination in &self.destinations {
            destination.ser(buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RoutableMessage> {
        let src = NodeId::try_deser(buf)?;

        let num_destinations = buf.try_get_usize_varint()?;
        if num_destinations == 0 {
            bail!("routable message without destinations");
        }
        // each destination takes at least 11 bytes, so this bounds the allocation
        if num_destinations > buf.remaining() {
            bail!("destination count {} exceeds the remaining buffer", num_destinations);
        }

        let mut destinations = Vec::with_capacity(num_destinations);
        for _ in 0..num_destinations {
            destinations.push(Destination::try_deser(buf)?);
        }
        Ok(RoutableMessage {
            src,
            destinations,
        })
    }
}

/// A message as it is handed to a [Link](crate::link::Link). The payload is produced lazily for
///  each physical transmission, with that transmission's length budget.
#[derive(Clone)]
pub struct Message {
    pub header: RoutableMessage,
    pub payload: Arc<dyn LazySlice>,
    pub sent: Timestamp,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("sent", &self.sent)
            .finish()
    }
}

impl Message {
    pub fn new(header: RoutableMessage, payload: Arc<dyn LazySlice>, sent: Timestamp) -> Message {
        Message {
            header,
            payload,
            sent,
        }
    }

    /// Creates a copy of this message addressed to a subset of its destinations, sharing the
    ///  payload factory.
    pub fn with_destinations(&self, destinations: Vec<Destination>) -> StatusOr<Message> {
        Ok(Message {
            header: RoutableMessage::new(self.header.src, destinations)?,
            payload: self.payload.clone(),
            sent: self.sent,
        })
    }

    /// The number of bytes `encode` writes before the payload, for a message with `header`
    pub fn encoded_header_len(header: &RoutableMessage) -> usize {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        std::mem::size_of::<u64>() + buf.len()
    }

    /// Serializes the message for a transport with a maximum transmission size of `mtu` bytes.
    ///  The payload factory is invoked exactly once, with the header accounted for as its border.
    pub fn encode(&self, mtu: usize) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u64(self.sent.as_micros());
        self.header.ser(&mut buf);

        let args = LazySliceArgs {
            border: Border {
                prefix: buf.len(),
                suffix: 0,
            },
            max_length: mtu,
        };
        let payload = self.payload.materialize(args);
        if buf.len() + payload.len() > mtu {
            bail!("encoded message has {} bytes, exceeding the MTU of {}", buf.len() + payload.len(), mtu);
        }

        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// The payload of the decoded message is a view into `buf`, it is not copied.
    pub fn decode(mut buf: Bytes) -> anyhow::Result<Message> {
        let sent = Timestamp::from_micros(buf.try_get_u64()?);
        let header = RoutableMessage::try_deser(&mut buf)?;
        Ok(Message {
            header,
            payload: Arc::new(Slice::from(buf)),
            sent,
        })
    }
}
