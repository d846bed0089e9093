use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// Identity of a mesh participant. It is stable for the lifetime of the process and has no
///  structure beyond equality and hashing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeId> {
        Ok(NodeId(buf.try_get_u64()?))
    }
}

/// Identity of a logical stream, scoped to a pair of nodes
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    /// reserved for route advertisements between neighbouring routers
    pub const ROUTING: StreamId = StreamId(0);

    pub fn is_reserved(&self) -> bool {
        *self == Self::ROUTING
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_varint(self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<StreamId> {
        Ok(StreamId(buf.try_get_u64_varint()?))
    }
}
