use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::messaging::ids::NodeId;
use crate::slice::{LazySlice, LazySliceArgs, Slice};

/// One entry of a route advertisement: 'I can reach `node` at `cost`, `hops` links away'
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AdvertisedRoute {
    pub node: NodeId,
    pub cost: u64,
    pub hops: u8,
}

impl AdvertisedRoute {
    fn ser(&self, buf: &mut impl BufMut) {
        self.node.ser(buf);
        buf.put_u64_varint(self.cost);
        buf.put_u8(self.hops);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<AdvertisedRoute> {
        let node = NodeId::try_deser(buf)?;
        let cost = buf.try_get_u64_varint()?;
        let hops = buf.try_get_u8()?;
        Ok(AdvertisedRoute {
            node,
            cost,
            hops,
        })
    }
}

/// The routing table a router advertises to one neighbour, sent on the reserved routing stream.
///
/// It is materialized lazily: when the link's budget does not fit all entries, the cheapest
///  routes are included and the rest is left out of this round.
#[derive(Clone, Debug)]
pub struct RouteAdvertisement {
    /// sorted by cost, cheapest first
    entries: Vec<AdvertisedRoute>,
}

impl RouteAdvertisement {
    pub fn new(mut entries: Vec<AdvertisedRoute>) -> RouteAdvertisement {
        entries.sort_by_key(|e| (e.cost, e.node));
        RouteAdvertisement {
            entries,
        }
    }

    pub fn entries(&self) -> &[AdvertisedRoute] {
        &self.entries
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RouteAdvertisement> {
        let num_entries = buf.try_get_usize_varint()?;
        if num_entries > buf.remaining() {
            bail!("route advertisement with {} entries exceeds the remaining buffer", num_entries);
        }

        let mut entries = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            entries.push(AdvertisedRoute::try_deser(buf)?);
        }
        Ok(RouteAdvertisement {
            entries,
        })
    }
}

fn varint_len(mut value: usize) -> usize {
    let mut result = 1;
    while value >= 0x80 {
        value >>= 7;
        result += 1;
    }
    result
}

impl LazySlice for RouteAdvertisement {
    fn materialize(&self, args: LazySliceArgs) -> Slice {
        let budget = args.payload_budget();

        let mut body = BytesMut::new();
        let mut num_entries = 0;
        for entry in &self.entries {
            let len_before = body.len();
            entry.ser(&mut body);
            if varint_len(num_entries + 1) + body.len() > budget {
                body.truncate(len_before);
                break;
            }
            num_entries += 1;
        }

        let mut buf = BytesMut::with_capacity(varint_len(num_entries) + body.len());
        buf.put_usize_varint(num_entries);
        buf.extend_from_slice(&body);
        buf.into()
    }
}
