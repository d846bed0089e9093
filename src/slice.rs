use std::fmt::{Debug, Formatter};
use std::ops::{Deref, RangeBounds};

use bytes::{Bytes, BytesMut};

/// An immutable view of a byte range in a shared, reference counted buffer. Cloning and
///  sub-slicing never copy the underlying bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Slice(Bytes);

impl Debug for Slice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Slice({:?})", self.0.as_ref())
    }
}

impl Deref for Slice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl AsRef<[u8]> for Slice {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl From<Bytes> for Slice {
    fn from(value: Bytes) -> Self {
        Slice(value)
    }
}

impl From<BytesMut> for Slice {
    fn from(value: BytesMut) -> Self {
        Slice(value.freeze())
    }
}

impl From<Vec<u8>> for Slice {
    fn from(value: Vec<u8>) -> Self {
        Slice(Bytes::from(value))
    }
}

impl Slice {
    pub fn from_static(bytes: &'static [u8]) -> Slice {
        Slice(Bytes::from_static(bytes))
    }

    pub fn copy_from(bytes: &[u8]) -> Slice {
        Slice(Bytes::copy_from_slice(bytes))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// a view of a sub-range that shares this slice's backing buffer
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Slice {
        Slice(self.0.slice(range))
    }
}

/// Bytes a transmission reserves around a payload for headers and trailers
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Border {
    pub prefix: usize,
    pub suffix: usize,
}

impl Border {
    pub const NONE: Border = Border { prefix: 0, suffix: 0 };

    pub fn total(&self) -> usize {
        self.prefix + self.suffix
    }
}

/// The budget a physical transmission offers a payload factory: the payload must fit into
///  `max_length` once the `border` is accounted for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LazySliceArgs {
    pub border: Border,
    pub max_length: usize,
}

impl LazySliceArgs {
    pub const UNBOUNDED: LazySliceArgs = LazySliceArgs {
        border: Border::NONE,
        max_length: usize::MAX,
    };

    pub fn payload_budget(&self) -> usize {
        self.max_length.saturating_sub(self.border.total())
    }
}

/// Produces a message payload on demand. This is called once per physical transmission attempt,
///  and it may be called again for a retransmission with a different budget. Implementations
///  that can adapt to the budget (e.g. by including fewer entries) should do so; others return
///  their full content and leave it to the link to drop what does not fit.
pub trait LazySlice: Send + Sync + 'static {
    fn materialize(&self, args: LazySliceArgs) -> Slice;
}

impl LazySlice for Slice {
    fn materialize(&self, _args: LazySliceArgs) -> Slice {
        self.clone()
    }
}

/// A payload with a fixed prefix (e.g. a frame tag) in front of a shared slice. The combined
///  buffer is only assembled when a transmission asks for it.
#[derive(Clone, Debug)]
pub struct PrefixedSlice {
    prefix: Bytes,
    body: Slice,
}

impl PrefixedSlice {
    pub fn new(prefix: impl Into<Bytes>, body: Slice) -> PrefixedSlice {
        PrefixedSlice {
            prefix: prefix.into(),
            body,
        }
    }
}

impl LazySlice for PrefixedSlice {
    fn materialize(&self, _args: LazySliceArgs) -> Slice {
        let mut buf = BytesMut::with_capacity(self.prefix.len() + self.body.len());
        buf.extend_from_slice(&self.prefix);
        buf.extend_from_slice(&self.body);
        buf.into()
    }
}
