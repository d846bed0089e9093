use crate::callback::{Callback, StatusOrCallback};
use crate::slice::Slice;
use crate::status::{Status, StatusOr, StatusResult};
use crate::stream::datagram_stream::DatagramStream;

/// One logical write to a [DatagramStream]. Any number of them may be outstanding on a stream
///  at the same time.
pub struct SendOp<'a> {
    stream: &'a DatagramStream,
}

impl<'a> SendOp<'a> {
    pub fn new(stream: &'a DatagramStream) -> SendOp<'a> {
        SendOp { stream }
    }

    /// Sends `payload` to the stream's peer. `done` is invoked once the router took the message
    ///  for unreliable streams, and once the peer acknowledged it for reliable streams. It fails
    ///  if the stream closes first.
    ///
    /// Pass [Callback::ignored] for fire-and-forget sends.
    pub async fn push(self, payload: Slice, done: Callback<StatusResult>) {
        self.stream.push(payload, done).await;
    }

    pub async fn push_and_wait(self, payload: Slice) -> StatusResult {
        let (done, recv) = Callback::channel();
        self.push(payload, done).await;
        recv.await.unwrap_or(Err(Status::Cancelled))
    }
}

/// One logical reader of a [DatagramStream]. A stream has at most one pending pull at a time,
///  across all of its `ReceiveOp`s.
pub struct ReceiveOp<'a> {
    stream: &'a DatagramStream,
    id: u64,
    is_closed: bool,
}

impl<'a> ReceiveOp<'a> {
    pub fn new(stream: &'a DatagramStream) -> ReceiveOp<'a> {
        ReceiveOp {
            stream,
            id: stream.next_op_id(),
            is_closed: false,
        }
    }

    /// Requests the next deliverable payload. The callback receives `Ok(Some(..))` with a
    ///  payload, or `Ok(None)` at the end of the stream; if nothing is deliverable yet, it
    ///  stays pending until something arrives.
    pub async fn pull(&mut self, callback: StatusOrCallback<Option<Slice>>) {
        if self.is_closed {
            callback.call(Err(Status::Cancelled));
            return;
        }
        self.stream.pull(self.id, callback).await;
    }

    pub async fn pull_next(&mut self) -> StatusOr<Option<Slice>> {
        let (callback, recv) = Callback::channel();
        self.pull(callback).await;
        recv.await.unwrap_or(Err(Status::Cancelled))
    }

    /// Cancels this operation's pending pull (if any), delivering `status` to it. Later pulls
    ///  fail with [Status::Cancelled].
    pub async fn close(&mut self, status: Status) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;
        self.stream.cancel_pull(self.id, status).await;
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::messaging::ids::{NodeId, StreamId};
    use crate::stream::ReliabilityAndOrdering;
    use crate::test_util::router::{connect, settle, test_router};

    async fn registered_pair() -> ([Arc<crate::router::Router>; 2], Arc<DatagramStream>, Arc<DatagramStream>) {
        let a = test_router(1);
        let b = test_router(2);
        connect(&a, &b).await;
        settle(&[&a, &b]).await;

        let stream_a = DatagramStream::new(&a, NodeId(2), ReliabilityAndOrdering::ReliableOrdered, StreamId(9));
        let stream_b = DatagramStream::new(&b, NodeId(1), ReliabilityAndOrdering::ReliableOrdered, StreamId(9));
        stream_a.register().await.unwrap();
        stream_b.register().await.unwrap();
        ([a, b], stream_a, stream_b)
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_pull() {
        let (_routers, a, b) = registered_pair().await;

        let mut receive = ReceiveOp::new(&b);
        let (callback, recv) = Callback::channel();
        receive.pull(callback).await;

        receive.close(Status::Cancelled).await;
        assert!(receive.is_closed());
        assert_eq!(recv.await.unwrap(), Err(Status::Cancelled));
        assert_eq!(receive.pull_next().await, Err(Status::Cancelled));

        // the stream itself is unaffected
        SendOp::new(&a).push(Slice::from_static(b"x"), Callback::ignored()).await;
        assert_eq!(ReceiveOp::new(&b).pull_next().await, Ok(Some(Slice::from_static(b"x"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_leaves_other_operations_pending_pull_alone() {
        let (_routers, a, b) = registered_pair().await;

        let mut pending = ReceiveOp::new(&b);
        let (callback, recv) = Callback::channel();
        pending.pull(callback).await;

        ReceiveOp::new(&b).close(Status::Cancelled).await;

        SendOp::new(&a).push(Slice::from_static(b"y"), Callback::ignored()).await;
        assert_eq!(recv.await.unwrap(), Ok(Some(Slice::from_static(b"y"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_resolves_after_acknowledgement() {
        let (_routers, a, _b) = registered_pair().await;

        let (done, mut recv) = Callback::channel();
        SendOp::new(&a).push(Slice::from_static(b"z"), done).await;
        assert_eq!(recv.try_recv(), Ok(Ok(())));
    }
}
