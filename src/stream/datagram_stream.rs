use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::callback::{Callback, StatusOrCallback};
use crate::config::StreamConfig;
use crate::messaging::ids::{NodeId, StreamId};
use crate::messaging::message::{Destination, Message, RoutableMessage};
use crate::messaging::seq_num::SeqNum;
use crate::router::{Router, StreamHandler};
use crate::slice::Slice;
use crate::status::{ContractViolation, Status, StatusOr, StatusResult};
use crate::stream::frame::Frame;
use crate::stream::receive_window::{Arrival, Incoming, ReceiveWindow};
use crate::stream::send_window::{RetransmitsExhausted, SendWindow};
use crate::stream::{ReliabilityAndOrdering, StreamState};
use crate::timer::{Timer, TimerHandle, Timestamp};

/// upper bound for the number of selective acks in a single ACK frame, the lowest are sent
const MAX_SELECTIVE_ACKS: usize = 64;

#[derive(Debug, Clone, Copy)]
enum StreamTimer {
    Retransmit,
    Reorder,
    Linger,
    RouteLoss,
}

struct PendingPull {
    op_id: u64,
    callback: StatusOrCallback<Option<Slice>>,
}

struct StreamInner {
    state: StreamState,
    /// `register` is waiting for the router
    is_registering: bool,
    next_message_seq: u32,

    send_window: SendWindow,
    receive_window: ReceiveWindow,
    pending_pull: Option<PendingPull>,

    /// the application closed the stream
    local_close: bool,
    /// the peer's CLOSE frame arrived
    peer_close: bool,

    retransmit_timer: Option<(Timestamp, TimerHandle)>,
    reorder_timer: Option<TimerHandle>,
    linger_timer: Option<TimerHandle>,
    route_loss_timer: Option<TimerHandle>,
}

impl StreamInner {
    /// `None` once the sequence number space is used up
    fn next_message_seq(&mut self) -> Option<u32> {
        let result = self.next_message_seq;
        self.next_message_seq = self.next_message_seq.checked_add(1)?;
        Some(result)
    }

    fn cancel_timers(&mut self) {
        if let Some((_, handle)) = self.retransmit_timer.take() {
            handle.cancel();
        }
        for handle in [self.reorder_timer.take(), self.linger_timer.take(), self.route_loss_timer.take()].into_iter().flatten() {
            handle.cancel();
        }
    }

    /// Data that arrived before the peer's close can still be pulled after it, but nothing can
    ///  be pulled once the application closed the stream
    fn is_readable(&self) -> bool {
        match self.state {
            StreamState::Open => true,
            StreamState::Closing => self.peer_close && !self.local_close,
            StreamState::Unregistered | StreamState::Closed => false,
        }
    }
}

/// What a state change requires of the outside world. It is collected while the stream's lock
///  is held and applied after it is released, so the stream never calls into the router (which
///  may call back into this or other streams) or into application callbacks while locked.
#[derive(Default)]
struct Effects {
    frames: Vec<(SeqNum, Frame)>,
    /// unreliable sends, which complete when their frame was handed to the router
    handed_off: Vec<Callback<StatusResult>>,
    send_results: Vec<(Callback<StatusResult>, StatusResult)>,
    pull_results: Vec<(StatusOrCallback<Option<Slice>>, StatusOr<Option<Slice>>)>,
    unregister: bool,
}

/// A logical channel between the local node and a single peer, identified by a [StreamId] that
///  is unique per peer on each router. The stream's [ReliabilityAndOrdering] is fixed at
///  construction.
///
/// A stream must be [registered](DatagramStream::register) exactly once before data can be sent
///  or received; applications interact with it through [SendOp](crate::stream::ops::SendOp) and
///  [ReceiveOp](crate::stream::ops::ReceiveOp).
///
/// Dropping a stream resolves all of its outstanding callbacks with [Status::StreamClosed].
pub struct DatagramStream {
    myself: Weak<DatagramStream>,
    router: Weak<Router>,
    local: NodeId,
    peer: NodeId,
    stream_id: StreamId,
    mode: ReliabilityAndOrdering,
    config: Arc<StreamConfig>,
    timer: Arc<dyn Timer>,
    next_op_id: AtomicU64,
    inner: Mutex<StreamInner>,
}

impl DatagramStream {
    pub fn new(router: &Arc<Router>, peer: NodeId, mode: ReliabilityAndOrdering, stream_id: StreamId) -> Arc<DatagramStream> {
        Self::create(router, peer, mode, stream_id, Arc::new(StreamConfig::default()))
    }

    pub fn with_config(router: &Arc<Router>, peer: NodeId, mode: ReliabilityAndOrdering, stream_id: StreamId, config: Arc<StreamConfig>) -> anyhow::Result<Arc<DatagramStream>> {
        config.validate()?;
        Ok(Self::create(router, peer, mode, stream_id, config))
    }

    fn create(router: &Arc<Router>, peer: NodeId, mode: ReliabilityAndOrdering, stream_id: StreamId, config: Arc<StreamConfig>) -> Arc<DatagramStream> {
        Arc::new_cyclic(|myself| DatagramStream {
            myself: myself.clone(),
            router: Arc::downgrade(router),
            local: router.node_id(),
            peer,
            stream_id,
            mode,
            timer: router.timer().clone(),
            next_op_id: AtomicU64::new(0),
            inner: Mutex::new(StreamInner {
                state: StreamState::Unregistered,
                is_registering: false,
                next_message_seq: 1,
                send_window: SendWindow::new(&config),
                receive_window: ReceiveWindow::new(mode, config.receive_window_size),
                pending_pull: None,
                local_close: false,
                peer_close: false,
                retransmit_timer: None,
                reorder_timer: None,
                linger_timer: None,
                route_loss_timer: None,
            }),
            config,
        })
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn mode(&self) -> ReliabilityAndOrdering {
        self.mode
    }

    pub async fn state(&self) -> StreamState {
        self.inner.lock().await.state
    }

    /// Makes the stream known to the router, so that it starts receiving messages from its peer.
    ///  This must be called exactly once.
    pub async fn register(&self) -> StatusResult {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                StreamState::Unregistered if !inner.is_registering => {}
                StreamState::Closed => return Err(Status::StreamClosed),
                StreamState::Unregistered | StreamState::Open | StreamState::Closing => return Err(ContractViolation::AlreadyRegistered.into()),
            }
            inner.is_registering = true;
        }

        let handler: Weak<dyn StreamHandler> = self.myself.clone();
        let result = match self.router.upgrade() {
            Some(router) => router.register_stream(self.peer, self.stream_id, handler).await,
            None => Err(ContractViolation::RouterGone.into()),
        };

        let mut inner = self.inner.lock().await;
        inner.is_registering = false;
        result?;

        if inner.state == StreamState::Closed {
            // closed while the router was registering it
            drop(inner);
            self.apply(Effects { unregister: true, ..Default::default() }).await;
            return Err(Status::StreamClosed);
        }

        inner.state = StreamState::Open;
        debug!("{:?}: registered {:?} stream {:?} with {:?}", self.local, self.mode, self.stream_id, self.peer);
        Ok(())
    }

    pub(crate) fn next_op_id(&self) -> u64 {
        self.next_op_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) async fn push(&self, payload: Slice, done: Callback<StatusResult>) {
        let max_payload_len = self.max_payload_len().await;

        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock().await;
            match (inner.state, max_payload_len) {
                (StreamState::Unregistered, _) => effects.send_results.push((done, Err(ContractViolation::NotRegistered.into()))),
                (StreamState::Closing | StreamState::Closed, _) => effects.send_results.push((done, Err(Status::StreamClosed))),
                (StreamState::Open, Err(status)) => effects.send_results.push((done, Err(status))),
                (StreamState::Open, Ok(Some(max))) if payload.len() > max => {
                    debug!("{:?}: rejecting payload of {} bytes on {:?} to {:?}, the route allows {}", self.local, payload.len(), self.stream_id, self.peer, max);
                    effects.send_results.push((done, Err(ContractViolation::PayloadTooLarge.into())));
                }
                (StreamState::Open, Ok(_)) => self.send_data(&mut inner, payload, done, &mut effects),
            }
        }
        self.apply(effects).await;
    }

    fn send_data(&self, inner: &mut StreamInner, payload: Slice, done: Callback<StatusResult>, effects: &mut Effects) {
        let Some(seq) = inner.next_message_seq() else {
            let status = Status::Aborted("message sequence numbers exhausted".to_string());
            warn!("{:?}: closing stream {:?} with {:?}: {}", self.local, self.stream_id, self.peer, status);
            effects.send_results.push((done, Err(status.clone())));
            self.abort(inner, status, effects);
            return;
        };

        let frame = Frame::Data(payload);
        trace!("{:?}: sending #{} on {:?} to {:?}", self.local, seq, self.stream_id, self.peer);

        if self.mode.is_reliable() {
            let now = self.timer.now();
            inner.send_window.insert(seq, frame.clone(), done, now);
            self.arm_retransmit_timer(inner);
        }
        else {
            effects.handed_off.push(done);
        }
        effects.frames.push((self.seq_num(seq), frame));
    }

    /// The largest application payload that fits into a single message on the current route to
    ///  the peer, or `None` if there is no route to measure it by. This assumes sequence numbers
    ///  of maximal encoded length.
    async fn max_payload_len(&self) -> StatusOr<Option<usize>> {
        let router = self.router.upgrade()
            .ok_or(ContractViolation::RouterGone)?;
        let Some(mtu) = router.mtu_to(self.peer).await else {
            return Ok(None);
        };

        let header = RoutableMessage::single(self.local, Destination::new(self.peer, self.stream_id, SeqNum::new(u32::MAX, u32::MAX)));
        let overhead = Message::encoded_header_len(&header) + Frame::DATA_OVERHEAD;
        Ok(Some(mtu.saturating_sub(overhead)))
    }

    pub(crate) async fn pull(&self, op_id: u64, callback: StatusOrCallback<Option<Slice>>) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock().await;
            if inner.state == StreamState::Unregistered {
                effects.pull_results.push((callback, Err(ContractViolation::NotRegistered.into())));
            }
            else if inner.pending_pull.is_some() {
                effects.pull_results.push((callback, Err(ContractViolation::PullAlreadyPending.into())));
            }
            else if !inner.is_readable() {
                effects.pull_results.push((callback, Err(Status::StreamClosed)));
            }
            else {
                inner.pending_pull = Some(PendingPull { op_id, callback });
                self.deliver_ready(&mut inner, &mut effects);
            }
        }
        self.apply(effects).await;
    }

    /// Resolves the pending pull with `status` if it belongs to the operation `op_id`
    pub(crate) async fn cancel_pull(&self, op_id: u64, status: Status) {
        let pending = {
            let mut inner = self.inner.lock().await;
            if inner.pending_pull.as_ref().is_some_and(|p| p.op_id == op_id) {
                inner.pending_pull.take()
            }
            else {
                None
            }
        };
        if let Some(pending) = pending {
            pending.callback.call(Err(status));
        }
    }

    /// Closes the stream. This is idempotent: closing a stream that is closed already has no
    ///  effect.
    ///
    /// `Ok(())` is a graceful close: in reliable modes, data that was sent but not acknowledged
    ///  yet is given [StreamConfig::close_linger] to be acknowledged before its callbacks fail.
    ///  An error status closes the stream right away, failing all outstanding operations with
    ///  that status.
    pub async fn close(&self, status: StatusResult) {
        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock().await;
            self.close_locked(&mut inner, status, &mut effects);
        }
        self.apply(effects).await;
    }

    fn close_locked(&self, inner: &mut StreamInner, status: StatusResult, effects: &mut Effects) {
        match (inner.state, status) {
            (StreamState::Closed, _) => {}
            (StreamState::Unregistered, _) => {
                inner.state = StreamState::Closed;
            }
            (_, Err(status)) => self.abort(inner, status, effects),
            (StreamState::Open, Ok(())) => {
                let Some(seq) = inner.next_message_seq() else {
                    self.abort(inner, Status::Aborted("message sequence numbers exhausted".to_string()), effects);
                    return;
                };
                debug!("{:?}: closing stream {:?} with {:?}", self.local, self.stream_id, self.peer);
                inner.local_close = true;

                effects.frames.push((self.seq_num(seq), Frame::Close));

                if let Some(pending) = inner.pending_pull.take() {
                    effects.pull_results.push((pending.callback, Err(Status::StreamClosed)));
                }

                if self.mode.is_reliable() {
                    let now = self.timer.now();
                    inner.send_window.insert(seq, Frame::Close, Callback::ignored(), now);
                    self.arm_retransmit_timer(inner);
                    inner.state = StreamState::Closing;
                    inner.linger_timer = Some(self.schedule(now + self.config.close_linger, StreamTimer::Linger));
                }
                else {
                    self.finish(inner, effects);
                }
            }
            (StreamState::Closing, Ok(())) => {
                if !inner.local_close {
                    // the peer closed first, and this acknowledges it
                    inner.local_close = true;
                    self.finish(inner, effects);
                }
            }
        }
    }

    fn abort(&self, inner: &mut StreamInner, status: Status, effects: &mut Effects) {
        debug!("{:?}: aborting stream {:?} with {:?}: {}", self.local, self.stream_id, self.peer, status);
        if inner.state == StreamState::Open {
            // best effort, there is no retransmission after this
            if let Some(seq) = inner.next_message_seq() {
                effects.frames.push((self.seq_num(seq), Frame::Close));
            }
        }
        inner.local_close = true;

        for done in inner.send_window.drain() {
            effects.send_results.push((done, Err(status.clone())));
        }
        if let Some(pending) = inner.pending_pull.take() {
            effects.pull_results.push((pending.callback, Err(status)));
        }
        self.finish(inner, effects);
    }

    /// moves to `Closed`, failing everything that is still outstanding
    fn finish(&self, inner: &mut StreamInner, effects: &mut Effects) {
        debug!("{:?}: stream {:?} with {:?} is closed", self.local, self.stream_id, self.peer);
        inner.state = StreamState::Closed;
        inner.cancel_timers();

        for done in inner.send_window.drain() {
            effects.send_results.push((done, Err(Status::StreamClosed)));
        }
        if let Some(pending) = inner.pending_pull.take() {
            effects.pull_results.push((pending.callback, Err(Status::StreamClosed)));
        }
        effects.unregister = true;
    }

    fn seq_num(&self, message_seq: u32) -> SeqNum {
        if self.mode.is_reliable() {
            SeqNum::new(message_seq, message_seq)
        }
        else {
            SeqNum::unreliable(message_seq)
        }
    }

    async fn on_frame(&self, seq: SeqNum, payload: Slice) {
        let frame = match Frame::try_deser(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{:?}: dropping invalid frame on {:?} from {:?}: {}", self.local, self.stream_id, self.peer, e);
                return;
            }
        };

        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock().await;
            match frame {
                Frame::Ack(selective) => self.on_ack(&mut inner, seq.reliable_seq, &selective, &mut effects),
                Frame::Data(body) => self.on_incoming(&mut inner, seq.message_seq, Incoming::Data(body), &mut effects),
                Frame::Close => self.on_incoming(&mut inner, seq.message_seq, Incoming::Close, &mut effects),
            }
        }
        self.apply(effects).await;
    }

    fn on_ack(&self, inner: &mut StreamInner, cumulative: u32, selective: &[u32], effects: &mut Effects) {
        if !self.mode.is_reliable() {
            warn!("{:?}: ignoring ACK on unreliable stream {:?} from {:?}", self.local, self.stream_id, self.peer);
            return;
        }

        for done in inner.send_window.on_ack(cumulative, selective) {
            effects.send_results.push((done, Ok(())));
        }

        if inner.state == StreamState::Closing && inner.local_close && inner.send_window.is_empty() {
            self.finish(inner, effects);
        }
        else {
            self.arm_retransmit_timer(inner);
        }
    }

    fn on_incoming(&self, inner: &mut StreamInner, seq: u32, incoming: Incoming, effects: &mut Effects) {
        if matches!(inner.state, StreamState::Unregistered | StreamState::Closed) {
            trace!("{:?}: stream {:?} is not open, dropping frame #{}", self.local, self.stream_id, seq);
            return;
        }

        let arrival = inner.receive_window.on_arrival(seq, incoming, self.timer.now());
        if self.mode.is_reliable() && arrival != Arrival::Rejected {
            let mut selective = inner.receive_window.selective_acks();
            selective.truncate(MAX_SELECTIVE_ACKS);
            effects.frames.push((SeqNum::new(inner.receive_window.cumulative_ack(), 0), Frame::Ack(selective)));
        }
        if arrival != Arrival::Accepted {
            return;
        }

        if inner.receive_window.is_close_received() && !inner.peer_close {
            debug!("{:?}: peer {:?} closed stream {:?}", self.local, self.peer, self.stream_id);
            inner.peer_close = true;
            for done in inner.send_window.drain() {
                effects.send_results.push((done, Err(Status::StreamClosed)));
            }
            match inner.state {
                StreamState::Open => inner.state = StreamState::Closing,
                // both sides closed, there is nothing left to wait for
                StreamState::Closing => self.finish(inner, effects),
                StreamState::Unregistered | StreamState::Closed => {}
            }
        }

        self.deliver_ready(inner, effects);
        self.arm_reorder_timer(inner);
    }

    /// satisfies the pending pull if there is something to deliver
    fn deliver_ready(&self, inner: &mut StreamInner, effects: &mut Effects) {
        if inner.pending_pull.is_none() || !inner.is_readable() {
            return;
        }

        if let Some(payload) = inner.receive_window.pop_ready() {
            if let Some(pending) = inner.pending_pull.take() {
                effects.pull_results.push((pending.callback, Ok(Some(payload))));
            }
        }
        else if inner.receive_window.is_finished() {
            if let Some(pending) = inner.pending_pull.take() {
                effects.pull_results.push((pending.callback, Ok(None)));
            }
            self.finish(inner, effects);
        }
    }

    fn arm_retransmit_timer(&self, inner: &mut StreamInner) {
        let deadline = inner.send_window.next_deadline();
        if let (Some((armed_at, handle)), Some(deadline)) = (&inner.retransmit_timer, deadline) {
            if *armed_at <= deadline && handle.is_pending() {
                // firing early is harmless, it re-arms for the actual deadline
                return;
            }
        }

        if let Some((_, handle)) = inner.retransmit_timer.take() {
            handle.cancel();
        }
        if let Some(deadline) = deadline {
            inner.retransmit_timer = Some((deadline, self.schedule(deadline, StreamTimer::Retransmit)));
        }
    }

    fn arm_reorder_timer(&self, inner: &mut StreamInner) {
        if self.mode != ReliabilityAndOrdering::UnreliableOrdered {
            return;
        }

        match inner.receive_window.reorder_deadline(self.config.reorder_timeout) {
            Some(deadline) => {
                if !inner.reorder_timer.as_ref().is_some_and(TimerHandle::is_pending) {
                    inner.reorder_timer = Some(self.schedule(deadline, StreamTimer::Reorder));
                }
            }
            None => {
                if let Some(handle) = inner.reorder_timer.take() {
                    handle.cancel();
                }
            }
        }
    }

    fn schedule(&self, at: Timestamp, kind: StreamTimer) -> TimerHandle {
        let stream = self.myself.clone();
        self.timer.schedule_at(at, Callback::new(move |_| {
            if let Some(stream) = stream.upgrade() {
                tokio::spawn(async move {
                    stream.on_timer(kind).await;
                });
            }
        }))
    }

    async fn on_timer(&self, kind: StreamTimer) {
        trace!("{:?}: {:?} timer fired for stream {:?}", self.local, kind, self.stream_id);
        if let StreamTimer::RouteLoss = kind {
            self.on_route_loss_timer().await;
            return;
        }

        let mut effects = Effects::default();
        {
            let mut inner = self.inner.lock().await;
            if matches!(inner.state, StreamState::Unregistered | StreamState::Closed) {
                return;
            }

            match kind {
                StreamTimer::Retransmit => self.on_retransmit_timer(&mut inner, &mut effects),
                StreamTimer::Reorder => {
                    inner.reorder_timer = None;
                    inner.receive_window.on_reorder_timeout(self.timer.now(), self.config.reorder_timeout);
                    self.deliver_ready(&mut inner, &mut effects);
                    self.arm_reorder_timer(&mut inner);
                }
                StreamTimer::Linger => {
                    inner.linger_timer = None;
                    if inner.state == StreamState::Closing && inner.local_close {
                        debug!("{:?}: stream {:?} with {:?} closed with {} unacknowledged frame(s)", self.local, self.stream_id, self.peer, inner.send_window.len());
                        self.finish(&mut inner, &mut effects);
                    }
                }
                StreamTimer::RouteLoss => {}
            }
        }
        self.apply(effects).await;
    }

    fn on_retransmit_timer(&self, inner: &mut StreamInner, effects: &mut Effects) {
        inner.retransmit_timer = None;
        match inner.send_window.due_for_retransmit(self.timer.now()) {
            Ok(frames) => {
                for (seq, frame) in frames {
                    trace!("{:?}: retransmitting #{} on {:?} to {:?}", self.local, seq, self.stream_id, self.peer);
                    effects.frames.push((self.seq_num(seq), frame));
                }
                self.arm_retransmit_timer(inner);
            }
            Err(RetransmitsExhausted(seq)) => {
                warn!("{:?}: frame #{} on {:?} to {:?} was never acknowledged", self.local, seq, self.stream_id, self.peer);
                self.close_locked(inner, Err(Status::Unreachable(self.peer)), effects);
            }
        }
    }

    async fn on_route_loss_timer(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.route_loss_timer = None;
            if matches!(inner.state, StreamState::Unregistered | StreamState::Closed) {
                return;
            }
        }

        let has_route = match self.router.upgrade() {
            Some(router) => router.has_route_to(self.peer).await,
            None => false,
        };
        if has_route {
            debug!("{:?}: route to {:?} is back, keeping stream {:?}", self.local, self.peer, self.stream_id);
        }
        else {
            self.close(Err(Status::Unreachable(self.peer))).await;
        }
    }

    async fn apply(&self, effects: Effects) {
        let router = if !effects.frames.is_empty() || effects.unregister {
            self.router.upgrade()
        }
        else {
            None
        };

        if let Some(router) = &router {
            for (seq, frame) in effects.frames {
                let header = RoutableMessage::single(self.local, Destination::new(self.peer, self.stream_id, seq));
                router.forward(Message::new(header, frame.to_payload(), self.timer.now())).await;
            }
            if effects.unregister {
                router.unregister_stream(self.peer, self.stream_id).await;
            }
        }

        let handed_off_result = match router {
            Some(_) => Ok(()),
            None => Err(Status::from(ContractViolation::RouterGone)),
        };
        for done in effects.handed_off {
            done.call(handed_off_result.clone());
        }
        for (done, result) in effects.send_results {
            done.call(result);
        }
        for (callback, result) in effects.pull_results {
            callback.call(result);
        }
    }
}

#[async_trait]
impl StreamHandler for DatagramStream {
    async fn on_message(&self, seq: SeqNum, payload: Slice) {
        self.on_frame(seq, payload).await;
    }

    async fn on_route_lost(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, StreamState::Open | StreamState::Closing) && inner.route_loss_timer.is_none() {
            debug!("{:?}: lost route to {:?}, stream {:?} closes unless it comes back", self.local, self.peer, self.stream_id);
            let deadline = self.timer.now() + self.config.route_loss_grace_period;
            inner.route_loss_timer = Some(self.schedule(deadline, StreamTimer::RouteLoss));
        }
    }
}

impl Drop for DatagramStream {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.cancel_timers();
        for done in inner.send_window.drain() {
            done.call(Err(Status::StreamClosed));
        }
        if let Some(pending) = inner.pending_pull.take() {
            pending.callback.call(Err(Status::StreamClosed));
        }
    }
}
