use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::slice::Slice;
use crate::stream::ReliabilityAndOrdering;
use crate::timer::Timestamp;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Incoming {
    Data(Slice),
    Close,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Arrival {
    Accepted,
    Duplicate,
    /// outside the receive window, or after the peer's close
    Rejected,
}

/// The receive side of a stream: deduplication, reordering and end-of-stream detection. Frames
///  are identified by their `message_seq`, the first frame having sequence number 1.
///
/// Accepted payloads become available through [ReceiveWindow::pop_ready] in the order the
///  stream's mode requires.
#[derive(Debug)]
pub struct ReceiveWindow {
    mode: ReliabilityAndOrdering,
    window_size: u32,

    /// Every frame up to here was processed. Above it, `buffered` holds accepted frames: ordered
    ///  modes keep their content until they can be delivered, reliable unordered streams only
    ///  remember the sequence number (`None`) since the payload was delivered right away.
    floor: u32,
    buffered: BTreeMap<u32, Option<Incoming>>,

    /// for unreliable unordered streams, which have no floor
    recent: VecDeque<u32>,
    recent_set: FxHashSet<u32>,

    /// for unreliable ordered streams: since when the frame after `floor` is missing
    gap_since: Option<Timestamp>,

    ready: VecDeque<Slice>,
    close_received: bool,
    eof: bool,
}

impl ReceiveWindow {
    pub fn new(mode: ReliabilityAndOrdering, window_size: u32) -> ReceiveWindow {
        ReceiveWindow {
            mode,
            window_size,
            floor: 0,
            buffered: BTreeMap::new(),
            recent: VecDeque::new(),
            recent_set: FxHashSet::default(),
            gap_since: None,
            ready: VecDeque::new(),
            close_received: false,
            eof: false,
        }
    }

    pub fn on_arrival(&mut self, seq: u32, incoming: Incoming, now: Timestamp) -> Arrival {
        let result = match self.mode {
            ReliabilityAndOrdering::UnreliableUnordered => self.on_unordered_unreliable(seq, incoming),
            ReliabilityAndOrdering::UnreliableOrdered => self.on_ordered_unreliable(seq, incoming, now),
            ReliabilityAndOrdering::ReliableUnordered | ReliabilityAndOrdering::ReliableOrdered => self.on_reliable(seq, incoming),
        };
        trace!("frame #{}: {:?}", seq, result);
        result
    }

    fn on_unordered_unreliable(&mut self, seq: u32, incoming: Incoming) -> Arrival {
        if self.close_received {
            return Arrival::Rejected;
        }
        if !self.recent_set.insert(seq) {
            return Arrival::Duplicate;
        }
        self.recent.push_back(seq);
        if self.recent.len() > self.window_size as usize {
            if let Some(oldest) = self.recent.pop_front() {
                self.recent_set.remove(&oldest);
            }
        }

        match incoming {
            Incoming::Data(payload) => self.ready.push_back(payload),
            Incoming::Close => {
                self.close_received = true;
                self.eof = true;
            }
        }
        Arrival::Accepted
    }

    fn on_ordered_unreliable(&mut self, seq: u32, incoming: Incoming, now: Timestamp) -> Arrival {
        if self.close_received && self.eof {
            return Arrival::Rejected;
        }
        if seq <= self.floor || self.buffered.contains_key(&seq) {
            return Arrival::Duplicate;
        }

        if seq > self.floor.saturating_add(self.window_size) {
            // waiting for the gap would exceed the window, so give up on it
            let new_floor = seq - self.window_size;
            debug!("frame #{} is beyond the reorder window, skipping frames up to #{}", seq, new_floor);
            self.skip_to(new_floor);
        }

        if incoming == Incoming::Close {
            self.close_received = true;
        }
        self.buffered.insert(seq, Some(incoming));
        self.flush_contiguous();
        self.update_gap(now);
        Arrival::Accepted
    }

    fn on_reliable(&mut self, seq: u32, incoming: Incoming) -> Arrival {
        if seq <= self.floor || self.buffered.contains_key(&seq) {
            return Arrival::Duplicate;
        }
        if seq > self.floor.saturating_add(self.window_size) || self.eof {
            return Arrival::Rejected;
        }

        let entry = match (self.mode, incoming) {
            (ReliabilityAndOrdering::ReliableUnordered, Incoming::Data(payload)) => {
                self.ready.push_back(payload);
                None
            }
            (_, incoming) => Some(incoming),
        };
        self.buffered.insert(seq, entry);
        self.flush_contiguous();
        Arrival::Accepted
    }

    fn process(&mut self, entry: Option<Incoming>) {
        match entry {
            Some(Incoming::Data(payload)) => self.ready.push_back(payload),
            Some(Incoming::Close) => {
                self.close_received = true;
                self.eof = true;
                // nothing after the close frame is delivered
                self.buffered.clear();
            }
            None => {}
        }
    }

    fn flush_contiguous(&mut self) {
        while !self.eof {
            let Some(entry) = self.buffered.first_entry() else {
                break;
            };
            if *entry.key() != self.floor + 1 {
                break;
            }
            let content = entry.remove();
            self.floor += 1;
            self.process(content);
        }
    }

    /// delivers everything buffered up to `new_floor`, treating missing frames as lost
    fn skip_to(&mut self, new_floor: u32) {
        while !self.eof {
            let Some(entry) = self.buffered.first_entry() else {
                break;
            };
            if *entry.key() > new_floor {
                break;
            }
            let content = entry.remove();
            self.process(content);
        }
        self.floor = self.floor.max(new_floor);
    }

    fn update_gap(&mut self, now: Timestamp) {
        if self.buffered.is_empty() || self.eof {
            self.gap_since = None;
        }
        else if self.gap_since.is_none() {
            self.gap_since = Some(now);
        }
    }

    /// for unreliable ordered streams: when the current gap should be skipped
    pub fn reorder_deadline(&self, reorder_timeout: Duration) -> Option<Timestamp> {
        self.gap_since.map(|since| since + reorder_timeout)
    }

    /// Skips the current gap if it has been open for at least `reorder_timeout`
    pub fn on_reorder_timeout(&mut self, now: Timestamp, reorder_timeout: Duration) {
        match self.reorder_deadline(reorder_timeout) {
            Some(deadline) if deadline <= now => {}
            _ => return,
        }

        if let Some(&first_buffered) = self.buffered.keys().next() {
            debug!("reorder timeout, skipping frames #{} to #{}", self.floor + 1, first_buffered - 1);
            self.floor = first_buffered - 1;
            self.flush_contiguous();
        }
        self.gap_since = None;
        self.update_gap(now);
    }

    pub fn pop_ready(&mut self) -> Option<Slice> {
        self.ready.pop_front()
    }

    /// the peer closed the stream (possibly with frames still missing in between)
    pub fn is_close_received(&self) -> bool {
        self.close_received
    }

    /// Everything the peer sent before closing was delivered: the next pull gets end-of-stream
    pub fn is_finished(&self) -> bool {
        self.eof && self.ready.is_empty()
    }

    /// the highest sequence number up to which all frames were accepted
    pub fn cumulative_ack(&self) -> u32 {
        self.floor
    }

    /// accepted frames above [ReceiveWindow::cumulative_ack]
    pub fn selective_acks(&self) -> Vec<u32> {
        self.buffered.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;
    use ReliabilityAndOrdering::*;

    fn data(seq: u32) -> Incoming {
        Incoming::Data(Slice::from(vec![seq as u8]))
    }

    /// feeds `(seq, is_close)` frames and returns the first byte of everything that became
    ///  deliverable
    fn feed(window: &mut ReceiveWindow, frames: &[(u32, bool)]) -> Vec<u8> {
        for &(seq, is_close) in frames {
            let incoming = if is_close { Incoming::Close } else { data(seq) };
            window.on_arrival(seq, incoming, Timestamp::ZERO);
        }
        let mut result = Vec::new();
        while let Some(payload) = window.pop_ready() {
            result.push(payload[0]);
        }
        result
    }

    fn d(seq: u32) -> (u32, bool) {
        (seq, false)
    }

    fn c(seq: u32) -> (u32, bool) {
        (seq, true)
    }

    #[rstest]
    #[case::uu_in_order(UnreliableUnordered, vec![d(1), d(2), d(3)], vec![1, 2, 3])]
    #[case::uu_arrival_order(UnreliableUnordered, vec![d(3), d(1), d(2)], vec![3, 1, 2])]
    #[case::uu_duplicates(UnreliableUnordered, vec![d(1), d(1), d(2), d(1)], vec![1, 2])]
    #[case::uo_in_order(UnreliableOrdered, vec![d(1), d(2), d(3)], vec![1, 2, 3])]
    #[case::uo_reordered(UnreliableOrdered, vec![d(3), d(1), d(2)], vec![1, 2, 3])]
    #[case::uo_gap_holds_back(UnreliableOrdered, vec![d(1), d(3), d(4)], vec![1])]
    #[case::uo_late_duplicate(UnreliableOrdered, vec![d(1), d(2), d(1)], vec![1, 2])]
    #[case::ru_arrival_order(ReliableUnordered, vec![d(3), d(1), d(2)], vec![3, 1, 2])]
    #[case::ru_duplicates(ReliableUnordered, vec![d(2), d(2), d(1), d(2), d(1)], vec![2, 1])]
    #[case::ro_reordered(ReliableOrdered, vec![d(2), d(3), d(1)], vec![1, 2, 3])]
    #[case::ro_gap_holds_back(ReliableOrdered, vec![d(2), d(3)], vec![])]
    #[case::ro_duplicates(ReliableOrdered, vec![d(2), d(1), d(2), d(1), d(3)], vec![1, 2, 3])]
    fn test_delivery(#[case] mode: ReliabilityAndOrdering, #[case] frames: Vec<(u32, bool)>, #[case] expected: Vec<u8>) {
        let mut window = ReceiveWindow::new(mode, 16);
        assert_eq!(feed(&mut window, &frames), expected);
    }

    #[rstest]
    #[case::uu(UnreliableUnordered)]
    #[case::uo(UnreliableOrdered)]
    #[case::ru(ReliableUnordered)]
    #[case::ro(ReliableOrdered)]
    fn test_duplicate_detection(#[case] mode: ReliabilityAndOrdering) {
        let mut window = ReceiveWindow::new(mode, 16);
        assert_eq!(window.on_arrival(1, data(1), Timestamp::ZERO), Arrival::Accepted);
        assert_eq!(window.on_arrival(1, data(1), Timestamp::ZERO), Arrival::Duplicate);
    }

    #[rstest]
    #[case::uu(UnreliableUnordered, vec![d(1), c(2)], vec![1], true)]
    #[case::uo(UnreliableOrdered, vec![d(1), c(2)], vec![1], true)]
    #[case::uo_close_waits_for_gap(UnreliableOrdered, vec![d(1), c(3)], vec![1], false)]
    #[case::ru(ReliableUnordered, vec![d(1), c(2)], vec![1], true)]
    #[case::ru_close_waits_for_gap(ReliableUnordered, vec![c(3), d(1)], vec![1], false)]
    #[case::ru_gap_filled(ReliableUnordered, vec![c(3), d(2), d(1)], vec![2, 1], true)]
    #[case::ro(ReliableOrdered, vec![c(3), d(2), d(1)], vec![1, 2], true)]
    #[case::ro_close_waits_for_gap(ReliableOrdered, vec![c(3), d(2)], vec![], false)]
    fn test_end_of_stream(#[case] mode: ReliabilityAndOrdering, #[case] frames: Vec<(u32, bool)>, #[case] expected: Vec<u8>, #[case] expected_finished: bool) {
        let mut window = ReceiveWindow::new(mode, 16);
        assert_eq!(feed(&mut window, &frames), expected);
        assert_eq!(window.is_finished(), expected_finished);
    }

    #[test]
    fn test_finished_only_after_ready_is_drained() {
        let mut window = ReceiveWindow::new(ReliableOrdered, 16);
        window.on_arrival(1, data(1), Timestamp::ZERO);
        window.on_arrival(2, Incoming::Close, Timestamp::ZERO);
        assert!(!window.is_finished());
        assert!(window.pop_ready().is_some());
        assert!(window.is_finished());
        assert_eq!(window.on_arrival(3, data(3), Timestamp::ZERO), Arrival::Rejected);
    }

    #[rstest]
    #[case::ru(ReliableUnordered)]
    #[case::ro(ReliableOrdered)]
    fn test_reliable_window_bound(#[case] mode: ReliabilityAndOrdering) {
        let mut window = ReceiveWindow::new(mode, 4);
        assert_eq!(window.on_arrival(5, data(5), Timestamp::ZERO), Arrival::Rejected);
    }

    #[test]
    fn test_acks() {
        let mut window = ReceiveWindow::new(ReliableOrdered, 16);
        for seq in [1, 2, 4, 6] {
            window.on_arrival(seq, data(seq), Timestamp::ZERO);
        }
        assert_eq!(window.cumulative_ack(), 2);
        assert_eq!(window.selective_acks(), vec![4, 6]);

        window.on_arrival(3, data(3), Timestamp::ZERO);
        assert_eq!(window.cumulative_ack(), 4);
        assert_eq!(window.selective_acks(), vec![6]);
    }

    #[test]
    fn test_unreliable_ordered_skips_beyond_window() {
        let mut window = ReceiveWindow::new(UnreliableOrdered, 4);
        assert_eq!(feed(&mut window, &[d(2), d(3)]), Vec::<u8>::new());
        // 7 only fits the window if everything up to 3 is given up on
        assert_eq!(feed(&mut window, &[d(7)]), vec![2, 3]);
        assert_eq!(feed(&mut window, &[d(5), d(4), d(6)]), vec![4, 5, 6, 7]);
        assert_eq!(window.on_arrival(1, data(1), Timestamp::ZERO), Arrival::Duplicate);
    }

    #[test]
    fn test_unreliable_ordered_reorder_timeout() {
        let timeout = Duration::from_millis(100);
        let t = |millis: u64| Timestamp::ZERO + Duration::from_millis(millis);

        let mut window = ReceiveWindow::new(UnreliableOrdered, 16);
        window.on_arrival(1, data(1), t(0));
        assert_eq!(window.reorder_deadline(timeout), None);

        window.on_arrival(3, data(3), t(10));
        window.on_arrival(5, data(5), t(20));
        assert_eq!(window.reorder_deadline(timeout), Some(t(110)));

        window.on_reorder_timeout(t(109), timeout);
        assert_eq!(feed(&mut window, &[]), vec![1]);

        window.on_reorder_timeout(t(110), timeout);
        assert_eq!(feed(&mut window, &[]), vec![3]);
        // the gap before 5 is new
        assert_eq!(window.reorder_deadline(timeout), Some(t(210)));

        window.on_reorder_timeout(t(210), timeout);
        assert_eq!(feed(&mut window, &[]), vec![5]);
        assert_eq!(window.reorder_deadline(timeout), None);

        // a late arrival of a skipped frame is not delivered
        window.on_arrival(2, data(2), t(300));
        assert_eq!(feed(&mut window, &[]), Vec::<u8>::new());
    }

    #[test]
    fn test_unreliable_unordered_dedup_is_bounded() {
        let mut window = ReceiveWindow::new(UnreliableUnordered, 2);
        window.on_arrival(1, data(1), Timestamp::ZERO);
        window.on_arrival(2, data(2), Timestamp::ZERO);
        window.on_arrival(3, data(3), Timestamp::ZERO);
        assert_eq!(window.on_arrival(3, data(3), Timestamp::ZERO), Arrival::Duplicate);
        // 1 fell out of the dedup window
        assert_eq!(window.on_arrival(1, data(1), Timestamp::ZERO), Arrival::Accepted);
    }
}
