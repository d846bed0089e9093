use std::collections::BTreeMap;

use tracing::trace;

use crate::callback::Callback;
use crate::config::StreamConfig;
use crate::status::StatusResult;
use crate::stream::frame::Frame;
use crate::timer::Timestamp;
use crate::util::backoff::RetransmitBackoff;

#[derive(Debug)]
struct SendEntry {
    frame: Frame,
    done: Callback<StatusResult>,
    attempts: u32,
    next_retransmit: Timestamp,
}

/// A frame exhausted the configured number of transmission attempts without being acknowledged
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetransmitsExhausted(pub u32);

/// The frames of a reliable stream that were sent but not acknowledged yet, keyed by their
///  sequence number
#[derive(Debug)]
pub struct SendWindow {
    unacked: BTreeMap<u32, SendEntry>,
    backoff: RetransmitBackoff,
    max_attempts: Option<u32>,
}

impl SendWindow {
    pub fn new(config: &StreamConfig) -> SendWindow {
        SendWindow {
            unacked: BTreeMap::new(),
            backoff: RetransmitBackoff::new(config),
            max_attempts: config.max_retransmit_attempts,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }

    pub fn len(&self) -> usize {
        self.unacked.len()
    }

    /// registers a frame that is being transmitted for the first time
    pub fn insert(&mut self, seq: u32, frame: Frame, done: Callback<StatusResult>, now: Timestamp) {
        self.unacked.insert(seq, SendEntry {
            frame,
            done,
            attempts: 1,
            next_retransmit: now + self.backoff.delay_after(1),
        });
    }

    /// Removes acknowledged frames, returning their completion callbacks in sequence order
    pub fn on_ack(&mut self, cumulative: u32, selective: &[u32]) -> Vec<Callback<StatusResult>> {
        let still_unacked = self.unacked.split_off(&cumulative.saturating_add(1));
        let mut acked = std::mem::replace(&mut self.unacked, still_unacked)
            .into_iter()
            .collect::<Vec<_>>();

        for seq in selective {
            if let Some(entry) = self.unacked.remove(seq) {
                acked.push((*seq, entry));
            }
        }

        trace!("acknowledged {} frame(s), {} remaining", acked.len(), self.unacked.len());
        acked.into_iter()
            .map(|(_, entry)| entry.done)
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.unacked.values()
            .map(|e| e.next_retransmit)
            .min()
    }

    /// Returns the frames that are due for retransmission at `now`, and schedules their next
    ///  retransmission
    pub fn due_for_retransmit(&mut self, now: Timestamp) -> Result<Vec<(u32, Frame)>, RetransmitsExhausted> {
        let mut result = Vec::new();
        for (seq, entry) in self.unacked.iter_mut() {
            if entry.next_retransmit > now {
                continue;
            }
            if let Some(max_attempts) = self.max_attempts {
                if entry.attempts >= max_attempts {
                    return Err(RetransmitsExhausted(*seq));
                }
            }
            entry.attempts += 1;
            entry.next_retransmit = now + self.backoff.delay_after(entry.attempts);
            result.push((*seq, entry.frame.clone()));
        }
        Ok(result)
    }

    /// removes all entries, returning their completion callbacks
    pub fn drain(&mut self) -> Vec<Callback<StatusResult>> {
        std::mem::take(&mut self.unacked)
            .into_values()
            .map(|e| e.done)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use rstest::rstest;

    use crate::slice::Slice;
    use super::*;

    fn window() -> SendWindow {
        SendWindow::new(&StreamConfig::default())
    }

    fn data(seq: u32) -> Frame {
        Frame::Data(Slice::from(vec![seq as u8]))
    }

    fn fill(window: &mut SendWindow, seqs: &[u32], completed: &Arc<Mutex<Vec<u32>>>) {
        for &seq in seqs {
            let completed = completed.clone();
            window.insert(seq, data(seq), Callback::new(move |r: StatusResult| {
                assert!(r.is_ok());
                completed.lock().unwrap().push(seq);
            }), Timestamp::ZERO);
        }
    }

    #[rstest]
    #[case::nothing(0, vec![], vec![], 5)]
    #[case::cumulative(2, vec![], vec![1, 2], 3)]
    #[case::selective(0, vec![3, 5], vec![3, 5], 3)]
    #[case::both(1, vec![4], vec![1, 4], 3)]
    #[case::all(5, vec![], vec![1, 2, 3, 4, 5], 0)]
    #[case::beyond(9, vec![], vec![1, 2, 3, 4, 5], 0)]
    #[case::unknown_selective(0, vec![17], vec![], 5)]
    fn test_on_ack(#[case] cumulative: u32, #[case] selective: Vec<u32>, #[case] expected_acked: Vec<u32>, #[case] expected_remaining: usize) {
        let completed = Arc::new(Mutex::new(Vec::new()));
        let mut window = window();
        fill(&mut window, &[1, 2, 3, 4, 5], &completed);

        for callback in window.on_ack(cumulative, &selective) {
            callback.call(Ok(()));
        }
        assert_eq!(*completed.lock().unwrap(), expected_acked);
        assert_eq!(window.len(), expected_remaining);

        for callback in window.drain() {
            callback.call(Ok(()));
        }
        assert!(window.is_empty());
    }

    #[test]
    fn test_retransmit_backoff() {
        let completed = Arc::new(Mutex::new(Vec::new()));
        let mut window = window();
        fill(&mut window, &[1], &completed);
        let at = |millis: u64| Timestamp::ZERO + Duration::from_millis(millis);

        assert_eq!(window.next_deadline(), Some(at(50)));
        assert_eq!(window.due_for_retransmit(at(49)).unwrap(), vec![]);
        assert_eq!(window.due_for_retransmit(at(50)).unwrap(), vec![(1, data(1))]);
        assert_eq!(window.next_deadline(), Some(at(150)));
        assert_eq!(window.due_for_retransmit(at(100)).unwrap(), vec![]);
        assert_eq!(window.due_for_retransmit(at(150)).unwrap(), vec![(1, data(1))]);
        assert_eq!(window.next_deadline(), Some(at(350)));

        for callback in window.on_ack(1, &[]) {
            callback.call(Ok(()));
        }
        assert_eq!(window.next_deadline(), None);
    }

    #[test]
    fn test_retransmits_exhausted() {
        let mut window = SendWindow::new(&StreamConfig { max_retransmit_attempts: Some(2), ..Default::default() });
        window.insert(7, data(7), Callback::ignored(), Timestamp::ZERO);

        let later = Timestamp::ZERO + Duration::from_secs(1);
        assert_eq!(window.due_for_retransmit(later).unwrap().len(), 1);
        assert_eq!(window.due_for_retransmit(later + Duration::from_secs(1)), Err(RetransmitsExhausted(7)));
    }
}
