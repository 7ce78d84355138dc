use std::collections::VecDeque;
use std::time::SystemTime;

use chrono::Utc;

use crate::event::{Command, Event};

/// Plain FIFO queue. Grounded on `cpp/nucleus/straightQueue.cpp`: a single
/// deque, overflow checked at push time, expiry scanned in place without
/// removing the event (the pool decides what to do with an expired event
/// when it's finally popped).
#[derive(Debug, Default)]
pub struct StraightQueue {
    events: VecDeque<Event>,
    max_length: u32,
    exit_when_done: bool,
    num_expired: u64,
    num_overflowed: u64,
}

/// Returned by `queue_event` so the container can route whatever got
/// dumped to the recovery log instead of silently dropping it (§7
/// OverflowSpilled). On overflow the *existing* contents are dumped and the
/// new event becomes the sole resident, not the other way around.
pub enum QueueOutcome {
    Queued,
    Overflowed(Vec<Event>),
}

impl StraightQueue {
    pub fn new(max_length: u32) -> Self {
        StraightQueue {
            events: VecDeque::new(),
            max_length,
            exit_when_done: false,
            num_expired: 0,
            num_overflowed: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Mirrors `straightQueue::checkQueueOverflow`: `>=` max, not `>`, since
    /// the event being checked hasn't been pushed yet.
    fn is_full(&self) -> bool {
        self.events.len() as u32 >= self.max_length
    }

    /// Enqueues `event`. `recovery_replay` mirrors `bRecoveryProcess`:
    /// recovered events bypass the overflow check, since dropping them
    /// again would lose data that's already been through the recovery log
    /// once.
    ///
    /// On overflow, mirrors `checkQueueOverflow` calling `dumpQueue("overflow")`
    /// before accepting the new arrival: the *existing* queue contents are
    /// drained out for the recovery log, and `event` becomes the sole
    /// resident, not the other way around (spec §8 scenario 4: maxLength=3,
    /// submit 4 events, the RecoveryLog holds the first 3 and the queue
    /// holds only the 4th).
    pub fn queue_event(&mut self, event: Event, recovery_replay: bool) -> QueueOutcome {
        if !recovery_replay && self.is_full() {
            self.num_overflowed += 1;
            let dumped = self.dump_queue();
            self.events.push_back(event);
            return QueueOutcome::Overflowed(dumped);
        }
        self.events.push_back(event);
        QueueOutcome::Queued
    }

    /// Pops the next deliverable event. When the queue has drained and
    /// `exit_when_done` was set, synthesizes an `EndOfQueue` command instead
    /// of returning `None` forever, the way `popAvailableEvent` emits
    /// `CMD_END_OF_QUEUE` once.
    pub fn pop_available_event(&mut self) -> Option<Event> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        if self.exit_when_done {
            self.exit_when_done = false;
            return Some(Event::command(0, Command::EndOfQueue));
        }
        None
    }

    /// Walks the queue in place, flagging events whose expiry deadline has
    /// passed. Does not remove them — the pool pops and discards expired
    /// events on its own schedule, matching `scanForExpiredEvents`.
    pub fn scan_for_expired_events(&mut self) {
        let now = Utc::now();
        for event in self.events.iter_mut() {
            if !event.has_been_expired() && event.is_expired(now) {
                event.expire();
                self.num_expired += 1;
            }
        }
    }

    /// Drains the queue for the recovery log, in FIFO order, the way
    /// `dumpQueue` writes out `eventList` front to back.
    pub fn dump_queue(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    pub fn set_max_length(&mut self, max_length: u32) {
        self.max_length = max_length;
    }

    pub fn set_exit_when_done(&mut self) {
        self.exit_when_done = true;
    }

    pub fn reset_stats(&mut self) {
        self.num_expired = 0;
        self.num_overflowed = 0;
    }

    /// `"qSize,qMax,numExpired"`, as `getStatusKey` documents.
    pub fn status_key() -> &'static str {
        "qSize,qMax,numExpired"
    }

    pub fn status(&self) -> String {
        format!("{},{},{}", self.events.len(), self.max_length, self.num_expired)
    }

    #[allow(dead_code)]
    fn now_monotonic() -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::time::Duration;

    fn mk_event(id: u64) -> Event {
        Event::new(id, EventKind::Script, b"payload".to_vec())
    }

    #[test]
    fn fifo_order() {
        let mut q = StraightQueue::new(10);
        assert!(matches!(q.queue_event(mk_event(1), false), QueueOutcome::Queued));
        assert!(matches!(q.queue_event(mk_event(2), false), QueueOutcome::Queued));
        assert_eq!(q.pop_available_event().unwrap().id, 1);
        assert_eq!(q.pop_available_event().unwrap().id, 2);
        assert!(q.pop_available_event().is_none());
    }

    #[test]
    fn overflow_dumps_existing_contents_and_keeps_new_event_as_sole_resident() {
        let mut q = StraightQueue::new(3);
        assert!(matches!(q.queue_event(mk_event(1), false), QueueOutcome::Queued));
        assert!(matches!(q.queue_event(mk_event(2), false), QueueOutcome::Queued));
        assert!(matches!(q.queue_event(mk_event(3), false), QueueOutcome::Queued));
        match q.queue_event(mk_event(4), false) {
            QueueOutcome::Overflowed(dumped) => {
                assert_eq!(dumped.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2, 3]);
            }
            QueueOutcome::Queued => panic!("expected overflow"),
        }
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_available_event().unwrap().id, 4);
    }

    #[test]
    fn recovery_replay_bypasses_overflow() {
        let mut q = StraightQueue::new(1);
        assert!(matches!(q.queue_event(mk_event(1), false), QueueOutcome::Queued));
        assert!(matches!(q.queue_event(mk_event(2), true), QueueOutcome::Queued));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn end_of_queue_emitted_once() {
        let mut q = StraightQueue::new(10);
        q.set_exit_when_done();
        let ev = q.pop_available_event().unwrap();
        assert!(ev.is_command(&Command::EndOfQueue));
        assert!(q.pop_available_event().is_none());
    }

    #[test]
    fn scan_flags_without_removing() {
        let mut q = StraightQueue::new(10);
        let mut ev = mk_event(1);
        ev = ev.with_lifetime(Some(Duration::from_secs(0)));
        ev.stamp_queued(Utc::now() - chrono::Duration::seconds(5));
        q.queue_event(ev, false);
        q.scan_for_expired_events();
        assert_eq!(q.len(), 1);
        let popped = q.pop_available_event().unwrap();
        assert!(popped.has_been_expired());
    }
}
