//! Retransmission bookkeeping: the in-flight queue, the round-trip
//! estimator, and the per-connection timer the manager thread sleeps on.
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::wire::{TcpFlags, TcpSeqNumber};

/// One segment in flight, kept until acknowledged.
#[derive(Debug, Clone)]
pub(crate) struct TxSegment {
    pub(crate) seq: TcpSeqNumber,
    pub(crate) flags: TcpFlags,
    pub(crate) payload: Vec<u8>,
    pub(crate) sent_at: Instant,
    pub(crate) retransmitted: bool,
}

impl TxSegment {
    /// The amount of sequence space this segment occupies.
    pub(crate) fn seq_len(&self) -> usize {
        self.flags.sequence_len() + self.payload.len()
    }

    /// The first sequence number past this segment.
    pub(crate) fn end(&self) -> TcpSeqNumber {
        self.seq + self.seq_len()
    }
}

/// What trimming the queue against an acknowledgment yielded.
#[derive(Debug, Default)]
pub(crate) struct AckTrim {
    /// At least one segment was fully acknowledged and removed.
    pub(crate) advanced: bool,

    /// Round-trip time of the newest removed segment that was sent exactly
    /// once. Retransmitted segments never produce samples, their timing is
    /// ambiguous.
    pub(crate) rtt_sample: Option<Duration>,

    /// The queue is empty now, the timer can stop.
    pub(crate) now_empty: bool,
}

/// The in-flight segments of one connection, oldest first.
///
/// Deliberately has its own lock so the hot acknowledgment path can trim
/// without touching the connection state lock.
#[derive(Debug, Default)]
pub(crate) struct RetransmitQueue {
    segments: Mutex<VecDeque<TxSegment>>,
}

impl RetransmitQueue {
    pub(crate) fn new() -> Self {
        RetransmitQueue::default()
    }

    /// Append a freshly sent segment. Returns whether the queue was empty
    /// before, meaning the retransmission timer must be armed.
    pub(crate) fn push(&self, seq: TcpSeqNumber, flags: TcpFlags, payload: Vec<u8>) -> bool {
        let mut segments = self.segments.lock().unwrap();
        let was_empty = segments.is_empty();
        segments.push_back(TxSegment {
            seq,
            flags,
            payload,
            sent_at: Instant::now(),
            retransmitted: false,
        });
        was_empty
    }

    /// Drop every segment that `ack` acknowledges in full.
    pub(crate) fn ack_through(&self, ack: TcpSeqNumber) -> AckTrim {
        let mut segments = self.segments.lock().unwrap();
        let mut trim = AckTrim::default();

        while let Some(front) = segments.front() {
            if !front.end().le(ack) {
                break;
            }
            let gone = segments.pop_front().unwrap();
            trim.advanced = true;
            if !gone.retransmitted {
                trim.rtt_sample = Some(gone.sent_at.elapsed());
            }
        }

        trim.now_empty = segments.is_empty();
        trim
    }

    /// Clone the oldest in-flight segment for re-emission.
    pub(crate) fn oldest(&self) -> Option<TxSegment> {
        self.segments.lock().unwrap().front().cloned()
    }

    /// Record that the oldest segment went out again.
    pub(crate) fn mark_oldest_retransmitted(&self) {
        if let Some(front) = self.segments.lock().unwrap().front_mut() {
            front.retransmitted = true;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.segments.lock().unwrap().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.segments.lock().unwrap().clear();
    }

    /// Whether the queue covers exactly the sequence range `[una, nxt)`,
    /// gaplessly and without overlap.
    #[cfg(test)]
    pub(crate) fn covers(&self, una: TcpSeqNumber, nxt: TcpSeqNumber) -> bool {
        let segments = self.segments.lock().unwrap();
        let mut expect = una;
        for segment in segments.iter() {
            if segment.seq != expect {
                return false;
            }
            expect = segment.end();
        }
        expect == nxt
    }
}

/// The smoothed round-trip estimator of rfc6298, α = 1/8, β = 1/4.
#[derive(Debug, Clone)]
pub(crate) struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min: Duration,
    max: Duration,
}

impl RttEstimator {
    pub(crate) fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        RttEstimator {
            srtt: None,
            rttvar: Duration::from_secs(0),
            rto: initial,
            min,
            max,
        }
    }

    /// The current retransmission timeout.
    pub(crate) fn rto(&self) -> Duration {
        self.rto
    }

    /// The smoothed round-trip time, if any sample arrived yet.
    pub(crate) fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Fold one valid round-trip sample into the estimate.
    pub(crate) fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }

        let srtt = self.srtt.unwrap();
        self.rto = (srtt + self.rttvar * 4).max(self.min).min(self.max);
    }

    /// Double the timeout after an expiry, up to the ceiling.
    pub(crate) fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(self.max);
    }
}

/// Outcome of waiting on the retransmission timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    Fired,
    Shutdown,
}

/// The single retransmission timer of one connection.
///
/// Armed whenever the retransmit queue becomes non-empty, disarmed when it
/// drains, shut down when the connection dies. The manager thread blocks in
/// [`wait_fired`] and performs the retransmission on expiry.
///
/// [`wait_fired`]: #method.wait_fired
#[derive(Debug, Default)]
pub(crate) struct RtoTimer {
    state: Mutex<TimerState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

impl RtoTimer {
    pub(crate) fn new() -> Self {
        RtoTimer::default()
    }

    /// (Re)arm the timer to fire after `timeout` from now.
    pub(crate) fn arm(&self, timeout: Duration) {
        let mut state = self.state.lock().unwrap();
        state.deadline = Some(Instant::now() + timeout);
        self.cond.notify_all();
    }

    /// Stop the timer without waking the manager.
    pub(crate) fn disarm(&self) {
        let mut state = self.state.lock().unwrap();
        state.deadline = None;
        self.cond.notify_all();
    }

    /// Terminate the manager thread.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.cond.notify_all();
    }

    /// Block until the armed deadline passes or the timer shuts down.
    pub(crate) fn wait_fired(&self) -> TimerEvent {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return TimerEvent::Shutdown;
            }

            match state.deadline {
                None => {
                    state = self.cond.wait(state).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        state.deadline = None;
                        return TimerEvent::Fired;
                    }
                    let (guard, _) = self.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                }
            }
        }
    }
}
