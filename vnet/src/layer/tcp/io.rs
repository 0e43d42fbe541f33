//! Stream I/O on an established connection.
//!
//! `write` fills the send ring and drives the send loop; the send loop cuts
//! MSS-sized, window-clamped segments off the ring. When the peer closes
//! its window entirely the writer drops into zero-window probing. On the
//! receive side, in-order payload goes straight into the receive ring and
//! anything early waits in the holding set until it becomes contiguous.
use std::time::Instant;

use log::{debug, trace};

use crate::layer::Error;
use crate::wire::{TcpFlags, TcpRepr};

use super::socket::{Actions, EarlyData, OutSeg, StreamSocket, Tcb};
use super::{State, MSS};

/// The next move of the send loop, decided under the state lock.
enum Step {
    /// Transmit this segment, then look again.
    Send(OutSeg),

    /// The peer's window is shut and everything is acknowledged: probe.
    Probe,

    /// Nothing to do until an acknowledgment or more data arrives.
    Idle,
}

impl StreamSocket {
    /// Copy `data` into the send buffer, blocking while it is full, and
    /// drive the send loop. Returns once everything is buffered or sent.
    pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
        {
            let tcb = self.tcb.lock().unwrap();
            match tcb.state {
                State::Established | State::CloseWait => {}
                State::Closed => return Err(tcb.error.unwrap_or(Error::NotEstablished)),
                _ => return Err(Error::NotEstablished),
            }
        }

        let mut written = 0;
        while written < data.len() {
            match self.snd_buf.write_some(&data[written..]) {
                Ok(n) => written += n,
                Err(_) => return Err(self.current_error()),
            }
            self.drive_send(true)?;
        }
        Ok(written)
    }

    /// Copy received bytes into `out`, blocking until at least one byte is
    /// available. Returns `Ok(0)` once the peer finished and the buffer is
    /// drained.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, Error> {
        if out.is_empty() {
            return Ok(0);
        }

        let capacity = self.rcv_buf.capacity();
        let before = self.rcv_buf.free();
        let n = match self.rcv_buf.read_some(out) {
            Ok(n) => n,
            Err(_) => return Err(self.current_error()),
        };

        // Reading reopens the window; tell a pinched sender about it. The
        // zero case matters for probing, the half-way threshold keeps
        // ordinary window updates sparse.
        let crossed_half = before < capacity / 2 && self.rcv_buf.free() >= capacity / 2;
        if n > 0 && (before == 0 || crossed_half) {
            let seg = {
                let tcb = self.tcb.lock().unwrap();
                match tcb.state {
                    State::Closed | State::Listen => None,
                    _ => Some(self.ack_only(&tcb)),
                }
            };
            if let Some(seg) = seg {
                trace!("{}: window update after read", self.tuple());
                self.dispatch_seg(seg);
            }
        }

        Ok(n)
    }

    /// Push buffered bytes onto the wire as far as the peer's window and
    /// the MSS allow. With `may_probe` the caller is willing to block in
    /// zero-window probing; the packet-driven callers never are.
    pub(super) fn drive_send(&self, may_probe: bool) -> Result<(), Error> {
        loop {
            let step = {
                let mut tcb = self.tcb.lock().unwrap();
                if tcb.state == State::Closed {
                    return Err(tcb.error.unwrap_or(Error::ConnectionAborted));
                }
                self.next_step(&mut tcb, may_probe)
            };

            match step {
                Step::Send(seg) => self.dispatch_seg(seg),
                Step::Probe => self.run_probe()?,
                Step::Idle => return Ok(()),
            }
        }
    }

    fn next_step(&self, tcb: &mut Tcb, may_probe: bool) -> Step {
        // A parked probe byte leaves first once the window reopens.
        if let Some(byte) = tcb.probe {
            if tcb.snd_wnd > 0 {
                let seg = OutSeg {
                    seq: tcb.snd_nxt,
                    ack: tcb.rcv_nxt,
                    flags: TcpFlags::ACK,
                    wnd: self.rcv_window(),
                    payload: vec![byte],
                };
                tcb.snd_nxt += 1;
                tcb.probe = None;
                self.track(tcb, &seg);
                return Step::Send(seg);
            }
            return if may_probe { Step::Probe } else { Step::Idle };
        }

        let buffered = self.snd_buf.len();
        let in_flight = tcb.snd_nxt.dist_from(tcb.snd_una) as usize;

        if buffered > 0 {
            if tcb.snd_wnd == 0 {
                // Only probe from a clean slate; while data is in flight
                // the retransmission timer is the prod.
                if in_flight == 0 && may_probe {
                    let mut byte = [0u8; 1];
                    if self.snd_buf.pop_some(&mut byte) == 1 {
                        tcb.probe = Some(byte[0]);
                        return Step::Probe;
                    }
                }
                return Step::Idle;
            }

            let usable = (tcb.snd_wnd as usize).saturating_sub(in_flight);
            if usable == 0 {
                return Step::Idle;
            }

            let mut payload = vec![0u8; usable.min(MSS).min(buffered)];
            let n = self.snd_buf.pop_some(&mut payload);
            if n == 0 {
                return Step::Idle;
            }
            payload.truncate(n);

            let seg = OutSeg {
                seq: tcb.snd_nxt,
                ack: tcb.rcv_nxt,
                flags: TcpFlags::ACK,
                wnd: self.rcv_window(),
                payload,
            };
            tcb.snd_nxt += n;
            self.track(tcb, &seg);
            return Step::Send(seg);
        }

        // The buffer drained under a pending close: the FIN takes its turn.
        if tcb.fin_pending {
            let fin = self.make_fin(tcb);
            return Step::Send(fin);
        }

        Step::Idle
    }

    /// Zero-window probing: one byte at the current send edge, repeated
    /// every probe interval, never enqueued for retransmission. Ends when
    /// an acknowledgment opens the window (or consumes the byte), aborts
    /// the connection when the retry budget runs out.
    fn run_probe(&self) -> Result<(), Error> {
        let (interval, max_probes) = match self.stack.upgrade() {
            Some(stack) => {
                let params = stack.params();
                (params.probe_interval, params.max_probes)
            }
            None => return Err(Error::ConnectionAborted),
        };

        let mut sent = 0u32;
        loop {
            let seg = {
                let tcb = self.tcb.lock().unwrap();
                if tcb.state == State::Closed {
                    return Err(tcb.error.unwrap_or(Error::ConnectionAborted));
                }
                let byte = match tcb.probe {
                    Some(byte) => byte,
                    // Consumed by an acknowledgment while we slept.
                    None => return Ok(()),
                };
                if tcb.snd_wnd > 0 {
                    // Window opened, the outer loop sends the byte for real.
                    return Ok(());
                }
                if sent >= max_probes {
                    None
                } else {
                    Some(OutSeg {
                        seq: tcb.snd_nxt,
                        ack: tcb.rcv_nxt,
                        flags: TcpFlags::ACK,
                        wnd: self.rcv_window(),
                        payload: vec![byte],
                    })
                }
            };

            let seg = match seg {
                Some(seg) => seg,
                None => {
                    debug!("{}: zero-window probe exhaustion", self.tuple());
                    self.abort(Error::ConnectionAborted);
                    return Err(Error::ConnectionAborted);
                }
            };

            trace!("{}: zero-window probe #{}", self.tuple(), sent + 1);
            self.dispatch_seg(seg);
            sent += 1;

            // Sleep out the interval, waking early if the ack path signals.
            let deadline = Instant::now() + interval;
            let mut tcb = self.tcb.lock().unwrap();
            loop {
                let resolved = tcb.probe.is_none()
                    || tcb.snd_wnd > 0
                    || tcb.state == State::Closed;
                if resolved {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self.cond.wait_timeout(tcb, deadline - now).unwrap();
                tcb = guard;
            }
        }
    }

    /// Fold one payload-bearing segment into the receive side.
    pub(super) fn receive_data(&self, tcb: &mut Tcb, repr: &TcpRepr, payload: &[u8],
                               actions: &mut Actions) {
        let seq = repr.seq_number;
        let offset = tcb.rcv_nxt.dist_from(seq);

        if offset < 0 {
            // From the future: park it until it becomes contiguous, and
            // let a duplicate ack tell the sender what is still missing.
            stash_early(&mut tcb.early, seq, payload);
            actions.out.push(self.ack_only(tcb));
            return;
        }

        let offset = offset as usize;
        if offset < payload.len() {
            let fresh = &payload[offset..];
            let wrote = self.rcv_buf.push_some(fresh);
            tcb.rcv_nxt += wrote;
            if wrote == fresh.len() {
                self.splice_early(tcb);
            }
            // A short write means the buffer is full; the sender sees the
            // partial ack and the shrunken window and holds off.
        }

        // Duplicates land here with nothing to store and still get an ack.
        actions.out.push(self.ack_only(tcb));
    }

    /// Move early blocks that became contiguous into the receive buffer.
    pub(super) fn splice_early(&self, tcb: &mut Tcb) {
        loop {
            let rcv_nxt = tcb.rcv_nxt;
            let next = tcb.early.iter().position(|block| {
                let offset = rcv_nxt.dist_from(block.seq);
                offset >= 0 && (offset as usize) <= block.data.len()
            });
            let block = match next {
                Some(index) => tcb.early.swap_remove(index),
                None => break,
            };

            let offset = tcb.rcv_nxt.dist_from(block.seq) as usize;
            if offset >= block.data.len() {
                // Entirely duplicate, drop it.
                continue;
            }

            let fresh = &block.data[offset..];
            let wrote = self.rcv_buf.push_some(fresh);
            tcb.rcv_nxt += wrote;
            if wrote < fresh.len() {
                // Out of buffer: keep the tail for the next opportunity.
                tcb.early.push(EarlyData {
                    seq: tcb.rcv_nxt,
                    data: fresh[wrote..].to_vec(),
                });
                break;
            }
        }

        // Blocks the stream has moved past carry nothing anymore.
        let rcv_nxt = tcb.rcv_nxt;
        tcb.early.retain(|block| {
            let offset = rcv_nxt.dist_from(block.seq);
            offset < 0 || (offset as usize) < block.data.len()
        });
    }

    fn current_error(&self) -> Error {
        self.tcb.lock().unwrap().error.unwrap_or(Error::NotEstablished)
    }
}

/// Park an early block, ignoring exact duplicates.
fn stash_early(early: &mut Vec<EarlyData>, seq: crate::wire::TcpSeqNumber, payload: &[u8]) {
    if early.iter().any(|block| block.seq == seq && block.data.len() == payload.len()) {
        return;
    }
    early.push(EarlyData { seq, data: payload.to_vec() });
}
