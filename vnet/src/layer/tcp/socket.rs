//! The per-connection control block and its state machine.
//!
//! Transitions are a match on the state enum; every arm only mutates the
//! locked control block and records what has to happen next in an
//! [`Actions`] value. Segments are put on the wire after the lock is
//! released, so a segment that loops straight back into this node (a
//! self-addressed connection) can never deadlock on the lock it was born
//! under.
//!
//! [`Actions`]: struct.Actions.html
use std::sync::{Condvar, Mutex, Weak};
use std::thread;

use log::{debug, trace};

use crate::layer::Error;
use crate::storage::Ring;
use crate::wire::{TcpFlags, TcpRepr, TcpSeqNumber};

use super::endpoint::{FourTuple, ListenSocket, SocketId, TcpStack};
use super::rto::{RetransmitQueue, RtoTimer, RttEstimator, TimerEvent};
use super::State;

/// A data block that arrived ahead of its turn.
#[derive(Debug)]
pub(super) struct EarlyData {
    pub(super) seq: TcpSeqNumber,
    pub(super) data: Vec<u8>,
}

/// The mutable heart of one connection.
#[derive(Debug)]
pub(super) struct Tcb {
    pub(super) state: State,
    pub(super) iss: TcpSeqNumber,
    pub(super) snd_una: TcpSeqNumber,
    pub(super) snd_nxt: TcpSeqNumber,
    pub(super) snd_wnd: u16,
    pub(super) irs: TcpSeqNumber,
    pub(super) rcv_nxt: TcpSeqNumber,
    pub(super) early: Vec<EarlyData>,
    pub(super) rtt: RttEstimator,
    pub(super) retransmissions: u32,
    /// The byte a zero-window probe is carrying, sitting just past
    /// `snd_nxt` until the window opens.
    pub(super) probe: Option<u8>,
    /// `close` ran while the send buffer still held bytes; the FIN follows
    /// once the send loop drains them.
    pub(super) fin_pending: bool,
    pub(super) fin_sent: bool,
    pub(super) error: Option<Error>,
}

/// One segment scheduled for transmission once the state lock is dropped.
///
/// Segments that need retransmission protection are pushed onto the
/// retransmit queue while the state lock is still held (their sequence
/// numbers are assigned there, and the queue must stay ordered); the wire
/// transmission itself happens lock-free afterwards.
#[derive(Debug)]
pub(super) struct OutSeg {
    pub(super) seq: TcpSeqNumber,
    pub(super) ack: TcpSeqNumber,
    pub(super) flags: TcpFlags,
    pub(super) wnd: u16,
    pub(super) payload: Vec<u8>,
}

/// Everything a state transition wants done after the lock drops.
#[derive(Debug, Default)]
pub(super) struct Actions {
    pub(super) out: Vec<OutSeg>,
    pub(super) wake: bool,
    pub(super) drive: bool,
    pub(super) deliver_parent: bool,
    pub(super) enter_time_wait: bool,
    pub(super) teardown: Option<Teardown>,
}

#[derive(Debug)]
pub(super) enum Teardown {
    /// The connection collapsed, poison the buffers.
    Abort(Error),

    /// The close handshake completed, the buffers drain normally.
    Orderly,
}

/// One endpoint of a connection.
pub struct StreamSocket {
    sid: SocketId,
    tuple: FourTuple,
    pub(super) stack: Weak<TcpStack>,
    pub(super) me: Weak<StreamSocket>,
    parent: Option<Weak<ListenSocket>>,
    pub(super) tcb: Mutex<Tcb>,
    pub(super) cond: Condvar,
    pub(super) snd_buf: Ring,
    pub(super) rcv_buf: Ring,
    pub(super) rtx: RetransmitQueue,
    pub(super) timer: RtoTimer,
}

impl StreamSocket {
    fn build(stack: &std::sync::Arc<TcpStack>, sid: SocketId, tuple: FourTuple,
             parent: Option<Weak<ListenSocket>>, tcb: Tcb) -> std::sync::Arc<StreamSocket> {
        let params = stack.params();
        let buffer_size = params.buffer_size;
        let stack = std::sync::Arc::downgrade(stack);

        std::sync::Arc::new_cyclic(|me| StreamSocket {
            sid,
            tuple,
            stack,
            me: me.clone(),
            parent,
            tcb: Mutex::new(tcb),
            cond: Condvar::new(),
            snd_buf: Ring::new(buffer_size),
            rcv_buf: Ring::new(buffer_size),
            rtx: RetransmitQueue::new(),
            timer: RtoTimer::new(),
        })
    }

    /// A connection about to be actively opened.
    pub(super) fn active_open(stack: &std::sync::Arc<TcpStack>, sid: SocketId,
                              tuple: FourTuple) -> std::sync::Arc<StreamSocket> {
        let iss = TcpSeqNumber(rand::random());
        let tcb = Tcb {
            state: State::SynSent,
            iss,
            snd_una: iss,
            snd_nxt: iss + 1,
            snd_wnd: 0,
            irs: TcpSeqNumber(0),
            rcv_nxt: TcpSeqNumber(0),
            early: Vec::new(),
            rtt: stack.estimator(),
            retransmissions: 0,
            probe: None,
            fin_pending: false,
            fin_sent: false,
            error: None,
        };
        Self::build(stack, sid, tuple, None, tcb)
    }

    /// A connection cloned off a listener by an incoming SYN.
    pub(super) fn passive_open(stack: &std::sync::Arc<TcpStack>, sid: SocketId,
                               tuple: FourTuple, parent: &std::sync::Arc<ListenSocket>,
                               peer_seq: TcpSeqNumber, peer_wnd: u16)
        -> std::sync::Arc<StreamSocket>
    {
        let iss = TcpSeqNumber(rand::random());
        let tcb = Tcb {
            state: State::SynReceived,
            iss,
            snd_una: iss,
            snd_nxt: iss + 1,
            snd_wnd: peer_wnd,
            irs: peer_seq,
            rcv_nxt: peer_seq + 1,
            early: Vec::new(),
            rtt: stack.estimator(),
            retransmissions: 0,
            probe: None,
            fin_pending: false,
            fin_sent: false,
            error: None,
        };
        Self::build(stack, sid, tuple, Some(std::sync::Arc::downgrade(parent)), tcb)
    }

    /// The socket id the shell addresses this connection by.
    pub fn id(&self) -> SocketId {
        self.sid
    }

    /// The four-tuple naming this connection.
    pub fn tuple(&self) -> FourTuple {
        self.tuple
    }

    /// The current state of the connection.
    pub fn state(&self) -> State {
        self.tcb.lock().unwrap().state
    }

    /// Put the opening segment on the wire and start the manager.
    ///
    /// For an active open this is the SYN, for a passive one the SYN+ACK.
    pub(super) fn launch(&self) {
        self.spawn_manager();

        let seg = {
            let tcb = self.tcb.lock().unwrap();
            let flags = match tcb.state {
                State::SynSent => TcpFlags::SYN,
                State::SynReceived => TcpFlags::SYN | TcpFlags::ACK,
                _ => return,
            };
            let seg = OutSeg {
                seq: tcb.iss,
                ack: tcb.rcv_nxt,
                flags,
                wnd: self.rcv_window(),
                payload: Vec::new(),
            };
            self.track(&tcb, &seg);
            seg
        };
        self.dispatch_seg(seg);
    }

    /// Shield a segment with the retransmission machinery.
    ///
    /// Must run under the state lock so queue order follows sequence order.
    pub(super) fn track(&self, tcb: &Tcb, seg: &OutSeg) {
        let was_empty = self.rtx.push(seg.seq, seg.flags, seg.payload.clone());
        if was_empty {
            self.timer.arm(tcb.rtt.rto());
        }
    }

    /// Block until the handshake resolves, one way or the other.
    pub(super) fn wait_established(&self) -> Result<(), Error> {
        let mut tcb = self.tcb.lock().unwrap();
        loop {
            match tcb.state {
                State::SynSent | State::SynReceived => {
                    tcb = self.cond.wait(tcb).unwrap();
                }
                State::Closed => {
                    return Err(tcb.error.unwrap_or(Error::ConnectionAborted));
                }
                _ => return Ok(()),
            }
        }
    }

    /// Begin the local half of the close handshake.
    ///
    /// Valid in ESTABLISHED and CLOSE_WAIT only. The FIN goes out right
    /// away when the send buffer is drained, otherwise it trails the
    /// buffered data.
    pub fn close(&self) -> Result<(), Error> {
        let mut actions = Actions::default();
        {
            let mut tcb = self.tcb.lock().unwrap();
            let next = match tcb.state {
                State::Established => State::FinWait1,
                State::CloseWait => State::LastAck,
                _ => return Err(Error::NotEstablished),
            };
            tcb.state = next;
            self.snd_buf.finish();

            if self.snd_buf.len() == 0 && tcb.probe.is_none() {
                let fin = self.make_fin(&mut tcb);
                actions.out.push(fin);
            } else {
                tcb.fin_pending = true;
            }
            actions.wake = true;
        }
        self.perform(actions);
        Ok(())
    }

    /// Build and track the FIN, consuming one sequence number.
    pub(super) fn make_fin(&self, tcb: &mut Tcb) -> OutSeg {
        let seg = OutSeg {
            seq: tcb.snd_nxt,
            ack: tcb.rcv_nxt,
            flags: TcpFlags::FIN | TcpFlags::ACK,
            wnd: self.rcv_window(),
            payload: Vec::new(),
        };
        tcb.snd_nxt += 1;
        tcb.fin_sent = true;
        tcb.fin_pending = false;
        self.track(tcb, &seg);
        seg
    }

    /// Feed one incoming segment into the state machine.
    pub(super) fn on_segment(&self, repr: &TcpRepr, payload: &[u8]) {
        let mut actions = Actions::default();
        {
            let mut tcb = self.tcb.lock().unwrap();

            if repr.flags.contains(TcpFlags::RST) {
                if tcb.state != State::Closed {
                    trace!("{}: reset by peer", self.tuple);
                    actions.teardown = Some(Teardown::Abort(Error::ConnectionAborted));
                }
                drop(tcb);
                self.perform(actions);
                return;
            }

            match tcb.state {
                State::SynSent => self.on_syn_sent(&mut tcb, repr, &mut actions),
                State::SynReceived => {
                    self.on_syn_received(&mut tcb, repr, payload, &mut actions)
                }
                State::Established
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait
                | State::Closing
                | State::LastAck
                | State::TimeWait => {
                    if repr.flags.contains(TcpFlags::ACK) {
                        self.process_ack(&mut tcb, repr, &mut actions);
                    }
                    if repr.flags.contains(TcpFlags::SYN) {
                        // Our handshake ack got lost and the peer repeated
                        // its SYN+ACK; repeating ours settles it.
                        actions.out.push(self.ack_only(&tcb));
                    }
                    let takes_data = matches!(
                        tcb.state,
                        State::Established | State::FinWait1 | State::FinWait2);
                    if !payload.is_empty() && takes_data {
                        self.receive_data(&mut tcb, repr, payload, &mut actions);
                    }
                    // States past the peer's FIN see retransmitted FINs
                    // here too and answer them with a repeated ack.
                    if repr.flags.contains(TcpFlags::FIN) {
                        self.process_fin(&mut tcb, repr, payload.len(), &mut actions);
                    }
                }
                State::Listen | State::Closed => {}
            }
        }
        self.perform(actions);
    }

    fn on_syn_sent(&self, tcb: &mut Tcb, repr: &TcpRepr, actions: &mut Actions) {
        let expected = TcpFlags::SYN | TcpFlags::ACK;
        if !repr.flags.contains(expected) {
            return;
        }
        if repr.ack_number != tcb.snd_nxt {
            debug!("{}: handshake ack for wrong sequence", self.tuple);
            return;
        }

        tcb.irs = repr.seq_number;
        tcb.rcv_nxt = repr.seq_number + 1;
        tcb.snd_una = repr.ack_number;
        tcb.snd_wnd = repr.window;

        let trim = self.rtx.ack_through(repr.ack_number);
        if let Some(sample) = trim.rtt_sample {
            tcb.rtt.sample(sample);
        }
        if trim.now_empty {
            self.timer.disarm();
        }

        tcb.state = State::Established;
        trace!("{}: established (active)", self.tuple);
        actions.out.push(OutSeg {
            seq: tcb.snd_nxt,
            ack: tcb.rcv_nxt,
            flags: TcpFlags::ACK,
            wnd: self.rcv_window(),
            payload: Vec::new(),
        });
        actions.wake = true;
    }

    fn on_syn_received(&self, tcb: &mut Tcb, repr: &TcpRepr, payload: &[u8],
                       actions: &mut Actions) {
        if repr.flags.contains(TcpFlags::SYN) {
            // A retransmitted SYN, the timer re-offers our SYN+ACK.
            return;
        }
        if !repr.flags.contains(TcpFlags::ACK) || repr.ack_number != tcb.snd_nxt {
            return;
        }

        tcb.snd_una = repr.ack_number;
        tcb.snd_wnd = repr.window;

        let trim = self.rtx.ack_through(repr.ack_number);
        if let Some(sample) = trim.rtt_sample {
            tcb.rtt.sample(sample);
        }
        if trim.now_empty {
            self.timer.disarm();
        }

        tcb.state = State::Established;
        trace!("{}: established (passive)", self.tuple);
        actions.deliver_parent = true;
        actions.wake = true;

        if !payload.is_empty() {
            self.receive_data(tcb, repr, payload, actions);
        }
    }

    /// Window updates, queue trimming, round-trip sampling, and the
    /// transitions that hinge on our FIN being covered.
    fn process_ack(&self, tcb: &mut Tcb, repr: &TcpRepr, actions: &mut Actions) {
        tcb.snd_wnd = repr.window;
        let ack = repr.ack_number;

        // A zero-window probe resolves when the ack covers the probed byte,
        // which sits one past everything else we ever sent.
        if tcb.probe.is_some() && ack == tcb.snd_nxt + 1 {
            tcb.probe = None;
            tcb.snd_nxt = ack;
            tcb.snd_una = ack;
            tcb.retransmissions = 0;
            actions.wake = true;
            actions.drive = true;
            return;
        }

        if tcb.snd_una.lt(ack) && ack.le(tcb.snd_nxt) {
            tcb.snd_una = ack;

            let trim = self.rtx.ack_through(ack);
            if let Some(sample) = trim.rtt_sample {
                tcb.rtt.sample(sample);
            }
            tcb.retransmissions = 0;
            if trim.now_empty {
                self.timer.disarm();
            } else {
                self.timer.arm(tcb.rtt.rto());
            }
            actions.wake = true;

            if tcb.fin_sent && ack == tcb.snd_nxt {
                match tcb.state {
                    State::FinWait1 => {
                        tcb.state = State::FinWait2;
                    }
                    State::Closing => {
                        tcb.state = State::TimeWait;
                        actions.enter_time_wait = true;
                    }
                    State::LastAck => {
                        tcb.state = State::Closed;
                        actions.teardown = Some(Teardown::Orderly);
                    }
                    _ => {}
                }
            }
        }

        // Whatever the ack did, the window may have opened.
        let probe_released = tcb.probe.is_some() && tcb.snd_wnd > 0;
        if self.snd_buf.len() > 0 || tcb.fin_pending || probe_released {
            actions.drive = true;
            actions.wake = true;
        }
    }

    /// The peer is done sending.
    fn process_fin(&self, tcb: &mut Tcb, repr: &TcpRepr, payload_len: usize,
                   actions: &mut Actions) {
        let fin_seq = repr.seq_number + payload_len;
        if fin_seq != tcb.rcv_nxt {
            // Out of order, or an old FIN seen again: re-acknowledge.
            actions.out.push(self.ack_only(tcb));
            return;
        }

        tcb.rcv_nxt += 1;
        self.rcv_buf.finish();
        actions.out.push(self.ack_only(tcb));
        actions.wake = true;

        match tcb.state {
            State::Established => tcb.state = State::CloseWait,
            State::FinWait1 => tcb.state = State::Closing,
            State::FinWait2 => {
                tcb.state = State::TimeWait;
                actions.enter_time_wait = true;
            }
            _ => {}
        }
        trace!("{}: peer finished, now {}", self.tuple, tcb.state);
    }

    /// An empty acknowledgment for the current receive state.
    pub(super) fn ack_only(&self, tcb: &Tcb) -> OutSeg {
        OutSeg {
            seq: tcb.snd_nxt,
            ack: tcb.rcv_nxt,
            flags: TcpFlags::ACK,
            wnd: self.rcv_window(),
            payload: Vec::new(),
        }
    }

    /// Free space in the receive buffer, as advertisable in a header.
    pub(super) fn rcv_window(&self) -> u16 {
        self.rcv_buf.free().min(u16::max_value() as usize) as u16
    }

    /// Carry out everything a transition deferred past the state lock.
    pub(super) fn perform(&self, actions: Actions) {
        for seg in actions.out {
            self.dispatch_seg(seg);
        }

        if actions.deliver_parent {
            self.deliver_to_parent();
        }

        if actions.enter_time_wait {
            self.spawn_time_wait_reaper();
        }

        match actions.teardown {
            Some(Teardown::Abort(err)) => self.abort(err),
            Some(Teardown::Orderly) => self.finish_closed(),
            None => {}
        }

        if actions.drive {
            let _ = self.drive_send(false);
        }

        if actions.wake {
            self.cond.notify_all();
        }
    }

    /// Put one prepared segment on the wire.
    pub(super) fn dispatch_seg(&self, seg: OutSeg) {
        if let Some(stack) = self.stack.upgrade() {
            let _ = stack.transmit(
                &self.tuple, seg.seq, seg.ack, seg.flags, seg.wnd, &seg.payload);
        }
    }

    fn deliver_to_parent(&self) {
        let child = match self.me.upgrade() {
            Some(child) => child,
            None => return,
        };

        let delivered = self.parent.as_ref()
            .and_then(Weak::upgrade)
            .map(|parent| parent.deliver(child))
            .unwrap_or(false);
        if !delivered {
            // Nobody will ever accept this connection.
            debug!("{}: no listener slot, aborting", self.tuple);
            self.abort(Error::Exhausted);
        }
    }

    /// The retransmission timer went off.
    pub(super) fn on_rto(&self) {
        enum Step {
            Resend(OutSeg),
            Abort,
            Idle,
        }

        let max_retransmits = match self.stack.upgrade() {
            Some(stack) => stack.params().max_retransmits,
            None => return,
        };

        let step = {
            let mut tcb = self.tcb.lock().unwrap();
            match self.rtx.oldest() {
                None => Step::Idle,
                Some(_) if tcb.retransmissions >= max_retransmits => Step::Abort,
                Some(oldest) => {
                    tcb.retransmissions += 1;
                    tcb.rtt.backoff();
                    self.rtx.mark_oldest_retransmitted();
                    self.timer.arm(tcb.rtt.rto());
                    debug!("{}: retransmit #{} of seq {}",
                           self.tuple, tcb.retransmissions, oldest.seq);
                    Step::Resend(OutSeg {
                        seq: oldest.seq,
                        ack: tcb.rcv_nxt,
                        flags: oldest.flags,
                        wnd: self.rcv_window(),
                        payload: oldest.payload,
                    })
                }
            }
        };

        match step {
            Step::Resend(seg) => self.dispatch_seg(seg),
            Step::Abort => {
                debug!("{}: retransmission limit, giving up", self.tuple);
                self.abort(Error::ConnectionAborted);
            }
            Step::Idle => {}
        }
    }

    /// Tear the connection down abnormally and wake everyone.
    pub(super) fn abort(&self, err: Error) {
        {
            let mut tcb = self.tcb.lock().unwrap();
            if tcb.state == State::Closed && tcb.error.is_some() {
                return;
            }
            tcb.state = State::Closed;
            tcb.error = Some(err);
        }

        self.snd_buf.abort();
        self.rcv_buf.abort();
        self.rtx.clear();
        self.timer.shutdown();
        if let Some(stack) = self.stack.upgrade() {
            stack.remove_entry(&self.tuple);
        }
        self.cond.notify_all();
    }

    /// Remove a connection whose close handshake completed.
    fn finish_closed(&self) {
        self.rtx.clear();
        self.timer.shutdown();
        if let Some(stack) = self.stack.upgrade() {
            stack.remove_entry(&self.tuple);
        }
        self.cond.notify_all();
    }

    fn spawn_manager(&self) {
        let weak = self.me.clone();
        let spawned = thread::Builder::new()
            .name("tcp-rto".to_owned())
            .spawn(move || {
                // Holding the socket here is what keeps retransmission
                // going when the application forgets about the handle; the
                // timer shutdown on every teardown path releases it.
                let sock = match weak.upgrade() {
                    Some(sock) => sock,
                    None => return,
                };
                loop {
                    match sock.timer.wait_fired() {
                        TimerEvent::Fired => sock.on_rto(),
                        TimerEvent::Shutdown => break,
                    }
                }
            });
        if let Err(err) = spawned {
            debug!("{}: no manager thread: {}", self.tuple, err);
        }
    }

    fn spawn_time_wait_reaper(&self) {
        let linger = match self.stack.upgrade() {
            Some(stack) => stack.params().msl * 2,
            None => return,
        };
        let weak = self.me.clone();

        let spawned = thread::Builder::new()
            .name("tcp-time-wait".to_owned())
            .spawn(move || {
                thread::sleep(linger);
                if let Some(sock) = weak.upgrade() {
                    sock.expire_time_wait();
                }
            });
        if let Err(err) = spawned {
            debug!("{}: no time-wait reaper: {}", self.tuple, err);
        }
    }

    fn expire_time_wait(&self) {
        {
            let mut tcb = self.tcb.lock().unwrap();
            if tcb.state != State::TimeWait {
                return;
            }
            tcb.state = State::Closed;
        }
        trace!("{}: time-wait over", self.tuple);
        self.finish_closed();
    }
}

#[cfg(test)]
impl StreamSocket {
    /// Look at the control block under its lock.
    pub(super) fn inspect<R>(&self, f: impl FnOnce(&Tcb) -> R) -> R {
        f(&self.tcb.lock().unwrap())
    }

    /// Whether the retransmit queue covers exactly `[UNA, NXT)`.
    pub(super) fn rtx_covers_flight(&self) -> bool {
        let tcb = self.tcb.lock().unwrap();
        let nxt = match tcb.probe {
            // A parked probe byte lives outside the queue by design.
            Some(_) => return self.rtx.is_empty(),
            None => tcb.snd_nxt,
        };
        self.rtx.covers(tcb.snd_una, nxt)
    }
}

impl std::fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StreamSocket")
            .field("sid", &self.sid)
            .field("tuple", &self.tuple)
            .finish()
    }
}
