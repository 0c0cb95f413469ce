//! Command debouncing.
//!
//! ```text
//!            ┌──────── force, or cooldown elapsed ───────► send now
//! submit ────┤
//!            └──────── inside cooldown ──► Pending(frame, deadline, gen)
//!                                              │  newer submit: replace + re-arm
//!                                              ▼
//!                                    timer fires at deadline ──► forced send
//! ```
//!
//! Only the latest deferred request survives. Its timer is re-armed on every
//! submission, so the final value goes out one window after input stops.

use crate::error::Result;
use crate::infrastructure::bluetooth::protocol::{Command, OutboundFrame};
use crate::infrastructure::bluetooth::writer::FrameSink;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// What the gate did with a submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Immediate,
    Deferred,
}

enum Slot {
    Idle,
    Pending {
        frame: OutboundFrame,
        deadline: Instant,
        generation: u64,
        timer: JoinHandle<()>,
    },
}

struct GateState {
    cooldown_until: Option<Instant>,
    next_generation: u64,
    slot: Slot,
}

pub struct CommandGate {
    sink: Arc<dyn FrameSink>,
    window: Duration,
    state: Arc<Mutex<GateState>>,
    runtime: Handle,
}

fn lock(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn transmit(sink: &dyn FrameSink, frame: &OutboundFrame) -> Result<()> {
    let bytes = frame.to_bytes();
    trace!("Dispatching {:?} {:02X?}", frame.command(), bytes);
    sink.enqueue(bytes)
}

impl CommandGate {
    /// Must be created inside a tokio runtime; timers are spawned on it
    pub fn new(sink: Arc<dyn FrameSink>, window: Duration) -> Self {
        Self {
            sink,
            window,
            state: Arc::new(Mutex::new(GateState {
                cooldown_until: None,
                next_generation: 0,
                slot: Slot::Idle,
            })),
            runtime: Handle::current(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn submit(&self, command: Command, payload: &[u8], force: bool) -> Result<Dispatch> {
        let frame = OutboundFrame::new(command, payload)?;

        let mut state = lock(&self.state);
        let now = Instant::now();
        let cooled = state.cooldown_until.map_or(true, |until| now >= until);
        state.cooldown_until = Some(now + self.window);

        if force {
            transmit(self.sink.as_ref(), &frame)?;
            return Ok(Dispatch::Immediate);
        }

        if cooled {
            // Anything still pending is older than this request
            if let Slot::Pending { timer, .. } = std::mem::replace(&mut state.slot, Slot::Idle) {
                timer.abort();
            }
            transmit(self.sink.as_ref(), &frame)?;
            return Ok(Dispatch::Immediate);
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let deadline = now + self.window;

        if let Slot::Pending { timer, .. } = std::mem::replace(&mut state.slot, Slot::Idle) {
            timer.abort();
        }

        let timer = self.runtime.spawn(fire_after(
            self.state.clone(),
            self.sink.clone(),
            self.window,
            deadline,
            generation,
        ));
        debug!("Deferring {:?} until cooldown ends", command);
        state.slot = Slot::Pending {
            frame,
            deadline,
            generation,
            timer,
        };

        Ok(Dispatch::Deferred)
    }

    /// Drop the pending request and its timer
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        if let Slot::Pending { frame, timer, .. } = std::mem::replace(&mut state.slot, Slot::Idle) {
            timer.abort();
            debug!("Cancelled pending {:?}", frame.command());
        }
    }

    /// The request currently waiting for its timer, if any
    pub fn pending(&self) -> Option<(OutboundFrame, Instant)> {
        match &lock(&self.state).slot {
            Slot::Idle => None,
            Slot::Pending {
                frame, deadline, ..
            } => Some((frame.clone(), *deadline)),
        }
    }
}

async fn fire_after(
    state: Arc<Mutex<GateState>>,
    sink: Arc<dyn FrameSink>,
    window: Duration,
    deadline: Instant,
    generation: u64,
) {
    tokio::time::sleep_until(deadline).await;
    fire(&state, sink.as_ref(), window, generation);
}

fn fire(state: &Mutex<GateState>, sink: &dyn FrameSink, window: Duration, generation: u64) {
    let mut state = lock(state);

    // A newer request re-armed the slot after this timer woke up
    let current = matches!(state.slot, Slot::Pending { generation: g, .. } if g == generation);
    if !current {
        return;
    }

    if let Slot::Pending { frame, .. } = std::mem::replace(&mut state.slot, Slot::Idle) {
        state.cooldown_until = Some(Instant::now() + window);
        if let Err(e) = transmit(sink, &frame) {
            warn!("Deferred {:?} dropped: {}", frame.command(), e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub frames: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingSink {
        pub fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl FrameSink for RecordingSink {
        fn enqueue(&self, frame: Vec<u8>) -> Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn gate() -> (Arc<RecordingSink>, CommandGate) {
        let sink = Arc::new(RecordingSink::default());
        let gate = CommandGate::new(sink.clone(), DEFAULT_DEBOUNCE);
        (sink, gate)
    }

    fn set_anc(wire: u8) -> Vec<u8> {
        vec![0x01, 0x06, 0x02, 0x01, wire]
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_commands_always_immediate() {
        let (sink, gate) = gate();

        for command in [Command::Connect, Command::QueryStatus, Command::QueryBattery] {
            assert_eq!(gate.submit(command, &[], true).unwrap(), Dispatch::Immediate);
        }

        assert_eq!(
            sink.frames(),
            vec![
                vec![0x00, 0x01, 0x01, 0x00],
                vec![0x01, 0x01, 0x05, 0x00],
                vec![0x02, 0x02, 0x01, 0x00],
            ]
        );
        assert!(gate.pending().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_command_after_quiet_period_is_immediate() {
        let (sink, gate) = gate();

        assert_eq!(gate.submit(Command::SetAnc, &[1], false).unwrap(), Dispatch::Immediate);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(gate.submit(Command::SetAnc, &[3], false).unwrap(), Dispatch::Immediate);

        assert_eq!(sink.frames(), vec![set_anc(1), set_anc(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_last_request() {
        let (sink, gate) = gate();

        gate.submit(Command::SetAnc, &[0], false).unwrap();
        for wire in [1, 3, 1, 3] {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(gate.submit(Command::SetAnc, &[wire], false).unwrap(), Dispatch::Deferred);
        }
        let last_issued = Instant::now();

        // Delay is measured from the last request, not the first
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(sink.frames(), vec![set_anc(0)]);
        let (pending, deadline) = gate.pending().unwrap();
        assert_eq!(pending.payload(), &[3]);
        assert_eq!(deadline, last_issued + DEFAULT_DEBOUNCE);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.frames(), vec![set_anc(0), set_anc(3)]);
        assert!(gate.pending().is_none());

        // Nothing else trickles out later
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.frames().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_send_leaves_pending_request_alone() {
        let (sink, gate) = gate();

        gate.submit(Command::SetAnc, &[1], false).unwrap();
        gate.submit(Command::SetAnc, &[3], false).unwrap();
        gate.submit(Command::QueryBattery, &[], true).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            sink.frames(),
            vec![set_anc(1), vec![0x02, 0x02, 0x01, 0x00], set_anc(3)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_request() {
        let (sink, gate) = gate();

        gate.submit(Command::SetAnc, &[1], false).unwrap();
        gate.submit(Command::SetAnc, &[3], false).unwrap();
        gate.cancel();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sink.frames(), vec![set_anc(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_payload_rejected_before_bookkeeping() {
        let (sink, gate) = gate();
        let payload = vec![0u8; 300];

        assert!(matches!(
            gate.submit(Command::SetAnc, &payload, false),
            Err(ProtocolError::PayloadTooLarge { len: 300 })
        ));
        assert!(sink.frames().is_empty());

        // The failed submission did not start a cooldown
        assert_eq!(gate.submit(Command::SetAnc, &[1], false).unwrap(), Dispatch::Immediate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_does_not_fire() {
        let (sink, gate) = gate();

        gate.submit(Command::SetAnc, &[0], false).unwrap();
        gate.submit(Command::SetAnc, &[1], false).unwrap();
        gate.submit(Command::SetAnc, &[3], false).unwrap();

        // Generation 0 belongs to the replaced request
        fire(&gate.state, sink.as_ref(), gate.window(), 0);
        assert_eq!(sink.frames(), vec![set_anc(0)]);
        assert!(gate.pending().is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sink.frames(), vec![set_anc(0), set_anc(3)]);
    }
}
