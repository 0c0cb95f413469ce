//! Periodic inbound frame reader.
//!
//! ```text
//!        ┌──────────── poll interval elapsed ─────────────┐
//!        ▼                                                │
//!   ┌─────────┐  data buffered   ┌──────────┐  drained  ┌──────┐
//!   │ Polling │ ───────────────► │ read one │ ────────► │ Idle │
//!   └─────────┘ ◄─────────────── │  frame   │           └──────┘
//!        │          more data    └──────────┘
//!        └── cancelled / EOF / IO error ──► Stopped
//! ```
//!
//! Every header and payload read is bounded by the read timeout. A read that
//! times out drops the partial frame and switches to resync mode, where
//! buffered bytes are skipped up to the next known message prefix. A tail
//! too short to hold a whole prefix is carried over to the next poll.

use crate::infrastructure::bluetooth::protocol::{
    classify_header, find_frame_start, payload_length, Message, HEADER_LEN, PREFIX_LEN,
};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    Idle,
    Polling,
    Stopped,
}

/// Why the loop ended
#[derive(Debug)]
pub enum LoopExit {
    Cancelled,
    /// EOF (`None`) or a transport error
    Disconnected(Option<io::Error>),
}

/// Receives every recognised inbound frame
pub trait FrameHandler: Send + Sync {
    fn handle_frame(&self, message: Message, payload: &[u8]);
}

enum ReadOutcome {
    Frame(Message, Vec<u8>),
    /// Partial frame dropped after a timeout
    Lost,
}

fn disconnected(e: io::Error) -> LoopExit {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        LoopExit::Disconnected(None)
    } else {
        LoopExit::Disconnected(Some(e))
    }
}

pub struct ReadLoop<R> {
    reader: BufReader<R>,
    poll_interval: Duration,
    read_timeout: Duration,
    cancel: CancellationToken,
    phase: ReadPhase,
    resyncing: bool,
    /// Bytes kept by resync that may begin the next frame; read before the stream
    carry: Vec<u8>,
}

impl<R> ReadLoop<R>
where
    R: AsyncRead + Send + Unpin,
{
    pub fn new(
        reader: R,
        poll_interval: Duration,
        read_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            poll_interval,
            read_timeout,
            cancel,
            phase: ReadPhase::Idle,
            resyncing: false,
            carry: Vec::new(),
        }
    }

    pub fn phase(&self) -> ReadPhase {
        self.phase
    }

    pub async fn run(&mut self, handler: &dyn FrameHandler) -> LoopExit {
        let exit = self.poll_until_stopped(handler).await;
        self.phase = ReadPhase::Stopped;
        debug!("Read loop stopped: {:?}", exit);
        exit
    }

    async fn poll_until_stopped(&mut self, handler: &dyn FrameHandler) -> LoopExit {
        let cancel = self.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                return LoopExit::Cancelled;
            }

            self.phase = ReadPhase::Polling;
            if let Err(exit) = self.drain(handler).await {
                return exit;
            }
            self.phase = ReadPhase::Idle;

            tokio::select! {
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Process every frame that is already available
    async fn drain(&mut self, handler: &dyn FrameHandler) -> Result<(), LoopExit> {
        while self.data_available().await? {
            if self.cancel.is_cancelled() {
                return Err(LoopExit::Cancelled);
            }
            if self.resyncing && !self.resync() {
                break;
            }

            match self.read_frame().await? {
                ReadOutcome::Frame(Message::Unknown, payload) => {
                    trace!("Skipping unknown frame ({} payload bytes)", payload.len());
                }
                ReadOutcome::Frame(message, payload) => handler.handle_frame(message, &payload),
                ReadOutcome::Lost => {
                    warn!("Frame read timed out; resynchronising");
                    self.resyncing = true;
                }
            }
        }
        Ok(())
    }

    /// Non-blocking check for buffered inbound bytes
    async fn data_available(&mut self) -> Result<bool, LoopExit> {
        if !self.reader.buffer().is_empty() {
            return Ok(true);
        }

        match tokio::time::timeout(Duration::ZERO, self.reader.fill_buf()).await {
            Err(_) => Ok(false),
            Ok(Ok(buf)) if buf.is_empty() => Err(LoopExit::Disconnected(None)),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(disconnected(e)),
        }
    }

    /// Skip buffered bytes up to the next known prefix.
    /// Returns false when the buffer held no frame start.
    fn resync(&mut self) -> bool {
        let carried = self.carry.len();
        let buffered = self.reader.buffer().len();
        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(self.reader.buffer());

        match find_frame_start(&window) {
            Some(offset) => {
                if offset > 0 {
                    debug!("Resync skipped {} bytes", offset);
                }
                if offset < carried {
                    self.carry = window[offset..carried].to_vec();
                } else {
                    self.reader.consume(offset - carried);
                }
                self.resyncing = false;
                true
            }
            None => {
                // The tail may be the first bytes of a prefix still in flight
                let keep = window.len().min(PREFIX_LEN - 1);
                trace!("Resync discarding {} bytes", window.len() - keep);
                self.carry = window[window.len() - keep..].to_vec();
                self.reader.consume(buffered);
                false
            }
        }
    }

    async fn read_frame(&mut self) -> Result<ReadOutcome, LoopExit> {
        let mut header = [0u8; HEADER_LEN];
        if !self.read_bounded(&mut header).await? {
            return Ok(ReadOutcome::Lost);
        }

        let message = classify_header(&header);
        let len = match payload_length(&header) {
            Ok(len) => len,
            Err(e) => {
                warn!("{}", e);
                return Ok(ReadOutcome::Lost);
            }
        };

        let mut payload = vec![0u8; len];
        if len > 0 && !self.read_bounded(&mut payload).await? {
            return Ok(ReadOutcome::Lost);
        }

        trace!("RX {:?} {:02X?} {:02X?}", message, header, payload);
        Ok(ReadOutcome::Frame(message, payload))
    }

    /// Fill `buf` within the read timeout. Ok(false) on timeout.
    async fn read_bounded(&mut self, buf: &mut [u8]) -> Result<bool, LoopExit> {
        let carried = self.carry.len().min(buf.len());
        buf[..carried].copy_from_slice(&self.carry[..carried]);
        self.carry.drain(..carried);

        let rest = &mut buf[carried..];
        if rest.is_empty() {
            return Ok(true);
        }

        let cancel = self.cancel.clone();
        let read = tokio::time::timeout(self.read_timeout, self.reader.read_exact(rest));

        tokio::select! {
            _ = cancel.cancelled() => Err(LoopExit::Cancelled),
            result = read => match result {
                Err(_) => Ok(false),
                Ok(Ok(_)) => Ok(true),
                Ok(Err(e)) => Err(disconnected(e)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<(Message, Vec<u8>)>>,
    }

    impl Recorder {
        fn frames(&self) -> Vec<(Message, Vec<u8>)> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl FrameHandler for Recorder {
        fn handle_frame(&self, message: Message, payload: &[u8]) {
            self.frames.lock().unwrap().push((message, payload.to_vec()));
        }
    }

    fn spawn_loop(
        reader: DuplexStream,
        recorder: Arc<Recorder>,
        cancel: CancellationToken,
    ) -> JoinHandle<(LoopExit, ReadPhase)> {
        tokio::spawn(async move {
            let mut read_loop =
                ReadLoop::new(reader, DEFAULT_POLL_INTERVAL, DEFAULT_READ_TIMEOUT, cancel);
            let exit = read_loop.run(recorder.as_ref()).await;
            (exit, read_loop.phase())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_known_frames_in_order() {
        let (reader, mut device) = tokio::io::duplex(256);
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        device
            .write_all(&[
                0x00, 0x01, 0x03, 0x00, // connect ack
                0x02, 0x02, 0x03, 0x01, 0x3C, // battery 60
                0x01, 0x06, 0x03, 0x02, 0x03, 0x00, // anc wire 3
            ])
            .await
            .unwrap();

        let task = spawn_loop(reader, recorder.clone(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            recorder.frames(),
            vec![
                (Message::ConnectAck, vec![]),
                (Message::BatteryLevel, vec![0x3C]),
                (Message::AncLevel, vec![0x03, 0x00]),
            ]
        );

        cancel.cancel();
        let (exit, phase) = task.await.unwrap();
        assert!(matches!(exit, LoopExit::Cancelled));
        assert_eq!(phase, ReadPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_frames_are_consumed_and_skipped() {
        let (reader, mut device) = tokio::io::duplex(256);
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        device
            .write_all(&[
                0x09, 0x09, 0x09, 0x03, 0x00, 0x01, 0x03, // unknown, payload looks like a prefix
                0x00, 0x01, 0x03, 0x00,
            ])
            .await
            .unwrap();

        let task = spawn_loop(reader, recorder.clone(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(recorder.frames(), vec![(Message::ConnectAck, vec![])]);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_arriving_later_are_picked_up_on_next_poll() {
        let (reader, mut device) = tokio::io::duplex(256);
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let task = spawn_loop(reader, recorder.clone(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(recorder.frames().is_empty());

        device.write_all(&[0x02, 0x02, 0x03, 0x01, 0x50]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(recorder.frames(), vec![(Message::BatteryLevel, vec![0x50])]);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_ends_loop_as_disconnected() {
        let (reader, device) = tokio::io::duplex(256);
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let task = spawn_loop(reader, recorder, cancel);
        drop(device);

        let (exit, phase) = task.await.unwrap();
        assert!(matches!(exit, LoopExit::Disconnected(None)));
        assert_eq!(phase, ReadPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_payload_times_out_and_resyncs() {
        let (reader, mut device) = tokio::io::duplex(256);
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        // Header announces 5 bytes but only 2 arrive
        device
            .write_all(&[0x02, 0x02, 0x03, 0x05, 0xAA, 0xBB])
            .await
            .unwrap();

        let task = spawn_loop(reader, recorder.clone(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(recorder.frames().is_empty());
        assert!(!task.is_finished());

        device
            .write_all(&[0xFF, 0xEE, 0x00, 0x01, 0x03, 0x00])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(recorder.frames(), vec![(Message::ConnectAck, vec![])]);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefix_split_across_polls_survives_resync() {
        let (reader, mut device) = tokio::io::duplex(256);
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        device
            .write_all(&[0x02, 0x02, 0x03, 0x05, 0xAA])
            .await
            .unwrap();
        let task = spawn_loop(reader, recorder.clone(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(700)).await;

        // First half of a connect ack lands while the loop is resyncing
        device.write_all(&[0x00, 0x01]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(recorder.frames().is_empty());

        device
            .write_all(&[0x03, 0x00, 0x02, 0x02, 0x03, 0x01, 0x3C])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(
            recorder.frames(),
            vec![
                (Message::ConnectAck, vec![]),
                (Message::BatteryLevel, vec![0x3C]),
            ]
        );
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_carried_noise_before_prefix_is_skipped() {
        let (reader, mut device) = tokio::io::duplex(256);
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        device
            .write_all(&[0x02, 0x02, 0x03, 0x05, 0xAA])
            .await
            .unwrap();
        let task = spawn_loop(reader, recorder.clone(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(700)).await;

        device.write_all(&[0x77, 0xFF, 0x00]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        device.write_all(&[0x01, 0x03, 0x00]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(recorder.frames(), vec![(Message::ConnectAck, vec![])]);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_blocked_read() {
        let (reader, mut device) = tokio::io::duplex(256);
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        // Half a header: the loop blocks inside a bounded read
        device.write_all(&[0x00, 0x01]).await.unwrap();
        let task = spawn_loop(reader, recorder, cancel.clone());
        tokio::task::yield_now().await;

        cancel.cancel();
        let (exit, _) = task.await.unwrap();
        assert!(matches!(exit, LoopExit::Cancelled));
    }
}
