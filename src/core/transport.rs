//! Channel transport: the outbound chunked send loop with flow control.
//!
//! The data channel applies a hard send-buffer ceiling and will error or
//! drop if it is exceeded, so every enqueue is followed by an explicit
//! backpressure check: when the backlog passes the high water mark the
//! loop suspends until the channel reports it has drained to the low
//! water mark, bounded by [`FLOW_CONTROL_TIMEOUT`].
//!
//! The transport is written against the [`FrameChannel`] trait rather
//! than `RTCDataChannel` directly so the send loop's flow-control and
//! cancellation behavior can be exercised against a scripted channel.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::core::config::{
    BUFFERED_AMOUNT_HIGH, BUFFERED_AMOUNT_LOW, CHUNK_SIZE, FLOW_CONTROL_POLL,
    FLOW_CONTROL_TIMEOUT,
};
use crate::core::error::{Result, TransferError};
use crate::core::protocol::{encode_control, ControlFrame};
use crate::core::session::{EventSender, OutgoingTransfer, ProgressGate, SessionEvent};
use crate::utils::abort::AbortFlag;

// ── Channel abstraction ──────────────────────────────────────────────────────

/// Lifecycle state of a frame channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// A bidirectional, ordered, message-oriented byte pipe.
///
/// Text frames carry control messages; binary frames carry raw chunks.
/// `buffered` reports the outbound backlog: bytes enqueued but not yet
/// handed to the network layer.
#[allow(async_fn_in_trait)]
pub trait FrameChannel: Send + Sync {
    fn state(&self) -> ChannelState;
    async fn buffered(&self) -> usize;
    async fn send_text(&self, text: String) -> Result<()>;
    async fn send_binary(&self, data: Bytes) -> Result<()>;
}

/// The production channel: a WebRTC data channel.
#[derive(Clone)]
pub struct RtcChannel {
    dc: std::sync::Arc<webrtc::data_channel::RTCDataChannel>,
}

impl RtcChannel {
    pub fn new(dc: std::sync::Arc<webrtc::data_channel::RTCDataChannel>) -> Self {
        Self { dc }
    }
}

impl FrameChannel for RtcChannel {
    fn state(&self) -> ChannelState {
        use webrtc::data_channel::data_channel_state::RTCDataChannelState;
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn buffered(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.dc.send(&data).await?;
        Ok(())
    }
}

// ── Backpressure ─────────────────────────────────────────────────────────────

/// Suspend until the channel's backlog drains to the low water mark.
///
/// No-op while the backlog is at or below the high water mark. Once the
/// ceiling is crossed, polls until the backlog reports at or below the
/// low water mark; a stuck buffer fails with `FlowControlTimeout`, a
/// closing channel with `ChannelClosed`.
async fn wait_for_capacity<C: FrameChannel + ?Sized>(channel: &C) -> Result<()> {
    let backlog = channel.buffered().await;
    if backlog <= BUFFERED_AMOUNT_HIGH {
        return Ok(());
    }

    info!(
        event = "backpressure_wait",
        backlog,
        high_watermark = BUFFERED_AMOUNT_HIGH,
        low_watermark = BUFFERED_AMOUNT_LOW,
        "Send buffer above ceiling, waiting for drain"
    );

    let deadline = tokio::time::Instant::now() + FLOW_CONTROL_TIMEOUT;
    loop {
        if channel.state() != ChannelState::Open {
            return Err(TransferError::ChannelClosed(
                "channel closed during backpressure wait".into(),
            ));
        }
        if channel.buffered().await <= BUFFERED_AMOUNT_LOW {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(TransferError::FlowControlTimeout);
        }
        tokio::time::sleep(FLOW_CONTROL_POLL).await;
    }
}

// ── Send loop ────────────────────────────────────────────────────────────────

/// Fill `buf` from `source`, tolerating short reads. Returns the number
/// of bytes read; less than `buf.len()` only at end of stream.
async fn read_chunk<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Send one file over the channel: `meta` frame, 16 KiB chunk stream,
/// `end` frame.
///
/// The abort flag is checked at every chunk boundary; cancellation does
/// not retract bytes already enqueued. Progress events are throttled to
/// [`crate::core::config::PROGRESS_INTERVAL`], with a forced final
/// report once the `end` frame is flushed.
pub async fn send_file<C, R>(
    channel: &C,
    transfer: &OutgoingTransfer,
    mut source: R,
    events: &EventSender,
    abort: &AbortFlag,
) -> Result<()>
where
    C: FrameChannel + ?Sized,
    R: AsyncRead + Unpin,
{
    if channel.state() != ChannelState::Open {
        return Err(TransferError::ChannelClosed(
            "cannot start a transfer on a non-open channel".into(),
        ));
    }

    let meta = ControlFrame::Meta {
        id: transfer.id,
        name: transfer.name.clone(),
        size: transfer.size,
        mime: transfer.mime.clone(),
    };
    channel.send_text(encode_control(&meta)?).await?;

    info!(
        event = "file_send_start",
        id = %transfer.id,
        name = %transfer.name,
        size = transfer.size,
        mime = %transfer.mime,
        "Starting file send"
    );

    let mut gate = ProgressGate::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;

    loop {
        if abort.is_aborted() {
            debug!(event = "send_cancelled", id = %transfer.id, sent, "Abort flag set, stopping at chunk boundary");
            return Err(TransferError::TransferCancelled);
        }
        if channel.state() != ChannelState::Open {
            return Err(TransferError::ChannelClosed(
                "channel closed mid-transfer".into(),
            ));
        }

        let n = read_chunk(&mut source, &mut buf).await?;
        if n == 0 {
            break;
        }

        channel.send_binary(Bytes::copy_from_slice(&buf[..n])).await?;
        sent += n as u64;

        wait_for_capacity(channel).await?;

        if gate.ready() {
            let _ = events.send(SessionEvent::SendProgress {
                id: transfer.id,
                name: transfer.name.clone(),
                done: sent,
                total: transfer.size,
            });
        }

        if n < CHUNK_SIZE {
            break;
        }
    }

    channel
        .send_text(encode_control(&ControlFrame::End { id: transfer.id })?)
        .await?;

    let _ = events.send(SessionEvent::SendProgress {
        id: transfer.id,
        name: transfer.name.clone(),
        done: sent,
        total: transfer.size,
    });

    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::decode_control;
    use crate::core::session::Inbox;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Frame {
        Text(String),
        Binary(Bytes),
    }

    /// A fake channel whose backlog and lifecycle are script-controlled.
    struct ScriptedChannel {
        frames: Mutex<Vec<Frame>>,
        backlog: AtomicUsize,
        state: Mutex<ChannelState>,
        /// Set the backlog to this value once the given number of binary
        /// frames have been enqueued (simulates a filling send buffer).
        backlog_after: Mutex<Option<(usize, usize)>>,
        /// Trip this abort flag after the given number of binary frames.
        abort_after: Mutex<Option<(usize, AbortFlag)>>,
    }

    impl ScriptedChannel {
        fn open() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
                backlog: AtomicUsize::new(0),
                state: Mutex::new(ChannelState::Open),
                backlog_after: Mutex::new(None),
                abort_after: Mutex::new(None),
            })
        }

        fn binary_count(&self) -> usize {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|f| matches!(f, Frame::Binary(_)))
                .count()
        }

        fn set_backlog(&self, value: usize) {
            self.backlog.store(value, Ordering::SeqCst);
        }

        fn frames(&self) -> Vec<Frame> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl FrameChannel for ScriptedChannel {
        fn state(&self) -> ChannelState {
            *self.state.lock().unwrap()
        }

        async fn buffered(&self) -> usize {
            self.backlog.load(Ordering::SeqCst)
        }

        async fn send_text(&self, text: String) -> Result<()> {
            self.frames.lock().unwrap().push(Frame::Text(text));
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> Result<()> {
            self.frames.lock().unwrap().push(Frame::Binary(data));
            let count = self.binary_count();
            if let Some((at, value)) = *self.backlog_after.lock().unwrap() {
                if count == at {
                    self.set_backlog(value);
                }
            }
            if let Some((at, flag)) = self.abort_after.lock().unwrap().as_ref() {
                if count == *at {
                    flag.abort();
                }
            }
            Ok(())
        }
    }

    fn transfer(name: &str, size: u64, mime: &str) -> OutgoingTransfer {
        OutgoingTransfer {
            id: Uuid::new_v4(),
            path: std::path::PathBuf::new(),
            name: name.into(),
            size,
            mime: mime.into(),
        }
    }

    fn events() -> (EventSender, mpsc::UnboundedReceiver<SessionEvent>) {
        mpsc::unbounded_channel()
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn emits_ceil_n_over_chunk_size_binary_frames() {
        let chan = ScriptedChannel::open();
        let (tx, _rx) = events();
        let data = patterned(CHUNK_SIZE * 3 + 100);
        let t = transfer("x.bin", data.len() as u64, "application/octet-stream");

        send_file(&*chan, &t, &data[..], &tx, &AbortFlag::new())
            .await
            .unwrap();

        assert_eq!(chan.binary_count(), 4);
        let frames = chan.frames();
        assert!(matches!(frames.first(), Some(Frame::Text(_))));
        assert!(matches!(frames.last(), Some(Frame::Text(_))));
        // Last chunk carries exactly the remainder.
        let Frame::Binary(last_chunk) = &frames[frames.len() - 2] else {
            panic!("expected a binary frame before end");
        };
        assert_eq!(last_chunk.len(), 100);
    }

    #[tokio::test]
    async fn zero_byte_file_sends_meta_and_end_only() {
        let chan = ScriptedChannel::open();
        let (tx, _rx) = events();
        let t = transfer("empty.bin", 0, "application/octet-stream");

        send_file(&*chan, &t, &b""[..], &tx, &AbortFlag::new())
            .await
            .unwrap();

        let frames = chan.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(chan.binary_count(), 0);
    }

    #[tokio::test]
    async fn exact_multiple_of_chunk_size_has_no_empty_tail_chunk() {
        let chan = ScriptedChannel::open();
        let (tx, _rx) = events();
        let data = patterned(CHUNK_SIZE * 2);
        let t = transfer("even.bin", data.len() as u64, "application/octet-stream");

        send_file(&*chan, &t, &data[..], &tx, &AbortFlag::new())
            .await
            .unwrap();

        assert_eq!(chan.binary_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_suspends_until_low_watermark() {
        let chan = ScriptedChannel::open();
        // After the first chunk, the send buffer jumps past the ceiling.
        *chan.backlog_after.lock().unwrap() = Some((1, BUFFERED_AMOUNT_HIGH + 1));
        let (tx, _rx) = events();
        let data = patterned(CHUNK_SIZE * 5);
        let t = transfer("big.bin", data.len() as u64, "application/octet-stream");

        let chan2 = chan.clone();
        let abort = AbortFlag::new();
        let handle = tokio::spawn(async move {
            send_file(&*chan2, &t, &data[..], &tx, &abort).await
        });

        // Backlog between low and high: the loop must keep waiting.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(chan.binary_count(), 1);
        chan.set_backlog(BUFFERED_AMOUNT_LOW + 1);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(chan.binary_count(), 1);

        // At the low watermark the remaining chunks flow.
        chan.set_backlog(BUFFERED_AMOUNT_LOW);
        handle.await.unwrap().unwrap();
        assert_eq!(chan.binary_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_backlog_fails_with_flow_control_timeout() {
        let chan = ScriptedChannel::open();
        *chan.backlog_after.lock().unwrap() = Some((1, BUFFERED_AMOUNT_HIGH + 1));
        let (tx, _rx) = events();
        let data = patterned(CHUNK_SIZE * 3);
        let t = transfer("stuck.bin", data.len() as u64, "application/octet-stream");

        let err = send_file(&*chan, &t, &data[..], &tx, &AbortFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::FlowControlTimeout));
        assert_eq!(chan.binary_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_at_chunk_boundary_without_end_frame() {
        let chan = ScriptedChannel::open();
        let abort = AbortFlag::new();
        *chan.abort_after.lock().unwrap() = Some((3, abort.clone()));
        let (tx, _rx) = events();
        let data = patterned(CHUNK_SIZE * 10);
        let t = transfer("cancel.bin", data.len() as u64, "application/octet-stream");

        let err = send_file(&*chan, &t, &data[..], &tx, &abort)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::TransferCancelled));
        assert_eq!(chan.binary_count(), 3);

        // Meta went out, but no end frame ever did.
        let texts: Vec<_> = chan
            .frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Text(t) => decode_control(&t),
                _ => None,
            })
            .collect();
        assert_eq!(texts.len(), 1);
        assert!(matches!(texts[0], ControlFrame::Meta { .. }));
    }

    #[tokio::test]
    async fn closed_channel_fails_mid_transfer() {
        let chan = ScriptedChannel::open();
        let (tx, _rx) = events();
        let t = transfer("closed.bin", 1024, "application/octet-stream");

        *chan.state.lock().unwrap() = ChannelState::Closed;
        let err = send_file(&*chan, &t, &patterned(1024)[..], &tx, &AbortFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ChannelClosed(_)));
    }

    /// End-to-end over the scripted channel: sender frames piped into a
    /// receiver inbox reproduce the source byte-for-byte.
    #[tokio::test]
    async fn fifty_kib_round_trip_is_byte_exact() {
        let chan = ScriptedChannel::open();
        let (tx, _rx) = events();
        let data = patterned(50 * 1024);
        let t = transfer("fifty.bin", data.len() as u64, "text/plain");

        send_file(&*chan, &t, &data[..], &tx, &AbortFlag::new())
            .await
            .unwrap();

        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        let mut inbox = Inbox::new(inbox_tx);
        for frame in chan.frames() {
            match frame {
                Frame::Text(text) => {
                    if let Some(ctrl) = decode_control(&text) {
                        inbox.on_control(ctrl);
                    }
                }
                Frame::Binary(bytes) => inbox.on_chunk(bytes),
            }
        }

        let mut completions = Vec::new();
        while let Ok(ev) = inbox_rx.try_recv() {
            if let SessionEvent::FileReceived(f) = ev {
                completions.push(f);
            }
        }
        assert_eq!(completions.len(), 1);
        let file = &completions[0];
        assert_eq!(file.data.len(), 51200);
        assert_eq!(&file.data[..], &data[..]);
        assert_eq!(file.name, "fifty.bin");
        assert_eq!(file.mime, "text/plain");
    }
}
