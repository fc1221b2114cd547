use crate::common::{FileInfo, TransferError};
use crate::peer::events::EventReporter;
use crate::peer::transport::{DataChannel, Frame};
use crate::transfer::progress::ProgressTracker;
use crate::transfer::protocol::{self, ChannelMessage, TransferId};
use crate::transfer::source::FileSource;
use crate::transfer::{TransferDirection, TransferEvent};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Re-check interval while waiting for the channel to drain,
/// in case a low-buffer notification fired before we started waiting
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Outstanding `file-response` waiters of one session, by transfer id
pub type ResponseWaiters = Arc<DashMap<TransferId, oneshot::Sender<bool>>>;

pub struct SenderContext {
    pub channel: Arc<dyn DataChannel>,
    pub chunk_size: usize,
    pub acceptance_timeout: Duration,
    pub responses: ResponseWaiters,
    pub cancel: CancellationToken,
    pub reporter: EventReporter,
}

pub struct OutgoingFile {
    pub id: TransferId,
    pub info: FileInfo,
    pub source: FileSource,
}

/// Run one outgoing transfer to the end and report how it went
pub async fn run_outgoing(
    ctx: SenderContext,
    file: OutgoingFile,
    response: oneshot::Receiver<bool>,
    progress: ProgressTracker,
) {
    let result = send_file(&ctx, &file, response, &progress).await;
    ctx.responses.remove(&file.id);

    match result {
        Ok(()) => {
            info!(
                peer_id = %ctx.reporter.peer_id(),
                transfer_id = %file.id,
                file = %file.info.name,
                bytes = file.info.size,
                "file sent"
            );
            ctx.reporter.transfer(TransferEvent::Sent {
                transfer_id: file.id,
                info: file.info,
            });
        }
        Err(error) => {
            warn!(
                peer_id = %ctx.reporter.peer_id(),
                transfer_id = %file.id,
                code = ?error.code(),
                error = %error,
                "send failed"
            );
            ctx.reporter.transfer(TransferEvent::Failed {
                transfer_id: file.id,
                direction: TransferDirection::Sending,
                error,
            });
        }
    }
}

/// Offer, wait for the decision, stream chunks, confirm.
/// The response waiter must be registered before this is called.
pub async fn send_file(
    ctx: &SenderContext,
    file: &OutgoingFile,
    response: oneshot::Receiver<bool>,
    progress: &ProgressTracker,
) -> Result<(), TransferError> {
    send_control(
        ctx,
        &ChannelMessage::FileInfo {
            transfer_id: file.id,
            file_name: file.info.name.clone(),
            file_size: file.info.size,
            mime_type: file.info.mime_type.clone(),
        },
    )
    .await?;

    let accepted = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
        decision = tokio::time::timeout(ctx.acceptance_timeout, response) => match decision {
            Err(_) => return Err(TransferError::AcceptanceTimeout(ctx.acceptance_timeout)),
            // waiter dropped: session is going away
            Ok(Err(_)) => return Err(TransferError::Cancelled),
            Ok(Ok(accepted)) => accepted,
        },
    };
    if !accepted {
        return Err(TransferError::Rejected);
    }

    debug!(transfer_id = %file.id, size = file.info.size, "offer accepted, sending chunks");

    let chunk_size = ctx.chunk_size.max(1) as u64;
    let mut offset = 0u64;
    while offset < file.info.size {
        wait_for_low_water(ctx).await?;

        let len = (file.info.size - offset).min(chunk_size) as usize;
        let data = file.source.read_chunk(offset, len).await?;
        let frame = protocol::encode_chunk(file.id, offset, &data)
            .map_err(|e| TransferError::Channel(e.to_string()))?;
        send_frame(ctx, frame).await?;

        offset += len as u64;
        let (bytes, percent) = progress.advance(len as u64);
        ctx.reporter.transfer(TransferEvent::Progress {
            transfer_id: file.id,
            direction: TransferDirection::Sending,
            bytes,
            total: file.info.size,
            percent,
        });
    }

    send_control(ctx, &ChannelMessage::TransferComplete { transfer_id: file.id }).await?;
    progress.complete();
    Ok(())
}

/// Block until the channel's buffered amount is at or below its low-water mark
async fn wait_for_low_water(ctx: &SenderContext) -> Result<(), TransferError> {
    let channel = &ctx.channel;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if channel.buffered_amount().await <= channel.low_water_mark() {
            return Ok(());
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
            _ = channel.buffered_amount_low() => {}
            _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
        }
    }
}

async fn send_control(ctx: &SenderContext, msg: &ChannelMessage) -> Result<(), TransferError> {
    let frame = protocol::encode_control(msg).map_err(|e| TransferError::Channel(e.to_string()))?;
    send_frame(ctx, frame).await
}

async fn send_frame(ctx: &SenderContext, frame: Frame) -> Result<(), TransferError> {
    if ctx.cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    ctx.channel
        .send(frame)
        .await
        .map_err(|e| TransferError::Channel(e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::peer::events::PeerEvent;
    use crate::peer::transport::TransportError;
    use crate::transfer::protocol::Inbound;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::{mpsc, Notify};
    use uuid::Uuid;

    /// Channel that keeps every frame and lets the test drive the buffered amount
    pub(crate) struct RecordingChannel {
        pub frames: Mutex<Vec<Frame>>,
        pub buffered: AtomicUsize,
        pub low: Notify,
        pub low_water_mark: usize,
    }

    impl RecordingChannel {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
                buffered: AtomicUsize::new(0),
                low: Notify::new(),
                low_water_mark: 64 * 1024,
            })
        }

        pub(crate) fn decoded(&self) -> Vec<Inbound> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .cloned()
                .map(|f| protocol::decode(f).unwrap())
                .collect()
        }

        pub(crate) fn chunk_layout(&self) -> Vec<(u64, usize)> {
            self.decoded()
                .into_iter()
                .filter_map(|inbound| match inbound {
                    Inbound::Chunk { offset, data, .. } => Some((offset, data.len())),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl DataChannel for RecordingChannel {
        fn label(&self) -> &str {
            "recording"
        }

        async fn send(&self, frame: Frame) -> Result<(), TransportError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        fn low_water_mark(&self) -> usize {
            self.low_water_mark
        }

        async fn buffered_amount_low(&self) {
            self.low.notified().await
        }

        async fn close(&self) {}
    }

    fn context(
        channel: Arc<RecordingChannel>,
    ) -> (SenderContext, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = SenderContext {
            channel,
            chunk_size: 16_384,
            acceptance_timeout: Duration::from_secs(30),
            responses: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            reporter: EventReporter::new("peer-b".into(), tx),
        };
        (ctx, rx)
    }

    fn outgoing(size: usize) -> OutgoingFile {
        let data: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        OutgoingFile {
            id: Uuid::new_v4(),
            info: FileInfo::new("report.pdf", size as u64, "application/pdf"),
            source: FileSource::Memory(Bytes::from(data)),
        }
    }

    #[tokio::test]
    async fn accepted_50000_byte_file_is_chunked_in_order() {
        let channel = RecordingChannel::new();
        let (ctx, _events) = context(channel.clone());
        let file = outgoing(50_000);
        let progress = ProgressTracker::new(50_000);
        let percent = progress.subscribe();
        let (tx, rx) = oneshot::channel();
        tx.send(true).unwrap();

        send_file(&ctx, &file, rx, &progress).await.unwrap();

        assert_eq!(
            channel.chunk_layout(),
            vec![(0, 16_384), (16_384, 16_384), (32_768, 16_384), (49_152, 848)]
        );
        let decoded = channel.decoded();
        assert!(matches!(
            decoded.first(),
            Some(Inbound::Control(ChannelMessage::FileInfo { file_size: 50_000, .. }))
        ));
        assert_eq!(
            decoded.last(),
            Some(&Inbound::Control(ChannelMessage::TransferComplete {
                transfer_id: file.id
            }))
        );
        assert_eq!(*percent.borrow(), 100.0);
    }

    #[tokio::test]
    async fn rejection_sends_no_chunks() {
        let channel = RecordingChannel::new();
        let (ctx, _events) = context(channel.clone());
        let file = outgoing(50_000);
        let (tx, rx) = oneshot::channel();
        tx.send(false).unwrap();

        let result = send_file(&ctx, &file, rx, &ProgressTracker::new(50_000)).await;

        assert_eq!(result, Err(TransferError::Rejected));
        assert_eq!(channel.frames.lock().unwrap().len(), 1);
        assert!(channel.chunk_layout().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_without_chunks() {
        let channel = RecordingChannel::new();
        let (ctx, mut events) = context(channel.clone());
        let file = outgoing(50_000);
        let id = file.id;
        let (tx, rx) = oneshot::channel();
        ctx.responses.insert(id, tx);
        let responses = ctx.responses.clone();

        run_outgoing(ctx, file, rx, ProgressTracker::new(50_000)).await;

        assert!(channel.chunk_layout().is_empty());
        assert!(!responses.contains_key(&id), "waiter cleaned up");
        match events.try_recv() {
            Ok(PeerEvent::Transfer {
                event: TransferEvent::Failed { error, .. },
                ..
            }) => assert_eq!(error, TransferError::AcceptanceTimeout(Duration::from_secs(30))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn waits_for_buffer_to_drain_before_each_chunk() {
        let channel = RecordingChannel::new();
        channel.buffered.store(200_000, Ordering::SeqCst);
        let (ctx, _events) = context(channel.clone());
        let file = outgoing(20_000);
        let (tx, rx) = oneshot::channel();
        tx.send(true).unwrap();

        let task = tokio::spawn(async move {
            send_file(&ctx, &file, rx, &ProgressTracker::new(20_000)).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(channel.chunk_layout().is_empty(), "sent while above low water");

        channel.buffered.store(0, Ordering::SeqCst);
        channel.low.notify_waiters();
        task.await.unwrap().unwrap();

        assert_eq!(channel.chunk_layout(), vec![(0, 16_384), (16_384, 3_616)]);
    }

    #[tokio::test]
    async fn cancellation_stops_the_transfer() {
        let channel = RecordingChannel::new();
        let (ctx, _events) = context(channel.clone());
        let file = outgoing(50_000);
        let (_tx, rx) = oneshot::channel();
        ctx.cancel.cancel();

        let result = send_file(&ctx, &file, rx, &ProgressTracker::new(50_000)).await;

        assert_eq!(result, Err(TransferError::Cancelled));
        assert!(channel.frames.lock().unwrap().is_empty());
    }
}
