use crate::common::{ClientId, ErrorCode, FileInfo, TransferConfig, TransferError};
use crate::peer::events::EventReporter;
use crate::peer::transport::{DataChannel, Frame};
use crate::transfer::library::FileLibrary;
use crate::transfer::progress::ProgressTracker;
use crate::transfer::protocol::{self, ChannelMessage, Inbound, TransferId};
use crate::transfer::receiver::Reassembly;
use crate::transfer::sender::{self, OutgoingFile, ResponseWaiters, SenderContext};
use crate::transfer::source::FileSource;
use crate::transfer::{CompletedFile, TransferDirection, TransferEvent};
use crate::utils::security::validate_filename;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle on a transfer this side started
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    pub id: TransferId,
    pub progress: watch::Receiver<f64>,
}

struct PendingOffer {
    info: FileInfo,
    offered_at: Instant,
}

/// Transfer state of one open channel. Owned by the session task; outgoing
/// transfers run as their own tasks so inbound traffic keeps flowing.
pub struct TransferEngine {
    peer_id: ClientId,
    channel: Arc<dyn DataChannel>,
    config: TransferConfig,
    library: FileLibrary,
    reporter: EventReporter,
    responses: ResponseWaiters,
    pending_offers: HashMap<TransferId, PendingOffer>,
    receiving: HashMap<TransferId, Reassembly>,
    /// Completed by byte count, `transfer-complete` not seen yet
    completed_unconfirmed: HashSet<TransferId>,
    cancel: CancellationToken,
}

impl TransferEngine {
    pub fn new(
        channel: Arc<dyn DataChannel>,
        config: TransferConfig,
        library: FileLibrary,
        reporter: EventReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            peer_id: reporter.peer_id().to_string(),
            channel,
            config,
            library,
            reporter,
            responses: Arc::new(DashMap::new()),
            pending_offers: HashMap::new(),
            receiving: HashMap::new(),
            completed_unconfirmed: HashSet::new(),
            cancel,
        }
    }

    pub fn channel(&self) -> &Arc<dyn DataChannel> {
        &self.channel
    }

    pub fn pending_offer_count(&self) -> usize {
        self.pending_offers.len()
    }

    pub fn receiving_count(&self) -> usize {
        self.receiving.len()
    }

    /// Start sending `source` in the background
    pub fn start_send(&self, info: FileInfo, source: FileSource) -> OutgoingTransfer {
        let id = Uuid::new_v4();
        let progress = ProgressTracker::new(info.size);
        let handle = OutgoingTransfer {
            id,
            progress: progress.subscribe(),
        };

        // registered before file-info goes out so a fast answer is never lost
        let (tx, rx) = oneshot::channel();
        self.responses.insert(id, tx);

        let ctx = SenderContext {
            channel: self.channel.clone(),
            chunk_size: self.config.chunk_size,
            acceptance_timeout: self.config.acceptance_timeout(),
            responses: self.responses.clone(),
            cancel: self.cancel.child_token(),
            reporter: self.reporter.clone(),
        };
        info!(peer_id = %self.peer_id, transfer_id = %id, file = %info.name, size = info.size, "offering file");
        tokio::spawn(sender::run_outgoing(
            ctx,
            OutgoingFile { id, info, source },
            rx,
            progress,
        ));
        handle
    }

    /// Ask the peer to send files from its library (all of them when `names` is empty)
    pub async fn request_files(&self, names: Vec<String>) -> Result<(), TransferError> {
        self.send_control(&ChannelMessage::RequestFiles { names }).await
    }

    /// Accept or reject a pending offer
    pub async fn respond(&mut self, transfer_id: TransferId, accept: bool) -> Result<(), TransferError> {
        let offer = self
            .pending_offers
            .remove(&transfer_id)
            .ok_or(TransferError::UnknownTransfer(transfer_id))?;

        self.send_control(&ChannelMessage::FileResponse {
            transfer_id,
            accepted: accept,
        })
        .await?;

        if !accept {
            info!(peer_id = %self.peer_id, transfer_id = %transfer_id, file = %offer.info.name, "offer rejected");
            return Ok(());
        }

        let reassembly = Reassembly::new(offer.info, self.config.chunk_size.max(1));
        if reassembly.is_complete() {
            // zero-byte file
            self.finish(transfer_id, reassembly);
        } else {
            self.receiving.insert(transfer_id, reassembly);
        }
        Ok(())
    }

    pub async fn handle_frame(&mut self, frame: Frame) {
        let inbound = match protocol::decode(frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(peer_id = %self.peer_id, error = %e, "undecodable channel frame");
                return;
            }
        };

        match inbound {
            Inbound::Chunk {
                transfer_id,
                offset,
                data,
            } => self.on_chunk(transfer_id, offset, data),
            Inbound::Control(ChannelMessage::FileInfo {
                transfer_id,
                file_name,
                file_size,
                mime_type,
            }) => {
                self.on_file_info(transfer_id, FileInfo::new(file_name, file_size, mime_type))
                    .await
            }
            Inbound::Control(ChannelMessage::FileResponse {
                transfer_id,
                accepted,
            }) => self.on_file_response(transfer_id, accepted),
            Inbound::Control(ChannelMessage::TransferComplete { transfer_id }) => {
                self.on_transfer_complete(transfer_id)
            }
            Inbound::Control(ChannelMessage::RequestFiles { names }) => self.on_request_files(names),
            Inbound::Control(ChannelMessage::FileChunk { .. }) => {
                debug!(peer_id = %self.peer_id, "stray chunk header");
            }
        }
    }

    /// Drop offers nobody decided on in time
    pub fn expire_offers(&mut self) -> usize {
        let timeout = self.config.acceptance_timeout();
        let expired: Vec<TransferId> = self
            .pending_offers
            .iter()
            .filter(|(_, offer)| offer.offered_at.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in expired.iter() {
            self.pending_offers.remove(id);
            debug!(peer_id = %self.peer_id, transfer_id = %id, "offer expired undecided");
            self.reporter.transfer(TransferEvent::Failed {
                transfer_id: *id,
                direction: TransferDirection::Receiving,
                error: TransferError::AcceptanceTimeout(timeout),
            });
        }
        expired.len()
    }

    /// Session teardown: cancel senders, discard partial files.
    /// Returns how many received files never got their `transfer-complete`.
    pub fn abandon_all(&mut self) -> usize {
        self.cancel.cancel();
        self.responses.clear();

        let offers = self.pending_offers.drain().map(|(id, _)| id);
        let partial = self.receiving.drain().map(|(id, _)| id);
        let abandoned: Vec<TransferId> = offers.chain(partial).collect();
        for transfer_id in abandoned.iter() {
            self.reporter.transfer(TransferEvent::Failed {
                transfer_id: *transfer_id,
                direction: TransferDirection::Receiving,
                error: TransferError::Cancelled,
            });
        }
        let unconfirmed = self.completed_unconfirmed.len();
        for transfer_id in self.completed_unconfirmed.drain() {
            warn!(
                peer_id = %self.peer_id,
                transfer_id = %transfer_id,
                code = %ErrorCode::ProtocolAnomaly,
                "completed without transfer-complete"
            );
        }

        if !abandoned.is_empty() {
            info!(peer_id = %self.peer_id, abandoned = abandoned.len(), "incoming transfers abandoned");
        }
        unconfirmed
    }

    async fn on_file_info(&mut self, transfer_id: TransferId, info: FileInfo) {
        if self.pending_offers.contains_key(&transfer_id) || self.receiving.contains_key(&transfer_id) {
            warn!(peer_id = %self.peer_id, transfer_id = %transfer_id, "duplicate file-info ignored");
            return;
        }

        if let Err(e) = validate_filename(&info.name) {
            warn!(peer_id = %self.peer_id, transfer_id = %transfer_id, error = %e, "unsafe file name, rejecting");
            self.refuse(transfer_id).await;
            return;
        }

        if info.size > self.config.max_file_size {
            warn!(
                peer_id = %self.peer_id,
                transfer_id = %transfer_id,
                size = info.size,
                limit = self.config.max_file_size,
                "offer exceeds size limit, rejecting"
            );
            self.refuse(transfer_id).await;
            return;
        }

        debug!(peer_id = %self.peer_id, transfer_id = %transfer_id, file = %info.name, size = info.size, "incoming offer");
        self.pending_offers.insert(
            transfer_id,
            PendingOffer {
                info: info.clone(),
                offered_at: Instant::now(),
            },
        );
        self.reporter
            .transfer(TransferEvent::IncomingFile { transfer_id, info });
    }

    /// Reject an offer the user never sees
    async fn refuse(&self, transfer_id: TransferId) {
        let reply = ChannelMessage::FileResponse {
            transfer_id,
            accepted: false,
        };
        if let Err(e) = self.send_control(&reply).await {
            debug!(peer_id = %self.peer_id, error = %e, "could not send rejection");
        }
    }

    fn on_file_response(&mut self, transfer_id: TransferId, accepted: bool) {
        match self.responses.remove(&transfer_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(accepted);
            }
            None => {
                debug!(peer_id = %self.peer_id, transfer_id = %transfer_id, "response for unknown offer");
            }
        }
    }

    fn on_chunk(&mut self, transfer_id: TransferId, offset: u64, data: Bytes) {
        let Some(reassembly) = self.receiving.get_mut(&transfer_id) else {
            debug!(peer_id = %self.peer_id, transfer_id = %transfer_id, offset, "chunk for unknown transfer");
            return;
        };

        match reassembly.insert(offset, data) {
            Ok(percent) => {
                self.reporter.transfer(TransferEvent::Progress {
                    transfer_id,
                    direction: TransferDirection::Receiving,
                    bytes: reassembly.received_bytes(),
                    total: reassembly.info.size,
                    percent,
                });
            }
            Err(anomaly) => {
                warn!(
                    peer_id = %self.peer_id,
                    transfer_id = %transfer_id,
                    code = %ErrorCode::ProtocolAnomaly,
                    %anomaly,
                    "chunk ignored"
                );
                return;
            }
        }

        if reassembly.is_complete() {
            if let Some(reassembly) = self.receiving.remove(&transfer_id) {
                self.finish(transfer_id, reassembly);
            }
        }
    }

    fn on_transfer_complete(&mut self, transfer_id: TransferId) {
        if self.completed_unconfirmed.remove(&transfer_id) {
            debug!(peer_id = %self.peer_id, transfer_id = %transfer_id, "completion confirmed");
            return;
        }

        match self.receiving.get(&transfer_id) {
            Some(reassembly) => warn!(
                peer_id = %self.peer_id,
                transfer_id = %transfer_id,
                code = %ErrorCode::ProtocolAnomaly,
                received = reassembly.received_bytes(),
                expected = reassembly.info.size,
                "transfer-complete before all bytes arrived"
            ),
            None => debug!(peer_id = %self.peer_id, transfer_id = %transfer_id, "transfer-complete for unknown transfer"),
        }
    }

    fn on_request_files(&self, names: Vec<String>) {
        let entries = self.library.matching(&names);
        info!(peer_id = %self.peer_id, requested = names.len(), matched = entries.len(), "peer requested files");
        for entry in entries {
            self.start_send(entry.info, entry.source);
        }
    }

    fn finish(&mut self, transfer_id: TransferId, reassembly: Reassembly) {
        let elapsed = reassembly.started_at.elapsed();
        let info = reassembly.info.clone();
        let data = reassembly.assemble();

        info!(
            peer_id = %self.peer_id,
            transfer_id = %transfer_id,
            file = %info.name,
            bytes = data.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "file received"
        );

        self.library.insert_bytes(info.clone(), data.clone());
        self.completed_unconfirmed.insert(transfer_id);
        self.reporter.transfer(TransferEvent::Completed(CompletedFile {
            transfer_id,
            info,
            data,
            elapsed,
        }));
    }

    async fn send_control(&self, msg: &ChannelMessage) -> Result<(), TransferError> {
        let frame = protocol::encode_control(msg).map_err(|e| TransferError::Channel(e.to_string()))?;
        self.channel
            .send(frame)
            .await
            .map_err(|e| TransferError::Channel(e.to_string()))
    }
}
