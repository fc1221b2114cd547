//! Chunked, flow-controlled file transfer over an open data channel.

pub mod engine;
pub mod library;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod source;

pub use engine::{OutgoingTransfer, TransferEngine};
pub use library::{FileLibrary, LibraryEntry};
pub use protocol::{ChannelMessage, TransferId};
pub use source::FileSource;

use crate::common::{FileInfo, TransferError};
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// A fully received file
#[derive(Debug, Clone)]
pub struct CompletedFile {
    pub transfer_id: TransferId,
    pub info: FileInfo,
    pub data: Bytes,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Awaiting an accept/reject decision
    IncomingFile { transfer_id: TransferId, info: FileInfo },
    Progress {
        transfer_id: TransferId,
        direction: TransferDirection,
        bytes: u64,
        total: u64,
        percent: f64,
    },
    Completed(CompletedFile),
    Sent { transfer_id: TransferId, info: FileInfo },
    Failed {
        transfer_id: TransferId,
        direction: TransferDirection,
        error: TransferError,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> TransferId {
        match self {
            TransferEvent::IncomingFile { transfer_id, .. }
            | TransferEvent::Progress { transfer_id, .. }
            | TransferEvent::Sent { transfer_id, .. }
            | TransferEvent::Failed { transfer_id, .. } => *transfer_id,
            TransferEvent::Completed(file) => file.transfer_id,
        }
    }
}
