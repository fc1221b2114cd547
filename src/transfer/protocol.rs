//! Data-channel messages.
//!
//! Control messages travel as text frames holding one JSON object tagged by
//! `type`. A chunk travels as a single binary frame:
//!
//! ```text
//! [u32 BE header length][JSON file-chunk header][payload]
//! ```

use crate::peer::transport::Frame;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type TransferId = Uuid;

const HEADER_LEN_BYTES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
    #[serde(rename_all = "camelCase")]
    FileInfo {
        transfer_id: TransferId,
        file_name: String,
        file_size: u64,
        #[serde(default)]
        mime_type: String,
    },
    #[serde(rename_all = "camelCase")]
    FileResponse {
        transfer_id: TransferId,
        accepted: bool,
    },
    /// Header of a binary chunk frame, never sent on its own
    #[serde(rename_all = "camelCase")]
    FileChunk { transfer_id: TransferId, offset: u64 },
    #[serde(rename_all = "camelCase")]
    TransferComplete { transfer_id: TransferId },
    #[serde(rename = "request_files")]
    RequestFiles {
        #[serde(default)]
        names: Vec<String>,
    },
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ChannelMessage),
    Chunk {
        transfer_id: TransferId,
        offset: u64,
        data: Bytes,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Chunk frame too short: {0} bytes")]
    Truncated(usize),

    #[error("Binary frame header is not a file-chunk")]
    NotAChunkHeader,

    #[error("file-chunk header sent without payload")]
    BareChunkHeader,
}

pub fn encode_control(msg: &ChannelMessage) -> Result<Frame, ProtocolError> {
    Ok(Frame::Text(serde_json::to_string(msg)?))
}

pub fn encode_chunk(transfer_id: TransferId, offset: u64, data: &[u8]) -> Result<Frame, ProtocolError> {
    let header = serde_json::to_vec(&ChannelMessage::FileChunk {
        transfer_id,
        offset,
    })?;

    let mut framed = BytesMut::with_capacity(HEADER_LEN_BYTES + header.len() + data.len());
    framed.put_u32(header.len() as u32);
    framed.extend_from_slice(&header);
    framed.extend_from_slice(data);
    Ok(Frame::Binary(framed.freeze()))
}

pub fn decode(frame: Frame) -> Result<Inbound, ProtocolError> {
    match frame {
        Frame::Text(text) => match serde_json::from_str::<ChannelMessage>(&text)? {
            ChannelMessage::FileChunk { .. } => Err(ProtocolError::BareChunkHeader),
            msg => Ok(Inbound::Control(msg)),
        },
        Frame::Binary(mut data) => {
            if data.len() < HEADER_LEN_BYTES {
                return Err(ProtocolError::Truncated(data.len()));
            }
            let header_len =
                u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if data.len() < HEADER_LEN_BYTES + header_len {
                return Err(ProtocolError::Truncated(data.len()));
            }

            let header = data.split_to(HEADER_LEN_BYTES + header_len);
            match serde_json::from_slice(&header[HEADER_LEN_BYTES..])? {
                ChannelMessage::FileChunk {
                    transfer_id,
                    offset,
                } => Ok(Inbound::Chunk {
                    transfer_id,
                    offset,
                    data,
                }),
                _ => Err(ProtocolError::NotAChunkHeader),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_messages_use_wire_names() {
        let id = Uuid::new_v4();
        let Frame::Text(text) = encode_control(&ChannelMessage::FileInfo {
            transfer_id: id,
            file_name: "a.txt".into(),
            file_size: 5,
            mime_type: "text/plain".into(),
        })
        .unwrap() else {
            panic!("control messages are text frames");
        };

        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "file-info",
                "transferId": id.to_string(),
                "fileName": "a.txt",
                "fileSize": 5,
                "mimeType": "text/plain"
            })
        );
    }

    #[test]
    fn request_files_keeps_underscore_name() {
        let msg: ChannelMessage = serde_json::from_str(r#"{"type":"request_files"}"#).unwrap();
        assert_eq!(msg, ChannelMessage::RequestFiles { names: vec![] });
    }

    #[test]
    fn chunk_frame_carries_header_and_payload() {
        let id = Uuid::new_v4();
        let payload = vec![7u8; 848];

        let frame = encode_chunk(id, 49152, &payload).unwrap();
        let decoded = decode(frame).unwrap();

        assert_eq!(
            decoded,
            Inbound::Chunk {
                transfer_id: id,
                offset: 49152,
                data: Bytes::from(payload)
            }
        );
    }

    #[test]
    fn truncated_chunk_frame_is_an_error() {
        let frame = Frame::Binary(Bytes::from_static(&[0, 0, 0, 200, b'{']));
        assert!(matches!(decode(frame), Err(ProtocolError::Truncated(5))));
    }

    #[test]
    fn text_chunk_header_is_refused() {
        let text = json!({"type": "file-chunk", "transferId": Uuid::new_v4(), "offset": 0});
        let frame = Frame::Text(text.to_string());
        assert!(matches!(decode(frame), Err(ProtocolError::BareChunkHeader)));
    }
}
