pub mod config;
pub mod errors;
pub mod types;

pub use config::{Config, IceServer, RelayConfig, TransferConfig};
pub use errors::{AppError, ErrorCode, RelayError, SessionError, TransferError};
pub use types::{now_millis, ClientId, FileInfo, RoomId};
