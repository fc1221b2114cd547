use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Relay-assigned identifier of one client connection
pub type ClientId = String;

/// Opaque room identifier (UUID v4 string)
pub type RoomId = String;

/// File descriptor shared in rooms and sent ahead of a transfer.
///
/// Field names follow the browser `File` object (`name`, `size`, `type`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
    }
}

/// Milliseconds since the unix epoch, used for wire timestamps
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_info_uses_browser_field_names() {
        let info = FileInfo::new("notes.txt", 12, "text/plain");
        let json = serde_json::to_value(&info).unwrap();

        assert_eq!(json["name"], "notes.txt");
        assert_eq!(json["size"], 12);
        assert_eq!(json["type"], "text/plain");
    }

    #[test]
    fn missing_mime_type_defaults_to_empty() {
        let info: FileInfo = serde_json::from_str(r#"{"name":"a.bin","size":3}"#).unwrap();
        assert_eq!(info.mime_type, "");
    }
}
