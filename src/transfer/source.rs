use crate::common::{FileInfo, TransferError};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// Implement required traits based on OS
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// Where the bytes of an outgoing file come from
#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Bytes),
    Disk {
        file: Arc<File>,
        path: PathBuf,
        len: u64,
    },
}

impl FileSource {
    /// Open `path` for positional reads and describe it
    pub fn open(path: &Path) -> Result<(Self, FileInfo)> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());

        let source = FileSource::Disk {
            file: Arc::new(file),
            path: path.to_path_buf(),
            len,
        };
        Ok((source, FileInfo::new(name, len, "application/octet-stream")))
    }

    pub fn len(&self) -> u64 {
        match self {
            FileSource::Memory(data) => data.len() as u64,
            FileSource::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `len` bytes at `start`. Disk reads run on the blocking pool.
    pub async fn read_chunk(&self, start: u64, len: usize) -> Result<Bytes, TransferError> {
        match self {
            FileSource::Memory(data) => {
                let begin = start as usize;
                let end = begin + len;
                if end > data.len() {
                    return Err(TransferError::Io(format!(
                        "read past end: {}..{} of {}",
                        begin,
                        end,
                        data.len()
                    )));
                }
                Ok(data.slice(begin..end))
            }
            FileSource::Disk { file, path, .. } => {
                let file = file.clone();
                tokio::task::spawn_blocking(move || read_chunk_at_position(&file, start, len))
                    .await
                    .map_err(|e| TransferError::Io(e.to_string()))?
                    .map(Bytes::from)
                    .map_err(|e| TransferError::Io(format!("{}: {:#}", path.display(), e)))
            }
        }
    }
}

pub fn read_chunk_at_position(file_handle: &Arc<File>, start: u64, len: usize) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; len];

    #[cfg(unix)]
    file_handle
        .read_exact_at(&mut buffer, start)
        .context(format!("Failed to read chunk (unix) at offset {}", start))?;

    #[cfg(windows)]
    {
        let mut filled = 0;
        while filled < len {
            let n = file_handle
                .seek_read(&mut buffer[filled..], start + filled as u64)
                .context(format!("Failed to read chunk (windows) at offset {}", start))?;
            if n == 0 {
                anyhow::bail!("Unexpected end of file at offset {}", start + filled as u64);
            }
            filled += n;
        }
    }

    Ok(buffer)
}
