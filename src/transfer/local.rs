//! Local filesystem channel (download target / upload source)

use async_trait::async_trait;
use tokio::fs;

use super::channel::{EntryInfo, EntryKind, FileChannel, ReadStream, WriteSink};
use super::error::ChannelError;
use super::path_utils::file_name;

/// Channel id used for the local disk
pub const LOCAL_CHANNEL_ID: &str = "local";

pub struct LocalChannel {
    id: String,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self {
            id: LOCAL_CHANNEL_ID.to_string(),
        }
    }

    fn entry_info(path: &str, metadata: &std::fs::Metadata) -> EntryInfo {
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Unknown
        };

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };

        EntryInfo {
            name: file_name(path).to_string(),
            path: path.to_string(),
            kind,
            size: if kind == EntryKind::Directory { 0 } else { metadata.len() },
            mode,
        }
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileChannel for LocalChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_local(&self) -> bool {
        true
    }

    fn supports_multiplexing(&self) -> bool {
        true
    }

    async fn list(&self, path: &str) -> Result<Vec<EntryInfo>, ChannelError> {
        let mut dir = fs::read_dir(path)
            .await
            .map_err(|e| ChannelError::from_io(e, path))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ChannelError::from_io(e, path))?
        {
            let entry_path = entry.path().to_string_lossy().to_string();
            let metadata = fs::symlink_metadata(&entry_path)
                .await
                .map_err(|e| ChannelError::from_io(e, &entry_path))?;
            entries.push(Self::entry_info(&entry_path, &metadata));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Follows symlinks, like SFTP `stat`
    async fn stat(&self, path: &str) -> Result<EntryInfo, ChannelError> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| ChannelError::from_io(e, path))?;
        Ok(Self::entry_info(path, &metadata))
    }

    async fn open_read(&self, path: &str) -> Result<ReadStream, ChannelError> {
        let file = fs::File::open(path)
            .await
            .map_err(|e| ChannelError::from_io(e, path))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> Result<WriteSink, ChannelError> {
        let file = fs::File::create(path)
            .await
            .map_err(|e| ChannelError::from_io(e, path))?;
        Ok(Box::new(file))
    }

    async fn delete(&self, path: &str) -> Result<(), ChannelError> {
        let metadata = fs::symlink_metadata(path)
            .await
            .map_err(|e| ChannelError::from_io(e, path))?;
        let result = if metadata.is_dir() {
            fs::remove_dir(path).await
        } else {
            fs::remove_file(path).await
        };
        result.map_err(|e| ChannelError::from_io(e, path))
    }

    async fn mkdir(&self, path: &str) -> Result<(), ChannelError> {
        fs::create_dir(path)
            .await
            .map_err(|e| ChannelError::from_io(e, path))
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), ChannelError> {
        fs::rename(old_path, new_path)
            .await
            .map_err(|e| ChannelError::from_io(e, old_path))
    }
}
