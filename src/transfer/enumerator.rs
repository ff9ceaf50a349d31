//! Selection expansion
//!
//! Turns a set of entry names selected inside one directory into the ordered
//! list of [`TransferItem`]s a job works through. Recursive mode walks
//! directories depth-first and lists each directory only when the walk
//! reaches it; shallow mode (bulk delete) produces one item per selection.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use super::channel::{EntryInfo, FileChannel};
use super::path_utils::{is_valid_entry_name, join_remote_path};
use super::types::TransferItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Recursive,
    Shallow,
}

/// A directory whose listing is being walked
struct Frame {
    relative: String,
    entries: VecDeque<EntryInfo>,
}

/// Lazy, finite, depth-first item sequence
///
/// ```text
/// selected: [proj]           items:
/// proj/                      proj/a.txt
///   a.txt                    proj/b.txt
///   b.txt                    proj/sub        (directory)
///   sub/                     proj/sub/c.txt
///     c.txt
/// ```
///
/// A selected directory contributes only its contents; nested directories are
/// emitted before their children. An empty selected directory is emitted
/// itself so it still gets created.
pub struct ItemEnumerator {
    channel: Arc<dyn FileChannel>,
    mode: Mode,
    source_root: String,
    destination_root: String,
    selected: VecDeque<String>,
    stack: Vec<Frame>,
    produced: usize,
}

impl ItemEnumerator {
    /// Copy-style enumeration of `names` inside `source_root`, mapped under
    /// `destination_root`
    pub fn recursive(
        channel: Arc<dyn FileChannel>,
        source_root: &str,
        names: &[String],
        destination_root: &str,
    ) -> Self {
        Self::build(channel, Mode::Recursive, source_root, names, destination_root)
    }

    /// One item per selected name, no recursion
    pub fn shallow(channel: Arc<dyn FileChannel>, directory: &str, names: &[String]) -> Self {
        Self::build(channel, Mode::Shallow, directory, names, directory)
    }

    fn build(
        channel: Arc<dyn FileChannel>,
        mode: Mode,
        source_root: &str,
        names: &[String],
        destination_root: &str,
    ) -> Self {
        Self {
            channel,
            mode,
            source_root: source_root.to_string(),
            destination_root: destination_root.to_string(),
            selected: names.iter().cloned().collect(),
            stack: Vec::new(),
            produced: 0,
        }
    }

    /// Number of items produced so far
    pub fn produced(&self) -> usize {
        self.produced
    }

    fn source_of(&self, relative: &str) -> String {
        join_remote_path(&self.source_root, relative)
    }

    fn destination_of(&self, relative: &str) -> String {
        join_remote_path(&self.destination_root, relative)
    }

    fn file_item(&self, relative: &str, size: Option<u64>) -> TransferItem {
        TransferItem::file(
            self.source_of(relative),
            self.destination_of(relative),
            relative,
            size,
        )
    }

    fn directory_item(&self, relative: &str) -> TransferItem {
        TransferItem::directory(self.source_of(relative), self.destination_of(relative), relative)
    }

    /// List a directory, dropping `.`/`..` and other unusable names
    async fn list_sorted(&self, relative: &str) -> Result<VecDeque<EntryInfo>, String> {
        let path = self.source_of(relative);
        let mut entries = self
            .channel
            .list(&path)
            .await
            .map_err(|e| e.to_string())?;
        entries.retain(|e| is_valid_entry_name(&e.name));
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries.into())
    }

    pub async fn next(&mut self) -> Option<TransferItem> {
        let item = match self.mode {
            Mode::Shallow => self.next_shallow().await,
            Mode::Recursive => self.next_recursive().await,
        };
        if item.is_some() {
            self.produced += 1;
        }
        item
    }

    async fn next_shallow(&mut self) -> Option<TransferItem> {
        let name = self.selected.pop_front()?;
        let item = match self.channel.stat(&self.source_of(&name)).await {
            Ok(info) if info.is_dir() => self.directory_item(&name),
            Ok(info) => self.file_item(&name, Some(info.size)),
            Err(e) => {
                warn!("Failed to stat selected entry {}: {}", name, e);
                self.file_item(&name, None).failed(e.to_string())
            }
        };
        Some(item)
    }

    async fn next_recursive(&mut self) -> Option<TransferItem> {
        loop {
            if let Some(frame) = self.stack.last_mut() {
                let Some(entry) = frame.entries.pop_front() else {
                    self.stack.pop();
                    continue;
                };
                let relative = join_remote_path(&frame.relative, &entry.name);
                if !entry.is_dir() {
                    return Some(self.file_item(&relative, Some(entry.size)));
                }
                return Some(match self.list_sorted(&relative).await {
                    Ok(entries) => {
                        let item = self.directory_item(&relative);
                        self.stack.push(Frame { relative, entries });
                        item
                    }
                    Err(e) => {
                        warn!("Failed to list directory {}: {}", relative, e);
                        self.directory_item(&relative).failed(e)
                    }
                });
            }

            let name = self.selected.pop_front()?;
            let info = match self.channel.stat(&self.source_of(&name)).await {
                Ok(info) => info,
                Err(e) => {
                    warn!("Failed to stat selected entry {}: {}", name, e);
                    return Some(self.file_item(&name, None).failed(e.to_string()));
                }
            };
            if !info.is_dir() {
                return Some(self.file_item(&name, Some(info.size)));
            }
            match self.list_sorted(&name).await {
                Ok(entries) if entries.is_empty() => {
                    debug!("Selected directory {} is empty", name);
                    return Some(self.directory_item(&name));
                }
                Ok(entries) => self.stack.push(Frame {
                    relative: name,
                    entries,
                }),
                Err(e) => {
                    warn!("Failed to list directory {}: {}", name, e);
                    return Some(self.directory_item(&name).failed(e));
                }
            }
        }
    }
}
