use crate::common::FileInfo;
use crate::transfer::source::FileSource;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

/// Files this client can serve: what it shared and what it received.
/// Keyed by file name; a newer file with the same name replaces the older one.
#[derive(Clone, Default)]
pub struct FileLibrary {
    files: Arc<DashMap<String, LibraryEntry>>,
}

#[derive(Debug, Clone)]
pub struct LibraryEntry {
    pub info: FileInfo,
    pub source: FileSource,
}

impl FileLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: FileInfo, source: FileSource) {
        self.files
            .insert(info.name.clone(), LibraryEntry { info, source });
    }

    pub fn insert_bytes(&self, info: FileInfo, data: Bytes) {
        self.insert(info, FileSource::Memory(data));
    }

    pub fn get(&self, name: &str) -> Option<LibraryEntry> {
        self.files.get(name).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<LibraryEntry> {
        self.files.remove(name).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Entries named in `names`, or everything when `names` is empty
    pub fn matching(&self, names: &[String]) -> Vec<LibraryEntry> {
        let mut entries: Vec<LibraryEntry> = if names.is_empty() {
            self.files.iter().map(|e| e.value().clone()).collect()
        } else {
            names.iter().filter_map(|name| self.get(name)).collect()
        };
        entries.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        entries.dedup_by(|a, b| a.info.name == b.info.name);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> FileLibrary {
        let library = FileLibrary::new();
        library.insert_bytes(FileInfo::new("b.txt", 2, "text/plain"), Bytes::from_static(b"bb"));
        library.insert_bytes(FileInfo::new("a.txt", 1, "text/plain"), Bytes::from_static(b"a"));
        library
    }

    #[test]
    fn empty_request_matches_everything() {
        let names: Vec<String> = library()
            .matching(&[])
            .into_iter()
            .map(|e| e.info.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn named_request_skips_unknown_names() {
        let entries = library().matching(&["b.txt".into(), "nope".into(), "b.txt".into()]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].info.name, "b.txt");
    }

    #[test]
    fn same_name_replaces() {
        let library = library();
        library.insert_bytes(FileInfo::new("a.txt", 3, ""), Bytes::from_static(b"new"));
        assert_eq!(library.len(), 2);
        assert_eq!(library.get("a.txt").unwrap().info.size, 3);
    }
}
