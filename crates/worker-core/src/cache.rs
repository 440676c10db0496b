//! On-disk content-addressed blob cache shared between workers.
//!
//! Entries are keyed by their canonical file name (`nn-*.network`
//! assets, `<revision>.zip` source archives). Several workers may point
//! at the same directory, so the write protocol is link-or-skip: the
//! data goes to a temp file which is fsynced and then hard-linked to
//! its final name. The link either succeeds atomically or fails
//! (typically because another worker already published the entry), and
//! a failed link is silently skipped. Content is addressed by name, so
//! first-writer-wins is correct. No locks are taken.

use std::io::Write as _;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ObjectCache {
    dir: Option<PathBuf>,
}

impl ObjectCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// A cache that reads nothing and ignores writes.
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Read an entry, `None` if the cache is disabled or the entry is
    /// missing or unreadable. Never fails.
    pub fn read(&self, name: &str) -> Option<Vec<u8>> {
        let dir = self.dir.as_ref()?;
        std::fs::read(dir.join(name)).ok()
    }

    /// Publish an entry. Errors (including a name that is already
    /// present) are silently ignored.
    pub fn write(&self, name: &str, data: &[u8]) {
        let Some(dir) = self.dir.as_ref() else {
            return;
        };
        let Ok(mut temp) = tempfile::NamedTempFile::new_in(dir) else {
            return;
        };
        if temp.write_all(data).is_err() {
            return;
        }
        if temp.as_file().sync_all().is_err() {
            return;
        }
        let _ = std::fs::hard_link(temp.path(), dir.join(name));
        // The temp file is removed when `temp` drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_missing_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(dir.path());
        assert_eq!(cache.read("nn-0123456789ab.network"), None);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(dir.path());
        cache.write("abcdef.zip", b"source archive");
        assert_eq!(cache.read("abcdef.zip").as_deref(), Some(&b"source archive"[..]));
    }

    #[test]
    fn first_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(dir.path());
        cache.write("entry", b"first");
        cache.write("entry", b"second");
        assert_eq!(cache.read("entry").as_deref(), Some(&b"first"[..]));
    }

    #[test]
    fn temp_files_are_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(dir.path());
        cache.write("entry", b"data");
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["entry".to_string()]);
    }

    #[test]
    fn disabled_cache_is_inert() {
        let cache = ObjectCache::disabled();
        cache.write("entry", b"data");
        assert_eq!(cache.read("entry"), None);
        assert!(!cache.is_enabled());
    }
}
