//! Source-file indirection
//!
//! Entries do not store the path of the file they came from. Instead each
//! distinct source gets a short key (`f1`, `f2`, ...) and a small text file
//! `sources/<key>` holding its path. Relocatable paths are stored with the
//! [`RELOCATABLE_MARKER`] prefix and resolve against a rebase directory when
//! one is configured on the reader.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SOURCES_DIR: &str = "sources";
pub const RELOCATABLE_MARKER: &str = "@reloc:";

/// Key-to-path table for one index directory
#[derive(Debug)]
pub struct SourceFiles {
    dir: PathBuf,
    by_key: HashMap<String, String>,
    by_raw: HashMap<String, String>,
    next_key: u32,
    relocatable: bool,
}

impl SourceFiles {
    /// Load the table of `index_dir`, creating the directory if needed
    pub fn open(index_dir: &Path, relocatable: bool) -> io::Result<Self> {
        let dir = index_dir.join(SOURCES_DIR);
        fs::create_dir_all(&dir)?;
        let mut table = Self::empty(dir, relocatable);
        table.load()?;
        Ok(table)
    }

    /// Load the table of an existing index without creating anything
    pub fn load_existing(index_dir: &Path) -> io::Result<Self> {
        let mut table = Self::empty(index_dir.join(SOURCES_DIR), false);
        if table.dir.is_dir() {
            table.load()?;
        }
        Ok(table)
    }

    fn empty(dir: PathBuf, relocatable: bool) -> Self {
        Self {
            dir,
            by_key: HashMap::new(),
            by_raw: HashMap::new(),
            next_key: 1,
            relocatable,
        }
    }

    fn load(&mut self) -> io::Result<()> {
        for item in fs::read_dir(&self.dir)? {
            let item = item?;
            let key = item.file_name().to_string_lossy().into_owned();
            let Some(number) = key.strip_prefix('f').and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            let raw = fs::read_to_string(item.path())?.trim_end().to_string();
            self.next_key = self.next_key.max(number + 1);
            self.by_raw.insert(raw.clone(), key.clone());
            self.by_key.insert(key, raw);
        }
        Ok(())
    }

    /// Key for `path`, writing a new indirection file the first time
    pub fn key_for(&mut self, path: &Path) -> io::Result<String> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let raw = if self.relocatable {
            format!("{}{}", RELOCATABLE_MARKER, absolute.display())
        } else {
            absolute.display().to_string()
        };
        self.key_for_raw(&raw)
    }

    /// Key for an already encoded path string
    pub fn key_for_raw(&mut self, raw: &str) -> io::Result<String> {
        if let Some(key) = self.by_raw.get(raw) {
            return Ok(key.clone());
        }

        let key = format!("f{}", self.next_key);
        fs::write(self.dir.join(&key), raw)?;
        debug!(key = %key, source = raw, "Registered source file");

        self.next_key += 1;
        self.by_raw.insert(raw.to_string(), key.clone());
        self.by_key.insert(key.clone(), raw.to_string());
        Ok(key)
    }

    /// Encoded path string behind `key`
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.by_key.get(key).map(String::as_str)
    }

    /// Path of the source file behind `key`
    pub fn resolve(&self, key: &str, rebase: Option<&Path>) -> Option<PathBuf> {
        self.raw(key).map(|raw| resolve_raw(raw, rebase))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_key.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Turn a stored path string into a filesystem path
///
/// Relocatable paths keep only their file name when a rebase directory is
/// given; plain paths are returned unchanged.
pub fn resolve_raw(raw: &str, rebase: Option<&Path>) -> PathBuf {
    match (raw.strip_prefix(RELOCATABLE_MARKER), rebase) {
        (Some(original), Some(base)) => match Path::new(original).file_name() {
            Some(name) => base.join(name),
            None => PathBuf::from(original),
        },
        (Some(original), None) => PathBuf::from(original),
        (None, _) => PathBuf::from(raw),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_shared_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = SourceFiles::open(dir.path(), false).unwrap();

        let a = table.key_for(Path::new("/data/a.gb")).unwrap();
        let b = table.key_for(Path::new("/data/b.gb")).unwrap();
        let again = table.key_for(Path::new("/data/a.gb")).unwrap();

        assert_eq!(a, "f1");
        assert_eq!(b, "f2");
        assert_eq!(again, a);
        assert_eq!(
            fs::read_to_string(dir.path().join(SOURCES_DIR).join("f1")).unwrap(),
            "/data/a.gb"
        );
    }

    #[test]
    fn test_reload_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut table = SourceFiles::open(dir.path(), false).unwrap();
            table.key_for(Path::new("/data/a.gb")).unwrap();
        }
        let mut table = SourceFiles::open(dir.path(), false).unwrap();
        assert_eq!(table.key_for(Path::new("/data/a.gb")).unwrap(), "f1");
        assert_eq!(table.key_for(Path::new("/data/z.gb")).unwrap(), "f2");
    }

    #[test]
    fn test_relocatable_resolution() {
        let raw = format!("{}/old/place/uniprot.dat", RELOCATABLE_MARKER);
        assert_eq!(
            resolve_raw(&raw, Some(Path::new("/new/home"))),
            PathBuf::from("/new/home/uniprot.dat")
        );
        assert_eq!(resolve_raw(&raw, None), PathBuf::from("/old/place/uniprot.dat"));
        assert_eq!(
            resolve_raw("/fixed/nt.fa", Some(Path::new("/new/home"))),
            PathBuf::from("/fixed/nt.fa")
        );
    }
}
