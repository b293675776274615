//! Byte providers: where file, page and media content comes from.
//!
//! The server never knows the storage origin of an asset, it only asks a
//! [`ByteProvider`] for the bytes behind an identifier such as `img/logo.jpg`.

use fnv::FnvHashMap;
use std::fmt::Debug;
use std::io;
use std::path::{Component, Path, PathBuf};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

pub trait ByteProvider: Debug + Send + Sync {
    /// Returns the bytes behind `id`. With `as_text` a leading UTF-8 BOM is dropped.
    fn load_bytes(&self, id: &str, as_text: bool) -> io::Result<Vec<u8>>;
}

fn strip_bom(mut bytes: Vec<u8>) -> Vec<u8> {
    if bytes.starts_with(UTF8_BOM) {
        bytes.drain(..UTF8_BOM.len());
    }
    bytes
}

/// Assets read from a directory on disk.
#[derive(Debug, Clone)]
pub struct AssetDir {
    root: PathBuf,
}

impl AssetDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an identifier below the root, refusing anything that climbs out of it.
    fn map_path(&self, id: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        for component in Path::new(id.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }
}

impl ByteProvider for AssetDir {
    fn load_bytes(&self, id: &str, as_text: bool) -> io::Result<Vec<u8>> {
        let path = self.map_path(id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("invalid asset path {id}"))
        })?;
        if !path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            ));
        }

        let bytes = std::fs::read(&path)?;
        Ok(if as_text { strip_bom(bytes) } else { bytes })
    }
}

/// Assets kept in memory, for hosts that embed their content in the binary.
#[derive(Debug, Clone, Default)]
pub struct MemoryAssets {
    files: FnvHashMap<String, Vec<u8>>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.files.insert(id.into(), bytes.into());
        self
    }

    pub fn with(mut self, id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(id, bytes);
        self
    }
}

impl ByteProvider for MemoryAssets {
    fn load_bytes(&self, id: &str, as_text: bool) -> io::Result<Vec<u8>> {
        let bytes = self
            .files
            .get(id.trim_start_matches('/'))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{id} not found")))?;
        Ok(if as_text { strip_bom(bytes) } else { bytes })
    }
}
