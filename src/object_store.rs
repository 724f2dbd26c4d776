//! Content-addressed blob storage (C1).
//!
//! Objects live under `<repo>/files/<hh>/<rest>`, where `hh` is the first two
//! hex digits of the SHA-256 of the blob's content and `rest` is the
//! remaining 62. Writes are atomic: stream the source through the hasher
//! into a repository-local temp file, fsync, then rename into place. A
//! rename over an existing path is a deliberate no-op (dedup), mirroring the
//! teacher crate's `write_loose_object` in `examples/http_server.rs`, adapted
//! here to stream rather than buffer the whole payload.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};

use crate::{errors::SyncError, hash::ContentHash};

/// Content-addressed object store rooted at `<repo>/files`.
#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open (creating if absent) the object store rooted at `repo_root/files`.
    pub fn open(repo_root: &Path) -> Result<Self, SyncError> {
        let root = repo_root.join("files");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Filesystem path an object with `hash` would live at, whether or not it exists.
    pub fn path_of(&self, hash: &ContentHash) -> PathBuf {
        let (dir, rest) = hash.shard();
        self.root.join(dir).join(rest)
    }

    /// Does an object with this hash already exist?
    pub fn exists(&self, hash: &ContentHash) -> bool {
        self.path_of(hash).is_file()
    }

    /// Open a reader over the object's content.
    pub fn open_object(&self, hash: &ContentHash) -> Result<File, SyncError> {
        File::open(self.path_of(hash)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                tracing::warn!(hash = %hash, "object not found");
                SyncError::ObjectNotFound(hash.to_hex())
            } else {
                tracing::warn!(hash = %hash, error = %e, "object open failed");
                SyncError::Io(e)
            }
        })
    }

    /// Read the object's entire content into memory. Used for small files
    /// (manifest diffing, tests); large blobs should stream via `open_object`.
    pub fn read_to_vec(&self, hash: &ContentHash) -> Result<Vec<u8>, SyncError> {
        let mut buf = Vec::new();
        self.open_object(hash)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Stream `source` through a SHA-256 hasher into the store, returning the
    /// resulting hash. Streams rather than buffers so large uploads don't
    /// need to fit in memory twice.
    pub fn put_from_reader(&self, mut source: impl Read) -> Result<ContentHash, SyncError> {
        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        let mut hasher = Sha256::new();
        {
            let mut writer = BufWriter::new(tmp.as_file());
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = source.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                writer.write_all(&buf[..n])?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;

        let hash = ContentHash::from_bytes(hasher.finalize().into());
        let dest = self.path_of(&hash);

        if dest.exists() {
            // Dedup: the temp file is dropped (and unlinked) without error.
            tracing::debug!(hash = %hash, "object already present, dedup hit");
            return Ok(hash);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match tmp.persist(&dest) {
            Ok(_) => Ok(hash),
            Err(e) if dest.exists() => {
                // Lost a race with a concurrent put of the same content; the
                // existing file is equally valid since hashes match.
                drop(e);
                Ok(hash)
            }
            Err(e) => Err(SyncError::Io(e.error)),
        }
    }

    /// Stream the file at `source_path` into the store.
    pub fn put_from_file(&self, source_path: &Path) -> Result<ContentHash, SyncError> {
        let file = File::open(source_path)?;
        self.put_from_reader(BufReader::new(file))
    }

    /// Stream raw bytes into the store.
    pub fn put_bytes(&self, data: &[u8]) -> Result<ContentHash, SyncError> {
        self.put_from_reader(io::Cursor::new(data))
    }
}
