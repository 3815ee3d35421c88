use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use log::{debug, trace, warn};

use crate::config::FILENAME_LEN;

// Other-read permission bit.
const S_IROTH: u32 = 0o004;

/// A served file. The mapping, not a file descriptor, is what's kept around
/// while the response is written.
#[derive(Debug)]
pub struct MappedFile {
    // None for empty files, which can't be mapped.
    mmap: Option<memmap2::Mmap>,
}

impl MappedFile {
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

/// Outcome of looking up a request path.
#[derive(Debug)]
pub enum Resolution {
    File(MappedFile),
    NotFound,
    Forbidden,
    Directory,

    /// Metadata lookup failed for a reason other than the file not being
    /// there.
    Failed,

    /// The file looked fine, but opening or mapping it didn't work.
    Unmappable,
}

/// The directory files are served from.
#[derive(Clone, Debug)]
pub struct DocRoot {
    root: PathBuf,
}

impl DocRoot {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Join the document root and a request path, refusing anything longer
    /// than `FILENAME_LEN`.
    #[must_use]
    fn real_file(&self, path: &str) -> Option<PathBuf> {
        let root = self.root.as_os_str();
        if root.len() + path.len() >= FILENAME_LEN {
            debug!("Path too long: {} + {}", root.len(), path.len());
            return None;
        }
        let mut s = root.to_os_string();
        s.push(path);
        Some(PathBuf::from(s))
    }

    /// Find the file for `path`, and map it if it can be served.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Resolution {
        let Some(real) = self.real_file(path) else {
            return Resolution::NotFound;
        };
        trace!("Looking up {}", real.display());
        let meta = match std::fs::metadata(&real) {
            Ok(m) => m,
            Err(e) => {
                return match e.raw_os_error() {
                    Some(libc::ENOENT | libc::ENOTDIR | libc::ENAMETOOLONG) => Resolution::NotFound,
                    Some(libc::EACCES) => Resolution::Forbidden,
                    _ => {
                        warn!("stat({}): {e}", real.display());
                        Resolution::Failed
                    }
                };
            }
        };
        if meta.permissions().mode() & S_IROTH == 0 {
            return Resolution::Forbidden;
        }
        if meta.is_dir() {
            return Resolution::Directory;
        }
        match Self::map(&real, meta.len()) {
            Ok(f) => Resolution::File(f),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Resolution::Forbidden,
            Err(e) => {
                warn!("Mapping {}: {e}", real.display());
                Resolution::Unmappable
            }
        }
    }

    /// Open, map, and close again. The mapping outlives the descriptor.
    fn map(real: &std::path::Path, len: u64) -> std::io::Result<MappedFile> {
        if len == 0 {
            return Ok(MappedFile { mmap: None });
        }
        let file = std::fs::File::open(real)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        Ok(MappedFile { mmap: Some(mmap) })
    }
}
