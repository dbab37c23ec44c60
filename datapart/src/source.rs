//! Byte-addressable inputs to an upload.
//!
//! The upload coordinator never reads a source sequentially; each part reads exactly the byte
//! range it is responsible for, possibly out of order and concurrently with other parts.
use crate::Result;
use bytes::Bytes;
use snafu::prelude::*;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Something that can be uploaded: it has a name, a known size, and supports reads of arbitrary
/// byte ranges.
///
/// The name and size together form the fingerprint that decides whether a persisted upload
/// session still belongs to this source.
#[async_trait::async_trait]
pub trait UploadSource: std::fmt::Debug + Sync + Send + 'static {
    /// The file name, without any directory components
    fn name(&self) -> &str;

    /// Total size in bytes
    fn size(&self) -> u64;

    /// Read exactly the bytes in `range`.
    ///
    /// Fails if the range extends past the end of the source.
    async fn read_range(&self, range: Range<u64>) -> Result<Bytes>;
}

/// A file on the local filesystem.
///
/// Each range read opens its own handle so concurrent part reads never contend on a shared seek
/// position.
#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
}

impl FileSource {
    /// Open the file at `path`, capturing its size and file name.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|_| crate::error::OpenSourceSnafu { path: path.clone() })?;

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        Ok(Self {
            name,
            size: metadata.len(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl UploadSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        ensure_in_bounds(&self.name, self.size, &range)?;

        let len = range.end - range.start;
        let context = || crate::error::ReadSourceSnafu {
            name: self.name.clone(),
            offset: range.start,
            len,
        };

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|_| context())?;
        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .with_context(|_| context())?;

        let mut buffer = vec![0u8; len as usize];
        file.read_exact(&mut buffer)
            .await
            .with_context(|_| context())?;

        Ok(Bytes::from(buffer))
    }
}

/// An in-memory source, mostly useful for tests and for callers which already hold the data.
#[derive(Clone, Debug)]
pub struct BytesSource {
    name: String,
    data: Bytes,
}

impl BytesSource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait::async_trait]
impl UploadSource for BytesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        ensure_in_bounds(&self.name, self.size(), &range)?;

        // `Bytes::slice` is a ref count bump, no copy
        Ok(self.data.slice(range.start as usize..range.end as usize))
    }
}

fn ensure_in_bounds(name: &str, size: u64, range: &Range<u64>) -> Result<()> {
    ensure!(
        range.start <= range.end && range.end <= size,
        crate::error::SourceRangeOutOfBoundsSnafu {
            name,
            start: range.start,
            end: range.end,
            size,
        }
    );

    Ok(())
}
