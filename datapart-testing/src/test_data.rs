//! Generating files to upload.
use crate::Result;
use bytes::Bytes;
use rand::prelude::*;
use std::path::{Path, PathBuf};

/// `len` bytes of random data.
///
/// Random rather than repeating content, so a part landing at the wrong offset is detected when
/// the assembled object is compared with the original.
pub fn random_bytes(len: usize) -> Bytes {
    let mut rand = rand::thread_rng();
    let mut data = vec![0u8; len];
    rand.fill_bytes(&mut data);

    Bytes::from(data)
}

/// Write `len` random bytes to a file `name` in `dir`, returning its path and contents
pub async fn make_test_file(dir: &Path, name: &str, len: usize) -> Result<(PathBuf, Bytes)> {
    let path = dir.join(name);
    let data = random_bytes(len);

    tokio::fs::write(&path, &data).await?;

    Ok((path, data))
}
