//! Streaming blob writer.
//!
//! Content is copied into a temp file under `.tmp/` while SHA-256 is
//! computed incrementally. Its hex form is the ETag and its base64 form the
//! checksum. Nothing is visible
//! until [`StagedBlob::persist`] renames the finished file into place.

use std::path::Path;

use base64::prelude::{Engine, BASE64_STANDARD};
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::errors::StoreError;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

pub(crate) struct BlobWriter {
    file: tokio::fs::File,
    path: TempPath,
    sha256: Sha256,
    size: u64,
}

impl BlobWriter {
    pub fn create(tmp_dir: &Path) -> Result<Self, StoreError> {
        let (file, path) = tempfile::Builder::new()
            .prefix("blob-")
            .tempfile_in(tmp_dir)?
            .into_parts();
        Ok(Self {
            file: tokio::fs::File::from_std(file),
            path,
            sha256: Sha256::new(),
            size: 0,
        })
    }

    /// Append everything `reader` yields. Returns the number of bytes copied.
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            self.sha256.update(chunk);
            self.file.write_all(chunk).await?;
            copied += n as u64;
        }
        self.size += copied;
        Ok(copied)
    }

    pub async fn finish(mut self) -> Result<StagedBlob, StoreError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(StagedBlob {
            path: self.path,
            size: self.size,
            sha256: self.sha256.finalize().into(),
        })
    }
}

/// A fully written and synced blob waiting to be published. Dropping it
/// deletes the temp file.
pub(crate) struct StagedBlob {
    path: TempPath,
    pub size: u64,
    pub sha256: [u8; 32],
}

impl StagedBlob {
    pub fn etag(&self) -> String {
        hex::encode(self.sha256)
    }

    pub fn checksum_sha256(&self) -> String {
        BASE64_STANDARD.encode(self.sha256)
    }

    /// Fail with `ChecksumMismatch` unless the content hashes to `expected`.
    pub fn verify_sha256(&self, expected: &[u8; 32]) -> Result<(), StoreError> {
        if &self.sha256 == expected {
            return Ok(());
        }
        Err(StoreError::ChecksumMismatch {
            expected: BASE64_STANDARD.encode(expected),
            computed: self.checksum_sha256(),
        })
    }

    /// Atomically rename the blob to `dest`.
    pub fn persist(self, dest: &Path) -> std::io::Result<()> {
        self.path.persist(dest).map_err(|err| err.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hashes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BlobWriter::create(dir.path()).unwrap();
        writer.copy_from(&mut &b"hello "[..]).await.unwrap();
        writer.copy_from(&mut &b"world"[..]).await.unwrap();
        let staged = writer.finish().await.unwrap();

        assert_eq!(staged.size, 11);
        assert_eq!(staged.etag(), "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
        assert_eq!(
            staged.checksum_sha256(),
            "uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek="
        );

        let dest = dir.path().join("final");
        staged.persist(&dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BlobWriter::create(dir.path()).unwrap();
        writer.copy_from(&mut &b"payload"[..]).await.unwrap();
        let staged = writer.finish().await.unwrap();

        let err = staged.verify_sha256(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
        drop(staged);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
