//! Temporary staging of part bodies.
//!
//! A part body is streamed from the request into a named temp file so
//! that large parts never sit in memory.  The [`StagedPart`] guard owns
//! the file; dropping it deletes the file, whether the upload succeeded,
//! the remote store failed, or the request future was dropped because
//! the client went away.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::errors::UploadError;
use crate::gateway::backend::PartPayload;

/// A part body staged on disk.  The file lives as long as this guard.
#[derive(Debug)]
pub struct StagedPart {
    file: NamedTempFile,
    size: u64,
}

impl StagedPart {
    /// Staged size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Payload referencing the staged file.  Valid while `self` is alive.
    pub fn payload(&self) -> PartPayload {
        PartPayload::File {
            path: self.file.path().to_path_buf(),
            size: self.size,
        }
    }
}

/// Streams request bodies into temp files.
#[derive(Debug, Clone)]
pub struct Stager {
    dir: Option<PathBuf>,
    chunk_size: usize,
    max_size: u64,
}

impl Stager {
    pub fn new(dir: Option<PathBuf>, chunk_size: usize, max_size: u64) -> Self {
        Self {
            dir,
            chunk_size: chunk_size.max(1),
            max_size,
        }
    }

    fn create_file(&self) -> std::io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("partkeeper-part-");
        match &self.dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempfile_in(dir)
            }
            None => builder.tempfile(),
        }
    }

    /// Drain `body` into a new temp file, writing in `chunk_size`
    /// batches.  Fails with [`UploadError::PartTooLarge`] as soon as the
    /// body exceeds the configured maximum; the partial file is removed.
    pub async fn stage<S, E>(&self, body: S) -> Result<StagedPart, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let file = self
            .create_file()
            .map_err(|e| anyhow::anyhow!("failed to create staging file: {e}"))?;
        let handle = file
            .reopen()
            .map_err(|e| anyhow::anyhow!("failed to open staging file: {e}"))?;
        let mut out = tokio::fs::File::from_std(handle);

        let mut body = std::pin::pin!(body);
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        let mut size: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| UploadError::InvalidArgument {
                message: format!("Failed to read request body: {e}"),
            })?;
            size += chunk.len() as u64;
            if size > self.max_size {
                return Err(UploadError::PartTooLarge {
                    limit: self.max_size,
                });
            }
            buffer.extend_from_slice(&chunk);
            if buffer.len() >= self.chunk_size {
                out.write_all(&buffer)
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to write staging file: {e}"))?;
                buffer.clear();
            }
        }

        if !buffer.is_empty() {
            out.write_all(&buffer)
                .await
                .map_err(|e| anyhow::anyhow!("failed to write staging file: {e}"))?;
        }
        out.flush()
            .await
            .map_err(|e| anyhow::anyhow!("failed to flush staging file: {e}"))?;

        tracing::debug!(path = %file.path().display(), size, "part body staged");
        Ok(StagedPart { file, size })
    }
}
