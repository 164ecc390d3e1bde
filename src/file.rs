//! File handles returned by [`FileStorage::open`].
//!
//! A handle is either a reader over one object, fetched lazily on the
//! first read, or a writer backed by an [`UploadSession`].
//!
//! [`FileStorage::open`]: crate::filestore::FileStorage::open

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::{StorageError, StorageResult};
use crate::storage::backend::ObjectStoreClient;
use crate::upload::{CloseOutcome, UploadSession};

/// Direction a file is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

impl FromStr for OpenMode {
    type Err = StorageError;

    /// Parse a `fopen`-style mode string such as `"rb"` or `"w"`.
    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        if mode.contains('a') || mode.contains('+') {
            return Err(StorageError::invalid_mode(format!(
                "unsupported file mode '{mode}': append and update modes are not supported"
            )));
        }
        if mode.contains('w') {
            Ok(OpenMode::Write)
        } else if mode.contains('r') {
            Ok(OpenMode::Read)
        } else {
            Err(StorageError::invalid_mode(format!(
                "unsupported file mode '{mode}'"
            )))
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenMode::Read => f.write_str("rb"),
            OpenMode::Write => f.write_str("wb"),
        }
    }
}

struct Reader {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    key: String,
    data: Option<Bytes>,
    pos: usize,
    closed: bool,
}

impl Reader {
    async fn loaded(&mut self) -> StorageResult<&Bytes> {
        if self.closed {
            return Err(StorageError::UseAfterClose {
                key: self.key.clone(),
            });
        }
        if self.data.is_none() {
            let body = self.client.get_object(&self.bucket, &self.key).await?;
            self.data = Some(body);
        }
        Ok(self.data.get_or_insert_with(Bytes::new))
    }
}

enum Handle {
    Read(Reader),
    Write(UploadSession),
}

/// An open file in a bucket.
pub struct S3File {
    name: String,
    handle: Handle,
}

impl S3File {
    pub(crate) fn reader(
        name: String,
        client: Arc<dyn ObjectStoreClient>,
        bucket: String,
        key: String,
    ) -> Self {
        Self {
            name,
            handle: Handle::Read(Reader {
                client,
                bucket,
                key,
                data: None,
                pos: 0,
                closed: false,
            }),
        }
    }

    pub(crate) fn writer(name: String, session: UploadSession) -> Self {
        Self {
            name,
            handle: Handle::Write(session),
        }
    }

    /// Storage name the file was opened with (cleaned, without location).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> OpenMode {
        match self.handle {
            Handle::Read(_) => OpenMode::Read,
            Handle::Write(_) => OpenMode::Write,
        }
    }

    /// Upload session behind a write handle.
    pub fn upload(&self) -> Option<&UploadSession> {
        match &self.handle {
            Handle::Write(session) => Some(session),
            Handle::Read(_) => None,
        }
    }

    /// Read up to `n` bytes from the current position.
    pub async fn read(&mut self, n: usize) -> StorageResult<Bytes> {
        let reader = self.reader_mut()?;
        let pos = reader.pos;
        let data = reader.loaded().await?;
        let end = pos.saturating_add(n).min(data.len());
        let chunk = data.slice(pos.min(end)..end);
        reader.pos = end;
        Ok(chunk)
    }

    /// Read everything from the current position to the end.
    pub async fn read_to_end(&mut self) -> StorageResult<Bytes> {
        self.read(usize::MAX).await
    }

    /// Object size for readers, bytes written so far for writers.
    pub async fn size(&mut self) -> StorageResult<u64> {
        match &mut self.handle {
            Handle::Read(reader) => Ok(reader.loaded().await?.len() as u64),
            Handle::Write(session) => Ok(session.bytes_written()),
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        match &mut self.handle {
            Handle::Write(session) => session.write(data).await,
            Handle::Read(_) => Err(StorageError::invalid_mode(format!(
                "file '{}' is not open for writing",
                self.name
            ))),
        }
    }

    /// Close the file.  Writers commit their upload and report what was
    /// done; readers release their buffer.
    pub async fn close(&mut self) -> StorageResult<Option<CloseOutcome>> {
        match &mut self.handle {
            Handle::Write(session) => session.close().await.map(Some),
            Handle::Read(reader) => {
                if reader.closed {
                    return Err(StorageError::UseAfterClose {
                        key: reader.key.clone(),
                    });
                }
                reader.closed = true;
                reader.data = None;
                Ok(None)
            }
        }
    }

    /// Discard a write handle without committing, aborting any multipart
    /// upload.
    pub async fn abort(&mut self) -> StorageResult<()> {
        if let Handle::Write(session) = &mut self.handle {
            return session.abort().await;
        }
        self.close().await.map(|_| ())
    }

    fn reader_mut(&mut self) -> StorageResult<&mut Reader> {
        match &mut self.handle {
            Handle::Read(reader) => Ok(reader),
            Handle::Write(_) => Err(StorageError::invalid_mode(format!(
                "file '{}' is not open for reading",
                self.name
            ))),
        }
    }
}
