//! Chunked transfers: receive-side reassembly and the file store.

use super::envelope::{DataBegin, DataEnd, Envelope, JSON_MIME};
use crate::utils::{PeerwayError, ProtocolError, Result, StorageError};
use std::path::{Path, PathBuf};

/// A transfer being received
#[derive(Debug)]
pub struct InboundTransfer {
    header: DataBegin,
    buffer: Vec<u8>,
}

/// A completed transfer
#[derive(Debug, PartialEq)]
pub enum Completed {
    /// Named payload to store
    File {
        /// Content type
        mime: String,
        /// Validated filename
        filename: String,
        /// Reassembled bytes
        bytes: Vec<u8>,
    },
    /// Unnamed JSON payload carrying an envelope
    Envelope(Envelope),
}

impl InboundTransfer {
    /// Start a transfer announced by `data.begin`
    pub fn begin(header: DataBegin, max_size: usize) -> Result<Self> {
        if header.size > max_size {
            return Err(ProtocolError::MessageTooLarge {
                size: header.size,
                max: max_size,
            }
            .into());
        }
        Ok(Self {
            buffer: Vec::with_capacity(header.size),
            header,
        })
    }

    /// Append one binary frame
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if self.buffer.len() + chunk.len() > self.header.size {
            return Err(PeerwayError::violation(format!(
                "transfer of {} exceeds its declared {} bytes",
                self.header.filename, self.header.size
            )));
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Bytes received so far
    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// Close the transfer on `data.end`
    pub fn finish(self, end: &DataEnd) -> Result<Completed> {
        if self.buffer.len() != self.header.size {
            return Err(PeerwayError::violation(format!(
                "transfer ended after {} of {} bytes",
                self.buffer.len(),
                self.header.size
            )));
        }

        if !end.filename.is_empty() {
            validate_filename(&end.filename)?;
            return Ok(Completed::File {
                mime: end.mime.clone(),
                filename: end.filename.clone(),
                bytes: self.buffer,
            });
        }

        if end.mime == JSON_MIME {
            let text = String::from_utf8(self.buffer).map_err(|_| ProtocolError::InvalidMessage {
                reason: "JSON transfer is not UTF-8".to_string(),
            })?;
            return Envelope::from_json(&text).map(Completed::Envelope);
        }

        Err(PeerwayError::violation(format!(
            "unnamed transfer with mime {}",
            end.mime
        )))
    }
}

/// Reject names that could leave the per-category directory
pub fn validate_filename(filename: &str) -> Result<()> {
    let bad = filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename == "."
        || filename == ".."
        || filename.contains('\0');
    if bad {
        return Err(ProtocolError::InvalidFilename {
            filename: filename.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Files received from or served to peers, namespaced by MIME category
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name for a MIME type (`image/png` → `image`)
    pub fn category(mime: &str) -> &str {
        let category = mime.split('/').next().unwrap_or_default();
        let clean = !category.is_empty()
            && category
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+');
        if clean {
            category
        } else {
            "other"
        }
    }

    /// Location of a stored file
    pub fn path_for(&self, mime: &str, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;
        Ok(self.root.join(Self::category(mime)).join(filename))
    }

    /// Write a file, replacing any previous content
    pub async fn save(&self, mime: &str, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(mime, filename)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        log::debug!("Stored {} bytes at {}", bytes.len(), path.display());
        Ok(path)
    }

    /// Read a stored file
    pub async fn read(&self, mime: &str, filename: &str) -> Result<Vec<u8>> {
        let path = self.path_for(mime, filename)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    key: path.display().to_string(),
                }
                .into()
            } else {
                e.into()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn begin(size: usize, filename: &str, mime: &str) -> DataBegin {
        DataBegin {
            mime: mime.to_string(),
            size,
            filename: filename.to_string(),
        }
    }

    fn end(filename: &str, mime: &str) -> DataEnd {
        DataEnd {
            mime: mime.to_string(),
            filename: filename.to_string(),
        }
    }

    #[test]
    fn test_reassembles_named_file() {
        let mut transfer =
            InboundTransfer::begin(begin(5, "f.bin", "application/octet-stream"), 100).unwrap();
        transfer.append(&[1, 2]).unwrap();
        transfer.append(&[3, 4, 5]).unwrap();
        assert_eq!(transfer.received(), 5);

        match transfer.finish(&end("f.bin", "application/octet-stream")).unwrap() {
            Completed::File { filename, bytes, .. } => {
                assert_eq!(filename, "f.bin");
                assert_eq!(bytes, vec![1, 2, 3, 4, 5]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unnamed_json_becomes_envelope() {
        let body = br#"{"type":"post.response.begin","post":{}}"#;
        let mut transfer = InboundTransfer::begin(begin(body.len(), "", JSON_MIME), 1024).unwrap();
        transfer.append(body).unwrap();

        match transfer.finish(&end("", JSON_MIME)).unwrap() {
            Completed::Envelope(envelope) => assert_eq!(envelope.kind, "post.response.begin"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unnamed_binary_is_a_violation() {
        let mut transfer = InboundTransfer::begin(begin(1, "", "image/png"), 10).unwrap();
        transfer.append(&[9]).unwrap();
        assert!(transfer.finish(&end("", "image/png")).is_err());
    }

    #[test]
    fn test_size_guards() {
        assert!(InboundTransfer::begin(begin(11, "a", "image/png"), 10).is_err());

        let mut transfer = InboundTransfer::begin(begin(2, "a", "image/png"), 10).unwrap();
        assert!(transfer.append(&[1, 2, 3]).is_err());

        let short = InboundTransfer::begin(begin(2, "a", "image/png"), 10).unwrap();
        assert!(short.finish(&end("a", "image/png")).is_err());
    }

    #[test]
    fn test_filename_rejection() {
        for name in ["", "../x", "a/b", "a\\b", "..", "."] {
            let err = validate_filename(name).unwrap_err();
            assert!(err.is_security_violation(), "{name} should be rejected");
        }
        assert!(validate_filename("avatar.png").is_ok());
        assert!(validate_filename("..hidden").is_ok());
    }

    #[test]
    fn test_category() {
        assert_eq!(FileStore::category("image/png"), "image");
        assert_eq!(FileStore::category("application/json"), "application");
        assert_eq!(FileStore::category("../etc/passwd"), "other");
        assert_eq!(FileStore::category(""), "other");
    }

    #[tokio::test]
    async fn test_save_and_read() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let path = store.save("image/png", "a.png", &[1, 2, 3]).await.unwrap();
        assert_eq!(path, dir.path().join("image").join("a.png"));
        assert_eq!(store.read("image/png", "a.png").await.unwrap(), vec![1, 2, 3]);
        assert!(store.read("image/png", "missing.png").await.is_err());
        assert!(store.save("image/png", "../a.png", &[1]).await.is_err());
    }
}
