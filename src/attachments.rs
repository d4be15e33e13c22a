//! Collaborator interfaces for attachment resolution and image preparation.
//!
//! Converters only ever talk to these traits; the host supplies real
//! implementations (document extraction, transcription, downscaling).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Best-effort text extraction for file/audio/video attachments.
#[async_trait]
pub trait AttachmentReader: Send + Sync {
    /// Returns extracted text, or None when the attachment cannot be read.
    async fn read_text(&self, url: &str, kind: &str) -> Option<String>;
}

/// Local media preparation used before embedding image bytes in a request.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Downsize an image before base64 embedding. On failure the original
    /// path is returned unchanged.
    async fn compress_image(&self, path: &Path) -> PathBuf;

    /// Deterministic local-file to base64 conversion. Missing files yield
    /// None.
    async fn file_to_base64(&self, path: &Path) -> Option<String>;
}

/// An attachment reader that extracts nothing.
pub struct NoopAttachmentReader;

#[async_trait]
impl AttachmentReader for NoopAttachmentReader {
    async fn read_text(&self, _url: &str, _kind: &str) -> Option<String> {
        None
    }
}

/// A media store that embeds local files as-is, without compression.
pub struct LocalMedia;

#[async_trait]
impl MediaStore for LocalMedia {
    async fn compress_image(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    async fn file_to_base64(&self, path: &Path) -> Option<String> {
        let bytes = tokio::fs::read(path).await.ok()?;
        Some(STANDARD.encode(bytes))
    }
}

pub static NOOP_ATTACHMENTS: NoopAttachmentReader = NoopAttachmentReader;
pub static LOCAL_MEDIA: LocalMedia = LocalMedia;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_noop_reader_returns_none() {
        let reader = NoopAttachmentReader;
        assert_eq!(reader.read_text("file:///tmp/x.pdf", "file").await, None);
    }

    #[tokio::test]
    async fn test_local_media_base64() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let media = LocalMedia;
        let encoded = media.file_to_base64(file.path()).await.unwrap();
        assert_eq!(encoded, "YWJj");
    }

    #[tokio::test]
    async fn test_local_media_missing_file() {
        let media = LocalMedia;
        assert_eq!(
            media.file_to_base64(Path::new("/nonexistent/img.png")).await,
            None
        );
    }

    #[tokio::test]
    async fn test_compress_is_identity() {
        let media = LocalMedia;
        let path = Path::new("/tmp/a.png");
        assert_eq!(media.compress_image(path).await, path.to_path_buf());
    }
}
