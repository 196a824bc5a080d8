//! Product image storage.
//!
//! Create and update requests may carry an `imagen` file. The HTTP layer
//! checks it with [`check_upload`] before anything reaches the ledger, then
//! hands it to an [`ImageStore`]. An update replaces the stored image under
//! the same public id. Images are removed after a create or update that did
//! not go through, and after a successful delete.

use alloy::primitives::{Bytes, hex, keccak256};
use async_trait::async_trait;
use std::path::PathBuf;

pub const IMAGE_FIELD: &str = "imagen";
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif"];
pub const MAX_IMAGE_KB: usize = 600;

/// CDN identifier of an image: the last path segment of its URL without
/// the extension.
pub fn public_id(url: &str) -> Option<&str> {
    let name = url.trim().rsplit('/').next()?;
    let id = name.split('.').next()?;
    (!id.is_empty()).then_some(id)
}

/// An image file received with a create or update request.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl ImageUpload {
    /// Lowercase extension taken from the MIME subtype, or from the file
    /// name when no content type was sent.
    pub fn extension(&self) -> Option<String> {
        let from_mime = self
            .content_type
            .as_deref()
            .and_then(|mime| mime.split(';').next())
            .and_then(|mime| mime.trim().rsplit('/').next());
        let from_name = self
            .file_name
            .as_deref()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, extension)| extension);
        from_mime
            .or(from_name)
            .map(|extension| extension.trim().to_ascii_lowercase())
            .filter(|extension| !extension.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Only jpg, jpeg, png and gif images are accepted.")]
    UnsupportedType,
    #[error("The image must not exceed {} KB.", MAX_IMAGE_KB)]
    TooLarge,
    #[error("cannot store image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Accepts jpg, jpeg, png and gif files up to [`MAX_IMAGE_KB`].
/// Returns the extension the image is stored under.
pub fn check_upload(upload: &ImageUpload) -> Result<String, ImageError> {
    let extension = upload
        .extension()
        .filter(|extension| IMAGE_EXTENSIONS.contains(&extension.as_str()))
        .ok_or(ImageError::UnsupportedType)?;
    if upload.bytes.len() > MAX_IMAGE_KB * 1024 {
        return Err(ImageError::TooLarge);
    }
    Ok(extension)
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Stores `file` and returns its public URL. When `replacing` is the URL
    /// of a stored image, its public id is reused.
    async fn upload(&self, file: ImageUpload, replacing: Option<&str>) -> Result<String, ImageError>;

    /// Removes the image at `url`. Failures are logged, never returned.
    async fn remove(&self, url: &str);
}

/// Keeps images in a local directory published under `public_url`.
#[derive(Debug, Clone)]
pub struct DiskImageStore {
    dir: PathBuf,
    public_url: String,
}

impl DiskImageStore {
    pub fn new(dir: impl Into<PathBuf>, public_url: &str) -> Self {
        Self {
            dir: dir.into(),
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Stored file name of `url`, if it is one of ours.
    fn file_name<'a>(&self, url: &'a str) -> Option<&'a str> {
        let name = url.trim().strip_prefix(&self.public_url)?.strip_prefix('/')?;
        (!name.is_empty() && !name.contains(['/', '\\']) && !name.starts_with('.'))
            .then_some(name)
    }
}

#[async_trait]
impl ImageStore for DiskImageStore {
    async fn upload(&self, file: ImageUpload, replacing: Option<&str>) -> Result<String, ImageError> {
        let extension = check_upload(&file)?;
        let replaced = replacing.and_then(|url| self.file_name(url));
        let id = match replaced.and_then(public_id) {
            Some(id) => id.to_string(),
            None => hex::encode(&keccak256(&file.bytes)[..12]),
        };
        let name = format!("{id}.{extension}");

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| ImageError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let path = self.dir.join(&name);
        tokio::fs::write(&path, &file.bytes)
            .await
            .map_err(|source| ImageError::Io { path, source })?;

        if let Some(old) = replaced.filter(|old| *old != name) {
            if let Err(err) = tokio::fs::remove_file(self.dir.join(old)).await {
                tracing::warn!(error = %err, image = old, "Failed to remove replaced image");
            }
        }
        tracing::info!(image = %name, size = file.bytes.len(), "Image stored");
        Ok(format!("{}/{}", self.public_url, name))
    }

    async fn remove(&self, url: &str) {
        let Some(name) = self.file_name(url) else {
            tracing::debug!(url, "Not a stored image, nothing to remove");
            return;
        };
        match tokio::fs::remove_file(self.dir.join(name)).await {
            Ok(()) => tracing::info!(image = name, "Image removed"),
            Err(err) => tracing::warn!(error = %err, image = name, "Failed to remove image"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // ── helpers ──────────────────────────────────────────────────────────

    /// Records every upload and removal. Uploads land on `https://cdn.example/`.
    #[derive(Default)]
    pub(crate) struct RecordingImageStore {
        pub uploaded: Mutex<Vec<(ImageUpload, Option<String>)>>,
        pub removed: Mutex<Vec<String>>,
        pub fail_uploads: AtomicBool,
        next: AtomicUsize,
    }

    #[async_trait]
    impl ImageStore for RecordingImageStore {
        async fn upload(&self, file: ImageUpload, replacing: Option<&str>) -> Result<String, ImageError> {
            let extension = check_upload(&file)?;
            self.uploaded
                .lock()
                .unwrap()
                .push((file, replacing.map(str::to_string)));
            if self.fail_uploads.load(Ordering::SeqCst) {
                return Err(ImageError::Io {
                    path: PathBuf::from("cdn"),
                    source: std::io::Error::other("unreachable"),
                });
            }
            let id = match replacing.and_then(public_id) {
                Some(id) => id.to_string(),
                None => format!("upload-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1),
            };
            Ok(format!("https://cdn.example/{id}.{extension}"))
        }

        async fn remove(&self, url: &str) {
            self.removed.lock().unwrap().push(url.to_string());
        }
    }

    pub(crate) fn upload(file_name: &str, content_type: Option<&str>, size: usize) -> ImageUpload {
        ImageUpload {
            file_name: Some(file_name.to_string()),
            content_type: content_type.map(str::to_string),
            bytes: Bytes::from(vec![0x89; size]),
        }
    }

    // ── tests ───────────────────────────────────────────────────────────

    #[test]
    fn test_public_id() {
        assert_eq!(
            public_id("https://res.cloudinary.com/demo/image/upload/v1/lamp_x1y2.png"),
            Some("lamp_x1y2")
        );
        assert_eq!(public_id("lamp.tar.gz"), Some("lamp"));
        assert_eq!(public_id("plain"), Some("plain"));
        assert_eq!(public_id(""), None);
        assert_eq!(public_id("https://cdn.example/"), None);
    }

    #[test]
    fn test_extension_prefers_content_type() {
        assert_eq!(
            upload("lamp.png", Some("image/JPEG"), 1).extension().as_deref(),
            Some("jpeg")
        );
        assert_eq!(upload("lamp.GIF", None, 1).extension().as_deref(), Some("gif"));
        assert_eq!(upload("lamp", None, 1).extension(), None);
    }

    #[test]
    fn test_check_upload_rules() {
        for (name, mime) in [
            ("a.jpg", "image/jpg"),
            ("a.jpeg", "image/jpeg"),
            ("a.png", "image/png"),
            ("a.gif", "image/gif"),
        ] {
            assert!(check_upload(&upload(name, Some(mime), 10)).is_ok(), "{mime}");
        }
        assert!(matches!(
            check_upload(&upload("a.bmp", Some("image/bmp"), 10)),
            Err(ImageError::UnsupportedType)
        ));
        assert!(matches!(
            check_upload(&upload("a.png", Some("application/pdf"), 10)),
            Err(ImageError::UnsupportedType)
        ));
        assert!(check_upload(&upload("a.png", Some("image/png"), 600 * 1024)).is_ok());
        assert!(matches!(
            check_upload(&upload("a.png", Some("image/png"), 600 * 1024 + 1)),
            Err(ImageError::TooLarge)
        ));
    }

    #[tokio::test]
    async fn test_disk_store_upload_replace_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskImageStore::new(dir.path().join("uploads"), "/uploads/");

        let first = store
            .upload(upload("lamp.png", Some("image/png"), 32), None)
            .await
            .unwrap();
        let name = first.strip_prefix("/uploads/").unwrap();
        assert!(name.ends_with(".png"));
        assert!(dir.path().join("uploads").join(name).exists());

        // same public id, new extension; the old file goes away
        let replaced = store
            .upload(upload("lamp.jpg", Some("image/jpeg"), 16), Some(&first))
            .await
            .unwrap();
        assert_eq!(public_id(&replaced), public_id(&first));
        assert!(replaced.ends_with(".jpeg"));
        assert!(!dir.path().join("uploads").join(name).exists());

        store.remove(&replaced).await;
        let stored = replaced.strip_prefix("/uploads/").unwrap();
        assert!(!dir.path().join("uploads").join(stored).exists());
    }

    #[tokio::test]
    async fn test_disk_store_ignores_foreign_urls() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("keep.png");
        std::fs::write(&outside, b"x").unwrap();
        let store = DiskImageStore::new(dir.path().join("uploads"), "/uploads");

        store.remove("https://cdn.example/keep.png").await;
        store.remove("/uploads/../keep.png").await;
        assert!(outside.exists());

        let fresh = store
            .upload(upload("a.gif", Some("image/gif"), 8), Some("https://cdn.example/keep.png"))
            .await
            .unwrap();
        assert_ne!(public_id(&fresh), Some("keep"));
    }

    #[tokio::test]
    async fn test_disk_store_rejects_unchecked_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskImageStore::new(dir.path(), "/uploads");
        let err = store
            .upload(upload("a.svg", Some("image/svg+xml"), 8), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedType));
    }
}
