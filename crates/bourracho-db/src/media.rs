use anyhow::{Result, bail};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// 50 MB upload limit for media
pub const MAX_MEDIA_SIZE: usize = 50 * 1024 * 1024;

/// Location and digest of a stored blob.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub key: String,
    pub size: u64,
    pub sha256: String,
}

/// On-disk media blob store.
///
/// Each blob lives at `{media_dir}/{conversation_id}/{media_id}{ext}`. The key
/// handed back to callers is the path relative to `media_dir`.
pub struct MediaStorage {
    dir: PathBuf,
}

impl MediaStorage {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Media storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Backend-proxied URL clients use to fetch a media.
    pub fn url_for(media_id: &str) -> String {
        format!("/media/{}", media_id)
    }

    /// Resolve a storage key to a path inside the media directory.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid media key '{}'", key);
        }
        Ok(self.dir.join(relative))
    }

    pub async fn put(
        &self,
        conversation_id: &str,
        media_id: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<StoredBlob> {
        if data.is_empty() {
            bail!("empty media payload");
        }
        if data.len() > MAX_MEDIA_SIZE {
            bail!("media payload of {} bytes exceeds limit", data.len());
        }

        let key = format!(
            "{}/{}{}",
            conversation_id,
            media_id,
            extension_for(content_type)
        );
        let path = self.path_for(&key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let sha256 = hex::encode(Sha256::digest(data));
        Ok(StoredBlob {
            key,
            size: data.len() as u64,
            sha256,
        })
    }

    pub async fn open(&self, key: &str) -> Result<fs::File> {
        Ok(fs::File::open(self.path_for(key)?).await?)
    }

    /// Delete a blob. A blob that is already gone is not an error.
    pub async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)?).await {
            Ok(()) => {
                info!("Deleted media blob {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Media blob {} already gone", key);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// File extension for a MIME type, including the leading dot. Unknown
/// subtypes get no extension.
pub fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    match essence.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/heic" => ".heic",
        "audio/mpeg" | "audio/mp3" => ".mp3",
        "audio/ogg" => ".ogg",
        "audio/wav" | "audio/x-wav" => ".wav",
        "audio/webm" => ".weba",
        "audio/mp4" | "audio/aac" => ".m4a",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/quicktime" => ".mov",
        _ => "",
    }
}
