use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::FilterType;
use image::DynamicImage;
use sha1::{Digest, Sha1};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{FsError, FsResult};
use crate::storage::StorageBackend;

const ALLOWED_EXTS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "bmp", "tiff"];
const MAX_SOURCE_SIZE: u64 = 200 * 1024 * 1024;
const WEBP_QUALITY: f32 = 80.0;

pub fn is_image_filename(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbFit {
    /// Scale the shortest side to meet the target, then center-crop.
    Cover,
    /// Scale so both sides fit inside the target box.
    Contain,
}

impl ThumbFit {
    pub fn parse(value: &str) -> FsResult<Self> {
        match value {
            "cover" => Ok(ThumbFit::Cover),
            "contain" => Ok(ThumbFit::Contain),
            other => Err(FsError::InvalidArgument(format!(
                "unknown fit mode: {}",
                other
            ))),
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            ThumbFit::Cover => "cover",
            ThumbFit::Contain => "contain",
        }
    }
}

/// Content-addressed cache key. Any change in source identity (adapter, path,
/// size, mtime) or output shape (dimensions, fit) produces a new key;
/// identical keys imply identical inputs, so cached files never go stale.
pub fn cache_key(
    adapter_id: Uuid,
    rel: &str,
    size: u64,
    mtime: i64,
    w: u32,
    h: u32,
    fit: ThumbFit,
) -> String {
    let raw = format!(
        "{}|{}|{}|{}|{}x{}|{}",
        adapter_id,
        rel,
        size,
        mtime,
        w,
        h,
        fit.tag()
    );
    format!("{:x}", Sha1::digest(raw.as_bytes()))
}

/// On-disk thumbnail cache under `<data>/.thumb_cache`, sharded two levels
/// deep by key prefix.
pub struct ThumbnailService {
    cache_root: PathBuf,
}

impl ThumbnailService {
    pub fn new(data_dir: &str) -> Self {
        ThumbnailService {
            cache_root: Path::new(data_dir).join(".thumb_cache"),
        }
    }

    pub fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_root
            .join(&key[0..2])
            .join(&key[2..4])
            .join(format!("{}.webp", key))
    }

    /// Return the cached thumbnail for the source file, generating and
    /// caching it on a miss. Concurrent identical requests may both compute;
    /// the atomic rename makes the second write harmless.
    pub async fn get_or_create(
        &self,
        backend: &Arc<dyn StorageBackend>,
        adapter_id: Uuid,
        root: &str,
        rel: &str,
        w: u32,
        h: u32,
        fit: ThumbFit,
    ) -> FsResult<(Vec<u8>, &'static str, String)> {
        if w == 0 || h == 0 {
            return Err(FsError::InvalidArgument("zero thumbnail dimension".into()));
        }
        let meta = backend.stat_file(root, rel).await?;
        if meta.is_dir {
            return Err(FsError::IsADirectory(rel.to_string()));
        }
        if meta.size > MAX_SOURCE_SIZE {
            return Err(FsError::InvalidArgument(
                "source too large for thumbnailing".into(),
            ));
        }

        let key = cache_key(adapter_id, rel, meta.size, meta.mtime, w, h, fit);
        let path = self.cache_path(&key);
        if let Ok(bytes) = tokio::fs::read(&path).await {
            debug!("thumbnail cache hit for {} ({})", rel, key);
            return Ok((bytes, "image/webp", key));
        }

        let source = backend.read_file(root, rel).await?;
        // Decode and resample are CPU-bound; keep them off the request path.
        let thumb = tokio::task::spawn_blocking(move || generate_thumb(&source, w, h, fit))
            .await
            .map_err(|e| FsError::internal(e.to_string()))??;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, &thumb).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok((thumb, "image/webp", key))
    }
}

pub fn generate_thumb(data: &[u8], w: u32, h: u32, fit: ThumbFit) -> FsResult<Vec<u8>> {
    let img = image::load_from_memory(data)?;
    let resized = match fit {
        ThumbFit::Cover => {
            let im_ratio = img.width() as f64 / img.height() as f64;
            let target_ratio = w as f64 / h as f64;
            let (new_w, new_h) = if im_ratio > target_ratio {
                ((h as f64 * im_ratio).round() as u32, h)
            } else {
                (w, (w as f64 / im_ratio).round() as u32)
            };
            let scaled = img.resize_exact(new_w.max(1), new_h.max(1), FilterType::Lanczos3);
            let left = scaled.width().saturating_sub(w) / 2;
            let top = scaled.height().saturating_sub(h) / 2;
            scaled.crop_imm(left, top, w.min(scaled.width()), h.min(scaled.height()))
        }
        ThumbFit::Contain => img.thumbnail(w, h),
    };

    let rgba = DynamicImage::ImageRgba8(resized.to_rgba8());
    let encoder = webp::Encoder::from_image(&rgba)
        .map_err(|e| FsError::internal(format!("webp encode setup failed: {}", e)))?;
    Ok(encoder.encode(WEBP_QUALITY).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_image_filenames() {
        assert!(is_image_filename("photo.JPG"));
        assert!(is_image_filename("a.b.webp"));
        assert!(!is_image_filename("notes.txt"));
        assert!(!is_image_filename("noextension"));
    }

    #[test]
    fn key_is_deterministic_and_input_sensitive() {
        let id = Uuid::nil();
        let a = cache_key(id, "x/y.jpg", 100, 5, 64, 64, ThumbFit::Cover);
        let b = cache_key(id, "x/y.jpg", 100, 5, 64, 64, ThumbFit::Cover);
        assert_eq!(a, b);

        // Every input participates in the key.
        assert_ne!(a, cache_key(id, "x/z.jpg", 100, 5, 64, 64, ThumbFit::Cover));
        assert_ne!(a, cache_key(id, "x/y.jpg", 101, 5, 64, 64, ThumbFit::Cover));
        assert_ne!(a, cache_key(id, "x/y.jpg", 100, 6, 64, 64, ThumbFit::Cover));
        assert_ne!(a, cache_key(id, "x/y.jpg", 100, 5, 65, 64, ThumbFit::Cover));
        assert_ne!(a, cache_key(id, "x/y.jpg", 100, 5, 64, 64, ThumbFit::Contain));
        assert_ne!(
            a,
            cache_key(Uuid::new_v4(), "x/y.jpg", 100, 5, 64, 64, ThumbFit::Cover)
        );
    }

    #[test]
    fn cache_paths_are_sharded() {
        let service = ThumbnailService::new("/data");
        let path = service.cache_path("abcdef0123");
        assert_eq!(
            path,
            PathBuf::from("/data/.thumb_cache/ab/cd/abcdef0123.webp")
        );
    }

    #[test]
    fn cover_crops_to_exact_dimensions() {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            120,
            80,
            image::Rgb([10, 20, 30]),
        ));
        let mut png = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut png),
            image::ImageFormat::Png,
        )
        .unwrap();

        let thumb = generate_thumb(&png, 40, 40, ThumbFit::Cover).unwrap();
        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 40));
    }

    #[test]
    fn contain_preserves_aspect_ratio() {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            200,
            100,
            image::Rgb([1, 2, 3]),
        ));
        let mut png = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut png),
            image::ImageFormat::Png,
        )
        .unwrap();

        let thumb = generate_thumb(&png, 50, 50, ThumbFit::Contain).unwrap();
        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (50, 25));
    }
}
