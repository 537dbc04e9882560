//! Thumbnails for image uploads.
//!
//! While the source streams to its backend a [`CaptureReader`] keeps a copy
//! (up to a size cap). Once the write succeeds the copy is rendered to a PNG
//! and stored as `thumbnail_{name}.png` next to the source.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use stowage_core::config::ThumbnailSettings;
use stowage_core::{FileMetadata, ThumbnailScale};
use tokio::io::{AsyncRead, ReadBuf};

pub trait ThumbnailGenerator: Send + Sync {
    fn supports(&self, mime_type: &str) -> bool;

    /// Render `data` as a PNG of the given scale.
    fn generate(&self, data: &[u8], scale: ThumbnailScale) -> Result<Bytes, anyhow::Error>;
}

/// A generator plus when and how large to use it.
#[derive(Clone)]
pub struct Thumbnails {
    generator: Arc<dyn ThumbnailGenerator>,
    scale: ThumbnailScale,
    force_enabled: bool,
    max_source_bytes: u64,
}

impl Thumbnails {
    pub fn new(generator: Arc<dyn ThumbnailGenerator>, settings: &ThumbnailSettings) -> Self {
        Self {
            generator,
            scale: settings.default_scale,
            force_enabled: settings.force_enabled,
            max_source_bytes: settings.max_source_bytes,
        }
    }

    pub fn scale(&self) -> ThumbnailScale {
        self.scale
    }

    /// Requested (or forced) and of a type the generator can decode.
    pub fn wanted_for(&self, file: &FileMetadata) -> bool {
        (self.force_enabled || file.generate_thumbnail) && self.generator.supports(&file.mime_type)
    }

    pub fn capture<R>(&self, inner: R) -> (CaptureReader<R>, Captured) {
        capture(inner, self.max_source_bytes)
    }

    /// Render captured bytes off the async runtime. `None` when the source
    /// was too large or could not be decoded.
    pub async fn render(&self, captured: Captured, name: &str) -> Option<Bytes> {
        let Some(data) = captured.take() else {
            tracing::debug!(
                file_name = name,
                max_bytes = self.max_source_bytes,
                "Source too large for a thumbnail"
            );
            return None;
        };
        let generator = Arc::clone(&self.generator);
        let scale = self.scale;
        match tokio::task::spawn_blocking(move || generator.generate(&data, scale)).await {
            Ok(Ok(png)) => Some(png),
            Ok(Err(e)) => {
                tracing::warn!(file_name = name, error = %e, "Thumbnail generation failed");
                None
            }
            Err(e) => {
                tracing::error!(file_name = name, error = %e, "Thumbnail task failed");
                None
            }
        }
    }
}

struct Buffer {
    data: Vec<u8>,
    overflowed: bool,
}

/// Reader copying everything it yields into a bounded buffer.
pub struct CaptureReader<R> {
    inner: R,
    buffer: Arc<Mutex<Buffer>>,
    max_bytes: usize,
}

/// Handle on the bytes seen by a [`CaptureReader`].
#[derive(Clone)]
pub struct Captured(Arc<Mutex<Buffer>>);

impl Captured {
    /// Everything captured, or `None` once the cap was exceeded.
    pub fn take(&self) -> Option<Vec<u8>> {
        let mut buffer = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.overflowed {
            return None;
        }
        Some(std::mem::take(&mut buffer.data))
    }
}

pub fn capture<R>(inner: R, max_bytes: u64) -> (CaptureReader<R>, Captured) {
    let buffer = Arc::new(Mutex::new(Buffer {
        data: Vec::new(),
        overflowed: false,
    }));
    let reader = CaptureReader {
        inner,
        buffer: Arc::clone(&buffer),
        max_bytes: usize::try_from(max_bytes).unwrap_or(usize::MAX),
    };
    (reader, Captured(buffer))
}

impl<R: AsyncRead + Unpin> AsyncRead for CaptureReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let chunk = &buf.filled()[before..];
                let mut buffer = this.buffer.lock().unwrap_or_else(PoisonError::into_inner);
                if !buffer.overflowed {
                    if buffer.data.len() + chunk.len() > this.max_bytes {
                        buffer.overflowed = true;
                        buffer.data = Vec::new();
                    } else {
                        buffer.data.extend_from_slice(chunk);
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(feature = "thumbnail")]
pub use image_thumbnailer::ImageThumbnailer;

#[cfg(feature = "thumbnail")]
mod image_thumbnailer {
    use std::io::Cursor;

    use bytes::Bytes;
    use image::imageops::FilterType;
    use image::ImageFormat;
    use stowage_core::ThumbnailScale;

    use super::ThumbnailGenerator;

    /// Raster thumbnails through the `image` crate.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ImageThumbnailer;

    impl ThumbnailGenerator for ImageThumbnailer {
        fn supports(&self, mime_type: &str) -> bool {
            matches!(
                mime_type,
                "image/jpeg" | "image/jpg" | "image/png" | "image/gif" | "image/webp"
            )
        }

        fn generate(&self, data: &[u8], scale: ThumbnailScale) -> Result<Bytes, anyhow::Error> {
            let img = image::ImageReader::new(Cursor::new(data))
                .with_guessed_format()?
                .decode()?;
            let (width, height) = scale.fit(img.width(), img.height());
            let thumb = img.resize_exact(width, height, FilterType::Triangle);

            let mut out = Cursor::new(Vec::new());
            thumb.write_to(&mut out, ImageFormat::Png)?;
            Ok(Bytes::from(out.into_inner()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    /// Generator emitting a fixed payload for any `image/*` source.
    pub(crate) struct FixedThumbnailer(pub(crate) Result<&'static [u8], &'static str>);

    impl ThumbnailGenerator for FixedThumbnailer {
        fn supports(&self, mime_type: &str) -> bool {
            mime_type.starts_with("image/")
        }

        fn generate(&self, _data: &[u8], _scale: ThumbnailScale) -> Result<Bytes, anyhow::Error> {
            self.0
                .map(Bytes::from_static)
                .map_err(|e| anyhow::anyhow!(e))
        }
    }

    pub(crate) fn settings(force_enabled: bool) -> ThumbnailSettings {
        ThumbnailSettings {
            force_enabled,
            default_scale: ThumbnailScale {
                width: Some(128),
                height: None,
            },
            max_source_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_capture_copies_stream() {
        let (mut reader, captured) = capture(Cursor::new(b"pixels".to_vec()), 16);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"pixels");
        assert_eq!(captured.take().as_deref(), Some(&b"pixels"[..]));
    }

    #[tokio::test]
    async fn test_capture_gives_up_past_cap() {
        let (mut reader, captured) = capture(Cursor::new(vec![7u8; 64]), 16);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 64);
        assert_eq!(captured.take(), None);
    }

    #[test]
    fn test_wanted_for() {
        let generator = Arc::new(FixedThumbnailer(Ok(b"png")));
        let on_request = Thumbnails::new(generator.clone(), &settings(false));
        let forced = Thumbnails::new(generator, &settings(true));

        let mut photo = FileMetadata::new(1, "r", "cat.jpg", "image/jpeg");
        assert!(!on_request.wanted_for(&photo));
        assert!(forced.wanted_for(&photo));
        photo.generate_thumbnail = true;
        assert!(on_request.wanted_for(&photo));

        let mut text = FileMetadata::new(1, "r", "a.txt", "text/plain");
        text.generate_thumbnail = true;
        assert!(!forced.wanted_for(&text));
    }

    #[tokio::test]
    async fn test_render_failure_yields_none() {
        let thumbs = Thumbnails::new(Arc::new(FixedThumbnailer(Err("bad image"))), &settings(true));
        let (mut reader, captured) = thumbs.capture(Cursor::new(b"junk".to_vec()));
        reader.read_to_end(&mut Vec::new()).await.unwrap();
        assert_eq!(thumbs.render(captured, "cat.jpg").await, None);
    }

    #[cfg(feature = "thumbnail")]
    #[test]
    fn test_image_thumbnail_keeps_aspect_ratio() {
        use image::{ImageFormat, RgbImage};

        let source = RgbImage::from_pixel(512, 256, image::Rgb([200, 40, 40]));
        let mut png = Cursor::new(Vec::new());
        source.write_to(&mut png, ImageFormat::Png).unwrap();

        let thumbnailer = ImageThumbnailer;
        assert!(thumbnailer.supports("image/png"));
        assert!(!thumbnailer.supports("video/mp4"));

        let out = thumbnailer
            .generate(png.get_ref(), "128:-1".parse().unwrap())
            .unwrap();
        let decoded = image::load_from_memory_with_format(&out, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (128, 64));
    }

    #[cfg(feature = "thumbnail")]
    #[test]
    fn test_image_thumbnail_rejects_garbage() {
        let result = ImageThumbnailer.generate(b"not an image", "128:-1".parse().unwrap());
        assert!(result.is_err());
    }
}
