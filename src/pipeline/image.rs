//! Image preparation: file or bytes → size-capped JPEG/PNG ready for upload.
//!
//! Receipt photos straight off a phone are 4000+ px and several MB, which is
//! wasted tokens and upload time for a VLM. [`ImageProcessor`] validates the
//! input, scales it down to the configured bounds and re-encodes it.
//!
//! Decoding, resizing and encoding are CPU-bound, so they run under
//! `tokio::task::spawn_blocking`.

use crate::config::ImageConfig;
use crate::error::ImageError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Encoded image bytes plus their MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl PreparedImage {
    /// `data:{mime};base64,...` form used in chat requests.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }
}

/// Turns an image reference into upload-ready bytes.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn prepare(&self, image_ref: &str, optimize: bool) -> Result<PreparedImage, ImageError>;
}

/// File-system [`ImageSource`] backed by the `image` crate.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    config: ImageConfig,
    extensions: Vec<String>,
}

impl ImageProcessor {
    /// An empty or blank `supported_formats` falls back to the default list.
    pub fn new(config: ImageConfig) -> Self {
        let mut extensions = normalize_all(&config.supported_formats);
        if extensions.is_empty() {
            extensions = normalize_all(&ImageConfig::default().supported_formats);
        }
        Self { config, extensions }
    }

    fn max_bytes(&self) -> u64 {
        self.config.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    fn check_size(&self, size: u64) -> Result<(), ImageError> {
        if size > self.max_bytes() {
            return Err(ImageError::TooLarge {
                size_mb: size as f64 / (1024.0 * 1024.0),
                max_mb: self.config.max_file_size_mb,
            });
        }
        Ok(())
    }

    /// Existence, extension and size checks. Does not read the file.
    pub async fn validate(&self, path: &Path) -> Result<(), ImageError> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => {
                return Err(ImageError::NotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImageError::NotFound {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(normalize_extension);
        if !ext.as_ref().is_some_and(|e| self.extensions.contains(e)) {
            return Err(ImageError::UnsupportedExtension {
                extension: ext.unwrap_or_else(|| "(no extension)".to_string()),
                accepted: self.extensions.join(", "),
            });
        }

        self.check_size(meta.len())
    }

    /// Prepare in-memory image bytes (e.g. an upload body).
    pub async fn prepare_bytes(
        &self,
        bytes: Vec<u8>,
        optimize: bool,
    ) -> Result<PreparedImage, ImageError> {
        self.check_size(bytes.len() as u64)?;
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || process_blocking(&bytes, &config, optimize))
            .await
            .map_err(|e| ImageError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl ImageSource for ImageProcessor {
    async fn prepare(&self, image_ref: &str, optimize: bool) -> Result<PreparedImage, ImageError> {
        let path = Path::new(image_ref);
        self.validate(path).await?;
        let bytes = tokio::fs::read(path).await?;
        debug!("Read {} ({} bytes)", path.display(), bytes.len());
        self.prepare_bytes(bytes, optimize).await
    }
}

fn normalize_all(formats: &[String]) -> Vec<String> {
    formats.iter().filter_map(|f| normalize_extension(f)).collect()
}

/// `"JPG "` → `".jpg"`; empty → `None`.
fn normalize_extension(fmt: &str) -> Option<String> {
    let f = fmt.trim().to_lowercase();
    if f.is_empty() {
        None
    } else if f.starts_with('.') {
        Some(f)
    } else {
        Some(format!(".{f}"))
    }
}

fn process_blocking(
    bytes: &[u8],
    config: &ImageConfig,
    optimize: bool,
) -> Result<PreparedImage, ImageError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let format = match reader.format() {
        Some(f @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Bmp | ImageFormat::WebP)) => f,
        Some(other) => {
            return Err(ImageError::UnsupportedFormat {
                format: format!("{other:?}"),
            })
        }
        None => {
            return Err(ImageError::UnsupportedFormat {
                format: "unknown".to_string(),
            })
        }
    };
    let mut img = reader
        .decode()
        .map_err(|e| ImageError::Decode(e.to_string()))?;

    let (w, h) = (img.width(), img.height());
    if w > config.max_width || h > config.max_height {
        img = img.resize(config.max_width, config.max_height, FilterType::Lanczos3);
        debug!("Resized {w}x{h} → {}x{}", img.width(), img.height());
    }

    let rgb = flatten_onto_white(&img);
    let mut buf = Vec::new();
    let mime_type = if !optimize && format == ImageFormat::Png {
        DynamicImage::ImageRgb8(rgb)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| ImageError::Encode(e.to_string()))?;
        "image/png"
    } else {
        let encoder = JpegEncoder::new_with_quality(&mut buf, config.jpeg_quality);
        DynamicImage::ImageRgb8(rgb)
            .write_with_encoder(encoder)
            .map_err(|e| ImageError::Encode(e.to_string()))?;
        "image/jpeg"
    };

    debug!(
        "Prepared {:?} image: {} → {} bytes as {mime_type}",
        format,
        bytes.len(),
        buf.len()
    );
    Ok(PreparedImage {
        bytes: buf,
        mime_type: mime_type.to_string(),
    })
}

/// Composite any alpha channel over a white background.
fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, p) in rgba.enumerate_pixels() {
        let [r, g, b, a] = p.0;
        let a = a as u16;
        let blend = |c: u8| ((c as u16 * a + 255 * (255 - a) + 127) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}
