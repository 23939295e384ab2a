use crate::error::VqaError;
use kornia_image::{Image, ImageSize, allocator::CpuAllocator};
use std::{fmt, path::Path, path::PathBuf, str::FromStr};

/// RGB8 bitmap handed to the model.
pub type RgbImage = Image<u8, 3, CpuAllocator>;

/// Where the image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Fetched with a single HTTP GET.
    Url(String),
    /// Read from the local filesystem.
    Path(PathBuf),
}

impl ImageSource {
    /// Fetches and decodes the image.
    pub fn load(&self) -> Result<RgbImage, VqaError> {
        match self {
            ImageSource::Url(url) => fetch_image(url),
            ImageSource::Path(path) => read_image_from_path(path),
        }
    }
}

impl FromStr for ImageSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("http://") || s.starts_with("https://") {
            Ok(ImageSource::Url(s.to_string()))
        } else {
            Ok(ImageSource::Path(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Url(url) => f.write_str(url),
            ImageSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Downloads an image and decodes it into an RGB8 bitmap.
///
/// Non-success status codes are reported as fetch errors; a body that is not
/// an image fails in decoding.
pub fn fetch_image(url: &str) -> Result<RgbImage, VqaError> {
    log::debug!("Fetching image from {url}");

    let fetch_err = |source| VqaError::Fetch {
        url: url.to_string(),
        source,
    };

    let bytes = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.bytes())
        .map_err(fetch_err)?;

    log::debug!("Fetched {} bytes", bytes.len());

    decode_image(&bytes)
}

/// Decodes encoded image bytes (png, jpeg, webp, ...) into an RGB8 bitmap.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, VqaError> {
    if bytes.is_empty() {
        return Err(VqaError::Decode("image data is empty".to_string()));
    }

    let rgb = image::load_from_memory(bytes)
        .map_err(|e| VqaError::Decode(e.to_string()))?
        .to_rgb8();

    let size = ImageSize {
        width: rgb.width() as usize,
        height: rgb.height() as usize,
    };

    Image::new(size, rgb.into_raw(), CpuAllocator).map_err(|e| VqaError::Decode(e.to_string()))
}

/// Reads a local jpeg or png file.
pub fn read_image_from_path(path: &Path) -> Result<RgbImage, VqaError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or_else(|| VqaError::UnsupportedFormat(format!("{}", path.display())))?;

    if !path.exists() {
        return Err(VqaError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("image not found: {}", path.display()),
        )));
    }

    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => kornia_io::jpeg::read_image_jpeg_rgb8(path)
            .map_err(|e| VqaError::Decode(e.to_string())),
        "png" => {
            kornia_io::png::read_image_png_rgb8(path).map_err(|e| VqaError::Decode(e.to_string()))
        }
        other => Err(VqaError::UnsupportedFormat(other.to_string())),
    }
}
