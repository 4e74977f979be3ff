//! Where job files live, and preparation of the worker's input image
//!
//! Each job gets a private copy of its source image in the temp directory.
//! The copy has its top-left pixel recolored so that submitting the same
//! image twice still hands the worker two distinct inputs.

use crate::error::{ConversionError, Result};
use crate::models::{JobId, RequestKind};
use image::{DynamicImage, GenericImage, GenericImageView, ImageFormat, Rgba};
use rand::Rng;
use std::path::{Path, PathBuf};

/// Rolls allowed before giving up on recoloring the first pixel
const MAX_RECOLOR_ATTEMPTS: usize = 64;

/// Source image extensions, in lookup order
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tga", "tiff"];

/// Check if a path has a supported source image extension
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Directory layout for source, staged and generated files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetLayout {
    pub source_directory: PathBuf,
    pub temp_directory: PathBuf,
    pub output_directory: PathBuf,
}

impl AssetLayout {
    pub fn new(
        source_directory: impl Into<PathBuf>,
        temp_directory: impl Into<PathBuf>,
        output_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_directory: source_directory.into(),
            temp_directory: temp_directory.into(),
            output_directory: output_directory.into(),
        }
    }

    /// Turn an asset reference into a source image path.
    ///
    /// Paths with an extension are used as given (relative ones inside the
    /// source directory). Bare asset names are looked up by trying each
    /// supported extension, falling back to `.png`.
    pub fn resolve_source(&self, asset: &str) -> PathBuf {
        let reference = Path::new(asset);
        if reference.extension().is_some() {
            return if reference.is_absolute() || reference.exists() {
                reference.to_path_buf()
            } else {
                self.source_directory.join(reference)
            };
        }

        SUPPORTED_EXTENSIONS
            .iter()
            .map(|ext| self.source_directory.join(format!("{}.{}", asset, ext)))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| self.source_directory.join(format!("{}.png", asset)))
    }

    /// Staged copy of the source image, named after the job
    pub fn temp_path(&self, job_id: &JobId, source: &Path) -> PathBuf {
        let extension = source
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("png");
        self.temp_directory
            .join(format!("{}.{}", job_id, extension.to_ascii_lowercase()))
    }

    /// `<output dir>/<job id>/<job id>.<ext>`
    pub fn output_path(&self, job_id: &JobId, kind: RequestKind) -> PathBuf {
        self.output_directory
            .join(job_id.as_str())
            .join(format!("{}.{}", job_id, kind.extension()))
    }
}

/// Create the directory that will receive a job's model
pub async fn prepare_output_directory(output_path: &Path) -> Result<()> {
    let Some(directory) = output_path.parent() else {
        return Ok(());
    };

    tokio::fs::create_dir_all(directory)
        .await
        .map_err(|e| ConversionError::StagingFailed {
            path: directory.to_path_buf(),
            message: format!("cannot create output directory: {}", e),
        })
}

/// Copy `source` to `destination`, recoloring the pixel at (0, 0)
pub async fn stage_input(source: &Path, destination: &Path) -> Result<()> {
    if !tokio::fs::try_exists(source).await.unwrap_or(false) {
        return Err(ConversionError::SourceNotFound {
            path: source.to_path_buf(),
        });
    }

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ConversionError::StagingFailed {
                path: parent.to_path_buf(),
                message: format!("cannot create temp directory: {}", e),
            })?;
    }

    let source_path = source.to_path_buf();
    let destination_path = destination.to_path_buf();
    tokio::task::spawn_blocking(move || perturb_copy(&source_path, &destination_path))
        .await
        .map_err(|e| ConversionError::StagingFailed {
            path: source.to_path_buf(),
            message: format!("staging task failed: {}", e),
        })??;

    tracing::debug!("Staged {} as {}", source.display(), destination.display());
    Ok(())
}

fn perturb_copy(source: &Path, destination: &Path) -> Result<()> {
    let staging_error = |message: String| ConversionError::StagingFailed {
        path: source.to_path_buf(),
        message,
    };

    let mut img = image::open(source).map_err(|e| staging_error(format!("cannot decode: {}", e)))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(staging_error("image has no pixels".to_string()));
    }

    if !recolor_first_pixel(&mut img, &mut rand::thread_rng()) {
        return Err(staging_error("cannot recolor first pixel".to_string()));
    }

    let format = ImageFormat::from_path(destination)
        .map_err(|e| staging_error(format!("unsupported staging format: {}", e)))?;
    img.save_with_format(destination, format)
        .map_err(|e| staging_error(format!("cannot write staged copy: {}", e)))?;

    Ok(())
}

/// Replace the pixel at (0, 0) with a random color that survives conversion
/// to the image's own color type. Returns `false` if every roll collided.
fn recolor_first_pixel<R: Rng>(img: &mut DynamicImage, rng: &mut R) -> bool {
    let original = img.get_pixel(0, 0);
    for _ in 0..MAX_RECOLOR_ATTEMPTS {
        img.put_pixel(0, 0, random_pixel_unlike(original, rng));
        if img.get_pixel(0, 0) != original {
            return true;
        }
    }
    img.put_pixel(0, 0, original);
    false
}

fn random_pixel_unlike<R: Rng>(original: Rgba<u8>, rng: &mut R) -> Rgba<u8> {
    let mut pixel = Rgba([rng.gen(), rng.gen(), rng.gen(), 255]);
    if pixel == original {
        pixel.0[0] ^= 1;
    }
    pixel
}
