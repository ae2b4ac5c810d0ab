//! Output path resolution for one capture.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tracing::debug;

use super::disk::{DiskSpaceProbe, ensure_disk_space};
use super::template::{TemplateValues, expand_filename_template, expand_folder_template};
use crate::config::ResolvedDownloadConfig;
use crate::domain::StreamJob;
use crate::utils::fs::ensure_dir_all;
use crate::{Error, Result};

/// Suffix marking an in-progress capture.
pub const PART_SUFFIX: &str = "part";
/// Extension of the danmu side-channel file.
pub const DANMU_EXTENSION: &str = "xml";

/// Paths used by one capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDescriptor {
    /// `<dir>/<name>.<ext>.part`, written by the engine.
    pub media_path: PathBuf,
    /// `media_path` without the `.part` suffix.
    pub final_path: PathBuf,
    /// `<dir>/<name>.xml`.
    pub danmu_path: PathBuf,
}

impl OutputDescriptor {
    /// Build the descriptor for `name` inside `dir`.
    pub fn new(dir: &Path, name: &str, extension: &str) -> Self {
        let final_path = dir.join(format!("{name}.{extension}"));
        Self {
            media_path: dir.join(format!("{name}.{extension}.{PART_SUFFIX}")),
            danmu_path: danmu_path_for(&final_path),
            final_path,
        }
    }
}

/// Danmu file path for a media path: the `<ext>[.part]` suffix becomes `xml`.
pub fn danmu_path_for(media_path: &Path) -> PathBuf {
    let stripped = strip_part_suffix(media_path);
    stripped.with_extension(DANMU_EXTENSION)
}

/// `path` without a trailing `.part`, or `path` itself.
pub fn strip_part_suffix(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == PART_SUFFIX) {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

/// Computes collision-free output paths and preflights disk space.
#[derive(Clone)]
pub struct OutputPathResolver {
    disk_probe: Arc<dyn DiskSpaceProbe>,
}

impl OutputPathResolver {
    pub fn new(disk_probe: Arc<dyn DiskSpaceProbe>) -> Self {
        Self { disk_probe }
    }

    /// Resolve the output paths of `job`.
    ///
    /// Creates the target directory. Fails if the `.part` file already
    /// exists or the directory has less free space than the max part size.
    pub async fn resolve(
        &self,
        job: &StreamJob,
        config: &ResolvedDownloadConfig,
        at: DateTime<Local>,
    ) -> Result<OutputDescriptor> {
        let values = TemplateValues {
            streamer: &job.streamer_name,
            title: job.title(),
            platform: job.platform.as_str(),
        };

        let dir = PathBuf::from(expand_folder_template(&config.output_folder, &values, at));
        let name = expand_filename_template(&config.output_filename_template, &values, at);
        let descriptor =
            OutputDescriptor::new(&dir, &name, config.output_file_format.extension());

        ensure_dir_all(&dir).await?;

        let exists = tokio::fs::try_exists(&descriptor.media_path)
            .await
            .map_err(|e| Error::io_path("checking", &descriptor.media_path, e))?;
        if exists {
            return Err(Error::PathCollision(descriptor.media_path));
        }

        // Disk queries hit the filesystem synchronously.
        let probe = self.disk_probe.clone();
        let probe_dir = dir.clone();
        let required = config.max_part_size;
        tokio::task::spawn_blocking(move || ensure_disk_space(probe.as_ref(), &probe_dir, required))
            .await
            .map_err(|e| Error::Other(format!("disk space check did not complete: {e}")))??;

        debug!(
            streamer = %job.streamer_name,
            job_id = %job.id,
            "Resolved output path: {}",
            descriptor.media_path.display()
        );
        Ok(descriptor)
    }
}
