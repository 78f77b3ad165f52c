use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::video::VideoTools;

/// Temp output for a clip. Keeps the extension so the muxer can be inferred.
fn clip_temp_path(destination: &Path) -> PathBuf {
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match destination.extension() {
        Some(ext) => format!("{}.partial.{}", stem, ext.to_string_lossy()),
        None => format!("{}.partial", stem),
    };
    destination.with_file_name(name)
}

/// Write `source` from `start_seconds` to its end into `destination`.
///
/// Best effort: every failure is logged and reported as `false`, and no
/// partial output is left behind. Callers fall back to a full copy.
pub fn clip_video(
    tools: &dyn VideoTools,
    source: &Path,
    destination: &Path,
    start_seconds: f64,
) -> bool {
    let duration = match tools.duration(source) {
        Ok(d) => d,
        Err(e) => {
            warn!(source = %source.display(), error = %e, "Cannot read duration, not clipping");
            return false;
        }
    };
    if start_seconds >= duration {
        warn!(
            source = %source.display(),
            start_seconds,
            duration,
            "Case sheet reaches the end of the video, not clipping"
        );
        return false;
    }

    if let Some(parent) = destination.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), error = %e, "Cannot create destination directory");
            return false;
        }
    }

    let temp = clip_temp_path(destination);
    let result = tools
        .transcode_segment(source, &temp, start_seconds, duration)
        .map_err(|e| e.to_string())
        .and_then(|()| match fs::metadata(&temp) {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err("transcode produced no output".to_string()),
        })
        .and_then(|()| fs::rename(&temp, destination).map_err(|e| e.to_string()));

    match result {
        Ok(()) => {
            info!(
                source = %source.display(),
                destination = %destination.display(),
                start_seconds,
                duration,
                "Clipped case sheet"
            );
            true
        }
        Err(e) => {
            warn!(source = %source.display(), error = %e, "Clipping failed");
            let _ = fs::remove_file(&temp);
            false
        }
    }
}
