//! Video decode/transcode capability backed by the ffmpeg command-line tools.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use serde::Deserialize;
use tracing::debug;

use crate::case_sheet::laplacian_variance;
use crate::config::VideoSettings;

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} failed ({status}): {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("cannot parse ffprobe output: {0}")]
    Probe(String),

    #[error("no video stream in {0}")]
    NoVideoStream(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What the sync needs from a video engine.
pub trait VideoTools {
    /// Variance of the Laplacian for roughly one frame per second, at most
    /// `max_samples` frames.
    fn sample_sharpness(&self, path: &Path, max_samples: usize) -> Result<Vec<f64>, VideoError>;
    /// Duration in seconds.
    fn duration(&self, path: &Path) -> Result<f64, VideoError>;
    /// Write `[start, end)` of `src` to `dst`.
    fn transcode_segment(&self, src: &Path, dst: &Path, start: f64, end: f64) -> Result<(), VideoError>;
}

/// Basic stream facts from ffprobe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    pub duration: f64,
    pub width: usize,
    pub height: usize,
    pub fps: f64,
}

#[derive(Debug, Deserialize)]
struct FFprobeOutput {
    streams: Option<Vec<FFprobeStream>>,
    format: Option<FFprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FFprobeStream {
    codec_type: String,
    width: Option<usize>,
    height: Option<usize>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FFprobeFormat {
    duration: Option<String>,
}

/// Parse ffmpeg rational rates like "30000/1001".
fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.parse::<f64>().ok()?, d.parse::<f64>().ok()?),
        None => (rate.parse::<f64>().ok()?, 1.0),
    };
    if num > 0.0 && den > 0.0 {
        Some(num / den)
    } else {
        None
    }
}

/// Parse `ffprobe -print_format json -show_streams -show_format` output.
pub fn parse_probe(json: &str, path: &Path) -> Result<ProbeInfo, VideoError> {
    let output: FFprobeOutput =
        serde_json::from_str(json).map_err(|e| VideoError::Probe(e.to_string()))?;
    let video = output
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| VideoError::NoVideoStream(path.to_path_buf()))?;

    let duration = output
        .format
        .and_then(|f| f.duration)
        .or(video.duration.clone())
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| VideoError::Probe("missing duration".into()))?;
    let fps = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(30.0);

    Ok(ProbeInfo {
        duration,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps,
    })
}

/// [`VideoTools`] over `ffmpeg`/`ffprobe` child processes.
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    settings: VideoSettings,
}

impl FfmpegTools {
    pub fn new(settings: VideoSettings) -> Self {
        Self { settings }
    }

    pub fn probe(&self, path: &Path) -> Result<ProbeInfo, VideoError> {
        let output = Command::new(&self.settings.ffprobe)
            .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(path)
            .output()
            .map_err(|source| VideoError::Spawn {
                tool: self.settings.ffprobe.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(VideoError::Failed {
                tool: self.settings.ffprobe.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_probe(&String::from_utf8_lossy(&output.stdout), path)
    }
}

impl VideoTools for FfmpegTools {
    fn sample_sharpness(&self, path: &Path, max_samples: usize) -> Result<Vec<f64>, VideoError> {
        let info = self.probe(path)?;
        if info.width == 0 || info.height == 0 {
            return Err(VideoError::NoVideoStream(path.to_path_buf()));
        }
        // Every round(fps)-th frame, i.e. about one per second
        let interval = info.fps.round().max(1.0) as u64;
        let filter = format!("select=not(mod(n\\,{})),format=gray", interval);

        let mut child = Command::new(&self.settings.ffmpeg)
            .args(["-v", "error", "-nostdin", "-noautorotate", "-i"])
            .arg(path)
            .args(["-vf", &filter, "-vsync", "vfr", "-frames:v"])
            .arg(max_samples.to_string())
            .args(["-f", "rawvideo", "-pix_fmt", "gray", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| VideoError::Spawn {
                tool: self.settings.ffmpeg.clone(),
                source,
            })?;

        // Drained concurrently: a damaged file can log more than the pipe
        // buffer holds before the first frame reaches stdout.
        let stderr_drain = child.stderr.take().map(|mut err| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).trim().to_string()
            })
        });

        let frame_len = info.width * info.height;
        let mut frame = vec![0u8; frame_len];
        let mut variances = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            while variances.len() < max_samples {
                match stdout.read_exact(&mut frame) {
                    Ok(()) => variances.push(laplacian_variance(&frame, info.width, info.height)),
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(e) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(e.into());
                    }
                }
            }
        }

        let status = child.wait()?;
        let stderr = stderr_drain
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if !status.success() && variances.is_empty() {
            return Err(VideoError::Failed {
                tool: self.settings.ffmpeg.clone(),
                status: status.to_string(),
                stderr,
            });
        }
        debug!(path = %path.display(), samples = variances.len(), interval, "Sampled sharpness");
        Ok(variances)
    }

    fn duration(&self, path: &Path) -> Result<f64, VideoError> {
        Ok(self.probe(path)?.duration)
    }

    fn transcode_segment(&self, src: &Path, dst: &Path, start: f64, end: f64) -> Result<(), VideoError> {
        let mut cmd = Command::new(&self.settings.ffmpeg);
        cmd.args(["-v", "error", "-nostdin", "-y", "-ss"])
            .arg(format!("{:.3}", start))
            .arg("-i")
            .arg(src)
            .arg("-t")
            .arg(format!("{:.3}", (end - start).max(0.0)))
            .args(["-map", "0:v:0", "-map", "0:a?"])
            .args(["-c:v", &self.settings.video_codec, "-c:a", &self.settings.audio_codec]);

        let ext = dst
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if matches!(ext.as_str(), "mp4" | "mov" | "m4v") {
            cmd.args(["-movflags", "+faststart"]);
        }
        cmd.arg(dst);

        let output = cmd.output().map_err(|source| VideoError::Spawn {
            tool: self.settings.ffmpeg.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(VideoError::Failed {
                tool: self.settings.ffmpeg.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("30/1"), Some(30.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }

    #[test]
    fn test_parse_probe() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "sample_rate": "48000"},
                {"codec_type": "video", "width": 1920, "height": 1080,
                 "avg_frame_rate": "30000/1001", "r_frame_rate": "30000/1001"}
            ],
            "format": {"duration": "125.50", "format_name": "mov,mp4"}
        }"#;
        let info = parse_probe(json, Path::new("a.mp4")).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.duration, 125.5);
        assert!((info.fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_parse_probe_falls_back_to_stream_values() {
        let json = r#"{"streams": [{"codec_type": "video", "width": 4, "height": 2,
                       "avg_frame_rate": "0/0", "r_frame_rate": "25/1", "duration": "9.0"}]}"#;
        let info = parse_probe(json, Path::new("b.avi")).unwrap();
        assert_eq!(info.duration, 9.0);
        assert_eq!(info.fps, 25.0);
    }

    #[test]
    fn test_parse_probe_without_video() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "3"}}"#;
        assert!(matches!(
            parse_probe(json, Path::new("c.mp4")),
            Err(VideoError::NoVideoStream(_))
        ));
        assert!(matches!(parse_probe("{", Path::new("c.mp4")), Err(VideoError::Probe(_))));
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let tools = FfmpegTools::new(VideoSettings {
            ffprobe: "/nonexistent/ffprobe-binary".into(),
            ..VideoSettings::default()
        });
        assert!(matches!(
            tools.duration(Path::new("x.mp4")),
            Err(VideoError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn test_noisy_decoder_does_not_stall_sampling() {
        use std::sync::mpsc;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let ffprobe = write_script(
            dir.path(),
            "ffprobe",
            r#"echo '{"streams":[{"codec_type":"video","width":4,"height":2,"avg_frame_rate":"1/1"}],"format":{"duration":"1.0"}}'"#,
        );
        // Far more stderr than a pipe buffers, then one flat 4x2 frame
        let ffmpeg = write_script(
            dir.path(),
            "ffmpeg",
            r#"i=0
while [ $i -lt 4000 ]; do echo "[h264 @ 0x0] error while decoding MB $i 0, bytestream -7" >&2; i=$((i+1)); done
printf '\200\200\200\200\200\200\200\200'"#,
        );
        let tools = FfmpegTools::new(VideoSettings {
            ffmpeg,
            ffprobe,
            ..VideoSettings::default()
        });

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(tools.sample_sharpness(Path::new("damaged.mp4"), 10));
        });
        let variances = rx
            .recv_timeout(Duration::from_secs(30))
            .expect("sampling stalled")
            .unwrap();
        assert_eq!(variances, vec![0.0]);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_decoder_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ffprobe = write_script(
            dir.path(),
            "ffprobe",
            r#"echo '{"streams":[{"codec_type":"video","width":4,"height":2,"avg_frame_rate":"1/1"}],"format":{"duration":"1.0"}}'"#,
        );
        let ffmpeg = write_script(dir.path(), "ffmpeg", "echo 'moov atom not found' >&2; exit 1");
        let tools = FfmpegTools::new(VideoSettings {
            ffmpeg,
            ffprobe,
            ..VideoSettings::default()
        });
        match tools.sample_sharpness(Path::new("broken.mp4"), 10) {
            Err(VideoError::Failed { stderr, .. }) => assert_eq!(stderr, "moov atom not found"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
