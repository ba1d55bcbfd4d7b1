//! Base64 payloads, still-image decoding, video frame extraction and
//! preview encoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GrayImage, RgbImage};
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("empty payload")]
    EmptyPayload,
    #[error("failed to decode image: {0}")]
    UndecodableImage(#[from] image::ImageError),
    #[error("failed to encode preview: {0}")]
    Encode(image::ImageError),
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(std::io::Error),
    #[error("video decode failed: {0}")]
    VideoDecode(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Strip an optional `<scheme>;base64,` prefix and decode the rest.
///
/// Whitespace inside the payload (line-wrapped base64) is ignored.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, MediaError> {
    let body = match payload.split_once(',') {
        Some((_, rest)) => rest,
        None => payload,
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(MediaError::EmptyPayload);
    }
    let bytes = STANDARD.decode(compact)?;
    if bytes.is_empty() {
        return Err(MediaError::EmptyPayload);
    }
    Ok(bytes)
}

/// Decode still-image bytes (format sniffed from magic bytes).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, MediaError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Encode `frame` as a `data:image/jpeg;base64,` URI.
pub fn encode_jpeg_data_uri(frame: &RgbImage, quality: u8) -> Result<String, MediaError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(frame)
        .map_err(MediaError::Encode)?;
    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(&buf)))
}

/// Sequential grayscale frame source for enrollment recordings.
pub trait VideoDecoder: Send + Sync {
    /// Feed every `stride`-th frame of `bytes` to `visit`, in order,
    /// until the stream ends or `visit` breaks. Returns frames visited.
    fn for_each_frame(
        &self,
        bytes: &[u8],
        stride: usize,
        visit: &mut dyn FnMut(GrayImage) -> ControlFlow<()>,
    ) -> Result<usize, MediaError>;
}

/// Extracts frames by running the `ffmpeg` binary into a temporary
/// directory. The directory and everything in it is removed on return.
pub struct FfmpegDecoder {
    binary: PathBuf,
}

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self { binary: PathBuf::from("ffmpeg") }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    fn extract(&self, input: &Path, out_dir: &Path, stride: usize) -> Result<(), MediaError> {
        let pattern = out_dir.join("frame_%06d.png");
        let output = Command::new(&self.binary)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
            .arg(input)
            .args(["-vf", &select_filter(stride), "-vsync", "vfr"])
            .arg(&pattern)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(MediaError::FfmpegUnavailable)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::VideoDecode(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn for_each_frame(
        &self,
        bytes: &[u8],
        stride: usize,
        visit: &mut dyn FnMut(GrayImage) -> ControlFlow<()>,
    ) -> Result<usize, MediaError> {
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join("recording.bin");
        {
            let mut file = std::fs::File::create(&input)?;
            file.write_all(bytes)?;
        }

        let frames_dir = workdir.path().join("frames");
        std::fs::create_dir(&frames_dir)?;
        self.extract(&input, &frames_dir, stride)?;

        let mut frames: Vec<PathBuf> = std::fs::read_dir(&frames_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(MediaError::VideoDecode("no frames decoded".into()));
        }
        tracing::debug!(frames = frames.len(), stride, "video: frames extracted");

        let mut visited = 0;
        for path in &frames {
            let frame = image::open(path)?.to_luma8();
            visited += 1;
            if visit(frame).is_break() {
                break;
            }
        }
        Ok(visited)
    }
}

/// ffmpeg filter keeping frames 0, stride, 2*stride, ... as grayscale.
fn select_filter(stride: usize) -> String {
    format!("select=not(mod(n\\,{})),format=gray", stride.max(1))
}
