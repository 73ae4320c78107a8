use std::path::{Path, PathBuf};

use opencv::core::Size;
use opencv::imgcodecs::{imread, IMREAD_COLOR};
use opencv::imgproc::resize;
use opencv::imgproc::INTER_LINEAR;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::VideoCaptureTrait;
use opencv::prelude::VideoCaptureTraitConst;
use opencv::videoio::VideoCapture;
use opencv::videoio::{CAP_ANY, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{CameraBackend, CameraConfig};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("cannot read image {path:?}")]
    Unreadable { path: PathBuf },
    #[error("camera returned an empty frame")]
    EmptyFrame,
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

/// Produces one frame per call. Capture blocks until a frame is available.
pub trait FrameSource {
    fn capture(&mut self) -> Result<Mat, CaptureError>;
}

impl<F: FrameSource + ?Sized> FrameSource for Box<F> {
    fn capture(&mut self) -> Result<Mat, CaptureError> {
        (**self).capture()
    }
}

/// Live camera or stream read through opencv.
pub struct CameraSource {
    capture: VideoCapture,
    size: Size,
}

impl CameraSource {
    pub fn open(uri: &str, width: i32, height: i32) -> Result<Self, CaptureError> {
        let mut capture = open_video_capture(uri)?;
        let width_set = capture.set(CAP_PROP_FRAME_WIDTH, width as f64);
        size_request_accepted(uri, "width", width, width_set);
        let height_set = capture.set(CAP_PROP_FRAME_HEIGHT, height as f64);
        size_request_accepted(uri, "height", height, height_set);
        Ok(Self {
            capture,
            size: Size::new(width, height),
        })
    }
}

/// Frames from a device that refused the size are resized on capture instead.
fn size_request_accepted(uri: &str, what: &str, value: i32, result: opencv::Result<bool>) -> bool {
    match result {
        Ok(true) => true,
        Ok(false) => {
            warn!("{uri} refused frame {what} {value}, frames will be resized");
            false
        }
        Err(err) => {
            warn!("Cannot set frame {what} {value} on {uri}: {err}");
            false
        }
    }
}

/// Parse a `/dev/videoX` style URI or a bare index.
fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    uri.strip_prefix("/dev/video")
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .and_then(|rest| rest.parse::<i32>().ok())
}

fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    let capture = match parse_device_index(uri) {
        Some(index) => VideoCapture::new(index, CAP_ANY),
        None => VideoCapture::from_file(uri, CAP_ANY),
    };
    match capture {
        Ok(capture) if capture.is_opened()? => Ok(capture),
        Ok(_) => Err(CaptureError::Open {
            uri: uri.to_string(),
        }),
        Err(err) => {
            warn!("failed to open {uri}: {err}");
            Err(CaptureError::Open {
                uri: uri.to_string(),
            })
        }
    }
}

impl FrameSource for CameraSource {
    fn capture(&mut self) -> Result<Mat, CaptureError> {
        let mut image = Mat::default();
        let grabbed = self.capture.read(&mut image)?;

        if !grabbed || image.empty() {
            return Err(CaptureError::EmptyFrame);
        }

        if image.cols() == self.size.width && image.rows() == self.size.height {
            return Ok(image);
        }

        let mut image_resized = Mat::default();
        resize(&image, &mut image_resized, self.size, 0.0, 0.0, INTER_LINEAR)?;
        debug!("Frame resized to {}x{}", self.size.width, self.size.height);
        Ok(image_resized)
    }
}

/// Still image on disk, re-read on every capture.
pub struct StillImageSource {
    path: PathBuf,
}

impl StillImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSource for StillImageSource {
    fn capture(&mut self) -> Result<Mat, CaptureError> {
        let path = self.path.to_string_lossy();
        let image = imread(&path, IMREAD_COLOR)?;
        if image.empty() {
            return Err(CaptureError::Unreadable {
                path: self.path.clone(),
            });
        }
        Ok(image)
    }
}

/// Build the configured camera backend.
pub fn frame_source_from_config(
    config: &CameraConfig,
) -> Result<Box<dyn FrameSource + Send>, CaptureError> {
    let source: Box<dyn FrameSource + Send> = match config.backend {
        CameraBackend::Device => Box::new(CameraSource::open(
            &config.uri,
            config.width,
            config.height,
        )?),
        CameraBackend::File => Box::new(StillImageSource::new(&config.uri)),
    };
    Ok(source)
}

unsafe impl Send for CameraSource {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_index_parsing() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
    }

    #[test]
    fn refused_size_request_is_reported() {
        assert!(size_request_accepted("0", "width", 640, Ok(true)));
        assert!(!size_request_accepted("0", "width", 640, Ok(false)));
        let err = opencv::Error::new(opencv::core::StsError, "unsupported property");
        assert!(!size_request_accepted("0", "height", 480, Err(err)));
    }

    #[test]
    fn missing_still_image_is_a_capture_error() {
        let mut source = StillImageSource::new("/nonexistent/frame.jpg");
        assert!(source.capture().is_err());
    }
}
