use crowd_live::{LiveError, Result, RgbImage, VideoSource};
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};

/// Where the OpenCV capture reads from.
#[derive(Debug, Clone)]
pub enum CaptureInput {
    Device(i32),
    File(String),
}

/// A camera or video file read through OpenCV.
pub struct OpenCvSource {
    input: CaptureInput,
    cap: Option<VideoCapture>,
}

impl OpenCvSource {
    pub fn new(input: CaptureInput) -> Self {
        Self { input, cap: None }
    }
}

fn unavailable(err: opencv::Error) -> LiveError {
    LiveError::SourceUnavailable(err.to_string())
}

impl VideoSource for OpenCvSource {
    fn acquire(&mut self) -> Result<()> {
        let cap = match &self.input {
            CaptureInput::Device(index) => VideoCapture::new(*index, videoio::CAP_ANY),
            CaptureInput::File(path) => VideoCapture::from_file(path, videoio::CAP_ANY),
        }
        .map_err(unavailable)?;
        if !cap.is_opened().map_err(unavailable)? {
            return Err(LiveError::SourceUnavailable(format!("{} could not be opened", self.describe())));
        }
        self.cap = Some(cap);
        Ok(())
    }

    fn grab(&mut self) -> Result<Option<RgbImage>> {
        let Some(cap) = self.cap.as_mut() else {
            return Err(LiveError::SourceUnavailable("capture not acquired".to_string()));
        };

        let mut frame = Mat::default();
        // A device that has not produced a frame yet, or a file that ran out.
        if !cap.read(&mut frame).map_err(unavailable)? || frame.empty() {
            return Ok(None);
        }

        // OpenCV hands out BGR.
        let mut rgb = Mat::default();
        imgproc::cvt_color(&frame, &mut rgb, imgproc::COLOR_BGR2RGB, 0).map_err(unavailable)?;
        let width = rgb.cols() as u32;
        let height = rgb.rows() as u32;
        let bytes = rgb.data_bytes().map_err(unavailable)?.to_vec();
        Ok(RgbImage::from_raw(width, height, bytes))
    }

    fn release(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            let _ = cap.release();
        }
    }

    fn describe(&self) -> String {
        match &self.input {
            CaptureInput::Device(index) => format!("camera #{index}"),
            CaptureInput::File(path) => format!("video file {path}"),
        }
    }
}
