use std::ffi::CString;

use leptess::tesseract::TessApi;
use opencv::core::Point;
use opencv::core::Rect;
use opencv::imgproc::cvt_color;
use opencv::imgproc::filter_2d;
use opencv::imgproc::COLOR_BGR2GRAY;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::MatTraitConstManual;
use thiserror::Error;
use tracing::debug;

use crate::config::OcrConfig;
use crate::violation_detection::store::normalize_plate;

#[derive(Debug, Error)]
pub enum RecognizeError {
    #[error("tesseract initialisation failed: {0}")]
    Init(String),
    #[error("tesseract failed: {0}")]
    Ocr(String),
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

/// Text read from a plate region, with the engine's confidence (0-100).
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub confidence: f32,
}

pub trait TextRecognizer {
    /// Read the text inside `region` of `frame`, or `None` when nothing usable was found.
    fn recognize(&mut self, frame: &Mat, region: Rect)
        -> Result<Option<Recognition>, RecognizeError>;
}

impl<R: TextRecognizer + ?Sized> TextRecognizer for Box<R> {
    fn recognize(
        &mut self,
        frame: &Mat,
        region: Rect,
    ) -> Result<Option<Recognition>, RecognizeError> {
        (**self).recognize(frame, region)
    }
}

pub struct TesseractRecognizer {
    ocr: TessApi,
    deblur: bool,
    min_confidence: i32,
}

impl TesseractRecognizer {
    pub fn new(config: &OcrConfig) -> Result<Self, RecognizeError> {
        let mut api = TessApi::new(Some(config.data_path.as_str()), &config.language)
            .map_err(|e| RecognizeError::Init(format!("{e:?}")))?;

        set_variable(&mut api, "tessedit_char_whitelist", &config.whitelist)?;
        set_variable(
            &mut api,
            "tessedit_pageseg_mode",
            &config.page_seg_mode.to_string(),
        )?;

        Ok(Self {
            ocr: api,
            deblur: config.deblur,
            min_confidence: config.min_confidence,
        })
    }

    fn crop_plate(&self, image: &Mat, rect: Rect) -> opencv::Result<Mat> {
        let mut grey = Mat::default();
        cvt_color(image, &mut grey, COLOR_BGR2GRAY, 0)?;

        let cropped = grey.apply_1(rect)?;
        if self.deblur {
            let mut processed = Mat::default();
            let kernel = Mat::from_slice_2d(&[[-1, -1, -1], [-1, 9, -1], [-1, -1, -1]])?;

            filter_2d(
                &cropped,
                &mut processed,
                -1,
                &kernel,
                Point::new(-1, -1),
                0.0,
                opencv::core::BORDER_DEFAULT,
            )?;

            Ok(processed)
        } else {
            // Make it contiguous
            cropped.try_clone()
        }
    }
}

fn set_variable(api: &mut TessApi, name: &str, value: &str) -> Result<(), RecognizeError> {
    let name = CString::new(name).map_err(|e| RecognizeError::Init(e.to_string()))?;
    let value = CString::new(value).map_err(|e| RecognizeError::Init(e.to_string()))?;
    api.raw
        .set_variable(&name, &value)
        .map_err(|e| RecognizeError::Init(format!("{e:?}")))
}

unsafe impl Send for TesseractRecognizer {}
unsafe impl Sync for TesseractRecognizer {}

impl TextRecognizer for TesseractRecognizer {
    fn recognize(
        &mut self,
        frame: &Mat,
        region: Rect,
    ) -> Result<Option<Recognition>, RecognizeError> {
        let cropped = self.crop_plate(frame, region)?;

        let cols = cropped.cols();
        let rows = cropped.rows();
        let bytes = cropped.data_bytes()?;
        self.ocr
            .raw
            .set_image(bytes, cols, rows, 1, cols)
            .map_err(|e| RecognizeError::Ocr(format!("{e:?}")))?;
        let raw = self
            .ocr
            .get_utf8_text()
            .map_err(|e| RecognizeError::Ocr(format!("{e:?}")))?;
        let confidence = self.ocr.mean_text_conf();

        // Tesseract pads single-line output with spaces and newlines.
        let text = normalize_plate(&raw);
        debug!("OCR {:?} (confidence {confidence})", text);
        if text.is_empty() || confidence < self.min_confidence {
            return Ok(None);
        }
        Ok(Some(Recognition {
            text,
            confidence: confidence as f32,
        }))
    }
}
