//! Heuristic plate localisation: edges, external contours, aspect ratio.

use opencv::core::Point;
use opencv::core::Rect;
use opencv::core::Size;
use opencv::core::Vector;
use opencv::core::BORDER_DEFAULT;
use opencv::imgproc::bounding_rect;
use opencv::imgproc::canny;
use opencv::imgproc::cvt_color;
use opencv::imgproc::find_contours;
use opencv::imgproc::gaussian_blur;
use opencv::imgproc::CHAIN_APPROX_SIMPLE;
use opencv::imgproc::COLOR_BGR2GRAY;
use opencv::imgproc::RETR_EXTERNAL;
use opencv::prelude::Mat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LocatorConfig;

pub const MIN_PLATE_ASPECT: f64 = 2.0;
pub const MAX_PLATE_ASPECT: f64 = 5.0;

/// Order in which matching regions are handed to the recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Contour enumeration order. Depends on the edge map, so not stable
    /// across small image changes.
    First,
    /// Largest bounding box first; ties keep enumeration order.
    LargestArea,
}

pub trait PlateLocator {
    /// All plate-shaped regions in `frame`, best first per the selection policy.
    fn locate(&self, frame: &Mat) -> opencv::Result<Vec<Rect>>;
}

impl<L: PlateLocator + ?Sized> PlateLocator for Box<L> {
    fn locate(&self, frame: &Mat) -> opencv::Result<Vec<Rect>> {
        (**self).locate(frame)
    }
}

/// Width-to-height ratio strictly inside `(min, max)`.
pub fn is_plate_aspect(width: i32, height: i32, min: f64, max: f64) -> bool {
    if width <= 0 || height <= 0 {
        return false;
    }
    let ratio = width as f64 / height as f64;
    ratio > min && ratio < max
}

pub struct ContourPlateLocator {
    blur_kernel: i32,
    canny_low: f64,
    canny_high: f64,
    min_aspect: f64,
    max_aspect: f64,
    selection: SelectionPolicy,
}

impl Default for ContourPlateLocator {
    fn default() -> Self {
        Self::from_config(&LocatorConfig::default())
    }
}

impl ContourPlateLocator {
    pub fn from_config(config: &LocatorConfig) -> Self {
        // Gaussian kernels must be odd.
        let blur_kernel = if config.blur_kernel % 2 == 0 {
            config.blur_kernel + 1
        } else {
            config.blur_kernel
        };
        Self {
            blur_kernel: blur_kernel.max(1),
            canny_low: config.canny_low,
            canny_high: config.canny_high,
            min_aspect: config.min_aspect,
            max_aspect: config.max_aspect,
            selection: config.selection,
        }
    }

    pub fn with_selection(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }

    fn edges(&self, frame: &Mat) -> opencv::Result<Mat> {
        let mut grey = Mat::default();
        cvt_color(frame, &mut grey, COLOR_BGR2GRAY, 0)?;

        let mut blurred = Mat::default();
        gaussian_blur(
            &grey,
            &mut blurred,
            Size::new(self.blur_kernel, self.blur_kernel),
            0.0,
            0.0,
            BORDER_DEFAULT,
        )?;

        let mut edges = Mat::default();
        canny(&blurred, &mut edges, self.canny_low, self.canny_high, 3, false)?;
        Ok(edges)
    }
}

impl PlateLocator for ContourPlateLocator {
    fn locate(&self, frame: &Mat) -> opencv::Result<Vec<Rect>> {
        let edges = self.edges(frame)?;

        let mut contours = Vector::<Vector<Point>>::new();
        find_contours(
            &edges,
            &mut contours,
            RETR_EXTERNAL,
            CHAIN_APPROX_SIMPLE,
            Point::new(0, 0),
        )?;

        let mut candidates = Vec::new();
        for contour in contours.iter() {
            let rect = bounding_rect(&contour)?;
            if is_plate_aspect(rect.width, rect.height, self.min_aspect, self.max_aspect) {
                candidates.push(rect);
            }
        }
        debug!(
            "{} contours, {} plate candidates",
            contours.len(),
            candidates.len()
        );

        if self.selection == SelectionPolicy::LargestArea {
            candidates
                .sort_by_key(|rect| std::cmp::Reverse(rect.width as i64 * rect.height as i64));
        }
        Ok(candidates)
    }
}
