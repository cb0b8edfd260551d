use crate::core::detector::Detection;
use serde::{Deserialize, Serialize};

/// Confidence a detection must exceed to become a region.
pub const DEFAULT_MIN_SCORE: f32 = 5.0;

/// Axis-aligned rectangle in source-image pixel coordinates.
///
/// `max_x`/`max_y` are exclusive. Regions are not clipped; they may extend
/// past the image they were detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceRegion {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl FaceRegion {
    pub fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> i32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> i32 {
        self.max_y - self.min_y
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// Intersection with `other`; the result may be empty.
    pub fn intersect(&self, other: &FaceRegion) -> FaceRegion {
        FaceRegion {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        }
    }
}

/// Turns raw detections into face regions.
pub struct RegionExtractor {
    min_score: f32,
}

impl RegionExtractor {
    pub fn new(min_score: f32) -> Self {
        Self { min_score }
    }

    pub fn min_score(&self) -> f32 {
        self.min_score
    }

    /// Square of side `scale` centred on each detection scoring strictly
    /// above the threshold, in input order.
    ///
    /// Detections with a non-positive scale cannot describe a face and are
    /// dropped alongside low-confidence ones, as are detections whose
    /// corners overflow `i32`.
    pub fn extract(&self, detections: &[Detection]) -> Vec<FaceRegion> {
        detections
            .iter()
            .filter(|d| d.score > self.min_score)
            .filter_map(|d| {
                if d.scale <= 0 {
                    log::debug!("Dropping detection with non-positive scale: {:?}", d);
                    return None;
                }
                let half = d.scale.div_euclid(2);
                let corners = (
                    d.col.checked_sub(half),
                    d.row.checked_sub(half),
                    d.col.checked_add(half),
                    d.row.checked_add(half),
                );
                match corners {
                    (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) => Some(FaceRegion {
                        min_x,
                        min_y,
                        max_x,
                        max_y,
                    }),
                    _ => {
                        log::debug!("Dropping detection outside the coordinate range: {:?}", d);
                        None
                    }
                }
            })
            .collect()
    }
}

impl Default for RegionExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SCORE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_derivation() {
        let extractor = RegionExtractor::default();
        let regions = extractor.extract(&[Detection::new(100, 100, 40, 10.0)]);

        assert_eq!(regions, vec![FaceRegion::new(80, 80, 120, 120)]);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let extractor = RegionExtractor::default();
        let detections = vec![
            Detection::new(10, 10, 10, 5.0),
            Detection::new(20, 20, 10, 5.01),
            Detection::new(30, 30, 10, 1.0),
        ];

        let regions = extractor.extract(&detections);

        assert_eq!(regions, vec![FaceRegion::new(15, 15, 25, 25)]);
    }

    #[test]
    fn test_output_preserves_input_order() {
        let extractor = RegionExtractor::new(0.0);
        let detections = vec![
            Detection::new(300, 10, 20, 1.0),
            Detection::new(5, 200, 20, 9.0),
            Detection::new(150, 150, 20, 3.0),
        ];

        let regions = extractor.extract(&detections);

        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0], FaceRegion::new(0, 290, 20, 310));
        assert_eq!(regions[1], FaceRegion::new(190, -5, 210, 15));
        assert_eq!(regions[2], FaceRegion::new(140, 140, 160, 160));
    }

    #[test]
    fn test_odd_scale_floors_half() {
        let extractor = RegionExtractor::default();
        let regions = extractor.extract(&[Detection::new(50, 50, 21, 6.0)]);

        assert_eq!(regions, vec![FaceRegion::new(40, 40, 60, 60)]);
    }

    #[test]
    fn test_non_positive_scale_is_discarded() {
        let extractor = RegionExtractor::default();
        let detections = vec![
            Detection::new(50, 50, 0, 9.0),
            Detection::new(50, 50, -12, 9.0),
        ];

        assert!(extractor.extract(&detections).is_empty());
    }

    #[test]
    fn test_overflowing_corners_are_discarded() {
        let extractor = RegionExtractor::default();
        let detections = vec![
            Detection::new(10, i32::MAX - 5, 40, 9.0),
            Detection::new(i32::MIN + 3, 10, 40, 9.0),
            Detection::new(100, 100, 40, 9.0),
        ];

        assert_eq!(
            extractor.extract(&detections),
            vec![FaceRegion::new(80, 80, 120, 120)]
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(RegionExtractor::default().extract(&[]).is_empty());
    }

    #[test]
    fn test_intersect_and_empty() {
        let region = FaceRegion::new(-10, -10, 30, 30);
        let bounds = FaceRegion::new(0, 0, 20, 20);

        assert_eq!(region.intersect(&bounds), FaceRegion::new(0, 0, 20, 20));
        assert!(FaceRegion::new(25, 0, 40, 10).intersect(&bounds).is_empty());
    }

    #[test]
    fn test_serializes_with_camel_case_fields() {
        let json = serde_json::to_string(&FaceRegion::new(1, 2, 3, 4)).unwrap();
        assert_eq!(json, r#"{"minX":1,"minY":2,"maxX":3,"maxY":4}"#);
    }
}
