// THEORY:
// The analytics module holds the domain vocabulary shared by every stage of the
// live pipeline: what goes out (an encoded frame), what comes back (one
// `AnalyticsPayload` per analyzer message), and the small value types the
// payload is made of. These are "dumb" data containers. They know how to
// describe themselves but never how to merge into state; that belongs to the
// reconciler.
//
// A payload is sparse by nature. The analyzer runs its heavy stages only every
// few frames, so most messages carry a count and a grid and nothing else. Every
// field is therefore optional, and absence always means "unchanged", never
// "reset".

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Prediction horizon the analyzer uses when it does not label one.
pub const DEFAULT_PREDICTION_HORIZON: &str = "30s";

/// One encoded camera sample, built per tick and consumed immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingFrame {
    /// JPEG bytes.
    pub image_bytes: Vec<u8>,
    /// Milliseconds since the sampler was started.
    pub captured_at_ms: u64,
}

/// A reference to an image produced by the analyzer: either raw base64 or a
/// complete `data:` URL, exactly as it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Renders the reference as a `data:` URL, using `mime` when the analyzer
    /// sent bare base64.
    pub fn to_data_url(&self, mime: &str) -> String {
        if self.0.starts_with("data:") {
            self.0.clone()
        } else {
            format!("data:{mime};base64,{}", self.0)
        }
    }

    /// Decodes the underlying image bytes.
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let encoded = match self.0.split_once(";base64,") {
            Some((_, tail)) if self.0.starts_with("data:") => tail,
            _ => self.0.as_str(),
        };
        BASE64.decode(encoded)
    }
}

/// A risk alert raised by the analyzer. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// The analyzer's forecast for the near future.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub horizon_label: String,
    pub expected_risk_level: String,
    pub heatmap_image: Option<ImageRef>,
}

impl Prediction {
    pub fn is_high_risk(&self) -> bool {
        self.expected_risk_level.eq_ignore_ascii_case("high")
    }
}

/// Logical grid the analyzer divides the frame into. Both sides are non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridDimensions {
    pub rows: u32,
    pub cols: u32,
}

impl GridDimensions {
    pub fn new(rows: u32, cols: u32) -> Option<Self> {
        (rows > 0 && cols > 0).then_some(Self { rows, cols })
    }

    pub fn contains(&self, cell: CellKey) -> bool {
        cell.row < self.rows && cell.col < self.cols
    }
}

/// Address of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub row: u32,
    pub col: u32,
}

impl CellKey {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

/// One point of the rolling people-count chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountPoint {
    pub timestamp_label: String,
    pub count: f64,
}

/// Everything one analyzer message can carry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsPayload {
    pub processed_frame: Option<ImageRef>,
    pub total_count: Option<u32>,
    pub alerts: Vec<Alert>,
    pub heatmap: Option<ImageRef>,
    pub prediction: Option<Prediction>,
    /// Averaged people count for the rolling chart.
    pub chart_point: Option<f64>,
    pub grid_dimensions: Option<GridDimensions>,
    /// `grid_counts[row][col]`.
    pub grid_counts: Option<Vec<Vec<u32>>>,
}

impl AnalyticsPayload {
    pub fn with_total_count(total_count: u32) -> Self {
        Self {
            total_count: Some(total_count),
            ..Self::default()
        }
    }

    /// True when the payload would leave every piece of state untouched.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_base64_is_wrapped_in_a_data_url() {
        let image = ImageRef::new("AAAA");
        assert_eq!(image.to_data_url("image/png"), "data:image/png;base64,AAAA");
    }

    #[test]
    fn data_urls_pass_through_untouched() {
        let image = ImageRef::new("data:image/png;base64,AAAA");
        assert_eq!(image.to_data_url("image/jpeg"), "data:image/png;base64,AAAA");
    }

    #[test]
    fn bytes_decode_from_either_form() {
        let raw = ImageRef::new(BASE64.encode([1u8, 2, 3]));
        let url = ImageRef::new(format!("data:image/png;base64,{}", BASE64.encode([1u8, 2, 3])));
        assert_eq!(raw.bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(url.bytes().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn grid_dimensions_reject_empty_sides() {
        assert!(GridDimensions::new(0, 4).is_none());
        assert!(GridDimensions::new(4, 0).is_none());
        let dims = GridDimensions::new(3, 5).unwrap();
        assert!(dims.contains(CellKey::new(2, 4)));
        assert!(!dims.contains(CellKey::new(3, 0)));
    }

    #[test]
    fn prediction_risk_is_case_insensitive() {
        let prediction = Prediction {
            horizon_label: DEFAULT_PREDICTION_HORIZON.to_string(),
            expected_risk_level: "HIGH".to_string(),
            heatmap_image: None,
        };
        assert!(prediction.is_high_risk());
    }

    #[test]
    fn alert_kind_uses_the_wire_name() {
        let alert: Alert =
            serde_json::from_str(r#"{"id":"a1","type":"High Risk","message":"m"}"#).unwrap();
        assert_eq!(alert.kind, "High Risk");
        assert!(serde_json::to_string(&alert).unwrap().contains(r#""type":"High Risk""#));
    }
}
