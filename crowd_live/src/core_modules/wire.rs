// THEORY:
// The wire module is the only place that knows what the analyzer's JSON looks
// like. Outbound it is trivial: one `{ "image": <base64 JPEG> }` object per
// accepted sample. Inbound it has to be forgiving, because the analyzer has
// shipped two shapes over time:
//
//   nested: { processed_frame, analysis: { total_count, alerts, liveHeatmap,
//             livePrediction, chartDataPoint, grid_dimensions, grid_counts } }
//   flat:   { frame, total_count, alerts }
//
// Both decode into the same `AnalyticsPayload`. A top-level `error` key wins
// over everything else and is terminal for the session. Anything that parses as
// JSON but fits neither shape is a protocol error: the message is dropped and
// the connection stays up.

use crate::core_modules::analytics::{
    Alert, AnalyticsPayload, DEFAULT_PREDICTION_HORIZON, GridDimensions, ImageRef, OutgoingFrame,
    Prediction,
};
use crate::error::{LiveError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Payload(AnalyticsPayload),
    /// The analyzer reported a failure; carries its message.
    Failure(String),
}

#[derive(Serialize)]
struct WireFrame<'a> {
    image: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct WireAnalysis {
    total_count: Option<u32>,
    alerts: Option<Vec<Alert>>,
    #[serde(rename = "liveHeatmap")]
    live_heatmap: Option<String>,
    #[serde(rename = "livePrediction")]
    live_prediction: Option<WirePrediction>,
    #[serde(rename = "chartDataPoint")]
    chart_data_point: Option<WireChartPoint>,
    grid_dimensions: Option<WireGridDimensions>,
    grid_counts: Option<Vec<Vec<u32>>>,
}

#[derive(Debug, Deserialize)]
struct WirePrediction {
    heatmap_prediction_b64: Option<String>,
    expected_risk_level: Option<String>,
    prediction_horizon: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChartPoint {
    count: f64,
}

#[derive(Debug, Deserialize)]
struct WireGridDimensions {
    rows: u32,
    cols: u32,
}

/// Serializes a sample into the analyzer's outbound message.
pub fn encode_frame(frame: &OutgoingFrame) -> Result<String> {
    let image = BASE64.encode(&frame.image_bytes);
    serde_json::to_string(&WireFrame { image: &image }).map_err(|e| LiveError::Encode(e.to_string()))
}

/// Decodes one inbound text message.
pub fn decode_inbound(text: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(text).map_err(protocol)?;
    let Value::Object(mut fields) = value else {
        return Err(LiveError::ProtocolError("expected a JSON object".to_string()));
    };

    if let Some(error) = fields.remove("error") {
        let message = match error {
            Value::String(message) => message,
            other => other.to_string(),
        };
        return Ok(Inbound::Failure(message));
    }

    let processed_frame = match take_string(&mut fields, "processed_frame")? {
        Some(frame) => Some(frame),
        None => take_string(&mut fields, "frame")?,
    };

    let analysis: WireAnalysis = match fields.remove("analysis") {
        Some(Value::Null) | None => serde_json::from_value(Value::Object(fields)).map_err(protocol)?,
        Some(nested) => serde_json::from_value(nested).map_err(protocol)?,
    };

    let payload = into_payload(analysis, processed_frame)?;
    if payload.is_empty() {
        return Err(LiveError::ProtocolError(
            "message carried no analytics".to_string(),
        ));
    }
    Ok(Inbound::Payload(payload))
}

fn into_payload(analysis: WireAnalysis, processed_frame: Option<String>) -> Result<AnalyticsPayload> {
    let grid_dimensions = match analysis.grid_dimensions {
        Some(dims) => Some(GridDimensions::new(dims.rows, dims.cols).ok_or_else(|| {
            LiveError::ProtocolError(format!(
                "grid dimensions must be positive, got {}x{}",
                dims.rows, dims.cols
            ))
        })?),
        None => None,
    };

    let prediction = analysis.live_prediction.map(|p| Prediction {
        horizon_label: p
            .prediction_horizon
            .unwrap_or_else(|| DEFAULT_PREDICTION_HORIZON.to_string()),
        expected_risk_level: p.expected_risk_level.unwrap_or_else(|| "N/A".to_string()),
        heatmap_image: p.heatmap_prediction_b64.map(ImageRef::new),
    });

    Ok(AnalyticsPayload {
        processed_frame: processed_frame.map(ImageRef::new),
        total_count: analysis.total_count,
        alerts: analysis.alerts.unwrap_or_default(),
        heatmap: analysis.live_heatmap.map(ImageRef::new),
        prediction,
        chart_point: analysis.chart_data_point.map(|p| p.count),
        grid_dimensions,
        grid_counts: analysis.grid_counts,
    })
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Result<Option<String>> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(LiveError::ProtocolError(format!(
            "`{key}` must be a string, got {other}"
        ))),
    }
}

fn protocol(err: serde_json::Error) -> LiveError {
    LiveError::ProtocolError(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::analytics::CellKey;

    fn payload(text: &str) -> AnalyticsPayload {
        match decode_inbound(text).expect("decodes") {
            Inbound::Payload(payload) => payload,
            Inbound::Failure(msg) => panic!("unexpected failure: {msg}"),
        }
    }

    #[test]
    fn outbound_frame_is_base64_jpeg_under_image() {
        let frame = OutgoingFrame {
            image_bytes: vec![0xFF, 0xD8, 0xFF],
            captured_at_ms: 42,
        };
        let json: Value = serde_json::from_str(&encode_frame(&frame).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({ "image": "/9j/" }));
    }

    #[test]
    fn decodes_the_nested_shape() {
        let p = payload(
            r#"{
                "processed_frame": "FRAME",
                "analysis": {
                    "total_count": 12,
                    "alerts": [{"id": "live-dense-1-2", "type": "High Risk Detected", "message": "Congestion in Central Area"}],
                    "liveHeatmap": "data:image/png;base64,HEAT",
                    "livePrediction": {"heatmap_prediction_b64": "PRED", "expected_risk_level": "High"},
                    "chartDataPoint": {"count": 11.5},
                    "grid_dimensions": {"rows": 2, "cols": 3},
                    "grid_counts": [[0, 1, 2], [3, 4, 5]]
                }
            }"#,
        );
        assert_eq!(p.processed_frame, Some(ImageRef::new("FRAME")));
        assert_eq!(p.total_count, Some(12));
        assert_eq!(p.alerts.len(), 1);
        assert_eq!(p.alerts[0].id, "live-dense-1-2");
        assert_eq!(p.heatmap, Some(ImageRef::new("data:image/png;base64,HEAT")));
        let prediction = p.prediction.unwrap();
        assert_eq!(prediction.horizon_label, "30s");
        assert!(prediction.is_high_risk());
        assert_eq!(prediction.heatmap_image, Some(ImageRef::new("PRED")));
        assert_eq!(p.chart_point, Some(11.5));
        let dims = p.grid_dimensions.unwrap();
        assert!(dims.contains(CellKey::new(1, 2)));
        assert_eq!(p.grid_counts.unwrap()[1][2], 5);
    }

    #[test]
    fn decodes_the_flat_shape() {
        let p = payload(r#"{"frame": "F", "total_count": 3, "alerts": []}"#);
        assert_eq!(p.processed_frame, Some(ImageRef::new("F")));
        assert_eq!(p.total_count, Some(3));
        assert!(p.alerts.is_empty());
        assert!(p.grid_dimensions.is_none());
    }

    #[test]
    fn missing_fields_stay_absent() {
        let p = payload(r#"{"analysis": {"total_count": 7}}"#);
        assert_eq!(p, AnalyticsPayload::with_total_count(7));
    }

    #[test]
    fn error_key_is_a_failure() {
        let inbound = decode_inbound(r#"{"error": "Could not open webcam."}"#).unwrap();
        assert_eq!(inbound, Inbound::Failure("Could not open webcam.".to_string()));
    }

    #[test]
    fn non_string_errors_are_stringified() {
        let inbound = decode_inbound(r#"{"error": {"code": 500}}"#).unwrap();
        assert_eq!(inbound, Inbound::Failure(r#"{"code":500}"#.to_string()));
    }

    #[test]
    fn malformed_messages_are_protocol_errors() {
        for text in [
            "not json",
            "[1, 2, 3]",
            "{}",
            r#"{"analysis": {"total_count": -1}}"#,
            r#"{"analysis": {"grid_dimensions": {"rows": 0, "cols": 4}}}"#,
            r#"{"processed_frame": 17, "analysis": {"total_count": 1}}"#,
            r#"{"analysis": {"alerts": [{"id": "a"}]}}"#,
        ] {
            let err = decode_inbound(text).unwrap_err();
            assert!(
                matches!(err, LiveError::ProtocolError(_)),
                "{text} gave {err:?}"
            );
        }
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let p = payload(r#"{"analysis": {"total_count": 2, "fps": 24.0}, "server": "v2"}"#);
        assert_eq!(p.total_count, Some(2));
    }
}
