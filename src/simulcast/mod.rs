// Simulcast module for the session core
//
// This module describes the encoding layers a video producer is published
// with.

use serde::{Deserialize, Serialize};

use crate::media::MediaKind;

/// One simulcast encoding layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingLayer {
    /// Restriction identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    /// Maximum bitrate in bps
    pub max_bitrate: u32,
    /// Resolution divisor relative to the captured track
    pub scale_resolution_down_by: f32,
}

impl EncodingLayer {
    pub fn new(rid: &str, max_bitrate: u32, scale_resolution_down_by: f32) -> Self {
        Self {
            rid: Some(rid.to_string()),
            max_bitrate,
            scale_resolution_down_by,
        }
    }
}

/// Default video layers: quarter, half and full resolution
pub fn default_video_layers() -> Vec<EncodingLayer> {
    vec![
        EncodingLayer::new("q", 150_000, 4.0),
        EncodingLayer::new("h", 400_000, 2.0),
        EncodingLayer::new("f", 1_200_000, 1.0),
    ]
}

/// Layers to publish a track of `kind` with.
///
/// Explicit layers win; otherwise video gets `defaults` when simulcast is
/// enabled and audio never gets layers.
pub fn layers_for(
    kind: MediaKind,
    explicit: Option<Vec<EncodingLayer>>,
    simulcast: bool,
    defaults: &[EncodingLayer],
) -> Vec<EncodingLayer> {
    match (kind, explicit) {
        (MediaKind::Audio, _) => Vec::new(),
        (MediaKind::Video, Some(layers)) => layers,
        (MediaKind::Video, None) if simulcast => defaults.to_vec(),
        (MediaKind::Video, None) => Vec::new(),
    }
}

/// Check layers ascend in bitrate and descend in scale-down factor
pub fn is_ascending(layers: &[EncodingLayer]) -> bool {
    layers.windows(2).all(|pair| {
        pair[0].max_bitrate < pair[1].max_bitrate
            && pair[0].scale_resolution_down_by >= pair[1].scale_resolution_down_by
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layers_ascend() {
        let layers = default_video_layers();
        assert_eq!(layers.len(), 3);
        assert!(is_ascending(&layers));
        assert_eq!(layers[0].max_bitrate, 150_000);
        assert_eq!(layers[2].scale_resolution_down_by, 1.0);
    }

    #[test]
    fn test_layers_for_kind() {
        let defaults = default_video_layers();
        assert!(layers_for(MediaKind::Audio, Some(defaults.clone()), true, &defaults).is_empty());
        assert_eq!(layers_for(MediaKind::Video, None, true, &defaults).len(), 3);
        assert!(layers_for(MediaKind::Video, None, false, &defaults).is_empty());

        let single = vec![EncodingLayer::new("f", 900_000, 1.0)];
        assert_eq!(layers_for(MediaKind::Video, Some(single.clone()), true, &defaults), single);
    }

    #[test]
    fn test_encoding_layer_wire_shape() {
        let value = serde_json::to_value(EncodingLayer::new("h", 400_000, 2.0)).unwrap();
        assert_eq!(value["rid"], "h");
        assert_eq!(value["maxBitrate"], 400_000);
        assert_eq!(value["scaleResolutionDownBy"], 2.0);
    }
}
