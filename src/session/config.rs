// Session configuration

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    media::MediaConstraints,
    producer::PublishPolicy,
    signaling::DEFAULT_ACK_TIMEOUT,
    simulcast::{default_video_layers, EncodingLayer},
    Result, SfuError,
};

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Time to wait for each router acknowledgement, in milliseconds
    pub ack_timeout_ms: u64,
    /// Bound on the best-effort leave notification, in milliseconds
    pub leave_timeout_ms: u64,
    /// Publish video with several encoding layers
    pub simulcast: bool,
    /// Video layers used when simulcast is enabled
    pub video_encodings: Vec<EncodingLayer>,
    /// Local capture request
    pub constraints: MediaConstraints,
    /// Close the signaling channel when leaving
    pub disconnect_on_leave: bool,
    /// Consume producers listed in the join reply before reporting joined
    pub consume_existing_producers: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT.as_millis() as u64,
            leave_timeout_ms: 2_000,
            simulcast: true,
            video_encodings: default_video_layers(),
            constraints: MediaConstraints::default(),
            disconnect_on_leave: true,
            consume_existing_producers: true,
        }
    }
}

impl SessionConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SfuError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw).map_err(|e| match e {
            SfuError::Config(message) => SfuError::Config(format!("{}: {}", path.display(), message)),
            other => other,
        })
    }

    /// Parse a configuration from JSON text
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|e| SfuError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.ack_timeout_ms == 0 {
            return Err(SfuError::Config("ackTimeoutMs must be positive".to_string()));
        }
        if self.simulcast && self.video_encodings.is_empty() {
            return Err(SfuError::Config(
                "simulcast needs at least one video encoding".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }

    /// Publishing rules derived from this configuration
    pub fn publish_policy(&self) -> PublishPolicy {
        PublishPolicy {
            simulcast: self.simulcast,
            video_layers: self.video_encodings.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.ack_timeout(), Duration::from_secs(8));
        assert_eq!(config.video_encodings.len(), 3);
        assert!(config.disconnect_on_leave);
        assert!(config.constraints.audio);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = SessionConfig::from_json(r#"{"ackTimeoutMs": 500, "simulcast": false}"#).unwrap();
        assert_eq!(config.ack_timeout(), Duration::from_millis(500));
        assert!(!config.publish_policy().simulcast);
        assert_eq!(config.leave_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(
            SessionConfig::from_json(r#"{"ackTimeoutMs": 0}"#),
            Err(SfuError::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_json(r#"{"videoEncodings": []}"#),
            Err(SfuError::Config(_))
        ));
        assert!(matches!(SessionConfig::from_json("not json"), Err(SfuError::Config(_))));
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = SessionConfig::from_json_file("/nonexistent/session.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/session.json"));
    }
}
