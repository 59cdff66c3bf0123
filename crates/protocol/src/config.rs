use serde::{Deserialize, Serialize};

/// Top-level client configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Transport connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Opus bitrate in bits per second
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: i32,
    /// Source frame rate assumed for camera capture
    #[serde(default = "default_source_fps")]
    pub source_frame_rate: u32,
    /// Forced keyframe cadence per simulcast layer, in seconds
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval_secs: u64,
    #[serde(default)]
    pub jitter: JitterConfig,
}

/// Jitter buffer tuning. Depth adapts between `min_ms` and `max_ms` around
/// three times the interarrival jitter estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitterConfig {
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    #[serde(default = "default_target_ms")]
    pub target_ms: u32,
    #[serde(default = "default_min_ms")]
    pub min_ms: u32,
    #[serde(default = "default_max_ms")]
    pub max_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Maximum automatic reconnect attempts per session
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    /// Reconnect delay ceiling
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            audio_bitrate: default_audio_bitrate(),
            source_frame_rate: default_source_fps(),
            keyframe_interval_secs: default_keyframe_interval(),
            jitter: JitterConfig::default(),
        }
    }
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            frame_ms: default_frame_ms(),
            target_ms: default_target_ms(),
            min_ms: default_min_ms(),
            max_ms: default_max_ms(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_reconnect_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl ClientConfig {
    /// Validate the configuration, returning all issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal) or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();
        let jitter = &self.media.jitter;
        if jitter.frame_ms == 0 {
            issues.push("ERROR: media.jitter.frame_ms must be non-zero".to_string());
        }
        if jitter.min_ms > jitter.max_ms {
            issues.push(format!(
                "ERROR: media.jitter.min_ms ({}) exceeds max_ms ({})",
                jitter.min_ms, jitter.max_ms
            ));
        }
        if jitter.target_ms < jitter.min_ms || jitter.target_ms > jitter.max_ms {
            issues.push(format!(
                "WARNING: media.jitter.target_ms ({}) outside [{}, {}]",
                jitter.target_ms, jitter.min_ms, jitter.max_ms
            ));
        }
        if self.media.source_frame_rate == 0 {
            issues.push("ERROR: media.source_frame_rate must be non-zero".to_string());
        }
        if self.gateway.backoff_base_ms == 0 {
            issues.push("ERROR: gateway.backoff_base_ms must be non-zero".to_string());
        }
        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

/// One simulcast encoding of the camera source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulcastLayer {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
}

/// The canonical layer ladder, lowest first.
pub const SIMULCAST_LAYERS: [SimulcastLayer; 3] = [
    SimulcastLayer { width: 320, height: 180, frame_rate: 15, bitrate_kbps: 150 },
    SimulcastLayer { width: 640, height: 360, frame_rate: 30, bitrate_kbps: 500 },
    SimulcastLayer { width: 1280, height: 720, frame_rate: 30, bitrate_kbps: 1500 },
];

/// Layers active for a capture source: every canonical layer no larger than
/// the source in both dimensions, and always at least the lowest one.
pub fn active_layers(source_width: u32, source_height: u32) -> &'static [SimulcastLayer] {
    let count = SIMULCAST_LAYERS
        .iter()
        .take_while(|l| l.width <= source_width && l.height <= source_height)
        .count()
        .max(1);
    &SIMULCAST_LAYERS[..count]
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_audio_bitrate() -> i32 {
    96_000
}
fn default_source_fps() -> u32 {
    30
}
fn default_keyframe_interval() -> u64 {
    5
}
fn default_frame_ms() -> u32 {
    20
}
fn default_target_ms() -> u32 {
    60
}
fn default_min_ms() -> u32 {
    20
}
fn default_max_ms() -> u32 {
    200
}
fn default_reconnect_attempts() -> u32 {
    10
}
fn default_backoff_base() -> u64 {
    1000
}
fn default_backoff_max() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config.media.connect_timeout_secs, 10);
        assert_eq!(config.media.audio_bitrate, 96_000);
        assert_eq!(config.media.jitter.frame_ms, 20);
        assert_eq!(config.media.jitter.target_ms, 60);
        assert_eq!(config.media.jitter.min_ms, 20);
        assert_eq!(config.media.jitter.max_ms, 200);
        assert_eq!(config.gateway.max_reconnect_attempts, 10);
        assert_eq!(config.gateway.backoff_base_ms, 1000);
        assert_eq!(config.gateway.backoff_max_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [media.jitter]
            target_ms = 80
            "#,
        )
        .unwrap();
        assert_eq!(config.media.jitter.target_ms, 80);
        assert_eq!(config.media.jitter.max_ms, 200);
    }

    #[test]
    fn validate_flags_inverted_bounds() {
        let mut config: ClientConfig = toml::from_str("").unwrap();
        config.media.jitter.min_ms = 300;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("min_ms")));
    }

    #[test]
    fn all_layers_active_at_full_hd() {
        assert_eq!(active_layers(1920, 1080).len(), 3);
    }

    #[test]
    fn exact_layer_size_counts_as_active() {
        assert_eq!(active_layers(1280, 720).len(), 3);
        assert_eq!(active_layers(640, 360).len(), 2);
    }

    #[test]
    fn tiny_source_keeps_lowest_layer() {
        let layers = active_layers(400, 240);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].width, 320);

        // Even below the lowest rung the ladder never empties.
        assert_eq!(active_layers(160, 90).len(), 1);
    }

    #[test]
    fn ladder_is_ordered_lowest_first() {
        for pair in SIMULCAST_LAYERS.windows(2) {
            assert!(pair[0].width < pair[1].width);
            assert!(pair[0].bitrate_kbps < pair[1].bitrate_kbps);
        }
    }
}
