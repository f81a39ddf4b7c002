use serde::{Deserialize, Serialize};

/// How direction is determined for an encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderMode {
    /// One channel; direction comes from an external flag.
    #[default]
    SingleChannel,
    /// Two channels in quadrature; direction from their relative phase.
    Quadrature,
}

/// `data` field of an encoder telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderReading {
    pub tick_count: i64,
    /// Signed, metres.
    pub total_distance: f64,
    /// m/s over the velocity window.
    pub velocity: f64,
    /// +1 forward, -1 reverse.
    pub direction: i8,
    pub rpm: f64,
    pub distance_per_tick: f64,
    pub interrupt_count: u64,
    pub mode: EncoderMode,
    /// Set in single-channel mode, where direction is assumed rather than
    /// measured.
    pub direction_ambiguous: bool,
    #[serde(default)]
    pub last_edge_age_ms: Option<u64>,
    /// Times the count was reset to zero.
    #[serde(default)]
    pub resets: u64,
}
