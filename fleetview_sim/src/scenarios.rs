//! Fault scenarios for the location pipeline.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// FV-001: clean 1 Hz stream for a small fleet
    SteadyStream,

    /// FV-002: connection dropped repeatedly mid-stream
    FlappingLink,

    /// FV-003: server refuses every handshake
    RetryExhaustion,

    /// FV-004: duplicates, sentinel and null coordinates, truncated frames
    DirtyData,

    /// FV-005: out-of-order old frames replayed after fresh ones
    StaleReplay,

    /// FV-006: client restart with a persisted cache
    ColdStart,

    /// FV-007: manual reconnect onto a different channel
    TargetSwitch,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyStream,
            ScenarioId::FlappingLink,
            ScenarioId::RetryExhaustion,
            ScenarioId::DirtyData,
            ScenarioId::StaleReplay,
            ScenarioId::ColdStart,
            ScenarioId::TargetSwitch,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyStream => "steady_stream",
            ScenarioId::FlappingLink => "flapping_link",
            ScenarioId::RetryExhaustion => "retry_exhaustion",
            ScenarioId::DirtyData => "dirty_data",
            ScenarioId::StaleReplay => "stale_replay",
            ScenarioId::ColdStart => "cold_start",
            ScenarioId::TargetSwitch => "target_switch",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyStream => "20 vehicles at 1 Hz, markers converge on the latest fix",
            ScenarioId::FlappingLink => "Ungraceful drops every few seconds, cache never cleared",
            ScenarioId::RetryExhaustion => "All handshakes refused, Failed after the retry budget",
            ScenarioId::DirtyData => "Duplicates, (0,0), nulls and truncated frames never reach the map",
            ScenarioId::StaleReplay => "Old frames replayed after fresh ones are no-ops",
            ScenarioId::ColdStart => "Restart shows persisted positions, 24h retention enforced",
            ScenarioId::TargetSwitch => "reconnect(new target) moves the single subscription",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_stream" | "steady" | "fv-001" => Ok(ScenarioId::SteadyStream),
            "flapping_link" | "flapping" | "fv-002" => Ok(ScenarioId::FlappingLink),
            "retry_exhaustion" | "exhaustion" | "fv-003" => Ok(ScenarioId::RetryExhaustion),
            "dirty_data" | "dirty" | "fv-004" => Ok(ScenarioId::DirtyData),
            "stale_replay" | "replay" | "fv-005" => Ok(ScenarioId::StaleReplay),
            "cold_start" | "coldstart" | "fv-006" => Ok(ScenarioId::ColdStart),
            "target_switch" | "switch" | "fv-007" => Ok(ScenarioId::TargetSwitch),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
