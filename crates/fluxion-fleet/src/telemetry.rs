// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Telemetry module for reporting fleet update events

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub enum FleetEvent {
    UpdateStarted {
        device_types: Vec<String>,
        versions: Vec<String>,
    },
    DeviceTypeUpdated {
        device_type: String,
        from_version: String,
        to_version: String,
    },
    WorkerRestarted {
        device_id: String,
        version: String,
    },
    UpdateAborted {
        stage: &'static str,
        reason: String,
        consecutive_aborts: u32,
    },
    StageTwoHandedOff {
        coordinator: String,
        to_version: String,
    },
    SupervisorReplaced {
        to_version: String,
    },
}

/// Log an update event as JSON
///
/// Fire-and-forget: a serialization failure is logged and never reaches the
/// update flow.
pub fn report_event(event: &FleetEvent) {
    match serde_json::to_string(event) {
        Ok(event_json) => tracing::info!("Telemetry event: {event_json}"),
        Err(e) => tracing::warn!("Failed to serialize telemetry event: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_variant_tag() {
        let event = FleetEvent::UpdateAborted {
            stage: "stage one",
            reason: "timeout".to_owned(),
            consecutive_aborts: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.starts_with("{\"UpdateAborted\""));
        assert!(json.contains("\"consecutive_aborts\":2"));
        report_event(&event);
    }
}
