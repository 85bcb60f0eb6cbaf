// SSE event types for the launch and stop streams. Each variant serializes to the `data:
// <json>\n\n` wire form spec'd for the HTTP surface; `step` names and `progress` percentages are
// cumulative markers a client can render directly as a progress bar.

use axum::response::sse::Event;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Connecting,
    Submitting,
    Submitted,
    Waiting,
    Starting,
    Establishing,
    Verifying,
    Cancelling,
    Launching,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum GatewayEvent {
    Progress {
        step: Step,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        node: Option<String>,
    },
    Pending {
        job_id: String,
        start_time: Option<String>,
        message: String,
    },
    Complete {
        status: String,
        hpc: String,
        ide: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        node: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        redirect_url: Option<String>,
    },
    Error {
        message: String,
    },
}

impl GatewayEvent {
    pub fn progress(step: Step, message: impl Into<String>) -> Self {
        GatewayEvent::Progress {
            step,
            progress: None,
            message: message.into(),
            job_id: None,
            node: None,
        }
    }

    pub fn to_sse_event(&self) -> Event {
        Event::default().json_data(self).unwrap_or_else(|_| Event::default().data("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_event_serializes_with_type_tag() {
        let ev = GatewayEvent::progress(Step::Connecting, "opening ssh channel");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["step"], "connecting");
    }

    #[test]
    fn complete_event_omits_absent_optionals() {
        let ev = GatewayEvent::Complete {
            status: "pending".to_string(),
            hpc: "gemini".to_string(),
            ide: "vscode".to_string(),
            job_id: None,
            node: None,
            redirect_url: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert!(json.get("jobId").is_none());
        assert_eq!(json["status"], "pending");
    }
}
