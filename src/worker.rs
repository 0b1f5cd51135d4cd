/// worker support structs
///
use serde::{Deserialize, Serialize};

pub type JsonString = String;

pub const OK: &str = "ok";
pub const DOWN: &str = "down";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    #[default]
    Idle,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub pool: String,
    pub status: String,
    pub state: WorkerState,
    pub uptime: String,
    pub processed: u64,
    pub error_count: u16,
}

impl WorkerStatus {
    pub fn new(worker_id: String, pool: String, state: WorkerState, uptime: String) -> WorkerStatus {
        let status = match state {
            WorkerState::Shutdown => DOWN,
            _ => OK,
        };

        WorkerStatus {
            worker_id,
            pool,
            status: status.to_string(),
            state,
            uptime,
            processed: 0,
            error_count: 0,
        }
    }

    pub fn with_counts(mut self, processed: u64, error_count: u16) -> WorkerStatus {
        self.processed = processed;
        self.error_count = error_count;
        self
    }

    pub fn to_json(&self) -> JsonString {
        match serde_json::to_string(self) {
            Ok(js) => js,
            Err(e) => format!(r#"{}"status":"json parse error: {:?}"{}"#, "{", e, "}\n"),
        }
    }
}

/// formats elapsed seconds the way worker status reports show them: `0 days, 00:00:00`
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;
    format!("{} days, {:02}:{:02}:{:02}", days, hours, minutes, secs)
}

/// a 16 character alphanumeric worker id
pub fn create_worker_id() -> String {
    std::iter::repeat_with(fastrand::alphanumeric)
        .take(16)
        .collect()
}
