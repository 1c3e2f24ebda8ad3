//! Typed broker statistics.
//!
//! The broker reports statistics as YAML dictionaries. These types name the
//! fields the client relies on; a dictionary missing any required field is
//! rejected at the adapter boundary with [`QueueError::MalformedResponse`]
//! instead of surfacing as silent defaults downstream.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::job::{JobId, JobPriority, JobState};

/// Per-job statistics (`stats-job`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobStats {
    pub id: JobId,
    pub tube: String,
    pub state: JobState,
    pub pri: JobPriority,
    pub age: u64,
    pub delay: u64,
    pub ttr: u64,
    pub time_left: u64,
    #[serde(default)]
    pub file: u64,
    /// Times the job has been reserved, including a current reservation.
    pub reserves: u32,
    pub timeouts: u32,
    pub releases: u32,
    pub buries: u32,
    pub kicks: u32,
}

/// Per-tube statistics (`stats-tube`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TubeStats {
    pub name: String,
    pub current_jobs_urgent: u64,
    pub current_jobs_ready: u64,
    pub current_jobs_reserved: u64,
    pub current_jobs_delayed: u64,
    pub current_jobs_buried: u64,
    pub total_jobs: u64,
    pub current_using: u64,
    pub current_watching: u64,
    pub current_waiting: u64,
    #[serde(default)]
    pub cmd_delete: u64,
    #[serde(default)]
    pub cmd_pause_tube: u64,
    /// Seconds the tube was paused for; 0 when not paused.
    pub pause: u64,
    pub pause_time_left: u64,
}

impl TubeStats {
    pub fn is_paused(&self) -> bool {
        self.pause > 0 || self.pause_time_left > 0
    }
}

/// Server-wide statistics (`stats`). Only the fields the client reports on
/// are named; everything else is kept verbatim in `extra`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerStats {
    pub current_jobs_urgent: u64,
    pub current_jobs_ready: u64,
    pub current_jobs_reserved: u64,
    pub current_jobs_delayed: u64,
    pub current_jobs_buried: u64,
    pub total_jobs: u64,
    pub current_tubes: u64,
    pub current_connections: u64,
    pub uptime: u64,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Parse a YAML body returned for `command`.
pub(crate) fn parse_yaml<T: DeserializeOwned>(
    command: &str,
    body: &[u8],
) -> Result<T> {
    serde_yaml::from_slice(body).map_err(|err| QueueError::malformed(command, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB_YAML: &str = "---\nid: 42\ntube: ORDERS\nstate: reserved\npri: 1024\nage: 3\ndelay: 0\nttr: 60\ntime-left: 59\nfile: 0\nreserves: 2\ntimeouts: 0\nreleases: 1\nburies: 0\nkicks: 0\n";

    #[test]
    fn parses_job_stats() {
        let stats: JobStats = parse_yaml("stats-job", JOB_YAML.as_bytes()).unwrap();
        assert_eq!(stats.id, JobId(42));
        assert_eq!(stats.tube, "ORDERS");
        assert_eq!(stats.state, JobState::Reserved);
        assert_eq!(stats.reserves, 2);
        assert_eq!(stats.pri, JobPriority(1024));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let truncated = JOB_YAML.replace("reserves: 2\n", "");
        let err = parse_yaml::<JobStats>("stats-job", truncated.as_bytes()).unwrap_err();
        match err {
            QueueError::MalformedResponse { command, detail } => {
                assert_eq!(command, "stats-job");
                assert!(detail.contains("reserves"), "{detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn tube_pause_state() {
        let yaml = "---\nname: MAIL\ncurrent-jobs-urgent: 0\ncurrent-jobs-ready: 3\ncurrent-jobs-reserved: 0\ncurrent-jobs-delayed: 1\ncurrent-jobs-buried: 0\ntotal-jobs: 9\ncurrent-using: 1\ncurrent-watching: 1\ncurrent-waiting: 0\ncmd-delete: 5\ncmd-pause-tube: 1\npause: 30\npause-time-left: 12\n";
        let stats: TubeStats = parse_yaml("stats-tube", yaml.as_bytes()).unwrap();
        assert!(stats.is_paused());
        assert_eq!(stats.current_jobs_ready, 3);

        let resumed = TubeStats {
            pause: 0,
            pause_time_left: 0,
            ..stats
        };
        assert!(!resumed.is_paused());
    }

    #[test]
    fn server_stats_keeps_unnamed_fields() {
        let yaml = "---\ncurrent-jobs-urgent: 0\ncurrent-jobs-ready: 1\ncurrent-jobs-reserved: 0\ncurrent-jobs-delayed: 0\ncurrent-jobs-buried: 2\ntotal-jobs: 10\ncurrent-tubes: 3\ncurrent-connections: 4\nuptime: 100\nversion: \"1.13\"\ncmd-put: 10\n";
        let stats: ServerStats = parse_yaml("stats", yaml.as_bytes()).unwrap();
        assert_eq!(stats.current_jobs_buried, 2);
        assert_eq!(stats.version.as_deref(), Some("1.13"));
        assert!(stats.extra.contains_key("cmd-put"));
    }
}
