//! Device-model variables the CSMS can read and write.
//!
//! | Component          | Variable           | Access | Unit    |
//! |--------------------|--------------------|--------|---------|
//! | `OCPPCommCtrlr`    | `HeartbeatInterval`| rw     | seconds |
//! | `SampledDataCtrlr` | `TxUpdatedInterval`| rw     | seconds |
//! | `SecurityCtrlr`    | `Identity`         | ro     |         |

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

pub const OCPP_COMM_CTRLR: &str = "OCPPCommCtrlr";
pub const SAMPLED_DATA_CTRLR: &str = "SampledDataCtrlr";
pub const SECURITY_CTRLR: &str = "SecurityCtrlr";

pub const HEARTBEAT_INTERVAL: &str = "HeartbeatInterval";
pub const TX_UPDATED_INTERVAL: &str = "TxUpdatedInterval";
pub const IDENTITY: &str = "Identity";

/// `attributeStatus` values shared by SetVariableResult and GetVariableResult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VariableStatus {
    Accepted,
    Rejected,
    UnknownComponent,
    UnknownVariable,
}

pub struct StationVariables {
    heartbeat_interval: watch::Sender<Duration>,
    tx_updated_interval: watch::Sender<Duration>,
    identity: String,
}

impl StationVariables {
    pub fn new(
        heartbeat_interval: Duration,
        tx_updated_interval: Duration,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            heartbeat_interval: watch::Sender::new(heartbeat_interval),
            tx_updated_interval: watch::Sender::new(tx_updated_interval),
            identity: identity.into(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        *self.heartbeat_interval.borrow()
    }

    /// The heartbeat task re-arms its timer whenever this changes.
    pub fn watch_heartbeat_interval(&self) -> watch::Receiver<Duration> {
        self.heartbeat_interval.subscribe()
    }

    pub fn set_heartbeat_interval(&self, interval: Duration) {
        self.heartbeat_interval.send_replace(interval);
    }

    /// Applies to update loops started after the change.
    pub fn tx_updated_interval(&self) -> Duration {
        *self.tx_updated_interval.borrow()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn get(&self, component: &str, variable: &str) -> Result<String, VariableStatus> {
        match (component, variable) {
            (OCPP_COMM_CTRLR, HEARTBEAT_INTERVAL) => {
                Ok(self.heartbeat_interval().as_secs().to_string())
            }
            (SAMPLED_DATA_CTRLR, TX_UPDATED_INTERVAL) => {
                Ok(self.tx_updated_interval().as_secs().to_string())
            }
            (SECURITY_CTRLR, IDENTITY) => Ok(self.identity.clone()),
            (OCPP_COMM_CTRLR | SAMPLED_DATA_CTRLR | SECURITY_CTRLR, _) => {
                Err(VariableStatus::UnknownVariable)
            }
            _ => Err(VariableStatus::UnknownComponent),
        }
    }

    pub fn set(&self, component: &str, variable: &str, value: &str) -> VariableStatus {
        let target = match (component, variable) {
            (OCPP_COMM_CTRLR, HEARTBEAT_INTERVAL) => &self.heartbeat_interval,
            (SAMPLED_DATA_CTRLR, TX_UPDATED_INTERVAL) => &self.tx_updated_interval,
            (SECURITY_CTRLR, IDENTITY) => return VariableStatus::Rejected,
            (OCPP_COMM_CTRLR | SAMPLED_DATA_CTRLR | SECURITY_CTRLR, _) => {
                return VariableStatus::UnknownVariable
            }
            _ => return VariableStatus::UnknownComponent,
        };

        match parse_interval(value) {
            Some(interval) => {
                target.send_replace(interval);
                info!(component, variable, seconds = interval.as_secs(), "Variable updated");
                VariableStatus::Accepted
            }
            None => VariableStatus::Rejected,
        }
    }
}

/// Positive whole seconds.
fn parse_interval(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variables() -> StationVariables {
        StationVariables::new(Duration::from_secs(10), Duration::from_secs(5), "CS001")
    }

    #[test]
    fn reads_known_variables() {
        let vars = variables();
        assert_eq!(vars.get(OCPP_COMM_CTRLR, HEARTBEAT_INTERVAL).unwrap(), "10");
        assert_eq!(vars.get(SAMPLED_DATA_CTRLR, TX_UPDATED_INTERVAL).unwrap(), "5");
        assert_eq!(vars.get(SECURITY_CTRLR, IDENTITY).unwrap(), "CS001");
        assert_eq!(
            vars.get(OCPP_COMM_CTRLR, "RetryBackOffWaitMinimum"),
            Err(VariableStatus::UnknownVariable)
        );
        assert_eq!(
            vars.get("ClockCtrlr", "DateTime"),
            Err(VariableStatus::UnknownComponent)
        );
    }

    #[test]
    fn heartbeat_change_reaches_watchers() {
        let vars = variables();
        let mut watcher = vars.watch_heartbeat_interval();
        assert_eq!(
            vars.set(OCPP_COMM_CTRLR, HEARTBEAT_INTERVAL, "30"),
            VariableStatus::Accepted
        );
        assert!(watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_bad_values_and_read_only_variables() {
        let vars = variables();
        for bad in ["0", "-5", "ten", ""] {
            assert_eq!(
                vars.set(SAMPLED_DATA_CTRLR, TX_UPDATED_INTERVAL, bad),
                VariableStatus::Rejected
            );
        }
        assert_eq!(vars.tx_updated_interval(), Duration::from_secs(5));
        assert_eq!(vars.set(SECURITY_CTRLR, IDENTITY, "CS002"), VariableStatus::Rejected);
        assert_eq!(vars.identity(), "CS001");
    }
}
