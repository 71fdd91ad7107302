//! Charging station controller
//!
//! Wires the transport, the EVSE connectors and the transaction
//! coordinator together, and exposes the operations the display API
//! calls.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::coordinator::{
    send_status_notification, Coordinator, EvseMap, TransactionSnapshot, TxRequest,
};
use super::handlers::{GetVariablesHandler, InboundRouter, SetVariablesHandler};
use super::messages::{self, BootOutcome, StationIdentity, BOOT_NOTIFICATION, HEARTBEAT};
use super::variables::StationVariables;
use crate::application::transport::{Continuation, CsmsTransport, InboundCall};
use crate::domain::evse::EvseState;
use crate::infrastructure::evse::EvseConnector;
use crate::support::errors::{StationError, TransportError};
use crate::support::shutdown::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct StationSettings {
    pub identity: StationIdentity,
    pub heartbeat_interval: Duration,
    pub tx_update_interval: Duration,
}

/// Cloneable handle to a running station.
#[derive(Clone)]
pub struct ChargingStation {
    identity: Arc<StationIdentity>,
    transport: CsmsTransport,
    evses: EvseMap,
    variables: Arc<StationVariables>,
    requests: mpsc::Sender<TxRequest>,
}

pub struct StationTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl StationTasks {
    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Station task panicked");
            }
        }
    }
}

impl ChargingStation {
    /// Start the heartbeat, inbound-call and transaction tasks. Does not
    /// boot; call [`ChargingStation::boot`] once the tasks are running.
    pub fn spawn(
        settings: StationSettings,
        transport: CsmsTransport,
        inbound: mpsc::Receiver<InboundCall>,
        evses: Vec<Arc<EvseConnector>>,
        shutdown: ShutdownSignal,
    ) -> (Self, StationTasks) {
        let evses: BTreeMap<i32, Arc<EvseConnector>> =
            evses.into_iter().map(|evse| (evse.id(), evse)).collect();
        let evses: EvseMap = Arc::new(evses);
        let variables = Arc::new(StationVariables::new(
            settings.heartbeat_interval,
            settings.tx_update_interval,
            settings.identity.station_id.clone(),
        ));
        let router = InboundRouter::new()
            .with_handler(Arc::new(SetVariablesHandler::new(variables.clone())))
            .with_handler(Arc::new(GetVariablesHandler::new(variables.clone())));

        let (requests, coordinator) = Coordinator::spawn(
            transport.clone(),
            evses.clone(),
            variables.clone(),
            shutdown.clone(),
        );
        let heartbeat = tokio::spawn(run_heartbeat(
            transport.clone(),
            variables.watch_heartbeat_interval(),
            shutdown.clone(),
        ));
        let inbound = tokio::spawn(run_inbound(router, transport.clone(), inbound, shutdown));

        let station = Self {
            identity: Arc::new(settings.identity),
            transport,
            evses,
            variables,
            requests,
        };
        let tasks = StationTasks {
            handles: vec![
                ("coordinator", coordinator),
                ("heartbeat", heartbeat),
                ("inbound", inbound),
            ],
        };
        (station, tasks)
    }

    /// Send BootNotification, adopt the heartbeat interval if the CSMS
    /// accepted the station, then report the status of every EVSE.
    pub async fn boot(&self) -> Result<BootOutcome, TransportError> {
        let payload = self
            .transport
            .request(BOOT_NOTIFICATION, messages::boot_notification(&self.identity))
            .await?;

        let outcome = match messages::parse_boot_response(payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Unreadable BootNotification response");
                BootOutcome {
                    accepted: false,
                    heartbeat_interval_secs: None,
                }
            }
        };

        if outcome.accepted {
            info!(station_id = %self.identity.station_id, "✅ Boot accepted by CSMS");
            if let Some(secs) = outcome.heartbeat_interval_secs {
                self.variables.set_heartbeat_interval(Duration::from_secs(secs));
            }
        } else {
            // Outside Accepted the interval is a retry delay, not a heartbeat.
            warn!(
                station_id = %self.identity.station_id,
                retry_after_secs = ?outcome.heartbeat_interval_secs,
                "Boot not accepted by CSMS"
            );
        }

        for evse in self.evses.values() {
            send_status_notification(&self.transport, evse).await;
        }
        Ok(outcome)
    }

    pub async fn start_charging(
        &self,
        evse_id: i32,
        id_token: impl Into<String>,
    ) -> Result<Uuid, StationError> {
        let (reply, rx) = oneshot::channel();
        self.submit(TxRequest::Start {
            evse_id,
            id_token: id_token.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| StationError::ControllerStopped)?
    }

    pub async fn stop_charging(
        &self,
        evse_id: i32,
        id_token: impl Into<String>,
    ) -> Result<(), StationError> {
        let (reply, rx) = oneshot::channel();
        self.submit(TxRequest::Stop {
            evse_id,
            id_token: id_token.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| StationError::ControllerStopped)?
    }

    /// Latest transaction on the EVSE, active or not.
    pub async fn transaction(&self, evse_id: i32) -> Result<Option<TransactionSnapshot>, StationError> {
        self.evse(evse_id)?;
        let (reply, rx) = oneshot::channel();
        self.submit(TxRequest::Snapshot { evse_id, reply }).await?;
        rx.await.map_err(|_| StationError::ControllerStopped)
    }

    async fn submit(&self, request: TxRequest) -> Result<(), StationError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| StationError::ControllerStopped)
    }

    pub fn charge_status(&self, evse_id: i32) -> Result<EvseState, StationError> {
        self.evse(evse_id).map(|evse| evse.state())
    }

    /// Every managed EVSE id, ascending.
    pub fn list_active_evse_ids(&self) -> Vec<i32> {
        self.evses.keys().copied().collect()
    }

    fn evse(&self, evse_id: i32) -> Result<&Arc<EvseConnector>, StationError> {
        self.evses
            .get(&evse_id)
            .ok_or(StationError::UnknownEvse(evse_id))
    }

    pub fn identity(&self) -> &StationIdentity {
        &self.identity
    }

    pub fn variables(&self) -> &StationVariables {
        &self.variables
    }

    pub fn transport(&self) -> &CsmsTransport {
        &self.transport
    }
}

async fn run_heartbeat(
    transport: CsmsTransport,
    mut interval: watch::Receiver<Duration>,
    shutdown: ShutdownSignal,
) {
    loop {
        let period = *interval.borrow_and_update();
        tokio::select! {
            _ = shutdown.wait() => break,
            changed = interval.changed() => {
                if changed.is_err() {
                    break;
                }
                info!(seconds = interval.borrow().as_secs(), "💓 Heartbeat interval changed");
            }
            _ = tokio::time::sleep(period) => {
                let continuation = Continuation::new(
                    |payload| debug!(response = %payload, "Heartbeat acknowledged"),
                    |error| warn!(code = %error.code, "Heartbeat rejected"),
                );
                match transport.try_send(HEARTBEAT, messages::heartbeat(), continuation) {
                    Ok(_) => {}
                    Err(TransportError::Closed) => {
                        warn!("Transport closed, stopping heartbeat");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Heartbeat not sent"),
                }
            }
        }
    }
    info!("Heartbeat stopped");
}

async fn run_inbound(
    router: InboundRouter,
    transport: CsmsTransport,
    mut inbound: mpsc::Receiver<InboundCall>,
    shutdown: ShutdownSignal,
) {
    loop {
        let call = tokio::select! {
            _ = shutdown.wait() => break,
            call = inbound.recv() => call,
        };
        let Some(call) = call else { break };

        let sent = match router.dispatch(&call).await {
            Ok(payload) => transport.reply(call.message_id.clone(), payload).await,
            Err(e) => {
                transport
                    .reply_error(call.message_id.clone(), e.code, e.description)
                    .await
            }
        };
        if let Err(e) = sent {
            warn!(message_id = %call.message_id, action = %call.action, error = %e, "Failed to answer pushed call");
        }
    }
    info!("Inbound call handler stopped");
}
