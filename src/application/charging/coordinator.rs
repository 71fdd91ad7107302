//! Transaction coordinator
//!
//! One task owns every [`Transaction`]. Operator requests arrive on a
//! bounded queue. Authorize results, EVSE disconnect hooks and update
//! timers arrive on an unbounded event queue, since they are posted from
//! synchronous continuations that must not block the transport reader.
//!
//! ```text
//! start ──► Started ──► Authorize ─┬─ Accepted ──► enable, Updated/Authorized, update loop
//!                                  └─ rejected ──► Ended (nothing sent)
//! stop  ──► Authorize ─┬─ Accepted ──► disable, Updated/StopAuthorized, wait for unplug
//!                      └─ rejected ──► back to InProgress
//! unplug ─► Ended ──► (delivered) StatusNotification, in_progress = false
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::messages::{self, AUTHORIZE, STATUS_NOTIFICATION, TRANSACTION_EVENT};
use super::variables::StationVariables;
use crate::application::transport::{Continuation, CsmsTransport};
use crate::domain::evse::{Edge, EvseFlag};
use crate::domain::transaction::{
    Transaction, TransactionEvent, TransactionPhase, TransitionError,
};
use crate::infrastructure::evse::EvseConnector;
use crate::support::errors::{StationError, TransportError};
use crate::support::shutdown::ShutdownSignal;

const REQUEST_QUEUE_CAPACITY: usize = 32;

pub(crate) type EvseMap = Arc<BTreeMap<i32, Arc<EvseConnector>>>;

pub(crate) enum TxRequest {
    Start {
        evse_id: i32,
        id_token: String,
        reply: oneshot::Sender<Result<Uuid, StationError>>,
    },
    Stop {
        evse_id: i32,
        id_token: String,
        reply: oneshot::Sender<Result<(), StationError>>,
    },
    Snapshot {
        evse_id: i32,
        reply: oneshot::Sender<Option<TransactionSnapshot>>,
    },
}

#[derive(Debug, Clone, Copy)]
enum TxEvent {
    Authorized {
        evse_id: i32,
        transaction_id: Uuid,
        accepted: bool,
    },
    StopAuthorized {
        evse_id: i32,
        transaction_id: Uuid,
        accepted: bool,
    },
    EvDisconnected {
        evse_id: i32,
        transaction_id: Uuid,
    },
    EndedDelivered {
        evse_id: i32,
        transaction_id: Uuid,
        delivered: bool,
    },
    UpdateDue {
        evse_id: i32,
        transaction_id: Uuid,
    },
}

/// Read-only view of the latest transaction on an EVSE.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSnapshot {
    pub transaction_id: Uuid,
    pub evse_id: i32,
    pub phase: TransactionPhase,
    pub next_seq_no: u64,
    pub in_progress: bool,
    pub id_token: String,
    pub started_at: DateTime<Utc>,
}

impl From<&Transaction> for TransactionSnapshot {
    fn from(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            evse_id: tx.evse_id,
            phase: tx.phase(),
            next_seq_no: tx.next_seq_no(),
            in_progress: tx.in_progress(),
            id_token: tx.id_token.clone(),
            started_at: tx.started_at,
        }
    }
}

struct Slot {
    transaction: Transaction,
    /// Dropping the sender stops the update loop.
    ticker: Option<watch::Sender<bool>>,
}

pub(crate) struct Coordinator {
    transport: CsmsTransport,
    evses: EvseMap,
    variables: Arc<StationVariables>,
    slots: HashMap<i32, Slot>,
    events: mpsc::UnboundedSender<TxEvent>,
    shutdown: ShutdownSignal,
}

impl Coordinator {
    pub(crate) fn spawn(
        transport: CsmsTransport,
        evses: EvseMap,
        variables: Arc<StationVariables>,
        shutdown: ShutdownSignal,
    ) -> (mpsc::Sender<TxRequest>, JoinHandle<()>) {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            transport,
            evses,
            variables,
            slots: HashMap::new(),
            events: events_tx,
            shutdown,
        };
        let handle = tokio::spawn(coordinator.run(requests_rx, events_rx));
        (requests_tx, handle)
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<TxRequest>,
        mut events: mpsc::UnboundedReceiver<TxEvent>,
    ) {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                Some(request) = requests.recv() => self.on_request(request).await,
                Some(event) = events.recv() => self.on_event(event).await,
                else => break,
            }
        }
        self.slots.clear();
        info!("Transaction coordinator stopped");
    }

    async fn on_request(&mut self, request: TxRequest) {
        match request {
            TxRequest::Start {
                evse_id,
                id_token,
                reply,
            } => {
                let result = self.start(evse_id, id_token).await;
                let _ = reply.send(result);
            }
            TxRequest::Stop {
                evse_id,
                id_token,
                reply,
            } => {
                let result = self.stop(evse_id, id_token).await;
                let _ = reply.send(result);
            }
            TxRequest::Snapshot { evse_id, reply } => {
                let snapshot = self
                    .slots
                    .get(&evse_id)
                    .map(|slot| TransactionSnapshot::from(&slot.transaction));
                let _ = reply.send(snapshot);
            }
        }
    }

    async fn on_event(&mut self, event: TxEvent) {
        match event {
            TxEvent::Authorized {
                evse_id,
                transaction_id,
                accepted,
            } => self.on_authorized(evse_id, transaction_id, accepted).await,
            TxEvent::StopAuthorized {
                evse_id,
                transaction_id,
                accepted,
            } => self.on_stop_authorized(evse_id, transaction_id, accepted).await,
            TxEvent::EvDisconnected {
                evse_id,
                transaction_id,
            } => self.on_disconnected(evse_id, transaction_id).await,
            TxEvent::EndedDelivered {
                evse_id,
                transaction_id,
                delivered,
            } => self.on_ended_delivered(evse_id, transaction_id, delivered).await,
            TxEvent::UpdateDue {
                evse_id,
                transaction_id,
            } => self.on_update_due(evse_id, transaction_id).await,
        }
    }

    // ── Operator requests ──────────────────────────────────────

    async fn start(&mut self, evse_id: i32, id_token: String) -> Result<Uuid, StationError> {
        let evse = self.evse(evse_id)?;

        if let Some(slot) = self.slots.get_mut(&evse_id) {
            let tx = &mut slot.transaction;
            if tx.is_active() {
                let stale = tx.phase() == TransactionPhase::AwaitingAuthorization
                    && tx.phase_age() > self.transport.response_timeout();
                if !stale {
                    return Err(StationError::TransactionActive(evse_id));
                }
                warn!(evse_id, transaction_id = %tx.id, "Authorization never answered, abandoning transaction");
                tx.abandon();
                slot.ticker = None;
            }
        }

        let mut transaction = Transaction::new(evse_id, id_token.clone());
        let started = transaction
            .begin(evse.meter_sample())
            .map_err(|e| invalid_phase(evse_id, e))?;
        let transaction_id = transaction.id;
        info!(evse_id, transaction_id = %transaction_id, "🚗 Transaction created");
        self.slots.insert(
            evse_id,
            Slot {
                transaction,
                ticker: None,
            },
        );

        self.emit(&started, logged(TRANSACTION_EVENT, evse_id)).await?;
        send_status_notification(&self.transport, &evse).await;
        self.transport
            .send(
                AUTHORIZE,
                messages::authorize(&id_token),
                authorization_reply(self.events.clone(), move |accepted| TxEvent::Authorized {
                    evse_id,
                    transaction_id,
                    accepted,
                }),
            )
            .await?;
        Ok(transaction_id)
    }

    async fn stop(&mut self, evse_id: i32, id_token: String) -> Result<(), StationError> {
        self.evse(evse_id)?;
        let slot = self
            .slots
            .get_mut(&evse_id)
            .filter(|slot| slot.transaction.is_active())
            .ok_or(StationError::NoActiveTransaction(evse_id))?;

        slot.transaction
            .request_stop(id_token.clone())
            .map_err(|e| invalid_phase(evse_id, e))?;
        let transaction_id = slot.transaction.id;
        info!(evse_id, transaction_id = %transaction_id, "Stop requested, authorizing");

        self.transport
            .send(
                AUTHORIZE,
                messages::authorize(&id_token),
                authorization_reply(self.events.clone(), move |accepted| {
                    TxEvent::StopAuthorized {
                        evse_id,
                        transaction_id,
                        accepted,
                    }
                }),
            )
            .await?;
        Ok(())
    }

    // ── Events ─────────────────────────────────────────────────

    async fn on_authorized(&mut self, evse_id: i32, transaction_id: Uuid, accepted: bool) {
        let Some(evse) = self.evses.get(&evse_id).cloned() else { return };
        let Some(slot) = self.slot_for(evse_id, transaction_id) else { return };

        if !accepted {
            match slot.transaction.reject_authorization() {
                Ok(()) => warn!(evse_id, transaction_id = %transaction_id, "Authorization rejected, transaction aborted"),
                Err(e) => warn!(evse_id, transaction_id = %transaction_id, error = %e, "Ignoring authorization result"),
            }
            return;
        }

        let event = match slot.transaction.authorize(evse.meter_sample()) {
            Ok(event) => event,
            Err(e) => {
                warn!(evse_id, transaction_id = %transaction_id, error = %e, "Ignoring authorization result");
                return;
            }
        };
        let (ticker, running) = watch::channel(true);
        slot.ticker = Some(ticker);

        evse.enable_charging();
        if let Err(e) = self.emit(&event, logged(TRANSACTION_EVENT, evse_id)).await {
            error!(evse_id, transaction_id = %transaction_id, error = %e, "Failed to queue transaction event");
        }
        self.spawn_update_loop(evse_id, transaction_id, running);
    }

    async fn on_stop_authorized(&mut self, evse_id: i32, transaction_id: Uuid, accepted: bool) {
        let Some(evse) = self.evses.get(&evse_id).cloned() else { return };
        let Some(slot) = self.slot_for(evse_id, transaction_id) else { return };

        if !accepted {
            match slot.transaction.reject_stop() {
                Ok(()) => warn!(evse_id, transaction_id = %transaction_id, "Stop authorization rejected, transaction continues"),
                Err(e) => warn!(evse_id, transaction_id = %transaction_id, error = %e, "Ignoring stop authorization result"),
            }
            return;
        }

        let event = match slot.transaction.authorize_stop(evse.meter_sample()) {
            Ok(event) => event,
            Err(e) => {
                warn!(evse_id, transaction_id = %transaction_id, error = %e, "Ignoring stop authorization result");
                return;
            }
        };

        evse.disable_charging();
        if let Err(e) = self.emit(&event, logged(TRANSACTION_EVENT, evse_id)).await {
            error!(evse_id, transaction_id = %transaction_id, error = %e, "Failed to queue transaction event");
        }

        let events = self.events.clone();
        let hook = evse.try_once_on_edge(EvseFlag::EvConnected, Edge::Falling, move |_| {
            let _ = events.send(TxEvent::EvDisconnected {
                evse_id,
                transaction_id,
            });
        });
        if hook.is_none() {
            debug!(evse_id, transaction_id = %transaction_id, "EV already unplugged");
            self.on_disconnected(evse_id, transaction_id).await;
        }
    }

    async fn on_disconnected(&mut self, evse_id: i32, transaction_id: Uuid) {
        let Some(evse) = self.evses.get(&evse_id).cloned() else { return };
        let Some(slot) = self.slot_for(evse_id, transaction_id) else { return };

        let event = match slot.transaction.end(evse.meter_sample()) {
            Ok(event) => event,
            Err(e) => {
                warn!(evse_id, transaction_id = %transaction_id, error = %e, "Ignoring EV disconnect");
                return;
            }
        };
        slot.ticker = None;

        let on_success = self.events.clone();
        let on_error = self.events.clone();
        let continuation = Continuation::new(
            move |_| {
                let _ = on_success.send(TxEvent::EndedDelivered {
                    evse_id,
                    transaction_id,
                    delivered: true,
                });
            },
            move |error| {
                warn!(evse_id, transaction_id = %transaction_id, code = %error.code, "CSMS rejected Ended event");
                let _ = on_error.send(TxEvent::EndedDelivered {
                    evse_id,
                    transaction_id,
                    delivered: false,
                });
            },
        );

        if let Err(e) = self.emit(&event, continuation).await {
            error!(evse_id, transaction_id = %transaction_id, error = %e, "Failed to queue Ended event");
            self.on_ended_delivered(evse_id, transaction_id, false).await;
        }
    }

    async fn on_ended_delivered(&mut self, evse_id: i32, transaction_id: Uuid, delivered: bool) {
        let Some(evse) = self.evses.get(&evse_id).cloned() else { return };
        let Some(slot) = self.slot_for(evse_id, transaction_id) else { return };

        slot.transaction.close();
        slot.ticker = None;
        info!(evse_id, transaction_id = %transaction_id, delivered, "🏁 Transaction ended");

        if delivered {
            send_status_notification(&self.transport, &evse).await;
        }
    }

    async fn on_update_due(&mut self, evse_id: i32, transaction_id: Uuid) {
        let Some(evse) = self.evses.get(&evse_id).cloned() else { return };
        let Some(slot) = self.slot_for(evse_id, transaction_id) else { return };

        if !slot.transaction.accepts_periodic_update() {
            if !slot.transaction.in_progress() {
                slot.ticker = None;
            }
            return;
        }

        match slot.transaction.periodic_update(evse.meter_sample()) {
            Ok(event) => {
                if let Err(e) = self.emit(&event, logged(TRANSACTION_EVENT, evse_id)).await {
                    error!(evse_id, transaction_id = %transaction_id, error = %e, "Failed to queue transaction event");
                }
            }
            Err(e) => debug!(evse_id, transaction_id = %transaction_id, error = %e, "Skipping update"),
        }
    }

    // ── Helpers ────────────────────────────────────────────────

    fn evse(&self, evse_id: i32) -> Result<Arc<EvseConnector>, StationError> {
        self.evses
            .get(&evse_id)
            .cloned()
            .ok_or(StationError::UnknownEvse(evse_id))
    }

    /// The slot for `evse_id`, if it still holds `transaction_id`. Results
    /// for a replaced transaction are stale and dropped.
    fn slot_for(&mut self, evse_id: i32, transaction_id: Uuid) -> Option<&mut Slot> {
        match self.slots.get_mut(&evse_id) {
            Some(slot) if slot.transaction.id == transaction_id => Some(slot),
            _ => {
                debug!(evse_id, transaction_id = %transaction_id, "Dropping event for replaced transaction");
                None
            }
        }
    }

    async fn emit(
        &self,
        event: &TransactionEvent,
        continuation: Continuation,
    ) -> Result<(), TransportError> {
        info!(
            evse_id = event.evse_id,
            transaction_id = %event.transaction_id,
            seq_no = event.seq_no,
            event_type = ?event.event_type,
            trigger_reason = ?event.trigger_reason,
            "Transaction event"
        );
        metrics::counter!(
            "ocpp_transaction_events_total",
            "trigger" => format!("{:?}", event.trigger_reason)
        )
        .increment(1);
        self.transport
            .send(
                TRANSACTION_EVENT,
                messages::transaction_event(event),
                continuation,
            )
            .await
            .map(|_| ())
    }

    fn spawn_update_loop(
        &self,
        evse_id: i32,
        transaction_id: Uuid,
        mut running: watch::Receiver<bool>,
    ) {
        let period = self.variables.tx_updated_interval();
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    changed = running.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if events.send(TxEvent::UpdateDue { evse_id, transaction_id }).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(evse_id, transaction_id = %transaction_id, "Update loop stopped");
        });
    }
}

fn invalid_phase(evse_id: i32, e: TransitionError) -> StationError {
    StationError::InvalidPhase {
        evse_id,
        action: e.action,
        phase: e.phase,
    }
}

/// Continuation that only logs a CallError.
pub(crate) fn logged(action: &'static str, evse_id: i32) -> Continuation {
    Continuation::new(
        |_| {},
        move |error| {
            warn!(evse_id, action, code = %error.code, description = %error.description, "CSMS rejected call");
        },
    )
}

/// Posts the outcome of an Authorize call. A CallError counts as a
/// rejection. An evicted call posts nothing.
fn authorization_reply<F>(events: mpsc::UnboundedSender<TxEvent>, outcome: F) -> Continuation
where
    F: Fn(bool) -> TxEvent + Clone + Send + Sync + 'static,
{
    let on_error_events = events.clone();
    let on_error_outcome = outcome.clone();
    Continuation::new(
        move |payload| {
            let _ = events.send(outcome(messages::authorization_accepted(payload)));
        },
        move |error| {
            warn!(code = %error.code, description = %error.description, "Authorize failed");
            let _ = on_error_events.send(on_error_outcome(false));
        },
    )
}

pub(crate) async fn send_status_notification(transport: &CsmsTransport, evse: &EvseConnector) {
    let state = evse.state();
    let payload = messages::status_notification(&state, Utc::now());
    debug!(evse_id = state.id, status = ?messages::connector_status(&state), "Sending status notification");
    if let Err(e) = transport
        .send(STATUS_NOTIFICATION, payload, logged(STATUS_NOTIFICATION, state.id))
        .await
    {
        warn!(evse_id = state.id, error = %e, "Failed to queue status notification");
    }
}
