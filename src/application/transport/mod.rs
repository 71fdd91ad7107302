//! CSMS transport
//!
//! ## Architecture
//!
//! ```text
//! send / try_send / request ──► bounded queue ──► writer task ──► FrameWriter
//!                                                    │ insert
//!                                                    ▼
//!                                              PendingCalls ◀── evict ── sweeper task
//!                                                    ▲ take
//!                                                    │
//! FrameReader ──► reader task ──► CallResult / CallError ──► continuation (once)
//!                      │
//!                      └──► Call ──► inbound queue ──► station controller
//! ```
//!
//! Frames are written in the order they were queued. Results are matched by
//! message id only, so calls may complete out of order. A call that gets no
//! answer within the response timeout is evicted and neither continuation
//! runs.

pub mod link;
pub mod pending;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::support::errors::TransportError;
use crate::support::ocpp_frame::Envelope;
use crate::support::shutdown::ShutdownSignal;

pub use link::{memory_link, FrameReader, FrameWriter, LoopbackPeer, MemoryReader, MemoryWriter};
pub use pending::{CallErrorInfo, Continuation, PendingCall, PendingCalls};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub response_timeout: Duration,
    pub sweep_interval: Duration,
    /// `send` waits and `try_send` fails with `Busy` once this many frames
    /// are queued.
    pub outbound_capacity: usize,
    /// Pushed calls beyond this many unconsumed are dropped.
    pub inbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(500),
            outbound_capacity: 100,
            inbound_capacity: 100,
        }
    }
}

/// A Call pushed by the CSMS, waiting for the controller to answer it.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCall {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

struct OutboundCall {
    message_id: String,
    action: String,
    payload: Value,
    continuation: Continuation,
}

enum Outbound {
    Call(OutboundCall),
    Reply(Envelope),
}

/// Cloneable handle to a running transport.
#[derive(Clone)]
pub struct CsmsTransport {
    outbound: mpsc::Sender<Outbound>,
    pending: Arc<PendingCalls>,
    /// Cleared when either the reader or the writer task exits.
    link_up: Arc<AtomicBool>,
    response_timeout: Duration,
}

pub struct TransportTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl TransportTasks {
    pub async fn join(self) {
        for (name, handle) in [
            ("reader", self.reader),
            ("writer", self.writer),
            ("sweeper", self.sweeper),
        ] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Transport task panicked");
            }
        }
    }
}

impl CsmsTransport {
    /// Start the reader, writer and sweeper tasks over an established link.
    pub fn spawn<W, R>(
        writer: W,
        reader: R,
        config: TransportConfig,
        shutdown: ShutdownSignal,
    ) -> (Self, mpsc::Receiver<InboundCall>, TransportTasks)
    where
        W: FrameWriter + 'static,
        R: FrameReader + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let pending = Arc::new(PendingCalls::new());

        let link_up = Arc::new(AtomicBool::new(true));

        let writer_link = link_up.clone();
        let writer_pending = pending.clone();
        let writer_shutdown = shutdown.clone();
        let reader_link = link_up.clone();
        let reader_pending = pending.clone();
        let reader_shutdown = shutdown.clone();

        let tasks = TransportTasks {
            writer: tokio::spawn(async move {
                run_writer(writer, outbound_rx, writer_pending, writer_shutdown).await;
                writer_link.store(false, Ordering::SeqCst);
            }),
            reader: tokio::spawn(async move {
                run_reader(reader, reader_pending, inbound_tx, reader_shutdown).await;
                reader_link.store(false, Ordering::SeqCst);
            }),
            sweeper: tokio::spawn(run_sweeper(
                pending.clone(),
                config.response_timeout,
                config.sweep_interval,
                shutdown,
            )),
        };

        let transport = Self {
            outbound: outbound_tx,
            pending,
            link_up,
            response_timeout: config.response_timeout,
        };
        (transport, inbound_rx, tasks)
    }

    fn call(action: String, payload: Value, continuation: Continuation) -> (String, Outbound) {
        let message_id = Uuid::new_v4().to_string();
        let outbound = Outbound::Call(OutboundCall {
            message_id: message_id.clone(),
            action,
            payload,
            continuation,
        });
        (message_id, outbound)
    }

    /// Queue a call, waiting for queue space if the writer is behind.
    /// Returns the message id.
    pub async fn send(
        &self,
        action: impl Into<String>,
        payload: Value,
        continuation: Continuation,
    ) -> Result<String, TransportError> {
        let (message_id, outbound) = Self::call(action.into(), payload, continuation);
        self.outbound
            .send(outbound)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(message_id)
    }

    /// Queue a call without waiting. Fails with `Busy` when the queue is full.
    pub fn try_send(
        &self,
        action: impl Into<String>,
        payload: Value,
        continuation: Continuation,
    ) -> Result<String, TransportError> {
        let (message_id, outbound) = Self::call(action.into(), payload, continuation);
        match self.outbound.try_send(outbound) {
            Ok(()) => Ok(message_id),
            Err(TrySendError::Full(_)) => Err(TransportError::Busy),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    /// Send a call and await its result. An evicted call yields `NoResponse`.
    pub async fn request(
        &self,
        action: impl Into<String>,
        payload: Value,
    ) -> Result<Value, TransportError> {
        let (continuation, rx) = Continuation::channel();
        self.send(action, payload, continuation).await?;
        match rx.await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(e)) => Err(TransportError::CallError {
                code: e.code,
                description: e.description,
            }),
            Err(_) => Err(TransportError::NoResponse),
        }
    }

    /// Answer a pushed call with a CallResult.
    pub async fn reply(
        &self,
        message_id: impl Into<String>,
        payload: Value,
    ) -> Result<(), TransportError> {
        self.enqueue_reply(Envelope::CallResult {
            message_id: message_id.into(),
            payload,
        })
        .await
    }

    /// Answer a pushed call with a CallError.
    pub async fn reply_error(
        &self,
        message_id: impl Into<String>,
        error_code: &str,
        description: impl Into<String>,
    ) -> Result<(), TransportError> {
        self.enqueue_reply(Envelope::error_reply(message_id, error_code, description))
            .await
    }

    async fn enqueue_reply(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Reply(envelope))
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Run one eviction pass as of `now`. The sweeper task calls this on
    /// every tick.
    pub fn evict_expired(&self, now: Instant) -> usize {
        sweep(&self.pending, now, self.response_timeout)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// False once the CSMS closed the socket or a read/write failed.
    pub fn is_connected(&self) -> bool {
        self.link_up.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }
}

// ── Tasks ──────────────────────────────────────────────────────

async fn run_writer<W: FrameWriter>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    pending: Arc<PendingCalls>,
    shutdown: ShutdownSignal,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.wait() => break,
            next = outbound.recv() => next,
        };
        let Some(next) = next else { break };

        match next {
            Outbound::Call(call) => {
                let OutboundCall {
                    message_id,
                    action,
                    payload,
                    continuation,
                } = call;

                let text = Envelope::Call {
                    message_id: message_id.clone(),
                    action: action.clone(),
                    payload: payload.clone(),
                }
                .encode();

                // Registered before the write so a fast reply always finds it.
                let entry = PendingCall {
                    action: action.clone(),
                    payload,
                    sent_at: Instant::now(),
                    continuation,
                };
                if pending.insert(message_id.clone(), entry).is_err() {
                    error!(message_id = %message_id, action = %action, "Message id already pending, dropping call");
                    continue;
                }

                debug!(message_id = %message_id, action = %action, "→ {}", text);
                if let Err(e) = writer.write_frame(text).await {
                    pending.take(&message_id);
                    error!(message_id = %message_id, action = %action, error = %e, "CSMS write failed");
                    break;
                }
                metrics::counter!("ocpp_calls_sent_total", "action" => action).increment(1);
            }
            Outbound::Reply(envelope) => {
                let message_id = envelope.message_id().to_string();
                let text = envelope.encode();
                debug!(message_id = %message_id, "→ {}", text);
                if let Err(e) = writer.write_frame(text).await {
                    error!(message_id = %message_id, error = %e, "CSMS write failed");
                    break;
                }
            }
        }
    }

    writer.close().await;
    info!("CSMS writer stopped");
}

async fn run_reader<R: FrameReader>(
    mut reader: R,
    pending: Arc<PendingCalls>,
    inbound: mpsc::Sender<InboundCall>,
    shutdown: ShutdownSignal,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.wait() => break,
            frame = reader.read_frame() => frame,
        };

        match frame {
            Some(Ok(text)) => dispatch_frame(&text, &pending, &inbound),
            Some(Err(e)) => {
                error!(error = %e, "CSMS read failed");
                break;
            }
            None => {
                warn!("CSMS closed the connection");
                break;
            }
        }
    }
    info!("CSMS reader stopped");
}

fn dispatch_frame(text: &str, pending: &PendingCalls, inbound: &mpsc::Sender<InboundCall>) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, frame = text, "Dropping malformed frame");
            metrics::counter!("ocpp_malformed_frames_total").increment(1);
            return;
        }
    };
    debug!(message_id = envelope.message_id(), "← {}", text);

    match envelope {
        Envelope::Call {
            message_id,
            action,
            payload,
        } => {
            let call = InboundCall {
                message_id,
                action,
                payload,
            };
            match inbound.try_send(call) {
                Ok(()) => {}
                Err(TrySendError::Full(call)) => {
                    warn!(message_id = %call.message_id, action = %call.action, "Inbound call queue full, dropping call");
                }
                Err(TrySendError::Closed(call)) => {
                    warn!(message_id = %call.message_id, action = %call.action, "No consumer for inbound calls, dropping call");
                }
            }
        }
        Envelope::CallResult {
            message_id,
            payload,
        } => match pending.take(&message_id) {
            Some(call) => {
                metrics::counter!("ocpp_call_results_total", "action" => call.action.clone())
                    .increment(1);
                call.continuation.succeed(payload);
            }
            None => {
                warn!(message_id = %message_id, "CallResult for unknown or expired call, dropping");
                metrics::counter!("ocpp_unmatched_responses_total").increment(1);
            }
        },
        Envelope::CallError {
            message_id,
            error_code,
            error_description,
            error_details,
        } => match pending.take(&message_id) {
            Some(call) => {
                warn!(
                    message_id = %message_id,
                    action = %call.action,
                    error_code = %error_code,
                    error_description = %error_description,
                    "CSMS answered with CallError"
                );
                metrics::counter!("ocpp_call_errors_total", "action" => call.action.clone())
                    .increment(1);
                call.continuation.fail(CallErrorInfo {
                    code: error_code,
                    description: error_description,
                    details: error_details,
                });
            }
            None => {
                warn!(message_id = %message_id, error_code = %error_code, "CallError for unknown or expired call, dropping");
                metrics::counter!("ocpp_unmatched_responses_total").increment(1);
            }
        },
    }
}

async fn run_sweeper(
    pending: Arc<PendingCalls>,
    timeout: Duration,
    interval: Duration,
    shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                sweep(&pending, Instant::now(), timeout);
            }
        }
    }

    // Awaiting requesters observe NoResponse.
    if !pending.is_empty() {
        info!(dropped = pending.len(), "Dropping unanswered calls");
        pending.clear();
    }
    info!("Pending-call sweeper stopped");
}

fn sweep(pending: &PendingCalls, now: Instant, timeout: Duration) -> usize {
    let evicted = pending.evict_expired(now, timeout);
    for (message_id, action) in &evicted {
        warn!(
            message_id = %message_id,
            action = %action,
            timeout_ms = timeout.as_millis() as u64,
            "No response within timeout, dropping call"
        );
        metrics::counter!("ocpp_calls_timed_out_total", "action" => action.clone()).increment(1);
    }
    evicted.len()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::support::ocpp_frame::error_code;

    const WAIT: Duration = Duration::from_secs(2);

    fn spawn_memory(
        config: TransportConfig,
    ) -> (
        CsmsTransport,
        mpsc::Receiver<InboundCall>,
        LoopbackPeer,
        ShutdownSignal,
    ) {
        let (writer, reader, peer) = memory_link();
        let shutdown = ShutdownSignal::new();
        let (transport, inbound, _tasks) =
            CsmsTransport::spawn(writer, reader, config, shutdown.clone());
        (transport, inbound, peer, shutdown)
    }

    async fn next_call(peer: &mut LoopbackPeer) -> (String, String, Value) {
        match tokio::time::timeout(WAIT, peer.recv()).await.unwrap().unwrap() {
            Envelope::Call {
                message_id,
                action,
                payload,
            } => (message_id, action, payload),
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    fn counting() -> (Continuation, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let ok = Arc::new(AtomicUsize::new(0));
        let err = Arc::new(AtomicUsize::new(0));
        let (o, e) = (ok.clone(), err.clone());
        let continuation = Continuation::new(
            move |_| {
                o.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            },
        );
        (continuation, ok, err)
    }

    /// Round-trips a Heartbeat so every frame the peer sent earlier has been
    /// processed by the reader.
    async fn sync(transport: &CsmsTransport, peer: &mut LoopbackPeer) {
        let t = transport.clone();
        let request = tokio::spawn(async move { t.request("Heartbeat", json!({})).await });
        let (id, _, _) = next_call(peer).await;
        peer.send(&Envelope::CallResult {
            message_id: id,
            payload: json!({}),
        })
        .unwrap();
        tokio::time::timeout(WAIT, request).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_by_message_id() {
        let (transport, _inbound, mut peer, _shutdown) = spawn_memory(TransportConfig::default());

        let mut handles = Vec::new();
        for n in 0..3 {
            let t = transport.clone();
            handles.push(tokio::spawn(async move {
                (n, t.request("DataTransfer", json!({ "n": n })).await)
            }));
        }

        let mut calls = Vec::new();
        for _ in 0..3 {
            calls.push(next_call(&mut peer).await);
        }
        // Answer in reverse order, echoing the request payload.
        for (id, _, payload) in calls.into_iter().rev() {
            peer.send(&Envelope::CallResult {
                message_id: id,
                payload,
            })
            .unwrap();
        }

        for handle in handles {
            let (n, result) = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
            assert_eq!(result.unwrap(), json!({ "n": n }));
        }
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn call_error_runs_error_continuation_once() {
        let (transport, _inbound, mut peer, _shutdown) = spawn_memory(TransportConfig::default());
        let (continuation, ok, err) = counting();

        let sent_id = transport
            .send("Authorize", json!({}), continuation)
            .await
            .unwrap();
        let (id, action, _) = next_call(&mut peer).await;
        assert_eq!(id, sent_id);
        assert_eq!(action, "Authorize");

        peer.send(&Envelope::error_reply(id.clone(), error_code::INTERNAL_ERROR, "boom"))
            .unwrap();
        // Duplicate answers for the same id are unmatched.
        peer.send(&Envelope::CallResult {
            message_id: id,
            payload: json!({}),
        })
        .unwrap();
        sync(&transport, &mut peer).await;

        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(err.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_surfaces_call_error() {
        let (transport, _inbound, mut peer, _shutdown) = spawn_memory(TransportConfig::default());
        let t = transport.clone();
        let request = tokio::spawn(async move { t.request("Authorize", json!({})).await });

        let (id, _, _) = next_call(&mut peer).await;
        peer.send(&Envelope::error_reply(id, error_code::NOT_IMPLEMENTED, "nope"))
            .unwrap();

        let result = tokio::time::timeout(WAIT, request).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(TransportError::CallError { ref code, .. }) if code == "NotImplemented"
        ));
    }

    #[tokio::test]
    async fn malformed_and_unmatched_frames_are_dropped() {
        let (transport, mut inbound, mut peer, _shutdown) = spawn_memory(TransportConfig::default());

        peer.send_raw("{not json").unwrap();
        peer.send_raw(r#"[9,"x",{}]"#).unwrap();
        peer.send(&Envelope::CallResult {
            message_id: "never-sent".into(),
            payload: json!({}),
        })
        .unwrap();
        peer.send(&Envelope::Call {
            message_id: "csms-1".into(),
            action: "SetVariables".into(),
            payload: json!({ "setVariableData": [] }),
        })
        .unwrap();

        let call = tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert_eq!(call.message_id, "csms-1");
        assert_eq!(call.action, "SetVariables");
        sync(&transport, &mut peer).await;
    }

    #[tokio::test]
    async fn full_inbound_queue_drops_extra_calls() {
        let config = TransportConfig {
            inbound_capacity: 1,
            ..Default::default()
        };
        let (transport, mut inbound, mut peer, _shutdown) = spawn_memory(config);

        for id in ["c1", "c2"] {
            peer.send(&Envelope::Call {
                message_id: id.into(),
                action: "GetVariables".into(),
                payload: json!({}),
            })
            .unwrap();
        }
        sync(&transport, &mut peer).await;

        assert_eq!(inbound.recv().await.unwrap().message_id, "c1");
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn unanswered_call_is_evicted_without_callback() {
        let config = TransportConfig {
            response_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (transport, _inbound, mut peer, _shutdown) = spawn_memory(config);
        let (continuation, ok, err) = counting();

        let id = transport
            .send("Heartbeat", json!({}), continuation)
            .await
            .unwrap();
        next_call(&mut peer).await;
        assert!(transport.is_pending(&id));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!transport.is_pending(&id));

        // A late answer no longer matches anything.
        peer.send(&Envelope::CallResult {
            message_id: id,
            payload: json!({}),
        })
        .unwrap();
        sync(&transport, &mut peer).await;
        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(err.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn explicit_sweep_evicts_after_timeout_window() {
        let config = TransportConfig {
            response_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let (transport, _inbound, mut peer, _shutdown) = spawn_memory(config);
        let id = transport
            .send("Heartbeat", json!({}), Continuation::ignore())
            .await
            .unwrap();
        next_call(&mut peer).await;

        assert_eq!(transport.evict_expired(Instant::now()), 0);
        assert!(transport.is_pending(&id));
        assert_eq!(transport.evict_expired(Instant::now() + Duration::from_secs(6)), 1);
        assert!(!transport.is_pending(&id));
    }

    #[tokio::test]
    async fn request_reports_no_response_after_eviction() {
        let config = TransportConfig {
            response_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (transport, _inbound, mut peer, _shutdown) = spawn_memory(config);
        let t = transport.clone();
        let request = tokio::spawn(async move { t.request("Authorize", json!({})).await });
        next_call(&mut peer).await;

        let result = tokio::time::timeout(WAIT, request).await.unwrap().unwrap();
        assert!(matches!(result, Err(TransportError::NoResponse)));
    }

    #[tokio::test]
    async fn replies_are_written_as_call_results() {
        let (transport, _inbound, mut peer, _shutdown) = spawn_memory(TransportConfig::default());
        transport
            .reply("csms-7", json!({ "setVariableResult": [] }))
            .await
            .unwrap();
        let frame = tokio::time::timeout(WAIT, peer.recv()).await.unwrap().unwrap();
        assert_eq!(
            frame,
            Envelope::CallResult {
                message_id: "csms-7".into(),
                payload: json!({ "setVariableResult": [] }),
            }
        );
    }

    struct StalledWriter {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl FrameWriter for StalledWriter {
        async fn write_frame(&mut self, _text: String) -> Result<(), TransportError> {
            self.release.notified().await;
            Ok(())
        }
    }

    struct SilentReader;

    #[async_trait]
    impl FrameReader for SilentReader {
        async fn read_frame(&mut self) -> Option<Result<String, TransportError>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn full_outbound_queue_applies_back_pressure() {
        let release = Arc::new(Notify::new());
        let config = TransportConfig {
            outbound_capacity: 1,
            ..Default::default()
        };
        let shutdown = ShutdownSignal::new();
        let (transport, _inbound, _tasks) = CsmsTransport::spawn(
            StalledWriter {
                release: release.clone(),
            },
            SilentReader,
            config,
            shutdown,
        );

        // The writer holds one call in flight and the queue holds one more.
        let mut busy = false;
        for _ in 0..4 {
            match transport.try_send("Heartbeat", json!({}), Continuation::ignore()) {
                Ok(_) => tokio::task::yield_now().await,
                Err(TransportError::Busy) => {
                    busy = true;
                    break;
                }
                Err(other) => panic!("Unexpected error {:?}", other),
            }
        }
        assert!(busy, "try_send must report Busy once the queue is full");

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            transport.send("Heartbeat", json!({}), Continuation::ignore()),
        )
        .await;
        assert!(blocked.is_err(), "send must wait while the queue is full");

        let t = transport.clone();
        let waiting = tokio::spawn(async move {
            t.send("Heartbeat", json!({}), Continuation::ignore()).await
        });
        let sent = tokio::time::timeout(WAIT, async {
            loop {
                release.notify_one();
                if waiting.is_finished() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(sent.is_ok(), "send must complete once the writer drains");
    }

    #[tokio::test]
    async fn shutdown_stops_tasks_and_closes_queue() {
        let (writer, reader, _peer) = memory_link();
        let shutdown = ShutdownSignal::new();
        let (transport, _inbound, tasks) = CsmsTransport::spawn(
            writer,
            reader,
            TransportConfig::default(),
            shutdown.clone(),
        );

        shutdown.trigger();
        tokio::time::timeout(WAIT, tasks.join()).await.unwrap();
        assert!(matches!(
            transport.send("Heartbeat", json!({}), Continuation::ignore()).await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn transport_can_be_shared_with_spawned_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PendingCalls>();
        assert_send_sync::<CsmsTransport>();
    }

    #[tokio::test]
    async fn calls_are_written_as_ocpp_j_arrays() {
        let (transport, _inbound, mut peer, _shutdown) = spawn_memory(TransportConfig::default());
        let message_id = transport
            .send("Heartbeat", json!({}), Continuation::ignore())
            .await
            .unwrap();

        let text = tokio::time::timeout(WAIT, peer.recv_raw()).await.unwrap().unwrap();
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame, json!([2, message_id, "Heartbeat", {}]));
    }

    #[tokio::test]
    async fn closed_socket_marks_link_down() {
        let (transport, _inbound, peer, _shutdown) = spawn_memory(TransportConfig::default());
        assert!(transport.is_connected());

        drop(peer);
        tokio::time::timeout(WAIT, async {
            while transport.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("link must be reported down after the peer goes away");
    }
}
