//! EVSE connector
//!
//! Owns the link to one EVSE controller. A single link task writes
//! commands and polls, and feeds every reply line into
//! [`EvseConnector::process_reply`], which is the only writer of the
//! connector's [`EvseState`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::line_protocol::{parse_reply, EvseCommand, EvseReply, LineError};
use crate::domain::evse::{
    Edge, EdgeEvent, EdgeHooks, EvseFlag, EvseState, FiredHooks, HookToken, MeterReport,
    StatusReport,
};
use crate::domain::transaction::MeterSample;
use crate::support::errors::BootstrapError;
use crate::support::shutdown::ShutdownSignal;

const COMMAND_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub poll_interval: Duration,
    /// An unanswered poll older than this is abandoned and sent again.
    pub request_timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(300),
            request_timeout: Duration::from_millis(2000),
        }
    }
}

struct Inner {
    state: EvseState,
    hooks: EdgeHooks,
}

pub struct EvseConnector {
    id: i32,
    inner: Mutex<Inner>,
    commands: mpsc::Sender<EvseCommand>,
}

impl EvseConnector {
    /// Connector with no link attached. Commands land on the returned
    /// receiver and readings arrive only through `process_reply`.
    pub fn detached(id: i32) -> (Arc<Self>, mpsc::Receiver<EvseCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let connector = Arc::new(Self {
            id,
            inner: Mutex::new(Inner {
                state: EvseState::new(id),
                hooks: EdgeHooks::new(),
            }),
            commands: tx,
        });
        (connector, rx)
    }

    /// Dial the EVSE controller over TCP and start polling it.
    pub async fn connect(
        id: i32,
        addr: &str,
        password: Option<String>,
        options: PollOptions,
        shutdown: ShutdownSignal,
    ) -> Result<Arc<Self>, BootstrapError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| BootstrapError::EvseConnect {
                evse_id: id,
                addr: addr.to_string(),
                source,
            })?;
        info!(evse_id = id, addr, "🔌 Connected to EVSE controller");
        Ok(Self::attach(id, stream, password, options, shutdown))
    }

    /// Start the link task over any byte stream.
    pub fn attach<S>(
        id: i32,
        stream: S,
        password: Option<String>,
        options: PollOptions,
        shutdown: ShutdownSignal,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (connector, commands) = Self::detached(id);
        tokio::spawn(run_link(
            connector.clone(),
            stream,
            commands,
            password,
            options,
            shutdown,
        ));
        connector
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> EvseState {
        self.lock().state.clone()
    }

    pub fn meter_sample(&self) -> MeterSample {
        let inner = self.lock();
        MeterSample {
            energy_active_net_wh: inner.state.energy_active_net_wh,
            power_active_import_w: inner.state.power_active_import_w,
        }
    }

    pub fn enable_charging(&self) {
        self.command(EvseCommand::Start);
    }

    pub fn disable_charging(&self) {
        self.command(EvseCommand::Stop);
    }

    fn command(&self, command: EvseCommand) {
        match self.commands.try_send(command) {
            Ok(()) => debug!(evse_id = self.id, ?command, "Queued EVSE command"),
            Err(TrySendError::Full(_)) => {
                warn!(evse_id = self.id, ?command, "EVSE command queue full, dropping command")
            }
            Err(TrySendError::Closed(_)) => {
                warn!(evse_id = self.id, ?command, "EVSE link is down, dropping command")
            }
        }
    }

    pub fn on_edge(
        &self,
        flag: EvseFlag,
        edge: Edge,
        hook: impl Fn(&EdgeEvent) + Send + Sync + 'static,
    ) -> HookToken {
        self.lock().hooks.on_edge(flag, edge, Arc::new(hook))
    }

    pub fn once_on_edge(
        &self,
        flag: EvseFlag,
        edge: Edge,
        hook: impl FnOnce(&EdgeEvent) + Send + 'static,
    ) -> HookToken {
        self.lock().hooks.once(flag, edge, Box::new(hook))
    }

    /// Like [`Self::once_on_edge`], but registers nothing and returns `None`
    /// when the flag already sits on the far side of `edge`. The check and
    /// the registration happen under one lock, so no edge is missed.
    pub fn try_once_on_edge(
        &self,
        flag: EvseFlag,
        edge: Edge,
        hook: impl FnOnce(&EdgeEvent) + Send + 'static,
    ) -> Option<HookToken> {
        let mut inner = self.lock();
        let settled = inner.state.flag(flag) == (edge == Edge::Rising);
        if settled {
            None
        } else {
            Some(inner.hooks.once(flag, edge, Box::new(hook)))
        }
    }

    /// Apply one reply line from the controller. Hooks run after the state
    /// lock is released, in edge order.
    pub fn process_reply(&self, line: &str) -> Result<(), LineError> {
        match parse_reply(line)? {
            EvseReply::Status(report) => self.apply_status(&report),
            EvseReply::Meter(report) => self.apply_meter(&report),
        }
        Ok(())
    }

    fn apply_status(&self, report: &StatusReport) {
        let fired: Vec<FiredHooks> = {
            let mut inner = self.lock();
            let edges = inner.state.apply_status(report);
            edges
                .iter()
                .map(|event| {
                    debug!(evse_id = self.id, flag = ?event.flag, edge = ?event.edge, "EVSE edge");
                    inner.hooks.take_fired(event)
                })
                .collect()
        };
        for hooks in fired {
            hooks.run();
        }
    }

    fn apply_meter(&self, report: &MeterReport) {
        self.lock().state.apply_meter(report);
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn run_link<S>(
    connector: Arc<EvseConnector>,
    stream: S,
    mut commands: mpsc::Receiver<EvseCommand>,
    password: Option<String>,
    options: PollOptions,
    shutdown: ShutdownSignal,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let evse_id = connector.id();
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    if let Some(password) = password {
        if let Err(e) = write_line(&mut write_half, &format!("{}\n", password.trim())).await {
            error!(evse_id, error = %e, "Failed to authenticate with EVSE controller");
            return;
        }
    }

    let mut poll = tokio::time::interval(options.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Replies still owed for the last poll, and when it was sent.
    let mut awaiting: usize = 0;
    let mut polled_at = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = poll.tick() => {
                if awaiting > 0 {
                    if polled_at.elapsed() < options.request_timeout {
                        continue;
                    }
                    warn!(evse_id, "EVSE did not answer the last poll, polling again");
                }
                let result = async {
                    write_line(&mut write_half, EvseCommand::StatusQuery.as_line()).await?;
                    write_line(&mut write_half, EvseCommand::MeterQuery.as_line()).await
                }
                .await;
                if let Err(e) = result {
                    error!(evse_id, error = %e, "EVSE write failed");
                    break;
                }
                awaiting = 2;
                polled_at = Instant::now();
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                if let Err(e) = write_line(&mut write_half, command.as_line()).await {
                    error!(evse_id, error = %e, "EVSE write failed");
                    break;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    debug!(evse_id, reply = line, "EVSE reply");
                    match connector.process_reply(line) {
                        Ok(()) => awaiting = awaiting.saturating_sub(1),
                        Err(e) => warn!(evse_id, error = %e, "Ignoring EVSE reply"),
                    }
                }
                Ok(None) => {
                    warn!(evse_id, "EVSE controller closed the connection");
                    break;
                }
                Err(e) => {
                    error!(evse_id, error = %e, "EVSE read failed");
                    break;
                }
            },
        }
    }
    info!(evse_id, "EVSE link stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn count_edge(connector: &EvseConnector, flag: EvseFlag, edge: Edge) -> Arc<AtomicUsize> {
        let hits = counter();
        let h = hits.clone();
        connector.on_edge(flag, edge, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        hits
    }

    #[test]
    fn ev_connected_edges_fire_once_each_and_in_order() {
        let (connector, _commands) = EvseConnector::detached(1);
        connector.process_reply("status: 0,1,1,0").unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for edge in [Edge::Rising, Edge::Falling] {
            let o = order.clone();
            connector.on_edge(EvseFlag::EvConnected, edge, move |e| {
                o.lock().unwrap().push(e.edge);
            });
        }
        let enabled_rising = count_edge(&connector, EvseFlag::ChargingEnabled, Edge::Rising);
        let enabled_falling = count_edge(&connector, EvseFlag::ChargingEnabled, Edge::Falling);

        connector.process_reply("status: 1,1,1,0").unwrap();
        connector.process_reply("status: 0,1,1,0").unwrap();

        assert_eq!(*order.lock().unwrap(), vec![Edge::Rising, Edge::Falling]);
        assert_eq!(enabled_rising.load(Ordering::SeqCst), 0);
        assert_eq!(enabled_falling.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn identical_reports_never_refire() {
        let (connector, _commands) = EvseConnector::detached(1);
        let rising = count_edge(&connector, EvseFlag::Charging, Edge::Rising);
        let once = counter();
        let o = once.clone();
        connector.once_on_edge(EvseFlag::Charging, Edge::Rising, move |_| {
            o.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            connector.process_reply("status: 1,1,1,0").unwrap();
        }
        assert_eq!(rising.load(Ordering::SeqCst), 1);
        assert_eq!(once.load(Ordering::SeqCst), 1);

        connector.process_reply("status: 1,1,0,0").unwrap();
        connector.process_reply("status: 1,1,1,0").unwrap();
        assert_eq!(rising.load(Ordering::SeqCst), 2);
        assert_eq!(once.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn malformed_replies_leave_state_untouched() {
        let (connector, _commands) = EvseConnector::detached(4);
        connector.process_reply("status: 1,0,0,0").unwrap();
        connector.process_reply("metervalues: 900,3000").unwrap();
        let before = connector.state();

        assert!(connector.process_reply("status: 0,0").is_err());
        assert!(connector.process_reply("metervalues 10,10").is_err());
        connector.process_reply("metervalues: oops,oops").unwrap();

        assert_eq!(connector.state(), before);
        assert_eq!(
            connector.meter_sample(),
            MeterSample {
                energy_active_net_wh: 900,
                power_active_import_w: 3000
            }
        );
    }

    #[test]
    fn try_once_on_edge_skips_settled_flags() {
        let (connector, _commands) = EvseConnector::detached(1);
        assert!(connector
            .try_once_on_edge(EvseFlag::EvConnected, Edge::Falling, |_| {})
            .is_none());

        connector.process_reply("status: 1,0,0,0").unwrap();
        let fired = counter();
        let f = fired.clone();
        let token = connector.try_once_on_edge(EvseFlag::EvConnected, Edge::Falling, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(token.is_some());
        connector.process_reply("status: 0,0,0,0").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn commands_go_to_the_queue() {
        let (connector, mut commands) = EvseConnector::detached(1);
        connector.enable_charging();
        connector.disable_charging();
        assert_eq!(commands.recv().await, Some(EvseCommand::Start));
        assert_eq!(commands.recv().await, Some(EvseCommand::Stop));
    }

    async fn read_line(lines: &mut tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>) -> String {
        tokio::time::timeout(WAIT, lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn link_authenticates_polls_and_applies_replies() {
        let (station_side, controller_side) = tokio::io::duplex(1024);
        let shutdown = ShutdownSignal::new();
        let connector = EvseConnector::attach(
            2,
            station_side,
            Some("secret\n".into()),
            PollOptions {
                poll_interval: Duration::from_millis(10),
                request_timeout: Duration::from_secs(5),
            },
            shutdown.clone(),
        );

        let (read_half, mut write_half) = tokio::io::split(controller_side);
        let mut lines = BufReader::new(read_half).lines();

        assert_eq!(read_line(&mut lines).await, "secret");
        assert_eq!(read_line(&mut lines).await, "status?");
        assert_eq!(read_line(&mut lines).await, "metervalues?");

        write_half
            .write_all(b"status: 1,0,0,0\nmetervalues: 1500,7000\n")
            .await
            .unwrap();

        tokio::time::timeout(WAIT, async {
            while connector.state().energy_active_net_wh != 1500 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(connector.state().ev_connected);

        connector.enable_charging();
        tokio::time::timeout(WAIT, async {
            loop {
                if read_line(&mut lines).await == "start" {
                    break;
                }
            }
        })
        .await
        .unwrap();

        shutdown.trigger();
    }

    #[tokio::test]
    async fn unanswered_poll_is_not_repeated_before_timeout() {
        let (station_side, controller_side) = tokio::io::duplex(1024);
        let shutdown = ShutdownSignal::new();
        let _connector = EvseConnector::attach(
            3,
            station_side,
            None,
            PollOptions {
                poll_interval: Duration::from_millis(10),
                request_timeout: Duration::from_secs(5),
            },
            shutdown.clone(),
        );

        let (read_half, _write_half) = tokio::io::split(controller_side);
        let mut lines = BufReader::new(read_half).lines();
        assert_eq!(read_line(&mut lines).await, "status?");
        assert_eq!(read_line(&mut lines).await, "metervalues?");

        let extra = tokio::time::timeout(Duration::from_millis(100), lines.next_line()).await;
        assert!(extra.is_err(), "no second poll while the first is outstanding");
        shutdown.trigger();
    }
}
