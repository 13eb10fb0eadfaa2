/// Modbus TCP coil server
///
/// `CoilServer` is the handle the host holds. All listener work happens in
/// one control task that serializes start/stop requests, listener faults,
/// accepted sockets and the reconnect timer, and drives the
/// [`ServerRuntime`](crate::lifecycle::ServerRuntime) state machine from them.
/// Client sessions run as their own tasks against the shared coil bank, so a
/// listener fault never drops connected clients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout, Sleep};

use crate::coil_bank::{CoilBank, CoilBankStats};
use crate::codec::FrameCodec;
use crate::config::CoilServerConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::lifecycle::{ReconnectDecision, RuntimeSnapshot, ServerRuntime, ServerState, StartTrigger};
use crate::logging::FrameTrace;
use crate::projection::{ServerStatus, VariableProjection, VariableUpdate};
use crate::session;
use crate::utils::format::format_duration;

/// Coil server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Start the server
    async fn start(&mut self) -> ModbusResult<()>;

    /// Stop the server
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Check if the listener is up
    fn is_running(&self) -> bool;

    /// Get server statistics
    async fn get_stats(&self) -> ServerStats;

    /// Get coil bank reference
    fn coil_bank(&self) -> Arc<CoilBank>;
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub responses_sent: u64,
    /// Unsupported function codes and truncated frames
    pub ignored_frames: u64,
    pub failed_frames: u64,
    /// Coil writes that declared more bits than they carried
    pub short_payloads: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub listener_faults: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub coil_bank_stats: Option<CoilBankStats>,
}

enum ControlEvent {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    Reconfigure(CoilServerConfig, oneshot::Sender<ModbusResult<()>>),
}

/// Why the accept task returned
#[derive(Debug)]
enum ListenerExit {
    Shutdown,
    Fault(ModbusError),
}

struct ListenerHandle {
    local_addr: Option<SocketAddr>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<ListenerExit>,
}

type Accepted = (TcpStream, SocketAddr);

/// Control task state
struct Controller {
    config: CoilServerConfig,
    bank: Arc<CoilBank>,
    projection: Arc<dyn VariableProjection>,
    stats: Arc<Mutex<ServerStats>>,
    runtime: ServerRuntime,
    snapshot_tx: watch::Sender<RuntimeSnapshot>,
    listener: Option<ListenerHandle>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    accepted_tx: mpsc::UnboundedSender<Accepted>,
    accepted_rx: mpsc::UnboundedReceiver<Accepted>,
    session_shutdown: broadcast::Sender<()>,
    sessions: Vec<JoinHandle<()>>,
}

impl Controller {
    fn new(
        config: CoilServerConfig,
        bank: Arc<CoilBank>,
        projection: Arc<dyn VariableProjection>,
        stats: Arc<Mutex<ServerStats>>,
    ) -> (Self, watch::Receiver<RuntimeSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(RuntimeSnapshot::default());
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (session_shutdown, _) = broadcast::channel(1);

        let controller = Self {
            runtime: ServerRuntime::new(config.reconnect),
            config,
            bank,
            projection,
            stats,
            snapshot_tx,
            listener: None,
            reconnect_timer: None,
            accepted_tx,
            accepted_rx,
            session_shutdown,
            sessions: Vec::new(),
        };
        (controller, snapshot_rx)
    }

    async fn run(mut self, mut control_rx: mpsc::UnboundedReceiver<ControlEvent>) {
        loop {
            tokio::select! {
                event = control_rx.recv() => match event {
                    Some(ControlEvent::Start(ack)) => {
                        self.start(StartTrigger::External).await;
                        let _ = ack.send(());
                    }
                    Some(ControlEvent::Stop(ack)) => {
                        self.stop().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(ControlEvent::Reconfigure(config, ack)) => {
                        let _ = ack.send(self.reconfigure(config));
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some((stream, peer)) = self.accepted_rx.recv() => {
                    self.spawn_session(stream, peer);
                }
                exit = listener_exit(&mut self.listener) => {
                    self.listener = None;
                    match exit {
                        Ok(ListenerExit::Fault(e)) => self.on_fault(e).await,
                        Ok(ListenerExit::Shutdown) => debug!("Listener task finished"),
                        Err(e) => {
                            error!("Listener task ended unexpectedly: {}", e);
                            self.on_closed();
                        }
                    }
                }
                _ = reconnect_due(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    info!(
                        "🔄 Reconnect attempt {}/{}",
                        self.runtime.reconnect_attempts(),
                        self.config.reconnect.max_attempts
                    );
                    self.start(StartTrigger::Timer).await;
                }
            }
        }
        debug!("Control loop finished");
    }

    async fn start(&mut self, trigger: StartTrigger) {
        if self.listener.is_some() {
            debug!("Listener already running, start ignored");
            return;
        }

        self.runtime.begin_start(trigger);
        self.reconnect_timer = None;
        self.publish_snapshot();

        if self.bank.size() != self.config.coil_count {
            if let Err(e) = self.bank.resize(self.config.coil_count) {
                error!("Failed to size coil bank: {}", e);
            }
        }

        let address = match self.config.socket_addr() {
            Ok(address) => address,
            Err(e) => {
                self.on_fault(e).await;
                return;
            }
        };

        info!("🚀 Starting Modbus TCP coil server on {}", address);
        let listener = match TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(e) => {
                let e = match ModbusError::from(e) {
                    ModbusError::AddressInUse { .. } => ModbusError::address_in_use(address.to_string()),
                    other => ModbusError::connection(format!("Failed to bind to {}: {}", address, other)),
                };
                self.on_fault(e).await;
                return;
            }
        };

        let local_addr = listener.local_addr().ok();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, self.accepted_tx.clone(), shutdown_rx));
        self.listener = Some(ListenerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
        });

        self.runtime.bound();
        {
            let mut stats = self.stats.lock().await;
            stats.started_at.get_or_insert_with(Utc::now);
        }

        info!("✅ Modbus TCP coil server listening");
        info!("📊 Server configuration:");
        info!("   - Bind address: {}", local_addr.unwrap_or(address));
        info!("   - Coils: {}", self.config.coil_count);
        info!("   - Debug tracing: {}", self.config.debug);

        self.projection.report_status(ServerStatus::Ok, None);
        self.projection.publish(&[VariableUpdate::connected(true)]);
        if let Err(e) = self.bank.publish_all() {
            warn!("Failed to publish coil state: {}", e);
        }
        self.publish_snapshot();
    }

    async fn stop(&mut self) {
        self.reconnect_timer = None;

        if let Some(handle) = self.listener.take() {
            let _ = handle.shutdown.send(());
            match handle.task.await {
                Ok(_) => {}
                Err(e) => warn!("Error closing listener: {}", e),
            }
            if let Some(addr) = handle.local_addr {
                info!("⏹️  Listener on {} closed", addr);
            }
        }

        let _ = self.session_shutdown.send(());
        for result in join_all(self.sessions.drain(..)).await {
            if let Err(e) = result {
                warn!("Client session ended abnormally: {}", e);
            }
        }

        self.runtime.stopped();
        self.projection.publish(&[VariableUpdate::connected(false)]);
        self.projection.report_status(ServerStatus::Ok, Some("stopped"));
        self.publish_snapshot();
        info!("⏹️  Modbus TCP coil server stopped");
    }

    /// Apply a validated configuration; a coil count change resets the bank here
    fn reconfigure(&mut self, config: CoilServerConfig) -> ModbusResult<()> {
        if config.coil_count != self.config.coil_count {
            info!(
                "Coil count changed {} -> {}, resetting coil bank",
                self.config.coil_count, config.coil_count
            );
            self.bank.resize(config.coil_count)?;
        }
        if config.socket_addr().ok() != self.config.socket_addr().ok() {
            info!(
                "Listener address changes to {}:{} on next start",
                config.bind_address, config.port
            );
        }
        self.runtime.set_policy(config.reconnect);
        self.config = config;
        Ok(())
    }

    async fn on_fault(&mut self, error: ModbusError) {
        error!("❌ Listener fault: {}", error);
        self.stats.lock().await.listener_faults += 1;

        self.projection.publish(&[VariableUpdate::connected(false)]);
        self.projection
            .report_status(ServerStatus::ConnectionError, Some(&error.to_string()));

        let decision = self.runtime.listener_fault(&error);
        self.apply_decision(decision);
    }

    fn on_closed(&mut self) {
        if self.runtime.is_reconnecting() {
            debug!("Listener closed while a reconnect is already scheduled");
            return;
        }

        self.projection.publish(&[VariableUpdate::connected(false)]);
        self.projection
            .report_status(ServerStatus::ConnectionError, Some("listener closed"));

        let decision = self.runtime.listener_closed();
        self.apply_decision(decision);
    }

    fn apply_decision(&mut self, decision: ReconnectDecision) {
        match decision {
            ReconnectDecision::Schedule(delay) => {
                info!(
                    "🔄 Scheduling reconnect attempt {}/{} in {}",
                    self.runtime.reconnect_attempts(),
                    self.config.reconnect.max_attempts,
                    format_duration(delay)
                );
                self.reconnect_timer = Some(Box::pin(sleep(delay)));
            }
            ReconnectDecision::AlreadyPending => {
                debug!("Reconnect already scheduled");
            }
            ReconnectDecision::Exhausted { attempts } => {
                self.reconnect_timer = None;
                let error = ModbusError::reconnect_exhausted(attempts);
                error!("❌ {}; giving up until restarted", error);
                self.projection
                    .report_status(ServerStatus::ConnectionError, Some(&error.to_string()));
            }
        }
        self.publish_snapshot();
    }

    fn spawn_session(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.sessions.retain(|handle| !handle.is_finished());

        let codec = FrameCodec::new(self.bank.clone(), FrameTrace::new(self.config.debug));
        let handle = tokio::spawn(session::serve(
            stream,
            peer,
            codec,
            self.stats.clone(),
            self.session_shutdown.subscribe(),
        ));
        self.sessions.push(handle);
    }

    fn publish_snapshot(&self) {
        let local_addr = self.listener.as_ref().and_then(|handle| handle.local_addr);
        self.snapshot_tx
            .send_replace(self.runtime.snapshot(local_addr));
    }
}

async fn listener_exit(listener: &mut Option<ListenerHandle>) -> Result<ListenerExit, JoinError> {
    match listener {
        Some(handle) => (&mut handle.task).await,
        None => std::future::pending().await,
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Accept errors that concern a single half-open connection, not the listener
fn is_transient_accept_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

async fn accept_loop(
    listener: TcpListener,
    accepted_tx: mpsc::UnboundedSender<Accepted>,
    mut shutdown: oneshot::Receiver<()>,
) -> ListenerExit {
    loop {
        tokio::select! {
            _ = &mut shutdown => return ListenerExit::Shutdown,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    if accepted_tx.send((stream, peer)).is_err() {
                        return ListenerExit::Shutdown;
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    debug!("Transient accept error: {}", e);
                }
                Err(e) => {
                    return ListenerExit::Fault(ModbusError::connection(format!(
                        "Failed to accept connection: {}",
                        e
                    )));
                }
            }
        }
    }
}

/// Modbus TCP coil server handle
pub struct CoilServer {
    config: CoilServerConfig,
    bank: Arc<CoilBank>,
    projection: Arc<dyn VariableProjection>,
    stats: Arc<Mutex<ServerStats>>,
    control_tx: Option<mpsc::UnboundedSender<ControlEvent>>,
    control_task: Option<JoinHandle<()>>,
    snapshot_rx: watch::Receiver<RuntimeSnapshot>,
}

impl CoilServer {
    /// Create a server; nothing is bound until `start`
    pub fn new(config: CoilServerConfig, projection: Arc<dyn VariableProjection>) -> ModbusResult<Self> {
        config.validate()?;

        let bank = Arc::new(CoilBank::with_projection(config.coil_count, projection.clone()));
        let (_, snapshot_rx) = watch::channel(RuntimeSnapshot::default());

        Ok(Self {
            config,
            bank,
            projection,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            control_tx: None,
            control_task: None,
            snapshot_rx,
        })
    }

    pub fn config(&self) -> &CoilServerConfig {
        &self.config
    }

    /// Latest lifecycle snapshot
    pub fn snapshot(&self) -> RuntimeSnapshot {
        *self.snapshot_rx.borrow()
    }

    pub fn state(&self) -> ServerState {
        self.snapshot().state
    }

    /// Address the listener is bound to, if listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.snapshot().local_addr
    }

    /// Wait until the lifecycle reaches `state`
    pub async fn wait_for_state(&self, state: ServerState, wait: Duration) -> ModbusResult<RuntimeSnapshot> {
        let mut rx = self.snapshot_rx.clone();
        let result = timeout(wait, rx.wait_for(|snapshot| snapshot.state == state))
            .await
            .map_err(|_| {
                ModbusError::timeout(format!("waiting for state {}", state), wait.as_millis() as u64)
            })?;
        match result {
            Ok(snapshot) => Ok(*snapshot),
            Err(_) => Err(ModbusError::not_running(format!("waiting for state {}", state))),
        }
    }

    fn ensure_running(&self, operation: &str) -> ModbusResult<()> {
        if self.control_tx.is_none() {
            warn!("{} ignored: server is not running", operation);
            return Err(ModbusError::not_running(operation));
        }
        Ok(())
    }

    /// Set a coil from outside the protocol path
    pub fn set_coil(&self, index: usize, value: bool) -> ModbusResult<()> {
        self.ensure_running("set_coil")?;
        self.bank.write(index, value).map_err(|e| {
            warn!("set_coil({}, {}) rejected: {}", index, value, e);
            e
        })
    }

    /// Clear every latched level (and raw value)
    pub fn reset_level_states(&self) -> ModbusResult<()> {
        self.ensure_running("reset_level_states")?;
        self.bank.reset_levels()?;
        info!("Latched coil levels reset");
        Ok(())
    }

    /// Apply a new configuration
    ///
    /// A coil count change replaces the bank contents immediately. Address
    /// and port changes only apply on the next `start`.
    pub async fn reconfigure(&mut self, config: CoilServerConfig) -> ModbusResult<()> {
        config.validate()?;

        match &self.control_tx {
            // The control loop owns the bank size while it runs
            Some(tx) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                tx.send(ControlEvent::Reconfigure(config.clone(), ack_tx))
                    .map_err(|_| ModbusError::internal("Control loop is gone"))?;
                ack_rx
                    .await
                    .map_err(|_| ModbusError::internal("Control loop dropped reconfigure request"))??;
            }
            None => {
                if config.coil_count != self.config.coil_count {
                    info!(
                        "Coil count changed {} -> {}, resetting coil bank",
                        self.config.coil_count, config.coil_count
                    );
                    self.bank.resize(config.coil_count)?;
                }
            }
        }
        self.config = config;
        Ok(())
    }

    /// Snapshot of the counters plus uptime and bank stats
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().await.clone();
        if let Some(started_at) = stats.started_at {
            stats.uptime_seconds = (Utc::now() - started_at).num_seconds().max(0) as u64;
        }
        stats.coil_bank_stats = self.bank.stats().ok();
        stats
    }

    fn spawn_controller(&mut self) -> mpsc::UnboundedSender<ControlEvent> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (controller, snapshot_rx) = Controller::new(
            self.config.clone(),
            self.bank.clone(),
            self.projection.clone(),
            self.stats.clone(),
        );

        self.snapshot_rx = snapshot_rx;
        self.control_task = Some(tokio::spawn(controller.run(control_rx)));
        self.control_tx = Some(control_tx.clone());
        control_tx
    }
}

#[async_trait]
impl ModbusServer for CoilServer {
    /// Bind the listener, or schedule a retry if binding fails
    ///
    /// Returns once the first bind attempt has finished; a failed bind is
    /// reported through the status sink and the snapshot, not as an error.
    async fn start(&mut self) -> ModbusResult<()> {
        let control_tx = match &self.control_tx {
            Some(tx) => tx.clone(),
            None => self.spawn_controller(),
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        control_tx
            .send(ControlEvent::Start(ack_tx))
            .map_err(|_| ModbusError::internal("Control loop is gone"))?;
        ack_rx
            .await
            .map_err(|_| ModbusError::internal("Control loop dropped start request"))
    }

    /// Cancel any pending reconnect, close the listener and every client, and wait for it
    async fn stop(&mut self) -> ModbusResult<()> {
        let Some(control_tx) = self.control_tx.take() else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if control_tx.send(ControlEvent::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        drop(control_tx);

        if let Some(task) = self.control_task.take() {
            task.await
                .map_err(|e| ModbusError::internal(format!("Control loop failed: {}", e)))?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.control_tx.is_some() && self.state() == ServerState::Listening
    }

    async fn get_stats(&self) -> ServerStats {
        self.stats().await
    }

    fn coil_bank(&self) -> Arc<CoilBank> {
        self.bank.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::NullProjection;

    fn config() -> CoilServerConfig {
        CoilServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 15020,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_commands_need_running_server() {
        let server = CoilServer::new(config(), Arc::new(NullProjection)).unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(matches!(
            server.set_coil(0, true),
            Err(ModbusError::NotRunning { .. })
        ));
        assert!(matches!(
            server.reset_level_states(),
            Err(ModbusError::NotRunning { .. })
        ));
        assert!(!server.coil_bank().read_raw(0).unwrap());
    }

    #[tokio::test]
    async fn test_reconfigure_resizes_while_stopped() {
        let mut server = CoilServer::new(config(), Arc::new(NullProjection)).unwrap();
        server.coil_bank().write(3, true).unwrap();

        let mut bigger = config();
        bigger.coil_count = 100;
        server.reconfigure(bigger).await.unwrap();

        let bank = server.coil_bank();
        assert_eq!(bank.size(), 100);
        assert!(!bank.read_level(3).unwrap());

        let mut invalid = config();
        invalid.coil_count = 0;
        assert!(server.reconfigure(invalid).await.is_err());
        assert_eq!(server.config().coil_count, 100);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut server = CoilServer::new(config(), Arc::new(NullProjection)).unwrap();
        server.stop().await.unwrap();
        assert!(!server.is_running());
    }

    #[derive(Default)]
    struct StatusLog {
        updates: std::sync::Mutex<Vec<VariableUpdate>>,
        statuses: std::sync::Mutex<Vec<ServerStatus>>,
    }

    impl VariableProjection for StatusLog {
        fn publish(&self, updates: &[VariableUpdate]) {
            self.updates.lock().unwrap().extend_from_slice(updates);
        }

        fn report_status(&self, status: ServerStatus, _message: Option<&str>) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    fn controller(projection: Arc<StatusLog>) -> Controller {
        let bank = Arc::new(CoilBank::new(48));
        let stats = Arc::new(Mutex::new(ServerStats::default()));
        Controller::new(config(), bank, projection, stats).0
    }

    #[tokio::test]
    async fn test_listener_close_while_reconnecting_is_quiet() {
        let log = Arc::new(StatusLog::default());
        let mut controller = controller(log.clone());

        controller.runtime.begin_start(StartTrigger::External);
        controller
            .runtime
            .listener_fault(&ModbusError::address_in_use("127.0.0.1:15020"));
        assert!(controller.runtime.is_reconnecting());

        controller.on_closed();
        assert!(log.updates.lock().unwrap().is_empty());
        assert!(log.statuses.lock().unwrap().is_empty());
        assert_eq!(controller.runtime.reconnect_attempts(), 1);
        assert!(controller.reconnect_timer.is_none());
    }

    #[tokio::test]
    async fn test_listener_close_schedules_reconnect() {
        let log = Arc::new(StatusLog::default());
        let mut controller = controller(log.clone());

        controller.runtime.begin_start(StartTrigger::External);
        controller.runtime.bound();

        controller.on_closed();
        assert_eq!(
            log.updates.lock().unwrap().as_slice(),
            &[VariableUpdate::connected(false)]
        );
        assert_eq!(
            log.statuses.lock().unwrap().as_slice(),
            &[ServerStatus::ConnectionError]
        );
        assert!(controller.reconnect_timer.is_some());
        assert_eq!(controller.runtime.state(), ServerState::Reconnecting);
    }

    #[tokio::test]
    async fn test_controller_reconfigure_owns_resize() {
        let log = Arc::new(StatusLog::default());
        let mut controller = controller(log);
        controller.bank.write(3, true).unwrap();

        let mut bigger = config();
        bigger.coil_count = 100;
        controller.reconfigure(bigger).unwrap();
        assert_eq!(controller.bank.size(), 100);
        assert_eq!(controller.config.coil_count, 100);
        assert!(!controller.bank.read_level(3).unwrap());

        // Same count leaves the bank alone
        controller.bank.write(99, true).unwrap();
        let mut same = config();
        same.coil_count = 100;
        same.port = 15021;
        controller.reconfigure(same).unwrap();
        assert!(controller.bank.read_raw(99).unwrap());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut bad = config();
        bad.coil_count = 5000;
        assert!(CoilServer::new(bad, Arc::new(NullProjection)).is_err());
    }
}
