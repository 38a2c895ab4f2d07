//! Session Controller
//!
//! Owns the single `ConnectionState` and is the only caller of the tunnel
//! engine's `start` and `stop`.
//!
//! # Architecture
//!
//! ```text
//! SessionController (handle, Clone)
//!     │  mpsc commands / oneshot replies
//!     ▼
//! SessionActor ──► boundary call task (connect or disconnect, one at a time)
//!     │
//!     ├── status poller ──► Reconcile   (only while connected)
//!     ├── push forwarder ──► Reconcile  (engines with status events)
//!     └── TelemetryPoller               (armed while connected)
//! ```
//!
//! Boundary calls run in their own task so the actor keeps receiving
//! commands. While a call is in flight, connect/disconnect requests are
//! checked against the transition table (ignored ones are answered right
//! away, deferred ones are queued) and status reports are queued. The
//! queue is replayed in arrival order once the call's transition is done,
//! except that status reports queued before that transition are stale and
//! dropped: the call's own outcome wins.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = SessionController::spawn(adapter, registry, compiler, tunnel, ControllerConfig::default());
//! let mut states = controller.subscribe();
//!
//! controller.connect().await?;
//! controller.disconnect().await?;
//! controller.shutdown().await?;
//! ```

use crate::adapter::NativeTunnelAdapter;
use crate::config::TunnelConfig;
use crate::error::VpnError;
use crate::model::{BandwidthSample, TunnelStatus};
use crate::registry::AppSelectionRegistry;
use crate::routing::RoutingRuleCompiler;
use crate::settings::PollingSettings;
use crate::state::{ConnectionState, ControlEvent, Transition};
use crate::telemetry::TelemetryPoller;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Controller tuning
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Status reconciliation cadence while connected
    pub status_interval: Duration,
    /// Bandwidth sampling cadence while connected
    pub telemetry_interval: Duration,
    /// Command mailbox capacity
    pub mailbox: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(1),
            telemetry_interval: Duration::from_secs(1),
            mailbox: 64,
        }
    }
}

impl From<&PollingSettings> for ControllerConfig {
    fn from(polling: &PollingSettings) -> Self {
        Self {
            status_interval: polling.status_interval(),
            telemetry_interval: polling.telemetry_interval(),
            ..Self::default()
        }
    }
}

type StateReply = oneshot::Sender<ConnectionState>;

/// Actor command types
enum Command {
    Connect { reply: StateReply },
    Disconnect { reply: StateReply },
    Reconcile(TunnelStatus),
    Shutdown { reply: oneshot::Sender<()> },
}

impl Command {
    fn event(&self) -> Option<ControlEvent> {
        match self {
            Command::Connect { .. } => Some(ControlEvent::Connect),
            Command::Disconnect { .. } => Some(ControlEvent::Disconnect),
            Command::Reconcile(status) => Some(ControlEvent::Reported(*status)),
            Command::Shutdown { .. } => None,
        }
    }
}

/// Result of a boundary call task
enum Outcome {
    Started(TunnelConfig),
    Stopped,
    Failed(VpnError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Connect,
    Disconnect,
}

struct InFlight {
    kind: OpKind,
    task: JoinHandle<Outcome>,
    waiters: Vec<StateReply>,
}

/// Handle to the session actor
#[derive(Clone)]
pub struct SessionController {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    sample_rx: watch::Receiver<Option<BandwidthSample>>,
    registry: Arc<AppSelectionRegistry>,
}

impl SessionController {
    /// Spawn the session actor and its status tasks.
    ///
    /// `tunnel` is the base configuration; its allowed ranges are replaced
    /// by the compiled rule on every connect.
    pub fn spawn(
        adapter: Arc<dyn NativeTunnelAdapter>,
        registry: Arc<AppSelectionRegistry>,
        compiler: Arc<RoutingRuleCompiler>,
        tunnel: TunnelConfig,
        config: ControllerConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.mailbox.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let telemetry = TelemetryPoller::new(adapter.clone(), config.telemetry_interval);
        let sample_rx = telemetry.subscribe();

        let mut status_tasks = vec![spawn_status_poller(
            adapter.clone(),
            command_tx.downgrade(),
            state_rx.clone(),
            config.status_interval,
        )];
        if let Some(events) = adapter.status_events() {
            status_tasks.push(spawn_push_forwarder(events, command_tx.downgrade()));
        }

        info!(
            adapter = adapter.name(),
            endpoint = %tunnel.endpoint,
            per_app_filter = adapter.capabilities().per_app_filter,
            "Session controller started"
        );

        let actor = SessionActor {
            adapter,
            registry: registry.clone(),
            compiler,
            base_config: tunnel,
            active_config: None,
            state_tx,
            telemetry,
            in_flight: None,
            deferred: VecDeque::new(),
            generation: 0,
            status_tasks,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            command_tx,
            state_rx,
            sample_rx,
            registry,
        }
    }

    /// Connect, returning the state once the attempt has resolved.
    ///
    /// Connect failures are not errors here: they end in
    /// `ConnectionState::Error`. `Err` only means the controller is gone.
    pub async fn connect(&self) -> Result<ConnectionState, VpnError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { reply }).await?;
        rx.await.map_err(|_| VpnError::ControllerClosed)
    }

    /// Disconnect, returning the state once the stop has resolved.
    pub async fn disconnect(&self) -> Result<ConnectionState, VpnError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply }).await?;
        rx.await.map_err(|_| VpnError::ControllerClosed)
    }

    /// Feed a status report from the tunnel engine.
    pub async fn reconcile(&self, status: TunnelStatus) -> Result<(), VpnError> {
        self.send(Command::Reconcile(status)).await
    }

    /// Stop the actor and its timers. The tunnel itself is left as is.
    pub async fn shutdown(&self) -> Result<(), VpnError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| VpnError::ControllerClosed)
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Latest bandwidth sample of the current connection
    pub fn bandwidth(&self) -> Option<BandwidthSample> {
        *self.sample_rx.borrow()
    }

    pub fn subscribe_bandwidth(&self) -> watch::Receiver<Option<BandwidthSample>> {
        self.sample_rx.clone()
    }

    pub fn registry(&self) -> &Arc<AppSelectionRegistry> {
        &self.registry
    }

    async fn send(&self, command: Command) -> Result<(), VpnError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| VpnError::ControllerClosed)
    }
}

/// Session actor state
struct SessionActor {
    adapter: Arc<dyn NativeTunnelAdapter>,
    registry: Arc<AppSelectionRegistry>,
    compiler: Arc<RoutingRuleCompiler>,
    base_config: TunnelConfig,
    active_config: Option<TunnelConfig>,
    state_tx: watch::Sender<ConnectionState>,
    telemetry: TelemetryPoller,
    in_flight: Option<InFlight>,
    /// Queued commands, tagged with the state generation they arrived in
    deferred: VecDeque<(u64, Command)>,
    /// Bumped on every state change
    generation: u64,
    status_tasks: Vec<JoinHandle<()>>,
}

impl SessionActor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                joined = async {
                    match self.in_flight.as_mut() {
                        Some(op) => (&mut op.task).await,
                        None => std::future::pending().await,
                    }
                }, if self.in_flight.is_some() => {
                    self.finish(joined);
                    self.drain_deferred().await;
                }
                command = command_rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        debug!("Session actor stopped");
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    async fn handle(&mut self, command: Command) {
        if self.in_flight.is_none() {
            self.apply(command).await;
            return;
        }

        match command {
            Command::Reconcile(status) => {
                // Repeated reports of the same status collapse into one
                let duplicate = matches!(
                    self.deferred.back(),
                    Some((_, Command::Reconcile(last))) if *last == status
                );
                if !duplicate {
                    self.deferred.push_back((self.generation, Command::Reconcile(status)));
                }
            }
            command => {
                let Some(event) = command.event() else { return };
                match self.state().on(event) {
                    Transition::Defer => {
                        debug!(?event, "Deferred until the in-flight call resolves");
                        self.deferred.push_back((self.generation, command));
                    }
                    _ => self.reply(command),
                }
            }
        }
    }

    async fn apply(&mut self, command: Command) {
        let Some(event) = command.event() else { return };

        match self.state().on(event) {
            Transition::BeginConnect => {
                if let Command::Connect { reply } = command {
                    self.begin_connect(reply).await;
                }
            }
            Transition::BeginDisconnect => {
                if let Command::Disconnect { reply } = command {
                    self.begin_disconnect(reply);
                }
            }
            Transition::Enter(next) => {
                if next == ConnectionState::Error(VpnError::ConnectionLost) {
                    warn!("Tunnel engine reported the connection as down");
                }
                self.enter(next);
                self.reply(command);
            }
            Transition::Ignore | Transition::Defer => {
                debug!(?event, state = %self.state(), "Event ignored");
                self.reply(command);
            }
        }
    }

    async fn begin_connect(&mut self, reply: StateReply) {
        self.enter(ConnectionState::Connecting);

        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let compiler = self.compiler.clone();
        let base = self.base_config.clone();

        let task = tokio::spawn(async move {
            match connect_sequence(adapter, registry, compiler, base).await {
                Ok(config) => Outcome::Started(config),
                Err(e) => Outcome::Failed(e),
            }
        });

        self.in_flight = Some(InFlight {
            kind: OpKind::Connect,
            task,
            waiters: vec![reply],
        });
    }

    fn begin_disconnect(&mut self, reply: StateReply) {
        self.enter(ConnectionState::Disconnecting);

        if let Some(config) = &self.active_config {
            info!(endpoint = %config.endpoint, "Stopping tunnel");
        }

        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            match adapter.stop().await {
                Ok(true) => Outcome::Stopped,
                Ok(false) => Outcome::Failed(VpnError::StopFailed("tunnel engine refused to stop".to_string())),
                Err(e) => Outcome::Failed(VpnError::StopFailed(e.to_string())),
            }
        });

        self.in_flight = Some(InFlight {
            kind: OpKind::Disconnect,
            task,
            waiters: vec![reply],
        });
    }

    /// Apply the outcome of the in-flight call and answer its waiters.
    fn finish(&mut self, joined: Result<Outcome, tokio::task::JoinError>) {
        let Some(op) = self.in_flight.take() else { return };

        let outcome = joined.unwrap_or_else(|e| {
            let reason = format!("boundary call aborted: {}", e);
            Outcome::Failed(match op.kind {
                OpKind::Connect => VpnError::StartFailed(reason),
                OpKind::Disconnect => VpnError::StopFailed(reason),
            })
        });

        match outcome {
            Outcome::Started(config) => {
                info!(
                    endpoint = %config.endpoint,
                    ranges = config.allowed_ranges.len(),
                    "Tunnel connected"
                );
                self.enter(ConnectionState::Connected);
                self.active_config = Some(config);
            }
            Outcome::Stopped => {
                info!("Tunnel disconnected");
                self.enter(ConnectionState::Disconnected);
            }
            Outcome::Failed(e) => {
                error!(kind = e.kind(), error = %e, "Boundary call failed");
                self.enter(ConnectionState::Error(e));
            }
        }

        let state = self.state();
        for waiter in op.waiters {
            let _ = waiter.send(state.clone());
        }
    }

    async fn drain_deferred(&mut self) {
        while self.in_flight.is_none() {
            let Some((generation, command)) = self.deferred.pop_front() else { break };

            if let Command::Reconcile(status) = command {
                if generation != self.generation {
                    debug!(%status, state = %self.state(), "Stale status report dropped");
                    continue;
                }
            }
            self.apply(command).await;
        }
    }

    /// Publish a new state and drive the telemetry timer from it.
    fn enter(&mut self, next: ConnectionState) {
        let prev = self.state();
        if prev == next {
            return;
        }

        if next.is_connected() {
            self.telemetry.arm();
        } else {
            self.telemetry.disarm();
        }

        if next.is_idle() {
            self.telemetry.clear();
            self.active_config = None;
        }

        info!(from = %prev, to = %next, "Connection state changed");
        self.generation += 1;
        self.state_tx.send_replace(next);
    }

    fn reply(&self, command: Command) {
        match command {
            Command::Connect { reply } | Command::Disconnect { reply } => {
                let _ = reply.send(self.state());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
            Command::Reconcile(_) => {}
        }
    }

    async fn shutdown(&mut self) {
        for task in self.status_tasks.drain(..) {
            task.abort();
        }
        self.telemetry.disarm();

        // In-flight calls are not cancelled, only awaited
        if let Some(op) = self.in_flight.as_mut() {
            let joined = (&mut op.task).await;
            self.finish(joined);
        }

        let state = self.state();
        for (_, command) in self.deferred.drain(..) {
            if let Command::Connect { reply } | Command::Disconnect { reply } = command {
                let _ = reply.send(state.clone());
            }
        }

        info!(state = %state, "Session controller shut down");
    }
}

/// Permission, selection snapshot, rule compilation, config validation
/// and start.
async fn connect_sequence(
    adapter: Arc<dyn NativeTunnelAdapter>,
    registry: Arc<AppSelectionRegistry>,
    compiler: Arc<RoutingRuleCompiler>,
    base: TunnelConfig,
) -> Result<TunnelConfig, VpnError> {
    match adapter.request_permission().await {
        Ok(true) => {}
        Ok(false) => return Err(VpnError::PermissionDenied("permission not granted".to_string())),
        Err(e) => return Err(VpnError::PermissionDenied(e.to_string())),
    }

    // Selection edits after this point do not affect this attempt
    let (mode, selection) = registry.snapshot().await;

    let plan = compiler.compile(mode, &selection).await;
    if plan.rule.is_empty() {
        return Err(VpnError::InvalidConfig("routing rule has no ranges".to_string()));
    }

    let config = base.with_allowed_ranges(plan.rule.allowed_ranges());
    config.validate()?;

    let app_filter_ids = if adapter.capabilities().per_app_filter {
        plan.app_filter_ids
    } else {
        if !plan.app_filter_ids.is_empty() {
            info!(
                adapter = adapter.name(),
                apps = plan.app_filter_ids.len(),
                "Adapter cannot filter by app, routing by address only"
            );
        }
        Vec::new()
    };

    debug!(config = ?config, apps = app_filter_ids.len(), "Starting tunnel");

    match adapter.start(&config, &app_filter_ids).await {
        Ok(true) => Ok(config),
        Ok(false) => Err(VpnError::StartFailed("tunnel engine returned false".to_string())),
        Err(e) => Err(VpnError::StartFailed(e.to_string())),
    }
}

/// Poll the engine's status while connected.
///
/// A read that spans a state change is stale and dropped.
fn spawn_status_poller(
    adapter: Arc<dyn NativeTunnelAdapter>,
    command_tx: mpsc::WeakSender<Command>,
    mut state_rx: watch::Receiver<ConnectionState>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if !state_rx.borrow_and_update().is_connected() {
                continue;
            }

            let status = match adapter.get_status().await {
                Ok(status) => status,
                Err(e) => {
                    debug!(error = %e, "Status poll failed");
                    continue;
                }
            };

            if state_rx.has_changed().unwrap_or(true) {
                continue;
            }

            let Some(tx) = command_tx.upgrade() else { break };
            if tx.send(Command::Reconcile(status)).await.is_err() {
                break;
            }
        }
    })
}

/// Forward pushed status notifications into the mailbox.
fn spawn_push_forwarder(
    mut events: broadcast::Receiver<TunnelStatus>,
    command_tx: mpsc::WeakSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let status = match events.recv().await {
                Ok(status) => status,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status events lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let Some(tx) = command_tx.upgrade() else { break };
            if tx.send(Command::Reconcile(status)).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterCapabilities, AdapterError, SimulatedAdapter, StartBehavior};
    use crate::keys::{PrivateKey, PublicKey};
    use crate::model::{AppIdentity, SelectionMode};
    use crate::routing::DomainRoutingTable;
    use async_trait::async_trait;
    use ipnet::IpNet;
    use kuza_network::{AddressResolver, StaticAddressTable};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Simulated engine whose `start` waits for a gate, with a call log
    struct GatedAdapter {
        inner: SimulatedAdapter,
        gate: Notify,
        /// Signalled once `start` is waiting on `gate`
        entered: Notify,
        /// When set, permission is granted only after this is notified
        permission_gate: Option<Notify>,
        log: Mutex<Vec<&'static str>>,
        push: bool,
    }

    impl GatedAdapter {
        fn new(inner: SimulatedAdapter) -> Self {
            Self {
                inner,
                gate: Notify::new(),
                entered: Notify::new(),
                permission_gate: None,
                log: Mutex::new(Vec::new()),
                push: true,
            }
        }

        fn without_push(mut self) -> Self {
            self.push = false;
            self
        }

        fn with_held_permission(mut self) -> Self {
            self.permission_gate = Some(Notify::new());
            self
        }

        fn grant_permission(&self) {
            if let Some(gate) = &self.permission_gate {
                gate.notify_one();
            }
        }

        fn record(&self, entry: &'static str) {
            self.log.lock().unwrap().push(entry);
        }

        fn log(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NativeTunnelAdapter for GatedAdapter {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn capabilities(&self) -> AdapterCapabilities {
            self.inner.capabilities()
        }

        async fn request_permission(&self) -> Result<bool, AdapterError> {
            if let Some(gate) = &self.permission_gate {
                gate.notified().await;
            }
            self.inner.request_permission().await
        }

        async fn start(&self, config: &TunnelConfig, app_filter_ids: &[String]) -> Result<bool, AdapterError> {
            self.record("start:begin");
            self.entered.notify_one();
            self.gate.notified().await;
            let result = self.inner.start(config, app_filter_ids).await;
            self.record("start:end");
            result
        }

        async fn stop(&self) -> Result<bool, AdapterError> {
            self.record("stop");
            self.inner.stop().await
        }

        async fn get_status(&self) -> Result<TunnelStatus, AdapterError> {
            self.inner.get_status().await
        }

        async fn get_installed_apps(&self) -> Result<Vec<AppIdentity>, AdapterError> {
            self.inner.get_installed_apps().await
        }

        async fn get_bandwidth_stats(&self) -> Result<BandwidthSample, AdapterError> {
            self.inner.get_bandwidth_stats().await
        }

        fn status_events(&self) -> Option<broadcast::Receiver<TunnelStatus>> {
            if self.push { self.inner.status_events() } else { None }
        }
    }

    fn tunnel() -> TunnelConfig {
        TunnelConfig::new(
            "vpn.example:51820".parse().unwrap(),
            PublicKey::from_base64("kc+AVMZdL1aviDkogj9vIDzFnvTFoQwfPVDAGUWJals=").unwrap(),
            PrivateKey::generate(),
        )
    }

    fn compiler() -> Arc<RoutingRuleCompiler> {
        let table = DomainRoutingTable::new()
            .with_app("app.a", &["a.example"])
            .with_app("app.b", &["b.example"])
            .with_fallback(&["popular.example"]);
        let addresses = StaticAddressTable::new()
            .with("a.example", vec!["93.0.0.1".parse().unwrap()])
            .with("b.example", vec!["93.0.0.2".parse().unwrap()])
            .with("popular.example", vec!["198.51.100.7".parse().unwrap()]);

        Arc::new(RoutingRuleCompiler::new(
            Arc::new(table),
            Arc::new(AddressResolver::static_only(addresses)),
        ))
    }

    async fn registry(mode: SelectionMode, selected: &[&str]) -> Arc<AppSelectionRegistry> {
        let registry = Arc::new(AppSelectionRegistry::new(mode, false));
        registry
            .load_catalog(vec![AppIdentity::new("app.a", "Alpha"), AppIdentity::new("app.b", "Beta")])
            .await;
        for id in selected {
            registry.toggle(id).await.unwrap();
        }
        registry
    }

    fn quiet_config() -> ControllerConfig {
        ControllerConfig {
            status_interval: Duration::from_secs(3600),
            telemetry_interval: Duration::from_millis(20),
            mailbox: 16,
        }
    }

    fn spawn(adapter: Arc<dyn NativeTunnelAdapter>, registry: Arc<AppSelectionRegistry>) -> SessionController {
        SessionController::spawn(adapter, registry, compiler(), tunnel(), quiet_config())
    }

    async fn wait_for_state(controller: &SessionController, wanted: ConnectionState) {
        let mut rx = controller.subscribe();
        timeout(WAIT, rx.wait_for(|state| *state == wanted))
            .await
            .expect("state not reached")
            .unwrap();
    }

    fn range(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_connect_encrypt_all() {
        let adapter = Arc::new(SimulatedAdapter::new());
        let controller = spawn(adapter.clone(), registry(SelectionMode::EncryptAll, &["app.a"]).await);

        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(controller.connect().await.unwrap(), ConnectionState::Connected);

        let wire = adapter.last_wire_config().unwrap();
        assert_eq!(wire.allowed_ips, vec![range("0.0.0.0/0"), range("::/0")]);
        assert!(adapter.last_app_filter().is_empty());
    }

    #[tokio::test]
    async fn test_connect_custom_routes_selection() {
        let adapter = Arc::new(SimulatedAdapter::new());
        let controller = spawn(adapter.clone(), registry(SelectionMode::Custom, &["app.a"]).await);

        assert_eq!(controller.connect().await.unwrap(), ConnectionState::Connected);

        let wire = adapter.last_wire_config().unwrap();
        assert_eq!(wire.allowed_ips, vec![range("93.0.0.1/32")]);
        assert_eq!(adapter.last_app_filter(), vec!["app.a"]);
    }

    #[tokio::test]
    async fn test_address_only_adapter_gets_no_app_filter() {
        let adapter = Arc::new(SimulatedAdapter::new().without_app_filter());
        let controller = spawn(adapter.clone(), registry(SelectionMode::Custom, &["app.b"]).await);

        controller.connect().await.unwrap();

        assert!(adapter.last_app_filter().is_empty());
        assert_eq!(adapter.last_wire_config().unwrap().allowed_ips, vec![range("93.0.0.2/32")]);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let adapter = Arc::new(SimulatedAdapter::new());
        adapter.deny_permission();
        let controller = spawn(adapter.clone(), registry(SelectionMode::EncryptAll, &[]).await);

        let state = controller.connect().await.unwrap();

        assert!(matches!(state, ConnectionState::Error(VpnError::PermissionDenied(_))));
        assert_eq!(adapter.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_false_and_start_error_share_failure() {
        let adapter = Arc::new(SimulatedAdapter::new());
        let controller = spawn(adapter.clone(), registry(SelectionMode::EncryptAll, &[]).await);

        adapter.set_start_behavior(StartBehavior::ReturnFalse);
        let returned_false = controller.connect().await.unwrap();
        assert!(matches!(returned_false, ConnectionState::Error(VpnError::StartFailed(_))));

        adapter.set_start_behavior(StartBehavior::Fail("tun device busy".into()));
        let errored = controller.connect().await.unwrap();
        assert!(matches!(errored, ConnectionState::Error(VpnError::StartFailed(_))));

        // Retry is an explicit connect
        adapter.set_start_behavior(StartBehavior::Succeed);
        assert_eq!(controller.connect().await.unwrap(), ConnectionState::Connected);
        assert_eq!(adapter.start_calls(), 3);
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_noop() {
        let adapter = Arc::new(SimulatedAdapter::new());
        let controller = spawn(adapter.clone(), registry(SelectionMode::EncryptAll, &[]).await);

        controller.connect().await.unwrap();
        assert_eq!(controller.connect().await.unwrap(), ConnectionState::Connected);
        assert_eq!(adapter.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_clears_sample() {
        let adapter = Arc::new(SimulatedAdapter::new());
        let controller = spawn(adapter.clone(), registry(SelectionMode::EncryptAll, &[]).await);

        controller.connect().await.unwrap();
        let mut samples = controller.subscribe_bandwidth();
        timeout(WAIT, samples.wait_for(Option::is_some)).await.unwrap().unwrap();

        assert_eq!(controller.disconnect().await.unwrap(), ConnectionState::Disconnected);
        assert!(controller.bandwidth().is_none());
        assert_eq!(adapter.stop_calls(), 1);

        // Disconnect from Disconnected is a no-op
        assert_eq!(controller.disconnect().await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(adapter.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_failure_is_surfaced() {
        let adapter = Arc::new(SimulatedAdapter::new());
        let controller = spawn(adapter.clone(), registry(SelectionMode::EncryptAll, &[]).await);

        controller.connect().await.unwrap();
        adapter.fail_stop();

        let state = controller.disconnect().await.unwrap();
        assert!(matches!(state, ConnectionState::Error(VpnError::StopFailed(_))));
        assert!(controller.bandwidth().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_waits_for_start() {
        let adapter = Arc::new(GatedAdapter::new(SimulatedAdapter::new()));
        let controller = spawn(adapter.clone(), registry(SelectionMode::EncryptAll, &[]).await);

        let connecting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.connect().await }
        });
        wait_for_state(&controller, ConnectionState::Connecting).await;

        let disconnecting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.disconnect().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(adapter.inner.stop_calls(), 0);

        adapter.gate.notify_one();

        assert_eq!(connecting.await.unwrap().unwrap(), ConnectionState::Connected);
        assert_eq!(disconnecting.await.unwrap().unwrap(), ConnectionState::Disconnected);
        assert_eq!(adapter.log(), vec!["start:begin", "start:end", "stop"]);
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_toggle_during_connect_keeps_snapshot() {
        let adapter = Arc::new(GatedAdapter::new(SimulatedAdapter::new()));
        let registry = registry(SelectionMode::Custom, &["app.a"]).await;
        let controller = spawn(adapter.clone(), registry.clone());

        let connecting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.connect().await }
        });
        timeout(WAIT, adapter.entered.notified()).await.unwrap();

        registry.toggle("app.a").await.unwrap();
        registry.toggle("app.b").await.unwrap();
        adapter.gate.notify_one();

        assert_eq!(connecting.await.unwrap().unwrap(), ConnectionState::Connected);
        assert_eq!(adapter.inner.last_app_filter(), vec!["app.a"]);
        assert_eq!(
            adapter.inner.last_wire_config().unwrap().allowed_ips,
            vec![range("93.0.0.1/32")]
        );
    }

    #[tokio::test]
    async fn test_toggle_while_permission_pending_is_included() {
        let adapter = Arc::new(GatedAdapter::new(SimulatedAdapter::new()).with_held_permission());
        let registry = registry(SelectionMode::Custom, &["app.a"]).await;
        let controller = spawn(adapter.clone(), registry.clone());

        let connecting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.connect().await }
        });
        wait_for_state(&controller, ConnectionState::Connecting).await;

        registry.toggle("app.b").await.unwrap();
        adapter.grant_permission();
        timeout(WAIT, adapter.entered.notified()).await.unwrap();
        adapter.gate.notify_one();

        assert_eq!(connecting.await.unwrap().unwrap(), ConnectionState::Connected);
        assert_eq!(adapter.inner.last_app_filter(), vec!["app.a", "app.b"]);
        assert_eq!(
            adapter.inner.last_wire_config().unwrap().allowed_ips,
            vec![range("93.0.0.1/32"), range("93.0.0.2/32")]
        );
    }

    #[tokio::test]
    async fn test_status_report_during_connect_is_superseded() {
        let adapter = Arc::new(GatedAdapter::new(SimulatedAdapter::new()).without_push());
        let controller = spawn(adapter.clone(), registry(SelectionMode::EncryptAll, &[]).await);

        let connecting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.connect().await }
        });
        timeout(WAIT, adapter.entered.notified()).await.unwrap();

        // Engine still reports the pre-start status
        controller.reconcile(TunnelStatus::Disconnected).await.unwrap();
        // Replies only after the report above has been handled
        assert_eq!(controller.connect().await.unwrap(), ConnectionState::Connecting);

        adapter.gate.notify_one();
        assert_eq!(connecting.await.unwrap().unwrap(), ConnectionState::Connected);
        assert_eq!(controller.connect().await.unwrap(), ConnectionState::Connected);
        assert_eq!(controller.state(), ConnectionState::Connected);

        assert_eq!(controller.disconnect().await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(adapter.inner.stop_calls(), 1);
        assert_eq!(adapter.log(), vec!["start:begin", "start:end", "stop"]);
    }

    #[tokio::test]
    async fn test_pushed_disconnect_is_connection_lost() {
        let adapter = Arc::new(SimulatedAdapter::new());
        let controller = spawn(adapter.clone(), registry(SelectionMode::EncryptAll, &[]).await);

        controller.connect().await.unwrap();
        let mut samples = controller.subscribe_bandwidth();
        timeout(WAIT, samples.wait_for(Option::is_some)).await.unwrap().unwrap();

        adapter.drop_connection();

        wait_for_state(&controller, ConnectionState::Error(VpnError::ConnectionLost)).await;
        assert!(controller.bandwidth().is_none());
        assert_eq!(adapter.stop_calls(), 0);
    }

    #[tokio::test]
    async fn test_polled_disconnect_is_connection_lost() {
        let adapter = Arc::new(GatedAdapter::new(SimulatedAdapter::new()).without_push());
        adapter.gate.notify_one();
        let config = ControllerConfig {
            status_interval: Duration::from_millis(20),
            ..quiet_config()
        };
        let controller = SessionController::spawn(
            adapter.clone(),
            registry(SelectionMode::EncryptAll, &[]).await,
            compiler(),
            tunnel(),
            config,
        );

        assert_eq!(controller.connect().await.unwrap(), ConnectionState::Connected);
        adapter.inner.drop_connection();

        wait_for_state(&controller, ConnectionState::Error(VpnError::ConnectionLost)).await;
    }

    #[tokio::test]
    async fn test_reconcile_entry_point() {
        let adapter = Arc::new(SimulatedAdapter::new());
        let controller = spawn(adapter.clone(), registry(SelectionMode::EncryptAll, &[]).await);

        // Reports without a connect in progress change nothing
        controller.reconcile(TunnelStatus::Connected).await.unwrap();
        controller.connect().await.unwrap();
        controller.reconcile(TunnelStatus::Connecting).await.unwrap();
        assert_eq!(controller.disconnect().await.unwrap(), ConnectionState::Disconnected);

        controller.connect().await.unwrap();
        controller.reconcile(TunnelStatus::Disconnected).await.unwrap();
        wait_for_state(&controller, ConnectionState::Error(VpnError::ConnectionLost)).await;
    }

    #[tokio::test]
    async fn test_empty_rule_is_invalid_config() {
        let adapter = Arc::new(SimulatedAdapter::new());
        let compiler = Arc::new(RoutingRuleCompiler::new(
            Arc::new(DomainRoutingTable::new()),
            Arc::new(AddressResolver::static_only(StaticAddressTable::new())),
        ));
        let controller = SessionController::spawn(
            adapter.clone(),
            registry(SelectionMode::Custom, &["app.a"]).await,
            compiler,
            tunnel(),
            quiet_config(),
        );

        let state = controller.connect().await.unwrap();
        assert!(matches!(state, ConnectionState::Error(VpnError::InvalidConfig(_))));
        assert_eq!(adapter.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let adapter = Arc::new(SimulatedAdapter::new());
        let controller = spawn(adapter.clone(), registry(SelectionMode::EncryptAll, &[]).await);

        controller.connect().await.unwrap();
        controller.shutdown().await.unwrap();

        assert_eq!(controller.connect().await, Err(VpnError::ControllerClosed));
        assert_eq!(adapter.stop_calls(), 0);
    }
}
