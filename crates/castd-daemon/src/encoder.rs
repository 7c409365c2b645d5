//! Encoder worker session controller.
//!
//! One [`Encoder`] supervises one worker process over its full life: it
//! launches the worker with a handshake pipe, learns the worker's bus name
//! from the first pipe read, opens the control bus, mirrors the worker's
//! self-reported lifecycle state, and tears the worker down on stop, exit,
//! or disappearance from the bus.
//!
//! Every asynchronous registration (child-exit watcher, pipe watcher,
//! grace timer, and the two bus subscriptions) owns a strong reference to
//! the controller for as long as it is installed. The controller therefore
//! outlives every pending event and its resources are released exactly
//! once, when the last reference goes away.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use nix::unistd::Pid;
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use castd_rpc::protocol::{
    METHOD_CONFIGURE, METHOD_PAUSE, METHOD_START, METHOD_STOP, MatchRule, Notification,
    PROP_STATE, PresenceChanged, PropertiesChanged,
};
use castd_rpc::{BusConnection, Subscription, bus_socket_path};
use castd_types::{ConfigEntry, ConfigureParams, EncoderState, SessionParams};

use crate::error::{EncoderError, Result};
use crate::spawner::{self, SpawnedWorker};

/// How long a stopped worker gets to exit on its own before the fallback
/// signal fires.
const TERM_GRACE: Duration = Duration::from_secs(1);

/// Handshake payloads are one short bus name.
const HANDSHAKE_BUF_SIZE: usize = 1024;

/// Callback invoked on every accepted state transition.
pub type StateObserver = Arc<dyn Fn(EncoderState) + Send + Sync>;

/// Construction-time dependencies of a controller.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Worker program, resolved via `PATH`.
    pub program: String,
    /// Socket of the bus broker the worker is reached through.
    pub bus_path: PathBuf,
    /// Grace period between a stop request and the fallback signal.
    pub term_grace: Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "gstencoder".to_string(),
            bus_path: bus_socket_path(),
            term_grace: TERM_GRACE,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live asynchronous registrations. Each holds one reference to the
/// controller through the spawned task it names.
#[derive(Default)]
struct Watchers {
    child: Option<JoinHandle<()>>,
    pipe: Option<JoinHandle<()>>,
    term_timer: Option<JoinHandle<()>>,
    state_sub: Option<JoinHandle<()>>,
    presence_sub: Option<JoinHandle<()>>,
}

impl Watchers {
    fn abort_all(&mut self) {
        for handle in [
            self.child.take(),
            self.pipe.take(),
            self.term_timer.take(),
            self.state_sub.take(),
            self.presence_sub.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner {
    config: EncoderConfig,
    session: SessionParams,
    /// Bus name the worker registered under; set once by the handshake.
    peer_name: OnceLock<String>,
    bus: Mutex<Option<Arc<BusConnection>>>,
    child_pid: Mutex<Option<Pid>>,
    state: Mutex<EncoderState>,
    observer: Mutex<Option<StateObserver>>,
    watchers: Mutex<Watchers>,
}

impl Inner {
    fn new(session: SessionParams, config: EncoderConfig) -> Self {
        Self {
            config,
            session,
            peer_name: OnceLock::new(),
            bus: Mutex::new(None),
            child_pid: Mutex::new(None),
            state: Mutex::new(EncoderState::Null),
            observer: Mutex::new(None),
            watchers: Mutex::new(Watchers::default()),
        }
    }
}

/// Shared handle to one supervised encoder worker.
#[derive(Clone)]
pub struct Encoder {
    inner: Arc<Inner>,
}

impl Encoder {
    /// Launch a worker for `session` and begin supervising it.
    ///
    /// Returns as soon as the process and its watchers exist; the bus
    /// connection follows asynchronously once the worker reports its name,
    /// observable as the `SPAWNED` transition. Must be called within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe, the process, or the pipe watcher
    /// cannot be created. Partially created resources are torn down before
    /// the error returns.
    pub fn spawn(session: SessionParams, config: EncoderConfig) -> Result<Self> {
        let inner = Arc::new(Inner::new(session, config));

        let SpawnedWorker { mut child, pipe } =
            spawner::spawn_worker(&inner.config.program, &inner.session)?;

        let pid = child.id();
        *lock(&inner.child_pid) = pid.map(spawner::pid_from_u32);
        if let (Some(pid), Some(stderr)) = (pid, child.stderr.take()) {
            spawner::spawn_stderr_logger(pid, stderr);
        }
        info!("spawned encoder {} (pid {:?})", inner.config.program, pid);

        let child_watcher = tokio::spawn(run_child_watcher(Arc::clone(&inner), child));
        let pipe_watcher = tokio::spawn(run_handshake(Arc::clone(&inner), pipe));
        {
            let mut watchers = lock(&inner.watchers);
            watchers.child = Some(child_watcher);
            watchers.pipe = Some(pipe_watcher);
        }

        Ok(Self { inner })
    }

    #[must_use]
    pub fn state(&self) -> EncoderState {
        *lock(&self.inner.state)
    }

    /// Install the observer invoked on every accepted state transition.
    /// The callback runs synchronously inside the event that triggered the
    /// transition.
    pub fn set_observer(&self, observer: impl Fn(EncoderState) + Send + Sync + 'static) {
        *lock(&self.inner.observer) = Some(Arc::new(observer));
    }

    /// Bus name the worker registered under, once the handshake completed.
    #[must_use]
    pub fn peer_name(&self) -> Option<&str> {
        self.inner.peer_name.get().map(String::as_str)
    }

    /// Send the full stream configuration to the worker.
    ///
    /// # Errors
    ///
    /// Remote failures are returned to the caller and may be retried; the
    /// worker is left running.
    pub async fn configure(&self) -> Result<()> {
        let (bus, peer) = self.connection()?;
        let params = build_configure_params(&self.inner.session);
        if let Err(e) = bus
            .call(&peer, METHOD_CONFIGURE, Some(params.to_wire()))
            .await
        {
            warn!("configure failed: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Start streaming.
    ///
    /// # Errors
    ///
    /// On a remote failure the control channel is no longer trusted: the
    /// worker is signalled and the error returned.
    pub async fn start(&self) -> Result<()> {
        self.call(METHOD_START).await
    }

    /// Pause streaming.
    ///
    /// # Errors
    ///
    /// Same contract as [`Encoder::start`].
    pub async fn pause(&self) -> Result<()> {
        self.call(METHOD_PAUSE).await
    }

    /// Ask the worker to wind down.
    ///
    /// Whatever the call's outcome, the single-shot grace timer is armed
    /// and one immediate termination signal follows, so every stop ends
    /// with at least one signal. A worker that honors the stop exits
    /// before the timer fires and the timer is retired unfired.
    ///
    /// # Errors
    ///
    /// Remote failures follow the [`Encoder::start`] contract.
    pub async fn stop(&self) -> Result<()> {
        let result = self.call(METHOD_STOP).await;
        self.arm_term_timer();
        if let Err(e) = self.kill_child(true) {
            warn!("failed to signal encoder after stop: {}", e);
        }
        result
    }

    /// Signal the worker if one is still supervised. Returns whether a
    /// process was there to signal; exit is only ever observed through the
    /// exit watcher, never synchronously here.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal could not be delivered to a live
    /// process.
    pub fn kill_child(&self, graceful: bool) -> Result<bool> {
        kill_child(&self.inner, graceful)
    }

    async fn call(&self, method: &str) -> Result<()> {
        let (bus, peer) = self.connection()?;
        if let Err(e) = bus.call(&peer, method, None).await {
            warn!("{} failed: {}", method, e);
            if let Err(kill_err) = self.kill_child(true) {
                warn!("failed to signal encoder: {}", kill_err);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn connection(&self) -> Result<(Arc<BusConnection>, String)> {
        let bus = lock(&self.inner.bus)
            .clone()
            .ok_or(EncoderError::NotConnected)?;
        let peer = self
            .inner
            .peer_name
            .get()
            .cloned()
            .ok_or(EncoderError::NotConnected)?;
        Ok((bus, peer))
    }

    fn arm_term_timer(&self) {
        let inner = Arc::clone(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.config.term_grace).await;
            match kill_child(&inner, true) {
                Ok(true) => debug!("grace period expired, signalled encoder"),
                Ok(false) => debug!("grace period expired, encoder already gone"),
                Err(e) => warn!("grace timer failed to signal encoder: {}", e),
            }
            lock(&inner.watchers).term_timer.take();
        });

        let mut watchers = lock(&self.inner.watchers);
        if let Some(old) = watchers.term_timer.replace(timer) {
            // at most one grace timer may be outstanding
            old.abort();
        }
    }
}

fn kill_child(inner: &Inner, graceful: bool) -> Result<bool> {
    let Some(pid) = *lock(&inner.child_pid) else {
        return Ok(false);
    };
    match spawner::signal_worker(pid, graceful) {
        Ok(()) => Ok(true),
        // The worker exited between the check and the signal.
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn set_state(inner: &Arc<Inner>, next: EncoderState) {
    let current = {
        let mut state = lock(&inner.state);
        let current = *state;
        if current == next || current.is_terminal() {
            return;
        }
        *state = next;
        current
    };
    debug!("state change from {} to {}", current, next);

    // Hold an extra reference across the callback so an observer that
    // drops the last external handle cannot free the controller under us.
    let guard = Arc::clone(inner);
    let observer = lock(&guard.observer).clone();
    if let Some(observer) = observer {
        observer(next);
    }
}

/// Retire every remaining registration. Each aborted task drops its
/// reference to the controller; the last one to go frees its resources.
/// Must be the final action of the event task that calls it.
fn cleanup(inner: &Inner) {
    lock(&inner.watchers).abort_all();
}

async fn run_child_watcher(inner: Arc<Inner>, mut child: tokio::process::Child) {
    let pid = child.id();
    match child.wait().await {
        Ok(status) => info!("encoder {:?} terminated: {}", pid, status),
        Err(e) => warn!("failed to observe encoder {:?} exit: {}", pid, e),
    }
    lock(&inner.child_pid).take();
    set_state(&inner, EncoderState::Terminated);
    cleanup(&inner);
}

async fn run_handshake(inner: Arc<Inner>, handshake: pipe::Receiver) {
    let mut buf = [0u8; HANDSHAKE_BUF_SIZE];
    match read_handshake(&handshake, &mut buf).await {
        Ok(len) => {
            let name = String::from_utf8_lossy(&buf[..len]).trim().to_string();
            if name.is_empty() {
                warn!("encoder reported a blank bus name");
                fail_handshake(&inner);
            } else {
                info!("got bus name from encoder: {}", name);
                let _ = inner.peer_name.set(name.clone());
                match connect_bus(&inner, &name).await {
                    Ok(()) => set_state(&inner, EncoderState::Spawned),
                    Err(e) => {
                        error!("failed to reach encoder on the bus: {}", e);
                        fail_handshake(&inner);
                    }
                }
            }
        }
        Err(e) => {
            warn!("no bus name returned from encoder: {}", e);
            fail_handshake(&inner);
        }
    }

    // Single-shot: the watcher retires itself whatever the outcome, and
    // the pipe closes when the receiver drops.
    lock(&inner.watchers).pipe.take();
}

async fn read_handshake(handshake: &pipe::Receiver, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        handshake.readable().await?;
        match handshake.try_read(buf) {
            // The worker closed its end without reporting a name.
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "pipe closed before handshake",
                ));
            }
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
}

fn fail_handshake(inner: &Inner) {
    match kill_child(inner, true) {
        Ok(true) => {}
        Ok(false) => debug!("no encoder process left to signal"),
        Err(e) => warn!("failed to signal encoder: {}", e),
    }
}

async fn connect_bus(inner: &Arc<Inner>, peer: &str) -> Result<()> {
    let bus = Arc::new(BusConnection::open(&inner.config.bus_path).await?);

    let states = bus.subscribe(MatchRule::properties_changed(peer)).await?;
    let presence = bus.subscribe(MatchRule::presence_of(peer)).await?;

    *lock(&inner.bus) = Some(bus);

    let state_sub = tokio::spawn(run_state_subscription(Arc::clone(inner), states));
    let presence_sub = tokio::spawn(run_presence_subscription(Arc::clone(inner), presence));
    let mut watchers = lock(&inner.watchers);
    watchers.state_sub = Some(state_sub);
    watchers.presence_sub = Some(presence_sub);
    Ok(())
}

async fn run_state_subscription(inner: Arc<Inner>, mut sub: Subscription) {
    while let Some(n) = sub.recv().await {
        on_properties_changed(&inner, &n);
    }
}

fn on_properties_changed(inner: &Arc<Inner>, n: &Notification) {
    let Some(params) = &n.params else { return };
    let properties: PropertiesChanged = match serde_json::from_value(params.clone()) {
        Ok(p) => p,
        Err(e) => {
            warn!("malformed property change from encoder: {}", e);
            return;
        }
    };

    // The interface argument was already matched by the subscription rule.
    for (name, value) in &properties.changed {
        if name != PROP_STATE {
            continue;
        }
        let Some(code) = value.as_i64() else {
            error!("non-integer state property: {}", value);
            return;
        };
        match EncoderState::from_wire(code) {
            Some(state) => set_state(inner, state),
            None => error!("encoder entered unknown state: {}", code),
        }
        // only the first State entry counts
        return;
    }
}

async fn run_presence_subscription(inner: Arc<Inner>, mut sub: Subscription) {
    while let Some(n) = sub.recv().await {
        let Some(params) = n.params else { continue };
        let presence: PresenceChanged = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed presence event: {}", e);
                continue;
            }
        };
        if presence.present
            || inner.peer_name.get().map(String::as_str) != Some(presence.name.as_str())
        {
            continue;
        }

        info!("encoder {} disappeared", presence.name);
        match kill_child(&inner, true) {
            // A child is still supervised; its exit event finishes the
            // teardown.
            Ok(true) => {}
            Ok(false) => {
                set_state(&inner, EncoderState::Terminated);
                cleanup(&inner);
                return;
            }
            Err(e) => {
                warn!("failed to signal vanished encoder: {}", e);
                set_state(&inner, EncoderState::Terminated);
                cleanup(&inner);
                return;
            }
        }
    }
}

fn build_configure_params(session: &SessionParams) -> ConfigureParams {
    let mut params = ConfigureParams::new();
    params.push(ConfigEntry::PeerAddress(session.peer_address.clone()));
    params.push(ConfigEntry::RtpPort(u32::from(session.rtp_port)));
    if let Some(port) = session.rtcp_port {
        params.push(ConfigEntry::PeerRtcpPort(u32::from(port)));
    }
    params.push(ConfigEntry::LocalAddress(session.local_address.clone()));
    if let Some(port) = session.rtcp_port {
        params.push(ConfigEntry::LocalRtcpPort(u32::from(port)));
    }
    if let Some(rect) = &session.display_rect {
        params.push(ConfigEntry::X(rect.x));
        params.push(ConfigEntry::Y(rect.y));
        params.push(ConfigEntry::Width(rect.width));
        params.push(ConfigEntry::Height(rect.height));
    }
    params
}
