// Bot lifecycle manager: owns the single game connection, its reconnect
// policy, the post-spawn login script and the anti-idle loop.
//
// All state lives behind one mutex. Every transition, whether it comes from an
// HTTP handler, a connection event or a timer, runs under that lock, so the
// online flag, the reconnect flag and the handle always change together.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::client::{ClientError, Connection, ConnectOptions, Connector, Control, GameEvent, GameHandle};
use crate::metrics;
use crate::relay::{BotEvent, BotStatus, ChatEvent, EventRelay, LogEntry, LogLevel, Subscription};

/// Delay between spawning and running the login script.
pub const LOGIN_DELAY: Duration = Duration::from_millis(5000);
/// Period of the anti-idle loop.
pub const ANTI_IDLE_INTERVAL: Duration = Duration::from_millis(60_000);
/// How long `forward` is held on each anti-idle tick.
pub const FORWARD_HOLD: Duration = Duration::from_millis(1000);
/// How long `jump` is held on each anti-idle tick.
pub const JUMP_HOLD: Duration = Duration::from_millis(500);
/// Delay before reconnecting after a disconnect.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(10_000);

/// Reason given to the server when the panel stops the bot.
pub const QUIT_REASON: &str = "Shutting down (panel)";

/// Chat commands sent after spawning. `{password}` is replaced with the bot's password.
pub const DEFAULT_LOGIN_COMMANDS: [&str; 2] = ["/register {password} {password}", "/login {password}"];

/// Timer settings. The defaults are the production values.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub login_delay: Duration,
    pub anti_idle_interval: Duration,
    pub forward_hold: Duration,
    pub jump_hold: Duration,
    pub reconnect_delay: Duration,
    /// When set, the reconnect delay doubles per consecutive failed attempt up
    /// to this cap. `None` keeps the delay fixed.
    pub reconnect_max_delay: Option<Duration>,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            login_delay: LOGIN_DELAY,
            anti_idle_interval: ANTI_IDLE_INTERVAL,
            forward_hold: FORWARD_HOLD,
            jump_hold: JUMP_HOLD,
            reconnect_delay: RECONNECT_DELAY,
            reconnect_max_delay: None,
        }
    }
}

/// Everything the manager needs to know about the bot it runs.
#[derive(Debug, Clone)]
pub struct BotSettings {
    pub connect: ConnectOptions,
    pub login_commands: Vec<String>,
    pub timings: Timings,
}

/// Lifecycle phase of the bot connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Never started.
    Offline,
    /// A connection is being requested.
    Connecting,
    /// A connection was requested and has not ended. This is reported as soon
    /// as the request is issued, before the server handshake completes.
    Online,
    /// The last connection ended on its own; a reconnect may be pending.
    Ended,
    /// Explicitly stopped from the panel.
    Stopped,
}

/// Handle to the bot lifecycle manager. Cheap to clone; all clones share one bot.
#[derive(Clone)]
pub struct BotManager {
    inner: Arc<Inner>,
}

struct Inner {
    settings: BotSettings,
    connector: Arc<dyn Connector>,
    relay: EventRelay,
    state: Mutex<ManagerState>,
}

struct ManagerState {
    phase: Phase,
    reconnect_enabled: bool,
    /// Bumped for every connection attempt. Events and timers carry the
    /// generation they belong to and are dropped once it is stale.
    generation: u64,
    session: Option<Session>,
    reconnect_timer: Option<JoinHandle<()>>,
    /// Consecutive connections that ended without spawning.
    failed_attempts: u32,
}

impl ManagerState {
    fn current(&self, generation: u64) -> Option<&Session> {
        self.session
            .as_ref()
            .filter(|s| s.generation == generation)
    }

    fn current_mut(&mut self, generation: u64) -> Option<&mut Session> {
        self.session
            .as_mut()
            .filter(|s| s.generation == generation)
    }

    fn status(&self) -> BotStatus {
        BotStatus {
            online: self.phase == Phase::Online,
            username: self.session.as_ref().and_then(|s| s.identity.clone()),
        }
    }
}

/// One connection attempt and the tasks tied to it.
struct Session {
    generation: u64,
    handle: Arc<dyn GameHandle>,
    identity: Option<String>,
    event_pump: JoinHandle<()>,
    login_script: Option<JoinHandle<()>>,
    anti_idle: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.event_pump.abort();
        if let Some(task) = self.login_script.take() {
            task.abort();
        }
        if let Some(task) = self.anti_idle.take() {
            task.abort();
        }
    }
}

impl BotManager {
    pub fn new(settings: BotSettings, connector: Arc<dyn Connector>, relay: EventRelay) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                connector,
                relay,
                state: Mutex::new(ManagerState {
                    phase: Phase::Offline,
                    reconnect_enabled: false,
                    generation: 0,
                    session: None,
                    reconnect_timer: None,
                    failed_attempts: 0,
                }),
            }),
        }
    }

    /// Request a connection. Returns immediately; the outcome is reported
    /// through relay events. A no-op while a connection is already up.
    pub fn start(&self) {
        let mut state = self.lock();
        self.start_locked(&mut state);
    }

    /// Disconnect and disable automatic reconnection. Safe to call at any time.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.reconnect_enabled = false;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }

        let Some(session) = state.session.take() else {
            if state.phase == Phase::Ended {
                state.phase = Phase::Stopped;
            }
            return;
        };
        if let Err(e) = session.handle.quit(QUIT_REASON) {
            tracing::debug!("quit on stop failed: {e}");
        }
        drop(session);

        state.phase = Phase::Stopped;
        metrics::BOT_ONLINE.set(0);
        self.publish_status(&state);
        self.emit_log(LogLevel::Info, "Bot stopped");
    }

    /// Send a chat line as the bot. Returns false when there is no connection
    /// or the client refuses the line.
    pub fn send_message(&self, text: &str) -> bool {
        let state = self.lock();
        let Some(session) = state.session.as_ref() else {
            self.emit_log(LogLevel::Warn, "Bot not connected");
            return false;
        };
        match session.handle.chat(text) {
            Ok(()) => {
                metrics::CHAT_MESSAGES_SENT_TOTAL.inc();
                self.emit_log(LogLevel::Info, format!("Sent chat: {text}"));
                true
            }
            Err(e) => {
                self.emit_log(LogLevel::Warn, format!("Failed to send chat: {e}"));
                false
            }
        }
    }

    /// Current connection status.
    pub fn status(&self) -> BotStatus {
        self.lock().status()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Whether an automatic reconnect is scheduled.
    pub fn reconnect_pending(&self) -> bool {
        self.lock().reconnect_timer.is_some()
    }

    /// Whether the anti-idle loop is running for the current connection.
    pub fn anti_idle_running(&self) -> bool {
        self.lock()
            .session
            .as_ref()
            .is_some_and(|s| s.anti_idle.is_some())
    }

    /// Subscribe a console observer. The status snapshot is taken under the
    /// manager lock, so no transition can slip in between it and the first
    /// live event.
    pub fn observe(&self) -> Subscription {
        let state = self.lock();
        self.inner.relay.subscribe(state.status())
    }

    pub fn relay(&self) -> &EventRelay {
        &self.inner.relay
    }

    // ── Transitions ──────────────────────────────────────────────────

    fn start_locked(&self, state: &mut ManagerState) {
        if matches!(state.phase, Phase::Online | Phase::Connecting) {
            self.emit_log(LogLevel::Info, "Bot already running");
            return;
        }

        state.reconnect_enabled = true;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        state.phase = Phase::Connecting;
        state.generation += 1;
        let generation = state.generation;

        let opts = &self.inner.settings.connect;
        self.emit_log(
            LogLevel::Info,
            format!(
                "Starting bot {} → {}:{} (v{})",
                opts.username, opts.host, opts.port, opts.version
            ),
        );
        metrics::BOT_CONNECT_ATTEMPTS_TOTAL.inc();

        match self.inner.connector.connect(opts) {
            Ok(Connection { handle, events }) => {
                state.session = Some(Session {
                    generation,
                    handle,
                    identity: None,
                    event_pump: self.spawn_event_pump(generation, events),
                    login_script: None,
                    anti_idle: None,
                });
                state.phase = Phase::Online;
                metrics::BOT_ONLINE.set(1);
                self.publish_status(state);
            }
            Err(e) => {
                self.emit_log(LogLevel::Error, format!("Error: {e}"));
                self.on_disconnected(state);
            }
        }
    }

    fn handle_event(&self, generation: u64, event: GameEvent) {
        let mut state = self.lock();
        if state.current(generation).is_none() {
            tracing::debug!(generation, ?event, "dropping event from stale connection");
            return;
        }

        match event {
            GameEvent::Spawn { username } => self.on_spawn(&mut state, generation, username),
            GameEvent::Chat { username, message } => {
                metrics::CHAT_MESSAGES_RECEIVED_TOTAL.inc();
                self.emit_log(LogLevel::Chat, format!("<{username}> {message}"));
                self.inner.relay.publish(BotEvent::Chat(ChatEvent {
                    username,
                    message,
                    ts: chrono::Utc::now().timestamp_millis(),
                }));
            }
            GameEvent::Message { text } => self.emit_log(LogLevel::Message, text),
            GameEvent::Kicked { reason } => {
                metrics::BOT_KICKS_TOTAL.inc();
                self.emit_log(LogLevel::Warn, format!("Kicked: {reason}"));
            }
            GameEvent::Error { message } => {
                self.emit_log(LogLevel::Error, format!("Error: {message}"));
            }
            GameEvent::End => {
                metrics::BOT_DISCONNECTS_TOTAL.inc();
                self.emit_log(LogLevel::Warn, "Bot disconnected.");
                self.on_disconnected(&mut state);
            }
        }
    }

    fn on_spawn(&self, state: &mut ManagerState, generation: u64, username: String) {
        let already_spawned = state
            .current(generation)
            .is_some_and(|s| s.anti_idle.is_some());
        if already_spawned {
            // Respawns (death, dimension change) keep the existing loop.
            if let Some(session) = state.current_mut(generation) {
                session.identity = Some(username);
            }
            tracing::debug!(generation, "ignoring repeated spawn");
            return;
        }

        state.failed_attempts = 0;
        self.emit_log(LogLevel::Info, format!("Spawned as {username}"));
        let login_script = self.spawn_login_script(generation);
        let anti_idle = self.spawn_anti_idle(generation);
        if let Some(session) = state.current_mut(generation) {
            session.identity = Some(username);
            session.login_script = Some(login_script);
            session.anti_idle = Some(anti_idle);
        }
    }

    /// Tear down the current connection and, if allowed, schedule a reconnect.
    fn on_disconnected(&self, state: &mut ManagerState) {
        state.session = None;
        state.phase = Phase::Ended;
        metrics::BOT_ONLINE.set(0);
        self.publish_status(state);

        if !state.reconnect_enabled {
            return;
        }
        let delay = self.next_reconnect_delay(state);
        self.emit_log(
            LogLevel::Info,
            format!("Reconnecting in {}...", format_delay(delay)),
        );
        metrics::BOT_RECONNECTS_SCHEDULED_TOTAL.inc();

        let generation = state.generation;
        let manager = self.clone();
        state.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.on_reconnect_timer(generation);
        }));
    }

    fn on_reconnect_timer(&self, generation: u64) {
        let mut state = self.lock();
        // The flag check and the new connection happen under one lock, so a
        // concurrent stop() either wins entirely or not at all.
        if state.generation != generation || !state.reconnect_enabled || state.session.is_some() {
            return;
        }
        // Detach rather than abort: this is the task currently running.
        state.reconnect_timer = None;
        self.start_locked(&mut state);
    }

    fn next_reconnect_delay(&self, state: &mut ManagerState) -> Duration {
        let timings = &self.inner.settings.timings;
        let attempts = state.failed_attempts;
        state.failed_attempts = state.failed_attempts.saturating_add(1);
        match timings.reconnect_max_delay {
            None => timings.reconnect_delay,
            Some(cap) => timings
                .reconnect_delay
                .checked_mul(1u32.checked_shl(attempts).unwrap_or(u32::MAX))
                .unwrap_or(cap)
                .min(cap),
        }
    }

    // ── Background tasks ─────────────────────────────────────────────

    fn spawn_event_pump(
        &self,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<GameEvent>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_event(generation, event);
            }
            // A client that drops its event stream without saying goodbye has
            // still disconnected. Ignored if `End` was already handled.
            manager.handle_event(generation, GameEvent::End);
        })
    }

    fn spawn_login_script(&self, generation: u64) -> JoinHandle<()> {
        let manager = self.clone();
        let delay = self.inner.settings.timings.login_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.run_login_script(generation);
        })
    }

    fn run_login_script(&self, generation: u64) {
        let state = self.lock();
        let Some(session) = state.current(generation) else {
            return;
        };
        let settings = &self.inner.settings;
        let Some(password) = settings.connect.password.as_deref() else {
            tracing::debug!("no bot password configured, skipping login script");
            return;
        };
        for template in &settings.login_commands {
            let command = template.replace("{password}", password);
            if let Err(e) = session.handle.chat(&command) {
                // The command carries the password, so only the verb is logged.
                let verb = template.split_whitespace().next().unwrap_or_default();
                self.emit_log(LogLevel::Warn, format!("Login command {verb} failed: {e}"));
            }
        }
    }

    fn spawn_anti_idle(&self, generation: u64) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.settings.timings.anti_idle_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !manager.anti_idle_tick(generation) {
                    break;
                }
            }
        })
    }

    /// Run one anti-idle tick. Returns false once the connection is gone.
    fn anti_idle_tick(&self, generation: u64) -> bool {
        let state = self.lock();
        let Some(session) = state.current(generation) else {
            return false;
        };
        match self.nudge(&session.handle) {
            Ok(true) => metrics::ANTI_IDLE_TICKS_TOTAL.with_label_values(&["ok"]).inc(),
            Ok(false) => metrics::ANTI_IDLE_TICKS_TOTAL
                .with_label_values(&["skipped"])
                .inc(),
            Err(e) => {
                metrics::ANTI_IDLE_TICKS_TOTAL
                    .with_label_values(&["error"])
                    .inc();
                self.emit_log(LogLevel::Error, format!("KeepAlive error: {e}"));
            }
        }
        true
    }

    /// Look somewhere nearby, step forward, hop and send an empty chat line.
    /// Returns `Ok(false)` when the client has no entity yet.
    fn nudge(&self, handle: &Arc<dyn GameHandle>) -> Result<bool, ClientError> {
        let Some(position) = handle.position() else {
            return Ok(false);
        };
        let timings = &self.inner.settings.timings;
        let (dx, dz) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-1i32..=1), rng.gen_range(-1i32..=1))
        };

        handle.look_at(position.offset(f64::from(dx), 0.0, f64::from(dz)))?;
        handle.set_control_state(Control::Forward, true)?;
        release_after(handle.clone(), Control::Forward, timings.forward_hold);
        handle.set_control_state(Control::Jump, true)?;
        release_after(handle.clone(), Control::Jump, timings.jump_hold);
        handle.chat("")?;
        Ok(true)
    }

    // ── Event emission ───────────────────────────────────────────────

    fn emit_log(&self, level: LogLevel, msg: impl Into<String>) {
        let entry = LogEntry::now(level, msg);
        match level {
            LogLevel::Warn => tracing::warn!(target: "bot", "{}", entry.msg),
            LogLevel::Error => tracing::error!(target: "bot", "{}", entry.msg),
            LogLevel::Info | LogLevel::Chat | LogLevel::Message => {
                tracing::info!(target: "bot", %level, "{}", entry.msg)
            }
        }
        self.inner.relay.publish(BotEvent::Log(entry));
    }

    fn publish_status(&self, state: &ManagerState) {
        self.inner.relay.publish(BotEvent::Status(state.status()));
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Release a held control after `hold`. Failures are ignored: the connection
/// may be gone by then.
fn release_after(handle: Arc<dyn GameHandle>, control: Control, hold: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(hold).await;
        if let Err(e) = handle.set_control_state(control, false) {
            tracing::debug!(%control, "release failed: {e}");
        }
    });
}

fn format_delay(delay: Duration) -> String {
    if delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{}ms", delay.as_millis())
    }
}
