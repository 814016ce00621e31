//! The coordination point: owns the registry and every process record, and
//! applies all state transitions on a single thread.
//!
//! Worker threads (output pumps, terminators, start sequences) never touch
//! runtime state directly. They post [`WorkerMessage`]s to the coordination
//! queue, which is drained by [`Supervisor::tick`].
use std::process::Child;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, Sender, SyncSender},
};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ScriptDefinition};
use crate::constants::{
    CPU_SAMPLE_INTERVAL, MAX_MESSAGES_PER_TICK, QUEUE_POLL_INTERVAL, RELOAD_STOP_TIMEOUT,
    RESTART_SETTLE_DELAY,
};
use crate::error::{SupervisorError, TerminateError};
use crate::events::{self, EventSink, NoticeLevel, SupervisorEvent};
use crate::launcher::{ProcessLauncher, StartOutcome};
use crate::metrics::CpuMonitor;
use crate::output::{OutputPump, RawOutputLog};
use crate::platform::{self, Platform};
use crate::registry::{LaunchId, ProcessRecord, ScriptRegistry, ScriptStatus};
use crate::sequencer::{Generation, Sequencer, StartAck};
use crate::terminator::{ProcessTerminator, TerminateRequest};

/// Messages posted by worker threads to the coordination point.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// A chunk of output read from a launch's stream.
    Output { launch: LaunchId, chunk: String },
    /// The launch's output stream reached end-of-file.
    StreamClosed { launch: LaunchId },
    /// A start requested by a sequence. The PID or failure reason is sent
    /// back on `ack` once the start has been applied. Refused when
    /// `generation` has since been cancelled.
    StartRequest {
        name: String,
        generation: Generation,
        ack: Option<SyncSender<StartAck>>,
    },
    /// A terminate attempt finished.
    Terminated {
        launch: LaunchId,
        name: String,
        target: u32,
        result: Result<(), TerminateError>,
    },
}

#[derive(Debug)]
enum ScheduledAction {
    Start(String),
}

#[derive(Debug)]
struct Scheduled {
    due: Instant,
    action: ScheduledAction,
}

/// Tunables derived from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Pause between consecutive starts of a sequence.
    pub start_delay: Duration,
    /// Whether [`Supervisor::autostart`] does anything.
    pub autostart_enabled: bool,
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            start_delay: config.start_delay(),
            autostart_enabled: config.autostart_enabled,
        }
    }
}

/// Supervises the configured scripts.
pub struct Supervisor {
    registry: ScriptRegistry,
    settings: SupervisorSettings,
    queue_tx: Sender<WorkerMessage>,
    queue_rx: Receiver<WorkerMessage>,
    events: EventSink,
    cpu: Option<CpuMonitor>,
    terminator: ProcessTerminator,
    sequencer: Sequencer,
    scheduled: Vec<Scheduled>,
    /// Processes whose output closed while the root was still alive.
    /// Kept only so they are reaped.
    lingering: Vec<(String, Child)>,
    next_launch: LaunchId,
    last_sample: Instant,
    total_cpu: f32,
}

impl Supervisor {
    /// Creates a supervisor over the native platform. Returns the receiving
    /// end of the event stream alongside it.
    pub fn new(config: Config) -> Result<(Self, Receiver<SupervisorEvent>), SupervisorError> {
        Self::with_platform(config, platform::native(), CpuMonitor::new())
    }

    /// Creates a supervisor with explicit platform services. `cpu` is `None`
    /// when CPU sampling is unavailable; liveness polling still runs.
    pub fn with_platform(
        config: Config,
        platform: Arc<dyn Platform>,
        cpu: Option<CpuMonitor>,
    ) -> Result<(Self, Receiver<SupervisorEvent>), SupervisorError> {
        let settings = SupervisorSettings::from(&config);
        let registry = ScriptRegistry::from_definitions(config.scripts)?;
        let (queue_tx, queue_rx) = mpsc::channel();
        let (events, event_rx) = events::channel();

        let supervisor = Self {
            registry,
            settings,
            queue_tx,
            queue_rx,
            events,
            cpu,
            terminator: ProcessTerminator::new(platform),
            sequencer: Sequencer::new(),
            scheduled: Vec::new(),
            lingering: Vec::new(),
            next_launch: 0,
            last_sample: Instant::now(),
            total_cpu: 0.0,
        };
        Ok((supervisor, event_rx))
    }

    /// The managed scripts, in configuration order.
    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    /// Mutable access for definition edits: upsert, rename, remove.
    pub fn registry_mut(&mut self) -> &mut ScriptRegistry {
        &mut self.registry
    }

    /// Adds or replaces a script definition.
    pub fn upsert(&mut self, definition: ScriptDefinition) -> Result<(), SupervisorError> {
        self.registry.upsert(definition)
    }

    /// Removes a script that is not running.
    pub fn remove(&mut self, name: &str) -> Result<ScriptDefinition, SupervisorError> {
        self.registry.remove(name)
    }

    /// Start delay and autostart flag currently in effect.
    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Changes the pause used by sequences spawned from now on.
    pub fn set_start_delay(&mut self, delay: Duration) {
        self.settings.start_delay = delay;
    }

    /// Effective status of `name`, or `None` for an unknown script.
    pub fn status(&self, name: &str) -> Option<ScriptStatus> {
        self.registry.runtime(name).map(|runtime| runtime.status())
    }

    /// Root PID of `name` while it is running.
    pub fn pid(&self, name: &str) -> Option<u32> {
        self.registry
            .runtime(name)
            .and_then(|runtime| runtime.record())
            .filter(|record| record.is_running())
            .and_then(ProcessRecord::pid)
    }

    /// Snapshot of the CPU history of `name`, oldest first.
    pub fn history(&self, name: &str) -> Option<Vec<f32>> {
        self.registry
            .runtime(name)
            .map(|runtime| runtime.history().to_vec())
    }

    /// Output captured since the last start of `name`.
    pub fn output(&self, name: &str) -> Option<&RawOutputLog> {
        self.registry.runtime(name).map(|runtime| runtime.output())
    }

    /// Empties a script's output log.
    pub fn clear_output(&mut self, name: &str) -> Result<(), SupervisorError> {
        let entry = self
            .registry
            .entry_mut(name)
            .ok_or_else(|| SupervisorError::UnknownScript(name.to_string()))?;
        entry.runtime.output.clear();
        Ok(())
    }

    /// Summed CPU usage of all scripts in the most recent sampling pass.
    pub fn total_cpu(&self) -> f32 {
        self.total_cpu
    }

    fn allocate_launch(&mut self) -> LaunchId {
        self.next_launch += 1;
        self.next_launch
    }

    /// Starts a script. A no-op when its process is already alive.
    ///
    /// On success the output log is cleared, the CPU history is reset, and
    /// the script's process tree is registered for sampling. A launch
    /// failure records an `Error` status and is never retried.
    pub fn start(&mut self, name: &str) -> Result<StartOutcome, SupervisorError> {
        let stale = {
            let entry = self
                .registry
                .entry_mut(name)
                .ok_or_else(|| SupervisorError::UnknownScript(name.to_string()))?;
            match entry.runtime.record.as_mut() {
                Some(record) if record.is_running() => {
                    if record.poll_alive() {
                        let pid = record.pid.unwrap_or_default();
                        info!("Script '{name}' is already running with PID {pid}");
                        return Ok(StartOutcome::AlreadyRunning(pid));
                    }
                    Some(record.launch_id)
                }
                _ => None,
            }
        };
        if let Some(launch) = stale {
            debug!("Script '{name}' exited before restart was requested");
            self.mark_stopped(launch);
        }

        let launch = self.allocate_launch();
        let Some(entry) = self.registry.entry_mut(name) else {
            return Err(SupervisorError::UnknownScript(name.to_string()));
        };

        entry.runtime.output.clear();
        entry.runtime.history.reset();

        let launched = match ProcessLauncher::spawn(&entry.definition) {
            Ok(launched) => launched,
            Err(err) => {
                error!("{err}");
                let reason = err.to_string();
                entry.runtime.record = Some(ProcessRecord::failed(reason.clone(), launch));
                self.events.emit(SupervisorEvent::StatusChanged {
                    name: name.to_string(),
                    status: ScriptStatus::Error(reason.clone()),
                    pid: None,
                });
                self.events.notice(name, NoticeLevel::Error, reason);
                return Err(err.into());
            }
        };

        let mut child = launched.child;
        let pid = child.id();

        if let Err(err) = OutputPump::spawn(name, launch, launched.output, self.queue_tx.clone())
        {
            error!("Failed to read output of '{name}': {err}");
            let _ = child.kill();
            let _ = child.wait();
            let reason = format!("output reader unavailable: {err}");
            entry.runtime.record = Some(ProcessRecord::failed(reason.clone(), launch));
            self.events.emit(SupervisorEvent::StatusChanged {
                name: name.to_string(),
                status: ScriptStatus::Error(reason),
                pid: None,
            });
            return Err(SupervisorError::Worker(err));
        }

        let samples = self.cpu.as_ref().map(|cpu| cpu.register(pid));
        entry.runtime.record = Some(ProcessRecord::running(child, launch, samples));

        info!("Started script '{name}' with PID {pid}");
        self.events.emit(SupervisorEvent::StatusChanged {
            name: name.to_string(),
            status: ScriptStatus::Running,
            pid: Some(pid),
        });
        self.events
            .notice(name, NoticeLevel::Info, format!("'{name}' started (PID {pid})"));

        Ok(StartOutcome::Started(pid))
    }

    /// Requests a forceful stop of a script's process tree.
    ///
    /// When the script declares a port, the process listening on it is the
    /// kill target; otherwise the recorded root PID is. The kill itself runs
    /// on a worker thread and the record transitions to `Stopped` once the
    /// exit is observed.
    pub fn stop(&mut self, name: &str) -> Result<(), SupervisorError> {
        let entry = self
            .registry
            .entry_mut(name)
            .ok_or_else(|| SupervisorError::UnknownScript(name.to_string()))?;
        let port = entry.definition.port;

        let Some(record) = entry.runtime.record.as_mut().filter(|r| r.is_running()) else {
            debug!("Script '{name}' is not running; nothing to stop");
            return Ok(());
        };
        let launch = record.launch_id;
        let pid = record.pid.unwrap_or_default();

        if !record.poll_alive() {
            info!("Script '{name}' (PID {pid}) has already ended");
            self.mark_stopped(launch);
            return Ok(());
        }

        info!("Stopping script '{name}' (PID {pid})");
        self.terminator
            .spawn(
                TerminateRequest {
                    name: name.to_string(),
                    launch,
                    recorded_pid: pid,
                    port,
                },
                self.queue_tx.clone(),
            )
            .map_err(SupervisorError::Worker)
    }

    /// Stops a script and starts it again after a fixed settle delay.
    pub fn restart(&mut self, name: &str) -> Result<(), SupervisorError> {
        self.stop(name)?;
        info!(
            "Restarting script '{name}' in {}s",
            RESTART_SETTLE_DELAY.as_secs()
        );
        self.scheduled.push(Scheduled {
            due: Instant::now() + RESTART_SETTLE_DELAY,
            action: ScheduledAction::Start(name.to_string()),
        });
        self.events
            .notice(name, NoticeLevel::Info, format!("'{name}' restarting"));
        Ok(())
    }

    /// Issues a stop for every running script.
    pub fn stop_all(&mut self) {
        let running = self.registry.running_names();

        for name in running {
            if let Err(err) = self.stop(&name) {
                error!("Failed to stop '{name}': {err}");
            }
        }
    }

    /// Drops scheduled restarts and cancels every start sequence in flight.
    /// Start requests those sequences already queued are refused.
    pub fn cancel_pending(&mut self) {
        if !self.scheduled.is_empty() {
            info!("Dropping {} scheduled start(s)", self.scheduled.len());
            self.scheduled.clear();
        }
        self.sequencer.cancel();
    }

    /// Replaces the managed set with `config`.
    ///
    /// Pending work is cancelled and every script is stopped first. Scripts
    /// that keep their name keep their runtime state; the rest are dropped
    /// and any process of theirs still exiting is reaped in the background.
    /// The new delay and autostart flag take effect, then autostart runs.
    pub fn reload(&mut self, config: Config) -> Result<(), SupervisorError> {
        let registry = ScriptRegistry::from_definitions(config.scripts.iter().cloned())?;
        info!("Reloading {} script definition(s)", registry.len());

        self.cancel_pending();
        self.stop_all();
        if !self.wait_until_stopped(RELOAD_STOP_TIMEOUT) {
            warn!(
                "Scripts still running after {RELOAD_STOP_TIMEOUT:?}: {}",
                self.registry.running_names().join(", ")
            );
        }

        let previous = std::mem::replace(&mut self.registry, registry);
        for (name, mut runtime) in previous.into_runtimes() {
            match self.registry.entry_mut(&name) {
                Some(entry) => entry.runtime = runtime,
                None => {
                    debug!("Script '{name}' is no longer configured");
                    if let Some(child) = runtime.record.as_mut().and_then(|r| r.child.take()) {
                        self.lingering.push((name, child));
                    }
                }
            }
        }

        self.settings = SupervisorSettings::from(&config);
        self.autostart()?;
        Ok(())
    }

    /// Starts every script in registry order, pausing the configured delay
    /// between consecutive starts.
    pub fn start_all(&mut self) -> Result<(), SupervisorError> {
        let names = self.registry.names();
        self.run_sequence("start-all", names)
    }

    /// Starts the scripts flagged `autostart`, in registry order, unless
    /// autostart is disabled. Returns whether a sequence was launched.
    pub fn autostart(&mut self) -> Result<bool, SupervisorError> {
        if !self.settings.autostart_enabled {
            info!("Autostart disabled; not starting any scripts");
            return Ok(false);
        }

        let names: Vec<String> = self
            .registry
            .list()
            .filter(|definition| definition.autostart)
            .map(|definition| definition.name.clone())
            .collect();
        if names.is_empty() {
            debug!("No scripts flagged for autostart");
            return Ok(false);
        }

        self.run_sequence("autostart", names)?;
        Ok(true)
    }

    fn run_sequence(&mut self, label: &str, names: Vec<String>) -> Result<(), SupervisorError> {
        if names.is_empty() {
            return Ok(());
        }
        self.sequencer
            .spawn(label, names, self.settings.start_delay, self.queue_tx.clone())
            .map_err(SupervisorError::Worker)
    }

    /// Applies queued worker messages and any scheduled actions that are due.
    pub fn tick(&mut self) {
        for _ in 0..MAX_MESSAGES_PER_TICK {
            match self.queue_rx.try_recv() {
                Ok(message) => self.handle_message(message),
                Err(_) => break,
            }
        }
        self.run_due_actions();
        self.reap_lingering();
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Output { launch, chunk } => {
                let Some(entry) = self.registry.entry_by_launch_mut(launch) else {
                    debug!("Dropping output of superseded launch {launch}");
                    return;
                };
                entry.runtime.output.push(chunk.clone());
                self.events.emit(SupervisorEvent::OutputLine {
                    name: entry.definition.name.clone(),
                    text: chunk,
                });
            }
            WorkerMessage::StreamClosed { launch } => self.mark_stopped(launch),
            WorkerMessage::StartRequest {
                name,
                generation,
                ack,
            } => {
                if generation != self.sequencer.generation() {
                    info!("Ignoring start of '{name}' from a cancelled sequence");
                    if let Some(ack) = ack {
                        let _ = ack.send(Err("sequence cancelled".to_string()));
                    }
                    return;
                }
                let reply = self
                    .start(&name)
                    .map(|outcome| outcome.pid())
                    .map_err(|err| err.to_string());
                if let Some(ack) = ack {
                    let _ = ack.send(reply);
                }
            }
            WorkerMessage::Terminated {
                launch,
                name,
                target,
                result,
            } => self.handle_terminated(launch, &name, target, result),
        }
    }

    fn handle_terminated(
        &mut self,
        launch: LaunchId,
        name: &str,
        target: u32,
        result: Result<(), TerminateError>,
    ) {
        match &result {
            Ok(()) => info!("Terminated '{name}' (PID {target})"),
            Err(TerminateError::AlreadyGone { .. }) => {
                info!("PID {target} of '{name}' had already ended")
            }
            Err(err) => {
                warn!("Could not terminate '{name}': {err}");
                self.events
                    .notice(name, NoticeLevel::Warning, err.to_string());
            }
        }

        let exited = self
            .registry
            .entry_by_launch_mut(launch)
            .and_then(|entry| entry.runtime.record.as_mut())
            .is_some_and(|record| record.is_running() && !record.poll_alive());
        if exited {
            self.mark_stopped(launch);
        }
    }

    fn run_due_actions(&mut self) {
        if self.scheduled.is_empty() {
            return;
        }
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scheduled)
            .into_iter()
            .partition(|scheduled| scheduled.due <= now);
        self.scheduled = pending;

        for scheduled in due {
            match scheduled.action {
                ScheduledAction::Start(name) => {
                    if let Err(err) = self.start(&name) {
                        error!("Scheduled start of '{name}' failed: {err}");
                    }
                }
            }
        }
    }

    /// Transitions the record of `launch` to `Stopped`. Idempotent, and a
    /// no-op when `launch` is no longer the script's current launch.
    fn mark_stopped(&mut self, launch: LaunchId) {
        let Some(entry) = self.registry.entry_by_launch_mut(launch) else {
            debug!("Ignoring exit of superseded launch {launch}");
            return;
        };
        let Some(record) = entry.runtime.record.as_mut() else {
            return;
        };
        if !record.is_running() {
            return;
        }

        let name = entry.definition.name.clone();
        let pid = record.pid.take();
        record.status = ScriptStatus::Stopped;
        record.samples = None;

        if let Some(mut child) = record.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!("Script '{name}' exited with {status}"),
                Ok(None) => {
                    debug!("Output of '{name}' closed while PID {} is alive", child.id());
                    self.lingering.push((name.clone(), child));
                }
                Err(err) => warn!("Failed to reap '{name}': {err}"),
            }
        }

        info!("Script '{name}' stopped");
        self.events.emit(SupervisorEvent::StatusChanged {
            name: name.clone(),
            status: ScriptStatus::Stopped,
            pid: None,
        });
        let message = match pid {
            Some(pid) => format!("'{name}' stopped (PID {pid})"),
            None => format!("'{name}' stopped"),
        };
        self.events.notice(&name, NoticeLevel::Info, message);
    }

    fn reap_lingering(&mut self) {
        self.lingering.retain_mut(|(name, child)| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Reaped detached process of '{name}': {status}");
                false
            }
            Err(_) => false,
        });
    }

    /// One liveness and CPU sampling pass.
    ///
    /// Every running record's root process is polled; exits found here are
    /// handled immediately. With CPU sampling available, each live script's
    /// tree usage is appended to its history and the overall sum recomputed.
    pub fn sample(&mut self) {
        self.last_sample = Instant::now();
        if let Some(cpu) = self.cpu.as_mut() {
            cpu.refresh();
        }

        let mut exited = Vec::new();
        let mut total = 0.0;
        for entry in self.registry.entries_mut() {
            let Some(record) = entry.runtime.record.as_mut() else {
                continue;
            };
            if !record.is_running() {
                continue;
            }
            if !record.poll_alive() {
                exited.push(record.launch_id);
                continue;
            }

            if let (Some(cpu), Some(samples)) = (self.cpu.as_ref(), record.samples.as_mut()) {
                let percent = cpu.sample(samples);
                entry.runtime.history.push(percent);
                total += percent;
                self.events.emit(SupervisorEvent::CpuSample {
                    name: entry.definition.name.clone(),
                    percent,
                    history: entry.runtime.history.to_vec(),
                });
            }
        }

        for launch in exited {
            self.mark_stopped(launch);
        }

        if self.cpu.is_some() {
            self.total_cpu = total;
            self.events
                .emit(SupervisorEvent::TotalCpu { percent: total });
        }
    }

    /// Ticks, and samples when the sampling period has elapsed.
    pub fn poll(&mut self) {
        self.tick();
        if self.last_sample.elapsed() >= CPU_SAMPLE_INTERVAL {
            self.sample();
        }
    }

    /// Number of autostart/start-all sequences still in progress.
    pub fn active_sequences(&self) -> usize {
        self.sequencer.active()
    }

    /// Whether nothing is running, scheduled or being sequenced.
    pub fn is_idle(&self) -> bool {
        self.scheduled.is_empty()
            && self.sequencer.active() == 0
            && self.registry.running_names().is_empty()
    }

    /// Drives the coordination loop until `shutdown` is raised, or until the
    /// supervisor becomes idle when `exit_when_idle` is set.
    pub fn run(&mut self, shutdown: &AtomicBool, exit_when_idle: bool) {
        while !shutdown.load(Ordering::SeqCst) {
            self.poll();
            if exit_when_idle && self.is_idle() {
                debug!("All scripts finished; leaving coordination loop");
                break;
            }
            thread::sleep(QUEUE_POLL_INTERVAL);
        }
    }

    /// Keeps polling until no script is running or `timeout` elapses.
    /// Returns whether everything stopped.
    pub fn wait_until_stopped(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            let running = !self.registry.running_names().is_empty();
            if !running {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(QUEUE_POLL_INTERVAL);
        }
    }
}
