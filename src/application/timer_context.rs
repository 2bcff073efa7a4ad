use crate::application::sync_bridge::{ChangeSignal, NowProvider, SyncBridge};
use crate::domain::engine::{
    RestoreOutcome, SessionEngine, SessionEvent, StartOutcome, TickOutcome, TickerId, Transition,
};
use crate::domain::models::{
    Mode, PopoutVisibility, SessionSnapshot, SessionState, Settings, SettingsPatch, SoundChoice,
    Surface, TaskRef,
};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::kv_store::KeyValueStore;
use crate::infrastructure::work_session_client::{NoopWorkSessionReporter, WorkSessionReporter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Presentation callbacks registered by the host surface. Every method
/// defaults to a no-op so a surface only implements what it renders.
pub trait SessionObserver: Send + Sync {
    fn on_state_changed(&self, _snapshot: &SessionSnapshot) {}
    fn on_mode_changed(&self, _mode: Mode) {}
    fn on_segment_finished(&self, _sound: SoundChoice) {}
    fn on_visibility_changed(&self, _visibility: PopoutVisibility) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    pub tick_period: Duration,
    pub auto_start_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(1),
            auto_start_delay: Duration::from_millis(800),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&AppConfig> for ContextOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            auto_start_delay: config.auto_start_delay(),
            poll_interval: config.poll_interval(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Restored(RestoreOutcome),
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileTrigger {
    StorageChanged,
    IdlePoll,
}

#[derive(Debug, Default)]
struct ContextTasks {
    ticker: Option<JoinHandle<()>>,
    auto_start: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl ContextTasks {
    fn abort_all(&mut self) {
        for handle in [self.ticker.take(), self.auto_start.take(), self.watcher.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

pub struct TimerContextBuilder<S>
where
    S: KeyValueStore + 'static,
{
    store: Arc<S>,
    surface: Surface,
    reporter: Arc<dyn WorkSessionReporter>,
    observer: Arc<dyn SessionObserver>,
    options: ContextOptions,
    now_provider: Option<NowProvider>,
}

impl<S> TimerContextBuilder<S>
where
    S: KeyValueStore + 'static,
{
    pub fn reporter(mut self, reporter: Arc<dyn WorkSessionReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn options(mut self, options: ContextOptions) -> Self {
        self.options = options;
        self
    }

    pub fn now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = Some(now_provider);
        self
    }

    pub fn build(self) -> TimerContext<S> {
        let mut bridge = SyncBridge::new(self.store);
        if let Some(now_provider) = self.now_provider {
            bridge = bridge.with_now_provider(now_provider);
        }
        let settings = bridge.load_settings();
        TimerContext {
            inner: Arc::new(ContextInner {
                engine: Mutex::new(SessionEngine::new(settings, self.surface)),
                bridge,
                reporter: self.reporter,
                observer: self.observer,
                options: self.options,
                tasks: Mutex::new(ContextTasks::default()),
            }),
        }
    }
}

/// One execution context (main page, popout, games page) driving its own
/// engine against the shared store. Cloning yields another handle to the
/// same context. Operations that arm timers must run inside a Tokio runtime.
pub struct TimerContext<S>
where
    S: KeyValueStore + 'static,
{
    inner: Arc<ContextInner<S>>,
}

impl<S> Clone for TimerContext<S>
where
    S: KeyValueStore + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> TimerContext<S>
where
    S: KeyValueStore + 'static,
{
    pub fn builder(store: Arc<S>, surface: Surface) -> TimerContextBuilder<S> {
        TimerContextBuilder {
            store,
            surface,
            reporter: Arc::new(NoopWorkSessionReporter),
            observer: Arc::new(NoopObserver),
            options: ContextOptions::default(),
            now_provider: None,
        }
    }

    pub fn surface(&self) -> Surface {
        self.inner.lock_engine().surface()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_engine().state().clone()
    }

    pub fn settings(&self) -> Settings {
        self.inner.lock_engine().settings().clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot()
    }

    pub fn is_ticking(&self) -> bool {
        self.inner.lock_engine().active_ticker().is_some()
    }

    pub fn start(&self) -> StartOutcome {
        self.inner.cancel_auto_start();
        self.inner.start(false)
    }

    pub fn pause(&self) -> bool {
        self.inner.pause()
    }

    pub fn toggle_pause(&self) -> StartOutcome {
        if self.inner.lock_engine().state().is_counting() {
            self.pause();
            StartOutcome::NothingToRun
        } else {
            self.start()
        }
    }

    pub fn reset(&self) {
        self.inner.reset();
    }

    pub fn select_task(&self, task: Option<TaskRef>) {
        self.inner.select_task(task);
    }

    /// Removes the shared timer record. Other contexts observe the removal and
    /// reset; this one returns to the initial work segment without rewriting it.
    pub fn clear(&self) -> Result<(), InfraError> {
        self.inner.clear()
    }

    /// Merges the patch over the current settings, persists them and starts a
    /// fresh work segment.
    pub fn update_settings(&self, patch: &SettingsPatch) -> Result<Settings, InfraError> {
        self.inner.update_settings(patch)
    }

    pub fn reconcile(&self) -> ReconcileOutcome {
        self.inner.reconcile()
    }

    /// Polls the shared store once and reconciles when another context
    /// changed the session or when this one is idle.
    pub fn sync_once(&self) -> Option<ReconcileTrigger> {
        self.inner.sync_once()
    }

    pub fn spawn_watcher(&self) {
        self.inner.spawn_watcher();
    }

    pub fn visibility(&self) -> PopoutVisibility {
        self.inner.bridge.load_visibility()
    }

    pub fn should_show_popout(&self) -> bool {
        self.visibility().visible && self.inner.lock_engine().state().time_left_seconds > 0
    }

    pub fn show_popout(&self) -> Result<PopoutVisibility, InfraError> {
        self.inner.update_visibility(|visibility| visibility.visible = true)
    }

    pub fn hide_popout(&self) -> Result<PopoutVisibility, InfraError> {
        self.inner.update_visibility(|visibility| visibility.visible = false)
    }

    pub fn minimize_popout(&self) -> Result<PopoutVisibility, InfraError> {
        self.inner.update_visibility(|visibility| visibility.minimized = true)
    }

    pub fn maximize_popout(&self) -> Result<PopoutVisibility, InfraError> {
        self.inner.update_visibility(|visibility| visibility.minimized = false)
    }

    pub fn shutdown(&self) {
        self.inner.lock_tasks().abort_all();
    }
}

struct ContextInner<S>
where
    S: KeyValueStore + 'static,
{
    engine: Mutex<SessionEngine>,
    bridge: SyncBridge<S>,
    reporter: Arc<dyn WorkSessionReporter>,
    observer: Arc<dyn SessionObserver>,
    options: ContextOptions,
    tasks: Mutex<ContextTasks>,
}

impl<S> Drop for ContextInner<S>
where
    S: KeyValueStore + 'static,
{
    fn drop(&mut self) {
        self.tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

impl<S> ContextInner<S>
where
    S: KeyValueStore + 'static,
{
    fn lock_engine(&self) -> MutexGuard<'_, SessionEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, ContextTasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> SessionSnapshot {
        let engine = self.lock_engine();
        SessionSnapshot::from_state(engine.state(), engine.settings())
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.observer.on_state_changed(&snapshot);
    }

    fn persist(&self, engine: &mut SessionEngine) {
        match self.bridge.save_state(engine.state()) {
            Ok(timestamp) => engine.mark_saved(timestamp),
            Err(error) => warn!(%error, surface = engine.surface().as_str(), "failed to persist timer state"),
        }
    }

    fn start(self: &Arc<Self>, force: bool) -> StartOutcome {
        let outcome = {
            let mut engine = self.lock_engine();
            let outcome = engine.start(force);
            if matches!(outcome, StartOutcome::Armed(_)) {
                self.persist(&mut engine);
                debug!(
                    surface = engine.surface().as_str(),
                    mode = engine.state().mode.as_str(),
                    time_left = engine.state().time_left_seconds,
                    force,
                    "countdown started"
                );
            }
            outcome
        };
        if let StartOutcome::Armed(ticker) = outcome {
            self.spawn_ticker(ticker);
            self.publish();
        }
        outcome
    }

    fn pause(&self) -> bool {
        self.cancel_auto_start();
        let paused = {
            let mut engine = self.lock_engine();
            let paused = engine.pause();
            if paused {
                self.persist(&mut engine);
            }
            paused
        };
        if paused {
            self.cancel_ticker();
            self.publish();
        }
        paused
    }

    fn reset(&self) {
        self.cancel_auto_start();
        self.cancel_ticker();
        {
            let mut engine = self.lock_engine();
            engine.reset();
            self.persist(&mut engine);
            info!(surface = engine.surface().as_str(), "timer reset");
        }
        self.publish();
    }

    fn clear(&self) -> Result<(), InfraError> {
        self.bridge.clear_state()?;
        self.cancel_auto_start();
        self.cancel_ticker();
        {
            let mut engine = self.lock_engine();
            engine.reset();
            info!(surface = engine.surface().as_str(), "timer state cleared");
        }
        self.publish();
        Ok(())
    }

    fn select_task(&self, task: Option<TaskRef>) {
        {
            let mut engine = self.lock_engine();
            engine.select_task(task);
            self.persist(&mut engine);
        }
        self.publish();
    }

    /// Leaves the running segment untouched when the settings cannot be saved.
    fn update_settings(&self, patch: &SettingsPatch) -> Result<Settings, InfraError> {
        let settings = self.lock_engine().settings().apply_patch(patch).normalized();
        self.bridge.save_settings(&settings)?;

        self.cancel_auto_start();
        self.cancel_ticker();
        {
            let mut engine = self.lock_engine();
            engine.update_settings(settings.clone());
            self.persist(&mut engine);
        }
        info!(
            work = settings.work,
            short_break = settings.short_break,
            long_break = settings.long_break,
            cycles_before_long = settings.cycles_before_long,
            "settings updated"
        );
        self.publish();
        Ok(settings)
    }

    fn update_visibility<F>(&self, change: F) -> Result<PopoutVisibility, InfraError>
    where
        F: FnOnce(&mut PopoutVisibility),
    {
        let mut visibility = self.bridge.load_visibility();
        change(&mut visibility);
        self.bridge.save_visibility(visibility)?;
        self.observer.on_visibility_changed(visibility);
        Ok(visibility)
    }

    fn reconcile(self: &Arc<Self>) -> ReconcileOutcome {
        let settings = self.bridge.load_settings();
        let loaded = self.bridge.load_state(&settings);
        let (outcome, armed) = {
            let mut engine = self.lock_engine();
            engine.apply_settings(settings);
            match loaded {
                Some(state) => {
                    let restored = engine.restore(state);
                    let armed = match restored {
                        RestoreOutcome::NeedsTicker => engine.rearm(),
                        _ => None,
                    };
                    (ReconcileOutcome::Restored(restored), armed)
                }
                None => {
                    engine.reset();
                    self.persist(&mut engine);
                    (ReconcileOutcome::Reset, None)
                }
            }
        };

        match (outcome, armed) {
            (_, Some(ticker)) => self.spawn_ticker(ticker),
            (ReconcileOutcome::Restored(RestoreOutcome::KeepTicking), None) => {}
            _ => self.cancel_ticker(),
        }
        debug!(?outcome, "reconciled with shared state");
        self.publish();
        outcome
    }

    fn sync_once(self: &Arc<Self>) -> Option<ReconcileTrigger> {
        if self.absorb_foreign_changes() {
            return Some(ReconcileTrigger::StorageChanged);
        }
        if self.lock_engine().state().is_counting() {
            return None;
        }
        self.reconcile();
        Some(ReconcileTrigger::IdlePoll)
    }

    /// Reconciles when another context wrote the session since the last poll.
    fn absorb_foreign_changes(self: &Arc<Self>) -> bool {
        let signals = self.bridge.poll_changes();
        if signals.contains(&ChangeSignal::PopoutChrome) {
            self.observer
                .on_visibility_changed(self.bridge.load_visibility());
        }
        if signals.iter().any(|signal| signal.affects_session()) {
            self.reconcile();
            return true;
        }
        false
    }

    /// Spawns the task for `ticker` unless the engine has already armed a newer
    /// one. The tasks lock is held across the check so a newer ticker spawned
    /// concurrently is never replaced by an older one.
    fn spawn_ticker(self: &Arc<Self>, ticker: TickerId) {
        let mut tasks = self.lock_tasks();
        if self.lock_engine().active_ticker() != Some(ticker) {
            debug!(?ticker, "ticker superseded before its task started");
            return;
        }
        let context = Arc::downgrade(self);
        let period = self.options.tick_period;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(context) = Weak::upgrade(&context) else {
                    break;
                };
                if !context.handle_tick(ticker) {
                    break;
                }
            }
        });
        if let Some(previous) = tasks.ticker.replace(handle) {
            previous.abort();
        }
    }

    /// Returns false once this ticker should stop.
    fn handle_tick(self: &Arc<Self>, ticker: TickerId) -> bool {
        // A tick must not overwrite a foreign write this context has not seen.
        if self.absorb_foreign_changes() && self.lock_engine().active_ticker() != Some(ticker) {
            return false;
        }
        let (outcome, sound, auto_start) = {
            let mut engine = self.lock_engine();
            let outcome = engine.tick(ticker);
            if outcome == TickOutcome::Stale {
                return false;
            }
            self.persist(&mut engine);
            (outcome, engine.settings().sound, engine.auto_start_allowed())
        };
        self.publish();

        match outcome {
            TickOutcome::Counting { .. } => true,
            TickOutcome::Completed(transition) => {
                self.finish_segment(transition, sound, auto_start);
                false
            }
            TickOutcome::Stale => false,
        }
    }

    fn finish_segment(self: &Arc<Self>, transition: Transition, sound: SoundChoice, auto_start: bool) {
        info!(
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            cycle = transition.cycle,
            auto_start,
            "segment completed"
        );
        self.observer.on_segment_finished(sound);
        for event in transition.events {
            match event {
                SessionEvent::ModeChanged(mode) => self.observer.on_mode_changed(mode),
                SessionEvent::WorkSegmentCompleted { minutes } => self.dispatch_work_completed(minutes),
            }
        }
        if auto_start {
            self.schedule_auto_start();
        }
    }

    fn dispatch_work_completed(&self, minutes: u32) {
        let reporter = Arc::clone(&self.reporter);
        tokio::spawn(async move {
            match reporter.report_work_session(minutes).await {
                Ok(()) => debug!(minutes, "work session reported"),
                Err(error) => warn!(%error, minutes, "failed to report work session"),
            }
        });
    }

    fn schedule_auto_start(self: &Arc<Self>) {
        let context = Arc::downgrade(self);
        let delay = self.options.auto_start_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(context) = Weak::upgrade(&context) {
                context.lock_tasks().auto_start.take();
                context.start(true);
            }
        });
        if let Some(previous) = self.lock_tasks().auto_start.replace(handle) {
            previous.abort();
        }
    }

    fn cancel_auto_start(&self) {
        if let Some(handle) = self.lock_tasks().auto_start.take() {
            handle.abort();
        }
    }

    fn cancel_ticker(&self) {
        if let Some(handle) = self.lock_tasks().ticker.take() {
            handle.abort();
        }
    }

    fn spawn_watcher(self: &Arc<Self>) {
        let context = Arc::downgrade(self);
        let period = self.options.poll_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(context) = Weak::upgrade(&context) else {
                    break;
                };
                if let Some(trigger) = context.sync_once() {
                    debug!(?trigger, "reconcile triggered");
                }
            }
        });
        if let Some(previous) = self.lock_tasks().watcher.replace(handle) {
            previous.abort();
        }
    }
}
