use crate::domain::models::{Mode, SessionState, Settings, Surface, TaskRef};

const MAX_TICK_PHASE_DRIFT: u32 = 1;

/// Generation id of an armed tick source. A tick carrying a stale id is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickerId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ModeChanged(Mode),
    WorkSegmentCompleted { minutes: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: Mode,
    pub to: Mode,
    pub cycle: u32,
    pub events: Vec<SessionEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Armed(TickerId),
    AlreadyActive,
    NothingToRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Stale,
    Counting { time_left_seconds: u32 },
    Completed(Transition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The restored record is counting and this context has no ticker yet.
    NeedsTicker,
    /// The restored record is counting and the existing ticker keeps running.
    KeepTicking,
    Stopped,
}

/// Owns one context's countdown. All mutation goes through its methods; the
/// caller drives time by arming a tick source on [`StartOutcome::Armed`] and
/// feeding [`SessionEngine::tick`] once per second.
#[derive(Debug, Clone)]
pub struct SessionEngine {
    settings: Settings,
    state: SessionState,
    surface: Surface,
    ticker: Option<TickerId>,
    next_ticker: u64,
}

impl SessionEngine {
    pub fn new(settings: Settings, surface: Surface) -> Self {
        let settings = settings.normalized();
        Self {
            state: SessionState::initial(&settings),
            settings,
            surface,
            ticker: None,
            next_ticker: 1,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }

    pub fn active_ticker(&self) -> Option<TickerId> {
        self.ticker
    }

    /// Arms a tick source unless one is already active. `force` replaces the
    /// active ticker and is reserved for the auto-chaining path.
    pub fn start(&mut self, force: bool) -> StartOutcome {
        if self.state.time_left_seconds == 0 {
            return StartOutcome::NothingToRun;
        }
        if !force && self.ticker.is_some() && self.state.is_counting() {
            return StartOutcome::AlreadyActive;
        }
        self.state.running = true;
        self.state.paused = false;
        StartOutcome::Armed(self.arm_ticker())
    }

    /// Returns true when the countdown was suspended.
    pub fn pause(&mut self) -> bool {
        if !self.state.running || self.state.paused {
            return false;
        }
        self.state.paused = true;
        self.ticker = None;
        true
    }

    pub fn resume(&mut self) -> StartOutcome {
        self.start(false)
    }

    pub fn toggle_pause(&mut self) -> StartOutcome {
        if self.state.is_counting() {
            self.pause();
            StartOutcome::NothingToRun
        } else {
            self.resume()
        }
    }

    pub fn reset(&mut self) {
        self.ticker = None;
        let selected_task = self.state.selected_task.take();
        self.state = SessionState::initial(&self.settings);
        self.state.selected_task = selected_task;
    }

    pub fn tick(&mut self, ticker: TickerId) -> TickOutcome {
        if self.ticker != Some(ticker) || !self.state.is_counting() {
            return TickOutcome::Stale;
        }
        self.state.time_left_seconds = self.state.time_left_seconds.saturating_sub(1);
        if self.state.time_left_seconds > 0 {
            return TickOutcome::Counting {
                time_left_seconds: self.state.time_left_seconds,
            };
        }
        TickOutcome::Completed(self.advance_session())
    }

    /// Applies the work/break transition table and stops the countdown. The
    /// returned events are side effects for the caller to dispatch.
    pub fn advance_session(&mut self) -> Transition {
        let from = self.state.mode;
        let mut events = Vec::with_capacity(2);
        let to = match from {
            Mode::Work => {
                events.push(SessionEvent::WorkSegmentCompleted {
                    minutes: self.settings.work,
                });
                if self.state.cycle < self.settings.cycles_before_long {
                    self.state.cycle += 1;
                    Mode::ShortBreak
                } else {
                    self.state.cycle = 1;
                    Mode::LongBreak
                }
            }
            Mode::ShortBreak | Mode::LongBreak => Mode::Work,
        };
        events.push(SessionEvent::ModeChanged(to));

        let total = self.settings.duration_seconds(to);
        self.state.mode = to;
        self.state.time_left_seconds = total;
        self.state.total_seconds = total;
        self.state.running = false;
        self.state.paused = false;
        self.ticker = None;

        Transition {
            from,
            to,
            cycle: self.state.cycle,
            events,
        }
    }

    /// Whether the next segment should start on its own after a transition.
    pub fn auto_start_allowed(&self) -> bool {
        !(self.surface == Surface::Games && self.state.mode.is_break())
    }

    pub fn select_task(&mut self, task: Option<TaskRef>) {
        self.state.selected_task = task;
    }

    /// Replaces settings without touching the running segment.
    pub fn apply_settings(&mut self, settings: Settings) {
        self.settings = settings.normalized();
    }

    /// Replaces settings and returns to a fresh work segment.
    pub fn update_settings(&mut self, settings: Settings) {
        self.apply_settings(settings);
        self.reset();
    }

    /// Adopts a reconstructed record from the shared store.
    pub fn restore(&mut self, mut state: SessionState) -> RestoreOutcome {
        state.cycle = state.cycle.clamp(1, self.settings.cycles_before_long);
        if state.total_seconds == 0 {
            state.total_seconds = self.settings.duration_seconds(state.mode);
        }
        state.time_left_seconds = state.time_left_seconds.min(state.total_seconds);
        if self.ticker.is_some() && self.same_segment(&state) {
            // Another context ticking out of phase; keep the local second.
            state.time_left_seconds = self.state.time_left_seconds;
        }
        self.state = state;

        if self.state.is_counting() {
            if self.ticker.is_some() {
                RestoreOutcome::KeepTicking
            } else {
                RestoreOutcome::NeedsTicker
            }
        } else {
            self.ticker = None;
            RestoreOutcome::Stopped
        }
    }

    /// Arms a ticker for a restored counting record. A record already at zero
    /// completes on the first tick.
    pub fn rearm(&mut self) -> Option<TickerId> {
        if !self.state.is_counting() || self.ticker.is_some() {
            return None;
        }
        Some(self.arm_ticker())
    }

    pub fn mark_saved(&mut self, saved_at_epoch_millis: i64) {
        self.state.saved_at_epoch_millis = Some(saved_at_epoch_millis);
    }

    fn same_segment(&self, other: &SessionState) -> bool {
        other.is_counting()
            && self.state.is_counting()
            && other.mode == self.state.mode
            && other.cycle == self.state.cycle
            && other.total_seconds == self.state.total_seconds
            && other.time_left_seconds.abs_diff(self.state.time_left_seconds) <= MAX_TICK_PHASE_DRIFT
    }

    fn arm_ticker(&mut self) -> TickerId {
        let ticker = TickerId(self.next_ticker);
        self.next_ticker += 1;
        self.ticker = Some(ticker);
        ticker
    }
}
