use serde::{Deserialize, Serialize};
use std::fmt;

pub const NO_TASK_LABEL: &str = "No task selected";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    Work,
    ShortBreak,
    LongBreak,
}

impl Mode {
    pub fn is_break(self) -> bool {
        matches!(self, Self::ShortBreak | Self::LongBreak)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Work => "Work",
            Self::ShortBreak => "Short Break",
            Self::LongBreak => "Long Break",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            Self::Work => "#43e97b",
            Self::ShortBreak => "#4f8cff",
            Self::LongBreak => "#f7971e",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::ShortBreak => "shortBreak",
            Self::LongBreak => "longBreak",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The presentation surface a context renders into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Main,
    Popout,
    Games,
}

impl Surface {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Popout => "popout",
            Self::Games => "games",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SoundChoice {
    None,
    #[default]
    Bell,
    Chime,
    Beep,
}

impl SoundChoice {
    /// Audio asset played when a segment finishes, `None` when muted.
    pub fn asset_path(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Bell => Some("/static/audio/bell-notification-337658.mp3"),
            Self::Chime => Some("/static/audio/new-notification-03-323602.mp3"),
            Self::Beep => Some("/static/audio/notification-beep-229154.mp3"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub work: u32,
    pub short_break: u32,
    pub long_break: u32,
    pub cycles_before_long: u32,
    pub sound: SoundChoice,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            work: 25,
            short_break: 5,
            long_break: 15,
            cycles_before_long: 4,
            sound: SoundChoice::Bell,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        validate_positive(self.work, "settings.work")?;
        validate_positive(self.short_break, "settings.short_break")?;
        validate_positive(self.long_break, "settings.long_break")?;
        validate_positive(self.cycles_before_long, "settings.cycles_before_long")?;
        Ok(())
    }

    /// Clamps every duration and the cycle count to at least one.
    pub fn normalized(mut self) -> Self {
        self.work = self.work.max(1);
        self.short_break = self.short_break.max(1);
        self.long_break = self.long_break.max(1);
        self.cycles_before_long = self.cycles_before_long.max(1);
        self
    }

    pub fn duration_seconds(&self, mode: Mode) -> u32 {
        let minutes = match mode {
            Mode::Work => self.work,
            Mode::ShortBreak => self.short_break,
            Mode::LongBreak => self.long_break,
        };
        minutes.saturating_mul(60)
    }

    pub fn apply_patch(&self, patch: &SettingsPatch) -> Settings {
        Settings {
            work: patch.work.unwrap_or(self.work),
            short_break: patch.short_break.unwrap_or(self.short_break),
            long_break: patch.long_break.unwrap_or(self.long_break),
            cycles_before_long: patch.cycles_before_long.unwrap_or(self.cycles_before_long),
            sound: patch.sound.unwrap_or(self.sound),
        }
    }
}

/// A partial settings object; absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_break: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_break: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycles_before_long: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<SoundChoice>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Reference to a task owned by an external task list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRef {
    pub id: String,
    pub name: String,
}

impl TaskRef {
    /// Returns `None` when the id is blank.
    pub fn normalized(id: &str, name: &str) -> Option<Self> {
        let id = id.trim();
        if id.is_empty() {
            return None;
        }
        let name = name.trim();
        Some(Self {
            id: id.to_string(),
            name: if name.is_empty() {
                NO_TASK_LABEL.to_string()
            } else {
                name.to_string()
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionState {
    pub mode: Mode,
    pub cycle: u32,
    pub time_left_seconds: u32,
    pub total_seconds: u32,
    pub running: bool,
    pub paused: bool,
    pub selected_task: Option<TaskRef>,
    pub saved_at_epoch_millis: Option<i64>,
}

impl SessionState {
    pub fn initial(settings: &Settings) -> Self {
        let total = settings.duration_seconds(Mode::Work);
        Self {
            mode: Mode::Work,
            cycle: 1,
            time_left_seconds: total,
            total_seconds: total,
            running: false,
            paused: false,
            selected_task: None,
            saved_at_epoch_millis: None,
        }
    }

    /// True while a countdown should be decrementing.
    pub fn is_counting(&self) -> bool {
        self.running && !self.paused
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.time_left_seconds > self.total_seconds {
            return Err("session.time_left_seconds must be <= session.total_seconds".to_string());
        }
        validate_positive(self.cycle, "session.cycle")?;
        Ok(())
    }

    pub fn progress(&self) -> f64 {
        progress_fraction(self.time_left_seconds, self.total_seconds)
    }
}

/// Shown/hidden and minimized/maximized state of the popout surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PopoutVisibility {
    pub visible: bool,
    pub minimized: bool,
}

impl Default for PopoutVisibility {
    fn default() -> Self {
        Self {
            visible: true,
            minimized: false,
        }
    }
}

/// Render-ready view of a session, handed to presentation observers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSnapshot {
    pub time_text: String,
    pub mode: Mode,
    pub mode_label: String,
    pub cycle_text: String,
    pub progress: f64,
    pub color: String,
    pub running: bool,
    pub paused: bool,
    pub task_name: String,
    pub task_visible: bool,
    pub show_pause_control: bool,
    pub games_available: bool,
}

impl SessionSnapshot {
    pub fn from_state(state: &SessionState, settings: &Settings) -> Self {
        let cycle_text = match state.mode {
            Mode::Work => format!("Pomodoro {} of {}", state.cycle, settings.cycles_before_long),
            other => other.label().to_string(),
        };
        Self {
            time_text: format_clock(state.time_left_seconds),
            mode: state.mode,
            mode_label: state.mode.label().to_string(),
            cycle_text,
            progress: state.progress(),
            color: state.mode.color().to_string(),
            running: state.running,
            paused: state.paused,
            task_name: state
                .selected_task
                .as_ref()
                .map(|task| task.name.clone())
                .unwrap_or_else(|| NO_TASK_LABEL.to_string()),
            task_visible: state.selected_task.is_some(),
            show_pause_control: state.is_counting(),
            games_available: state.mode.is_break(),
        }
    }
}

pub fn format_clock(seconds: u32) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

pub fn progress_fraction(time_left_seconds: u32, total_seconds: u32) -> f64 {
    if total_seconds == 0 {
        return 0.0;
    }
    let left = time_left_seconds.min(total_seconds) as f64;
    1.0 - left / total_seconds as f64
}

fn validate_positive(value: u32, field_name: &str) -> Result<(), String> {
    if value == 0 {
        return Err(format!("{field_name} must be >= 1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_state() -> SessionState {
        SessionState {
            mode: Mode::ShortBreak,
            cycle: 2,
            time_left_seconds: 125,
            total_seconds: 300,
            running: true,
            paused: false,
            selected_task: TaskRef::normalized("42", "Write report"),
            saved_at_epoch_millis: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn format_clock_pads_minutes_and_seconds() {
        assert_eq!(format_clock(0), "00:00");
        assert_eq!(format_clock(65), "01:05");
        assert_eq!(format_clock(25 * 60), "25:00");
        assert_eq!(format_clock(100 * 60 + 9), "100:09");
    }

    // Property 8: progress is 0 at the start, 1 at the end, and 0 for an empty segment
    #[test]
    fn progress_fraction_bounds_and_zero_total_guard() {
        assert_eq!(progress_fraction(300, 300), 0.0);
        assert_eq!(progress_fraction(0, 300), 1.0);
        assert_eq!(progress_fraction(0, 0), 0.0);
        assert_eq!(progress_fraction(10, 0), 0.0);
        assert!((progress_fraction(150, 300) - 0.5).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn progress_fraction_stays_in_unit_interval(total in 0u32..100_000u32, left in 0u32..100_000u32) {
            let progress = progress_fraction(left, total);
            prop_assert!((0.0..=1.0).contains(&progress));
        }
    }

    #[test]
    fn settings_normalized_clamps_zero_values() {
        let settings = Settings {
            work: 0,
            short_break: 0,
            long_break: 3,
            cycles_before_long: 0,
            sound: SoundChoice::None,
        }
        .normalized();
        assert_eq!(settings.work, 1);
        assert_eq!(settings.short_break, 1);
        assert_eq!(settings.long_break, 3);
        assert_eq!(settings.cycles_before_long, 1);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn settings_validate_rejects_zero_cycles() {
        let settings = Settings {
            cycles_before_long: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn settings_patch_overrides_only_present_fields() {
        let patch = SettingsPatch {
            work: Some(50),
            sound: Some(SoundChoice::Chime),
            ..SettingsPatch::default()
        };
        let merged = Settings::default().apply_patch(&patch);
        assert_eq!(merged.work, 50);
        assert_eq!(merged.short_break, 5);
        assert_eq!(merged.long_break, 15);
        assert_eq!(merged.cycles_before_long, 4);
        assert_eq!(merged.sound, SoundChoice::Chime);
    }

    #[test]
    fn settings_serialize_with_browser_field_names() {
        let value = serde_json::to_value(Settings::default()).expect("serialize settings");
        assert_eq!(
            value,
            serde_json::json!({
                "work": 25,
                "shortBreak": 5,
                "longBreak": 15,
                "cyclesBeforeLong": 4,
                "sound": "bell"
            })
        );
    }

    #[test]
    fn task_ref_normalization() {
        assert_eq!(TaskRef::normalized("  ", "anything"), None);
        let task = TaskRef::normalized(" 7 ", "  ").expect("task");
        assert_eq!(task.id, "7");
        assert_eq!(task.name, NO_TASK_LABEL);
    }

    #[test]
    fn snapshot_for_break_offers_games_and_task_line() {
        let state = sample_state();
        let snapshot = SessionSnapshot::from_state(&state, &Settings::default());
        assert_eq!(snapshot.time_text, "02:05");
        assert_eq!(snapshot.mode_label, "Short Break");
        assert_eq!(snapshot.cycle_text, "Short Break");
        assert_eq!(snapshot.color, "#4f8cff");
        assert_eq!(snapshot.task_name, "Write report");
        assert!(snapshot.task_visible);
        assert!(snapshot.show_pause_control);
        assert!(snapshot.games_available);
    }

    #[test]
    fn snapshot_for_fresh_work_segment() {
        let state = SessionState::initial(&Settings::default());
        let snapshot = SessionSnapshot::from_state(&state, &Settings::default());
        assert_eq!(snapshot.time_text, "25:00");
        assert_eq!(snapshot.cycle_text, "Pomodoro 1 of 4");
        assert_eq!(snapshot.progress, 0.0);
        assert_eq!(snapshot.task_name, NO_TASK_LABEL);
        assert!(!snapshot.task_visible);
        assert!(!snapshot.show_pause_control);
        assert!(!snapshot.games_available);
    }

    #[test]
    fn paused_without_running_is_not_counting() {
        let mut state = sample_state();
        state.running = false;
        state.paused = true;
        assert!(!state.is_counting());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn sound_choice_asset_paths() {
        assert_eq!(SoundChoice::None.asset_path(), None);
        assert!(SoundChoice::Bell.asset_path().is_some_and(|path| path.contains("bell")));
        assert!(SoundChoice::Beep.asset_path().is_some_and(|path| path.contains("beep")));
    }

    #[test]
    fn session_state_serde_roundtrip() {
        let state = sample_state();
        let roundtrip: SessionState =
            serde_json::from_str(&serde_json::to_string(&state).expect("serialize state"))
                .expect("deserialize state");
        assert_eq!(roundtrip, state);
    }
}
