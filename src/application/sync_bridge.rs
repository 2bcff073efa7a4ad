use crate::domain::models::{Mode, PopoutVisibility, SessionState, Settings, TaskRef, NO_TASK_LABEL};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::kv_store::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SETTINGS_KEY: &str = "pomodoroSettings";
pub const TIMER_STATE_KEY: &str = "pomodoroTimerState";
pub const POPOUT_VISIBLE_KEY: &str = "popoutTimerVisible";
pub const POPOUT_MINIMIZED_KEY: &str = "popoutTimerMinimized";

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Which shared record another context changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSignal {
    Settings,
    TimerState,
    PopoutChrome,
}

impl ChangeSignal {
    fn from_key(key: &str) -> Option<Self> {
        match key {
            SETTINGS_KEY => Some(Self::Settings),
            TIMER_STATE_KEY => Some(Self::TimerState),
            POPOUT_VISIBLE_KEY | POPOUT_MINIMIZED_KEY => Some(Self::PopoutChrome),
            _ => None,
        }
    }

    /// Whether the change requires reloading the session.
    pub fn affects_session(self) -> bool {
        matches!(self, Self::Settings | Self::TimerState)
    }
}

/// Wire shape of the timer record. Every field is optional so that older or
/// partial records still load.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredTimerState {
    #[serde(default)]
    mode: Option<Mode>,
    #[serde(default)]
    cycle: Option<u32>,
    #[serde(default)]
    time_left: Option<u32>,
    #[serde(default)]
    total_time: Option<u32>,
    #[serde(default)]
    running: Option<bool>,
    #[serde(default)]
    paused: Option<bool>,
    #[serde(default)]
    selected_task_id: Option<serde_json::Value>,
    #[serde(default)]
    selected_task_name: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

impl StoredTimerState {
    fn from_state(state: &SessionState, timestamp: i64) -> Self {
        Self {
            mode: Some(state.mode),
            cycle: Some(state.cycle),
            time_left: Some(state.time_left_seconds),
            total_time: Some(state.total_seconds),
            running: Some(state.running),
            paused: Some(state.paused),
            selected_task_id: state
                .selected_task
                .as_ref()
                .map(|task| serde_json::Value::String(task.id.clone())),
            selected_task_name: Some(
                state
                    .selected_task
                    .as_ref()
                    .map(|task| task.name.clone())
                    .unwrap_or_else(|| NO_TASK_LABEL.to_string()),
            ),
            timestamp: Some(timestamp),
        }
    }

    fn into_state(self, settings: &Settings, now: DateTime<Utc>) -> SessionState {
        let mode = self.mode.unwrap_or(Mode::Work);
        let cycle = self.cycle.filter(|cycle| *cycle > 0).unwrap_or(1);
        let total_seconds = self
            .total_time
            .filter(|total| *total > 0)
            .unwrap_or_else(|| settings.duration_seconds(Mode::Work));
        let running = self.running.unwrap_or(false);
        let paused = self.paused.unwrap_or(false);
        let stored_time_left = self.time_left.unwrap_or(total_seconds);

        let time_left_seconds = match self.timestamp {
            Some(timestamp) if running && !paused => {
                let elapsed = elapsed_whole_seconds(timestamp, now);
                stored_time_left.saturating_sub(elapsed)
            }
            _ => stored_time_left,
        };

        let selected_task = self.selected_task_id.and_then(|value| {
            let id = match value {
                serde_json::Value::String(text) => text,
                serde_json::Value::Number(number) => number.to_string(),
                _ => return None,
            };
            TaskRef::normalized(&id, self.selected_task_name.as_deref().unwrap_or_default())
        });

        SessionState {
            mode,
            cycle,
            time_left_seconds: time_left_seconds.min(total_seconds),
            total_seconds,
            running,
            paused,
            selected_task,
            saved_at_epoch_millis: self.timestamp,
        }
    }
}

fn elapsed_whole_seconds(saved_at_epoch_millis: i64, now: DateTime<Utc>) -> u32 {
    let elapsed_millis = now.timestamp_millis().saturating_sub(saved_at_epoch_millis).max(0);
    u32::try_from(elapsed_millis / 1000).unwrap_or(u32::MAX)
}

/// Reads and writes the shared records for one context and tracks which
/// foreign writes it has already seen.
pub struct SyncBridge<S>
where
    S: KeyValueStore,
{
    store: Arc<S>,
    now_provider: NowProvider,
    seen_revision: AtomicU64,
}

impl<S> SyncBridge<S>
where
    S: KeyValueStore,
{
    pub fn new(store: Arc<S>) -> Self {
        let seen_revision = match store.latest_revision() {
            Ok(revision) => revision,
            Err(error) => {
                warn!(%error, "failed to read store revision; replaying all changes");
                0
            }
        };
        Self {
            store,
            now_provider: Arc::new(Utc::now),
            seen_revision: AtomicU64::new(seen_revision),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), InfraError> {
        let payload = serde_json::to_string(settings)?;
        self.store.set(SETTINGS_KEY, &payload)
    }

    /// Stored fields are merged over the defaults; anything unreadable falls
    /// back to the defaults.
    pub fn load_settings(&self) -> Settings {
        let raw = match self.store.get(SETTINGS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Settings::default(),
            Err(error) => {
                warn!(%error, "failed to read settings; using defaults");
                return Settings::default();
            }
        };
        match merge_settings(&raw) {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                warn!(%error, "malformed settings record; using defaults");
                Settings::default()
            }
        }
    }

    /// Persists the record with a fresh timestamp and returns that timestamp.
    pub fn save_state(&self, state: &SessionState) -> Result<i64, InfraError> {
        let timestamp = self.now().timestamp_millis();
        let payload = serde_json::to_string(&StoredTimerState::from_state(state, timestamp))?;
        self.store.set(TIMER_STATE_KEY, &payload)?;
        Ok(timestamp)
    }

    /// Reconstructs the shared record, correcting a counting timer for the
    /// time elapsed since it was written. Missing or malformed records are
    /// reported as `None`.
    pub fn load_state(&self, settings: &Settings) -> Option<SessionState> {
        let raw = match self.store.get(TIMER_STATE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                warn!(%error, "failed to read timer state");
                return None;
            }
        };
        match serde_json::from_str::<StoredTimerState>(&raw) {
            Ok(stored) => Some(stored.into_state(settings, self.now())),
            Err(error) => {
                warn!(%error, "malformed timer state record; treating as absent");
                None
            }
        }
    }

    pub fn clear_state(&self) -> Result<(), InfraError> {
        self.store.remove(TIMER_STATE_KEY)
    }

    pub fn save_visibility(&self, visibility: PopoutVisibility) -> Result<(), InfraError> {
        self.store.set(POPOUT_VISIBLE_KEY, bool_flag(visibility.visible))?;
        self.store.set(POPOUT_MINIMIZED_KEY, bool_flag(visibility.minimized))
    }

    /// Visible unless explicitly stored as `"false"`; minimized only when
    /// stored as `"true"`.
    pub fn load_visibility(&self) -> PopoutVisibility {
        let read = |key: &str| match self.store.get(key) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, key, "failed to read popout flag");
                None
            }
        };
        PopoutVisibility {
            visible: read(POPOUT_VISIBLE_KEY).as_deref() != Some("false"),
            minimized: read(POPOUT_MINIMIZED_KEY).as_deref() == Some("true"),
        }
    }

    /// Returns the distinct records other contexts changed since the last poll.
    pub fn poll_changes(&self) -> Vec<ChangeSignal> {
        let since = self.seen_revision.load(Ordering::Acquire);
        let changes = match self.store.changes_since(since) {
            Ok(changes) => changes,
            Err(error) => {
                warn!(%error, "failed to poll store changes");
                return Vec::new();
            }
        };

        let mut signals = Vec::new();
        let mut latest = since;
        for change in changes {
            latest = latest.max(change.revision);
            if change.writer == self.store.writer_id() {
                continue;
            }
            if let Some(signal) = ChangeSignal::from_key(&change.key) {
                if !signals.contains(&signal) {
                    signals.push(signal);
                }
            }
        }
        self.seen_revision.fetch_max(latest, Ordering::AcqRel);
        if !signals.is_empty() {
            debug!(?signals, revision = latest, "observed foreign store changes");
        }
        signals
    }
}

fn bool_flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn merge_settings(raw: &str) -> Result<Settings, serde_json::Error> {
    let stored: serde_json::Value = serde_json::from_str(raw)?;
    let mut merged = serde_json::to_value(Settings::default())?;
    if let (Some(target), Some(source)) = (merged.as_object_mut(), stored.as_object()) {
        for (key, value) in source {
            if target.contains_key(key) {
                target.insert(key.clone(), value.clone());
            }
        }
    }
    serde_json::from_value(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{SettingsPatch, SoundChoice};
    use crate::infrastructure::kv_store::InMemoryKeyValueStore;
    use chrono::Duration;
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn new(start: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(start),
            })
        }

        fn advance(&self, seconds: i64) {
            let mut now = self.now.lock().expect("clock mutex poisoned");
            *now += Duration::seconds(seconds);
        }

        fn provider(self: &Arc<Self>) -> NowProvider {
            let clock = Arc::clone(self);
            Arc::new(move || *clock.now.lock().expect("clock mutex poisoned"))
        }
    }

    fn bridge_with_clock(
        store: InMemoryKeyValueStore,
        clock: &Arc<ManualClock>,
    ) -> SyncBridge<InMemoryKeyValueStore> {
        SyncBridge::new(Arc::new(store)).with_now_provider(clock.provider())
    }

    fn counting_state(time_left_seconds: u32, paused: bool) -> SessionState {
        SessionState {
            mode: Mode::Work,
            cycle: 1,
            time_left_seconds,
            total_seconds: 1_500,
            running: true,
            paused,
            selected_task: None,
            saved_at_epoch_millis: None,
        }
    }

    // Property 3: a counting record loses the elapsed seconds, a paused one does not
    #[test]
    fn property3_elapsed_time_correction() {
        let clock = ManualClock::new(fixed_time("2026-02-16T09:00:00Z"));
        let bridge = bridge_with_clock(InMemoryKeyValueStore::default(), &clock);
        let settings = Settings::default();

        bridge.save_state(&counting_state(100, false)).expect("save");
        clock.advance(10);
        let loaded = bridge.load_state(&settings).expect("state present");
        assert_eq!(loaded.time_left_seconds, 90);
        assert!(loaded.running);

        bridge.save_state(&counting_state(100, true)).expect("save");
        clock.advance(10);
        let loaded = bridge.load_state(&settings).expect("state present");
        assert_eq!(loaded.time_left_seconds, 100);
        assert!(loaded.paused);
    }

    #[test]
    fn partial_seconds_are_floored() {
        let clock = ManualClock::new(fixed_time("2026-02-16T09:00:00Z"));
        let bridge = bridge_with_clock(InMemoryKeyValueStore::default(), &clock);
        bridge.save_state(&counting_state(100, false)).expect("save");
        {
            let mut now = clock.now.lock().expect("clock mutex poisoned");
            *now += Duration::milliseconds(2_999);
        }
        let loaded = bridge.load_state(&Settings::default()).expect("state present");
        assert_eq!(loaded.time_left_seconds, 98);
    }

    // Property 4: the correction never goes below zero
    proptest! {
        #[test]
        fn property4_time_left_clamps_at_zero(stored in 0u32..1_500u32, gap in 0i64..100_000i64) {
            let clock = ManualClock::new(fixed_time("2026-02-16T09:00:00Z"));
            let bridge = bridge_with_clock(InMemoryKeyValueStore::default(), &clock);
            bridge.save_state(&counting_state(stored, false)).expect("save");
            clock.advance(gap);
            let loaded = bridge.load_state(&Settings::default()).expect("state present");
            let expected = (stored as i64 - gap).max(0) as u32;
            prop_assert_eq!(loaded.time_left_seconds, expected);
        }
    }

    #[test]
    fn clock_skew_does_not_add_time() {
        let clock = ManualClock::new(fixed_time("2026-02-16T09:00:00Z"));
        let bridge = bridge_with_clock(InMemoryKeyValueStore::default(), &clock);
        bridge.save_state(&counting_state(100, false)).expect("save");
        clock.advance(-30);
        let loaded = bridge.load_state(&Settings::default()).expect("state present");
        assert_eq!(loaded.time_left_seconds, 100);
    }

    #[test]
    fn paused_without_running_is_loaded_verbatim() {
        let store = InMemoryKeyValueStore::default();
        store
            .set(
                TIMER_STATE_KEY,
                r#"{"mode":"shortBreak","cycle":2,"timeLeft":40,"totalTime":300,"running":false,"paused":true,"timestamp":0}"#,
            )
            .expect("seed");
        let bridge = SyncBridge::new(Arc::new(store));
        let loaded = bridge.load_state(&Settings::default()).expect("state present");
        assert_eq!(loaded.mode, Mode::ShortBreak);
        assert_eq!(loaded.time_left_seconds, 40);
        assert!(loaded.paused);
        assert!(!loaded.running);
    }

    #[test]
    fn malformed_or_missing_state_is_absent() {
        let store = InMemoryKeyValueStore::default();
        let bridge = SyncBridge::new(Arc::new(store.clone()));
        assert_eq!(bridge.load_state(&Settings::default()), None);

        store.set(TIMER_STATE_KEY, "{not json").expect("seed");
        assert_eq!(bridge.load_state(&Settings::default()), None);

        store.set(TIMER_STATE_KEY, r#"{"mode":"nap"}"#).expect("seed");
        assert_eq!(bridge.load_state(&Settings::default()), None);
    }

    #[test]
    fn sparse_record_falls_back_to_defaults() {
        let store = InMemoryKeyValueStore::default();
        store
            .set(TIMER_STATE_KEY, r#"{"cycle":0,"selectedTaskId":17,"selectedTaskName":"Essay"}"#)
            .expect("seed");
        let bridge = SyncBridge::new(Arc::new(store));
        let loaded = bridge.load_state(&Settings::default()).expect("state present");
        assert_eq!(loaded.mode, Mode::Work);
        assert_eq!(loaded.cycle, 1);
        assert_eq!(loaded.total_seconds, 25 * 60);
        assert_eq!(loaded.time_left_seconds, 25 * 60);
        assert!(!loaded.running);
        assert_eq!(
            loaded.selected_task,
            Some(TaskRef {
                id: "17".to_string(),
                name: "Essay".to_string()
            })
        );
    }

    #[test]
    fn saved_record_uses_browser_field_names() {
        let clock = ManualClock::new(fixed_time("2026-02-16T09:00:00Z"));
        let store = InMemoryKeyValueStore::default();
        let bridge = bridge_with_clock(store.clone(), &clock);
        let mut state = counting_state(100, false);
        state.selected_task = TaskRef::normalized("9", "Review");
        let timestamp = bridge.save_state(&state).expect("save");

        let raw = store.get(TIMER_STATE_KEY).expect("get").expect("record");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["mode"], "work");
        assert_eq!(value["timeLeft"], 100);
        assert_eq!(value["totalTime"], 1_500);
        assert_eq!(value["selectedTaskId"], "9");
        assert_eq!(value["selectedTaskName"], "Review");
        assert_eq!(value["timestamp"], timestamp);
        assert_eq!(timestamp, fixed_time("2026-02-16T09:00:00Z").timestamp_millis());
    }

    fn arb_patch() -> impl Strategy<Value = SettingsPatch> {
        (
            prop::option::of(1u32..120),
            prop::option::of(1u32..60),
            prop::option::of(1u32..90),
            prop::option::of(1u32..12),
            prop::option::of(prop_oneof![
                Just(SoundChoice::None),
                Just(SoundChoice::Bell),
                Just(SoundChoice::Chime),
                Just(SoundChoice::Beep),
            ]),
        )
            .prop_map(|(work, short_break, long_break, cycles_before_long, sound)| SettingsPatch {
                work,
                short_break,
                long_break,
                cycles_before_long,
                sound,
            })
    }

    // Property 6: partial settings load as the defaults overridden by what was stored
    proptest! {
        #[test]
        fn property6_partial_settings_merge_over_defaults(patch in arb_patch()) {
            let store = InMemoryKeyValueStore::default();
            store
                .set(SETTINGS_KEY, &serde_json::to_string(&patch).expect("serialize patch"))
                .expect("seed");
            let bridge = SyncBridge::new(Arc::new(store));
            prop_assert_eq!(bridge.load_settings(), Settings::default().apply_patch(&patch));
        }
    }

    #[test]
    fn settings_roundtrip_and_fallbacks() {
        let store = InMemoryKeyValueStore::default();
        let bridge = SyncBridge::new(Arc::new(store.clone()));
        assert_eq!(bridge.load_settings(), Settings::default());

        let custom = Settings {
            work: 50,
            short_break: 10,
            long_break: 30,
            cycles_before_long: 2,
            sound: SoundChoice::None,
        };
        bridge.save_settings(&custom).expect("save settings");
        assert_eq!(bridge.load_settings(), custom);

        store
            .set(SETTINGS_KEY, r#"{"work":0,"legacyTheme":"dark"}"#)
            .expect("seed");
        let loaded = bridge.load_settings();
        assert_eq!(loaded.work, 1);
        assert_eq!(loaded.short_break, 5);

        store.set(SETTINGS_KEY, r#"{"work":"soon"}"#).expect("seed");
        assert_eq!(bridge.load_settings(), Settings::default());
    }

    #[test]
    fn visibility_defaults_and_roundtrip() {
        let store = InMemoryKeyValueStore::default();
        let bridge = SyncBridge::new(Arc::new(store.clone()));
        assert_eq!(bridge.load_visibility(), PopoutVisibility::default());

        store.set(POPOUT_VISIBLE_KEY, "garbage").expect("seed");
        assert!(bridge.load_visibility().visible);

        bridge
            .save_visibility(PopoutVisibility {
                visible: false,
                minimized: true,
            })
            .expect("save visibility");
        let loaded = bridge.load_visibility();
        assert!(!loaded.visible);
        assert!(loaded.minimized);
    }

    #[test]
    fn poll_changes_skips_own_writes_and_reports_each_record_once() {
        let shared = InMemoryKeyValueStore::new("main");
        shared.set(SETTINGS_KEY, "{}").expect("pre-existing write");

        let main = SyncBridge::new(Arc::new(shared.clone()));
        let popout = SyncBridge::new(Arc::new(shared.handle("popout")));
        assert!(popout.poll_changes().is_empty());

        main.save_state(&counting_state(10, false)).expect("save");
        main.save_state(&counting_state(9, false)).expect("save");
        main.save_settings(&Settings::default()).expect("save");
        main.save_visibility(PopoutVisibility::default()).expect("save");

        assert_eq!(
            popout.poll_changes(),
            vec![ChangeSignal::TimerState, ChangeSignal::Settings, ChangeSignal::PopoutChrome]
        );
        assert!(popout.poll_changes().is_empty());
        assert!(main.poll_changes().is_empty());

        popout.clear_state().expect("clear");
        assert_eq!(main.poll_changes(), vec![ChangeSignal::TimerState]);
        assert_eq!(main.load_state(&Settings::default()), None);
    }
}
