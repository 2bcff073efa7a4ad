use crate::application::bootstrap::bootstrap_workspace;
use crate::application::timer_context::{ContextOptions, SessionObserver, TimerContext};
use crate::domain::engine::StartOutcome;
use crate::domain::models::{
    PopoutVisibility, SessionSnapshot, Settings, SettingsPatch, Surface, TaskRef,
};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::kv_store::SqliteKeyValueStore;
use crate::infrastructure::work_session_client::{
    NoopWorkSessionReporter, ReqwestWorkSessionReporter, WorkSessionReporter,
};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info};

pub type Context = TimerContext<SqliteKeyValueStore>;

static NEXT_WRITER: AtomicU64 = AtomicU64::new(1);

/// Unique per process and per context, so a context can skip its own writes.
pub fn writer_id(surface: Surface) -> String {
    let sequence = NEXT_WRITER.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{}-{}-{sequence}",
        surface.as_str(),
        std::process::id(),
        Utc::now().timestamp_micros()
    )
}

pub struct AppState {
    workspace_root: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    config: AppConfig,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        Ok(Self {
            workspace_root: bootstrap.workspace_root,
            database_path: bootstrap.database_path,
            logs_dir: bootstrap.logs_dir,
            config: bootstrap.config,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn reporter(&self) -> Arc<dyn WorkSessionReporter> {
        match self.config.report_endpoint.as_deref() {
            Some(endpoint) => Arc::new(ReqwestWorkSessionReporter::new(endpoint)),
            None => Arc::new(NoopWorkSessionReporter),
        }
    }

    pub fn context(&self, surface: Surface, observer: Arc<dyn SessionObserver>) -> Context {
        let store = SqliteKeyValueStore::new(&self.database_path, writer_id(surface));
        TimerContext::builder(Arc::new(store), surface)
            .reporter(self.reporter())
            .observer(observer)
            .options(ContextOptions::from(&self.config))
            .build()
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        error!(command, %error, "command failed");
        error.to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub surface: Surface,
    pub snapshot: SessionSnapshot,
    pub settings: Settings,
    pub popout: PopoutVisibility,
    pub show_popout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopoutAction {
    Show,
    Hide,
    Minimize,
    Maximize,
}

impl PopoutAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Show => "show",
            Self::Hide => "hide",
            Self::Minimize => "minimize",
            Self::Maximize => "maximize",
        }
    }
}

fn to_status_response(context: &Context) -> StatusResponse {
    StatusResponse {
        surface: context.surface(),
        snapshot: context.snapshot(),
        settings: context.settings(),
        popout: context.visibility(),
        show_popout: context.should_show_popout(),
    }
}

pub fn status_impl(context: &Context) -> Result<StatusResponse, InfraError> {
    context.reconcile();
    Ok(to_status_response(context))
}

pub fn start_impl(context: &Context) -> Result<StatusResponse, InfraError> {
    context.reconcile();
    if context.start() == StartOutcome::NothingToRun {
        return Err(InfraError::InvalidState(
            "current segment has no time left".to_string(),
        ));
    }
    info!(surface = context.surface().as_str(), "start");
    Ok(to_status_response(context))
}

pub fn pause_impl(context: &Context) -> Result<StatusResponse, InfraError> {
    context.reconcile();
    let paused = context.pause();
    info!(surface = context.surface().as_str(), paused, "pause");
    Ok(to_status_response(context))
}

pub fn toggle_impl(context: &Context) -> Result<StatusResponse, InfraError> {
    context.reconcile();
    context.toggle_pause();
    Ok(to_status_response(context))
}

pub fn reset_impl(context: &Context) -> Result<StatusResponse, InfraError> {
    context.reconcile();
    context.reset();
    Ok(to_status_response(context))
}

/// Drops the shared record; every context starts over from a fresh work segment.
pub fn clear_impl(context: &Context) -> Result<StatusResponse, InfraError> {
    context.clear()?;
    info!(surface = context.surface().as_str(), "cleared shared timer state");
    Ok(to_status_response(context))
}

pub fn update_settings_impl(
    context: &Context,
    patch: SettingsPatch,
) -> Result<StatusResponse, InfraError> {
    if patch.is_empty() {
        return Err(InfraError::InvalidConfig(
            "at least one setting must be provided".to_string(),
        ));
    }
    context.reconcile();
    context
        .settings()
        .apply_patch(&patch)
        .validate()
        .map_err(InfraError::InvalidConfig)?;
    context.update_settings(&patch)?;
    Ok(to_status_response(context))
}

pub fn select_task_impl(
    context: &Context,
    task_id: String,
    task_name: Option<String>,
) -> Result<StatusResponse, InfraError> {
    let task = TaskRef::normalized(&task_id, task_name.as_deref().unwrap_or_default())
        .ok_or_else(|| InfraError::InvalidConfig("task_id must not be empty".to_string()))?;
    context.reconcile();
    info!(task_id = task.id.as_str(), "select task");
    context.select_task(Some(task));
    Ok(to_status_response(context))
}

pub fn clear_task_impl(context: &Context) -> Result<StatusResponse, InfraError> {
    context.reconcile();
    context.select_task(None);
    Ok(to_status_response(context))
}

pub fn popout_impl(context: &Context, action: PopoutAction) -> Result<StatusResponse, InfraError> {
    context.reconcile();
    match action {
        PopoutAction::Show => context.show_popout()?,
        PopoutAction::Hide => context.hide_popout()?,
        PopoutAction::Minimize => context.minimize_popout()?,
        PopoutAction::Maximize => context.maximize_popout()?,
    };
    info!(action = action.as_str(), "popout");
    Ok(to_status_response(context))
}
