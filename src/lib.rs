pub mod application;
pub mod domain;
pub mod infrastructure;

use application::commands::{
    AppState, PopoutAction, StatusResponse, clear_impl, clear_task_impl, pause_impl, popout_impl, reset_impl,
    select_task_impl, start_impl, status_impl, toggle_impl, update_settings_impl,
};
use application::timer_context::{NoopObserver, SessionObserver};
use clap::{Args, Parser, Subcommand, ValueEnum};
use domain::models::{Mode, PopoutVisibility, SessionSnapshot, SettingsPatch, SoundChoice, Surface};
use infrastructure::error::InfraError;
use infrastructure::logging::init_logging;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "pomosync",
    version,
    about = "Pomodoro timer kept in sync across main, popout and games contexts"
)]
pub struct Cli {
    /// Workspace holding config/, state/ and logs/. Defaults to the current directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = SurfaceArg::Main, global = true)]
    surface: SurfaceArg,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive a live context until Ctrl+C, printing every snapshot.
    Run,
    Status,
    Start,
    Pause,
    Toggle,
    Reset,
    /// Forget the shared timer record; every context starts a fresh work segment.
    Clear,
    /// Save settings; this restarts the timer at a fresh work segment.
    Settings(SettingsArgs),
    Task(TaskArgs),
    Popout {
        #[arg(value_enum)]
        action: PopoutArg,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Status => "status",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Toggle => "toggle",
            Self::Reset => "reset",
            Self::Clear => "clear",
            Self::Settings(_) => "settings",
            Self::Task(_) => "task",
            Self::Popout { .. } => "popout",
        }
    }
}

#[derive(Debug, Args)]
struct SettingsArgs {
    /// Work minutes.
    #[arg(long)]
    work: Option<u32>,
    #[arg(long)]
    short_break: Option<u32>,
    #[arg(long)]
    long_break: Option<u32>,
    /// Work segments before a long break.
    #[arg(long)]
    cycles: Option<u32>,
    #[arg(long, value_enum)]
    sound: Option<SoundArg>,
}

impl From<SettingsArgs> for SettingsPatch {
    fn from(args: SettingsArgs) -> Self {
        Self {
            work: args.work,
            short_break: args.short_break,
            long_break: args.long_break,
            cycles_before_long: args.cycles,
            sound: args.sound.map(SoundChoice::from),
        }
    }
}

#[derive(Debug, Args)]
struct TaskArgs {
    #[arg(long, required_unless_present = "clear", conflicts_with = "clear")]
    id: Option<String>,
    #[arg(long, requires = "id")]
    name: Option<String>,
    #[arg(long)]
    clear: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SurfaceArg {
    Main,
    Popout,
    Games,
}

impl From<SurfaceArg> for Surface {
    fn from(value: SurfaceArg) -> Self {
        match value {
            SurfaceArg::Main => Surface::Main,
            SurfaceArg::Popout => Surface::Popout,
            SurfaceArg::Games => Surface::Games,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SoundArg {
    None,
    Bell,
    Chime,
    Beep,
}

impl From<SoundArg> for SoundChoice {
    fn from(value: SoundArg) -> Self {
        match value {
            SoundArg::None => SoundChoice::None,
            SoundArg::Bell => SoundChoice::Bell,
            SoundArg::Chime => SoundChoice::Chime,
            SoundArg::Beep => SoundChoice::Beep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PopoutArg {
    Show,
    Hide,
    Minimize,
    Maximize,
}

impl From<PopoutArg> for PopoutAction {
    fn from(value: PopoutArg) -> Self {
        match value {
            PopoutArg::Show => PopoutAction::Show,
            PopoutArg::Hide => PopoutAction::Hide,
            PopoutArg::Minimize => PopoutAction::Minimize,
            PopoutArg::Maximize => PopoutAction::Maximize,
        }
    }
}

/// Prints snapshots as JSON lines for a live context.
struct PrintingObserver;

impl SessionObserver for PrintingObserver {
    fn on_state_changed(&self, snapshot: &SessionSnapshot) {
        if let Ok(line) = serde_json::to_string(snapshot) {
            println!("{line}");
        }
    }

    fn on_mode_changed(&self, mode: Mode) {
        info!(mode = mode.as_str(), color = mode.color(), "mode changed");
    }

    fn on_segment_finished(&self, sound: SoundChoice) {
        if let Some(asset) = sound.asset_path() {
            info!(asset, "segment finished");
        }
    }

    fn on_visibility_changed(&self, visibility: PopoutVisibility) {
        println!("{}", serde_json::json!({ "popout": visibility }));
    }
}

pub fn run() -> Result<(), InfraError> {
    execute(Cli::parse())
}

pub fn execute(cli: Cli) -> Result<(), InfraError> {
    let workspace_root = match cli.root {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let state = AppState::new(workspace_root)?;
    init_logging(state.logs_dir())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dispatch(&state, cli.surface.into(), cli.command))
}

async fn dispatch(state: &AppState, surface: Surface, command: Command) -> Result<(), InfraError> {
    let name = command.name();
    let result = match command {
        Command::Run => run_live(state, surface).await,
        command => run_once(state, surface, command),
    };
    result.inspect_err(|error| {
        state.command_error(name, error);
    })
}

fn run_once(state: &AppState, surface: Surface, command: Command) -> Result<(), InfraError> {
    let context = state.context(surface, Arc::new(NoopObserver));
    let result: Result<StatusResponse, InfraError> = match command {
        Command::Run | Command::Status => status_impl(&context),
        Command::Start => start_impl(&context),
        Command::Pause => pause_impl(&context),
        Command::Toggle => toggle_impl(&context),
        Command::Reset => reset_impl(&context),
        Command::Clear => clear_impl(&context),
        Command::Settings(args) => update_settings_impl(&context, args.into()),
        Command::Task(args) => match args.id {
            Some(id) if !args.clear => select_task_impl(&context, id, args.name),
            _ => clear_task_impl(&context),
        },
        Command::Popout { action } => popout_impl(&context, action.into()),
    };
    context.shutdown();

    let response = result?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_live(state: &AppState, surface: Surface) -> Result<(), InfraError> {
    let context = state.context(surface, Arc::new(PrintingObserver));
    context.reconcile();
    context.spawn_watcher();
    info!(
        surface = surface.as_str(),
        database = %state.database_path().display(),
        "live context started"
    );

    tokio::signal::ctrl_c().await?;
    context.shutdown();
    info!(surface = surface.as_str(), "live context stopped");
    Ok(())
}
