mod backends;
mod config;
mod interceptor;
mod keybindings;
mod packet;
mod process;
mod resolver;
mod selector;
mod shaper;
mod status;
mod throttle_set;
mod throttler;
mod ui;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};
use std::io;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tokio::time::interval;

use crate::backends::divert::{detect_divert_backends, select_divert_backend};
use crate::backends::focus::{detect_foreground_providers, select_foreground_provider};
use crate::backends::process::socket_mapper::detect_socket_mappers;
use crate::backends::process::{ProcessUtils, create_process_utils_with_socket_mapper};
use crate::config::Config;
use crate::process::{TargetMode, format_rate, parse_rate};
use crate::selector::FocusSelector;
use crate::status::{ChannelStatusSink, LogStatusSink, Severity, StatusMessage, StatusSink};
use crate::throttler::{Throttler, ThrottlerSettings};
use crate::ui::{AppState, PanelView};

/// Rate bounds for the +/- keys
const MIN_RATE: u64 = 1024;
const MAX_RATE: u64 = 1024 * 1024 * 1024;

/// pidshaper - shape one process's upload bandwidth with a hotkey
#[derive(Parser, Debug)]
#[command(name = "pidshaper")]
#[command(version)]
#[command(about = "Per-process outbound packet shaper, toggled from a hotkey", long_about = None)]
struct Args {
    /// Shaping rate (e.g., "10K", "1.5M"; bytes if no unit)
    #[arg(long, value_name = "LIMIT")]
    rate: Option<String>,

    /// PID to use as the fixed target
    #[arg(long, value_name = "PID")]
    pid: Option<i32>,

    /// How the toggle picks its process: focus or fixed
    #[arg(long, value_name = "MODE")]
    mode: Option<TargetMode>,

    /// Toggle key (f1-f12 or a single character)
    #[arg(long, value_name = "KEY")]
    hotkey: Option<String>,

    /// Packet divert backend to use
    #[arg(long, value_name = "BACKEND")]
    divert_backend: Option<String>,

    /// Socket mapper backend to use
    #[arg(long, value_name = "BACKEND")]
    socket_mapper: Option<String>,

    /// List all available backends and exit
    #[arg(long)]
    list_backends: bool,

    /// List running processes as the picker shows them and exit
    #[arg(long)]
    list_processes: bool,

    /// Run without the panel: throttle --pid for this many seconds (or until Ctrl+C)
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,

    /// Don't save settings on exit
    #[arg(long)]
    no_save: bool,
}

fn print_backend_table(title: &str, rows: Vec<(&'static str, backends::BackendPriority, bool)>) {
    println!("{}:", title);
    if rows.is_empty() {
        println!("  (none compiled in)");
    }
    for (name, priority, available) in rows {
        let status = if available { "available" } else { "unavailable" };
        println!("  {:20} [priority: {:?}] {}", name, priority, status);
    }
    println!();
}

fn print_available_backends() {
    println!("pidshaper v{} - Available Backends\n", env!("CARGO_PKG_VERSION"));

    print_backend_table(
        "Divert Backends",
        detect_divert_backends()
            .into_iter()
            .map(|b| (b.name, b.priority, b.available))
            .collect(),
    );
    print_backend_table(
        "Socket Mappers",
        detect_socket_mappers()
            .into_iter()
            .map(|b| (b.name, b.priority, b.available))
            .collect(),
    );
    print_backend_table(
        "Foreground Window Providers",
        detect_foreground_providers()
            .into_iter()
            .map(|b| (b.name, b.priority, b.available))
            .collect(),
    );

    println!("Usage:");
    println!("  Panel mode:");
    println!("    pidshaper [--rate <LIMIT>] [--pid <PID>] [--mode focus|fixed] [--hotkey <KEY>]");
    println!();
    println!("  Headless mode:");
    println!("    pidshaper --pid <PID> --rate <LIMIT> --duration <SECONDS>");
    println!("    Examples:");
    println!("      pidshaper --pid 1234 --rate 50K --duration 60");
    println!("      pidshaper --divert-backend nfqueue --rate 1M");
}

/// Fold CLI overrides into the loaded config
fn apply_args(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(ref rate) = args.rate {
        config.set_rate_bytes_per_sec(parse_rate(rate)?);
    }
    if let Some(pid) = args.pid {
        config.fixed_target = Some(pid);
    }
    if let Some(mode) = args.mode {
        config.target_mode = mode;
    }
    if let Some(ref hotkey) = args.hotkey {
        config.hotkey = hotkey.clone();
    }
    if let Some(ref backend) = args.divert_backend {
        config.preferred_divert_backend = Some(backend.clone());
    }
    if let Some(ref mapper) = args.socket_mapper {
        config.preferred_socket_mapper = Some(mapper.clone());
    }
    Ok(())
}

fn build_throttler(
    config: &Config,
    process_utils: Arc<dyn ProcessUtils>,
    status: Arc<dyn StatusSink>,
) -> Result<Throttler> {
    let rate_bytes_per_sec = config.rate_bytes_per_sec()?;

    let backend = select_divert_backend(config.preferred_divert_backend.as_deref())
        .context("No packet divert backend available, see --list-backends")?;

    // A saved target from an earlier session may belong to another process by now
    let fixed_target = config
        .fixed_target
        .filter(|pid| process_utils.process_exists(*pid));
    if fixed_target.is_none() && config.fixed_target.is_some() {
        log::info!("Saved target PID is gone, starting without a target");
    }

    let focus = FocusSelector::new(select_foreground_provider());

    Ok(Throttler::new(
        backend,
        process_utils,
        focus,
        ThrottlerSettings {
            rate_bytes_per_sec,
            target_mode: config.target_mode,
            fixed_target,
            connection_cache: Duration::from_millis(config.connection_cache_ms),
        },
        status,
    ))
}

/// Run headless mode - throttle the fixed target and wait
async fn run_headless(args: &Args, config: &Config, process_utils: Arc<dyn ProcessUtils>) -> Result<()> {
    use tokio::signal;

    let pid = config
        .fixed_target
        .context("--duration requires --pid (or a saved fixed target)")?;
    let mut throttler = build_throttler(config, process_utils, Arc::new(LogStatusSink))?;

    println!("pidshaper v{} - Headless Mode", env!("CARGO_PKG_VERSION"));
    println!();
    println!(
        "Shaping process:  {} (PID {})",
        throttler.process_name(pid).unwrap_or_else(|| "?".to_string()),
        pid
    );
    println!("  Rate:           {}", format_rate(throttler.rate()));
    println!("  Divert backend: {}", throttler.divert_backend_name());
    println!("  Socket mapper:  {}", throttler.socket_mapper_name());
    println!();

    throttler.start()?;
    let outcome = throttler.toggle()?;
    log::debug!("Toggle result: {:?}", outcome);
    println!("Shaping PIDs: {:?}", throttler.throttled_pids());

    match args.duration {
        Some(seconds) if seconds > 0 => {
            println!("Running for {} seconds... (Press Ctrl+C to stop early)", seconds);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                    println!("\nDuration elapsed, stopping...");
                }
                _ = signal::ctrl_c() => {
                    println!("\nReceived Ctrl+C, stopping...");
                }
            }
        }
        _ => {
            println!("Press Ctrl+C to stop...");
            signal::ctrl_c().await?;
            println!("\nReceived Ctrl+C, stopping...");
        }
    }

    let stats = throttler.stats();
    throttler.stop();
    println!(
        "Stopped. {} packets seen, {} delayed, {} unattributed.",
        stats.dequeued, stats.delayed, stats.unresolved
    );

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    // Handle --list-backends
    if args.list_backends {
        print_available_backends();
        return Ok(());
    }

    let mut config = Config::load();
    apply_args(&mut config, &args)?;

    let process_utils: Arc<dyn ProcessUtils> = Arc::from(create_process_utils_with_socket_mapper(
        config.preferred_socket_mapper.as_deref(),
    )?);

    // Handle --list-processes
    if args.list_processes {
        for (label, _) in throttler::running_processes(process_utils.as_ref())? {
            println!("{}", label);
        }
        return Ok(());
    }

    // Handle headless mode (--duration specified)
    if args.duration.is_some() {
        return run_headless(&args, &config, process_utils).await;
    }

    let hotkey = keybindings::parse_hotkey(&config.hotkey())
        .with_context(|| format!("Invalid hotkey {:?}", config.hotkey))?;

    let (sink, status_rx) = ChannelStatusSink::new();
    let sink: Arc<dyn StatusSink> = Arc::new(sink);
    let mut throttler = build_throttler(&config, process_utils, sink.clone())?;

    // Setup terminal for panel mode
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = AppState::new(keybindings::hotkey_label(hotkey));

    // Run the app
    let res = run_app(
        &mut terminal,
        &mut app,
        &mut throttler,
        sink.as_ref(),
        &status_rx,
        hotkey,
    )
    .await;

    throttler.stop();

    // Save config before exit (unless --no-save specified)
    if !args.no_save {
        config.set_rate_bytes_per_sec(throttler.rate());
        config.fixed_target = throttler.fixed_target();
        config.target_mode = throttler.target_mode();
        if let Err(e) = config.save() {
            log::warn!("Failed to save config: {:#}", e);
        }
    }

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        log::error!("Error: {:?}", err);
    }

    Ok(())
}

fn panel_view(throttler: &Throttler) -> PanelView {
    let name_of = |pid: i32| {
        throttler
            .process_name(pid)
            .unwrap_or_else(|| "(exited)".to_string())
    };

    PanelView {
        running: throttler.is_running(),
        rate_bytes_per_sec: throttler.rate(),
        target_mode: throttler.target_mode(),
        fixed_target: throttler.fixed_target().map(|pid| (pid, name_of(pid))),
        throttled: throttler
            .throttled_pids()
            .into_iter()
            .map(|pid| (pid, name_of(pid)))
            .collect(),
        stats: throttler.stats(),
        divert_backend: throttler.divert_backend_name().to_string(),
        socket_mapper: throttler.socket_mapper_name().to_string(),
    }
}

async fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut AppState,
    throttler: &mut Throttler,
    status: &dyn StatusSink,
    status_rx: &Receiver<StatusMessage>,
    hotkey: KeyCode,
) -> Result<()> {
    let mut refresh_interval = interval(Duration::from_secs(1));
    let mut view = panel_view(throttler);

    status.notify(
        &format!(
            "Press 's' to start, then '{}' to toggle",
            keybindings::hotkey_label(hotkey)
        ),
        Severity::Info,
    );
    if throttler.target_mode() == TargetMode::Focus {
        let (text, severity) = ui::target_mode_notice(TargetMode::Focus);
        status.notify(&text, severity);
    }

    loop {
        while let Ok(message) = status_rx.try_recv() {
            app.push_status(message);
        }

        // Draw UI
        terminal.draw(|f| ui::draw_ui(f, app, &view))?;

        // Handle input with timeout
        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }

                // ALWAYS check Ctrl+C first - force quit regardless of modal state
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                    return Ok(());
                }

                // If help is shown, arrows scroll and any other key closes it
                if app.show_help {
                    match key.code {
                        KeyCode::Up => {
                            app.help_scroll_offset = app.help_scroll_offset.saturating_sub(1)
                        }
                        KeyCode::Down => app.help_scroll_offset += 1,
                        _ => app.show_help = false,
                    }
                    continue;
                }

                if key.code == hotkey {
                    if throttler.is_running() {
                        // Outcome and failures are reported through the status sink
                        let _ = throttler.toggle();
                    } else {
                        status.notify("Not running, press 's' first", Severity::Warning);
                    }
                    view = panel_view(throttler);
                    continue;
                }

                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => {
                        return Ok(());
                    }
                    KeyCode::Char('h') | KeyCode::Char('?') => {
                        app.show_help = true;
                    }
                    KeyCode::Char('s') => {
                        if throttler.is_running() {
                            throttler.stop();
                        } else if let Err(e) = throttler.start() {
                            log::warn!("Failed to start: {:#}", e);
                        }
                    }
                    KeyCode::Char('+') | KeyCode::Char('=') => {
                        let rate = throttler.rate().saturating_mul(2).min(MAX_RATE);
                        throttler.set_rate(rate);
                        status.notify(&format!("Rate: {}", format_rate(rate)), Severity::Info);
                    }
                    KeyCode::Char('-') => {
                        let rate = (throttler.rate() / 2).max(MIN_RATE);
                        throttler.set_rate(rate);
                        status.notify(&format!("Rate: {}", format_rate(rate)), Severity::Info);
                    }
                    KeyCode::Char('p') => match throttler.running_processes() {
                        Ok(processes) => {
                            let entries: Vec<(String, i32)> = processes.into_iter().collect();
                            let next = app.cycle_picker(entries, throttler.fixed_target());
                            throttler.set_fixed_target(next);
                            if let Some(label) = app.picker_index.map(|i| app.picker[i].0.clone()) {
                                status.notify(&format!("Target: {}", label), Severity::Info);
                            }
                        }
                        Err(e) => {
                            status.notify(
                                &format!("Cannot list processes: {:#}", e),
                                Severity::Error,
                            );
                        }
                    },
                    KeyCode::Char('m') => {
                        let mode = throttler.target_mode().toggled();
                        throttler.set_target_mode(mode);
                        let (text, severity) = ui::target_mode_notice(mode);
                        status.notify(&text, severity);
                    }
                    _ => {}
                }
                view = panel_view(throttler);
            }
        }

        // Refresh names and counters periodically
        if tokio::time::timeout(Duration::from_millis(1), refresh_interval.tick())
            .await
            .is_ok()
        {
            view = panel_view(throttler);
        }
    }
}
