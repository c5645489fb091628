use crate::interceptor::StatsSnapshot;
use crate::process::{TargetMode, format_rate};
use crate::status::{Severity, StatusMessage};
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
};
use std::collections::VecDeque;

const MAX_STATUS_LINES: usize = 8;

pub struct AppState {
    pub status_messages: VecDeque<StatusMessage>,
    pub show_help: bool,
    pub help_scroll_offset: usize,
    /// Picker entries ("name (PID: n)", pid), refreshed when cycling
    pub picker: Vec<(String, i32)>,
    pub picker_index: Option<usize>,
    pub hotkey_label: String,
}

/// Status line for a target mode switch made from the panel.
///
/// The panel reads its hotkey from its own terminal, so at the moment it fires
/// the focused window is the terminal itself.
pub fn target_mode_notice(mode: TargetMode) -> (String, Severity) {
    match mode {
        TargetMode::Fixed => ("Target mode: fixed".to_string(), Severity::Info),
        TargetMode::Focus => (
            "Target mode: focus (the panel hotkey only fires while this terminal is focused, so it targets the terminal)"
                .to_string(),
            Severity::Warning,
        ),
    }
}

/// Throttler state sampled once per frame
#[derive(Debug, Clone)]
pub struct PanelView {
    pub running: bool,
    pub rate_bytes_per_sec: u64,
    pub target_mode: TargetMode,
    pub fixed_target: Option<(i32, String)>,
    pub throttled: Vec<(i32, String)>,
    pub stats: StatsSnapshot,
    pub divert_backend: String,
    pub socket_mapper: String,
}

impl AppState {
    pub fn new(hotkey_label: String) -> Self {
        Self {
            status_messages: VecDeque::new(),
            show_help: false,
            help_scroll_offset: 0,
            picker: Vec::new(),
            picker_index: None,
            hotkey_label,
        }
    }

    pub fn push_status(&mut self, message: StatusMessage) {
        if self.status_messages.len() == MAX_STATUS_LINES {
            self.status_messages.pop_front();
        }
        self.status_messages.push_back(message);
    }

    /// Replace the picker list and step to the entry after `current`
    pub fn cycle_picker(&mut self, entries: Vec<(String, i32)>, current: Option<i32>) -> Option<i32> {
        self.picker = entries;
        if self.picker.is_empty() {
            self.picker_index = None;
            return None;
        }

        let next = match current.and_then(|pid| self.picker.iter().position(|(_, p)| *p == pid)) {
            Some(i) => (i + 1) % self.picker.len(),
            None => 0,
        };
        self.picker_index = Some(next);
        Some(self.picker[next].1)
    }

    pub fn clamp_scroll(scroll_offset: usize, content_lines: usize, visible_height: u16) -> usize {
        // Account for borders (top + bottom = 2) and padding
        let usable_height = visible_height.saturating_sub(3) as usize;
        let max_scroll = content_lines.saturating_sub(usable_height);
        scroll_offset.min(max_scroll)
    }
}

pub fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::Info => Color::Green,
        Severity::Throttled => Color::Yellow,
        Severity::Unthrottled => Color::Cyan,
        Severity::Warning => Color::Rgb(255, 165, 0),
        Severity::Error => Color::Red,
    }
}

pub fn draw_ui(f: &mut Frame, app: &mut AppState, view: &PanelView) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(8), // Shaping state
            Constraint::Min(5),    // Throttled processes + status log
            Constraint::Length(3), // Status bar
        ])
        .split(f.area());

    draw_header(f, chunks[0], view);
    draw_state(f, chunks[1], app, view);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(chunks[2]);
    draw_throttled(f, body[0], view);
    draw_status_log(f, body[1], app);

    draw_status_bar(f, chunks[3], app);

    if app.show_help {
        draw_help_overlay(f, f.area(), app);
    }
}

fn draw_header(f: &mut Frame, area: Rect, view: &PanelView) {
    let (state, color) = if view.running {
        ("RUNNING", Color::Green)
    } else {
        ("STOPPED", Color::Red)
    };
    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            "pidshaper - per-process upload shaper  ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::styled(state, Style::default().fg(color).add_modifier(Modifier::BOLD)),
    ]))
    .block(Block::default().borders(Borders::ALL));

    f.render_widget(header, area);
}

fn draw_state(f: &mut Frame, area: Rect, app: &AppState, view: &PanelView) {
    let label = Style::default().fg(Color::Gray);
    let target = match (&view.target_mode, &view.fixed_target) {
        (TargetMode::Focus, _) => "focused window".to_string(),
        (TargetMode::Fixed, Some((pid, name))) => format!("{} (PID: {})", name, pid),
        (TargetMode::Fixed, None) => "not set (press p)".to_string(),
    };

    let lines = vec![
        Line::from(vec![
            Span::styled("Rate:     ", label),
            Span::styled(
                format_rate(view.rate_bytes_per_sec),
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::styled("Mode:     ", label),
            Span::raw(view.target_mode.to_string()),
        ]),
        Line::from(vec![Span::styled("Target:   ", label), Span::raw(target)]),
        Line::from(vec![
            Span::styled("Hotkey:   ", label),
            Span::styled(app.hotkey_label.clone(), Style::default().fg(Color::Yellow)),
            Span::raw(if view.running { "" } else { " (active while running)" }),
        ]),
        Line::from(vec![
            Span::styled("Packets:  ", label),
            Span::raw(format!(
                "{} seen, {} forwarded, {} delayed, {} unattributed",
                view.stats.dequeued, view.stats.forwarded, view.stats.delayed, view.stats.unresolved
            )),
        ]),
        Line::from(vec![
            Span::styled("Backends: ", label),
            Span::raw(format!(
                "divert={}, sockets={}",
                view.divert_backend, view.socket_mapper
            )),
        ]),
    ];

    let panel = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Shaping"));
    f.render_widget(panel, area);
}

fn draw_throttled(f: &mut Frame, area: Rect, view: &PanelView) {
    let items: Vec<ListItem> = if view.throttled.is_empty() {
        vec![ListItem::new(Span::styled(
            "nothing throttled",
            Style::default().fg(Color::DarkGray),
        ))]
    } else {
        view.throttled
            .iter()
            .map(|(pid, name)| {
                ListItem::new(Line::from(vec![
                    Span::styled(format!("{:>7} ", pid), Style::default().fg(Color::Yellow)),
                    Span::raw(name.clone()),
                ]))
            })
            .collect()
    };

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("Throttled ({})", view.throttled.len())),
    );
    f.render_widget(list, area);
}

fn draw_status_log(f: &mut Frame, area: Rect, app: &AppState) {
    let lines: Vec<Line> = app
        .status_messages
        .iter()
        .rev()
        .map(|msg| {
            Line::from(vec![
                Span::styled(
                    format!("{} ", msg.at.format("%H:%M:%S")),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(msg.text.clone(), Style::default().fg(severity_color(msg.severity))),
            ])
        })
        .collect();

    let log = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(log, area);
}

fn draw_status_bar(f: &mut Frame, area: Rect, app: &AppState) {
    // Auto-generate status bar from centralized keybindings
    let mut spans = vec![
        Span::styled(
            format!("[{}]", app.hotkey_label),
            Style::default().fg(Color::Yellow),
        ),
        Span::raw(" Toggle  "),
    ];

    for (key, description) in crate::keybindings::get_status_bar_keybindings() {
        spans.push(Span::styled(
            format!("[{}]", key),
            Style::default().fg(Color::Yellow),
        ));
        spans.push(Span::raw(format!(" {}  ", description)));
    }

    let status = Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL));
    f.render_widget(status, area);
}

fn draw_help_overlay(f: &mut Frame, area: Rect, app: &mut AppState) {
    // Auto-generate help text from centralized keybindings
    let mut help_text = vec![
        Line::from(""),
        Line::from(Span::styled(
            "pidshaper - Keyboard Shortcuts",
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from(format!(
            "  {:12} - Throttle/unthrottle the current target",
            app.hotkey_label
        )),
    ];

    let mut category = None;
    for binding in crate::keybindings::get_all_keybindings() {
        if category != Some(binding.category) {
            help_text.push(Line::from(""));
            help_text.push(Line::from(Span::styled(
                binding.category.title(),
                Style::default().fg(Color::Cyan),
            )));
            category = Some(binding.category);
        }
        help_text.push(Line::from(format!(
            "  {:12} - {}",
            binding.key, binding.description
        )));
    }

    help_text.push(Line::from(""));
    help_text.push(Line::from("Use ↑↓ to scroll, any other key to close"));

    let help_area = centered_rect(60, 60, area);

    // Clamp scroll offset to content bounds
    let clamped_scroll =
        AppState::clamp_scroll(app.help_scroll_offset, help_text.len(), help_area.height);
    app.help_scroll_offset = clamped_scroll;

    let help = Paragraph::new(help_text)
        .style(Style::default().bg(Color::Black).fg(Color::White))
        .scroll((clamped_scroll as u16, 0))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Help")
                .style(Style::default().fg(Color::Cyan)),
        );

    f.render_widget(Clear, help_area);
    f.render_widget(help, help_area);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
