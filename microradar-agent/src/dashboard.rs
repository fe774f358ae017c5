//! Interactive terminal dashboard.
//!
//! Renders the current snapshot as a container table at the configured
//! refresh rate. Runs on a dedicated blocking thread and only ever reads
//! the snapshot store; it never touches aggregation state.
//!
//! Keys: q / Esc quit, Up / Down select, k kill the selected container,
//! c / m / n sort by cpu / memory / name (same key toggles direction),
//! r reverse the current sort.

use std::cmp::Ordering;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossterm::{
    event::{self, Event as TermEvent, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::warn;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use tokio::sync::watch;

use crate::config::AlertThresholds;
use crate::process::{KillOptions, ProcessManager};
use crate::snapshot::{ContainerMetrics, Snapshot, SnapshotStore};
use crate::VERSION;

/// Table ordering. The busiest containers surface first: CPU descending is
/// the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Cpu,
    Memory,
    Name,
}

impl SortKey {
    fn label(&self) -> &'static str {
        match self {
            SortKey::Cpu => "cpu",
            SortKey::Memory => "memory",
            SortKey::Name => "name",
        }
    }
}

pub struct Dashboard {
    store: Arc<SnapshotStore>,
    refresh: Duration,
    thresholds: AlertThresholds,
    process: ProcessManager,
    table_state: TableState,
    selected: usize,
    sort_by: SortKey,
    sort_desc: bool,
    message: String,
}

impl Dashboard {
    pub fn new(store: Arc<SnapshotStore>, refresh: Duration, thresholds: AlertThresholds) -> Self {
        Self {
            store,
            refresh,
            thresholds,
            process: ProcessManager::new(),
            table_state: TableState::default(),
            selected: 0,
            sort_by: SortKey::Cpu,
            sort_desc: true,
            message: String::new(),
        }
    }

    /// Blocking render loop; returns when the user quits or on shutdown.
    pub fn run(&mut self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.event_loop(&mut terminal, shutdown);

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let snapshot = self.store.current();
            // Selection and kill both address this display order.
            let ordered = snapshot
                .as_deref()
                .map(|s| self.sort_containers(s))
                .unwrap_or_default();
            if self.selected >= ordered.len() {
                self.selected = ordered.len().saturating_sub(1);
            }
            self.table_state.select(Some(self.selected));

            terminal.draw(|frame| self.draw(frame, snapshot.as_deref(), &ordered))?;

            if !event::poll(self.refresh)? {
                continue;
            }
            if let TermEvent::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    // Raw mode swallows SIGINT, so ctrl-c arrives as a key.
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        return Ok(())
                    }
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                    KeyCode::Up => self.selected = self.selected.saturating_sub(1),
                    KeyCode::Down => self.selected += 1,
                    KeyCode::Char('c') | KeyCode::Char('C') => self.set_sort(SortKey::Cpu),
                    KeyCode::Char('m') | KeyCode::Char('M') => self.set_sort(SortKey::Memory),
                    KeyCode::Char('n') | KeyCode::Char('N') => self.set_sort(SortKey::Name),
                    KeyCode::Char('r') | KeyCode::Char('R') => self.sort_desc = !self.sort_desc,
                    KeyCode::Char('k') => self.kill_selected(&ordered),
                    _ => {}
                }
            }
        }
    }

    /// Pressing the active column's key again flips the direction; a new
    /// column starts descending.
    fn set_sort(&mut self, key: SortKey) {
        if self.sort_by == key {
            self.sort_desc = !self.sort_desc;
        } else {
            self.sort_by = key;
            self.sort_desc = true;
        }
    }

    /// Snapshot containers in display order. The snapshot itself is ordered
    /// by cgroup id, which doubles as the tie-breaker here since the sort
    /// is stable.
    fn sort_containers(&self, snapshot: &Snapshot) -> Vec<ContainerMetrics> {
        let mut sorted = snapshot.containers.clone();
        sorted.sort_by(|a, b| self.compare(a, b));
        sorted
    }

    fn compare(&self, a: &ContainerMetrics, b: &ContainerMetrics) -> Ordering {
        let ascending = match self.sort_by {
            SortKey::Cpu => a
                .cpu_percent
                .partial_cmp(&b.cpu_percent)
                .unwrap_or(Ordering::Equal),
            SortKey::Memory => a
                .memory_percent
                .partial_cmp(&b.memory_percent)
                .unwrap_or(Ordering::Equal),
            SortKey::Name => a.name.cmp(&b.name),
        };
        if self.sort_desc {
            ascending.reverse()
        } else {
            ascending
        }
    }

    fn kill_selected(&mut self, ordered: &[ContainerMetrics]) {
        let container = match ordered.get(self.selected) {
            Some(container) => container.clone(),
            None => return,
        };
        match self
            .process
            .kill_container(&container, KillOptions::default())
        {
            Ok(()) => {
                self.message = format!("kill signal sent to {}", container.container_id);
            }
            Err(e) => {
                warn!("kill failed: {}", e);
                self.message = format!("kill failed: {}", e);
            }
        }
    }

    fn draw(&mut self, frame: &mut Frame, snapshot: Option<&Snapshot>, ordered: &[ContainerMetrics]) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(3),
                Constraint::Length(1),
            ])
            .split(frame.area());

        let header_text = match snapshot {
            Some(s) => format!(
                " microradar v{} | {} container(s) | {} KiB agent memory | gen {}",
                VERSION,
                s.containers.len(),
                s.system_memory_bytes / 1024,
                s.generation
            ),
            None => format!(" microradar v{} | waiting for first snapshot...", VERSION),
        };
        frame.render_widget(Paragraph::new(header_text), chunks[0]);

        let rows: Vec<Row> = ordered
            .iter()
            .map(|c| {
                let over_threshold = c.cpu_percent >= self.thresholds.cpu
                    || c.memory_percent >= self.thresholds.memory
                    || c.network_latency_ms >= self.thresholds.network_latency;
                let style = if over_threshold {
                    Style::default().fg(Color::Red)
                } else {
                    Style::default()
                };
                Row::new(vec![
                    c.container_id.clone(),
                    c.name.clone(),
                    format!("{:.1}", c.cpu_percent),
                    format!("{:.1}", c.memory_percent),
                    format!("{:.2}", c.network_latency_ms),
                    c.tcp_retransmits.to_string(),
                    c.status.to_string(),
                ])
                .style(style)
            })
            .collect();

        let widths = [
            Constraint::Length(14),
            Constraint::Length(18),
            Constraint::Length(7),
            Constraint::Length(7),
            Constraint::Length(9),
            Constraint::Length(7),
            Constraint::Length(9),
        ];
        let table = Table::new(rows, widths)
            .header(
                Row::new(vec!["ID", "NAME", "CPU%", "MEM%", "LAT ms", "RETX", "STATUS"])
                    .style(Style::default().add_modifier(Modifier::BOLD)),
            )
            .highlight_style(Style::default().bg(Color::DarkGray))
            .block(Block::default().borders(Borders::ALL).title("containers"));
        frame.render_stateful_widget(table, chunks[1], &mut self.table_state);

        let direction = if self.sort_desc { "\u{2193}" } else { "\u{2191}" };
        let footer = if self.message.is_empty() {
            format!(
                " sort: {} {} | q: quit | up/down: select | c/m/n: sort | r: reverse | k: kill",
                self.sort_by.label(),
                direction
            )
        } else {
            format!(" {}", self.message)
        };
        frame.render_widget(Paragraph::new(footer), chunks[2]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ContainerStatus;
    use chrono::Utc;

    fn dashboard() -> Dashboard {
        Dashboard::new(
            Arc::new(SnapshotStore::new()),
            Duration::from_millis(100),
            AlertThresholds::default(),
        )
    }

    fn container(cgroup_id: u64, name: &str, cpu: f64, memory: f64) -> ContainerMetrics {
        ContainerMetrics {
            cgroup_id,
            container_id: format!("{:x}", cgroup_id),
            name: name.to_string(),
            pid: 1,
            cpu_percent: cpu,
            memory_percent: memory,
            memory_bytes: 0,
            network_latency_ms: 0.0,
            tcp_retransmits: 0,
            status: ContainerStatus::Running,
            started_at: Utc::now(),
            reseeded: false,
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            generation: 1,
            containers: vec![
                container(1, "idle", 2.0, 60.0),
                container(2, "busy", 90.0, 10.0),
                container(3, "medium", 40.0, 30.0),
            ],
            system_memory_bytes: 0,
            kernel_maps: 0,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn default_order_is_cpu_descending() {
        let dashboard = dashboard();
        let ordered = dashboard.sort_containers(&snapshot());
        let names: Vec<&str> = ordered.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["busy", "medium", "idle"]);
    }

    #[test]
    fn memory_and_name_sorts_reorder_the_table() {
        let mut dashboard = dashboard();

        dashboard.set_sort(SortKey::Memory);
        let ordered = dashboard.sort_containers(&snapshot());
        assert_eq!(ordered[0].name, "idle");

        dashboard.set_sort(SortKey::Name);
        let ordered = dashboard.sort_containers(&snapshot());
        let names: Vec<&str> = ordered.iter().map(|c| c.name.as_str()).collect();
        // New column starts descending.
        assert_eq!(names, vec!["medium", "idle", "busy"]);
    }

    #[test]
    fn repeating_a_sort_key_flips_direction() {
        let mut dashboard = dashboard();
        assert!(dashboard.sort_desc);

        dashboard.set_sort(SortKey::Cpu);
        assert!(!dashboard.sort_desc);
        let ordered = dashboard.sort_containers(&snapshot());
        assert_eq!(ordered[0].name, "idle");

        // Switching columns resets to descending.
        dashboard.set_sort(SortKey::Memory);
        assert!(dashboard.sort_desc);
    }

    #[test]
    fn reverse_toggle_inverts_current_order() {
        let mut dashboard = dashboard();
        dashboard.sort_desc = false;
        let ordered = dashboard.sort_containers(&snapshot());
        assert_eq!(ordered[0].name, "idle");
        assert_eq!(ordered[2].name, "busy");
    }

    #[test]
    fn equal_keys_keep_cgroup_order() {
        let mut snapshot = snapshot();
        for c in &mut snapshot.containers {
            c.cpu_percent = 5.0;
        }
        let dashboard = dashboard();
        let ordered = dashboard.sort_containers(&snapshot);
        let ids: Vec<u64> = ordered.iter().map(|c| c.cgroup_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
