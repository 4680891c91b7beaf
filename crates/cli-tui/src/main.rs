use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use splitter::config::SplitterConfig;
use splitter::job::{load_all_jobs, Job, JobStatus};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;
use humansize::{format_size, DECIMAL};

struct App {
    jobs: Vec<Job>,
    table_state: TableState,
    should_quit: bool,
    job_state_dir: PathBuf,
}

impl App {
    fn new(job_state_dir: PathBuf) -> Self {
        Self {
            jobs: Vec::new(),
            table_state: TableState::default(),
            should_quit: false,
            job_state_dir,
        }
    }

    fn refresh(&mut self) {
        // unreadable directory shows as an empty table
        self.jobs = load_all_jobs(&self.job_state_dir).unwrap_or_default();
        self.jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    }

    fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    /// Most recently started job that is still running
    fn active_job(&self) -> Option<&Job> {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .max_by_key(|j| j.started_at)
    }
}

/// Split job monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read job records from this directory instead of the configured one
    #[arg(short, long)]
    jobs_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = SplitterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    let job_state_dir = args.jobs_dir.unwrap_or(cfg.job_state_dir);

    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(job_state_dir);

    loop {
        app.refresh();
        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(250))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => app.should_quit = true,
                    crossterm::event::KeyCode::Char('r') => app.refresh(),
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_job_table(f, app, chunks[1]);
    render_status_bar(f, app, chunks[2]);
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let (title, percent, label) = match app.active_job() {
        Some(job) => {
            let planned = job
                .planned_segments
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string());
            (
                format!("Active: {} ({})", short_id(&job.id), job.group_prefix),
                job.progress.min(100) as u16,
                format!("{}% - {}/{} segments", job.progress, job.uploaded.len(), planned),
            )
        }
        None => ("Active: none".to_string(), 0, "idle".to_string()),
    };

    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(percent)
        .label(label);
    f.render_widget(gauge, area);
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "QUEUE",
        JobStatus::Running => "RUN",
        JobStatus::Done => "DONE",
        JobStatus::Skipped => "SKIP",
        JobStatus::Error => "ERR",
    }
}

fn status_color(status: JobStatus) -> Color {
    match status {
        JobStatus::Queued => Color::Gray,
        JobStatus::Running => Color::Cyan,
        JobStatus::Done => Color::Green,
        JobStatus::Skipped => Color::Yellow,
        JobStatus::Error => Color::Red,
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn elapsed_label(job: &Job) -> String {
    match job.started_at {
        Some(started) => {
            let end = job.finished_at.unwrap_or_else(Utc::now);
            format!("{}s", (end - started).num_seconds().max(0))
        }
        None => "-".to_string(),
    }
}

/// Reason for skipped jobs, cause for failed ones
fn detail_label(job: &Job) -> &str {
    job.error
        .as_deref()
        .or(job.reason.as_deref())
        .unwrap_or("-")
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let max_data_rows = (area.height as usize).saturating_sub(3);

    let header = Row::new(vec!["ST", "ID", "GROUP", "PROG", "SEGS", "BYTES", "TIME", "DETAIL"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.jobs.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "No jobs".to_string(),
            format!("Dir: {}", app.job_state_dir.display()),
        ])]
    } else {
        app.jobs
            .iter()
            .take(max_data_rows)
            .map(|job| {
                let bytes: u64 = job.uploaded.iter().map(|u| u.size).sum();
                Row::new(vec![
                    status_label(job.status).to_string(),
                    short_id(&job.id).to_string(),
                    truncate_string(&job.group_prefix, 20),
                    format!("{}%", job.progress),
                    job.uploaded.len().to_string(),
                    format_size(bytes, DECIMAL),
                    elapsed_label(job),
                    truncate_string(detail_label(job), 60),
                ])
                .style(Style::default().fg(status_color(job.status)))
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Length(8),
        Constraint::Length(20),
        Constraint::Length(5),
        Constraint::Length(5),
        Constraint::Length(10),
        Constraint::Length(7),
        Constraint::Min(10),
    ];

    let title = format!("Jobs ({}/{})", app.jobs.len().min(max_data_rows), app.jobs.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let dir_display = app.job_state_dir.display().to_string();
    let status_text = format!(
        "Total: {} | Queued: {} | Running: {} | Done: {} | Skipped: {} | Error: {} | Dir: {} | q=quit r=refresh",
        app.jobs.len(),
        app.count_by_status(JobStatus::Queued),
        app.count_by_status(JobStatus::Running),
        app.count_by_status(JobStatus::Done),
        app.count_by_status(JobStatus::Skipped),
        app.count_by_status(JobStatus::Error),
        truncate_string(&dir_display, 35)
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });
    f.render_widget(paragraph, area);
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
