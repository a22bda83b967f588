use crate::common_scraper::ScrapeReport;
use crate::notify::DispatchReport;
use crate::reconcile::Reconciliation;
use crossterm::{
    cursor::MoveToPreviousLine,
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;

/// Per-source status lines and the run summary on stdout.
///
/// When `live` is off (debug mode) lines are only appended, never redrawn,
/// so they do not fight with log output.
pub struct RunTUI {
    live: bool,
    source_line_open: bool,
}

impl RunTUI {
    pub fn new(live: bool) -> Self {
        Self {
            live,
            source_line_open: false,
        }
    }

    /// Grey line with the size of the loaded snapshot.
    pub fn show_loaded(&mut self, total: usize, active: usize) -> io::Result<()> {
        execute!(
            io::stdout(),
            SetForegroundColor(Color::DarkGrey),
            Print(format!("📁 Loaded {} listings ({} active)\n", total, active)),
            ResetColor
        )
    }

    /// Prominent warning that the snapshot could not be read.
    pub fn show_degraded(&mut self, moved_to: &str) -> io::Result<()> {
        execute!(
            io::stdout(),
            SetForegroundColor(Color::Yellow),
            Print(format!(
                "⚠ Snapshot was unreadable and moved to {}; every listing will be treated as new\n",
                moved_to
            )),
            ResetColor
        )
    }

    pub fn start_source(&mut self, name: &str) -> io::Result<()> {
        execute!(
            io::stdout(),
            SetForegroundColor(Color::White),
            Print(format!("  🔄 {}...\n", name)),
            ResetColor
        )?;
        self.source_line_open = self.live;
        Ok(())
    }

    pub fn finish_source(&mut self, name: &str, report: &ScrapeReport) -> io::Result<()> {
        if self.source_line_open {
            execute!(io::stdout(), MoveToPreviousLine(1), Clear(ClearType::CurrentLine))?;
            self.source_line_open = false;
        }

        let (color, line) = if report.failed() {
            (Color::Red, format!("  ❌ {} - fetch failed, listings kept as they were\n", name))
        } else if report.rejected.is_empty() {
            (Color::Green, format!("  ✅ {} - {} listings\n", name, report.accepted))
        } else {
            (
                Color::Yellow,
                format!(
                    "  ✅ {} - {} listings, {} incomplete skipped\n",
                    name,
                    report.accepted,
                    report.rejected.len()
                ),
            )
        };

        execute!(io::stdout(), SetForegroundColor(color), Print(line), ResetColor)
    }

    pub fn show_skipped_source(&mut self, name: &str, reason: &str) -> io::Result<()> {
        execute!(
            io::stdout(),
            SetForegroundColor(Color::Yellow),
            Print(format!("  ⏭ {} - {}\n", name, reason)),
            ResetColor
        )
    }

    /// Progress bar for the notification fan-out; hidden when not live.
    pub fn dispatch_progress(&self) -> ProgressBar {
        if !self.live {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template("  📨 [{bar:30}] {pos}/{len} notifications") {
            bar.set_style(style.progress_chars("█░"));
        }
        bar
    }

    pub fn show_summary(
        &mut self,
        result: &Reconciliation,
        dispatch: Option<&DispatchReport>,
        saved: bool,
    ) -> io::Result<()> {
        execute!(
            io::stdout(),
            Print("─".repeat(60)),
            Print("\n"),
            SetForegroundColor(Color::Green),
            Print(format!("🆕 {} new", result.new.len())),
            ResetColor,
            Print("  "),
            SetForegroundColor(Color::Blue),
            Print(format!("🔄 {} reactivated", result.reactivated.len())),
            ResetColor,
            Print("  "),
            SetForegroundColor(Color::Red),
            Print(format!("❌ {} removed", result.removed.len())),
            ResetColor,
            SetForegroundColor(Color::DarkGrey),
            Print(format!(" | DB: {} total\n", result.all.len())),
            ResetColor
        )?;

        if let Some(dispatch) = dispatch {
            let color = if dispatch.failed.is_empty() { Color::DarkGrey } else { Color::Yellow };
            execute!(
                io::stdout(),
                SetForegroundColor(color),
                Print(format!(
                    "📨 {} sent, {} updated, {} failed\n",
                    dispatch.sent,
                    dispatch.updated,
                    dispatch.failed.len()
                )),
                ResetColor
            )?;
        }

        if !saved {
            execute!(
                io::stdout(),
                SetForegroundColor(Color::DarkGrey),
                Print("(dry run, nothing sent or saved)\n"),
                ResetColor
            )?;
        }
        Ok(())
    }
}
