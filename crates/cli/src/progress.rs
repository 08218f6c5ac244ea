//! Cargo-style status output for surfsync
//!
//! ```text
//!   Uploading 3 files (12 blocks, 47.21 KiB)
//! Downloading 1 file (2 blocks, 8 KiB)
//!    Conflict notes.md (kept the remote version)
//!      Synced 4 files in 82ms
//! ```

use std::io::Write as _;
use std::time::Instant;

use surfsync_core::SyncReport;

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const UPLOADED: &str = "Uploaded";
    const DOWNLOADED: &str = "Downloaded";
    const CONFLICT: &str = "Conflict";
    const SYNCED: &str = "Synced";
    const UP_TO_DATE: &str = "Up to date";
    const WATCHING: &str = "Watching";
    const FAILED: &str = "Failed";
}

/// Print a cargo-style status line
fn print_status(status: &str, style: &console::Style, message: &str) {
    let mut term = console::Term::stderr();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

fn green() -> console::Style {
    console::Style::new().green().bold()
}

fn yellow() -> console::Style {
    console::Style::new().yellow().bold()
}

fn files(n: usize) -> String {
    if n == 1 {
        "1 file".to_string()
    } else {
        format!("{n} files")
    }
}

fn transfer(blocks: u64, bytes: u64) -> String {
    let size = humansize::format_size(bytes, humansize::BINARY);
    format!("{blocks} blocks, {size}")
}

/// Timer for one sync pass
pub struct SyncProgress {
    start: Instant,
}

impl SyncProgress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Show the outcome of a pass
    pub fn finish(&self, report: &SyncReport) {
        let elapsed = self.start.elapsed();
        let elapsed_str = if elapsed.as_secs() >= 1 {
            format!("{:.2}s", elapsed.as_secs_f64())
        } else {
            format!("{}ms", elapsed.as_millis())
        };

        if report.is_empty() {
            print_status(Status::UP_TO_DATE, &green(), &format!("in {elapsed_str}"));
            return;
        }

        if !report.uploaded.is_empty() {
            print_status(
                Status::UPLOADED,
                &green(),
                &format!(
                    "{} ({})",
                    files(report.uploaded.len()),
                    transfer(report.blocks_uploaded, report.bytes_uploaded)
                ),
            );
        }
        if !report.downloaded.is_empty() {
            print_status(
                Status::DOWNLOADED,
                &green(),
                &format!(
                    "{} ({})",
                    files(report.downloaded.len()),
                    transfer(report.blocks_downloaded, report.bytes_downloaded)
                ),
            );
        }
        for name in &report.conflicts {
            print_status(
                Status::CONFLICT,
                &yellow(),
                &format!("{name} (kept the remote version)"),
            );
        }

        let touched = report.uploaded.len() + report.downloaded.len();
        print_status(
            Status::SYNCED,
            &green(),
            &format!("{} in {elapsed_str}", files(touched)),
        );
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Announce watch mode
pub fn watching(path: &std::path::Path) {
    print_status(
        Status::WATCHING,
        &green(),
        &format!("{} for changes (Ctrl+C to stop)", path.display()),
    );
}

/// Report a failed pass without exiting
pub fn failed(err: &color_eyre::Report) {
    let style = console::Style::new().red().bold();
    print_status(Status::FAILED, &style, &format!("{err:#}"));
}
