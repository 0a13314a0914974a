//! Operator-facing tables for run summaries and store status.

use std::fmt::Write as _;
use std::io::IsTerminal;

use crate::common::{format_count, truncate_for_log};
use crate::pipeline::{DocumentOutcome, RunSummary};
use crate::store::{LedgerEntry, LedgerStatus, PayerBreakdown, StoreStats};

const BORDER: &str = "+--------------------------------------------+--------------------------+";

/// ANSI escapes, empty when stdout is not a terminal.
#[derive(Debug, Clone, Copy)]
pub struct Palette {
    reset: &'static str,
    bold: &'static str,
    cyan: &'static str,
    green: &'static str,
    yellow: &'static str,
    red: &'static str,
    magenta: &'static str,
}

impl Palette {
    pub fn detect() -> Self {
        if std::io::stdout().is_terminal() {
            Self::ansi()
        } else {
            Self::plain()
        }
    }

    pub fn ansi() -> Self {
        Self {
            reset: "\x1b[0m",
            bold: "\x1b[1m",
            cyan: "\x1b[36m",
            green: "\x1b[32m",
            yellow: "\x1b[33m",
            red: "\x1b[31m",
            magenta: "\x1b[35m",
        }
    }

    pub fn plain() -> Self {
        Self {
            reset: "",
            bold: "",
            cyan: "",
            green: "",
            yellow: "",
            red: "",
            magenta: "",
        }
    }
}

struct Table<'p> {
    out: String,
    palette: &'p Palette,
}

impl<'p> Table<'p> {
    fn new(title: &str, palette: &'p Palette) -> Self {
        let mut table = Self {
            out: String::new(),
            palette,
        };
        let p = table.palette;
        let _ = writeln!(table.out, "{}{}{BORDER}{}", p.bold, p.cyan, p.reset);
        let _ = writeln!(
            table.out,
            "{}{}| {:<42} | {:<24} |{}",
            p.bold, p.cyan, title, "", p.reset
        );
        let _ = writeln!(table.out, "{}{}{BORDER}{}", p.bold, p.cyan, p.reset);
        table
    }

    fn row(&mut self, label: &str, value: impl AsRef<str>) {
        let _ = writeln!(self.out, "| {:<42} | {:<24} |", label, value.as_ref());
    }

    fn colored(&mut self, label: &str, color: &str, value: impl AsRef<str>) {
        let _ = writeln!(
            self.out,
            "| {:<42} | {}{:<24}{} |",
            label,
            color,
            value.as_ref(),
            self.palette.reset
        );
    }

    fn finish(mut self) -> String {
        let p = self.palette;
        let _ = writeln!(self.out, "{}{}{BORDER}{}", p.bold, p.cyan, p.reset);
        self.out
    }
}

fn rate_range(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("${lo:.2} - ${hi:.2}"),
        _ => "(none)".to_string(),
    }
}

pub fn render_run_summary(summary: &RunSummary, palette: &Palette) -> String {
    let mut table = Table::new("INGEST RUN SUMMARY", palette);
    table.row("Run id", &summary.run_id);
    table.row("Documents", format_count(summary.reports.len() as u64));
    table.colored("Completed", palette.green, format_count(summary.completed() as u64));
    table.colored("Rows inserted", palette.green, format_count(summary.rows_inserted()));
    table.colored(
        "Skipped (already complete / held)",
        palette.magenta,
        format_count(summary.skipped() as u64),
    );
    table.colored("Interrupted", palette.yellow, format_count(summary.interrupted() as u64));
    table.colored("Failed", palette.red, format_count(summary.failed() as u64));
    let mut out = table.finish();

    for report in &summary.reports {
        let line = match &report.outcome {
            DocumentOutcome::Complete { rows } => format!(
                "{}complete{}     {} rows in {:.1}s",
                palette.green,
                palette.reset,
                format_count(*rows),
                report.elapsed.as_secs_f64()
            ),
            DocumentOutcome::SkippedComplete => "skipped      already complete".to_string(),
            DocumentOutcome::SkippedHeld => "skipped      held by another worker".to_string(),
            DocumentOutcome::Interrupted => {
                format!("{}interrupted{}  left in progress", palette.yellow, palette.reset)
            }
            DocumentOutcome::Failed {
                reason, retryable, ..
            } => format!(
                "{}failed{}       {}{}",
                palette.red,
                palette.reset,
                truncate_for_log(reason),
                if *retryable { " (retryable)" } else { "" }
            ),
        };
        let _ = writeln!(out, "  [{}] {}", report.payer_name, report.url);
        let _ = writeln!(out, "      {line}");
    }
    out
}

pub fn render_status(
    stats: &StoreStats,
    payers: &[PayerBreakdown],
    ledger: &[LedgerEntry],
    palette: &Palette,
) -> String {
    let mut table = Table::new("RATE STORE STATUS", palette);
    table.colored("Rate rows", palette.green, format_count(stats.total_rates));
    table.row("Payers", format_count(stats.payers));
    table.row("Distinct billing codes", format_count(stats.billing_codes));
    table.row("Distinct NPIs", format_count(stats.npis));
    table.row("Providers in lookup table", format_count(stats.providers));
    table.row("Ledger pending", format_count(stats.ledger_pending));
    table.colored(
        "Ledger in progress",
        palette.yellow,
        format_count(stats.ledger_in_progress),
    );
    table.colored(
        "Ledger complete",
        palette.green,
        format_count(stats.ledger_complete),
    );
    table.colored("Ledger failed", palette.red, format_count(stats.ledger_failed));
    let mut out = table.finish();

    for payer in payers {
        let mut table = Table::new(&payer.payer_name, palette);
        table.row("Rows", format_count(payer.rows));
        table.row("Billing codes", format_count(payer.billing_codes));
        table.row("NPIs", format_count(payer.npis));
        table.row("Rate range", rate_range(payer.min_rate, payer.max_rate));
        table.row(
            "Last updated",
            payer.last_updated.as_deref().unwrap_or("(unknown)"),
        );
        out.push('\n');
        out.push_str(&table.finish());
    }

    let failed: Vec<&LedgerEntry> = ledger
        .iter()
        .filter(|e| e.status == LedgerStatus::Failed)
        .collect();
    if !failed.is_empty() {
        let _ = writeln!(out, "\nFailed documents:");
        for entry in failed {
            let _ = writeln!(
                out,
                "  [{}] {}\n      {}{}{}",
                entry.payer_name,
                entry.file_url,
                palette.red,
                entry.error_message.as_deref().unwrap_or("(no message)"),
                palette.reset
            );
        }
    }
    out
}
