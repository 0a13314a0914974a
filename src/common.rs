use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use reqwest::header::HeaderValue;

pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
const LOG_TEXT_LIMIT: usize = 300;

/// Statuses worth another attempt: timeouts, throttling and server errors
/// other than the ones a retry cannot change.
pub fn is_transient_status(status: StatusCode) -> bool {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => true,
        StatusCode::NOT_IMPLEMENTED | StatusCode::HTTP_VERSION_NOT_SUPPORTED => false,
        other => other.is_server_error(),
    }
}

/// Delay requested by a `Retry-After` header, as delta-seconds or an
/// HTTP-date relative to `now`. Dates in the past mean no delay.
pub fn retry_after_delay(value: Option<&HeaderValue>, now: DateTime<Utc>) -> Option<Duration> {
    let raw = value?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or_default())
}

pub fn next_backoff(backoff: Duration) -> Duration {
    backoff.saturating_mul(2).min(MAX_BACKOFF)
}

/// Trims `text` and cuts it to a loggable length on a char boundary.
pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(LOG_TEXT_LIMIT) {
        None => trimmed.to_string(),
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
    }
}

/// Sets `shutdown` on the first Ctrl-C. Workers poll the flag between
/// entries, so in-flight documents stop at the next entry boundary.
pub fn stop_on_ctrl_c(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("cannot listen for Ctrl-C: {err}");
            return;
        }
        if !shutdown.swap(true, Ordering::SeqCst) {
            tracing::warn!("Ctrl-C received; unfinished documents stay in progress");
        }
    });
}

/// Unique per process and sortable by start time.
pub fn new_run_id() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    format!(
        "run-{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

pub fn format_count(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out.chars().rev().collect()
}

pub fn apply_download_progress_style(progress: &ProgressBar) {
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:32.cyan/blue}] \
{bytes}/{total_bytes} ({percent}%) {bytes_per_sec} eta {eta_precise} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }
}

pub fn apply_spinner_style(progress: &ProgressBar) {
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {prefix:.bold} [{elapsed_precise}] {bytes} read {bytes_per_sec} {msg}",
    ) {
        progress.set_style(style);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_get_thousands_separators() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1_000), "1,000");
        assert_eq!(format_count(12_345_678), "12,345,678");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(400);
        let out = truncate_for_log(&text);
        assert_eq!(out, format!("{}...", "é".repeat(300)));
        assert_eq!(truncate_for_log("  short  "), "short");
    }

    #[test]
    fn retry_after_seconds_and_dates() {
        let now = DateTime::parse_from_rfc3339("2015-10-21T07:27:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let secs = HeaderValue::from_static("12");
        assert_eq!(retry_after_delay(Some(&secs), now), Some(Duration::from_secs(12)));

        let date = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(retry_after_delay(Some(&date), now), Some(Duration::from_secs(30)));
        let past = HeaderValue::from_static("Wed, 21 Oct 2015 07:00:00 GMT");
        assert_eq!(retry_after_delay(Some(&past), now), Some(Duration::ZERO));

        let junk = HeaderValue::from_static("soon");
        assert_eq!(retry_after_delay(Some(&junk), now), None);
        assert_eq!(retry_after_delay(None, now), None);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(45)), MAX_BACKOFF);
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::INSUFFICIENT_STORAGE));
        assert!(!is_transient_status(StatusCode::NOT_IMPLEMENTED));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn run_ids_are_distinct() {
        let first = new_run_id();
        let second = new_run_id();
        assert!(first.starts_with("run-"));
        assert_ne!(first, second);
    }
}
