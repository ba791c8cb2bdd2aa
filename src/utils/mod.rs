/// Utility functions and helpers
use std::time::Duration;

/// Whether `pod` matches one of the ignore patterns.
///
/// A pattern ending in `*` matches any pod starting with the rest of the
/// pattern; anything else must match exactly.
pub fn is_pod_ignored(pod: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => pod.starts_with(prefix),
        None => pod == pattern,
    })
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
