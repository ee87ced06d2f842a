use crate::logger::severity::LogSeverity;
use crate::logger::time::now;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;

// Seeded from STRATA_LOG on first use
static MIN_SEVERITY: Lazy<AtomicU8> = Lazy::new(|| {
    let severity = std::env::var("STRATA_LOG")
        .ok()
        .and_then(|value| LogSeverity::parse(&value))
        .unwrap_or(LogSeverity::Info);
    AtomicU8::new(severity as u8)
});

/// Overrides the minimum severity that gets printed
pub fn set_min_severity(severity: LogSeverity) {
    MIN_SEVERITY.store(severity as u8, Ordering::Relaxed);
}

pub fn enabled(severity: LogSeverity) -> bool {
    severity as u8 >= MIN_SEVERITY.load(Ordering::Relaxed)
}

/// Prints `msg` prefixed with its severity, the local time and the calling thread name.
pub fn log(msg: String, log_severity: LogSeverity) {
    if !enabled(log_severity) {
        return;
    }
    let current = thread::current();
    let thread_name = current.name().unwrap_or("unnamed");
    println!("[{}] {} [{}] {}", log_severity, now(), thread_name, msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_is_always_enabled() {
        assert!(enabled(LogSeverity::Fatal));
    }
}
