//! Convenience macros for performance tracing

/// Create a [`crate::performance::PerformanceSpan`], optionally under a
/// debug span carrying the given fields.
///
/// ```rust
/// use hologram_tracing::perf_span;
///
/// {
///     let _span = perf_span!("copy_from_host", bytes = 4096);
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::performance::PerformanceSpan::from_span(
            $name,
            tracing::debug_span!("perf", name = $name, $($field = $value),+),
        )
    }};
}

/// Emit a debug event tagged with `event = $name`.
///
/// ```rust
/// use hologram_tracing::perf_event;
///
/// perf_event!("event_pool_reclaim", reclaimed = 4, retained = 12);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}

/// Run a block and return `(result, duration_us)`.
///
/// ```rust
/// use hologram_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        tracing::debug!(operation = $name, duration_us = duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}
