// src/timeline.rs

//! Mapping between the shared timeline (seconds) and a rendered strip of
//! `width` pixels or bars. Every stem row, comment marker and the playhead
//! cursor use the same mapping, so it is recomputed from the current
//! duration on every call rather than cached.

/// Seconds under a click at `pixel_x` on a strip `width` wide.
/// `None` when the strip has no width or the track has no length yet.
pub fn hit_test(pixel_x: f64, width: f64, duration: f64) -> Option<f64> {
    if !(width > 0.0) || !(duration > 0.0) || !pixel_x.is_finite() {
        return None;
    }
    let x = pixel_x.clamp(0.0, width);
    Some((x / width) * duration)
}

/// Horizontal position of `t` on a strip `width` wide.
pub fn time_to_x(t: f64, duration: f64, width: f64) -> f64 {
    if !(duration > 0.0) || !t.is_finite() {
        return 0.0;
    }
    ((t / duration) * width).clamp(0.0, width)
}

/// Waveform bar `index` of `bars` is drawn as played once the playhead passes it.
pub fn bar_is_played(index: usize, bars: usize, duration: f64, current_time: f64) -> bool {
    if bars == 0 || !(duration > 0.0) {
        return false;
    }
    (index as f64 / bars as f64) * duration <= current_time
}

/// `m:ss`, minutes unbounded.
pub fn format_time(secs: f64) -> String {
    let total = if secs.is_finite() { secs.max(0.0) as u64 } else { 0 };
    format!("{}:{:02}", total / 60, total % 60)
}
