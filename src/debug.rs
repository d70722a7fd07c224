use crate::frame::{read_position, read_rotation, FrameLayout};
use crate::muscles::Quality;
use crate::protocol::ParticipantId;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize trace mode from the environment.
///
/// - `POSE_RELAY_TRACE=1`: emit a `trace` event for every applied and sent frame
pub fn init_debug_mode() {
    let trace = env::var("POSE_RELAY_TRACE").is_ok();
    set_trace_enabled(trace);

    if trace {
        tracing::info!("per-frame trace mode enabled");
    }
}

pub fn set_trace_enabled(enabled: bool) {
    TRACE_MODE.store(enabled, Ordering::Relaxed);
}

/// Check if trace mode is enabled
pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

/// Trace an inbound frame accepted by the apply phase
pub fn trace_apply(sender: ParticipantId, frame: &[u8]) {
    if !is_trace_enabled() {
        return;
    }

    trace!(
        sender,
        size = %format_bytes(frame.len()),
        frame = %frame_summary(frame, Quality::High),
        "applied pose"
    );
}

/// Trace one envelope handed to the transport
pub fn trace_send(receiver: ParticipantId, sender: ParticipantId, quality: Quality, interval_ms: u8, bytes: usize) {
    if !is_trace_enabled() {
        return;
    }

    trace!(receiver, sender, ?quality, interval_ms, bytes, "sent pose");
}

/// Format bytes in human-readable format (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// One-line description of a pose frame. Never fails; damaged parts are
/// reported inline.
pub fn frame_summary(frame: &[u8], quality: Quality) -> String {
    let expected = FrameLayout::of(quality).len();
    if frame.len() < expected {
        return format!("{:?} frame truncated ({} of {} bytes)", quality, frame.len(), expected);
    }

    let position = match read_position(frame) {
        Ok(p) => format!("({:.2}, {:.2}, {:.2})", p.x, p.y, p.z),
        Err(e) => format!("<{}>", e),
    };
    let rotation = match read_rotation(frame, quality, None) {
        Ok(q) => format!("({:.3}, {:.3}, {:.3}, {:.3})", q.x, q.y, q.z, q.w),
        Err(e) => format!("<{}>", e),
    };

    format!("{:?} frame, {} bytes, pos {}, rot {}", quality, expected, position, rotation)
}
