/// Native Layer
/// Thin bindings to device hardware the manager drives directly.
/// Each capability sits behind a small trait and the implementation is
/// picked once at startup from what the device actually provides.
/// Main Components:
/// - Haptics: vibration patterns (sysfs timed output, or a no-op)
pub mod haptics;

pub use haptics::{HapticsError, HapticsResult, NullVibrator, SysfsVibrator, Vibrator, detect};
