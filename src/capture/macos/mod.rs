//! macOS capture implementations
//!
//! Display frames come from CoreGraphics; microphone and loopback audio come
//! from cpal input devices.

pub mod permissions;
pub mod screen;
pub mod source;

pub use permissions::*;
pub use screen::get_displays;
pub use source::MacCaptureSource;
