//! Window boundary.
//!
//! The crate never creates windows or runs an event loop. A device renders
//! into whatever implements [`WindowSource`], or into an offscreen back
//! buffer when there is none.

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A native window a device can present to.
///
/// Implement this for your windowing library's window type, e.g. a
/// `winit::window::Window` wrapper, and hand it to
/// [`DeviceDescriptor::with_window`](crate::DeviceDescriptor::with_window).
pub trait WindowSource: HasWindowHandle + HasDisplayHandle + Send + Sync {
    /// Drawable size in physical pixels.
    fn size(&self) -> (u32, u32);
}
