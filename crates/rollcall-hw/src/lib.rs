//! rollcall-hw — Camera capture for attendance marking.
//!
//! Provides V4L2-based camera access and conversion of the negotiated
//! pixel format to RGB still frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
