//! Client core for operating a remote robot over a set of websocket channels: image streams with
//! render backpressure, a liveness watchdog, smoothed telemetry with optional recording, and
//! teleop commands.

pub mod command;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod image_stream;
pub mod live_status;
pub mod liveness;
pub mod mjpeg;
pub mod recorder;
pub mod session;
pub mod surface;
pub mod telemetry;
pub mod teleop;
pub mod terminal;
pub mod transport;

pub use error::{LinkError, LinkResult};
pub use events::{InputEvent, LinkEvent, SocketEvent};
pub use session::{SessionController, Surfaces};
