//! Upload transport: stream client seam, the upload protocol, and the
//! stream service implementations it runs against.

pub mod fake;
pub mod local;
pub mod stream;
pub mod upload;

pub use local::{LocalStreamConnector, LocalStreamManager};
pub use stream::{ScopedClient, StreamClient, StreamConnector, StreamError};
pub use upload::{UploadSettings, UploadState, UploadTransport};
