pub mod config;
pub mod error;
pub mod cancel;
pub mod remote;
pub mod hooks;
pub mod session;
pub mod registry;

// Re-export commonly used types
pub use config::SessionConfig;
pub use error::SessionError;
pub use cancel::CancelToken;
pub use remote::{MemoryRemote, RemoteDataService, TransportError};
pub use hooks::{CreatedBy, MaxChanges, UploadHook};
pub use session::{EditSession, EditState};
pub use registry::{LayerId, LayerInfo, SessionRegistry};
