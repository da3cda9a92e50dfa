pub mod id;
pub mod coord;
pub mod tags;
pub mod primitive;
pub mod refs;
pub mod conflict;
pub mod event;
pub mod dataset;
pub mod error;

// Re-export commonly used types
pub use id::{PrimitiveId, PrimitiveKind, Version};
pub use coord::{BBox, EastNorth, Equirectangular, LatLon, Projection};
pub use tags::{TagChange, Tags};
pub use primitive::{Geometry, Member, Primitive};
pub use refs::ReferenceIndex;
pub use conflict::{Conflict, ConflictCollection, ConflictKind};
pub use event::{DataSetEvent, DataSetListener, ListenerId, StructureChange};
pub use dataset::{DataSet, DataSetSnapshot, RemovalMode, UpdateGuard, UploadPolicy};
pub use error::DataSetError;
