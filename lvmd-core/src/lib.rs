//! lvmd core library: handles, property schemas, jobs and the resource registry.
//!
//! - [`types`]: handles, identities, property values
//! - [`schema`]: per-category property schemas and resource state
//! - [`job`]: long-running operation tracking
//! - [`registry`]: the single source of truth mapping handles to objects
//! - [`error`]: [`RegistryError`]

pub mod error;
pub mod job;
pub mod registry;
pub mod schema;
pub mod types;

pub use error::RegistryError;
pub use job::{Job, JobError, JobStatus};
pub use registry::{EventSink, ManagedObject, NullSink, ObjectBody, ResourceRegistry};
pub use schema::{
    HandleResolver, LvKind, LvState, PropertyDef, PropertyType, PvState, ResourceState, VgState,
};
pub use types::{
    diff_properties, path_or_empty, Handle, HandleFactory, HandleKind, Identity, ObjectRef,
    OpValue, PropertyBag, PropertyValue, BASE_PATH, EMPTY_PATH,
};
