//! `mirrorline-core`: identifiers, platform pairs, the error taxonomy and the
//! `Bridge` port shared by the job pipeline and the platform adapters.
//!
//! This crate holds no infrastructure concerns (no storage, no runtime).

pub mod bridge;
pub mod error;
pub mod id;
pub mod job;
pub mod platform;

pub use bridge::{Bridge, BridgeRegistry, MirroredItem, RegistryError, RepliesReport};
pub use error::{ErrorClass, MirrorError, MirrorResult, ParseError};
pub use id::{DestinationId, JobId, Principal, SourceId};
pub use job::{JobStatus, JobType};
pub use platform::{Platform, PlatformPair};
