//! Platform bridges: the source and destination ports and the generic
//! bridge that mirrors items and reply threads between them.

pub mod destination;
pub mod source;
pub mod standard;

pub use destination::{DestinationClient, DestinationError, DestinationErrorCode};
pub use source::{SourceAdapter, SourceError, SourceErrorCode, SourceItem, SourceReply};
pub use standard::{BridgeSettings, StandardBridge};
