//! Action data model
//!
//! - `kind`: the closed enumeration of loggable machine actions
//! - `status`: the proof-status state machine
//! - `record`: persisted records and append requests

pub mod kind;
pub mod record;
pub mod status;

pub use kind::ActionKind;
pub use record::{validate_tag, ActionRecord, GeoPoint, Metadata, NewAction, Payload, GPS_KEY};
pub use status::ProofStatus;
