//! Request handling: the readiness gate, the result cache, the individual
//! request handlers and the dispatcher tying them together.

pub mod accessors;
pub mod bounds;
pub mod config_synth;
pub mod dispatcher;
pub mod protocol;
pub mod readiness;
pub mod result_cache;
pub mod search;

pub use dispatcher::{Worker, WorkerState};
pub use protocol::{Inbound, OutboundMessage, WorkerRequest, WorkerResponse};
