//! Push channel bridge: one authenticated event stream per session whose
//! events run through the same cache pipeline as local mutations.

mod bridge;
mod connector;
mod events;

pub use bridge::{PushBridge, PushState};
pub use connector::{EventStream, PushConnector, SseConnector};
pub use events::{PushEvent, SseDecoder, SseFrame};
