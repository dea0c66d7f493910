//! Session lifecycle
//!
//! Tracks the connection state machine, routes transport signals, and gives
//! every public operation a scope that catches termination while it runs.

mod events;
mod lifecycle;
mod state;
mod transport;

pub use events::{ClientEvent, TransportEvent};
pub(crate) use lifecycle::EndStep;
pub use lifecycle::{Lifecycle, OperationScope};
pub use state::{SessionState, TerminationHandling};
pub use transport::{Connector, EventSink, Transport};
