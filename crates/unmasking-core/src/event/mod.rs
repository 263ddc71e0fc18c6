//! Event model and the pub/sub bus that carries it.

pub mod bus;
pub mod events;

pub use bus::{BridgeScope, CancelFlag, EventBus, EventHandler, WorkerPublisher};
pub use events::{
    generate_group_id, topic, CurveEvent, Event, EventMeta, PairBuiltEvent, ProgressEvent,
    RunFinishedEvent, SenderKind,
};
