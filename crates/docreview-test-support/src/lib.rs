//! Shared test mocks and in-memory stores for the document review service.

mod clock;
mod projection;
mod projection_store;
mod repository;
mod rng;

pub use clock::{FixedClock, ManualClock};
pub use projection::{FlakyProjection, PanickingProjection, RecordingProjection, RecordingPublisher};
pub use projection_store::InMemoryProjectionStore;
pub use repository::{
    EmptyEventRepository, FailingEventRepository, InMemoryEventStore, RecordingEventRepository,
};
pub use rng::{MockRng, SequenceRng};
