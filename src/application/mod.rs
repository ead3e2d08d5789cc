//! Use-case orchestration: the event bus, the event pump, the charger
//! session manager, the arbitration engine and the backend registry.

pub mod arbitration;
pub mod charger;
pub mod events;
pub mod pump;
pub mod registry;

pub use arbitration::{ArbiterHandle, ControlPolicy, LockSnapshot};
pub use charger::{ChargerManager, SharedChargerManager};
pub use events::{create_event_bus, EventBus, EventSubscriber, SharedEventBus};
pub use registry::{BackendRegistry, SharedBackendRegistry};
