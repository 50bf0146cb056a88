pub mod classify;
mod engine;
mod history;
mod log;
mod registry;
mod suggestions;

pub use classify::classify_value;
pub use engine::{Classifier, Engine, EngineConfig};
pub use log::{Listener, SubscriberId};
