pub mod engine;
pub mod states;

pub use engine::{FlowDefinition, RunFlow, RunTransitionError};
pub use states::{RunAction, RunEvent, TransitionOutcome};
