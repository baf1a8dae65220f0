mod event;
mod state;

pub use event::TouchEvent;
pub use state::{EmotionalState, StateDurations};
