pub mod state;
pub mod tumbling;

pub use state::WindowState;
pub use tumbling::{Bucketing, RolloverCallback, RolloverStrategy, TumblingWindow, WindowConfig};
