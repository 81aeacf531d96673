pub mod health;
pub mod window;

pub use health::{HealthMonitor, HealthPolicy, HealthSnapshot, HealthState};
pub use window::{RateWindow, WindowStats};
