//! Rate limiting logic and state management.

mod clock;
mod decision;
mod limiter;
pub mod policy;
mod registry;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, RejectionBody};
pub use limiter::{LimiterStats, RateLimiter, DEFAULT_SWEEP_INTERVAL};
pub use policy::{ClientRequest, KeyFn, KeyStrategy, PolicyConfig, RateLimitPolicy};
pub use registry::LimiterRegistry;
pub use window::WindowEntry;
