//! cb-core: stable foundation for cellbench.
//!
//! Contains:
//! - units (uom SI types + constructors for the electrical domain)
//! - numeric (value guards + tolerance comparison)
//! - clock (injectable monotonic clock with a virtual test implementation)
//! - cancel (shared cancellation/emergency-stop token)
//! - error (value-rejection type wrapped by domain validators)

pub mod cancel;
pub mod clock;
pub mod error;
pub mod numeric;
pub mod units;

// Re-exports: nice ergonomics for downstream crates
pub use cancel::CancelToken;
pub use clock::{Clock, SystemClock, TestClock, sleep_cancellable};
pub use error::{CbError, CbResult};
pub use numeric::*;
pub use units::*;
