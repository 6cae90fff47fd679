mod clock;
mod connectivity;
mod error;
mod session;
mod store;
mod subscription;

pub use clock::MonotonicClock;
pub use connectivity::{Connectivity, ConnectivityTracker};
pub use error::{StoreError, StoreResult};
pub use session::{ChecklistSession, SessionView};
pub use store::ChecklistStore;
pub use subscription::{Snapshots, Subscription};
