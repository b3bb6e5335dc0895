mod client;
pub mod protocol;
pub mod reconcile;

pub use client::{RemoteConfig, RemoteError, RemoteSession};
pub use protocol::{PlayingStatus, PutStateRequest, PutStateResponse};
pub use reconcile::{LocalView, ReconcilePlan, Reconciler, DRIFT_TOLERANCE_MS};
