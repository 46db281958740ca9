//! Client side of the workerdeck control protocol.
//!
//! [`Dashboard`] is the pure state machine (service mirror, pending commands,
//! log buffers, backfill decisions). [`session::connect`] runs it against a hub
//! over a websocket and hands back a [`SessionHandle`].

pub mod dashboard;
pub mod dispatcher;
pub mod logs;
pub mod reconcile;
pub mod registry;
pub mod session;

pub use dashboard::{ConnectionState, Dashboard, DashboardEvent, DashboardView, Effect};
pub use dispatcher::{DispatchError, PendingOperation};
pub use logs::LogStreams;
pub use reconcile::LogSyncState;
pub use registry::ServiceMirror;
pub use session::{connect, SessionConfig, SessionError, SessionHandle};
