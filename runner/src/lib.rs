//! Remote execution on batch scheduled testbed nodes: reservations, relayed
//! connections, group-wide commands and hardware topology discovery.

pub mod backoff;
pub mod collector;
pub mod config;
pub mod connection;
pub mod error;
pub mod group;
pub mod reservation;
pub mod scheduler;
pub mod session;
pub mod shell;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use collector::{InformationCollector, PlatformInformation};
pub use config::{ConfigErrors, RunnerConfig};
pub use connection::{Connection, ConnectionHandle, RunOptions};
pub use error::{Result, RunnerError};
pub use group::{ConnectionGroup, GroupOutput};
pub use reservation::{Nodes, Reservation, ReservationState};
pub use scheduler::{Access, JobId, Request, Start, Walltime};
pub use session::Session;
pub use topology::Core;
pub use transport::{Endpoint, RunOutput, SshTransport, Transport, TransportError};
