/// Periodic liveness/latency probing of registered service endpoints
mod prober;

/// Probe transport abstraction and the HTTP implementation
pub mod transport;

pub use prober::{HealthProber, ServiceEndpoint};
pub use transport::{HttpTransport, ProbeResponse, ProbeTransport};
