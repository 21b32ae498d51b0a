//! Connection registry and admission control.

mod registry;
mod stats;
mod types;

pub use registry::{Admission, ConnectionRegistry};
pub use stats::{HealthStats, ServiceCounters, TenantCounters, TenantCountersSnapshot};
pub use types::{
    AdmissionError, ConnectionEntry, ConnectionLimits, ConnectionState, DisconnectReason,
    StalePolicy,
};
