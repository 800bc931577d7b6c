//! Detection, monitoring and alerting services.

pub mod alerting;
pub mod anomaly;
pub mod clock;
pub mod dashboard;
pub mod enrichment;
pub mod monitoring;
pub mod patterns;
pub mod rotation;
pub mod validator;
