//! Domain types shared by the validator, engine and monitoring service.

pub mod alert;
pub mod context;
pub mod detection;
pub mod event;
pub mod pagination;
pub mod severity;
