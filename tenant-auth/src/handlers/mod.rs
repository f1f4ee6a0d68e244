//! HTTP handlers for tenant-auth.

pub mod health;
pub mod well_known;
