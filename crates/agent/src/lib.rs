//! Scaling agent: HTTP surface and configuration for the vertical scaler

pub mod api;
pub mod config;
