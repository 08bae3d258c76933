pub mod build;
pub mod commands;
pub mod controller;
pub mod error;
pub mod events;
pub mod gateway;
pub mod index;
pub mod kubefiles;
pub mod matcher;
pub mod metrics;
pub mod settings;
pub mod telemetry;

#[cfg(test)]
mod test_util;
