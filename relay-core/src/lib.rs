pub mod config;
pub mod consumer;
pub mod error;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod provider;
pub mod provider_factory;
pub mod providers;
pub mod relay;
pub mod stream;
pub mod system_instruction;
pub mod telemetry;
pub mod wire;
#[cfg(test)]
pub mod test_util;
