pub mod configuration;
pub mod domain;
pub mod email_client;
pub mod expiry;
pub mod gatekeeper;
pub mod routes;
pub mod startup;
pub mod telemetry;
pub mod utils;
