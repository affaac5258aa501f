pub mod aggregator;
pub mod dashboard_client;
pub mod events;
pub mod hub;
pub mod isolation;
pub mod orchestrator;
pub mod router;
pub mod spawner;
pub mod state;
