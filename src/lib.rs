pub mod access_id;
pub mod blocking_queue;
pub mod cancel;
pub mod config;
pub mod events;
pub mod forwarder;
pub mod http_ingress;
pub mod httpflow;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod replay;
pub mod ring;
pub mod ssh_frontend;
