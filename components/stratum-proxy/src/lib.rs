pub mod client_handler;
pub mod config;
pub mod constants;
pub mod control_file;
pub mod errors;
pub mod extranonce;
pub mod getwork_listener;
pub mod job;
pub mod job_registry;
pub mod jsonrpc_event;
pub mod poolapi;
pub mod prom;
pub mod server;
pub mod share_stats;
pub mod stratum_context;
pub mod stratum_listener;
pub mod worker_registry;

pub use client_handler::ClientHandler;
pub use config::Args;
pub use errors::*;
pub use extranonce::{pad_extranonce2, ExtranoncePartitioner, Tail};
pub use getwork_listener::GetworkState;
pub use job::Job;
pub use job_registry::{GetworkJob, JobRegistry, RegistryFlags, SubmitDecision, SubmitParts};
pub use jsonrpc_event::{JsonRpcEvent, JsonRpcMessage, JsonRpcResponse, StratumMethod};
pub use poolapi::{PoolApi, PoolEndpoint, PoolEvents, PoolOptions, SubmitUpstream};
pub use server::EventBridge;
pub use share_stats::ShareStats;
pub use stratum_context::StratumContext;
pub use stratum_listener::StratumServer;
pub use worker_registry::WorkerRegistry;
