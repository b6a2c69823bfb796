pub mod cli;
pub mod config;
pub mod error;
pub mod flagging;
pub mod ledger;
pub mod observation;
pub mod pipeline;
pub mod scheduler;
pub mod scorer;
pub mod store;
pub mod telemetry;
pub mod windowing;
