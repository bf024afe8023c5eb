//! Pipeline orchestrator: queues pipeline runs, supervises them as child
//! processes, and answers status and interrupt requests.

pub mod api;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod queue;
pub mod status;
pub mod store;
pub mod submit;
pub mod tasks;
pub mod worker;
