//! Task domain types: ids, job descriptions, records and parameters.

pub mod model;
pub mod params;
pub mod paths;

pub use model::{
    Details, JobSpec, ProgressRecord, StatusRecord, TaskId, TaskStatus, TaskStatusReport,
    TerminalStatus, TerminationMethod, details,
};
pub use params::{ParamMap, ParamValue};
pub use paths::{OutputLocation, PathAliases};
