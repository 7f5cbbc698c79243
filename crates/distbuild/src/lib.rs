//! The distributed build layer.
//!
//! Four actors cooperate over persistent TCP connections carrying
//! line-delimited JSON frames: the *initiator* (the user's CLI) submits a
//! build request to the *controller*, which schedules build units onto
//! *workers*; each worker supervises build subprocesses through an *exec
//! helper* that owns one process group per request and can kill the whole
//! tree on cancellation.

mod claims;
mod controller;
mod error;
mod helper;
mod initiator;
mod protocol;
mod worker;

pub use claims::{ClaimOutcome, ClaimTable};
pub use controller::{Controller, ControllerConfig};
pub use error::{Error, Result};
pub use helper::ExecHelper;
pub use initiator::{DistbuildOutcome, render_event, run_distbuild};
pub use protocol::{Message, MessageReader, MessageWriter, Stream};
pub use worker::{WorkerConfig, WorkerDaemon};
