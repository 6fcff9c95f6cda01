//! Kernel protocol client: one WebSocket per kernel, correlated async
//! request/reply on top of the wire codec.

mod client;
mod result;

pub use client::{channels_url, ExecuteOptions, KernelClient, KernelError, KernelEvent};
pub use result::{ExecutionResult, ExecutionStatus, Timing, MAX_STREAM_BYTES};
