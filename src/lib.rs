//! Inference execution engine for quantized transformer graphs on CPU.
//!
//! A `model::Model` owns the tensor set of a static operator graph, wires
//! producer/consumer edges from the configuration's named-tensor table, and
//! drives Prepare/Reshape/Forward over the operators, optionally fanning
//! multi-stream operators out to a worker pool. Each operator selects its
//! compute kernel through `dispatch` (serving a persisted choice or tuning
//! among candidates) against the contract in `kernels`.

pub mod core;
pub mod dispatch;
pub mod kernels;
pub mod memory;
pub mod model;
pub mod operators;
