//! Frame pipeline and timing-reconciliation engine
//!
//! This module provides the core architecture for the broadcast encoding
//! pipeline, separating concerns between:
//! - Data model: frames with dual-clock timing metadata
//! - Transport: blocking frame queues with single-owner handoff
//! - Control: stage lifecycle, coordinated signal-loss recovery
//!
//! # Architecture
//!
//! The pipeline is a strictly ordered chain of stages per stream:
//! - Each stage runs on its own OS thread
//! - Stages implement the `PipelineStage` trait
//! - Frames move between threads only through a `FrameQueue`; dequeueing
//!   transfers exclusive ownership
//! - ClockRecord carries the dual audio/video clocks for A/V timing
//! - SignalHealthController coordinates resets when the source stalls

pub mod clock;
pub mod health;
pub mod queue;
pub mod stage;
pub mod state;
pub mod types;

pub use clock::{ClockRecord, InputClock};
pub use health::{FrameInjector, PipelineMetrics, SignalHealthController};
pub use queue::FrameQueue;
pub use stage::{PipelineCoordinator, PipelineStage};
pub use state::StageState;
pub use types::{Frame, FramePayload};
