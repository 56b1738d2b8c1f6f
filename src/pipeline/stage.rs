//! Pipeline stage trait and thread coordinator
//!
//! Defines the interface for pipeline stages and provides a coordinator
//! that runs each stage on its own OS thread. Per-stage threads are a hard
//! real-time requirement: no stage may be stalled by another's scheduling.

use anyhow::Result;
use log::{error, info};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::queue::FrameQueue;

/// Trait for pipeline stages that process frames.
pub trait PipelineStage: Send {
    /// Run the stage, processing frames until its input queue is cancelled.
    fn run(&mut self) -> Result<()>;

    /// Get the name of this stage for logging and thread naming.
    fn name(&self) -> &'static str;
}

/// Runs stages on dedicated threads and manages shutdown.
///
/// Queues registered here are cancelled on [`PipelineCoordinator::stop`],
/// which wakes every blocked stage; stages then drain and exit on their own.
/// Shutdown order is not structurally head-to-tail, so each stage must
/// tolerate its upstream or downstream queue disappearing.
pub struct PipelineCoordinator {
    handles: Vec<JoinHandle<Result<()>>>,
    queues: Vec<Arc<FrameQueue>>,
}

impl PipelineCoordinator {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
            queues: Vec::new(),
        }
    }

    /// Register a queue to be cancelled at shutdown.
    pub fn register_queue(&mut self, queue: Arc<FrameQueue>) {
        self.queues.push(queue);
    }

    /// Spawn a stage on its own named thread.
    pub fn spawn(&mut self, mut stage: Box<dyn PipelineStage>) -> Result<()> {
        let name = stage.name();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                info!("{}: started", name);
                let result = stage.run();
                match &result {
                    Ok(()) => info!("{}: finished", name),
                    Err(e) => error!("{}: failed: {:#}", name, e),
                }
                result
            })?;
        self.handles.push(handle);
        Ok(())
    }

    /// Cancel every registered queue, waking all blocked stages.
    pub fn cancel(&self) {
        for queue in &self.queues {
            queue.cancel();
        }
    }

    /// Cancel and join all stages. Returns an error if any stage failed.
    pub fn stop(mut self) -> Result<()> {
        self.cancel();

        let mut failures = 0usize;
        for handle in self.handles.drain(..) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(_)) => failures += 1,
                Err(_) => {
                    error!("stage thread panicked");
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            anyhow::bail!("{} stage(s) exited with errors", failures);
        }
        Ok(())
    }
}

impl Default for PipelineCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::ClockRecord;
    use crate::pipeline::types::{AudioPlanes, Frame, RawPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStage {
        input: Arc<FrameQueue>,
        seen: Arc<AtomicUsize>,
    }

    impl PipelineStage for CountingStage {
        fn run(&mut self) -> Result<()> {
            while let Some(_frame) = self.input.dequeue_blocking() {
                self.seen.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[test]
    fn test_coordinator_runs_and_stops_stage() {
        let queue = Arc::new(FrameQueue::new("test", 16));
        let seen = Arc::new(AtomicUsize::new(0));

        let mut coordinator = PipelineCoordinator::new();
        coordinator.register_queue(Arc::clone(&queue));
        coordinator
            .spawn(Box::new(CountingStage {
                input: Arc::clone(&queue),
                seen: Arc::clone(&seen),
            }))
            .unwrap();

        for _ in 0..5 {
            queue.enqueue(Frame::raw(
                0,
                ClockRecord::default(),
                RawPayload::audio(AudioPlanes::zeroed(2, 8)),
            ));
        }

        // Let the stage drain before cancelling
        while seen.load(Ordering::Relaxed) < 5 {
            std::thread::yield_now();
        }

        coordinator.stop().unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 5);
    }

    struct FailingStage;

    impl PipelineStage for FailingStage {
        fn run(&mut self) -> Result<()> {
            anyhow::bail!("compressor configuration failed")
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn test_coordinator_reports_stage_failure() {
        let mut coordinator = PipelineCoordinator::new();
        coordinator.spawn(Box::new(FailingStage)).unwrap();
        assert!(coordinator.stop().is_err());
    }
}
