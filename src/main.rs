use clap::{Arg, Command};
use log::{error, info};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use std::{panic, process};

pub mod config;
pub mod encoders;
pub mod filters;
pub mod pipeline;

use crate::config::{Config, DiagnosticsConfig};
use crate::encoders::null::NullCompressor;
use crate::encoders::smoothing::{SmoothingBuffer, SmoothingStage};
use crate::encoders::video::{EncoderStage, GENERIC_LATENCY_OFFSET};
use crate::filters::audio::AudioFanoutFilter;
use crate::pipeline::clock::{ClockRecord, InputClock, frame_duration_ticks, wall_clock_micros};
use crate::pipeline::health::{ArrivalDomain, ArrivalVerdict, FrameInjector, SignalHealthController};
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::stage::PipelineCoordinator;
use crate::pipeline::types::{AudioPlanes, Frame, Plane, RawPayload, VideoPlanes};

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new("uplink")
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Pipeline configuration file (JSON).")
                .default_value("uplink.json"),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after this many seconds (0 = run until interrupted).")
                .default_value("0"),
        )
        .get_matches();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let config_path = matches.get_one::<String>("config").unwrap();
    let duration: u64 = matches
        .get_one::<String>("duration")
        .unwrap()
        .parse()
        .unwrap_or(0);

    let config = match Config::load(Path::new(config_path)) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(config, duration) {
        error!("pipeline failed: {:#}", e);
        process::exit(1);
    }
}

fn run(config: Config, duration_secs: u64) -> anyhow::Result<()> {
    let clock = InputClock::new();
    let health = Arc::new(SignalHealthController::new(
        Duration::from_millis(config.pipeline.stall_threshold_ms),
        config.pipeline.los_exit_ms.map(Duration::from_millis),
    ));
    let injector = config
        .pipeline
        .frame_injection
        .then(|| Arc::new(FrameInjector::new(config.pipeline.max_injected_frames)));
    let mux_queue = Arc::new(FrameQueue::new("mux", config.pipeline.queue_capacity));
    let diagnostics = DiagnosticsConfig::default();

    let mut coordinator = PipelineCoordinator::new();
    coordinator.register_queue(Arc::clone(&mux_queue));

    // Video: one encoder stage per output stream, smoothing in the generic
    // profile.
    let mut video_inputs = Vec::new();
    for stream in &config.video {
        let input = Arc::new(FrameQueue::new("encode-in", config.pipeline.queue_capacity));
        coordinator.register_queue(Arc::clone(&input));

        let smoothing = if config.pipeline.latency.uses_smoothing() {
            let frame_duration = frame_duration_ticks(stream.fps_num, stream.fps_den);
            let buffer = Arc::new(SmoothingBuffer::new(
                frame_duration,
                stream.buffer_frames,
                GENERIC_LATENCY_OFFSET,
                clock.clone(),
            ));
            coordinator.register_queue(buffer.queue());
            coordinator.spawn(Box::new(SmoothingStage::new(
                Arc::clone(&buffer),
                Arc::clone(&mux_queue),
            )))?;
            Some(buffer)
        } else {
            None
        };

        coordinator.spawn(Box::new(EncoderStage::new(
            stream,
            config.pipeline.latency,
            Arc::clone(&input),
            smoothing,
            Arc::clone(&mux_queue),
            Arc::clone(&health),
            Box::new(NullCompressor::default()),
            diagnostics.clone(),
        )))?;

        video_inputs.push((input, stream.fps_num, stream.fps_den));
    }

    // Audio: one fan-out filter feeding per-output queues. The audio
    // encoders themselves are external; stand-in drains consume their
    // queues here.
    let audio_ingress = Arc::new(FrameQueue::new("audio-ingress", config.pipeline.queue_capacity));
    coordinator.register_queue(Arc::clone(&audio_ingress));
    let mut audio_outputs = Vec::new();
    for output in &config.audio_outputs {
        let queue = Arc::new(FrameQueue::new("audio-out", config.pipeline.queue_capacity));
        coordinator.register_queue(Arc::clone(&queue));
        spawn_drain("audio-drain", Arc::clone(&queue));
        audio_outputs.push((output.clone(), queue));
    }
    coordinator.spawn(Box::new(AudioFanoutFilter::new(
        Arc::clone(&audio_ingress),
        &audio_outputs,
        diagnostics,
        Arc::new(crate::pipeline::health::PipelineMetrics::new()),
    )))?;

    // The muxer is external; a stand-in drain keeps the tail queue moving.
    spawn_drain("mux-drain", Arc::clone(&mux_queue));

    // Synthetic capture source standing in for the SDI backend.
    let running = Arc::new(AtomicBool::new(true));
    let generator = spawn_test_source(
        Arc::clone(&running),
        clock.clone(),
        Arc::clone(&health),
        injector.clone(),
        video_inputs,
        Arc::clone(&audio_ingress),
    )?;

    // Periodic metrics log
    {
        let health = Arc::clone(&health);
        let running = Arc::clone(&running);
        std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_secs(10));
                info!("pipeline: {}", health.metrics.summary());
            }
        });
    }

    // Run until ctrl-c or the configured duration elapses.
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    if duration_secs > 0 {
        let _ = stop_rx.recv_timeout(Duration::from_secs(duration_secs));
    } else {
        let _ = stop_rx.recv();
    }

    info!("shutting down");
    running.store(false, Ordering::Relaxed);
    let _ = generator.join();
    coordinator.stop()
}

/// Stand-in consumer for an external collaborator's queue.
fn spawn_drain(name: &'static str, queue: Arc<FrameQueue>) {
    std::thread::spawn(move || {
        let mut consumed = 0u64;
        while queue.dequeue_blocking().is_some() {
            consumed += 1;
        }
        info!("{}: consumed {} frames", name, consumed);
    });
}

/// Synthetic A/V source: gray pictures and silent 16-channel audio at the
/// first video stream's frame rate, stamped the way a capture backend
/// would stamp real frames.
fn spawn_test_source(
    running: Arc<AtomicBool>,
    clock: InputClock,
    health: Arc<SignalHealthController>,
    injector: Option<Arc<FrameInjector>>,
    video_inputs: Vec<(Arc<FrameQueue>, u32, u32)>,
    audio_ingress: Arc<FrameQueue>,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("test-source".into())
        .spawn(move || {
            let (fps_num, fps_den) = video_inputs
                .first()
                .map(|(_, n, d)| (*n, *d))
                .unwrap_or((25, 1));
            let frame_duration = frame_duration_ticks(fps_num, fps_den);
            let samples = (48_000u64 * fps_den as u64 / fps_num as u64) as usize;
            let mut stream_time = 0i64;

            while running.load(Ordering::Relaxed) {
                clock.tick(stream_time);
                let record = ClockRecord::at_ingress(stream_time, stream_time, frame_duration);

                match health.report_frame_arrival(ArrivalDomain::Video, wall_clock_micros()) {
                    ArrivalVerdict::FatalLoss { gap } => {
                        error!("no frame received for {:?}, terminating", gap);
                        process::exit(1);
                    }
                    ArrivalVerdict::Stalled { .. } => {}
                    ArrivalVerdict::Ok => {
                        if let Some(injector) = &injector {
                            injector.on_signal_restored();
                        }
                    }
                }
                health.report_frame_arrival(ArrivalDomain::Audio, wall_clock_micros());

                let video = Frame::raw(
                    0,
                    record,
                    RawPayload::video(VideoPlanes {
                        width: 64,
                        height: 36,
                        sar: (1, 1),
                        planes: vec![Plane { stride: 64, data: vec![0x80; 64 * 36] }],
                    }),
                );
                if let Some(injector) = &injector {
                    injector.cache(&video);
                }
                for (queue, _, _) in &video_inputs {
                    queue.enqueue(video.clone());
                }

                let mut audio = AudioPlanes::zeroed(16, samples);
                audio.source_pair = 1;
                audio_ingress.enqueue(Frame::raw(0, record, RawPayload::audio(audio)));

                stream_time += frame_duration;
                std::thread::sleep(Duration::from_micros(
                    (frame_duration as u64) * 1_000_000 / 27_000_000,
                ));
            }
        })?;
    Ok(handle)
}
