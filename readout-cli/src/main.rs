//! Standalone driver that wires a `readout-core` link to a canned source
//! file: a [`SourceEmulator`] feeds raw frames through an [`Orchestrator`],
//! fake-trigger requests exercise the request handler, and counters are
//! dumped as JSON on exit. For bench and integration use when no real
//! front end is available.

mod frame;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use readout_core::config::Config;
use readout_core::emulator::SourceEmulator;
use readout_core::error_registry::FrameErrorRegistry;
use readout_core::latency_buffer::ring::RingLatencyBuffer;
use readout_core::latency_buffer::LatencyBufferConf;
use readout_core::orchestrator::Orchestrator;
use readout_core::processor::Processor;
use readout_core::request_handler::RequestHandler;
use readout_core::transport::{
    ChannelDataRequestReceiver, ChannelFragmentSender, ChannelRawReceiver, ChannelTimeSyncSender, DataRequestReceiver, FragmentSender,
};
use readout_core::ComponentId;

use frame::DemoFrame;

#[derive(Parser, Debug)]
#[command(name = "readout-cli")]
#[command(about = "Bench driver for the readout core")]
struct Args {
    /// Path to a TOML configuration file; overrides READOUT_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// How long to run before stopping and printing counters.
    #[arg(long, default_value = "5")]
    duration_secs: u64,
    /// Generate fake trigger requests from the timesync stream.
    #[arg(long)]
    fake_trigger: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(path) = &args.config {
        std::env::set_var("READOUT_CONFIG", path);
    }
    let config = Config::load();
    let component: ComponentId = config.link.source_id;

    let (raw_tx, raw_rx) = crossbeam_channel::bounded(4096);
    let (request_tx, request_rx) = crossbeam_channel::unbounded();
    let (timesync_tx, timesync_rx) = crossbeam_channel::unbounded();
    let (fragment_tx, fragment_rx) = crossbeam_channel::unbounded();

    let raw_receiver = Arc::new(ChannelRawReceiver::new(raw_rx));
    let data_request_receiver = Arc::new(ChannelDataRequestReceiver::new(request_rx));
    let timesync_sender = Arc::new(ChannelTimeSyncSender::new(timesync_tx));
    let mut destinations = std::collections::HashMap::new();
    destinations.insert("data_fragments_q".to_string(), fragment_tx);
    let fragment_sender = Arc::new(ChannelFragmentSender::new(destinations));

    let registry = Arc::new(FrameErrorRegistry::new());
    let buffer_conf = LatencyBufferConf {
        capacity: config.latency_buffer.latency_buffer_size,
        numa_aware: config.latency_buffer.numa_aware,
        numa_node: config.latency_buffer.numa_node,
        intrinsic_allocator: config.latency_buffer.intrinsic_allocator,
        alignment_size: config.latency_buffer.alignment_size,
        preallocate: config.latency_buffer.preallocation,
    };
    let buffer = Arc::new(RingLatencyBuffer::<DemoFrame>::new(&buffer_conf, component)?);

    let processor = Arc::new(Processor::<DemoFrame>::new(component));
    processor.conf(64);

    let request_handler = Arc::new(RequestHandler::new(
        component,
        Arc::clone(&buffer),
        Arc::clone(&registry),
        fragment_sender.clone() as Arc<dyn FragmentSender>,
    ));
    request_handler.conf(buffer_conf.capacity, config.request_handler.clone(), config.recording.clone())?;

    let orchestrator = Arc::new(Orchestrator::new(
        component,
        raw_receiver,
        data_request_receiver.clone() as Arc<dyn DataRequestReceiver>,
        timesync_sender,
        Arc::clone(&buffer),
        Arc::clone(&processor),
        Arc::clone(&request_handler),
    ));
    orchestrator.conf(
        config.request_handler.source_queue_timeout_ms as u64,
        args.fake_trigger,
        config.request_handler.post_processing_delay_ticks,
    );

    let emulator_sender = Arc::new(EmulatorToOrchestrator(raw_tx));
    let emulator = Arc::new(SourceEmulator::<DemoFrame>::new(component, emulator_sender, config.emulator.clone())?);

    data_request_receiver.start();
    orchestrator.start(1);
    emulator.start();

    info!("component[{component}] running for {}s", args.duration_secs);

    let stop_requested = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop_requested);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))?;

    let deadline = std::time::Instant::now() + Duration::from_secs(args.duration_secs);
    while std::time::Instant::now() < deadline && !stop_requested.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    emulator.stop();
    orchestrator.stop();
    data_request_receiver.stop();

    let request_info = request_handler.get_info();
    let orchestrator_info = orchestrator.get_info();
    let (new_packets, total_packets) = emulator.get_info();

    println!(
        "{}",
        serde_json::json!({
            "component": component,
            "request_handler": request_info,
            "orchestrator": orchestrator_info,
            "emulator": {"new_packets": new_packets, "total_packets": total_packets},
            "timesyncs_sent": timesync_rx.try_iter().count(),
            "fragments_received": fragment_rx.try_iter().count(),
        })
    );

    Ok(())
}

struct EmulatorToOrchestrator(crossbeam_channel::Sender<DemoFrame>);

impl readout_core::emulator::RawSender<DemoFrame> for EmulatorToOrchestrator {
    fn send(&self, payload: DemoFrame, timeout: Duration) -> bool {
        self.0.send_timeout(payload, timeout).is_ok()
    }
}
