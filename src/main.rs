use anyhow::{Context, anyhow};
use clap::{Arg, ArgMatches, Command};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::{fs, panic, process};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mediabridge::config::BridgeConfig;
use mediabridge::control::BitrateAdapter;
use mediabridge::engine::gst::GstEngine;
use mediabridge::pipeline::health::HealthMonitor;
use mediabridge::pipeline::types::StatsSample;
use mediabridge::profile::{EncoderProfile, Platform, rtp_sender_description};
use mediabridge::rtp::payload::Codec;
use mediabridge::{ChannelConsumer, MainLoop, Pipeline, PipelineLifecycleManager, RelayEvent, TerminalEvent};

const EVENT_CAPACITY: usize = 256;
const MAX_DATAGRAM: usize = 1500;

fn cli() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("description")
                .short('d')
                .long("description")
                .value_name("PIPELINE")
                .help("Pipeline description to run.")
                .conflicts_with_all(["description-file", "codec"]),
        )
        .arg(
            Arg::new("description-file")
                .short('f')
                .long("description-file")
                .value_name("PATH")
                .help("Read the pipeline description from a file.")
                .conflicts_with("codec"),
        )
        .arg(
            Arg::new("codec")
                .long("codec")
                .value_name("CODEC")
                .help("Encode SOURCE with a ready-made profile (vp8, h264, h265, opus)."),
        )
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("SOURCE")
                .help("Source fragment for generated descriptions.")
                .default_value("videotestsrc is-live=true"),
        )
        .arg(
            Arg::new("cname")
                .long("cname")
                .value_name("CNAME")
                .help("RTCP CNAME of the generated RTP sender.")
                .default_value("mediabridge"),
        )
        .arg(
            Arg::new("preset")
                .short('p')
                .long("preset")
                .value_name("PRESET")
                .help("Bridge settings preset (rtp-sender, media-sinks)."),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Bridge settings JSON file; overrides --preset.")
                .conflicts_with("preset"),
        )
        .arg(
            Arg::new("rtp-out")
                .long("rtp-out")
                .value_name("HOST:PORT")
                .help("Send units from `rtpsink` to this address."),
        )
        .arg(
            Arg::new("rtcp-out")
                .long("rtcp-out")
                .value_name("HOST:PORT")
                .help("Send units from `rtcpsink` to this address."),
        )
        .arg(
            Arg::new("rtcp-in")
                .long("rtcp-in")
                .value_name("HOST:PORT")
                .help("Receive transport feedback on this address."),
        )
        .arg(
            Arg::new("no-adapt")
                .long("no-adapt")
                .help("Do not adapt the video bitrate to transport stats.")
                .action(clap::ArgAction::SetTrue),
        )
}

/// Description and bridge settings selected on the command line
fn pipeline_setup(matches: &ArgMatches) -> anyhow::Result<(String, BridgeConfig)> {
    let source = matches
        .get_one::<String>("source")
        .map(String::as_str)
        .unwrap_or("videotestsrc is-live=true");

    let (description, mut config) = if let Some(description) = matches.get_one::<String>("description") {
        (description.clone(), BridgeConfig::default())
    } else if let Some(path) = matches.get_one::<String>("description-file") {
        let description = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        (description.trim().to_string(), BridgeConfig::default())
    } else if let Some(name) = matches.get_one::<String>("codec") {
        let codec = Codec::from_name(name).ok_or_else(|| anyhow!("unknown codec `{}`", name))?;
        let profile = EncoderProfile::new(codec, Platform::current())?;
        (profile.description(source), profile.bridge_config())
    } else {
        let cname = matches.get_one::<String>("cname").map(String::as_str).unwrap_or("mediabridge");
        (rtp_sender_description(source, cname), BridgeConfig::rtp_sender())
    };

    if let Some(name) = matches.get_one::<String>("preset") {
        config = BridgeConfig::preset(name).ok_or_else(|| anyhow!("unknown preset `{}`", name))?;
    }
    if let Some(path) = matches.get_one::<String>("config") {
        config = BridgeConfig::load(path)?;
    }

    Ok((description, config))
}

fn address(matches: &ArgMatches, id: &str) -> anyhow::Result<Option<SocketAddr>> {
    matches
        .get_one::<String>(id)
        .map(|addr| addr.parse().with_context(|| format!("--{} {}", id, addr)))
        .transpose()
}

/// Sink name → destination for relayed units
struct Outputs {
    socket: UdpSocket,
    routes: Vec<(&'static str, SocketAddr)>,
}

async fn pump_events(
    mut events: mpsc::Receiver<RelayEvent>,
    stats_tx: Option<mpsc::Sender<StatsSample>>,
    outputs: Option<Outputs>,
    main_loop: MainLoop,
) {
    while let Some(event) = events.recv().await {
        match event {
            RelayEvent::Unit { origin, unit } => {
                let Some(outputs) = &outputs else { continue };
                let Some((_, addr)) = outputs.routes.iter().find(|(sink, _)| *sink == &*origin.sink) else {
                    continue;
                };
                if let Err(e) = outputs.socket.send_to(&unit.data, addr).await {
                    warn!("Failed to send {} bytes from {} to {}: {}", unit.len(), origin.sink, addr, e);
                }
            }
            RelayEvent::Stats { pipeline, sample } => {
                match sample.delivery_ratio() {
                    Some(ratio) => debug!("Pipeline {}: {} ({:.1}% delivered)", pipeline, sample, ratio * 100.0),
                    None => debug!("Pipeline {}: {}", pipeline, sample),
                }
                if let Some(tx) = &stats_tx {
                    let _ = tx.try_send(sample);
                }
            }
            RelayEvent::Terminal { pipeline, event } => {
                info!("Pipeline {} ended: {}", pipeline, event);
                main_loop.quit();
            }
        }
    }
}

async fn receive_feedback(socket: UdpSocket, pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _)) => len,
                Err(e) => {
                    warn!("Feedback socket: {}", e);
                    continue;
                }
            },
        };

        let report = pipeline.push_transport_feedback(buf[..len].to_vec());
        if !report.delivered_anywhere() {
            warn!("Feedback of {} bytes not delivered: {}", len, report);
        } else if !report.is_complete() {
            debug!("Feedback of {} bytes partially delivered: {}", len, report);
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = cli().get_matches();
    let (description, config) = pipeline_setup(&matches)?;
    let rtp_out = address(&matches, "rtp-out")?;
    let rtcp_out = address(&matches, "rtcp-out")?;
    let rtcp_in = address(&matches, "rtcp-in")?;

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let runtime = tokio::runtime::Runtime::new()?;
    let engine = Arc::new(GstEngine::new()?);
    let manager = PipelineLifecycleManager::new(engine, config);
    let main_loop = manager.main_loop();

    let pipeline = manager.create(&description)?;
    info!("Pipeline {}: {}", pipeline.id(), pipeline.description());

    let (consumer, events) = ChannelConsumer::new(EVENT_CAPACITY);
    let consumer = Arc::new(consumer);
    let report = manager.start(&pipeline, consumer.clone())?;
    info!(
        "Pipeline {} playing: sinks {:?}, session manager {}",
        pipeline.id(),
        report.bound_sinks,
        report.session_manager
    );
    for tolerated in &report.tolerated {
        warn!("{}", tolerated);
    }

    {
        // gracefully close the app when receiving SIGINT, SIGTERM, or SIGHUP
        let main_loop = main_loop.clone();
        ctrlc::set_handler(move || main_loop.quit()).context("setting Ctrl-C handler")?;
    }

    let cancel = CancellationToken::new();

    let stats_tx = if matches.get_flag("no-adapt") {
        None
    } else {
        let (tx, rx) = mpsc::channel(16);
        runtime.spawn(BitrateAdapter::new().run(pipeline.clone(), rx, cancel.clone()));
        Some(tx)
    };

    let routes: Vec<_> = [("rtpsink", rtp_out), ("rtcpsink", rtcp_out)]
        .into_iter()
        .filter_map(|(sink, addr)| addr.map(|addr| (sink, addr)))
        .collect();
    let outputs = if routes.is_empty() {
        None
    } else {
        let socket = runtime.block_on(UdpSocket::bind("0.0.0.0:0"))?;
        Some(Outputs { socket, routes })
    };
    runtime.spawn(pump_events(events, stats_tx, outputs, main_loop.clone()));

    if let Some(addr) = rtcp_in {
        let socket = runtime
            .block_on(UdpSocket::bind(addr))
            .with_context(|| format!("binding feedback socket {}", addr))?;
        runtime.spawn(receive_feedback(socket, pipeline.clone(), cancel.clone()));
    }

    let (alert_tx, mut alerts) = mpsc::channel(8);
    let monitor = HealthMonitor::new(pipeline.health(), alert_tx);
    {
        let cancel = cancel.clone();
        runtime.spawn(async move { monitor.run(cancel).await });
    }
    runtime.spawn(async move {
        while let Some(alert) = alerts.recv().await {
            warn!("Pipeline health: {}", alert);
        }
    });

    main_loop.run();

    cancel.cancel();
    manager.stop(&pipeline)?;
    info!("{}", pipeline.health().summary());
    if consumer.dropped() > 0 {
        warn!("{} relay events dropped", consumer.dropped());
    }
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));

    match pipeline.terminal_event() {
        Some(TerminalEvent::Fatal {
            message,
            debug: Some(debug),
        }) => {
            error!("Error: {} ({})", message, debug);
            process::exit(1);
        }
        Some(event) => {
            error!("Pipeline {}: {}", pipeline.id(), event);
            process::exit(1);
        }
        None => {}
    }
    Ok(())
}
