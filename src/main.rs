mod args;

use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use turn_taking_server::config::Config;
use turn_taking_server::handler::{Handler, HandlerProperties, InboundFrame, OutboundFrame};
use turn_taking_server::metrics::Metrics;
use turn_taking_server::session::SessionManager;
use turn_taking_server::signaling::http::{self, AppState};
use turn_taking_server::signaling::webrtc::PeerConnectionFactory;

use args::Args;

/// An echo handler: returns exactly what it receives. Stands in for a
/// user-registered handler until one is mounted by an embedding
/// application — the runtime contract (`receive`/`emit`/`copy`/`shutdown`)
/// is the product; this crate ships a minimal, working default.
#[derive(Default, Clone)]
struct EchoHandler {
    queue: std::collections::VecDeque<OutboundFrame>,
}

impl Handler for EchoHandler {
    fn properties(&self) -> HandlerProperties {
        HandlerProperties {
            input_sample_rate: 48_000,
            output_sample_rate: 48_000,
            output_frame_samples: 960,
            expected_layout: turn_taking_server::config::ChannelLayout::Mono,
        }
    }

    fn receive(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Audio(audio) => self.queue.push_back(OutboundFrame::Audio(audio)),
            InboundFrame::Video(video) => self.queue.push_back(OutboundFrame::Video(video)),
        }
    }

    fn emit(&mut self) -> Option<OutboundFrame> {
        self.queue.pop_front()
    }

    fn shutdown(&mut self) {}

    fn copy(&self) -> Box<dyn Handler> {
        Box::new(EchoHandler::default())
    }
}

fn main() {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&format!("turn_taking_server={log_level},webrtc=warn,webrtc_ice=warn"))
        .init();

    info!("turn-taking-server v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match args.load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            error!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        error!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Runtime::new().expect("failed to build tokio runtime");
    if let Err(e) = runtime.block_on(run(config)) {
        eprintln!("Fatal error: {e}");
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let session_manager = Arc::new(SessionManager::new(
        config.session.concurrency_limit,
        config.queue.output_queue_capacity,
        config.session.time_limit_secs,
    ));
    let peer_connection_factory = PeerConnectionFactory::new(config.rtc.clone());
    let metrics = Arc::new(Metrics::new());

    let state = Arc::new(AppState {
        config,
        session_manager,
        peer_connection_factory,
        metrics,
        handler_factory: Box::new(|| Box::new(EchoHandler::default()) as Box<dyn Handler>),
        turn_taking: None,
        started_at: std::time::Instant::now(),
    });

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
