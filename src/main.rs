use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use eframe::egui::{self, Color32, Label, RichText};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hrbridge::ble::BtleGateway;
use hrbridge::config::Config;
use hrbridge::fake::FakeGateway;
use hrbridge::gateway::Gateway;
use hrbridge::hub::Hub;
use hrbridge::server::SubscriberServer;
use hrbridge::session::{SessionConfig, SessionController, SessionState};
use hrbridge::signal::{ControlIntent, StatusBus, StatusEvent};

mod widget;

const REPAINT_EVERY: Duration = Duration::from_millis(100);


#[derive(Parser, Debug)]
#[command(name = "hrbridge", about = "Relay a BLE heart-rate strap to WebSocket subscribers")]
struct Args {
    /// TOML config file; missing means defaults
    #[arg(long, default_value_os_t = Config::default_path())]
    config: PathBuf,
    /// Connect to the first device whose name contains this
    #[arg(long)]
    filter: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Use a simulated strap instead of Bluetooth
    #[arg(long)]
    simulate: bool,
    /// No window: start streaming right away and run until Ctrl-C
    #[arg(long)]
    headless: bool,
}


#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(filter) = args.filter {
        config.sensor.name_filter = filter;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if args.simulate {
        info!("using simulated heart rate strap");
        run(FakeGateway::simulated(), config, args.headless).await
    } else {
        run(BtleGateway::new(), config, args.headless).await
    }
}

async fn run<G: Gateway>(gateway: G, config: Config, headless: bool) -> Result<()> {
    let bus = StatusBus::new();
    let status_rx = bus.subscribe();
    let hub = Arc::new(Hub::new(bus.clone()));

    let server = SubscriberServer::bind(
        &config.server.listen_addr(),
        Arc::clone(&hub),
        bus.clone(),
        config.server.send_timeout(),
    )
    .await?;
    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    let controller = Arc::new(SessionController::new(gateway, hub, bus, SessionConfig::from(&config)));
    let (tx_intent, rx_intent) = mpsc::unbounded_channel();
    let driver = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.drive(rx_intent).await })
    };

    if headless {
        tx_intent.send(ControlIntent::Start)?;
        let logger = tokio::spawn(log_status(status_rx));
        tokio::signal::ctrl_c().await?;
        info!("interrupted, shutting down");
        logger.abort();
    } else {
        let state_rx = controller.watch_state();
        let tx_from_gui = tx_intent;
        let native_options = eframe::NativeOptions::default();
        eframe::run_native(
            "hrbridge",
            native_options,
            Box::new(move |_cc| Ok(Box::new(StatusApp::new(status_rx, state_rx, tx_from_gui)))),
        )
        .map_err(|err| anyhow!("status window failed: {err}"))?;
    }

    // Waits for any stop the driver is already running
    controller.stop().await;
    driver.abort();

    shutdown.cancel();
    let _ = server_task.await;
    Ok(())
}

async fn log_status(mut status_rx: broadcast::Receiver<StatusEvent>) {
    loop {
        match status_rx.recv().await {
            Ok(StatusEvent::HeartRate { bpm }) => info!(bpm, "heart rate"),
            Ok(StatusEvent::BatteryLevel { percent }) => info!(percent, "battery"),
            Ok(StatusEvent::Failed { reason }) => warn!(%reason, "session failed, restart to retry"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "status log fell behind"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}


struct StatusApp {
    status_rx: broadcast::Receiver<StatusEvent>,
    state_rx: watch::Receiver<SessionState>,
    tx_from_gui: mpsc::UnboundedSender<ControlIntent>,
    heart_rate: Option<u8>,
    battery: Option<u8>,
    device: Option<String>,
    subscribers: usize,
    listening: Option<String>,
    last_error: Option<String>,
}

impl StatusApp {
    fn new(
        status_rx: broadcast::Receiver<StatusEvent>,
        state_rx: watch::Receiver<SessionState>,
        tx_from_gui: mpsc::UnboundedSender<ControlIntent>,
    ) -> Self {
        StatusApp {
            status_rx,
            state_rx,
            tx_from_gui,
            heart_rate: None,
            battery: None,
            device: None,
            subscribers: 0,
            listening: None,
            last_error: None,
        }
    }

    fn read_channel(&mut self) {
        loop {
            match self.status_rx.try_recv() {
                Ok(event) => self.apply(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return,
            }
        }
    }

    fn apply(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::Scanning => {
                self.last_error = None;
                self.heart_rate = None;
                self.battery = None;
            }
            StatusEvent::DeviceFound { name, .. } => self.device = Some(name),
            StatusEvent::NotFound => self.last_error = Some("No matching heart rate strap found".into()),
            StatusEvent::HeartRate { bpm } => self.heart_rate = Some(bpm),
            StatusEvent::BatteryLevel { percent } => self.battery = Some(percent),
            StatusEvent::SubscriberJoined { count } | StatusEvent::SubscriberLeft { count } => {
                self.subscribers = count
            }
            StatusEvent::Listening { addr } => self.listening = Some(addr.to_string()),
            StatusEvent::Failed { reason } => self.last_error = Some(reason),
            StatusEvent::Disconnected => self.heart_rate = None,
            _ => {}
        }
    }

    fn send(&self, intent: ControlIntent) {
        if self.tx_from_gui.send(intent).is_err() {
            warn!(?intent, "session driver is gone");
        }
    }
}

impl eframe::App for StatusApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.read_channel();
        let state = self.state_rx.borrow().clone();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.add(widget::get_state_label(&state, self.device.as_deref()));
            ui.add(widget::get_heart_rate_label(self.heart_rate));
            ui.add(widget::get_battery_label(self.battery));
            ui.add(widget::get_subscriber_label(self.subscribers, self.listening.as_deref()));

            ui.horizontal(|ui| {
                let start_clicked = ui
                    .add_enabled(state == SessionState::Idle, widget::get_start_button())
                    .clicked();
                if start_clicked {
                    self.send(ControlIntent::Start);
                }

                let stop_clicked = ui
                    .add_enabled(state != SessionState::Idle, widget::get_stop_button())
                    .clicked();
                if stop_clicked {
                    self.send(ControlIntent::Stop);
                }
            });

            if let Some(error) = &self.last_error {
                ui.add(Label::new(RichText::new(error).color(Color32::RED)));
            }
        });

        ctx.request_repaint_after(REPAINT_EVERY);
    }
}
