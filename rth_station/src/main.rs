use std::net::Ipv6Addr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use app::Orchestrator;
use data_io::config::{DeviceRole, APP_CONFIG};
use data_io::serial::FramedPort;
use j1772::J1772;
use slac::SlacTool;
use tokio::signal::unix::{signal, SignalKind};

mod app;
mod data_io;
mod error;
mod j1772;
mod macros;
mod relay;
mod sdp;
mod slac;

/// Idle duty cycle advertised by the EVSE before a vehicle is present.
const EVSE_IDLE_DUTY: f64 = 99.9;

#[tokio::main]
async fn main() -> Result<(), &'static str> {
    #[cfg(feature = "logging-verbose")]
    simple_logger::init_with_level(log::Level::Trace).expect("Logger init failed");
    #[cfg(not(feature = "logging-verbose"))]
    simple_logger::init_with_level(log::Level::Debug).expect("Logger init failed");

    let app_config = APP_CONFIG.clone();
    let role = app_config.general.device_type;
    let local_ipv6: Ipv6Addr = app_config
        .network
        .local_ipv6
        .parse()
        .expect("network.local_ipv6 is not a valid IPv6 address");

    let mut port = FramedPort::open(&app_config.general.serial_device).map_err(|e| {
        log::error!("{e}");
        "Serial port open failed"
    })?;
    port.flush_input();

    let shutdown = statics::shutdown_flag();
    let mut ctrl_c =
        signal(SignalKind::interrupt()).expect("Failed to create Ctrl-C signal handler");
    let mut term = signal(SignalKind::terminate()).expect("Failed to create SIGTERM handler");
    let flag = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = ctrl_c.recv() => log::warn!("SIGINT received"),
            _ = term.recv() => log::warn!("SIGTERM received"),
        }
        flag.store(true, Ordering::Relaxed);
    });

    let mut j1772 = J1772::new(
        port,
        role,
        Duration::from_millis(app_config.general.response_delay_ms),
    );

    if role == DeviceRole::Evse {
        j1772.set_pwm_enable(true).await;
        j1772.set_duty_cycle(EVSE_IDLE_DUTY).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    j1772.sample().await;
    log::info!(
        "Startup pilot state {} ({} V)",
        j1772.status.pilot_state.name(),
        j1772.status.pilot_volts
    );

    let plc = Box::new(SlacTool::new(app_config.slac.clone()));
    let mut orchestrator = Orchestrator::new(app_config, local_ipv6, j1772, plc, shutdown);
    orchestrator.run().await;
    Ok(())
}

pub mod statics {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use tokio::sync::{mpsc, Mutex};

    /// Hex-encoded relay chunk bound for this station's data topic.
    pub type RelayPayload = String;
    pub type RelayTx = mpsc::Sender<RelayPayload>;
    pub type RelayRx = mpsc::Receiver<RelayPayload>;
    pub type RelayChannel = (RelayTx, RelayRx);

    pub fn relay_channel() -> RelayChannel {
        mpsc::channel::<RelayPayload>(100)
    }

    /// Observed by every loop and background task; no forced aborts.
    pub fn shutdown_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    pub fn mutex<T>(i: T) -> Arc<Mutex<T>> {
        Arc::new(Mutex::new(i))
    }
}
