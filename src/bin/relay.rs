//! Radio Relay Appliance
//!
//! Serves the control UI, relays MP3 audio to local listeners and an
//! optional Icecast server. The `startup_auto_mode` setting picks where the
//! audio comes from: in transmitter mode, without encoder hardware, from a
//! replayed MP3 file (see `storage.replay_file` in the configuration); in
//! listener mode from a remote Icecast stream; in waiting mode nowhere.
//!
//! Lines typed on stdin stand in for the physical controls:
//! `kiosk on|off` flips the kiosk switch, anything else is a `name value`
//! setting update (e.g. `listen_volume 0.4`).

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_radio_relay::{
    audio::{create_ring_buffer, FileReplayProducer, PlaybackVolume},
    config::AppConfig,
    network::TcpAcceptor,
    server::{RelayServer, ServerStats},
    settings::{control_channel, parse_setting, ControlHandle, DeviceCommand, DeviceEvent, RunMode},
    storage::{DirStorage, Storage},
};

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting radio relay");

    let config = match std::env::args().nth(1).map(PathBuf::from).or_else(AppConfig::default_path) {
        Some(path) => AppConfig::load_or_default(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AppConfig::default(),
    };

    let storage = DirStorage::new(&config.storage.root)
        .with_context(|| format!("opening storage at {}", config.storage.root.display()))?;
    tracing::info!("Serving files from {}", storage.root().display());

    let replay = match config.storage.replay_file.as_deref() {
        Some(file) => {
            let path = format!("/{}", file.trim_start_matches('/'));
            let data = storage
                .read_all(&path)
                .with_context(|| format!("reading replay file {}", path))?;
            Some(data)
        }
        None => None,
    };

    let addr = config.server.socket_addr()?;
    let acceptor = TcpAcceptor::bind(addr, config.server.max_connections)
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!("Web UI available at http://{}", acceptor.local_addr()?);

    let (control, control_rx) = control_channel();
    let (event_tx, event_rx) = crossbeam_channel::unbounded();

    // Audio path: producer or listened stream -> ring -> network loop
    let (writer, reader) = create_ring_buffer(
        config.buffer.slot_count,
        config.buffer.slot_size,
        config.buffer.read_lag,
    );
    let server = RelayServer::new(&config, Box::new(acceptor), Box::new(storage))
        .with_audio_source(Box::new(reader))
        .with_control(control_rx)
        .with_events(event_tx);

    let (server, producer) = match (server.run_mode(), replay) {
        (RunMode::Listener, _) => {
            tracing::info!("Listener mode: the remote stream is served to local listeners");
            (server.with_listener_output(writer), None)
        }
        (RunMode::Transmitter, Some(data)) => {
            let mut producer = FileReplayProducer::new(data, config.storage.replay_bitrate_kbps, writer);
            producer.start().context("starting replay producer")?;
            (server, Some(Arc::new(Mutex::new(producer))))
        }
        (RunMode::Transmitter, None) => {
            tracing::info!("No replay file configured; listeners will receive silence until an encoder feeds the ring");
            drop(writer);
            (server, None)
        }
        (RunMode::Waiting, _) => {
            tracing::info!("Waiting mode: no audio until a startup mode is chosen");
            drop(writer);
            (server, None)
        }
    };

    if let Some(producer) = &producer {
        let volume = server.settings().get_f32("listen_volume", 1.0);
        producer.lock().set_playback_volume(volume);
    }
    if config.relay.enabled || server.run_mode() == RunMode::Transmitter {
        tracing::info!("Icecast relay enabled");
    }

    // Network loop thread
    let running = Arc::new(AtomicBool::new(true));
    let snapshot = Arc::new(Mutex::new(ServerStats::default()));
    let loop_handle = {
        let running = running.clone();
        let snapshot = snapshot.clone();
        let mut server = server;
        thread::Builder::new()
            .name("network-loop".to_string())
            .spawn(move || server.run(&running, &snapshot))
            .context("spawning network loop")?
    };

    // Device events: volume changes reach the producer, restart ends the process
    let (restart_tx, mut restart_rx) = tokio::sync::mpsc::unbounded_channel();
    {
        let producer = producer.clone();
        thread::Builder::new()
            .name("device-events".to_string())
            .spawn(move || {
                for event in event_rx {
                    match event {
                        DeviceEvent::SettingChanged { name, value } if name == "listen_volume" => {
                            match (value.parse::<f32>(), &producer) {
                                (Ok(level), Some(producer)) => producer.lock().set_playback_volume(level),
                                (Err(_), _) => tracing::warn!("Ignoring bad listen_volume {:?}", value),
                                _ => {}
                            }
                        }
                        DeviceEvent::SettingChanged { .. } => {}
                        DeviceEvent::Command(DeviceCommand::Restart) => {
                            tracing::warn!("Restart requested from the control page");
                            let _ = restart_tx.send(());
                        }
                        DeviceEvent::RelayClosed => tracing::info!("Relay closed; supervisor will reconnect"),
                    }
                }
            })
            .context("spawning event thread")?;
    }

    spawn_console_controls(control)?;

    let mut stats_timer = tokio::time::interval(STATS_LOG_INTERVAL);
    stats_timer.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down");
                break;
            }
            _ = restart_rx.recv() => {
                tracing::info!("Stopping for restart");
                break;
            }
            _ = stats_timer.tick() => {
                let stats = snapshot.lock().clone();
                let produced = producer.as_ref().map_or(0, |p| p.lock().bytes_produced());
                tracing::info!(
                    "Stats: {} connections ({} WebSocket, {} listeners, relay {}, stream in {}), {} slots relayed, {:.1} KB audio sent, {} KB produced",
                    stats.open_connections,
                    stats.websocket_clients,
                    stats.mp3_listeners,
                    if stats.relay_connected { "up" } else { "down" },
                    if stats.listener_connected { "up" } else { "down" },
                    stats.slots_relayed,
                    stats.audio_bytes_sent as f64 / 1024.0,
                    produced / 1024
                );
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    if loop_handle.join().is_err() {
        tracing::error!("Network loop thread panicked");
    }
    if let Some(producer) = producer {
        producer.lock().stop();
    }
    tracing::info!("Radio relay stopped");
    Ok(())
}

/// Feed stdin lines into the control queue
fn spawn_console_controls(control: ControlHandle) -> Result<()> {
    thread::Builder::new()
        .name("console-controls".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                let sent = match parse_setting(&line) {
                    Some(("kiosk", state)) => control.set_kiosk(matches!(state, "on" | "1" | "true")),
                    Some((name, value)) => control.set_setting(name, value),
                    None => continue,
                };
                if !sent {
                    break;
                }
            }
        })
        .context("spawning console controls")?;
    Ok(())
}
