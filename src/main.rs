mod config;
mod control;
mod diff;
mod http;
mod irc;
mod msgparsing;
mod slack;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use config::{Cli, Settings};
use irc::IrcServer;
use slack::SlackClient;

struct Signals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl Signals {
    fn new() -> Result<Signals> {
        Ok(Signals {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
            _ = self.hangup.recv() => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let settings = Settings::from_cli(cli)?;
    run(settings).await
}

/// Outer supervisor: one IRC client session at a time; the listener is
/// recreated after every disconnect, and the bridge status is persisted
/// between sessions and at exit.
async fn run(settings: Settings) -> Result<()> {
    let mut signals = Signals::new()?;

    loop {
        let listener = TcpListener::bind((settings.ip.as_str(), settings.port))
            .await
            .with_context(|| format!("unable to bind {}:{}", settings.ip, settings.port))?;
        info!("listening on {}:{}", settings.ip, settings.port);

        let (mut socket, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = signals.recv() => return Ok(()),
        };
        // Single client: no further connections until this session ends
        drop(listener);
        info!("accepted irc client from {peer}");

        let previous_status = settings
            .status_file
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok());
        let mut sl_client = SlackClient::new(
            settings.token.clone(),
            settings.cookie.clone(),
            previous_status.as_deref(),
        )?;

        let login = match sl_client.connect().await {
            Ok(login) => login,
            Err(e) => {
                error!("unable to connect to slack: {e}");
                let _ = socket
                    .write_all(format!("ERROR :Unable to connect to slack: {e}\r\n").as_bytes())
                    .await;
                continue;
            }
        };

        let (read_half, write_half) = socket.into_split();
        let mut server = IrcServer::new(&login, settings.server.clone(), write_half);

        // The sender is kept alive here so the control arm of the session
        // loop stays pending when no helper is connected.
        let (control_tx, mut control_rx) = mpsc::channel(16);
        let control_task = settings
            .control_socket
            .clone()
            .map(|path| tokio::spawn(control::listen(path, control_tx.clone())));

        let end = session(
            &mut server,
            &mut sl_client,
            read_half,
            &mut control_rx,
            &mut signals,
        )
        .await;

        if let Some(task) = control_task {
            task.abort();
        }
        persist_status(&settings, &sl_client);

        match end {
            SessionEnd::Disconnect => info!("irc client disconnected"),
            SessionEnd::Shutdown => return Ok(()),
        }
    }
}

fn persist_status(settings: &Settings, sl_client: &SlackClient) {
    let Some(path) = &settings.status_file else {
        return;
    };
    info!("writing status to {}", path.display());
    if let Err(e) = std::fs::write(path, sl_client.get_status()) {
        error!("unable to write the status file: {e}");
    }
}

enum SessionEnd {
    Disconnect,
    Shutdown,
}

/// One bridge session: a single cooperative loop multiplexing the IRC
/// reader, the Slack event pump, RTM reconnection and the control socket.
/// Everything mutable is owned here, so cache updates never race.
async fn session(
    server: &mut IrcServer<OwnedWriteHalf>,
    sl_client: &mut SlackClient,
    read_half: OwnedReadHalf,
    control_rx: &mut mpsc::Receiver<control::ControlRequest>,
    signals: &mut Signals,
) -> SessionEnd {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        // Replayed history and synthetic events drain ahead of the socket
        while let Some(ev) = sl_client.pop_internal_event() {
            if let Err(e) = server.slack_event(sl_client, ev).await {
                warn!("irc write failed: {e}");
                return SessionEnd::Disconnect;
            }
        }

        let connected = sl_client.is_connected();
        let reconnect_delay = sl_client.reconnect_delay();
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = server.handle_line(sl_client, &line).await {
                        if e.is::<irc::IrcDisconnect>() {
                            info!("irc client quit");
                        } else {
                            warn!("irc session error: {e}");
                        }
                        return SessionEnd::Disconnect;
                    }
                }
                Ok(None) => return SessionEnd::Disconnect,
                Err(e) => {
                    warn!("irc read error: {e}");
                    return SessionEnd::Disconnect;
                }
            },

            frame = sl_client.next_ws_frame(), if connected => {
                if let Some(raw) = frame {
                    for ev in sl_client.process_frame(&raw).await {
                        if let Err(e) = server.slack_event(sl_client, ev).await {
                            warn!("irc write failed: {e}");
                            return SessionEnd::Disconnect;
                        }
                    }
                }
                // A None frame means the socket died; the reconnect arm
                // below takes over on the next iteration.
            },

            _ = tokio::time::sleep(reconnect_delay), if !connected => {
                match sl_client.connect().await {
                    Ok(_) => info!("rtm reconnected"),
                    Err(e) => {
                        warn!("rtm reconnect failed: {e}");
                        sl_client.bump_backoff();
                    }
                }
            },

            request = control_rx.recv() => {
                if let Some(request) = request {
                    server.handle_control(sl_client, request).await;
                }
            },

            _ = signals.recv() => return SessionEnd::Shutdown,
        }
    }
}
