// imok command-line front end -- runs either side of the relay from a
// terminal.
//
// Usage:
//   imok list
//   imok device --kind nordic --port /dev/ttyACM0
//   imok device --kind murata --port /dev/ttyUSB0 --listen-udp --send "I'm OK"
//   imok sims
//   imok console --sim 8942310022000012345 --target nordic
//
// In `device` and `console` mode every line typed on stdin is sent as a
// text message; events are printed as they arrive. Soracom credentials come
// from --auth-key-id/--auth-key or SORACOM_AUTH_KEY_ID/SORACOM_AUTH_KEY.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use imok::messenger::{
    ConsoleMessengerBuilder, DeviceMessengerBuilder, MessengerEvent, OversizePolicy,
};
use imok::relay::{RelayCursor, SoracomRelay};
use imok::session::DeviceSessionBuilder;
use imok::{DeviceKind, Message, NetworkSettings, SessionEvent};
use imok_transport::available_ports;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// I'm OK -- short messages between a field modem and an operator console.
#[derive(Parser)]
#[command(name = "imok", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List supported devices and the serial ports on this host.
    List,

    /// Run the device side: bring up the modem and exchange messages.
    Device(DeviceArgs),

    /// List the SIMs visible to the Soracom account.
    Sims {
        #[command(flatten)]
        auth: AuthArgs,
    },

    /// Run the console side: poll uplinks and submit downlinks.
    Console(ConsoleArgs),
}

#[derive(Args)]
struct DeviceArgs {
    /// Device type: nordic or murata.
    #[arg(long)]
    kind: DeviceKind,

    /// Serial port path (e.g. /dev/ttyACM0, COM5).
    #[arg(long)]
    port: String,

    /// Baud rate (defaults to the device's).
    #[arg(long)]
    baud: Option<u32>,

    /// PDP context APN.
    #[arg(long, default_value = imok::DEFAULT_APN)]
    apn: String,

    /// Seconds to wait for network registration.
    #[arg(long, default_value_t = 180)]
    registration_timeout: u64,

    /// Also accept downlinks on UDP port 55555 of this host.
    #[arg(long)]
    listen_udp: bool,

    /// Source address accepted by the UDP listener.
    #[arg(long, default_value = imok::DEFAULT_DOWNLINK_SOURCE)]
    downlink_source: IpAddr,

    /// Message to send once the session is ready (repeatable).
    #[arg(long)]
    send: Vec<String>,

    /// Truncate oversized messages instead of rejecting them.
    #[arg(long)]
    truncate: bool,

    /// Do not acknowledge received downlinks.
    #[arg(long)]
    no_acks: bool,
}

#[derive(Args)]
struct AuthArgs {
    /// Soracom auth key id (or operator email).
    #[arg(long, env = "SORACOM_AUTH_KEY_ID", hide_env_values = true)]
    auth_key_id: String,

    /// Soracom auth key secret (or password).
    #[arg(long, env = "SORACOM_AUTH_KEY", hide_env_values = true)]
    auth_key: String,

    /// API base URL.
    #[arg(long, default_value = "https://g.api.soracom.io/v1")]
    api_base: String,
}

#[derive(Args)]
struct ConsoleArgs {
    #[command(flatten)]
    auth: AuthArgs,

    /// SIM whose traffic to follow.
    #[arg(long)]
    sim: String,

    /// Device type behind the SIM, for downlink sizing and encoding.
    #[arg(long)]
    target: Option<DeviceKind>,

    /// Seconds between relay polls.
    #[arg(long, default_value_t = 5)]
    poll_secs: u64,

    /// Only show uplinks stored after this many milliseconds since the epoch.
    #[arg(long, default_value_t = 0)]
    since_ms: i64,

    /// Acknowledge received uplinks.
    #[arg(long)]
    send_acks: bool,

    /// Truncate oversized messages instead of rejecting them.
    #[arg(long)]
    truncate: bool,
}

fn oversize(truncate: bool) -> OversizePolicy {
    if truncate {
        OversizePolicy::Truncate
    } else {
        OversizePolicy::Reject
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn format_message(m: &Message) -> String {
    let mut out = format!("[{}] {}", m.timestamp().format("%Y-%m-%d %H:%M:%S"), m.id());
    if let Some(loc) = m.location() {
        out.push_str(&format!(" @ {:.7},{:.7}", loc.latitude(), loc.longitude()));
    }
    if !m.text().is_empty() {
        out.push_str(&format!(" {}", m.text()));
    }
    out
}

fn print_event(event: &MessengerEvent) {
    match event {
        MessengerEvent::Inbound(m) => println!("<< {}", format_message(m)),
        MessengerEvent::StatusChanged { id, status } => println!("   {id} {status}"),
        MessengerEvent::Rejected { id, error } => println!("!! {id} not sent: {error}"),
        MessengerEvent::Session(SessionEvent::StateChanged { to, reason, .. }) => match reason {
            Some(reason) => println!("-- session {to:?}: {reason}"),
            None => println!("-- session {to:?}"),
        },
        MessengerEvent::Session(SessionEvent::SignalQuality(q)) => {
            println!("-- signal rsrp={:?} rsrq={:?} sinr={:?}", q.rsrp_dbm, q.rsrq, q.sinr)
        }
        MessengerEvent::Session(other) => println!("-- {other:?}"),
    }
}

/// Submit stdin lines with `submit` and print events until stdin closes or
/// Ctrl-C.
async fn interact<F>(mut events: UnboundedReceiver<MessengerEvent>, submit: F) -> Result<()>
where
    F: Fn(&str) -> imok::Result<imok::MessageId>,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },

            line = lines.next_line(), if stdin_open => match line.context("reading stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match submit(line.trim()) {
                    Ok(id) => println!(">> {id} {}", line.trim()),
                    Err(e) => println!("!! {e}"),
                },
                None => stdin_open = false,
            },
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_list() -> Result<()> {
    let devices = imok::supported_devices();
    let name_width = devices.iter().map(|d| d.name.len()).max().unwrap_or(12).max(12);

    println!("{:<20}  {:<name_width$}  {:>5}  Encoding", "Key", "Device", "MTU");
    println!("{:<20}  {:<name_width$}  {:>5}  --------", "-".repeat(20), "-".repeat(name_width), "-----");
    for d in &devices {
        println!(
            "{:<20}  {:<name_width$}  {:>5}  {:?}",
            d.kind.key(),
            d.name,
            d.mtu,
            d.encoding
        );
    }

    println!();
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        match port.description {
            Some(desc) => println!("{}  ({desc})", port.name),
            None => println!("{}", port.name),
        }
    }
    Ok(())
}

async fn cmd_device(args: DeviceArgs) -> Result<()> {
    let settings = NetworkSettings {
        apn: args.apn.clone(),
        ..NetworkSettings::default()
    };
    let mut builder = DeviceSessionBuilder::for_device(args.kind, settings)?
        .serial_port(&args.port)
        .registration_timeout(Duration::from_secs(args.registration_timeout));
    if let Some(baud) = args.baud {
        builder = builder.baud_rate(baud);
    }

    let session = builder
        .connect()
        .await
        .with_context(|| format!("opening {} on {}", args.kind.display_name(), args.port))?;
    info!(device = args.kind.key(), port = %args.port, "session started");

    let mut messenger = DeviceMessengerBuilder::new(session)
        .oversize_policy(oversize(args.truncate))
        .send_acks(!args.no_acks);
    if args.listen_udp {
        messenger = messenger.listen_udp(Some(args.downlink_source)).await?;
    }
    let (messenger, events) = messenger.build();

    for text in &args.send {
        let id = messenger.submit(messenger.compose(text))?;
        println!(">> {id} {text} (queued)");
    }

    let result = interact(events, |text| messenger.submit(messenger.compose(text))).await;
    messenger.shutdown().await;
    result
}

async fn connect_relay(auth: &AuthArgs) -> Result<SoracomRelay> {
    let mut relay = SoracomRelay::with_base_url(&auth.api_base)?;
    relay
        .authenticate(&auth.auth_key_id, &auth.auth_key)
        .await
        .context("Soracom authentication failed")?;
    Ok(relay)
}

async fn cmd_sims(auth: AuthArgs) -> Result<()> {
    let relay = connect_relay(&auth).await?;
    let sims = relay.list_sims().await?;
    if sims.is_empty() {
        println!("No SIMs found.");
        return Ok(());
    }
    println!("{:<22}  {:<16}  Online", "SIM", "IMSI");
    for sim in &sims {
        println!(
            "{:<22}  {:<16}  {}",
            sim.sim_id,
            sim.imsi.as_deref().unwrap_or("-"),
            if sim.online { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn cmd_console(args: ConsoleArgs) -> Result<()> {
    if args.poll_secs == 0 {
        bail!("--poll-secs must be at least 1");
    }
    let mut relay = connect_relay(&args.auth).await?;
    relay.select_sim(&args.sim);
    match relay.sim_online(&args.sim).await {
        Ok(online) => info!(sim = %args.sim, online, "SIM selected"),
        Err(e) => warn!(sim = %args.sim, error = %e, "could not read SIM status"),
    }

    let mut builder = ConsoleMessengerBuilder::new(Arc::new(relay))
        .poll_interval(Duration::from_secs(args.poll_secs))
        .cursor(RelayCursor::since(args.since_ms))
        .oversize_policy(oversize(args.truncate))
        .send_acks(args.send_acks);
    if let Some(kind) = args.target {
        builder = builder.target_device(kind)?;
    }
    let (messenger, events) = builder.build();

    let result = interact(events, |text| messenger.submit(messenger.compose(text))).await;
    messenger.shutdown().await;
    result
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::List => cmd_list(),
        Command::Device(args) => cmd_device(args).await,
        Command::Sims { auth } => cmd_sims(auth).await,
        Command::Console(args) => cmd_console(args).await,
    }
}
