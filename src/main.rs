use anyhow::Context;
use chrono::Local;
use clap::{Parser, ValueEnum};
use log::info;
use peer_call::calls::loopback::{LoopbackMedia, LoopbackPeerFactory};
use peer_call::calls::{InMemoryChannel, StaticProfiles};
use peer_call::{
    CallBackends, CallConfig, CallKind, CallManager, CallNotification, CallStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// Two parties calling each other inside one process.
//
// Usage:
//   cargo run                              # audio call, answered
//   cargo run -- --kind video              # video call
//   cargo run -- --reject                  # callee declines
//   cargo run -- --hold-ms 2000            # ring and talk for two seconds

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Audio,
    Video,
}

impl From<Kind> for CallKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Audio => CallKind::Audio,
            Kind::Video => CallKind::Video,
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "Run a peer-to-peer call between two in-process users")]
struct Args {
    #[arg(long, default_value = "alice")]
    caller: String,

    #[arg(long, default_value = "bob")]
    callee: String,

    #[arg(short, long, value_enum, default_value_t = Kind::Audio)]
    kind: Kind,

    /// Decline instead of answering.
    #[arg(long)]
    reject: bool,

    /// How long the callee lets it ring, and how long the call lasts.
    #[arg(long, default_value_t = 500)]
    hold_ms: u64,

    /// JSON call configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

const WAIT: Duration = Duration::from_secs(10);

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => CallConfig::from_file(path)?,
        None => CallConfig::default(),
    }
    .with_env_overrides()?;

    let hub = InMemoryChannel::new();
    let profiles = Arc::new(
        StaticProfiles::new()
            .with(args.caller.as_str(), capitalize(&args.caller))
            .with(args.callee.as_str(), capitalize(&args.callee)),
    );
    let backends = || CallBackends {
        channel: Arc::new(hub.clone()),
        devices: Arc::new(LoopbackMedia::new()),
        peers: Arc::new(LoopbackPeerFactory::new()),
        profiles: Some(profiles.clone()),
    };

    let caller = CallManager::connect(args.caller.as_str(), &config, backends()).await?;
    let callee = CallManager::connect(args.callee.as_str(), &config, backends()).await?;
    let mut callee_events = callee.notifications();
    let mut caller_events = caller.notifications();

    caller
        .start_call(args.callee.as_str(), args.kind.into())
        .await?;

    let incoming = tokio::time::timeout(WAIT, async {
        loop {
            match callee_events.recv().await {
                Ok(CallNotification::Incoming { from, kind, profile }) => {
                    return Ok((from, kind, profile));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    })
    .await
    .context("callee never rang")??;
    let name = incoming
        .2
        .map(|p| p.display_name)
        .unwrap_or_else(|| incoming.0.to_string());
    info!("{} is ringing: {} call from {name}", args.callee, incoming.1);

    tokio::time::sleep(Duration::from_millis(args.hold_ms)).await;
    if args.reject {
        callee.reject_call().await?;
    } else {
        callee.answer_call().await?;
        let mut status = caller.watch_status();
        tokio::time::timeout(WAIT, status.wait_for(|s| *s == CallStatus::Connected))
            .await
            .context("call never connected")??;
        info!("Connected, muting {} for a moment", args.caller);
        caller.set_muted(true).await?;
        if let Some(call) = caller.current_call().await {
            info!(
                "{} holds {} local and {} remote track(s)",
                args.caller, call.local_tracks, call.remote_tracks
            );
        }
        tokio::time::sleep(Duration::from_millis(args.hold_ms)).await;
        caller.end_call().await?;
    }

    let ended = tokio::time::timeout(WAIT, async {
        loop {
            match caller_events.recv().await {
                Ok(CallNotification::Ended { reason, duration_secs, .. }) => {
                    return Ok((reason, duration_secs));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    })
    .await
    .context("call never ended")??;
    info!(
        "Call ended ({}), connected for {}s",
        ended.0,
        ended.1.unwrap_or(0)
    );

    for message in hub.published().await {
        info!(
            "  {} -> {}: {}",
            message.sender_id, message.target_id, message.kind
        );
    }

    callee.shutdown().await;
    caller.shutdown().await;
    Ok(())
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
