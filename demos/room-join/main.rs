// Room join
//
// Joins a room with a headless engine and synthetic media, logs every
// session callback and leaves on Ctrl+C.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use sfu_session::{
    events::TracingEvents,
    init_logging,
    media::{
        headless::{HeadlessEngine, SyntheticMediaSource},
        MediaKind,
    },
    signaling::{
        memory::{LoopbackRouter, MemorySignalingChannel},
        protocol::{DeviceInfo, LocalIdentity, NewProducer, PeerSummary, ProducerMeta},
        ws::{ReconnectPolicy, WsSignalingChannel},
        SignalingChannel,
    },
    Session, SessionConfig, VERSION,
};
use url::Url;

/// Join a room and report what the router sends
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// WebSocket URL of the signaling server
    #[clap(short, long)]
    url: Option<Url>,

    /// Run against an in-process router with one simulated remote peer
    #[clap(short, long)]
    loopback: bool,

    /// Room code to join
    #[clap(short, long, default_value = "ABCD123")]
    room: String,

    /// User identifier sent on join
    #[clap(long, default_value = "demo")]
    user: String,

    /// JSON session configuration
    #[clap(short, long)]
    config: Option<std::path::PathBuf>,

    /// Reconnection attempts before giving up
    #[clap(long, default_value = "10")]
    max_reconnects: u32,
}

fn loopback_channel() -> Arc<dyn SignalingChannel> {
    let router = Arc::new(LoopbackRouter::new());
    router.add_peer(PeerSummary {
        peer_id: "peer-remote".to_string(),
        user_id: Some("remote".to_string()),
        role: None,
        user_name: Some("Remote".to_string()),
        user_email: None,
    });
    for (producer_id, kind) in [("remote-cam", MediaKind::Video), ("remote-mic", MediaKind::Audio)] {
        router.add_producer(NewProducer {
            peer_id: "peer-remote".to_string(),
            producer_id: producer_id.to_string(),
            kind,
            meta: ProducerMeta {
                user_name: Some("Remote".to_string()),
                ..Default::default()
            },
        });
    }
    Arc::new(MemorySignalingChannel::new("peer-demo", router))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SessionConfig::from_json_file(path)?,
        None => SessionConfig::default(),
    };

    let channel: Arc<dyn SignalingChannel> = match (&args.url, args.loopback) {
        (_, true) => loopback_channel(),
        (Some(url), false) => Arc::new(WsSignalingChannel::new(
            url.clone(),
            ReconnectPolicy {
                max_attempts: args.max_reconnects,
                ..Default::default()
            },
        )),
        (None, false) => bail!("either --url or --loopback is required"),
    };

    let session = Session::new(
        channel,
        Arc::new(HeadlessEngine::new()),
        Arc::new(SyntheticMediaSource::new()),
        Arc::new(TracingEvents),
        config,
    );

    let identity = LocalIdentity {
        user_id: args.user.clone(),
        user_name: Some(args.user.clone()),
        user_email: None,
        device: DeviceInfo {
            os: std::env::consts::OS.to_string(),
            browser: "room-join".to_string(),
            version: Some(VERSION.to_string()),
            is_mobile: false,
        },
    };

    if let Err(e) = session.start(args.room.as_str(), identity).await {
        session.leave().await;
        bail!("failed to join {}: {} ({:?})", args.room, e, e.class());
    }

    println!(
        "Joined {} as {} with {} remote tracks and {} local producers",
        args.room,
        session.local_peer_id().unwrap_or_default(),
        session.remote_tiles().len(),
        session.producer_ids().len()
    );
    println!("Press Ctrl+C to leave");

    tokio::signal::ctrl_c().await?;

    session.leave().await;
    println!("Left {}", args.room);

    Ok(())
}
