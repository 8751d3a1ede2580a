//! Two engines calling each other through the in-process relay.
//!
//! Exercises the whole negotiation path (invite, accept, offer/answer,
//! candidates, hangup) with simulated peer transports, printing every
//! snapshot both sides emit. Run with `RUST_LOG=debug` to watch the
//! signaling underneath.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use peercall::calls::media::SimMedia;
use peercall::calls::peer::sim::SimPeerFactory;
use peercall::transport::mem::MemoryRelay;
use peercall::types::call::UserId;
use peercall::{CallEngine, EngineConfig};

#[derive(Parser)]
#[command(about = "Loopback call between two in-process engines")]
struct Args {
    /// Caller's user id.
    #[arg(long, default_value = "alice")]
    caller: String,

    /// Callee's user id.
    #[arg(long, default_value = "bob")]
    callee: String,

    /// Place a video call instead of audio only.
    #[arg(long)]
    video: bool,

    /// How long the callee lets it ring before picking up, in seconds.
    #[arg(long, default_value_t = 1)]
    ring_secs: u64,

    /// How long the call stays up before the caller hangs up, in seconds.
    #[arg(long, default_value_t = 3)]
    talk_secs: u64,
}

fn spawn_engine(relay: &Arc<MemoryRelay>, name: &str) -> CallEngine {
    let engine = CallEngine::new(
        UserId::from(name),
        EngineConfig::default(),
        Box::new(relay.factory(UserId::from(name))),
        Arc::new(SimPeerFactory::default()),
        SimMedia::new(),
    );
    let mut updates = engine.events().call_update.subscribe();
    let label = name.to_string();
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            println!(
                "[{label}] {} with {} (muted: {}, remote track: {})",
                update.phase.name(),
                update.remote_user,
                update.media.muted,
                update.remote_track_bound,
            );
            if let Some(reason) = &update.end_reason {
                println!("[{label}] call ended: {reason}");
            }
        }
    });
    engine
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let relay = MemoryRelay::new();
    let caller = spawn_engine(&relay, &args.caller);
    let callee = spawn_engine(&relay, &args.callee);

    let mut incoming = callee.events().incoming_call.subscribe();

    let session_id = caller
        .place_call(UserId::from(args.callee.as_str()), args.video)
        .await?;
    println!("[{}] calling {} ({session_id})", args.caller, args.callee);

    let ringing = incoming.recv().await?;
    println!(
        "[{}] ringing: {} calling (video: {})",
        args.callee, ringing.from, ringing.video
    );

    sleep(Duration::from_secs(args.ring_secs)).await;
    callee.accept_incoming(&ringing.session_id).await?;

    sleep(Duration::from_secs(args.talk_secs)).await;
    caller.toggle_mute(&session_id).await?;
    sleep(Duration::from_millis(500)).await;
    caller.hangup(&session_id).await?;

    // Let the teardown snapshots print before exiting.
    sleep(Duration::from_millis(500)).await;
    caller.shutdown().await;
    callee.shutdown().await;
    Ok(())
}
