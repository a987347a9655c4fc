// ABOUTME: Console demo for the session registry
// ABOUTME: Two registries exchange audio frames over a shared loopback transport

use bytes::Bytes;
use clap::Parser;
use futures_util::future::join_all;
use sessionhub::registry::DemoArgs;
use sessionhub::SessionRegistry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "sessionhub")]
#[command(author, version, about = "Session registry demo over a loopback transport", long_about = None)]
struct Args {
    #[command(flatten)]
    demo: DemoArgs,
}

/// Size of 20ms of 16-bit PCM
fn frame_bytes(sample_rate: u32, channels: u8) -> usize {
    (sample_rate as usize / 50) * channels as usize * 2
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    args.demo.init_tracing();
    args.demo.log_startup_info();

    let transport = args.demo.build_transport();
    let sender = SessionRegistry::new(args.demo.build_config("sender"), Arc::new(transport.clone()));
    let receiver =
        SessionRegistry::new(args.demo.build_config("receiver"), Arc::new(transport.clone()));
    let ids = args.demo.session_ids();

    // Receivers join first so every outgoing stream is announced to them
    let received = Arc::new(AtomicUsize::new(0));
    for session in join_all(ids.iter().map(|id| receiver.create_session(id.clone()))).await {
        let session = session?;
        let received = received.clone();
        let session_id = session.id().to_string();
        session.on_incoming_audio(move |audio| {
            received.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "{}: {} bytes on stream {}",
                session_id,
                audio.payload.len(),
                audio.stream_id
            );
        });
    }

    let mut streams = Vec::new();
    for session in join_all(ids.iter().map(|id| sender.create_session(id.clone()))).await {
        streams.push(session?.create_outgoing_stream()?);
    }
    tracing::info!(
        "{} sessions joined on each side, {} connect attempts",
        ids.len(),
        transport.connect_attempts()
    );

    // Spawn a task to periodically report active sessions
    let report_registry = sender.clone();
    let report_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let snapshot = report_registry.snapshot();
            tracing::info!(
                "Active sessions: {} (connection {})",
                snapshot.sessions.len(),
                snapshot.connection_state
            );
            for session in &snapshot.sessions {
                tracing::info!(
                    "  - {}: outgoing={}, incoming={}",
                    session.id,
                    session.outgoing_streams,
                    session.incoming_streams
                );
            }
        }
    });

    let frame = Bytes::from(vec![0u8; frame_bytes(args.demo.sample_rate, args.demo.channels)]);
    let mut interval = tokio::time::interval(Duration::from_millis(args.demo.payload_interval_ms.max(1)));
    for _ in 0..args.demo.payloads {
        interval.tick().await;
        for stream in &streams {
            stream.send(frame.clone())?;
        }
    }

    transport.publish_stats();
    if let Some(stats) = sender.last_stats() {
        tracing::info!(
            "Sender stats: sent={} bytes, received={} bytes, rtt={:.1}ms",
            stats.bytes_sent,
            stats.bytes_received,
            stats.round_trip_ms
        );
    }
    tracing::info!(
        "Receiver got {} of {} payloads",
        received.load(Ordering::Relaxed),
        args.demo.payloads * streams.len()
    );

    if args.demo.json {
        println!("{}", serde_json::to_string_pretty(&sender.snapshot())?);
    }

    for id in &ids {
        sender.terminate_session(id);
    }

    // Auto-disconnect completes off the caller's thread
    if !args.demo.keep_connection {
        let deadline = Instant::now() + Duration::from_secs(2);
        while sender.is_connected() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    tracing::info!(
        "Sender connection after last terminate: {}",
        sender.connection_state()
    );

    report_task.abort();
    receiver.dispose();
    sender.dispose();
    tracing::info!("Open loopback connections: {}", transport.live_connections());

    Ok(())
}
