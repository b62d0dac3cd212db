//! Netbattle Lobby
//!
//! Runs two lobby sessions against a loopback relay and launches a
//! negotiated match between them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use netbattle_lobby::{
    network::loopback::{spawn_loopback, RelayOptions},
    spawn_session, channel_bridge, Catalog, GameSelection, MatchRequest, SessionConfig,
    SessionOutcome, CHUNK_COUNT, CHUNK_SIZE, PROTOCOL_VERSION, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!("Netbattle Lobby v{} (protocol {})", VERSION, PROTOCOL_VERSION);
    info!("Frame: {} chunks of {} bytes", CHUNK_COUNT, CHUNK_SIZE);

    demo_match().await
}

fn demo_catalog() -> Catalog {
    Catalog::new()
        .with_rom("MEGAMAN6_FXX", "Mega Man Battle Network 6 Cybeast Falzar", "bn6")
        .with_rom("MEGAMAN6_GXX", "Mega Man Battle Network 6 Cybeast Gregar", "bn6")
        .with_rom("ROCKEXE6_GXX", "Rockman EXE 6 Dennoujuu Falzar", "bn6")
        .with_rom("ROCKEXE6_RXX", "Rockman EXE 6 Dennoujuu Gregar", "bn6")
}

/// Catalog from the scanner output named by `NETBATTLE_CATALOG`, or the
/// built-in demo catalog.
fn load_catalog() -> anyhow::Result<Catalog> {
    let Ok(path) = std::env::var("NETBATTLE_CATALOG") else {
        return Ok(demo_catalog());
    };
    let json =
        std::fs::read_to_string(&path).with_context(|| format!("reading catalog {}", path))?;
    let catalog = Catalog::from_json(&json).with_context(|| format!("parsing catalog {}", path))?;
    info!("Loaded catalog from {} ({} roms)", path, catalog.roms.len());
    Ok(catalog)
}

fn write_demo_save(dir: &Path, name: &str, seed: u8) -> anyhow::Result<PathBuf> {
    let bytes: Vec<u8> = (0..32 * 1024u32)
        .map(|i| seed.wrapping_add((i / 256) as u8))
        .collect();
    let path = dir.join(name);
    std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Negotiate one match between two local peers.
async fn demo_match() -> anyhow::Result<()> {
    info!("=== Starting Demo Negotiation ===");

    let config = SessionConfig::from_env();
    let catalog = Arc::new(load_catalog()?);
    let dir = std::env::temp_dir().join(format!("netbattle-demo-{}", std::process::id()));
    std::fs::create_dir_all(&dir).context("creating demo directory")?;

    let (a_bridge, a_core) = channel_bridge(64);
    let (b_bridge, b_core) = channel_bridge(64);
    let relay = spawn_loopback(a_core, b_core, RelayOptions::default());

    let host = spawn_session(
        &config,
        Arc::clone(&catalog),
        MatchRequest {
            pairing_code: "demo".into(),
            game: Some(GameSelection::rom("MEGAMAN6_FXX")),
            save_path: Some(write_demo_save(&dir, "host.sav", 0x10)?),
        },
        a_bridge,
    )?;
    let guest_config = SessionConfig {
        display_name: format!("{}-guest", config.display_name),
        ..config.clone()
    };
    let guest = spawn_session(
        &guest_config,
        catalog,
        MatchRequest {
            pairing_code: "DEMO".into(),
            game: Some(GameSelection::rom("ROCKEXE6_RXX")),
            save_path: Some(write_demo_save(&dir, "guest.sav", 0x80)?),
        },
        b_bridge,
    )?;

    for handle in [&host, &guest] {
        let mut snapshots = handle.subscribe();
        snapshots
            .wait_for(|s| s.opponent_settings.is_some())
            .await
            .context("session ended before settings arrived")?;
    }
    info!("Settings exchanged: {}", host.snapshot().to_json()?);

    host.set_ready(true).await?;
    guest.set_ready(true).await?;

    let host = host.join().await?;
    let guest = guest.join().await?;
    let report = relay.await?;
    info!("Relay carried {} payloads", report.relayed);

    let (SessionOutcome::Launched(host), SessionOutcome::Launched(guest)) = (host, guest) else {
        bail!("expected both peers to launch a negotiated match");
    };
    let (Some(h), Some(g)) = (&host.start.negotiated, &guest.start.negotiated) else {
        bail!("negotiated parameters missing");
    };

    info!("=== Match Launched ===");
    info!("Host:  {} vs {}", host.start.game, h.opponent_game);
    info!("Guest: {} vs {}", guest.start.game, g.opponent_game);
    info!("Shared Seed: {}", h.shared_seed);

    if h.shared_seed == g.shared_seed {
        info!("SEED AGREED: both peers derived the same seed");
    } else {
        bail!("seed mismatch: {} vs {}", h.shared_seed, g.shared_seed);
    }

    std::fs::remove_dir_all(&dir).context("removing demo directory")?;
    Ok(())
}
