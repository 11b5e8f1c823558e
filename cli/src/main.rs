use std::{io::Write, net::SocketAddr, path::PathBuf};
use anyhow::{Context, Result};
use clap::Parser;
use brine::{MetaInfo, Torrent, TorrentConfig, TorrentEvent, TorrentStats};

#[derive(Parser)]
#[command(name = "brine", about = "Downloads a torrent to a directory")]
struct Args {

    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory to download into
    #[arg(short, long, default_value = "downloads")]
    output: PathBuf,

    /// Listen port for inbound peers
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Maximum concurrent peer sessions
    #[arg(long, default_value_t = 50)]
    max_peers: u32,

    /// Suppress the progress line
    #[arg(short, long)]
    quiet: bool,

    /// Log level: off, error, warn, info, debug, trace
    #[arg(long, default_value = "warn")]
    log: String,

}

#[tokio::main]
async fn main() -> Result<()> {

    let args = Args::parse();

    let level: tracing::Level = args.log.parse().unwrap_or(tracing::Level::WARN);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let metainfo = MetaInfo::new(&args.torrent)
        .with_context(|| format!("failed to load {:?}", args.torrent))?;
    println!(
        "{}  ({}, {} pieces, infohash {})",
        metainfo.name(),
        metainfo.size_fmt(),
        metainfo.num_pieces(),
        metainfo.info_hash_hex(),
    );

    let config = TorrentConfig {
        output_dir: args.output,
        listen_address: SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), args.port),
        min_max_peers: (5, args.max_peers),
        ..Default::default()
    };

    let mut torrent = Torrent::new(metainfo, config)?;
    let mut stats_rx = torrent.stats();
    let mut events = torrent.events().expect("events stream already taken");
    let cancel = torrent.cancellation_token();

    let torrent_task = tokio::spawn(async move { torrent.start().await });

    let mut completed = false;
    loop {
        tokio::select! {

            _ = tokio::signal::ctrl_c() => {
                eprintln!("\ninterrupted, shutting down");
                cancel.cancel();
            },

            event = events.recv() => match event {
                Some(TorrentEvent::DownloadComplete) => {
                    completed = true;
                    cancel.cancel();
                },
                Some(TorrentEvent::Stopped) | None => break,
                Some(TorrentEvent::StorageError { error }) => {
                    eprintln!("\nstorage error: {}", error);
                },
                Some(_) => {},
            },

            changed = stats_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if !args.quiet {
                    print_progress(&stats_rx.borrow());
                }
            },

        }
    }

    torrent_task.await??;
    if !args.quiet {
        println!();
    }
    if completed {
        println!("download complete");
    }
    Ok(())
}

// One line, refreshed in place once a second.
fn print_progress(stats: &TorrentStats) {
    let error = stats
        .last_error
        .as_deref()
        .map(|e| format!("  [{}]", e))
        .unwrap_or_default();
    print!(
        "\r[{:<11}] {:>5.1}%  down {}/s  up {}/s  peers {}/{}  eta {}{}   ",
        stats.state.to_string(),
        stats.progress * 100.0,
        fmt_bytes(stats.down_rate),
        fmt_bytes(stats.up_rate),
        stats.num_connected,
        stats.num_known,
        fmt_eta(stats.eta_secs),
        error,
    );
    std::io::stdout().flush().ok();
}

fn fmt_bytes(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    for next in ["KiB", "MiB", "GiB"] {
        if size >= 1024.0 {
            size /= 1024.0;
            unit = next;
        }
    }
    format!("{:.1} {}", size, unit)
}

fn fmt_eta(eta: Option<u64>) -> String {
    match eta {
        Some(secs) => format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60),
        None => "--:--:--".to_string(),
    }
}
