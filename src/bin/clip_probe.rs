//! clip_probe - one-shot status / clip fetch against clipd.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use clip_relay::{clip::decode_frame_stack, BackoffPolicy, ClipClient};

#[derive(Parser, Debug)]
#[command(author, version, about = "Query a running clipd")]
struct Args {
    /// clipd address.
    #[arg(long, env = "CLIP_SERVER_ADDR", default_value = "127.0.0.1:8765")]
    server_addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print buffer status as JSON.
    Status,
    /// Fetch the next clip (advances the server cursor).
    GetClip {
        /// Write the decoded clip blob here.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut client = ClipClient::new(
        args.server_addr.clone(),
        BackoffPolicy {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(1),
            max_attempts: Some(3),
        },
    );

    match args.command {
        Command::Status => {
            let status = client.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::GetClip { out } => {
            let clip = client.get_clip()?;
            let blob = clip.decode_blob()?;
            println!(
                "clip [{:.3}, {:.3}) duration={:.3}s frames={} gap={:.3}s format={} bytes={}",
                clip.start_timestamp,
                clip.end_timestamp,
                clip.duration,
                clip.frame_count,
                clip.gap_seconds,
                clip.format,
                blob.len()
            );
            if clip.format == "stack" {
                let frames = decode_frame_stack(&blob)?;
                if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
                    println!(
                        "  frames #{}..#{} at {:.3}..{:.3}",
                        first.sequence, last.sequence, first.timestamp, last.timestamp
                    );
                }
            }
            if let Some(path) = out {
                std::fs::write(&path, &blob)
                    .with_context(|| format!("failed to write clip to {}", path.display()))?;
                println!("  written to {}", path.display());
            }
        }
    }
    Ok(())
}
