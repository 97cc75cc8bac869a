use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use isobmff::{Mp4Reader, TrackSampleTable};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mp4samples", about = "Print the per-sample table of every MP4 track")]
struct Args {
    /// Input MP4 file
    input: PathBuf,

    /// Filter by track-id (default: all tracks)
    #[arg(long)]
    track_id: Option<u32>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Limit number of samples printed per track
    #[arg(long)]
    limit: Option<usize>,

    /// Show decode and presentation times
    #[arg(long)]
    timing: bool,

    /// Show fragment numbers and sample group membership
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let reader = Mp4Reader::open(&args.input)
        .with_context(|| format!("parsing {}", args.input.display()))?;

    let tracks: Vec<&TrackSampleTable> = reader
        .tables()
        .iter()
        .filter(|t| args.track_id.is_none_or(|tid| t.track_id == tid))
        .collect();

    if args.json {
        print_json(&reader, &tracks, &args)
    } else {
        print_text(&tracks, &args);
        Ok(())
    }
}

fn print_json(reader: &Mp4Reader, tracks: &[&TrackSampleTable], args: &Args) -> Result<()> {
    let value = json!({
        "type": reader.mp4_type(),
        "tracks": tracks.iter().map(|t| {
            let limit = args.limit.unwrap_or(usize::MAX);
            json!({
                "track_id": t.track_id,
                "handler_type": t.handler.to_string(),
                "coding_name": t.coding_name.to_string(),
                "timescale": t.timescale,
                "duration": t.duration(),
                "sample_count": t.samples.len(),
                "samples": t.samples.iter().take(limit).collect::<Vec<_>>(),
            })
        }).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_text(tracks: &[&TrackSampleTable], args: &Args) {
    for t in tracks {
        println!(
            "Track {} ({}/{}) timescale={} duration={} sample_count={}",
            t.track_id,
            t.handler,
            t.coding_name,
            t.timescale,
            t.duration(),
            t.samples.len()
        );

        if args.timing {
            println!("idx    DTS(ts)    PTS(ts)    start(s)   dur(ts)  size   offset      sync");
            println!("-------------------------------------------------------------------------");
        } else {
            println!("idx    start(s)   dur(ts)  size   offset      sync");
            println!("----------------------------------------------------");
        }

        let scale = t.timescale.max(1) as f64;
        for (idx, s) in t.samples.iter().enumerate().take(args.limit.unwrap_or(usize::MAX)) {
            let start = s.dts as f64 / scale;
            let sync = if s.is_sync { "*" } else { "" };
            if args.timing {
                let pts = s.pts().map_or_else(|| "-".to_string(), |p| p.to_string());
                print!(
                    "{idx:5} {:10} {pts:>10} {start:10.4} {:8} {:6} {:10} {sync}",
                    s.dts, s.duration, s.size, s.offset
                );
            } else {
                print!(
                    "{idx:5} {start:10.4} {:8} {:6} {:10} {sync}",
                    s.duration, s.size, s.offset
                );
            }
            if args.verbose {
                print!("  frag={}", s.fragment_number);
                for (typ, g) in &s.sample_groups {
                    print!(" {typ}={}", g.description_index);
                }
            }
            println!();
        }
        println!();
    }
}
