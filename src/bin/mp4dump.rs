use anyhow::Context;
use clap::{ArgAction, Parser};
use isobmff::dump::{box_nodes, hex_range, render_text, select_by_path};
use isobmff::{FourCC, Mp4Box, Mp4Reader, default_registry};
use std::fs::File;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "MP4/ISOBMFF box explorer")]
struct Args {
    /// MP4/ISOBMFF file path
    path: String,

    /// Only print subtree(s) matching a dotted path (e.g. moov.trak[0].mdia.minf.stbl)
    #[arg(long = "filter")]
    filter: Option<String>,

    /// Hex-dump every box of this fourcc (e.g. --raw stsd)
    #[arg(long = "raw")]
    raw: Option<String>,

    /// Limit recursion depth of the text tree
    #[arg(long, default_value_t = 64)]
    max_depth: usize,

    /// Print decoded payloads
    #[arg(long, action = ArgAction::SetTrue)]
    decode: bool,

    /// Bytes to dump per box with --raw (0 means the whole box)
    #[arg(long, default_value_t = 0)]
    bytes: u64,

    /// Emit JSON instead of the text tree
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let reader = Mp4Reader::open(&args.path).with_context(|| format!("parsing {}", args.path))?;
    let reg = default_registry();

    let targets: Vec<&Mp4Box> = match &args.filter {
        Some(path) => select_by_path(reader.tree(), path)?,
        None => reader.tree().iter().collect(),
    };

    if args.json {
        let owned: Vec<Mp4Box> = targets.into_iter().cloned().collect();
        let nodes = box_nodes(&owned, reg, args.decode);
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }

    for b in &targets {
        print!("{}", render_text(std::slice::from_ref(*b), reg, args.max_depth, args.decode));
    }

    if let Some(sel) = &args.raw {
        let typ = FourCC::from_str(sel).with_context(|| format!("'{sel}' is not a fourcc"))?;
        let mut f = File::open(&args.path)?;
        let file_len = f.metadata()?.len();
        let mut hits = Vec::new();
        for top in reader.tree() {
            if top.typ == typ {
                hits.push(top);
            }
            hits.extend(top.find_all(typ));
        }
        for (i, b) in hits.into_iter().enumerate() {
            let Some(offset) = b.offset else { continue };
            let len = if args.bytes == 0 { b.size() } else { args.bytes.min(b.size()) };
            let dump = hex_range(&mut f, file_len, offset, len)?;
            println!("\n== Dump {i} ({}) offset={:#x}, len={} ==", b.typ, dump.offset, dump.length);
            print!("{}", dump.hex);
        }
    }

    let diag = reader.diagnostics();
    if !diag.is_empty() {
        eprintln!("{} diagnostic(s) while parsing", diag.len());
    }
    Ok(())
}
