#![cfg(not(tarpaulin_include))]

use clap::Parser;
use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Write a sample line-delimited JSON file for the data page
#[derive(Parser, Debug)]
#[command(about)]
struct Args {
    /// Number of records
    #[arg(short, long, default_value_t = 5_000_000)]
    lines: usize,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let path = args.out_dir.join(format!("my_data_{}.txt", args.lines));
    let mut out = BufWriter::new(File::create(&path)?);

    // One tenth of the records covers a half period of y1.
    let step = PI / (args.lines as f64 / 10.0);
    for i in 0..args.lines {
        let omega = step * i as f64;
        let record = serde_json::json!({
            "omega": omega,
            "y1": omega.sin(),
            "y2": (2.0 * omega).cos(),
        });
        serde_json::to_writer(&mut out, &record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    println!("wrote {} records to {}", args.lines, path.display());
    Ok(())
}
