//! Summarise a training index: rows per split and, optionally, a look at the
//! first few items of one split.

use std::collections::BTreeMap;
use std::path::PathBuf;

use glacier_tool::dataset::{GlacierDataset, split_counts};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args(std::env::args().skip(1).collect())?;
    let index_path = options.base_dir.join(&options.index);
    let counts = split_counts(&index_path).map_err(|err| err.to_string())?;
    println!("{}", index_path.display());
    for (split, count) in &counts {
        println!("  {split:<8} {count}");
    }

    let Some(mode) = options.mode else {
        return Ok(());
    };
    let dataset = GlacierDataset::open(&options.base_dir, &options.index, &mode, options.borders)
        .map_err(|err| err.to_string())?;
    let mut class_pixels: BTreeMap<u8, usize> = BTreeMap::new();
    for (idx, item) in dataset.iter().take(options.limit).enumerate() {
        let item = item.map_err(|err| err.to_string())?;
        let (channels, height, width) = item.image.dim();
        println!(
            "  [{idx}] {} image {channels}x{height}x{width} mask {:?}",
            dataset.records()[idx].img_path.display(),
            item.mask.shape()
        );
        for &value in item.mask.iter() {
            *class_pixels.entry(value).or_insert(0) += 1;
        }
    }
    if !class_pixels.is_empty() {
        println!("mask pixels per class:");
        for (class, pixels) in class_pixels {
            println!("  {class:>3} {pixels}");
        }
    }
    Ok(())
}

#[derive(Debug)]
struct CliOptions {
    base_dir: PathBuf,
    index: PathBuf,
    mode: Option<String>,
    borders: bool,
    limit: usize,
}

fn parse_args(args: Vec<String>) -> Result<CliOptions, String> {
    let mut base_dir = PathBuf::from(".");
    let mut index: Option<PathBuf> = None;
    let mut mode: Option<String> = None;
    let mut borders = false;
    let mut limit = 5usize;

    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "-h" | "--help" => return Err(help_text()),
            "--base-dir" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = PathBuf::from(value);
            }
            "--index" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--index requires a value".to_string())?;
                index = Some(PathBuf::from(value));
            }
            "--mode" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--mode requires a value".to_string())?;
                mode = Some(value.clone());
            }
            "--borders" => borders = true,
            "--limit" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--limit requires a value".to_string())?;
                limit = value
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid --limit value: {value}"))?;
            }
            unknown => return Err(format!("Unknown argument: {unknown}\n\n{}", help_text())),
        }
        idx += 1;
    }

    Ok(CliOptions {
        base_dir,
        index: index.ok_or_else(|| format!("--index is required\n\n{}", help_text()))?,
        mode,
        borders,
        limit,
    })
}

fn help_text() -> String {
    [
        "glacier-dataset-inspect",
        "",
        "Usage:",
        "  glacier-dataset-inspect --index <data.csv> [--base-dir <dir>]",
        "                          [--mode <split>] [--borders] [--limit <n>]",
    ]
    .join("\n")
}
