//! Backend bootstrap: configuration, logging, imagery layers and seed samples.

use std::path::PathBuf;

use glacier_tool::app_dirs;
use glacier_tool::config::{self, ToolConfig};
use glacier_tool::inference::TileStitcher;
use glacier_tool::layers::LayerRegistry;
use glacier_tool::logging;
use glacier_tool::ml::logreg::{AUGMENT_MODEL_FILE, LogRegModel};
use glacier_tool::session::load_seed_blocks;
use tracing::{info, warn};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args(std::env::args().skip(1).collect())?;
    let mut config = match options.config.as_ref() {
        Some(path) => config::load_from(path),
        None => config::load_or_default(),
    }
    .map_err(|err| err.to_string())?;
    if let Some(root) = options.data_root {
        config.data_root = Some(root);
    }

    if let Err(err) = logging::init(&config.logging) {
        eprintln!("Logging disabled: {err}");
    }
    config
        .validate()
        .map_err(|err| format!("Invalid configuration: {err}"))?;
    let stitcher = TileStitcher::new(&config.inference).map_err(|err| err.to_string())?;
    info!(
        "Inference windows of {}px, {} classes, {} colours, augment head trains for {} epochs",
        stitcher.input_size(),
        config.session.num_classes,
        config.render.color_map.len(),
        config.augment.epochs
    );

    let root = config.data_root.clone().unwrap_or_else(|| PathBuf::from("."));
    let registry = LayerRegistry::load(&root, &config.layers);
    info!(
        "{} of {} data layers can be served",
        registry.servable().count(),
        registry.len()
    );
    for layer in registry.layers() {
        let status = if layer.is_servable() { "ok" } else { "unavailable" };
        println!("{:<24} {:?} {status}", layer.name(), layer.entry.kind);
    }

    report_seed_samples(&config);
    report_augment_head(&config);
    Ok(())
}

fn report_augment_head(config: &ToolConfig) {
    let path = match app_dirs::models_dir() {
        Ok(dir) => dir.join(AUGMENT_MODEL_FILE),
        Err(err) => {
            warn!("Models directory unavailable: {err}");
            return;
        }
    };
    if !path.is_file() {
        return;
    }
    match LogRegModel::load_json(&path) {
        Ok(model) if model.num_classes == config.session.num_classes => {
            info!(
                "Pretrained augment head at {} ({} features)",
                path.display(),
                model.feature_dim
            );
        }
        Ok(model) => warn!(
            "Ignoring augment head at {}: {} classes, expected {}",
            path.display(),
            model.num_classes,
            config.session.num_classes
        ),
        Err(err) => warn!("Ignoring augment head at {}: {err}", path.display()),
    }
}

fn report_seed_samples(config: &ToolConfig) {
    let (Some(features), Some(labels)) = (
        config.session.seed_features.as_ref(),
        config.session.seed_labels.as_ref(),
    ) else {
        if config.session.use_seed_data {
            warn!("use_seed_data is set but no seed_features/seed_labels are configured");
        }
        return;
    };
    let features = config.resolve_data_path(features);
    let labels = config.resolve_data_path(labels);
    match load_seed_blocks(&features, &labels) {
        Ok(blocks) => {
            let rows: usize = blocks.iter().map(|block| block.len()).sum();
            info!("Loaded {rows} seed samples from {}", features.display());
        }
        Err(err) => warn!("Seed samples unavailable: {err}"),
    }
}

#[derive(Debug, Default)]
struct CliOptions {
    config: Option<PathBuf>,
    data_root: Option<PathBuf>,
}

fn parse_args(args: Vec<String>) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "-h" | "--help" => return Err(help_text()),
            "--config" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--config requires a value".to_string())?;
                options.config = Some(PathBuf::from(value));
            }
            "--data-root" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--data-root requires a value".to_string())?;
                options.data_root = Some(PathBuf::from(value));
            }
            unknown => return Err(format!("Unknown argument: {unknown}\n\n{}", help_text())),
        }
        idx += 1;
    }
    Ok(options)
}

fn help_text() -> String {
    [
        "glacier-tool",
        "",
        "Loads the configuration, checks which imagery layers can be served",
        "and verifies the configured seed samples.",
        "",
        "Usage:",
        "  glacier-tool [--config <config.toml>] [--data-root <dir>]",
    ]
    .join("\n")
}
