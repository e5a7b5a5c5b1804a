//! Developer utility to train and export the logistic regression augment head
//! from exported pixel features.

use std::path::PathBuf;

use glacier_tool::app_dirs;
use glacier_tool::config;
use glacier_tool::ml::argmax;
use glacier_tool::ml::logreg::{AUGMENT_MODEL_FILE, LogRegModel, TrainDataset, TrainOptions, train_logreg};
use glacier_tool::ml::metrics::{ConfusionMatrix, accuracy, precision_recall_by_class};
use glacier_tool::npy;
use ndarray::{Array2, Axis, Ix2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args(std::env::args().skip(1).collect())?;
    let x = npy::read_npy(&options.features)
        .and_then(|array| array.into_f32())
        .map_err(|err| err.to_string())?
        .into_dimensionality::<Ix2>()
        .map_err(|_| "Features must be a (rows, features) array".to_string())?;
    let y = npy::read_npy(&options.labels)
        .and_then(|array| array.into_labels())
        .map_err(|err| err.to_string())?;
    if x.nrows() != y.len() {
        return Err(format!(
            "{} feature rows but {} labels",
            x.nrows(),
            y.len()
        ));
    }
    let num_classes = options
        .num_classes
        .unwrap_or_else(|| y.iter().max().map_or(0, |max| max + 1));

    let config = match options.config.as_ref() {
        Some(path) => config::load_from(path),
        None => config::load_or_default(),
    }
    .map_err(|err| err.to_string())?;
    let train_options = options.overrides.apply(config.augment);

    let (train, test) = split_holdout(&x, &y, num_classes, options.test_fraction, train_options.seed);
    println!(
        "training on {} rows, evaluating on {} rows, {} classes",
        train.y.len(),
        test.y.len(),
        num_classes
    );
    let model = train_logreg(&train, &train_options)?;
    let model_out = match options.model_out {
        Some(path) => path,
        None => app_dirs::models_dir()
            .map_err(|err| err.to_string())?
            .join(AUGMENT_MODEL_FILE),
    };
    model.save_json(&model_out)?;
    println!("wrote {}", model_out.display());

    let eval = if test.y.is_empty() { &train } else { &test };
    report(&model, eval)
}

fn report(model: &LogRegModel, eval: &TrainDataset) -> Result<(), String> {
    let proba = model.predict_proba_rows(eval.x.view())?;
    let predicted: Vec<usize> = proba
        .axis_iter(Axis(0))
        .map(|row| argmax(&row.to_vec()))
        .collect();
    let cm = ConfusionMatrix::from_labels(eval.num_classes, &eval.y, &predicted);
    println!("accuracy: {:.4}", accuracy(&cm));
    for (idx, stats) in precision_recall_by_class(&cm).iter().enumerate() {
        println!(
            "class {:>2}  precision={:.3}  recall={:.3}  f1={:.3}  support={}",
            idx,
            stats.precision,
            stats.recall,
            stats.f1(),
            stats.support
        );
    }
    println!("confusion matrix (rows=true, cols=pred):");
    for truth in 0..cm.n_classes {
        let mut row = String::new();
        for pred in 0..cm.n_classes {
            row.push_str(&format!("{:8}", cm.get(truth, pred)));
        }
        println!("{row}");
    }
    Ok(())
}

fn split_holdout(
    x: &Array2<f32>,
    y: &[usize],
    num_classes: usize,
    test_fraction: f32,
    seed: u64,
) -> (TrainDataset, TrainDataset) {
    let mut order: Vec<usize> = (0..y.len()).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let test_len = ((y.len() as f32) * test_fraction).round() as usize;
    let (test_idx, train_idx) = order.split_at(test_len.min(order.len()));
    let take = |idx: &[usize]| TrainDataset {
        num_classes,
        x: x.select(Axis(0), idx),
        y: idx.iter().map(|&i| y[i]).collect(),
    };
    (take(train_idx), take(test_idx))
}

#[derive(Debug, Clone)]
struct CliOptions {
    features: PathBuf,
    labels: PathBuf,
    config: Option<PathBuf>,
    model_out: Option<PathBuf>,
    num_classes: Option<usize>,
    test_fraction: f32,
    overrides: TrainOverrides,
}

/// Command line values that take precedence over the `[augment]` section.
#[derive(Debug, Clone, Default)]
struct TrainOverrides {
    epochs: Option<usize>,
    learning_rate: Option<f32>,
    l2: Option<f32>,
    batch_size: Option<usize>,
    seed: Option<u64>,
    balance_classes: bool,
}

impl TrainOverrides {
    fn apply(&self, mut base: TrainOptions) -> TrainOptions {
        if let Some(epochs) = self.epochs {
            base.epochs = epochs;
        }
        if let Some(learning_rate) = self.learning_rate {
            base.learning_rate = learning_rate;
        }
        if let Some(l2) = self.l2 {
            base.l2 = l2;
        }
        if let Some(batch_size) = self.batch_size {
            base.batch_size = batch_size;
        }
        if let Some(seed) = self.seed {
            base.seed = seed;
        }
        base.balance_classes |= self.balance_classes;
        base
    }
}

fn parse_args(args: Vec<String>) -> Result<CliOptions, String> {
    let mut features: Option<PathBuf> = None;
    let mut labels: Option<PathBuf> = None;
    let mut config: Option<PathBuf> = None;
    let mut model_out: Option<PathBuf> = None;
    let mut num_classes: Option<usize> = None;
    let mut test_fraction = 0.2f32;
    let mut overrides = TrainOverrides::default();

    let mut idx = 0usize;
    while idx < args.len() {
        let flag = args[idx].as_str();
        match flag {
            "-h" | "--help" => return Err(help_text()),
            "--balance" => overrides.balance_classes = true,
            _ => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| format!("{flag} requires a value"))?;
                let invalid = || format!("Invalid {flag} value: {value}");
                match flag {
                    "--features" => features = Some(PathBuf::from(value)),
                    "--labels" => labels = Some(PathBuf::from(value)),
                    "--config" => config = Some(PathBuf::from(value)),
                    "--out" => model_out = Some(PathBuf::from(value)),
                    "--classes" => num_classes = Some(value.parse().map_err(|_| invalid())?),
                    "--test-fraction" => {
                        test_fraction = value.parse().map_err(|_| invalid())?;
                        if !(0.0..1.0).contains(&test_fraction) {
                            return Err(invalid());
                        }
                    }
                    "--epochs" => overrides.epochs = Some(value.parse().map_err(|_| invalid())?),
                    "--learning-rate" => {
                        overrides.learning_rate = Some(value.parse().map_err(|_| invalid())?)
                    }
                    "--l2" => overrides.l2 = Some(value.parse().map_err(|_| invalid())?),
                    "--batch-size" => {
                        overrides.batch_size =
                            Some(value.parse::<usize>().map_err(|_| invalid())?.max(1))
                    }
                    "--seed" => overrides.seed = Some(value.parse().map_err(|_| invalid())?),
                    unknown => {
                        return Err(format!("Unknown argument: {unknown}\n\n{}", help_text()));
                    }
                }
            }
        }
        idx += 1;
    }

    Ok(CliOptions {
        features: features.ok_or_else(|| format!("--features is required\n\n{}", help_text()))?,
        labels: labels.ok_or_else(|| format!("--labels is required\n\n{}", help_text()))?,
        config,
        model_out,
        num_classes,
        test_fraction,
        overrides,
    })
}

fn help_text() -> String {
    [
        "glacier-train-augment",
        "",
        "Train the augment head on (rows, features) and (rows,) label arrays.",
        "",
        "Usage:",
        "  glacier-train-augment --features <x.npy> --labels <y.npy> [options]",
        "",
        "Training options default to the [augment] section of the config file.",
        "",
        "Options:",
        "  --config <config.toml>   Config file (default: app config dir)",
        "  --out <model.json>       Output path (default: models dir)",
        "  --classes <n>            Class count (default: max label + 1)",
        "  --test-fraction <f>      Held-out fraction (default: 0.2)",
        "  --epochs <n>             Training epochs (default: from config)",
        "  --learning-rate <f>      SGD learning rate (default: from config)",
        "  --l2 <f>                 L2 penalty (default: from config)",
        "  --batch-size <n>         Mini-batch size (default: from config)",
        "  --seed <n>               Shuffle seed (default: from config)",
        "  --balance                Weight classes by inverse frequency",
    ]
    .join("\n")
}
