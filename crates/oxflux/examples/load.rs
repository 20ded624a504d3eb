//! Load one model part from a records file and print what came out.
//!
//! ```sh
//! cargo run --example load --release -- --models models.yaml --key flux-dev --submodel transformer
//! cargo run --example load --release -- --config oxflux.yaml --models models.yaml --key t5 --submodel text_encoder_2
//! ```

use std::io;
use std::time::Instant;

use oxflux::{load_model, AnyModel, LoaderConfig, ModelRecords, SubModelType};

struct Args {
    config: Option<String>,
    models: String,
    key: Option<String>,
    submodel: Option<SubModelType>,
}

fn parse_args() -> Args {
    let mut args = Args {
        config: None,
        models: "models.yaml".to_string(),
        key: None,
        submodel: None,
    };

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < raw.len() {
        match raw[i].as_str() {
            "--config" => {
                i += 1;
                args.config = Some(raw[i].clone());
            }
            "--models" => {
                i += 1;
                args.models = raw[i].clone();
            }
            "--key" => {
                i += 1;
                args.key = Some(raw[i].clone());
            }
            "--submodel" => {
                i += 1;
                args.submodel = Some(serde_yaml::from_str(&raw[i]).expect("invalid --submodel"));
            }
            "-h" | "--help" => {
                eprintln!(
                    "oxflux load: construct a FLUX model part

Usage: cargo run --example load --release -- [options]

Options:
  --config <path>        Loader config YAML (default: $OXFLUX_ROOT or the data dir)
  --models <path>        Model records YAML (default: models.yaml)
  --key <key>            Record to load (default: list records and exit)
  --submodel <name>      transformer, vae, tokenizer, text_encoder, tokenizer_2, text_encoder_2
  -h, --help             Show this help"
                );
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
        i += 1;
    }
    args
}

fn main() -> oxflux::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oxflux=info".parse().unwrap()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = parse_args();

    let app = match &cli.config {
        Some(path) => LoaderConfig::from_yaml_file(path)?,
        None => LoaderConfig::default(),
    };
    let records = ModelRecords::from_yaml_file(&cli.models, &app)?;

    let Some(key) = cli.key else {
        for config in records.iter() {
            println!(
                "{:24} {:>6} {:>12} {:>20}  {}",
                config.key(),
                config.base(),
                config.model_type(),
                config.format(),
                config.path().display()
            );
        }
        return Ok(());
    };

    let Some(config) = records.get(&key) else {
        eprintln!("No record named {key} in {}", cli.models);
        std::process::exit(1);
    };

    let t0 = Instant::now();
    let model = load_model(&app, config, cli.submodel)?;
    let elapsed = t0.elapsed().as_secs_f64();

    match &model {
        AnyModel::ClipTokenizer(tok) => println!("CLIP tokenizer, max_length {}", tok.max_length()),
        AnyModel::T5Tokenizer(tok) => println!("T5 tokenizer, max_length {}", tok.max_length()),
        _ => {}
    }
    if let Some(module) = model.as_module() {
        println!(
            "{}: {} parameters, {:.1} MiB resident",
            model.kind(),
            module.num_parameters(),
            module.layers().materialized_bytes() as f64 / (1024.0 * 1024.0)
        );
    }
    println!("loaded in {elapsed:.2}s");
    Ok(())
}
