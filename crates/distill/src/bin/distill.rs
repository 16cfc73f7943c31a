use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use distill::{DistillConfig, DistillError, Trainer};
use serde_json::{Map, Number, Value};

fn main() {
    if let Err(err) = run() {
        eprintln!("distillation failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Distill dense attention into Perlin attention", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to a TOML or JSON config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Resume from the latest checkpoint if available")]
    resume: bool,

    #[arg(long, value_name = "N", help = "Shorthand for perlin.k")]
    k: Option<usize>,

    #[arg(
        long = "predictor-length",
        value_name = "N",
        help = "Shorthand for perlin.attention_predictor_length"
    )]
    predictor_length: Option<usize>,

    #[arg(long, value_name = "F", help = "Shorthand for perlin.performer_nb_factor")]
    nbf: Option<f64>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), DistillError> {
    let args = Args::parse();

    let mut config = DistillConfig::load(&args.config)?;
    let overrides = shorthand_overrides(&args)
        .into_iter()
        .chain(args.overrides.iter().cloned())
        .collect::<Vec<_>>();
    if !overrides.is_empty() {
        config = apply_overrides(config, &overrides)?;
    }
    config.validate()?;

    let mut trainer = Trainer::new(config)?;
    if args.resume {
        match trainer.resume_from_latest()? {
            Some(descriptor) => println!(
                "resumed from checkpoint {} (step {})",
                descriptor.directory.display(),
                descriptor.manifest.progress.optimizer_step
            ),
            None => println!("no checkpoint found, starting from scratch"),
        }
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| DistillError::runtime(format!("failed to install signal handler: {err}")))?;

    trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;

    let summary = trainer.evaluate(None)?;
    println!(
        "final evaluation after {} steps: context_mse={:.5} probs_mse={:.6}",
        trainer.optimizer_steps(),
        summary.context_mse,
        summary.probs_mse
    );
    Ok(())
}

/// Shorthand flags are applied before explicit overrides so the latter win.
fn shorthand_overrides(args: &Args) -> Vec<OverrideArg> {
    let mut out = Vec::new();
    let mut push = |path: &str, value: Option<String>| {
        if let Some(value) = value {
            out.push(OverrideArg {
                path: path.to_string(),
                value,
            });
        }
    };
    push("perlin.k", args.k.map(|k| k.to_string()));
    push(
        "perlin.attention_predictor_length",
        args.predictor_length.map(|n| n.to_string()),
    );
    push("perlin.performer_nb_factor", args.nbf.map(|f| f.to_string()));
    out
}

fn apply_overrides(
    config: DistillConfig,
    overrides: &[OverrideArg],
) -> Result<DistillConfig, DistillError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        DistillError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let segments = override_arg
            .path
            .split('.')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>();
        if segments.is_empty() {
            return Err(DistillError::runtime("override path must not be empty"));
        }
        assign_at_path(&mut value, &segments, parse_override_value(&override_arg.value))?;
    }

    serde_json::from_value(value).map_err(|err| {
        DistillError::runtime(format!("failed to deserialize config after overrides: {err}"))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn assign_at_path(target: &mut Value, segments: &[&str], new_value: Value) -> Result<(), DistillError> {
    let Some((head, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };
    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return Err(DistillError::runtime(format!(
            "override path segment '{head}' points into a non-object value"
        )));
    };
    let entry = map.entry(head.to_string()).or_insert(Value::Null);
    assign_at_path(entry, rest, new_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(path: &str, value: &str) -> OverrideArg {
        OverrideArg {
            path: path.into(),
            value: value.into(),
        }
    }

    #[test]
    fn overrides_reach_nested_sections() {
        let config = apply_overrides(
            DistillConfig::default(),
            &[
                arg("perlin.k", "7"),
                arg("perlin.attention_predictor_method", "comp"),
                arg("runtime.max_steps", "12"),
                arg("data.causal", "true"),
            ],
        )
        .unwrap();
        assert_eq!(config.perlin.k, 7);
        assert_eq!(config.runtime.max_steps, Some(12));
        assert!(config.data.causal);
    }

    #[test]
    fn explicit_override_beats_shorthand() {
        let args = Args::parse_from(["distill", "--config", "x.toml", "--k", "3", "--override", "perlin.k=5"]);
        let overrides = shorthand_overrides(&args)
            .into_iter()
            .chain(args.overrides.iter().cloned())
            .collect::<Vec<_>>();
        let config = apply_overrides(DistillConfig::default(), &overrides).unwrap();
        assert_eq!(config.perlin.k, 5);
    }
}
