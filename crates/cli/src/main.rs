use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

use epub_optimizer_core::config::{config_path, load_config, load_config_from, AppConfig, OptimizeOptions};
use epub_optimizer_core::error::OptimizeError;
use epub_optimizer_core::pipeline::{optimize, OptimizeReport, PipelineState};
use epub_optimizer_core::progress::{ProgressEvent, ProgressHandler};
use epub_optimizer_core::validate::ValidationOutcome;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "epub-optimizer")]
#[command(about = "Shrink EPUB files and repair their structure")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log per-file detail
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize an EPUB file
    Optimize(OptimizeArgs),

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct OptimizeArgs {
    /// Input EPUB file
    #[arg(short, long)]
    input: PathBuf,

    /// Output EPUB file (default: <input>_optimized.epub next to the input)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Working directory for the extracted book
    #[arg(short, long)]
    temp: Option<PathBuf>,

    /// Remove the working directory after a successful run
    #[arg(long)]
    clean: bool,

    /// JPEG quality (0-100)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    jpg_quality: Option<u8>,

    /// PNG quality as one or two fractions (min [max]), 0-1
    #[arg(long, num_args = 1..=2, value_parser = parse_fraction)]
    png_quality: Option<Vec<f32>>,

    /// Language of the injected cover label (e.g. en, fr)
    #[arg(long)]
    lang: Option<String>,

    /// Path to epubcheck.jar
    #[arg(long)]
    epubcheck: Option<PathBuf>,

    /// Skip validation of the output
    #[arg(long)]
    no_validate: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Initialize default config file
    Init,
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Key (dot-separated path)
        key: String,
        /// Value
        value: String,
    },
}

fn parse_fraction(s: &str) -> Result<f32, String> {
    let value: f32 = s.parse().map_err(|_| format!("`{s}` is not a number"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("`{s}` is not between 0 and 1"))
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match &cli.command {
        Commands::Optimize(args) => run_optimize(args, cli.config.as_deref(), cli.json),
        Commands::Config { action } => run_config(action, cli.config.as_deref(), cli.json).map_err(|e| {
            eprintln!("Error: {}", e);
            1
        }),
    };

    if let Err(code) = result {
        std::process::exit(code);
    }
}

struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(PipelineState::TOTAL_STEPS);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar }
    }
}

impl ProgressHandler for BarProgress {
    fn on_progress(&self, event: ProgressEvent) {
        match event.state {
            PipelineState::Done => self.bar.finish_and_clear(),
            PipelineState::Failed => self.bar.abandon_with_message("Failed"),
            state => {
                self.bar.set_length(event.total_steps);
                self.bar.set_position(event.step);
                match event.message {
                    Some(detail) => self.bar.set_message(format!("{state}: {detail}")),
                    None => self.bar.set_message(state.to_string()),
                }
            }
        }
    }
}

fn build_options(args: &OptimizeArgs, cfg: &AppConfig) -> OptimizeOptions {
    let output = args.output.clone().unwrap_or_else(|| default_output(&args.input));
    let mut opts = OptimizeOptions::new(&args.input, output, cfg);
    opts.work_dir = args.temp.clone();
    opts.clean |= args.clean;
    if let Some(q) = args.jpg_quality {
        opts.images.jpeg_quality = q;
    }
    if let Some(q) = &args.png_quality {
        let min = q[0];
        let max = q.get(1).copied().unwrap_or(opts.images.png_quality[1]).max(min);
        opts.images.png_quality = [min, max];
    }
    if let Some(lang) = &args.lang {
        opts.cover.lang = lang.clone();
    }
    if let Some(jar) = &args.epubcheck {
        opts.validate.epubcheck_path = jar.clone();
    }
    if args.no_validate {
        opts.validate.enabled = false;
    }
    opts
}

fn default_output(input: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("book");
    input
        .parent()
        .unwrap_or(Path::new("."))
        .join(format!("{stem}_optimized.epub"))
}

/// Returns the process exit code on failure.
fn run_optimize(args: &OptimizeArgs, config: Option<&Path>, json: bool) -> Result<(), i32> {
    let cfg = match config {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    let opts = build_options(args, &cfg);

    let progress = (!json).then(BarProgress::new);
    let report = optimize(&opts, progress.as_ref().map(|p| p as &dyn ProgressHandler))
        .map_err(|e| report_error(&e))?;

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                eprintln!("Error: {}", e);
                return Err(1);
            }
        }
    } else {
        print_summary(&report);
    }

    report.check_validation().map_err(|e| report_error(&e))
}

fn report_error(e: &OptimizeError) -> i32 {
    eprintln!("Error: {}", e);
    e.exit_code()
}

fn print_summary(report: &OptimizeReport) {
    println!("Created optimized EPUB: {}", report.output.display());
    for stage in &report.stages {
        if !stage.failed.is_empty() {
            println!("  {}: {} file(s) skipped after errors", stage.stage, stage.failed.len());
        }
    }
    match &report.validation {
        ValidationOutcome::Passed => println!("EPUB validation passed."),
        ValidationOutcome::Failed { code } => println!("EPUB validation failed (exit code {code})."),
        ValidationOutcome::Skipped { reason } => println!("Validation skipped: {reason}"),
    }
    match &report.work_dir {
        Some(dir) => println!(
            "Kept temporary directory {} for inspection. Use --clean to remove it.",
            dir.display()
        ),
        None => println!("Removed temporary directory."),
    }
    println!();
    println!("{}", report.size);
}

fn run_config(action: &ConfigAction, config: Option<&Path>, json: bool) -> CliResult<()> {
    let path = match config {
        Some(p) => p.to_path_buf(),
        None => config_path().ok_or("Could not determine config directory")?,
    };
    match action {
        ConfigAction::Init => {
            write_config(&path, &AppConfig::default())?;
            println!("Wrote default config to {}", path.display());
        }
        ConfigAction::Show => {
            let cfg = load_config_from(&path);
            if json {
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            } else {
                println!("{}", toml::to_string_pretty(&cfg)?);
            }
        }
        ConfigAction::Set { key, value } => {
            let mut cfg = load_config_from(&path);
            set_config_key(&mut cfg, key, value)?;
            write_config(&path, &cfg)?;
            if !json {
                println!("Updated {}", key);
            }
        }
    }
    Ok(())
}

fn write_config(path: &Path, cfg: &AppConfig) -> CliResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(cfg)?)?;
    Ok(())
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> CliResult<T> {
    value
        .parse()
        .map_err(|_| format!("Invalid value for {}: {}", key, value).into())
}

fn set_config_key(cfg: &mut AppConfig, key: &str, value: &str) -> CliResult<()> {
    let parts: Vec<&str> = key.splitn(2, '.').collect();
    match parts.as_slice() {
        ["clean"] => cfg.clean = parse_value(key, value)?,
        ["images", sub] => match *sub {
            "jpeg_quality" => cfg.images.jpeg_quality = parse_value(key, value)?,
            "png_quality" => {
                let pair: Vec<f32> = value
                    .split(',')
                    .map(|v| parse_fraction(v.trim()))
                    .collect::<Result<_, _>>()?;
                match pair.as_slice() {
                    [min, max] if min <= max => cfg.images.png_quality = [*min, *max],
                    _ => return Err(format!("{} expects `min,max`", key).into()),
                }
            }
            "png_convert_min_bytes" => cfg.images.png_convert_min_bytes = parse_value(key, value)?,
            "recompress_min_bytes" => cfg.images.recompress_min_bytes = parse_value(key, value)?,
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        ["html", sub] => match *sub {
            "collapse_whitespace" => cfg.html.collapse_whitespace = parse_value(key, value)?,
            "remove_comments" => cfg.html.remove_comments = parse_value(key, value)?,
            "minify_css" => cfg.html.minify_css = parse_value(key, value)?,
            "minify_js" => cfg.html.minify_js = parse_value(key, value)?,
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        ["cover", sub] => match *sub {
            "lang" => cfg.cover.lang = value.to_string(),
            "default_lang" => cfg.cover.default_lang = value.to_string(),
            "fix_linear" => cfg.cover.fix_linear = parse_value(key, value)?,
            "fix_cover_image_property" => cfg.cover.fix_cover_image_property = parse_value(key, value)?,
            "inject_toc_entry" => cfg.cover.inject_toc_entry = parse_value(key, value)?,
            label if label.starts_with("labels.") => {
                let lang = &label["labels.".len()..];
                cfg.cover.labels.insert(lang.to_string(), value.to_string());
            }
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        ["validate", sub] => match *sub {
            "enabled" => cfg.validate.enabled = parse_value(key, value)?,
            "epubcheck_path" => cfg.validate.epubcheck_path = PathBuf::from(value),
            "java" => cfg.validate.java = value.to_string(),
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        ["security", sub] => match *sub {
            "max_file_count" => cfg.security.max_file_count = parse_value(key, value)?,
            "max_total_size_bytes" => cfg.security.max_total_size_bytes = parse_value(key, value)?,
            _ => return Err(format!("Unknown key: {}", key).into()),
        },
        _ => return Err(format!("Unknown key: {}", key).into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(extra: &[&str]) -> OptimizeArgs {
        let mut argv = vec!["epub-optimizer", "optimize", "-i", "books/novel.epub"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Optimize(a) => a,
            Commands::Config { .. } => unreachable!(),
        }
    }

    #[test]
    fn flags_override_config() {
        let opts = build_options(
            &args(&["--jpg-quality", "85", "--png-quality", "0.7", "--lang", "fr", "--no-validate"]),
            &AppConfig::default(),
        );
        assert_eq!(opts.output, PathBuf::from("books/novel_optimized.epub"));
        assert_eq!(opts.images.jpeg_quality, 85);
        assert_eq!(opts.images.png_quality, [0.7, 0.8]);
        assert_eq!(opts.cover.cover_label(), "Couverture");
        assert!(!opts.validate.enabled);
        assert_eq!(opts.work_dir(), PathBuf::from("books/novel_epub_work"));
    }

    #[test]
    fn png_quality_pair_is_ordered() {
        let opts = build_options(&args(&["--png-quality", "0.9", "0.5"]), &AppConfig::default());
        assert_eq!(opts.images.png_quality, [0.9, 0.9]);
    }

    #[test]
    fn out_of_range_fraction_rejected() {
        assert!(Cli::try_parse_from(["epub-optimizer", "optimize", "-i", "a.epub", "--png-quality", "1.5"]).is_err());
        assert!(Cli::try_parse_from(["epub-optimizer", "optimize", "-i", "a.epub", "--jpg-quality", "101"]).is_err());
    }

    #[test]
    fn config_keys_are_set() {
        let mut cfg = AppConfig::default();
        set_config_key(&mut cfg, "images.png_quality", "0.5, 0.9").unwrap();
        set_config_key(&mut cfg, "cover.labels.de", "Umschlag").unwrap();
        set_config_key(&mut cfg, "validate.enabled", "false").unwrap();
        assert_eq!(cfg.images.png_quality, [0.5, 0.9]);
        assert_eq!(cfg.cover.labels.get("de").map(String::as_str), Some("Umschlag"));
        assert!(!cfg.validate.enabled);
        assert!(set_config_key(&mut cfg, "images.nope", "1").is_err());
        assert!(set_config_key(&mut cfg, "clean", "maybe").is_err());
    }
}
