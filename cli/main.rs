#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::process;

use trireserve::combine::resolve_period_type;
use trireserve::data::load_triangle;
use trireserve::model::{LogLinear, ModelConfig, ModelSummary};
use trireserve::triangle::PeriodKind;
use trireserve::tuning::{GridSearch, ParameterGrid};

#[derive(Args)]
pub struct FitArgs {
    /// Path to a long-format TSV triangle with accident_period, development_period, value columns
    pub triangle: PathBuf,

    /// TOML model configuration; command-line flags override its values
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Name recorded in the saved summary
    #[arg(long, default_value = "loglinear")]
    pub id: String,

    /// Regularization strength; with --l1-ratio skips the hyperparameter search
    #[arg(long)]
    pub alpha: Option<f64>,

    /// Elastic-net mixing ratio in [0, 1]
    #[arg(long)]
    pub l1_ratio: Option<f64>,

    /// Iteration cap for coordinate descent
    #[arg(long)]
    pub max_iter: Option<usize>,

    /// Add calendar-trend parameters
    #[arg(long)]
    pub calendar: bool,

    /// Fit on the raw log-response instead of its z-score
    #[arg(long)]
    pub no_standardize: bool,

    /// Train on non-positive observed cells as well
    #[arg(long)]
    pub allow_non_positive: bool,

    /// Run the heteroskedasticity adjustment loop after the initial fit
    #[arg(long)]
    pub hetero: bool,

    /// RMSE threshold that stops the heteroskedasticity loop
    #[arg(long)]
    pub stop_threshold: Option<f64>,

    /// Merge period parameters, e.g. `dev:5,6,7` or `acc:2019,2020=old_years`; repeatable
    #[arg(long, value_name = "TYPE:P1,P2[=NAME]")]
    pub combine: Vec<String>,

    /// Tail factor applied to every ultimate
    #[arg(long, default_value = "1.0")]
    pub tail: f64,

    /// Write the fitted model summary to this TOML file
    #[arg(long, value_name = "FILE")]
    pub model_out: Option<PathBuf>,
}

#[derive(Args)]
pub struct InspectArgs {
    /// A model summary written by `fit --model-out`
    pub model: PathBuf,

    /// Only show parameters of this period type (accident, development, calendar)
    #[arg(long)]
    pub period_type: Option<String>,
}

#[derive(Parser)]
#[command(
    name = "trireserve",
    about = "Log-linear loss reserving on development triangles",
    long_about = "Fits a regularized log-linear model to the observed cells of a loss \
                 triangle and projects ultimate losses for every accident period."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model and print ultimates
    Fit(FitArgs),
    /// Print the parameters of a saved model summary
    Inspect(InspectArgs),
}

type CombineRequest = (PeriodKind, Vec<i64>, Option<String>);

/// Parses `TYPE:P1,P2[=NAME]`.
fn parse_combine(raw: &str) -> Result<CombineRequest, Box<dyn Error>> {
    let (period_type, rest) = raw
        .split_once(':')
        .ok_or_else(|| format!("--combine '{raw}' must look like TYPE:P1,P2[=NAME]"))?;
    let (periods, name) = match rest.split_once('=') {
        Some((periods, name)) => (periods, Some(name.to_string())),
        None => (rest, None),
    };
    let kind = resolve_period_type(period_type)?;
    let periods = periods
        .split(',')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("--combine '{raw}': {e}"))?;
    Ok((kind, periods, name))
}

fn fit(args: FitArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => ModelConfig::load(path)?,
        None => ModelConfig::default(),
    };
    if args.alpha.is_some() {
        config.hyperparameters.alpha = args.alpha;
    }
    if args.l1_ratio.is_some() {
        config.hyperparameters.l1_ratio = args.l1_ratio;
    }
    if let Some(max_iter) = args.max_iter {
        config.hyperparameters.max_iter = max_iter;
    }
    if let Some(threshold) = args.stop_threshold {
        config.hetero.stop_threshold = threshold;
    }
    config.use_calendar |= args.calendar;
    config.standardize &= !args.no_standardize;
    config.must_be_positive &= !args.allow_non_positive;

    let combines = args
        .combine
        .iter()
        .map(|raw| parse_combine(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let triangle = load_triangle(&args.triangle)?;
    let mut model = LogLinear::new(args.id.clone(), &triangle, config)?;

    for (kind, periods, name) in &combines {
        model.combine(*kind, periods, name.as_deref())?;
    }

    if model.needs_tuning() {
        println!("No hyperparameters given; searching the default grid.");
        model.fit_with_search(&mut GridSearch, &ParameterGrid::default())?;
    } else {
        model.fit()?;
    }

    if args.hetero {
        let outcome = model.fit_hetero()?;
        println!(
            "Heteroskedasticity adjustment: {} iterations, converged = {}",
            outcome.iterations, outcome.converged
        );
    }

    let ultimates = model.ultimate(Some(args.tail))?;
    println!(
        "{:>10} {:>16} {:>16} {:>16}",
        "accident", "actual", "ultimate", "reserve"
    );
    for u in &ultimates {
        println!(
            "{:>10} {:>16.0} {:>16.0} {:>16.0}",
            u.accident_period, u.actual, u.ultimate, u.reserve
        );
    }
    let total_reserve: f64 = ultimates.iter().map(|u| u.reserve).sum();
    println!("Total reserve: {total_reserve:.0}");

    if let Some(path) = &args.model_out {
        model.summary()?.save(path)?;
        println!("Model summary written to '{}'", path.display());
    }
    Ok(())
}

fn inspect(args: InspectArgs) -> Result<(), Box<dyn Error>> {
    let summary = ModelSummary::load(&args.model)?;
    let filter = args
        .period_type
        .as_deref()
        .map(resolve_period_type)
        .transpose()?;

    println!("Model '{}' ({})", summary.id, summary.kind);
    println!(
        "n = {}, p = {}, degrees of freedom = {}, process variance = {:.6}",
        summary.n_observations,
        summary.n_parameters,
        summary.degrees_of_freedom,
        summary.process_variance
    );
    for parameter in summary.parameters_of(filter) {
        println!("{:<32} {:>14.6}", parameter.name, parameter.value);
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Inspect(args)) => inspect(args),
        None => {
            let mut command = Cli::command();
            command.print_help().map_err(Into::into)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_argument_parses_type_periods_and_name() {
        let (kind, periods, name) = parse_combine("dev:5, 6,7=tail_devs").unwrap();
        assert_eq!(kind, PeriodKind::Development);
        assert_eq!(periods, vec![5, 6, 7]);
        assert_eq!(name.as_deref(), Some("tail_devs"));

        let (kind, periods, name) = parse_combine("ay:2019,2020").unwrap();
        assert_eq!(kind, PeriodKind::Accident);
        assert_eq!(periods, vec![2019, 2020]);
        assert!(name.is_none());
    }

    #[test]
    fn malformed_combine_arguments_fail() {
        assert!(parse_combine("dev5,6").is_err());
        assert!(parse_combine("quarter:1,2").is_err());
        assert!(parse_combine("dev:five").is_err());
    }
}
