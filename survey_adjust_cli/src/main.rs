use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use survey_adjust::adjustment::{EstimationStateType, LogProgress, NetworkAdjustment};
use survey_adjust::io::{read_project_json, JsonResultWriter};
use survey_adjust::{AdjustResult, AdjustmentConfig, EstimationType};

#[derive(Parser)]
#[command(author, version, about = "Least-squares adjustment of geodetic networks")]
struct Cli {
    /// Log every state change of the adjustment
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Mode {
    L2,
    L1,
    Simulation,
    ModifiedUt,
    SimplexUt,
}

impl From<Mode> for EstimationType {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::L2 => EstimationType::L2Norm,
            Mode::L1 => EstimationType::L1Norm,
            Mode::Simulation => EstimationType::Simulation,
            Mode::ModifiedUt => EstimationType::ModifiedUnscentedTransformation,
            Mode::SimplexUt => EstimationType::SphericalSimplexUnscentedTransformation,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Adjust the network of a JSON project file.
    Adjust {
        input: String,
        /// Write the adjustment report as JSON
        #[arg(long, short)]
        output: Option<String>,
        /// JSON configuration, replaces the settings stored in the project
        #[arg(long, short)]
        config: Option<String>,
        #[arg(long, value_enum)]
        mode: Option<Mode>,
        #[arg(long)]
        max_iterations: Option<usize>,
    },
    /// Print the datum defect of a JSON project without adjusting it.
    RankDefect { input: String },
}

fn load(input: &str, config: Option<&str>) -> AdjustResult<NetworkAdjustment> {
    let project = read_project_json(input)?;
    let config = config.map(AdjustmentConfig::from_json_file).transpose()?;
    project.into_adjustment(config)
}

fn print_results(adjustment: &NetworkAdjustment) {
    println!("State: {:?}", adjustment.state());
    println!("Iterations: {}", adjustment.iterations());
    println!("Degrees of freedom: {:.3}", adjustment.degrees_of_freedom());
    println!("Omega: {:.6}", adjustment.omega());
    println!("Variance factor: {:.6}", adjustment.variance_factor());
    for point in adjustment.network().points() {
        if !point.is_unknown() {
            continue;
        }
        let axes = point.axes();
        let coordinates: Vec<String> = axes
            .iter()
            .map(|a| format!("{:.4}", point.coordinates[*a]))
            .collect();
        let std: Vec<String> = axes
            .iter()
            .map(|a| format!("{:.4}", point.result.std[*a]))
            .collect();
        println!("{} {} +- {}", point.name, coordinates.join(","), std.join(","));
    }
    for component in adjustment.variance_components() {
        println!(
            "Variance component {:?}: {:.4} (r = {:.3})",
            component.kind,
            component.variance_factor(),
            component.redundancy
        );
    }
    for pc in adjustment.principal_components() {
        println!("Principal component {}: {:.6}", pc.index + 1, pc.value);
    }
}

fn adjust(
    input: &str,
    output: Option<String>,
    config: Option<String>,
    mode: Option<Mode>,
    max_iterations: Option<usize>,
    verbose: bool,
) -> AdjustResult<EstimationStateType> {
    let mut adjustment = load(input, config.as_deref())?;
    if mode.is_some() || max_iterations.is_some() {
        let mut config = adjustment.config().clone();
        if let Some(mode) = mode {
            config.estimation_type = mode.into();
        }
        if let Some(max_iterations) = max_iterations {
            config.max_iterations = max_iterations;
        }
        adjustment.set_config(config);
    }
    if verbose {
        adjustment.set_progress_sink(LogProgress);
    }
    if let Some(path) = output {
        adjustment.set_writer(JsonResultWriter::new(path));
    }
    let state = adjustment.estimate_model()?.check()?;
    print_results(&adjustment);
    Ok(state)
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match cli.command {
        Commands::Adjust {
            input,
            output,
            config,
            mode,
            max_iterations,
        } => adjust(&input, output, config, mode, max_iterations, cli.verbose).map(|state| {
            info!("adjustment of {input} finished with {state:?}");
        }),
        Commands::RankDefect { input } => load(&input, None).and_then(|mut adjustment| {
            let defect = adjustment.detect_rank_defect()?;
            println!("Rank defect: {}", defect.defect());
            for component in defect.free_components() {
                println!("{component:?}");
            }
            Ok(())
        }),
    };
    if let Err(e) = result {
        error!("{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
