//! `vts`: operator CLI for the visual testing artifact store

mod audit;

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use vts_store::{
    ArtifactKind, ArtifactStore, ComparisonSource, RunTimestamp, ServerConfig, StoreHandle,
    Submission, TestRecord, TestTriple,
};

fn triple_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("group")
                .long("group")
                .required(true)
                .help("Test group"),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .required(true)
                .help("Test name"),
        )
        .arg(
            Arg::new("hardware")
                .long("hardware")
                .required(true)
                .help("Hardware the test ran on"),
        )
}

fn token_arg() -> Arg {
    Arg::new("token")
        .long("token")
        .required(true)
        .help("Admin token from the configuration")
}

fn cli() -> Command {
    Command::new("vts")
        .version(vts_store::VERSION)
        .about("Visual testing artifact store")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .default_value("config.json")
                .value_parser(value_parser!(PathBuf))
                .help("Path to the configuration file"),
        )
        .subcommand(Command::new("verify").about("Check the store for consistency"))
        .subcommand(
            Command::new("records").about("List all test records").arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Output as JSON"),
            ),
        )
        .subcommand(
            triple_args(Command::new("submit").about("Submit a test result"))
                .arg(
                    Arg::new("runner")
                        .long("runner")
                        .required(true)
                        .help("Id of the submitting runner"),
                )
                .arg(
                    Arg::new("image")
                        .long("image")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Candidate PNG"),
                )
                .arg(
                    Arg::new("log")
                        .long("log")
                        .value_parser(value_parser!(PathBuf))
                        .help("Log file of the run"),
                )
                .arg(
                    Arg::new("timing")
                        .long("timing")
                        .default_value("0")
                        .value_parser(value_parser!(f64))
                        .help("Duration of the run in seconds"),
                )
                .arg(
                    Arg::new("commit")
                        .long("commit")
                        .default_value("")
                        .help("Commit hash the run was built from"),
                )
                .arg(
                    Arg::new("timestamp")
                        .long("timestamp")
                        .value_parser(value_parser!(RunTimestamp))
                        .help("RFC 3339 time of the run, defaults to now"),
                ),
        )
        .subcommand(
            triple_args(
                Command::new("promote").about("Make the latest candidate the new reference"),
            )
            .arg(token_arg()),
        )
        .subcommand(
            Command::new("threshold")
                .about("Show or change the comparison threshold")
                .arg(
                    Arg::new("value")
                        .value_parser(value_parser!(f64))
                        .help("New threshold in [0, 1]; regenerates all difference images"),
                )
                .arg(token_arg().required(false)),
        )
        .subcommand(
            Command::new("compare")
                .about("Compare one test across two hardwares")
                .arg(
                    Arg::new("group")
                        .long("group")
                        .required(true)
                        .help("Test group"),
                )
                .arg(
                    Arg::new("name")
                        .long("name")
                        .required(true)
                        .help("Test name"),
                )
                .arg(Arg::new("first").required(true).help("First hardware"))
                .arg(Arg::new("second").required(true).help("Second hardware"))
                .arg(
                    Arg::new("candidate")
                        .long("candidate")
                        .action(ArgAction::SetTrue)
                        .help("Compare the latest candidates instead of the references"),
                ),
        )
        .subcommand(
            Command::new("diff")
                .about("Compare two PNG files without storing anything")
                .arg(
                    Arg::new("first")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("second")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_parser(value_parser!(PathBuf))
                        .help("Where to write the difference image"),
                ),
        )
        .subcommand(
            triple_args(Command::new("artifact").about("Print the path of a stored artifact"))
                .arg(
                    Arg::new("kind")
                        .long("kind")
                        .required(true)
                        .value_parser(value_parser!(ArtifactKind))
                        .help("reference, candidate, difference, their -thumbnail forms, or log"),
                )
                .arg(
                    Arg::new("timestamp")
                        .long("timestamp")
                        .value_parser(value_parser!(RunTimestamp))
                        .help("Run to look up, defaults to the latest"),
                ),
        )
        .subcommand(
            triple_args(
                Command::new("check").about("Compare an image against the current reference"),
            )
            .arg(
                Arg::new("image")
                    .long("image")
                    .required(true)
                    .value_parser(value_parser!(PathBuf))
                    .help("PNG to check"),
            )
            .arg(
                Arg::new("out")
                    .long("out")
                    .value_parser(value_parser!(PathBuf))
                    .help("Where to write the difference image"),
            ),
        )
}

fn required<'a, T>(args: &'a ArgMatches, id: &str) -> anyhow::Result<&'a T>
where
    T: Clone + Send + Sync + 'static,
{
    args.get_one::<T>(id)
        .with_context(|| format!("missing argument '{id}'"))
}

fn triple(args: &ArgMatches) -> anyhow::Result<TestTriple> {
    Ok(TestTriple::new(
        required::<String>(args, "group")?.as_str(),
        required::<String>(args, "name")?.as_str(),
        required::<String>(args, "hardware")?.as_str(),
    )?)
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn write_difference(out: Option<&PathBuf>, png: &[u8]) -> anyhow::Result<()> {
    if let Some(out) = out {
        std::fs::write(out, png).with_context(|| format!("writing {}", out.display()))?;
        println!("Difference image: {}", out.display());
    }
    Ok(())
}

fn require_admin(config: &ServerConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let token = args
        .get_one::<String>("token")
        .map_or("", String::as_str);
    if !config.is_admin(token) {
        bail!("invalid admin token");
    }
    Ok(())
}

fn print_records(records: &[TestRecord]) {
    println!("{} test record(s)", records.len());
    for record in records {
        let triple = record.triple();
        match record.latest() {
            Some(run) => println!(
                "  {triple}  runs: {}  latest: {}  error: {:.4}",
                record.runs.len(),
                run.timestamp,
                run.pixel_error
            ),
            None => println!("  {triple}  runs: 0"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let config_path = required::<PathBuf>(&matches, "config")?.clone();
    let mut config = ServerConfig::load(&config_path)?;
    audit::init(&config.data)?;
    tracing::info!("Starting vts {}", vts_store::VERSION);

    let store = ArtifactStore::open(config.store_config())?;
    let handle = StoreHandle::new(store);

    match matches.subcommand() {
        Some(("verify", _)) => {
            if let Err(err) = handle.verify().await {
                tracing::error!("Verification failed: {err}");
                println!("FAILED: {err}");
                std::process::exit(1);
            }
            println!("OK: {} test record(s) verified", handle.all_records().len());
        }
        Some(("records", args)) => {
            let records = handle.all_records();
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
        }
        Some(("submit", args)) => {
            let runner = required::<String>(args, "runner")?;
            if !config.is_runner(runner) {
                bail!("runner '{runner}' is not allowed to submit results");
            }
            let log = match args.get_one::<PathBuf>("log") {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => String::new(),
            };
            let submission = Submission {
                triple: triple(args)?,
                candidate: read_file(required::<PathBuf>(args, "image")?)?,
                log,
                timing: *required::<f64>(args, "timing")?,
                commit_hash: required::<String>(args, "commit")?.clone(),
                timestamp: args
                    .get_one::<RunTimestamp>("timestamp")
                    .copied()
                    .unwrap_or_else(RunTimestamp::now),
            };
            tracing::info!("Submission from runner {runner}");
            let run = handle.submit(submission).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Some(("promote", args)) => {
            require_admin(&config, args)?;
            let run = handle.promote_latest_to_reference(triple(args)?).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Some(("threshold", args)) => match args.get_one::<f64>("value") {
            Some(&value) => {
                require_admin(&config, args)?;
                handle.set_comparison_threshold(value).await?;
                config.comparison_threshold = value;
                config.save(&config_path)?;
                println!("Comparison threshold set to {value}");
            }
            None => println!("{}", handle.store().comparison_threshold()),
        },
        Some(("compare", args)) => {
            let source = if args.get_flag("candidate") {
                ComparisonSource::Candidate
            } else {
                ComparisonSource::Reference
            };
            let (path, ratio) = handle.store().compare_hardware(
                source,
                required::<String>(args, "group")?,
                required::<String>(args, "name")?,
                required::<String>(args, "first")?,
                required::<String>(args, "second")?,
            )?;
            println!("Error: {ratio:.6}");
            println!("Difference image: {}", path.display());
        }
        Some(("diff", args)) => {
            let first = read_file(required::<PathBuf>(args, "first")?)?;
            let second = read_file(required::<PathBuf>(args, "second")?)?;
            let result = handle.compare_ad_hoc(first, second).await?;
            println!("Error: {:.6}", result.error_ratio);
            write_difference(args.get_one::<PathBuf>("out"), &result.difference_png)?;
        }
        Some(("artifact", args)) => {
            let kind = *required::<ArtifactKind>(args, "kind")?;
            let timestamp = args.get_one::<RunTimestamp>("timestamp").copied();
            let path = handle
                .store()
                .artifact_path(&triple(args)?, kind, timestamp)?;
            println!("{}", path.display());
        }
        Some(("check", args)) => {
            let candidate = read_file(required::<PathBuf>(args, "image")?)?;
            let result = handle
                .store()
                .compare_with_reference(&triple(args)?, &candidate)?;
            println!("Error: {:.6}", result.error_ratio);
            write_difference(args.get_one::<PathBuf>("out"), &result.difference_png)?;
        }
        _ => {}
    }
    Ok(())
}
