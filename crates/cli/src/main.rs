mod config;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use cloud::{AzureCli, CloudProvider, GcloudCli};
use clusterbench_core::{Cluster, ImageKind, MemoryBudget, Program, Scenario, WanSetup};
use colored::Colorize;
use orchestrator::{
    default_cluster_name, fetch_logs, load_topology, run_steps, BaselineKind, BaselineScenario,
    BaselineSweep, ExperimentPipeline, LanSweep, Provisioner, SoftwareSetup, SpawnRequest,
    SweepStep, WanSweep,
};
use remote::{RemoteShell, SshShell};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::BenchConfig;

const DEFAULT_TOPOLOGY: &str = "cluster.json";
const WAN_LOCATIONS: [&str; 3] = ["oregon", "iowa", "virginia"];

#[derive(Parser)]
#[command(name = "clusterbench")]
#[command(about = "Spawn benchmark clusters and run experiments on them", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Topology file written by spawn and read by every other command
    #[arg(long, global = true, default_value = DEFAULT_TOPOLOGY)]
    topology: PathBuf,

    /// Configuration file (defaults to ./clusterbench.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a cluster, then provision its software
    Spawn {
        #[arg(short, long)]
        name: Option<String>,

        #[arg(short = 'a', long, default_value_t = 2)]
        lan_machines: usize,

        #[arg(short = 'd', long)]
        large_work_disk: bool,

        #[arg(short = 'g', long, num_args = 1.., value_parser = WAN_LOCATIONS)]
        wan_locations: Vec<String>,

        #[arg(short = 's', long, default_value = "regular")]
        wan_setup: WanSetup,

        /// Boot from the image with dependencies preinstalled
        #[arg(short, long)]
        image: bool,

        #[arg(short = 'p', long)]
        gcloud_project: Option<String>,

        /// Only create the machines
        #[arg(long)]
        skip_provision: bool,

        #[command(flatten)]
        code: CodeArgs,
    },
    /// Install and configure the benchmark on an existing cluster
    Provision {
        #[command(flatten)]
        code: CodeArgs,
    },
    RunLan {
        #[command(flatten)]
        sweep: SweepArgs,
    },
    RunWan {
        #[arg(value_parser = WAN_LOCATIONS)]
        location: String,

        #[command(flatten)]
        wan: WanArgs,
    },
    RunPairedWan {
        #[arg(value_parser = WAN_LOCATIONS)]
        location: String,

        #[command(flatten)]
        wan: WanArgs,
    },
    RunHalfgatesBaseline {
        #[command(flatten)]
        baseline: BaselineArgs,
    },
    RunCkksBaseline {
        #[command(flatten)]
        baseline: BaselineArgs,
    },
    /// Delete every resource of the cluster in the topology file
    Deallocate,
    /// Delete resources by cluster name, with or without a topology file
    Purge {
        #[arg(short, long)]
        name: Option<String>,

        #[arg(short = 'p', long)]
        gcloud_project: Option<String>,
    },
    FetchLogs {
        directory: PathBuf,
    },
}

#[derive(Args)]
struct CodeArgs {
    #[arg(short, long)]
    repository: Option<String>,

    #[arg(short, long)]
    checkout: Option<String>,
}

#[derive(Args)]
struct SweepArgs {
    #[arg(short, long, num_args = 1..)]
    programs: Option<Vec<Program>>,

    #[arg(short, long, num_args = 1..)]
    scenarios: Option<Vec<Scenario>>,

    /// Memory limit such as 1gb, or max
    #[arg(short, long)]
    mem_limit: Option<MemoryBudget>,

    #[arg(short, long, default_value_t = 1)]
    trials: u32,
}

#[derive(Args)]
struct WanArgs {
    #[command(flatten)]
    sweep: SweepArgs,

    #[arg(short, long, num_args = 1..)]
    workers_per_node: Option<Vec<usize>>,

    #[arg(short = 'c', long, num_args = 1..)]
    ot_num_connections: Option<Vec<u32>>,

    #[arg(short = 'o', long, num_args = 1..)]
    ot_concurrency: Option<Vec<u32>>,
}

#[derive(Args)]
struct BaselineArgs {
    #[arg(short = 'z', long, num_args = 1..)]
    sizes: Option<Vec<u64>>,

    #[arg(short, long, num_args = 1..)]
    scenarios: Option<Vec<BaselineScenario>>,

    #[arg(short, long, default_value = "1gb")]
    mem_limit: MemoryBudget,

    #[arg(short, long, default_value_t = 1)]
    trials: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let (mut config, source) = config::load(cli.config.as_deref()).await?;
    match &source {
        Some(path) => tracing::debug!("Configuration: {}", path.display()),
        None => tracing::debug!("No configuration file, using defaults"),
    }
    let topology = cli.topology.as_path();

    match cli.command {
        Commands::Spawn {
            name,
            lan_machines,
            large_work_disk,
            wan_locations,
            wan_setup,
            image,
            gcloud_project,
            skip_provision,
            code,
        } => {
            if let Some(project) = gcloud_project {
                config.gcloud.project = Some(project);
            }
            code.apply(&mut config);
            let request = SpawnRequest::new(name.unwrap_or_else(default_cluster_name), lan_machines)
                .with_wan_locations(wan_locations)
                .with_setup(wan_setup)
                .with_image(if image {
                    ImageKind::Prebuilt
                } else {
                    ImageKind::Ubuntu
                })
                .with_large_work_disk(large_work_disk);
            spawn(&config, &request, topology, skip_provision).await
        }
        Commands::Provision { code } => {
            code.apply(&mut config);
            let cluster = load_topology(topology)?;
            provision(&config, &cluster, topology).await
        }
        Commands::RunLan { sweep } => {
            let cluster = load_topology(topology)?;
            let steps = LanSweep {
                programs: sweep.programs,
                scenarios: sweep.scenarios,
                budget: sweep.mem_limit.unwrap_or(MemoryBudget::Gigabytes(1)),
                trials: sweep.trials,
            }
            .steps(&cluster);
            run_sweep(&config, &cluster, &steps).await
        }
        Commands::RunWan { location, wan } => run_wan(&config, topology, location, false, wan).await,
        Commands::RunPairedWan { location, wan } => {
            run_wan(&config, topology, location, true, wan).await
        }
        Commands::RunHalfgatesBaseline { baseline } => {
            run_baseline(&config, topology, BaselineKind::Halfgates, baseline).await
        }
        Commands::RunCkksBaseline { baseline } => {
            run_baseline(&config, topology, BaselineKind::Ckks, baseline).await
        }
        Commands::Deallocate => {
            println!("Deallocating cluster...");
            provisioner(&config).await?.deallocate(topology).await?;
            println!("{} Cluster deallocated", "✓".green());
            Ok(())
        }
        Commands::Purge {
            name,
            gcloud_project,
        } => {
            if let Some(project) = gcloud_project {
                config.gcloud.project = Some(project);
            }
            let name = name.unwrap_or_else(default_cluster_name);
            println!("Purging cluster {}...", name.bold());
            provisioner(&config).await?.purge(&name, topology).await?;
            println!("{} Cluster {} purged", "✓".green(), name);
            Ok(())
        }
        Commands::FetchLogs { directory } => {
            let cluster = load_topology(topology)?;
            let shell = shell(&config).await?;
            println!("Fetching logs...");
            let targets = fetch_logs(shell.as_ref(), &cluster, &directory).await?;
            println!(
                "{} Fetched logs from {} machines into {}",
                "✓".green(),
                targets.len(),
                directory.display()
            );
            Ok(())
        }
    }
}

impl CodeArgs {
    fn apply(self, config: &mut BenchConfig) {
        if let Some(repository) = self.repository {
            config.spawn.repository = repository;
        }
        if let Some(checkout) = self.checkout {
            config.spawn.checkout = checkout;
        }
    }
}

async fn shell(config: &BenchConfig) -> Result<Arc<dyn RemoteShell>> {
    let shell = SshShell::new(config.ssh.clone());
    if !shell.is_available().await {
        bail!("ssh and scp must be installed to reach the cluster");
    }
    Ok(Arc::new(shell))
}

async fn provisioner(config: &BenchConfig) -> Result<Provisioner> {
    let lan: Arc<dyn CloudProvider> = Arc::new(AzureCli::new(config.azure.clone()));
    let wan: Arc<dyn CloudProvider> = Arc::new(GcloudCli::new(config.gcloud.clone()));
    for provider in [&lan, &wan] {
        if !provider.is_available().await {
            bail!("The {} CLI is not installed or not on PATH", provider.name());
        }
    }
    Ok(Provisioner::new(lan, wan))
}

async fn spawn(config: &BenchConfig, request: &SpawnRequest, topology: &Path, skip_provision: bool) -> Result<()> {
    println!("Spawning cluster {}...", request.name.bold());
    let cluster = match provisioner(config).await?.spawn(request, topology).await {
        Ok(cluster) => cluster,
        Err(e) => {
            if e.is_already_exists() {
                println!("{} Cluster already exists", "✗".red());
                println!("To create a new cluster, first run 'clusterbench deallocate'");
            }
            return Err(anyhow::Error::new(e).context("Failed to spawn cluster"));
        }
    };
    println!(
        "{} Spawned {} machines, topology saved to {}",
        "✓".green(),
        cluster.len(),
        topology.display()
    );
    if skip_provision {
        return Ok(());
    }

    let setup = SoftwareSetup::new(shell(config).await?, config.spawn.clone());
    println!(
        "Waiting {} seconds for the machines to start up...",
        config.spawn.startup_wait.as_secs()
    );
    setup.wait_for_startup().await;
    provision_with(&setup, &cluster, topology).await
}

async fn provision(config: &BenchConfig, cluster: &Cluster, topology: &Path) -> Result<()> {
    let setup = SoftwareSetup::new(shell(config).await?, config.spawn.clone());
    provision_with(&setup, cluster, topology).await
}

async fn provision_with(setup: &SoftwareSetup, cluster: &Cluster, topology: &Path) -> Result<()> {
    println!("Provisioning the machines...");
    setup
        .provision(cluster, topology)
        .await
        .context("Failed to provision cluster")?;
    println!("{} Provisioned {} machines", "✓".green(), cluster.len());
    Ok(())
}

async fn run_wan(config: &BenchConfig, topology: &Path, location: String, paired: bool, args: WanArgs) -> Result<()> {
    let cluster = load_topology(topology)?;
    let mut sweep = WanSweep::new(location, paired);
    if let Some(programs) = args.sweep.programs {
        sweep.programs = programs;
    }
    if let Some(scenarios) = args.sweep.scenarios {
        sweep.scenarios = scenarios;
    }
    if let Some(budget) = args.sweep.mem_limit {
        sweep.budget = budget;
    }
    if let Some(workers) = args.workers_per_node {
        sweep.workers_per_node = workers;
    }
    if let Some(connections) = args.ot_num_connections {
        sweep.ot_connections = connections;
    }
    if let Some(concurrency) = args.ot_concurrency {
        sweep.ot_concurrency = concurrency;
    }
    sweep.trials = args.sweep.trials;
    run_sweep(config, &cluster, &sweep.steps()).await
}

async fn run_baseline(config: &BenchConfig, topology: &Path, kind: BaselineKind, args: BaselineArgs) -> Result<()> {
    let cluster = load_topology(topology)?;
    let sweep = BaselineSweep {
        kind,
        sizes: args.sizes,
        scenarios: args.scenarios,
        budget: args.mem_limit,
        trials: args.trials,
    };
    let steps = sweep.steps(&cluster)?;
    run_sweep(config, &cluster, &steps).await
}

async fn run_sweep(config: &BenchConfig, cluster: &Cluster, steps: &[SweepStep]) -> Result<()> {
    if steps.is_empty() {
        println!("{} Nothing to run", "!".yellow());
        return Ok(());
    }
    let pipeline = ExperimentPipeline::new(shell(config).await?, config.experiment.clone());
    println!("Running {} experiments on {}...", steps.len(), cluster.name.bold());
    let ran = run_steps(&pipeline, cluster, steps)
        .await
        .context("Experiment sweep failed")?;
    println!("{} Finished {} experiments", "✓".green(), ran);
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "debug"
    } else {
        "clusterbench=info,orchestrator=info,cloud=info,remote=warn"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_wan() {
        let cli = Cli::try_parse_from([
            "clusterbench",
            "run-paired-wan",
            "iowa",
            "-p",
            "merge_sorted_1024",
            "loop_join_64",
            "-w",
            "1",
            "2",
            "-m",
            "max",
        ])
        .unwrap();
        match cli.command {
            Commands::RunPairedWan { location, wan } => {
                assert_eq!(location, "iowa");
                assert_eq!(wan.sweep.programs.map(|p| p.len()), Some(2));
                assert_eq!(wan.workers_per_node, Some(vec![1, 2]));
                assert_eq!(wan.sweep.mem_limit, Some(MemoryBudget::Unbounded));
            }
            _ => panic!("expected run-paired-wan"),
        }
        assert_eq!(cli.topology, PathBuf::from(DEFAULT_TOPOLOGY));
    }

    #[test]
    fn test_parse_spawn() {
        let cli = Cli::try_parse_from([
            "clusterbench",
            "--topology",
            "bench.json",
            "spawn",
            "-a",
            "4",
            "-g",
            "oregon",
            "virginia",
            "-s",
            "paired-swap",
        ])
        .unwrap();
        match cli.command {
            Commands::Spawn {
                lan_machines,
                wan_locations,
                wan_setup,
                ..
            } => {
                assert_eq!(lan_machines, 4);
                assert_eq!(wan_locations, vec!["oregon", "virginia"]);
                assert_eq!(wan_setup, WanSetup::PairedSwap);
            }
            _ => panic!("expected spawn"),
        }
        assert!(Cli::try_parse_from(["clusterbench", "spawn", "-g", "mars"]).is_err());
        assert!(Cli::try_parse_from(["clusterbench", "spawn", "-s", "sideways"]).is_err());
    }

    #[test]
    fn test_locations_match_cloud_naming() {
        for location in WAN_LOCATIONS {
            assert!(cloud::lookup_location(location).is_some(), "{}", location);
        }
    }
}
