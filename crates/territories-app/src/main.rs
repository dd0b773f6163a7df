//! Random-policy rollout harness for the Territories engine.

use anyhow::{Context, Result};
use clap::Parser;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::path::PathBuf;
use std::time::Instant;
use territories_core::{MapSource, Territories, TerritoriesConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "territories", about = "Drive seeded random-policy rollouts")]
struct AppCli {
    /// Grid width in tiles.
    #[arg(long, default_value_t = 96)]
    width: usize,
    /// Grid height in tiles.
    #[arg(long, default_value_t = 96)]
    height: usize,
    /// Agent slot table capacity.
    #[arg(long, default_value_t = 512)]
    agents: usize,
    /// Genes per agent.
    #[arg(long, default_value_t = 3)]
    genes: usize,
    /// Alleles per gene.
    #[arg(long, default_value_t = 4)]
    alleles: u16,
    /// Number of agent roles.
    #[arg(long, default_value_t = 2)]
    roles: u16,
    /// Shortest possible episode.
    #[arg(long, default_value_t = 512)]
    min_ep_length: usize,
    /// Exclusive upper bound on episode length.
    #[arg(long, default_value_t = 576)]
    max_ep_length: usize,
    /// Terminal reward for a gene family dying out.
    #[arg(long, default_value_t = -2.0, allow_hyphen_values = true)]
    extinction_reward: f32,
    /// Use the log-growth reward kernel instead of the family-size delta.
    #[arg(long)]
    growth_rate_reward: bool,
    /// Soil bitmap file; every cell is soil when omitted.
    #[arg(long)]
    map: Option<PathBuf>,
    /// World RNG seed.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// RNG seed for the random action policy.
    #[arg(long, default_value_t = 1)]
    policy_seed: u64,
    /// Ticks to simulate.
    #[arg(long, default_value_t = 2_000)]
    steps: u64,
    /// Print the cumulative episode log as JSON on exit.
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn main() -> Result<()> {
    let cli = AppCli::parse();
    init_tracing();

    let config = TerritoriesConfig {
        width: cli.width,
        height: cli.height,
        max_agents: cli.agents,
        n_genes: cli.genes,
        n_alleles: cli.alleles,
        n_roles: cli.roles,
        min_ep_length: cli.min_ep_length,
        max_ep_length: cli.max_ep_length,
        extinction_reward: cli.extinction_reward,
        reward_growth_rate: cli.growth_rate_reward,
        rng_seed: Some(cli.seed),
        map: cli.map.map_or(MapSource::Uniform, MapSource::File),
        ..TerritoriesConfig::default()
    };
    let mut world = Territories::new(config).context("initialising environment")?;
    world.reset();
    info!(
        alive = world.alive_count(),
        obs_size = world.obs_size(),
        seed = cli.seed,
        "environment ready"
    );

    let mut policy = SmallRng::seed_from_u64(cli.policy_seed);
    let mut episodes_logged = 0usize;
    let mut agent_steps = 0u64;
    let started = Instant::now();

    for _ in 0..cli.steps {
        let pids: Vec<u16> = world.alive_pids().to_vec();
        agent_steps += pids.len() as u64;
        for pid in pids {
            world.actions_mut()[usize::from(pid)] = policy.random_range(0..11);
        }
        world.step();

        while (world.log().n as usize) > episodes_logged {
            episodes_logged += 1;
            if let Some(summary) = world.history().last() {
                info!(
                    episode = episodes_logged,
                    length = summary.length,
                    births = summary.births,
                    starvations = summary.starvations,
                    murders = summary.murders,
                    final_population = summary.final_population,
                    total_reward = summary.total_reward,
                    life_expectancy = summary.life_expectancy,
                    genetic_diversity = summary.genetic_diversity,
                    "episode complete"
                );
            }
        }
    }

    let elapsed = started.elapsed();
    info!(
        steps = cli.steps,
        agent_steps,
        episodes = episodes_logged,
        sps = agent_steps as f64 / elapsed.as_secs_f64(),
        "rollout finished"
    );

    let log = world.take_log();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&log)?);
    } else {
        info!(?log, "cumulative episode log");
    }
    Ok(())
}
