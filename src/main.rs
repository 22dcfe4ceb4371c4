// NEOX v1.0.0 -- CLOSED-LOOP CPU FREQUENCY GOVERNOR
// ONDEMAND-STYLE LOAD TRACKING FOR LINUX cpufreq POLICIES
//
// SAMPLING AND DECISIONS RUN ON ONE WORKER THREAD PER POLICY OWNER
// THE MAIN THREAD HANDLES: CONFIGURATION, MONITORING, REPORTING

mod cli;
mod daemon;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use daemon::Daemon;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "neox")]
#[command(about = "NEOX -- CLOSED-LOOP CPU FREQUENCY GOVERNOR")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunOpts,
}

#[derive(Subcommand)]
enum Command {
    // VERIFY cpufreq SYSFS, userspace GOVERNOR, KERNEL CONFIG
    Check,
    // PRINT PER-CPU LOAD EVERY SAMPLING INTERVAL UNTIL CTRL+C
    Sample {
        // INTERVAL IN MICROSECONDS
        #[arg(long, default_value_t = neox::tuning::DEF_SAMPLING_RATE_US)]
        interval: u32,

        // COUNT NICED TIME AS IDLE
        #[arg(long)]
        ignore_nice: bool,
    },
}

#[derive(Args)]
pub struct RunOpts {
    // BASE SAMPLING INTERVAL IN MICROSECONDS (50MS DEFAULT, 10MS FLOOR)
    #[arg(long)]
    pub sampling_rate: Option<u32>,

    // RAISE ABOVE THIS LOAD PERCENT (11..=100)
    #[arg(long)]
    pub up_threshold: Option<u32>,

    // LOWER BELOW up_threshold MINUS THIS
    #[arg(long)]
    pub down_differential: Option<u32>,

    // SAMPLING INTERVAL MULTIPLIER WHILE PINNED AT MAX (1..=100000)
    #[arg(long)]
    pub sampling_down_factor: Option<u32>,

    // COUNT NICED TIME AS IDLE
    #[arg(long)]
    pub ignore_nice: bool,

    // RAISE STEP, PERCENT OF POLICY MAX
    #[arg(long)]
    pub freq_step: Option<u32>,

    // UP THRESHOLD BELOW freq_for_responsiveness
    #[arg(long)]
    pub up_threshold_at_min_freq: Option<u32>,

    // RESPONSIVENESS FLOOR IN KHZ
    #[arg(long)]
    pub freq_for_responsiveness: Option<u32>,

    // HOST TICK RATE FOR PHASE ALIGNMENT
    #[arg(long, default_value_t = 250,
          value_parser = clap::value_parser!(u32).range(1..=i64::from(neox::sysfs::MAX_HZ)))]
    pub hz: u32,

    // PUBLISH TUNABLES AS ONE FILE PER ATTRIBUTE IN THIS DIRECTORY
    #[arg(long)]
    pub tunables_dir: Option<PathBuf>,

    // LOG FREQUENCY REQUESTS INSTEAD OF WRITING scaling_setspeed
    #[arg(long)]
    pub dry_run: bool,

    // DISABLE THE cur == max / cur == min EARLY EXITS
    #[arg(long)]
    pub no_limit_guards: bool,

    // PRINT VERBOSE OUTPUT
    #[arg(long)]
    pub verbose: bool,

    // DUMP FULL DECISION LOG ON EXIT
    #[arg(long)]
    pub dump_log: bool,
}

fn init_logging(verbose: bool) -> Result<()> {
    let loglevel = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Check) => return cli::check::run_check(),
        Some(Command::Sample { interval, ignore_nice }) => {
            return cli::sample::run_sample(interval, ignore_nice);
        }
        None => {}
    }

    let opts = cli.run;
    init_logging(opts.verbose)?;

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let mut daemon = Daemon::init(&opts)?;

    println!("NEOX v1.0.0");
    println!("CPUS:            {} ({} policies)", daemon.nr_cpus(), daemon.policies().len());
    for p in daemon.policies() {
        println!("  POLICY {:<3}     cpus {:?}  [{} .. {}] kHz  cur {} kHz",
                 p.cpu, p.cpus, p.min, p.max, p.cur);
    }
    println!("HZ:              {}", opts.hz);
    println!("DRY RUN:         {}", opts.dry_run);
    println!("LIMIT GUARDS:    {}", !opts.no_limit_guards);
    if let Some(dir) = &opts.tunables_dir {
        println!("TUNABLES:        {}", dir.display());
    }
    println!();

    println!("NEOX IS ACTIVE (CTRL+C TO EXIT)");
    daemon.run(&SHUTDOWN)?;
    println!("NEOX IS SHUTTING DOWN");

    daemon.stop();
    {
        let log = daemon.decision_log();
        if opts.dump_log {
            log.dump();
        }
        log.summary();
    }

    println!("NEOX OUT.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hz_outside_tick_range_rejected() {
        assert!(Cli::try_parse_from(["neox", "--hz", "2000000000"]).is_err());
        assert!(Cli::try_parse_from(["neox", "--hz", "0"]).is_err());
        let cli = Cli::try_parse_from(["neox", "--hz", "10000"]).expect("in range");
        assert_eq!(cli.run.hz, 10_000);
    }
}
