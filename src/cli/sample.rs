// LIVE LOAD SAMPLER: ONE LINE PER INTERVAL, ONE COLUMN PER CPU
// "-" MARKS A SAMPLE DROPPED BY THE DEEP-SLEEP FILTER, "?" A CLOCK ANOMALY

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;

use neox::host::CounterSource;
use neox::sampler::{CpuSample, Reading, SampleOutcome, SkipReason};
use neox::sysfs::{self, ProcStatCounters};

static RUNNING: AtomicBool = AtomicBool::new(true);

fn read(src: &ProcStatCounters, cpu: usize, ignore_nice: bool) -> Reading {
    let (idle_us, wall_us) = src.read_idle_and_wall(cpu);
    let nice_us = ignore_nice.then(|| src.read_nice_us(cpu));
    Reading { idle_us, wall_us, nice_us }
}

pub fn run_sample(interval_us: u32, ignore_nice: bool) -> Result<()> {
    ctrlc::set_handler(move || {
        RUNNING.store(false, Ordering::Relaxed);
    })?;

    let src = ProcStatCounters::new();
    let nr_cpus = sysfs::configured_cpus();
    let interval = Duration::from_micros(u64::from(interval_us.max(1)));

    let mut samples = vec![CpuSample::default(); nr_cpus];
    for (cpu, s) in samples.iter_mut().enumerate() {
        s.baseline(&read(&src, cpu, ignore_nice));
    }

    let header: Vec<String> = (0..nr_cpus).map(|c| format!("CPU{:<3}", c)).collect();
    println!("{}", header.join(" "));

    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(interval);
        let row: Vec<String> = samples
            .iter_mut()
            .enumerate()
            .map(|(cpu, s)| match s.update(&read(&src, cpu, ignore_nice)) {
                SampleOutcome::Load(pct) => format!("{:<6}", pct),
                SampleOutcome::Skipped(SkipReason::DeepSleep) => format!("{:<6}", "-"),
                SampleOutcome::Skipped(SkipReason::ClockAnomaly) => format!("{:<6}", "?"),
            })
            .collect();
        println!("{}", row.join(" "));
    }
    Ok(())
}
