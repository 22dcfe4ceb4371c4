use std::io::Read;
use std::path::Path;

use anyhow::Result;

use neox::sysfs::{self, SysfsDriver};

fn check_kernel_config() -> bool {
    let file = match std::fs::File::open("/proc/config.gz") {
        Ok(f) => f,
        Err(_) => {
            println!("  /proc/config.gz       NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  /proc/config.gz       UNREADABLE (SKIPPED)");
        return true;
    }
    let mut ok = true;
    for opt in ["CONFIG_CPU_FREQ", "CONFIG_CPU_FREQ_GOV_USERSPACE"] {
        if config.contains(&format!("{}=y", opt)) {
            println!("  {:<30}OK", opt);
        } else {
            println!("  {:<30}NOT FOUND", opt);
            ok = false;
        }
    }
    ok
}

pub fn run_check() -> Result<()> {
    println!("NEOX DEPENDENCY CHECK");
    println!();

    let mut ok = true;

    println!("KERNEL CONFIG:");
    if !check_kernel_config() {
        ok = false;
    }
    println!();

    println!("CPUFREQ:");
    let root = Path::new(sysfs::CPU_SYSFS);
    if !root.join("cpu0/cpufreq").exists() {
        println!("  cpufreq               NOT AVAILABLE (sysfs path missing)");
        ok = false;
    }

    let policies = SysfsDriver::new(true).discover_policies(sysfs::configured_cpus());
    for p in &policies {
        let dir = root.join(format!("cpu{}/cpufreq", p.cpu));
        let governors = std::fs::read_to_string(dir.join("scaling_available_governors"))
            .unwrap_or_default();
        let current = std::fs::read_to_string(dir.join("scaling_governor")).unwrap_or_default();
        let userspace = governors.split_whitespace().any(|g| g == "userspace");
        println!("  POLICY {:<3} cpus {:?} [{} .. {}] kHz  governor {}  userspace {}",
                 p.cpu, p.cpus, p.min, p.max, current.trim(),
                 if userspace { "OK" } else { "MISSING" });
        if !userspace {
            ok = false;
        }
    }
    if policies.is_empty() {
        println!("  NO POLICIES FOUND");
        ok = false;
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        println!("  Select the userspace governor: echo userspace > /sys/devices/system/cpu/cpuN/cpufreq/scaling_governor");
        println!("  Or run with --dry-run to log requests without writing them");
        std::process::exit(1);
    }

    Ok(())
}
