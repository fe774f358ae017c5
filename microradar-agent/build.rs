use anyhow::anyhow;
use aya_build::{Package, Toolchain};
use std::env;

fn main() -> anyhow::Result<()> {
    // Skip eBPF build if we're already building for the eBPF target
    if env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default() == "bpf" {
        return Ok(());
    }

    // Skip eBPF build on non-Linux platforms
    if env::consts::OS != "linux" {
        println!(
            "cargo:warning=eBPF compilation skipped on {}. Build on Linux to produce probe objects.",
            env::consts::OS
        );
        return Ok(());
    }

    let ebpf_package = Package {
        name: "microradar-probes",
        root_dir: "../microradar-probes",
        no_default_features: false,
        features: &[],
    };

    aya_build::build_ebpf([ebpf_package], Toolchain::Nightly)?;

    let out_dir = env::var("OUT_DIR")?;
    for object in ["container_trace", "network_monitor"] {
        let path = format!("{}/{}", out_dir, object);
        if !std::path::Path::new(&path).exists() {
            return Err(anyhow!("eBPF probe compilation failed: {} not found", path));
        }
    }

    Ok(())
}
