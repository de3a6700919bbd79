//! ihk-sim - drive a full IHK cycle on a simulated chip
//!
//! Reserves resources, boots a simulated LWK, ping-pongs packets over an
//! IKC channel, then shuts everything down again.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ihk::ikc::handler;
use ihk::os::ikc_map::{format_cpulist, format_ikc_map, parse_cpulist};
use ihk::{
    Credentials, Handle, IhkDevice, IkcPacket, KernelImage, MemChunk, OsStatus, PhysAddr,
    SendOptions, SimChip, SimConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MSG_PING: u32 = 0x10;

#[derive(Parser)]
#[command(name = "ihk-sim")]
#[command(about = "IHK simulator - partition a simulated chip and exchange IKC packets", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reserve, boot, exchange packets, shut down and destroy
    Run {
        /// Packets to send over the channel
        #[arg(long, default_value = "1000")]
        packets: u64,

        /// CPUs for the LWK, e.g. 4-7
        #[arg(long, default_value = "4-7")]
        lwk_cpus: String,

        /// Memory for the LWK on node 0 (MiB)
        #[arg(long, default_value = "256")]
        mem_mib: u64,

        /// Kernel arguments
        #[arg(long)]
        kargs: Option<String>,

        /// IKC map, e.g. 4-5:1+6-7:2
        #[arg(long)]
        ikc_map: Option<String>,
    },

    /// Print the effective configuration
    ShowConfig,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };

    match cli.command {
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run {
            packets,
            lwk_cpus,
            mem_mib,
            kargs,
            ikc_map,
        } => {
            run(&config, packets, &lwk_cpus, mem_mib, kargs.as_deref(), ikc_map.as_deref())?;
        }
    }

    Ok(())
}

fn run(
    config: &SimConfig,
    packets: u64,
    lwk_cpus: &str,
    mem_mib: u64,
    kargs: Option<&str>,
    ikc_map: Option<&str>,
) -> Result<()> {
    let chip = SimChip::new(config.topology.build());
    let device = Arc::new(IhkDevice::new(
        config.ihk.clone(),
        chip.topology().clone(),
        chip.platform(),
    )?);
    let handle = Handle::open(device.clone(), Credentials::root());

    let cpus = parse_cpulist(lwk_cpus, chip.topology().num_cpus()).context("parsing --lwk-cpus")?;
    let ncpus = cpus.len() as i32;
    handle.reserve_cpus(Some(&cpus[..]), ncpus)?;
    let mem = handle.reserve_mem(Some(&[MemChunk::request(mem_mib << 20, 0)][..]), 1)?;
    let nmem = mem.len() as i32;

    let os = handle.create_os()?;
    handle.os_assign_cpus(os, Some(&cpus[..]), ncpus)?;
    handle.os_assign_mem(os, Some(&mem[..]), nmem)?;
    handle.os_load(os, KernelImage::new(PhysAddr(0x20_0000), vec![0u8; 4096]))?;
    if let Some(kargs) = kargs {
        handle.os_kargs(os, kargs)?;
    }
    if let Some(map) = ikc_map {
        handle.os_set_ikc_map(os, map)?;
    }

    handle.os_boot(os)?;
    device.os_wait_for_status(os, OsStatus::Ready, Duration::from_secs(5))?;
    log::info!("{} ready, ikc map {}", os, format_ikc_map(&handle.os_get_ikc_map(os)?));

    let (tx, rx) = crossbeam::channel::unbounded();
    let channel = device.os_open_channel(
        os,
        cpus[0],
        handler(move |_, pkt| {
            let _ = tx.send(pkt.seq);
        }),
    )?;

    let start = Instant::now();
    for seq in 0..packets {
        let pkt = IkcPacket::new(MSG_PING, [seq, 0, 0, 0, 0, 0]).with_seq(seq);
        channel.send(&pkt, SendOptions::NOTIFY)?;
    }

    let mut in_order = true;
    for expected in 0..packets {
        let seq = rx
            .recv_timeout(Duration::from_secs(5))
            .with_context(|| format!("waiting for echo {} of {}", expected, packets))?;
        in_order &= seq == expected;
    }
    let elapsed = start.elapsed();
    let stats = channel.stats();
    let status = handle.os_get_status(os);

    device.os_close_channel(os, &channel)?;
    let kmsg = handle.os_kmsg(os)?;
    handle.os_shutdown(os)?;
    handle.os_release_cpus(os, Some(&cpus[..]), ncpus)?;
    handle.os_release_mem(os, Some(&mem[..]), nmem)?;
    handle.destroy_os(os)?;
    handle.release_cpus(Some(&cpus[..]), ncpus)?;
    handle.release_mem(Some(&mem[..]), nmem)?;

    println!("instance        {}", os);
    println!("lwk cpus        {}", format_cpulist(&cpus));
    println!("status at peak  {:?}", status);
    println!("packets         {} sent, {} echoed", stats.sent, stats.received);
    println!("in order        {}", in_order);
    println!("full retries    {}", stats.full_retries);
    println!(
        "round trip      {:.1} us/packet",
        elapsed.as_secs_f64() * 1e6 / packets.max(1) as f64
    );
    println!("ipis            {}", chip.ipi_count());
    println!("--- kmsg ---");
    print!("{}", kmsg);
    Ok(())
}
