//! `xcel` — host program for vvadd / vvdot accelerators.
//!
//! ```text
//! USAGE:
//!   xcel run <image> <size> [--profile vvadd|vvdot] [--platform auto|software|fabric]
//!            [--timeout-ms N] [--seed S]     Program, run once, verify against the CPU
//!   xcel inspect <image>                     Show the companion handoff
//! ```
//!
//! `XCEL_PLATFORM` selects the platform when `--platform` is not given.
//! `RUST_LOG` controls log output (default `warn`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use xcel_driver::prelude::*;
use xcel_driver::{companion_path, HardwareHandoff};

#[derive(Parser)]
#[command(name = "xcel", about = "Host program for HLS vector accelerators", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Program an image, run the kernel on random vectors and check the result.
    Run {
        /// Bitstream path; `<stem>.hwh` must sit next to it.
        image: PathBuf,
        /// Vector length (> 0).
        size: usize,
        /// Kernel interface.
        #[arg(long, value_enum, default_value_t = KernelArg::Vvadd)]
        profile: KernelArg,
        /// Platform (falls back to XCEL_PLATFORM, then auto).
        #[arg(long, value_enum)]
        platform: Option<PlatformArg>,
        /// Give up waiting for ap_done after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Seed for the input vectors.
        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,
    },
    /// Print the instances, windows and registers of an image's handoff.
    Inspect {
        /// Bitstream path.
        image: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KernelArg {
    Vvadd,
    Vvdot,
}

impl From<KernelArg> for Profile {
    fn from(arg: KernelArg) -> Self {
        match arg {
            KernelArg::Vvadd => Self::VectorAdd,
            KernelArg::Vvdot => Self::VectorDot,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PlatformArg {
    Auto,
    Software,
    Fabric,
}

impl From<PlatformArg> for PlatformSelection {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Auto => Self::Auto,
            PlatformArg::Software => Self::Software,
            PlatformArg::Fabric => Self::Fabric,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Run {
            image,
            size,
            profile,
            platform,
            timeout_ms,
            seed,
        } => {
            let selection = match platform {
                Some(arg) => arg.into(),
                None => PlatformSelection::from_env()
                    .context("reading XCEL_PLATFORM")?
                    .unwrap_or_default(),
            };
            let mut config = SessionConfig::new(profile.into());
            if let Some(ms) = timeout_ms {
                config = config.with_timeout(Duration::from_millis(ms));
            }
            cmd_run(&image, size, selection, config, seed)?;
        }
        Cmd::Inspect { image } => cmd_inspect(&image)?,
    }

    Ok(())
}

fn cmd_run(
    image: &Path,
    size: usize,
    selection: PlatformSelection,
    config: SessionConfig,
    seed: u64,
) -> Result<()> {
    if size == 0 {
        bail!("size must be greater than 0");
    }
    let profile = config.profile;
    tracing::debug!(?selection, %profile, size, seed, "run requested");
    let mut session = AcceleratorSession::open(selection, config)
        .with_context(|| format!("selecting {selection:?} platform"))?;

    println!("Programming hardware with {}", image.display());
    session
        .program(image)
        .with_context(|| format!("programming {}", image.display()))?;

    println!("Running {profile} of size {size}");
    let mut rng = Xoshiro::new(seed);
    match profile {
        Profile::VectorAdd => run_vvadd(&mut session, size, &mut rng),
        Profile::VectorDot => run_vvdot(&mut session, size, &mut rng),
    }
}

fn run_vvadd(session: &mut AcceleratorSession, size: usize, rng: &mut Xoshiro) -> Result<()> {
    let a = rng.gen_f32(size);
    let b = rng.gen_f32(size);

    let start = Instant::now();
    let reference: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
    let sw = start.elapsed();
    println!("Software vvadd finished in {:.4} ms", ms(sw));

    session.load_inputs(&a, &b).context("loading inputs")?;
    session.allocate_output(size).context("allocating output")?;
    let report = session.run().context("running vvadd")?;
    println!("Hardware vvadd finished in {:.4} ms ({} polls)", ms(report.elapsed), report.polls);

    let c = report
        .output
        .vector()
        .context("vvadd produced no output vector")?
        .as_slice::<f32>()?;
    let mismatches: Vec<usize> = (0..size).filter(|&i| c[i] != reference[i]).collect();
    if let Some(&first) = mismatches.first() {
        bail!(
            "results do not match at {} of {size} elements (first at {first}: expected {}, got {})",
            mismatches.len(),
            reference[first],
            c[first]
        );
    }
    println!("Results match!");
    print_speedup(sw, report.elapsed);
    Ok(())
}

fn run_vvdot(session: &mut AcceleratorSession, size: usize, rng: &mut Xoshiro) -> Result<()> {
    let a = rng.gen_digits(size);
    let b = rng.gen_digits(size);

    let start = Instant::now();
    let reference = a
        .iter()
        .zip(&b)
        .fold(0i32, |acc, (x, y)| acc.wrapping_add(x.wrapping_mul(*y)));
    let sw = start.elapsed();
    println!("Software vvdot finished in {:.4} ms", ms(sw));

    session.load_inputs(&a, &b).context("loading inputs")?;
    let report = session.run().context("running vvdot")?;
    println!("Hardware vvdot finished in {:.4} ms ({} polls)", ms(report.elapsed), report.polls);

    let result = report
        .output
        .scalar()
        .context("vvdot produced no scalar result")?;
    if result != i64::from(reference) {
        bail!("results do not match: reference {reference}, actual {result}");
    }
    println!("Results match!");
    print_speedup(sw, report.elapsed);
    Ok(())
}

fn cmd_inspect(image: &Path) -> Result<()> {
    let path = companion_path(image);
    let handoff = HardwareHandoff::load(&path)
        .with_context(|| format!("inspecting {}", image.display()))?;

    println!("Handoff : {}", path.display());
    println!("Modules : {}", handoff.modules().len());
    println!();
    for module in handoff.modules() {
        let kernel = Profile::from_instance(module.instance())
            .or_else(|| module.modtype().and_then(Profile::from_kernel));
        print!("{}", module.instance());
        if let Some(modtype) = module.modtype() {
            print!("  ({modtype})");
        }
        if let Some(profile) = kernel {
            print!("  [profile {profile}]");
        }
        println!();
        if let Some(window) = module.window() {
            println!(
                "     window {:#010x}..={:#010x}  ({} KiB)",
                window.base,
                window.high,
                window.size() >> 10
            );
        }
        let mut registers: Vec<(&String, &usize)> = module.registers().iter().collect();
        registers.sort_by_key(|(_, offset)| **offset);
        for (name, offset) in registers {
            println!("     {offset:#06x}  {name}");
        }
    }
    Ok(())
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1e3
}

fn print_speedup(sw: Duration, hw: Duration) {
    if hw.is_zero() {
        println!("Speedup: n/a (hardware time below timer resolution)");
    } else {
        println!("Speedup: {:.2}x", sw.as_secs_f64() / hw.as_secs_f64());
    }
}

// ── PRNG ─────────────────────────────────────────────────────────────────────

struct Xoshiro {
    s: [u64; 4],
}

impl Xoshiro {
    fn new(seed: u64) -> Self {
        let s = [
            seed ^ 0x9e37_79b9_7f4a_7c15,
            seed.wrapping_add(0x6c62_272e_07bb_0142),
            seed.rotate_left(17),
            seed.rotate_right(5),
        ];
        let mut rng = Self { s };
        for _ in 0..20 {
            let _ = rng.next_u64();
        }
        rng
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.s[0].wrapping_add(self.s[3]))
            .rotate_left(23)
            .wrapping_add(self.s[0]);
        let t = self.s[1] << 17;
        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);
        result
    }

    /// Uniform in [-1, 1).
    fn gen_f32(&mut self, len: usize) -> Vec<f32> {
        (0..len)
            .map(|_| {
                let bits = (self.next_u64() >> 41) as u32 | 0x3f80_0000;
                (f32::from_bits(bits) - 1.0) * 2.0 - 1.0
            })
            .collect()
    }

    /// Integers in 0..=9.
    fn gen_digits(&mut self, len: usize) -> Vec<i32> {
        (0..len).map(|_| (self.next_u64() % 10) as i32).collect()
    }
}
