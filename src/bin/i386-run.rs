use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use i386_rs::regs::Flags;
use i386_rs::{disasm::dump_state, Board, Cpu, CpuConfig, CpuType, I386Decoder, IntExecutor, Trap};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CpuArg {
    I386,
    I486,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a raw x86 image on the i386-rs core")]
struct Opts {
    /// CPU configuration as JSON (fields of CpuConfig; missing ones default)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    cpu: Option<CpuArg>,
    /// Attach an x87 coprocessor
    #[arg(long)]
    fpu: bool,
    /// Decode every block afresh
    #[arg(long)]
    no_cache: bool,
    /// RAM size in MiB
    #[arg(long, default_value_t = 16)]
    mem: usize,
    /// Physical load address (hex or dec); default places the image at the
    /// top of the first megabyte like a BIOS
    #[arg(long)]
    load: Option<String>,
    /// Real-mode entry point as SEG:OFF instead of the reset vector
    #[arg(long, value_name = "SEG:OFF")]
    entry: Option<String>,
    /// Block budget
    #[arg(long, default_value_t = 10_000_000u64)]
    steps: u64,
    /// Print the final register state as JSON
    #[arg(long)]
    json: bool,
    #[arg(value_name = "BINFILE")]
    input: PathBuf,
}

fn parse_u32(s: &str) -> Result<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Ok(u32::from_str_radix(hex, 16)?)
    } else {
        Ok(s.parse::<u32>()?)
    }
}

fn parse_entry(s: &str) -> Result<(u16, u16)> {
    let Some((seg, off)) = s.split_once(':') else {
        bail!("entry must be SEG:OFF in hex, got {s:?}");
    };
    Ok((u16::from_str_radix(seg, 16)?, u16::from_str_radix(off, 16)?))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let mut cfg = match &opts.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<CpuConfig>(&text).context("parsing CPU configuration")?
        }
        None => CpuConfig::default(),
    };
    match opts.cpu {
        Some(CpuArg::I386) => cfg.cpu_type = CpuType::I386,
        Some(CpuArg::I486) => cfg.cpu_type = CpuType::I486,
        None => {}
    }
    cfg.has_fpu |= opts.fpu;
    if opts.no_cache {
        cfg.cache_blocks = false;
    }

    let bytes = std::fs::read(&opts.input).with_context(|| format!("reading {}", opts.input.display()))?;
    let load = match &opts.load {
        Some(s) => parse_u32(s)?,
        None => 0x10_0000u32
            .checked_sub(bytes.len() as u32)
            .context("image larger than the first megabyte")?,
    };
    let mut board = Board::new(opts.mem << 20);
    board.load(load, &bytes)?;

    let mut cpu = Cpu::new(cfg);
    if let Some(entry) = &opts.entry {
        let (cs, ip) = parse_entry(entry)?;
        cpu.set_entry(cs, ip);
    }
    info!(load, size = bytes.len(), ?cfg, "starting");

    let dec = I386Decoder::new();
    let exec = IntExecutor;
    let mut outcome = None;
    for _ in 0..opts.steps {
        if let Err(trap) = cpu.step(&mut board, &dec, &exec) {
            outcome = Some(trap);
            break;
        }
        // Nothing can wake a halted CPU with interrupts masked.
        if cpu.halted && !cpu.regs.eflags.contains(Flags::IF) {
            break;
        }
    }

    match outcome {
        Some(Trap::Shutdown) => eprintln!("shutdown (triple fault)"),
        Some(trap) => eprintln!("TRAP: {trap}"),
        None if cpu.halted => eprintln!("halted"),
        None => eprintln!("step budget exhausted"),
    }
    let (pages, blocks) = cpu.cache_stats();
    info!(cycles = cpu.cycles, pages, blocks, "finished");
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&cpu.regs)?);
    } else {
        print!("{}", dump_state(&cpu, None));
    }
    for w in &board.writes {
        println!("out {:#06x} <- {:#x}", w.port, w.value);
    }
    Ok(())
}
