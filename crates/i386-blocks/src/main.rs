use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use i386_rs::{CpuConfig, CpuType};

mod analyze;
mod model;
use analyze::{analyze, Walker};
use model::load_raw_bin;

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-mode x86 block lister", long_about = None)]
struct Cli {
    /// Load address (linear) of the binary
    #[arg(long, default_value = "0x7c00")]
    base: String,
    /// Skip N bytes at start of file before loading
    #[arg(long, default_value_t = 0usize)]
    skip: usize,
    /// Limit bytes loaded (default: to EOF after --skip)
    #[arg(long)]
    len: Option<usize>,
    /// Decode with the i486 opcode map
    #[arg(long)]
    i486: bool,
    /// Decode x87 escapes as coprocessor instructions
    #[arg(long)]
    fpu: bool,
    #[arg(value_name = "BINFILE")]
    input: String,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List loaded segments
    Sections,
    /// Linear listing of [start, end), block by block
    Range {
        start: String,
        end: String,
        /// Write output to file instead of stdout
        #[arg(long, value_name = "FILE")]
        out: Option<String>,
    },
    /// Walk control flow from entry points
    Analyze {
        /// Entry addresses (hex or dec); defaults to the load address
        #[arg(long = "entry", value_name = "ADDR")]
        entries: Vec<String>,
        #[arg(long, default_value_t = 10_000usize)]
        max_blocks: usize,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        #[arg(long, value_name = "FILE")]
        out: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn parse_u32(s: &str) -> Result<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Ok(u32::from_str_radix(hex, 16)?)
    } else {
        Ok(s.parse::<u32>()?)
    }
}

fn emit(text: String, out: Option<String>) -> Result<()> {
    match out {
        Some(path) => std::fs::write(path, text)?,
        None => print!("{text}"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let base = parse_u32(&cli.base)?;
    let img = load_raw_bin(Path::new(&cli.input), base, cli.skip, cli.len)?;
    let cfg = CpuConfig {
        cpu_type: if cli.i486 { CpuType::I486 } else { CpuType::I386 },
        has_fpu: cli.fpu,
        cache_blocks: false,
        ..CpuConfig::default()
    };

    match cli.cmd {
        Command::Sections => {
            println!("{:<10} {:<10} {:<10}", "name", "start", "end");
            for s in &img.segments {
                let end = s.base + s.bytes.len() as u32;
                println!("{:<10} {:#010x} {end:#010x}", s.name, s.base);
            }
        }
        Command::Range { start, end, out } => {
            let start = parse_u32(&start)?;
            let end = parse_u32(&end)?;
            anyhow::ensure!(end >= start, "end must be >= start");
            let mut walker = Walker::new(&img, cfg)?;
            let mut buf = String::new();
            let mut pc = start;
            while pc < end {
                let Some((block, cs_base)) = walker.block_at(pc) else {
                    let _ = writeln!(buf, "{pc:#07x}: <unreadable>");
                    break;
                };
                for i in &block.instructions {
                    let at = cs_base + i.start;
                    if at >= end {
                        break;
                    }
                    let _ = writeln!(buf, "{at:#07x}: {}", i386_rs::disasm::fmt_instruction(i));
                }
                let next = cs_base + (block.end_eip() & 0xFFFF);
                pc = if next > pc { next } else { pc + 1 };
            }
            emit(buf, out)?;
        }
        Command::Analyze {
            entries,
            max_blocks,
            format,
            out,
        } => {
            let mut seeds = Vec::new();
            for e in &entries {
                seeds.push(parse_u32(e)?);
            }
            if seeds.is_empty() {
                seeds.push(base);
            }
            seeds.sort_unstable();
            seeds.dedup();
            let report = analyze(&img, cfg, &seeds, max_blocks)?;
            let text = match format {
                OutputFormat::Json => serde_json::to_string_pretty(&report)? + "\n",
                OutputFormat::Text => {
                    let mut s = String::new();
                    let _ = writeln!(s, "blocks: {}  edges: {}", report.blocks.len(), report.edges.len());
                    for b in &report.blocks {
                        let _ = writeln!(s, "\nloc_{:05x}:", b.start);
                        for line in &b.insns {
                            let _ = writeln!(s, "  {line}");
                        }
                    }
                    let _ = writeln!(s, "\nedges:");
                    for e in &report.edges {
                        let _ = writeln!(s, "  {:#07x} -> {:#07x} ({:?})", e.from, e.to, e.kind);
                    }
                    s
                }
            };
            emit(text, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_u32_hex_and_dec() {
        assert_eq!(parse_u32("0x7c00").unwrap(), 0x7C00);
        assert_eq!(parse_u32("16").unwrap(), 16);
        assert!(parse_u32("zz").is_err());
    }
}
