//! Dumps an STF trace in the human-readable format (§6), mirroring
//! `samply`'s `env_logger::init()` + clap-derive `Opt::parse()` driver.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use stf_trace::{
    format_instruction, open_pte_sibling_stream, open_read, open_write, read_header,
    set_show_physical_address, single_threaded_from_env, Materialiser, RegisterBank, StfConfig,
};

#[derive(Debug, Parser)]
#[command(
    name = "stf_dump",
    version,
    about = "Dumps a Simple Trace Format (STF) trace as human-readable text."
)]
struct Opt {
    /// Path to the trace (`.stf`, `.stf.gz`, `.stf.xz`, `.zstf`, or `-`).
    trace: PathBuf,

    /// Where to write the dump (defaults to stdout).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Only materialise user-mode instructions (§4.6).
    #[arg(long)]
    user_mode_only: bool,

    /// Include physical-address columns in the output.
    #[arg(long)]
    show_physical_address: bool,

    /// Also open and dump the `-pte` sibling trace, if present.
    #[arg(long)]
    with_pte: bool,

    /// With `--with-pte`, treat a missing sibling as an error.
    #[arg(long)]
    require_pte: bool,
}

fn run(opt: Opt) -> anyhow::Result<()> {
    let trace_path = opt.trace.to_string_lossy().into_owned();
    let single_threaded = single_threaded_from_env()?;
    log::debug!("opening '{trace_path}' (single_threaded={single_threaded})");

    set_show_physical_address(opt.show_physical_address);

    let input = open_read(&trace_path)?;
    let mut read_stream = stf_trace::ReadStream::new(input);
    let header = read_header(&mut read_stream)?;
    log::info!(
        "trace version {}.{}, isa {:?}, iem {:?}",
        header.version.0,
        header.version.1,
        header.isa,
        header.iem
    );

    let stf_config = StfConfig {
        materialiser: stf_trace::MaterialiserConfig {
            user_mode_only: opt.user_mode_only,
            ..Default::default()
        },
        open_pte_sibling: opt.with_pte,
        require_pte_sibling: opt.require_pte,
    };

    let mut materialiser = Materialiser::new(read_stream, header.iem, stf_config.materialiser);
    let regs = RegisterBank::new_riscv(header.iem);

    let mut out: Box<dyn std::io::Write> = match &opt.output {
        Some(path) => Box::new(open_write(&path.to_string_lossy())?),
        None => Box::new(std::io::stdout()),
    };

    let mut count = 0u64;
    let mut line = String::new();
    while let Some(inst) = materialiser.next_instruction()? {
        line.clear();
        format_instruction(&mut line, &inst, &regs)?;
        out.write_all(line.as_bytes())?;
        count += 1;
    }
    log::info!("dumped {count} instructions");

    if stf_config.open_pte_sibling {
        match open_pte_sibling_stream(&trace_path, stf_config.require_pte_sibling)? {
            Some(mut walks) => {
                let mut walk_count = 0u64;
                while let Some(walk) = walks.next_walk()? {
                    writeln!(
                        out,
                        "PTE_WALK va=0x{:016x} first_access={} page_size={} ptes={}",
                        walk.va,
                        walk.first_access_index,
                        walk.page_size,
                        walk.ptes.len()
                    )?;
                    walk_count += 1;
                }
                log::info!("dumped {walk_count} page-table walks");
            }
            None => log::info!("no page-table sibling trace found"),
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let opt = Opt::parse();
    match run(opt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("stf_dump: {e:#}");
            ExitCode::FAILURE
        }
    }
}
