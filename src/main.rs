use std::io::Write;
use std::path::PathBuf;

use allegrex_dynarec::*;

fn parse_u32(s: &str) -> anyhow::Result<u32> {
    Ok(match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => s.parse()?,
    })
}

#[argopt::subcmd]
fn run(
    /// `jit` or `interpreter`
    #[opt(long, default_value = "jit")]
    engine: String,
    /// Always return to the dispatcher at block exits
    #[opt(long)]
    no_block_link: bool,
    #[opt(long, default_value = "128")] max_block_insts: usize,
    #[opt(long, default_value = "0x08800000")] load_addr: String,
    /// Defaults to the load address
    #[opt(long)]
    entry: Option<String>,
    #[opt(long, default_value = "33554432")] mem_size: usize,
    /// Stop after this many guest cycles
    #[opt(long, default_value = "10000000000")]
    cycles: u64,
    bin: PathBuf,
) -> anyhow::Result<()> {
    let bin = std::fs::read(bin)?;
    let load_addr = parse_u32(&load_addr)?;
    let entry = match entry {
        Some(entry) => parse_u32(&entry)?,
        None => load_addr,
    };

    let mut mem = cpu::Memory::new(mem_size)?;
    mem.load(load_addr, &bin)?;

    let kernel = hle::SimpleKernel::new(std::io::stdout());
    let sys = machine::System::new(mem, entry, kernel);

    let mut m = match engine.as_ref() {
        "interpreter" => machine::Machine::interpreter(sys),
        "jit" => machine::Machine::jit(
            sys,
            jit::JitOptions {
                enable_block_link: !no_block_link,
                max_block_instructions: max_block_insts,
                ..Default::default()
            },
        )?,
        _ => anyhow::bail!("unknown engine: {}", engine),
    };

    m.run(cycles)?;
    std::io::stdout().flush()?;

    log::info!(
        "*** Stopped at pc={:08x} after {} cycles ({} idle)",
        m.sys.cpu.pc,
        m.sys.timing.ticks(),
        m.sys.timing.idled_cycles()
    );
    let exit_code = m.sys.kernel.exit_code();
    drop(m);
    if let Some(code) = exit_code.filter(|&c| c != 0) {
        std::process::exit(code as i32);
    }

    Ok(())
}

#[argopt::subcmd]
fn disasm(
    #[opt(long, default_value = "0x08800000")] load_addr: String,
    bin: PathBuf,
) -> anyhow::Result<()> {
    let bin = std::fs::read(bin)?;
    let asm = mips::disasm::disasm(parse_u32(&load_addr)?, &mips::disasm::decode(&bin)?);

    for instr in asm {
        println!("{}", instr);
    }

    Ok(())
}

#[argopt::cmd_group(commands = [run, disasm])]
fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
}
