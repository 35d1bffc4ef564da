//! microvm - a minimal KVM hypervisor for 32-bit guest kernels.
//!
//! Boots a statically linked ELF32 kernel (optionally with an init RAM disk)
//! on a single vCPU and services its paravirtual console until the guest
//! requests shutdown. Requires Linux with KVM; it will not run elsewhere.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod vmm;

use clap::Parser;
use std::process::ExitCode;

/// The command-line flags as documented: single-dash long names in the
/// QEMU tradition (`-kernel`, `-memory 128M`, ...). clap only understands
/// `--long` options, so [`normalize_flags`] rewrites these spellings before
/// parsing; the `--` forms work too.
#[derive(Parser, Debug)]
#[command(name = "microvm")]
#[command(about = "A minimal KVM hypervisor that boots 32-bit guest kernels")]
struct Args {
    /// Path to the guest kernel (32-bit little-endian x86 ELF executable)
    #[arg(long)]
    kernel: String,

    /// Init RAM disk, staged at guest physical 0x00800000
    #[arg(long)]
    initrd: Option<String>,

    /// Guest memory size; a K, M, or G suffix is required
    #[arg(long, default_value = "128M", value_parser = parse_mem_size)]
    memory: u64,

    /// Enter the guest in 32-bit protected mode instead of real mode
    #[arg(long)]
    protected: bool,

    /// Redirect guest console output to a file (created, truncated)
    #[arg(long)]
    stdout: Option<String>,

    /// Read guest console input from a file
    #[arg(long)]
    stdin: Option<String>,
}

/// The documented single-dash flag spellings.
const FLAGS: [&str; 6] = [
    "-kernel",
    "-initrd",
    "-memory",
    "-protected",
    "-stdout",
    "-stdin",
];

/// Rewrite the documented `-flag` spellings into clap's `--flag` form.
///
/// Only exact matches against [`FLAGS`] are rewritten; flag values and
/// anything else on the command line pass through untouched.
fn normalize_flags(argv: impl IntoIterator<Item = String>) -> Vec<String> {
    argv.into_iter()
        .map(|arg| {
            if FLAGS.contains(&arg.as_str()) {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}

/// Parse a memory size such as `128M` or `1g` into bytes.
///
/// The unit suffix is mandatory so a bare number cannot be silently taken
/// as bytes when megabytes were meant.
fn parse_mem_size(arg: &str) -> Result<u64, String> {
    let (number, suffix) = arg.split_at(arg.len().saturating_sub(1));

    let unit: u64 = match suffix {
        "K" | "k" => 1024,
        "M" | "m" => 1024 * 1024,
        "G" | "g" => 1024 * 1024 * 1024,
        _ => return Err(format!("memory size '{arg}' needs a K, M, or G suffix")),
    };

    let count: u64 = number
        .parse()
        .map_err(|_| format!("invalid memory size '{arg}'"))?;
    if count == 0 {
        return Err("memory size must be positive".to_string());
    }

    count
        .checked_mul(unit)
        .ok_or_else(|| format!("memory size '{arg}' is too large"))
}

fn main() -> ExitCode {
    let args = match Args::try_parse_from(normalize_flags(std::env::args())) {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::FAILURE,
            };
        }
    };

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use boot::EntryMode;
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::time::Instant;

    let mode = if args.protected {
        EntryMode::Protected
    } else {
        EntryMode::Real
    };

    eprintln!("[VMM] kernel: {}", args.kernel);
    eprintln!("[VMM] memory: {} bytes, entry mode: {:?}", args.memory, mode);

    let stdout: Box<dyn Write> = match &args.stdout {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };
    let stdin: Box<dyn Read> = match &args.stdin {
        Some(path) => Box::new(File::open(path)?),
        None => Box::new(io::stdin()),
    };

    let config = vmm::Config {
        kernel_path: args.kernel,
        initrd_path: args.initrd,
        mem_size: args.memory,
        mode,
        stdout,
        stdin,
    };

    let start = Instant::now();
    vmm::run(config)?;
    eprintln!("[VMM] guest shut down after {:?}", start.elapsed());

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("microvm requires Linux with KVM support".into())
}
