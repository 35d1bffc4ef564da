//! VM lifecycle and the exit dispatch loop.
//!
//! [`run`] owns the whole life of a guest: create the VM, provision memory,
//! load images, bootstrap the vCPU, then loop on `KVM_RUN` servicing exits
//! until the guest asks to shut down.
//!
//! The paravirtual I/O surface is three port operations:
//!
//! | Port  | Direction | Meaning                                      |
//! |-------|-----------|----------------------------------------------|
//! | 0xE9  | OUT       | raw bytes to the configured output stream    |
//! | 0xE9  | IN        | raw bytes from the configured input stream   |
//! | 0x604 | OUT       | value 0x2000 requests an orderly shutdown    |
//!
//! Everything is single-threaded: one host thread drives one vCPU, and the
//! only blocking point is inside `KVM_RUN`. Output bytes reach the stream in
//! guest-emission order and are flushed after every OUT; input bytes are
//! delivered in stream order, zero-padded once the stream hits end of file.
//! Any exit reason outside the table above is fatal.

use crate::boot::{self, BootError, EntryMode, GuestMemory};
use crate::kvm::{self, KvmError, VcpuExit};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Debug console port: OUT writes bytes, IN reads them.
pub const CONSOLE_PORT: u16 = 0xe9;

/// ACPI-style shutdown port.
pub const SHUTDOWN_PORT: u16 = 0x604;

/// Value written to [`SHUTDOWN_PORT`] to request shutdown.
const SHUTDOWN_MAGIC: u32 = 0x2000;

/// Errors surfaced by the core to the front end.
#[derive(Error, Debug)]
pub enum VmmError {
    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error(transparent)]
    Boot(#[from] BootError),

    /// A guest console stream failed (end of input is not an error).
    #[error("guest console stream error: {0}")]
    Io(#[from] io::Error),

    /// The guest triggered a VM exit outside the paravirtual contract.
    #[error("unexpected VM exit: {0}")]
    UnexpectedExit(&'static str),
}

/// Everything the core needs to boot and run one guest.
pub struct Config {
    /// Path to the ELF32 kernel image.
    pub kernel_path: String,
    /// Optional init RAM disk, staged at guest physical 0x00800000.
    pub initrd_path: Option<String>,
    /// Guest physical memory size in bytes.
    pub mem_size: u64,
    /// CPU mode at the entry point.
    pub mode: EntryMode,
    /// Stream receiving guest console output.
    pub stdout: Box<dyn Write>,
    /// Stream supplying guest console input.
    pub stdin: Box<dyn Read>,
}

/// What the dispatch loop should do after an exit has been serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopAction {
    /// Re-enter the guest.
    Continue,
    /// The guest requested shutdown; leave the loop successfully.
    Shutdown,
}

/// The guest console: two byte streams behind the 0xE9 port.
///
/// The streams are injected by the front end; process stdout/stdin are just
/// one choice. The console owns them for the duration of the run.
struct Console {
    stdout: Box<dyn Write>,
    stdin: Box<dyn Read>,
}

impl Console {
    /// Emit one OUT payload and flush, so guest output is never buffered
    /// across exits.
    fn write_out(&mut self, data: &[u8]) -> io::Result<()> {
        self.stdout.write_all(data)?;
        self.stdout.flush()
    }

    /// Fill one IN payload from the input stream.
    ///
    /// Short reads and end of file leave the remaining bytes zero; the
    /// guest observes zeros past the end of input rather than an error.
    fn read_in(&mut self, data: &mut [u8]) -> io::Result<()> {
        data.fill(0);

        let mut filled = 0;
        while filled < data.len() {
            match self.stdin.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Zero-extend a 1, 2, or 4 byte little-endian port payload.
fn pio_value(data: &[u8]) -> u32 {
    data.iter()
        .take(4)
        .enumerate()
        .fold(0, |value, (i, byte)| value | (*byte as u32) << (8 * i))
}

/// Service one decoded VM exit.
///
/// Total over [`VcpuExit`]: every in-contract exit maps to a [`LoopAction`],
/// and everything else is the explicit fatal branch. Exits are serviced
/// strictly in the order the guest produced them.
fn service_exit(exit: VcpuExit<'_>, console: &mut Console) -> Result<LoopAction, VmmError> {
    match exit {
        VcpuExit::Hlt => Ok(LoopAction::Continue),

        VcpuExit::IoOut(CONSOLE_PORT, data) => {
            console.write_out(data)?;
            Ok(LoopAction::Continue)
        }

        VcpuExit::IoOut(SHUTDOWN_PORT, data) if pio_value(data) == SHUTDOWN_MAGIC => {
            Ok(LoopAction::Shutdown)
        }

        // Writes to unrecognized ports (and unrecognized shutdown values)
        // are ignored; there is no device behind them.
        VcpuExit::IoOut(..) => Ok(LoopAction::Continue),

        VcpuExit::IoIn(CONSOLE_PORT, data) => {
            console.read_in(data)?;
            Ok(LoopAction::Continue)
        }

        // Reads from unrecognized ports leave the payload untouched.
        VcpuExit::IoIn(..) => Ok(LoopAction::Continue),

        VcpuExit::Unsupported(reason) => Err(VmmError::UnexpectedExit(reason)),
    }
}

/// Boot the configured guest and service its exits until shutdown.
///
/// Returns `Ok(())` when the guest requests shutdown through the shutdown
/// port. Every error is terminal: there are no retries and no recovery.
pub fn run(config: Config) -> Result<(), VmmError> {
    let vm = kvm::create_vm()?;

    let memory = GuestMemory::new(config.mem_size)?;
    memory.install_into(&vm)?;

    let mut vcpu = vm.create_vcpu(0)?;

    let kernel = boot::load_kernel(&memory, &config.kernel_path)?;
    let initrd = match &config.initrd_path {
        Some(path) => Some(boot::load_initrd(&memory, &kernel, path)?),
        None => None,
    };

    boot::bootstrap_vcpu(&vcpu, config.mode, kernel.entry, initrd.as_ref())?;

    let mut console = Console {
        stdout: config.stdout,
        stdin: config.stdin,
    };

    loop {
        let exit = vcpu.run()?;
        match service_exit(exit, &mut console)? {
            LoopAction::Continue => {}
            LoopAction::Shutdown => return Ok(()),
        }
    }
}
