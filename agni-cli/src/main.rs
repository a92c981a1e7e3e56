//! Thin convenience binary over `agni-asm` and `agni-vm` (§10.3):
//! assembles a `.agl` source and/or runs the resulting (or an
//! already-built `.age`) executable.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;

#[derive(Debug, clap::Parser)]
#[command(name = "agni", version, about = "Assemble and run Agni scripts")]
struct Cli {
    /// `.agl` source or `.age` executable to process.
    input: PathBuf,

    /// Write the assembled executable next to `input` (or to `--output`)
    /// without running it.
    #[arg(long)]
    assemble_only: bool,

    /// Path for the assembled executable when `--assemble-only` is set;
    /// defaults to `input` with its extension replaced by `.age`.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Host identity this run presents to the loader (§4.4).
    #[arg(long, default_value = "agni-cli")]
    host_name: String,

    #[arg(long, default_value_t = 1)]
    host_major: u8,

    #[arg(long, default_value_t = 0)]
    host_minor: u8,

    /// Overrides an executable's stack size when it did not declare one.
    #[arg(long)]
    stack_size: Option<u32>,

    /// Raises the tracing filter; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("reading \"{path}\" failed: {source}")]
    ReadInput { path: PathBuf, source: std::io::Error },
    #[error("writing \"{path}\" failed: {source}")]
    WriteOutput { path: PathBuf, source: agni_image::ImageError },
    #[error("assembling \"{path}\" failed: {source}")]
    Assemble { path: PathBuf, source: agni_asm::AssembleError },
    #[error("executable image error: {0}")]
    Image(#[from] agni_image::ImageError),
    #[error("loading the executable failed: {0}")]
    Load(#[from] agni_vm::LoadError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();
}

fn run(cli: Cli) -> Result<(), CliError> {
    let is_source = cli.input.extension().map(|ext| ext != "age").unwrap_or(true);

    let mut executable = if is_source {
        let source = fs::read_to_string(&cli.input).map_err(|source| CliError::ReadInput { path: cli.input.clone(), source })?;
        agni_asm::assemble(&source).map_err(|source| CliError::Assemble { path: cli.input.clone(), source })?
    } else {
        agni_image::read_file(&cli.input)?
    };

    if let Some(stack_size) = cli.stack_size {
        if executable.header.stack_size == agni_image::NONE_INDEX {
            executable.header.stack_size = stack_size;
            let zeroed = agni_image::to_bytes_with_checksum_zeroed(&executable)?;
            executable.header.checksum = agni_image::checksum::compute(&zeroed);
        }
    }

    if cli.assemble_only {
        let output_path = cli.output.clone().unwrap_or_else(|| cli.input.with_extension("age"));
        agni_image::write_file(&output_path, &executable).map_err(|source| CliError::WriteOutput { path: output_path.clone(), source })?;
        info!(path = %output_path.display(), "wrote assembled executable");
        return Ok(());
    }

    let mut vm = agni_vm::VirtualMachine::new(cli.host_name, cli.host_major, cli.host_minor);
    let handle = vm.load_executable(&executable)?;
    vm.start_script(handle);
    vm.run_scripts(agni_vm::INFINITE);
    Ok(())
}
