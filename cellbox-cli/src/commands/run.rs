use std::io::Write;
use std::path::PathBuf;

use cellbox::{BoxCommand, BoxHandle, BoxOptions, CellboxRuntime, ExecChunk, RootfsSpec, StopTimeout};
use cellbox_shared::constants::exit;
use clap::Args;
use futures::StreamExt;

/// Exit status when the command could not be started.
pub const EXIT_NOT_FOUND: u8 = 127;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of CPUs
    #[arg(long)]
    pub cpus: Option<u8>,

    /// Memory limit in MiB
    #[arg(short, long = "memory")]
    pub memory_mib: Option<u32>,

    /// Assign a name to the box
    #[arg(long)]
    pub name: Option<String>,

    /// Set environment variables (KEY=VALUE)
    #[arg(short, long, value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Working directory inside the box
    #[arg(short, long = "workdir")]
    pub working_dir: Option<String>,

    /// Use a prepared root filesystem directory instead of an image
    #[arg(long)]
    pub rootfs: bool,

    /// Seconds to wait after Ctrl-C before killing the command (0 = default)
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub stop_timeout: i32,

    /// Image reference, or a directory with --rootfs
    pub image: String,

    /// Command and arguments, after `--`
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

impl RunArgs {
    fn box_options(&self) -> BoxOptions {
        let rootfs = if self.rootfs {
            RootfsSpec::RootfsPath(absolute(&self.image))
        } else {
            RootfsSpec::Image(self.image.clone())
        };
        BoxOptions {
            name: self.name.clone(),
            rootfs,
            cpus: self.cpus,
            memory_mib: self.memory_mib,
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
        }
    }
}

fn absolute(path: &str) -> String {
    let path = PathBuf::from(path);
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir().map(|cwd| cwd.join(&path)).unwrap_or(path)
    };
    path.to_string_lossy().into_owned()
}

/// Run the command and return the process exit status for the CLI.
pub async fn execute(args: RunArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<u8> {
    let runtime = global.create_runtime()?;

    let handle = runtime.create(args.box_options()).await?;
    let result = run_in_box(&handle, &args).await;

    // Best effort: the exit status matters more than cleanup errors.
    if let Err(e) = teardown(&runtime, &handle).await {
        tracing::warn!(box_id = %handle.id(), error = %e, "Failed to remove box");
    }

    result
}

async fn run_in_box(handle: &BoxHandle, args: &RunArgs) -> anyhow::Result<u8> {
    handle.start().await?;

    let (program, rest) = args
        .command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("no command given"))?;
    let mut execution = handle
        .exec(BoxCommand::new(program.as_str()).args(rest.iter().cloned()))
        .await?;

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let mut interrupted = false;

    loop {
        let item = tokio::select! {
            item = execution.next() => item,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::info!(box_id = %handle.id(), "Interrupted, stopping box");
                let handle = handle.clone();
                let timeout = StopTimeout::from(args.stop_timeout);
                tokio::spawn(async move { handle.stop(timeout).await });
                continue;
            }
        };

        match item {
            Some(Ok(ExecChunk::Stdout(bytes))) => {
                stdout.write_all(&bytes)?;
                stdout.flush()?;
            }
            Some(Ok(ExecChunk::Stderr(bytes))) => {
                stderr.write_all(&bytes)?;
                stderr.flush()?;
            }
            Some(Ok(ExecChunk::Exit(code))) => return Ok(exit_status(code)),
            // Killed by our own stop: report like a shell would for SIGINT.
            Some(Err(cellbox::CellboxError::Stopped(_))) if interrupted => return Ok(130),
            Some(Err(e)) => return Err(e.into()),
            None => anyhow::bail!("execution ended without an exit status"),
        }
    }
}

async fn teardown(runtime: &CellboxRuntime, handle: &BoxHandle) -> anyhow::Result<()> {
    runtime.remove(handle.id().as_str(), true).await?;
    Ok(())
}

/// Map a box exit code to a process exit status.
fn exit_status(code: i32) -> u8 {
    match code {
        exit::SPAWN_FAILED => EXIT_NOT_FOUND,
        0..=255 => code as u8,
        c if c < 0 => 128u8.saturating_add((-c).min(127) as u8),
        _ => 1,
    }
}
