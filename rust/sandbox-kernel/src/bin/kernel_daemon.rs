use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use sandbox_kernel::{
    ConsoleRecord, ConsoleStream, EventKind, Kernel, KernelConfig, KernelEvent, ScriptedExecutor,
};

#[derive(Parser, Debug)]
#[command(name = "kernel_daemon")]
#[command(about = "Boot a sandbox kernel, run scripted programs to completion and report.", long_about = None)]
struct Args {
    /// Kernel configuration (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host file holding a scripted program to spawn after boot.
    #[arg(long = "program")]
    programs: Vec<PathBuf>,

    #[arg(long, default_value_t = 1_000)]
    max_ticks: usize,

    /// Write a snapshot of the final machine state here.
    #[arg(long)]
    snapshot_out: Option<PathBuf>,

    /// Write the event log here, one JSON object per line.
    #[arg(long)]
    events_out: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: starting runtime: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(args)) {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => KernelConfig::from_path(path)?,
        None => KernelConfig::default(),
    };

    let mut kernel = Kernel::new(config);
    let init = kernel.boot().await?;
    if let Some(pid) = init {
        info!("init running as pid {pid}");
    }

    for path in &args.programs {
        let code = fs::read_to_string(path)
            .with_context(|| format!("reading program {}", path.display()))?;
        let pid = kernel
            .spawn_program(&code, vec![path.display().to_string()])
            .await
            .with_context(|| format!("spawning {}", path.display()))?;
        info!("spawned {} as pid {pid}", path.display());
    }

    let mut executor = ScriptedExecutor::new();
    let ticks = kernel.run_until_idle(&mut executor, args.max_ticks).await;

    print_console(&kernel.take_console());
    print_ps(&kernel, ticks);

    if let Some(path) = &args.snapshot_out {
        let snapshot = kernel.snapshot().await?;
        fs::write(path, snapshot.to_json()?)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        println!("snapshot {} written to {}", snapshot.digest(), path.display());
    }

    let events = kernel.drain_events();
    if let Some(path) = &args.events_out {
        write_events(&events, path)?;
    }
    print_summary(&events);

    Ok(())
}

fn write_events(events: &[KernelEvent], path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    for event in events {
        let line = serde_json::to_string(&event.to_json())?;
        writeln!(writer, "{}", line)?;
    }

    writer.flush()?;
    Ok(())
}

fn print_console(records: &[ConsoleRecord]) {
    for record in records {
        let text = String::from_utf8_lossy(&record.data);
        match record.stream {
            ConsoleStream::Stdout => println!("[{}] {}", record.pid, text.trim_end()),
            ConsoleStream::Stderr => println!("[{}!] {}", record.pid, text.trim_end()),
        }
    }
}

fn print_ps(kernel: &Kernel, ticks: usize) {
    println!("after {ticks} ticks:");
    println!("{:>5}  {:<8}  {:>8}  {:>10}  ARGV", "PID", "STATE", "CPU_MS", "MEM");
    for entry in kernel.processes().ps() {
        let state = if entry.exited { "exited" } else { "running" };
        println!(
            "{:>5}  {:<8}  {:>8}  {:>10}  {}",
            entry.pid,
            state,
            entry.cpu_ms,
            entry.mem_bytes,
            entry.argv.join(" ")
        );
    }
}

fn print_summary(events: &[KernelEvent]) {
    let killed = events
        .iter()
        .filter(|event| matches!(event.kind, EventKind::QuotaKilled | EventKind::Killed))
        .count();
    let denied = events
        .iter()
        .filter(|event| event.kind == EventKind::SyscallDenied)
        .count();
    println!(
        "{} events, {} kills, {} denied syscalls",
        events.len(),
        killed,
        denied
    );
}
