//! dmalink server: accepts one client, echoes three doubled messages, then
//! pushes a one-sided write into the client's buffer.

use clap::Parser;
use dmalink::{BufferHandle, Config, RdmaContext, Rendezvous, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Number of 32-bit words of pattern data touched per round.
const PATTERN_WORDS: usize = 256;

/// Send/receive rounds before the one-sided phase.
const ROUNDS: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "dmalink-server", about = "Zero-copy RDMA link server")]
struct Args {
    /// Rendezvous port to listen on (default 20000, env DMALINK_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// RDMA device name (first available if unset, env DMALINK_DEVICE)
    #[arg(short, long)]
    device: Option<String>,

    /// Transfer buffer size in bytes (default 4 MiB, env DMALINK_BUFFER_SIZE)
    #[arg(short = 's', long)]
    size: Option<usize>,
}

impl Args {
    /// Flags override the environment, the environment overrides defaults.
    fn resolve(&self) -> Config {
        let mut cfg = Config::from_env();
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(device) = &self.device {
            cfg.device = Some(device.clone());
        }
        if let Some(size) = self.size {
            cfg.buffer_size = size;
        }
        cfg
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = run(&args.resolve()) {
        eprintln!("server failed: {e}");
        std::process::exit(1);
    }
}

fn run(cfg: &Config) -> Result<()> {
    tracing::info!(
        port = cfg.port,
        size = cfg.buffer_size,
        device = cfg.device.as_deref().unwrap_or("<first>"),
        "dmalink server starting"
    );

    let buffer = BufferHandle::acquire(cfg.buffer_size)?;
    match buffer.dmabuf_fd() {
        Some(fd) => tracing::info!(
            fd,
            "using dmabuf-backed device memory at {:#x}",
            buffer.device_va().unwrap_or(0)
        ),
        None => tracing::info!("using host memory buffer"),
    }

    let rdma = Arc::new(RdmaContext::open(cfg.device.as_deref())?);
    let mr = rdma.register(&buffer)?;
    let prepared = rdma.prepare_connection(&mr)?;

    tracing::info!(port = cfg.port, "waiting for client connection");
    let mut sock = Rendezvous::accept(cfg.port)?;
    let remote = sock.exchange(&prepared.endpoint())?;
    let conn = prepared.complete(&remote)?;
    tracing::info!("queue pair connected");

    write_pattern(&buffer, |j| 1000 + j as i32);
    show_words("initial server data", &buffer);

    for round in 1..=ROUNDS {
        tracing::info!(round, "send/receive round");

        conn.post_recv(&mr)?;
        tracing::info!("waiting for client message");
        conn.poll_completion()?;
        show_words("received from client", &buffer);

        double_words(&buffer);
        show_words("after processing", &buffer);

        conn.post_send(&mr)?;
        conn.poll_completion()?;
        tracing::info!("response sent");
    }

    tracing::info!("pushing RDMA write to client");
    if buffer.cpu_ptr().is_some() {
        write_pattern_bounded(&buffer, 10, |j| 9000 + j as i32);
        show_words("RDMA write data", &buffer);
    }
    conn.rdma_write(&mr)?;
    conn.poll_completion()?;
    tracing::info!("RDMA write completed");

    tracing::info!("waiting for client to finish");
    sock.wait_done()?;
    tracing::info!("client finished");

    match buffer.dmabuf_fd() {
        Some(fd) => tracing::info!(fd, "done: zero-copy transfers via dmabuf"),
        None => tracing::info!("done: transfers via host memory"),
    }
    Ok(())
}

fn write_pattern(buffer: &BufferHandle, f: impl Fn(usize) -> i32) {
    write_pattern_bounded(buffer, PATTERN_WORDS, f);
}

/// Fill the first words of the buffer when it is CPU-visible; device-only
/// buffers are left to the accelerator.
fn write_pattern_bounded(buffer: &BufferHandle, count: usize, f: impl Fn(usize) -> i32) {
    let Some(ptr) = buffer.cpu_ptr() else {
        tracing::info!("buffer is device-only, skipping CPU pattern write");
        return;
    };
    let n = count.min(buffer.size() / 4);
    let words = unsafe { std::slice::from_raw_parts_mut(ptr as *mut i32, n) };
    for (j, w) in words.iter_mut().enumerate() {
        *w = f(j);
    }
}

/// Double the received words in place, standing in for accelerator work.
fn double_words(buffer: &BufferHandle) {
    let Some(ptr) = buffer.cpu_ptr() else {
        return;
    };
    let n = PATTERN_WORDS.min(buffer.size() / 4);
    let words = unsafe { std::slice::from_raw_parts_mut(ptr as *mut i32, n) };
    for w in words.iter_mut() {
        *w = w.wrapping_mul(2);
    }
}

fn show_words(label: &str, buffer: &BufferHandle) {
    let Some(ptr) = buffer.cpu_ptr() else {
        tracing::info!("{label}: data in device memory (no CPU access)");
        return;
    };
    let n = (buffer.size() / 4).min(10);
    let words = unsafe { std::slice::from_raw_parts(ptr as *const i32, n) };
    tracing::info!("{label}: {words:?}");
}
