//! dmalink client: connects to the server, then drives three send/receive
//! rounds and the one-sided read/write phase over the established link.

use clap::Parser;
use dmalink::{BufferHandle, Config, RdmaContext, Rendezvous, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Number of 32-bit words of pattern data written per round.
const PATTERN_WORDS: usize = 256;

/// Send/receive rounds before the one-sided phase.
const ROUNDS: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "dmalink-client", about = "Zero-copy RDMA link client")]
struct Args {
    /// Server host to connect to
    server: String,

    /// Rendezvous port (default 20000, env DMALINK_PORT)
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

    if let Err(e) = run(&args.server, &args.resolve()) {
        eprintln!("client failed: {e}");
        std::process::exit(1);
    }
}

fn run(server: &str, cfg: &Config) -> Result<()> {
    tracing::info!(
        server,
        port = cfg.port,
        size = cfg.buffer_size,
        device = cfg.device.as_deref().unwrap_or("<first>"),
        "dmalink client starting"
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

    let mut sock = Rendezvous::connect(server, cfg.port)?;
    let remote = sock.exchange(&prepared.endpoint())?;
    let conn = prepared.complete(&remote)?;
    tracing::info!("queue pair connected");

    for round in 1..=ROUNDS {
        tracing::info!(round, "send/receive round");

        write_pattern(&buffer, |j| round * 100 + j as i32);
        show_words("sending to server", &buffer);

        conn.post_send(&mr)?;
        conn.poll_completion()?;
        tracing::info!("message sent");

        conn.post_recv(&mr)?;
        tracing::info!("waiting for server response");
        conn.poll_completion()?;
        show_words("received from server", &buffer);

        if let Some(first) = read_word(&buffer, 0) {
            let expected = round * 100 * 2;
            if first == expected {
                tracing::info!(round, "response verified");
            } else {
                tracing::warn!(expected, got = first, "unexpected response data");
            }
        }
    }

    // The server pushes a one-sided write after the rounds; give it a
    // moment since nothing signals its completion on this side.
    tracing::info!("waiting for server's RDMA write");
    std::thread::sleep(Duration::from_secs(1));
    show_words("after RDMA write", &buffer);
    if read_word(&buffer, 0) == Some(9000) {
        tracing::info!("RDMA write verified");
    }

    tracing::info!("attempting RDMA read from server");
    match conn.rdma_read(&mr).and_then(|_| conn.poll_completion()) {
        Ok(_) => {
            tracing::info!("RDMA read completed");
            show_words("read from server", &buffer);
        }
        Err(e) => {
            // Device-memory targets commonly cannot serve reads; the
            // two-sided path and RDMA write already covered the transfer.
            tracing::warn!(error = %e, "RDMA read not supported by the remote buffer");
        }
    }

    sock.signal_done()?;

    match buffer.dmabuf_fd() {
        Some(fd) => tracing::info!(fd, "done: zero-copy transfers via dmabuf"),
        None => tracing::info!("done: transfers via host memory"),
    }
    Ok(())
}

/// Fill the first words of the buffer when it is CPU-visible; device-only
/// buffers are left to the accelerator.
fn write_pattern(buffer: &BufferHandle, f: impl Fn(usize) -> i32) {
    let Some(ptr) = buffer.cpu_ptr() else {
        tracing::info!("buffer is device-only, skipping CPU pattern write");
        return;
    };
    let n = PATTERN_WORDS.min(buffer.size() / 4);
    let words = unsafe { std::slice::from_raw_parts_mut(ptr as *mut i32, n) };
    for (j, w) in words.iter_mut().enumerate() {
        *w = f(j);
    }
}

fn read_word(buffer: &BufferHandle, index: usize) -> Option<i32> {
    let ptr = buffer.cpu_ptr()?;
    if (index + 1) * 4 > buffer.size() {
        return None;
    }
    Some(unsafe { (ptr as *const i32).add(index).read() })
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
