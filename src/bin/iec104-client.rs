//! CLI entrypoint standing in for the south-service host this crate is
//! embedded in (spec.md §1 treats the real host as an external
//! collaborator). Reads the three configuration documents from disk, wires
//! up a stdout ingest sink, and runs until interrupted — enough to exercise
//! the control surface end to end outside of a real SCADA plugin host.

use std::fs;
use std::sync::Arc;

use clap::Parser;

use iec104_client_connector::{ControlSurface, Error};

#[derive(Parser, Debug)]
#[command(name = "iec104-client", version, about = "IEC 60870-5-104 client connector")]
struct Cli {
    /// Path to the protocol-stack JSON document.
    #[arg(long)]
    protocol_stack: String,

    /// Path to the exchange JSON document.
    #[arg(long)]
    exchange: String,

    /// Path to the TLS JSON document (only required when a redundancy
    /// group enables TLS).
    #[arg(long)]
    tls: Option<String>,

    /// Directory certificate filenames in the TLS document are resolved
    /// against (spec.md §6: `<data_dir>/etc/certs/`).
    #[arg(long, default_value = ".")]
    data_dir: String,
}

fn main() {
    pretty_env_logger::init();

    let cli = Cli::parse();
    let protocol_json = fs::read_to_string(&cli.protocol_stack).expect("failed to read protocol-stack document");
    let exchange_json = fs::read_to_string(&cli.exchange).expect("failed to read exchange document");
    let tls_json = cli.tls.map(|p| fs::read_to_string(p).expect("failed to read TLS document"));

    let surface = Arc::new(ControlSurface::new(cli.data_dir));
    surface
        .set_config(&protocol_json, &exchange_json, tls_json.as_deref())
        .expect("configuration error");

    surface.register_ingest(Arc::new(|reading| {
        log::info!(
            "reading label={} ca={} ioa={} cot={} value={:?} quality={:?}",
            reading.label,
            reading.do_ca,
            reading.do_ioa,
            reading.do_cot,
            reading.do_value,
            reading.do_quality
        );
    }));

    match surface.start() {
        Ok(()) => log::info!("connector started"),
        Err(Error::NotReady(msg)) => {
            eprintln!("not ready: {msg}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("failed to start: {e}");
            std::process::exit(1);
        }
    }

    ctrlc_block_until_interrupted();

    surface.stop();
    log::info!("closing");
}

/// Blocks the main thread until `SIGINT`-equivalent user interruption.
/// A minimal stand-in for the host process's own lifecycle management;
/// this binary exists only to exercise the control surface manually.
fn ctrlc_block_until_interrupted() {
    let (tx, rx) = std::sync::mpsc::channel();
    let _ = ctrlc_handler(move || {
        let _ = tx.send(());
    });
    let _ = rx.recv();
}

/// Registers a handler invoked once the process receives an interrupt
/// signal. Implemented with a dedicated OS signal crate is out of scope
/// for this demo binary; instead a background thread watches stdin for
/// EOF, which is what a host typically closes on shutdown.
fn ctrlc_handler(on_interrupt: impl FnOnce() + Send + 'static) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("stdin-watcher".into())
        .spawn(move || {
            use std::io::Read;
            let mut buf = [0u8; 1];
            let _ = std::io::stdin().read(&mut buf);
            on_interrupt();
        })
        .map(|_| ())
}
