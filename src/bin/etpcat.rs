use std::fs::File;
use std::io::{BufRead, BufReader, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use agrobus::can::{CandumpParser, CanMessage, ControlFunctionRegistry, Name};
use agrobus::transport::{EtpConfig, EtpSessionManager, ETP_CONNECTION_MANAGEMENT_PGN};
use clap::Parser;
use csv::Writer;

/// Reconstruct ISO 11783 Extended Transport Protocol transfers from a candump
///
/// Watches the ETP connection management and data transfer traffic recorded in a candump log,
/// reassembles the multi-packet payloads, and writes one CSV row per completed transfer. Each
/// destination of an observed RTS is adopted as a local endpoint so its side of the session can
/// be replayed.
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// Path to the input candump. stdin if '-' or if not passed
    input: Option<PathBuf>,

    /// Path to the output. stdout if '-' or if not passed
    output: Option<PathBuf>,
}

/// The first byte of an ETP.CM_RTS frame
const RTS_CONTROL_BYTE: u8 = 0x14;

fn main() -> eyre::Result<()> {
    let use_color = std::io::stderr().is_terminal();
    if use_color {
        color_eyre::install()?;
    }

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(args.log_level.into())
        .with_env_var("ETP_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();

    let input: Box<dyn BufRead> = match &args.input {
        None => Box::new(BufReader::new(std::io::stdin())),
        Some(path) if path.as_os_str() == "-" => Box::new(BufReader::new(std::io::stdin())),
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
    };
    let output: Box<dyn Write> = match &args.output {
        None => Box::new(std::io::stdout()),
        Some(path) if path.as_os_str() == "-" => Box::new(std::io::stdout()),
        Some(path) => Box::new(File::create(path)?),
    };
    let mut writer = Writer::from_writer(output);

    let completed: Arc<Mutex<Vec<CanMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&completed);
    let mut registry = ControlFunctionRegistry::new();
    let mut manager = EtpSessionManager::new(
        EtpConfig::default(),
        0,
        // Nobody is on the other end of a log file; our own flow control evaporates
        Box::new(|_| true),
    );
    manager.add_message_listener(move |message| sink.lock().unwrap().push(message.clone()));

    for frame in CandumpParser::new(input) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Failed to parse frame: {e:?}");
                continue;
            }
        };
        let now_ms = frame.timestamp_us / 1000;

        // Adopt RTS destinations as local endpoints so the receive side of each observed
        // session gets replayed here
        if frame.pgn() == ETP_CONNECTION_MANAGEMENT_PGN
            && frame.data().first() == Some(&RTS_CONTROL_BYTE)
            && registry.resolve(frame.dst()).is_none()
        {
            registry.claim_internal(Name(frame.dst() as u64), frame.dst())?;
        }

        manager.process_frame(&mut registry, &frame, now_ms);
        manager.update(&mut registry, now_ms);

        for message in completed.lock().unwrap().drain(..) {
            if let Err(e) = writer.serialize(message) {
                tracing::warn!("Failed to serialize transfer: {e:?}");
            }
        }
        let _eat_err = writer.flush();
    }

    for session in manager.sessions() {
        tracing::warn!(
            "Replay ended with an unfinished {:?} session of {} bytes",
            session.get_direction(),
            session.get_total_size()
        );
    }
    let _eat_err = writer.flush();

    Ok(())
}
