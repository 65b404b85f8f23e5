//! satip-client: tune one SAT>IP tuner and record its stream.
//!
//! Writes the TS stream to a file (or stdout), logs every section matched by
//! the requested filters and reports the signal status periodically.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use satip_client::config::ServerEntry;
use satip_client::section::table;
use satip_client::tuner::PidType;
use satip_client::{ClientConfig, InformationPage, SatipContext, TunerDevice};
use satip_protocol::rtsp::RTSP_DEFAULT_PORT;
use satip_protocol::ServerQuirks;

const DEFAULT_CONFIG_PATH: &str = "satip-client.toml";

/// satip-client - SAT>IP tuner client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address as host or host:port; added to the configured servers
    #[arg(short, long)]
    server: Option<String>,

    /// Server model string, e.g. DVBS2-2,DVBT2-4
    #[arg(long, default_value = "DVBS2-1")]
    model: String,

    /// Tuning parameters, e.g. src=1&freq=11494&pol=h&msys=dvbs2&sr=22000
    #[arg(short, long)]
    params: String,

    /// Comma separated pids to request
    #[arg(long, value_delimiter = ',')]
    pids: Vec<u16>,

    /// Section filter as pid:tid:mask (hex with 0x prefix or decimal)
    #[arg(long, value_parser = parse_filter)]
    filter: Vec<(u16, u8, u8)>,

    /// Write the TS stream to this file, `-` for stdout
    #[arg(short, long)]
    output: Option<String>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Signal status report interval in seconds
    #[arg(long, default_value = "10")]
    status_interval: u64,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

fn parse_number(value: &str) -> Result<u32, String> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid number {:?}: {}", value, e))
}

fn parse_filter(value: &str) -> Result<(u16, u8, u8), String> {
    let parts: Vec<&str> = value.split(':').collect();
    let [pid, tid, mask] = parts.as_slice() else {
        return Err(format!("expected pid:tid:mask, got {:?}", value));
    };
    let pid = u16::try_from(parse_number(pid)?).map_err(|e| e.to_string())?;
    let tid = u8::try_from(parse_number(tid)?).map_err(|e| e.to_string())?;
    let mask = u8::try_from(parse_number(mask)?).map_err(|e| e.to_string())?;
    Ok((pid, tid, mask))
}

fn parse_server(value: &str) -> Result<(String, u16), String> {
    match value.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|e| format!("invalid port {:?}: {}", port, e))?;
            Ok((host.to_string(), port))
        }
        None => Ok((value.to_string(), RTSP_DEFAULT_PORT)),
    }
}

fn load_config(path: Option<&Path>) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    // Explicit path > auto-detect > default
    let path = path.map(Path::to_path_buf).or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        default_path.exists().then_some(default_path)
    });
    match path {
        Some(path) => {
            let config = ClientConfig::load(&path)?;
            eprintln!("Loaded config from: {}", path.display());
            Ok(config)
        }
        None => Ok(ClientConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config file: {}", e);
            return Err(e);
        }
    };

    // Command line takes precedence over the config file
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| config.logging.log_dir.as_ref().map(PathBuf::from));
    let retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        config.logging.retention_days.unwrap_or(7)
    };
    satip_client::logging::init_logging(
        log_dir.as_deref(),
        retention_days,
        args.verbose,
        config.logging.level.as_deref(),
    )?;

    if let Some(server) = &args.server {
        let (address, port) = parse_server(server)?;
        config.servers.insert(
            0,
            ServerEntry {
                address,
                port,
                model: args.model.clone(),
                description: "command line".to_string(),
                quirks: ServerQuirks::default(),
            },
        );
    }
    if config.servers.is_empty() {
        error!("No SAT>IP server configured; use --server or a [[server]] section");
        return Err("no server configured".into());
    }

    info!("satip-client starting...");
    info!("  Params: {}", args.params);
    if let Some(output) = &args.output {
        info!("  Output: {}", output);
    }

    let context = SatipContext::from_config(config);
    let device = Arc::new(TunerDevice::new(0, context).await?);
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    for &(pid, tid, mask) in &args.filter {
        let mut receiver = match device.open_filter(pid, tid, mask) {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("Skipping filter {}:{}:{}: {}", pid, tid, mask, e);
                continue;
            }
        };
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let section = tokio::select! {
                    _ = cancel.cancelled() => break,
                    section = receiver.recv() => section,
                };
                let Some(section) = section else { break };
                let tid = section.first().copied().unwrap_or(0xFF);
                info!(
                    "[section] filter {} pid 0x{:04X} tid 0x{:02X} ({}) {} bytes",
                    receiver.handle(),
                    pid,
                    tid,
                    table::tag(pid, tid),
                    section.len()
                );
            }
        }));
    }

    for &pid in &args.pids {
        device.set_pid(pid, PidType::Other, true);
    }

    if let Some(output) = args.output.clone() {
        device.open_dvr();
        let device = Arc::clone(&device);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = write_stream(&device, &output, cancel).await {
                error!("Failed to write {}: {}", output, e);
            }
        }));
    }

    device.set_channel(&args.params)?;

    {
        let device = Arc::clone(&device);
        let cancel = cancel.clone();
        let interval = Duration::from_secs(args.status_interval.max(1));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let tuner = device.tuner();
                info!(
                    "[status] {} {} | {}",
                    tuner.state(),
                    tuner.get_signal_status(),
                    tuner.get_tuner_statistic()
                );
                for line in device.information(InformationPage::Filters).lines() {
                    info!("[status] {}", line);
                }
            }
        }));
    }

    let duration = args.duration.map(Duration::from_secs);
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Interrupted, shutting down");
        }
        _ = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        } => {
            info!("Duration elapsed, shutting down");
        }
    }

    cancel.cancel();
    device.close_dvr();
    device.shutdown().await;
    for task in tasks {
        let _ = task.await;
    }
    info!("{}", device.information(InformationPage::Bits).trim_end());
    Ok(())
}

async fn write_stream(
    device: &TunerDevice,
    output: &str,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut writer: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = if output == "-" {
        Box::new(tokio::io::stdout())
    } else {
        Box::new(tokio::fs::File::create(output).await?)
    };

    let mut buf = Vec::with_capacity(64 * 1024);
    let mut total = 0u64;
    while !cancel.is_cancelled() {
        buf.clear();
        let read = device.read_ts(&mut buf, Duration::from_millis(100)).await;
        if read > 0 {
            writer.write_all(&buf).await?;
            total += read as u64;
        }
    }
    writer.flush().await?;
    info!("Wrote {} bytes to {}", total, output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        assert_eq!(parse_filter("0x11:0x42:0xFF"), Ok((0x11, 0x42, 0xFF)));
        assert_eq!(parse_filter("18:78:254"), Ok((18, 0x4E, 0xFE)));
        assert!(parse_filter("0x11:0x42").is_err());
        assert!(parse_filter("0x11:0x142:0xFF").is_err());
    }

    #[test]
    fn test_parse_server() {
        assert_eq!(
            parse_server("192.168.1.20"),
            Ok(("192.168.1.20".to_string(), 554))
        );
        assert_eq!(
            parse_server("192.168.1.20:8554"),
            Ok(("192.168.1.20".to_string(), 8554))
        );
        assert!(parse_server("host:port").is_err());
    }
}
