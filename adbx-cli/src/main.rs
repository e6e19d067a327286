//! Command-line front end for the adbx client library.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use adbx::{Device, DeviceDescriptor, DeviceInfo, Server};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

/// Path placeholder for stdin/stdout.
const STDIO_FILENAME: &str = "-";

#[derive(Parser)]
#[command(name = "adbx", version, about = "Client for the Android Debug Bridge server")]
struct Cli {
    /// Connect to the device with this serial number.
    #[arg(short = 's', long, global = true)]
    serial: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List attached devices.
    Devices {
        /// Include product, model, and device detail.
        #[arg(short = 'l', long)]
        long: bool,

        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
    /// Run a shell command on the device and print its output.
    Shell {
        /// Command and arguments to run.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Pull a file from the device.
    Pull {
        /// Print transfer progress to stderr.
        #[arg(short = 'p', long)]
        progress: bool,

        /// Path of the source file on the device.
        remote: String,

        /// Destination path; `-` writes to stdout. Defaults to the remote
        /// file name.
        local: Option<String>,
    },
    /// Push a file to the device.
    Push {
        /// Print transfer progress to stderr.
        #[arg(short = 'p', long)]
        progress: bool,

        /// Source path; `-` reads from stdin.
        local: String,

        /// Path of the destination file on the device.
        remote: String,
    },
    /// List port forwards for the device.
    Forward {
        /// List forwards (the default action).
        #[arg(short = 'l', long)]
        list: bool,
    },
}

/// Output format for list commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable lines.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    init_logging();
    if let Err(e) = Cli::parse().dispatch() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        let server = Server::start_default().context("could not start adb server")?;
        let device = server.device(match self.serial {
            Some(serial) => DeviceDescriptor::Serial(serial),
            None => DeviceDescriptor::Any,
        });

        match self.command {
            Command::Devices { long, format } => devices(&server, long, format),
            Command::Shell { command } => shell(&device, &command),
            Command::Pull {
                progress,
                remote,
                local,
            } => pull(&device, progress, &remote, local.as_deref()),
            Command::Push {
                progress,
                local,
                remote,
            } => push(&device, progress, &local, &remote),
            Command::Forward { list: _ } => forward(&device),
        }
    }
}

fn devices(server: &Server, long: bool, format: OutputFormat) -> Result<()> {
    if long {
        let devices = server.list_devices()?;
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&devices)?),
            OutputFormat::Table => {
                for device in &devices {
                    print_device_line(device);
                }
            }
        }
    } else {
        let serials = server.list_device_serials()?;
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&serials)?),
            OutputFormat::Table => {
                for serial in serials {
                    println!("{serial}");
                }
            }
        }
    }
    Ok(())
}

fn print_device_line(device: &DeviceInfo) {
    let attr = |value: &Option<String>| value.clone().unwrap_or_default();
    if let Some(usb) = &device.usb {
        println!(
            "{}\tusb:{usb} product:{} model:{} device:{}",
            device.serial,
            attr(&device.product),
            attr(&device.model),
            attr(&device.device)
        );
    } else {
        println!(
            "{}\tproduct:{} model:{} device:{}",
            device.serial,
            attr(&device.product),
            attr(&device.model),
            attr(&device.device)
        );
    }
}

fn shell(device: &Device, command: &[String]) -> Result<()> {
    let (cmd, args) = command.split_first().context("no command")?;
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = device.run_command(cmd, &args)?;
    io::stdout().write_all(&output)?;
    Ok(())
}

fn pull(device: &Device, progress: bool, remote: &str, local: Option<&str>) -> Result<()> {
    let info = device
        .stat(remote)
        .with_context(|| format!("could not read remote file {remote}"))?;

    let local = match local {
        Some(path) => path.to_string(),
        None => Path::new(remote)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("cannot derive a local name from the remote path; pass one explicitly")?,
    };

    let mut reader = device.open_read(remote)?;
    if local == STDIO_FILENAME {
        copy_with_progress(&mut reader, &mut io::stdout().lock(), u64::from(info.size), progress)?;
    } else {
        let mut file =
            File::create(&local).with_context(|| format!("could not create {local}"))?;
        copy_with_progress(&mut reader, &mut file, u64::from(info.size), progress)?;
    }
    Ok(())
}

/// Chunked copy printing plain percentage lines to stderr.
fn copy_with_progress(
    r: &mut impl Read,
    w: &mut impl Write,
    total: u64,
    progress: bool,
) -> Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    let mut last_percent = u64::MAX;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            return Ok(copied);
        }
        w.write_all(&buf[..n])?;
        copied += n as u64;
        if progress && total > 0 {
            let percent = copied * 100 / total;
            if percent != last_percent {
                eprintln!("{percent}%");
                last_percent = percent;
            }
        }
    }
}

fn push(device: &Device, progress: bool, local: &str, remote: &str) -> Result<()> {
    let (source, size, mode, mtime): (Box<dyn Read + Send>, u64, u32, Option<SystemTime>) =
        if local == STDIO_FILENAME {
            (Box::new(io::stdin()), 0, 0o660, None)
        } else {
            let file =
                File::open(local).with_context(|| format!("could not open {local}"))?;
            let meta = file.metadata()?;
            (
                Box::new(file),
                meta.len(),
                local_file_mode(&meta),
                meta.modified().ok(),
            )
        };

    let upload = Arc::new(device.start_upload(source, remote, mode, mtime, size)?);

    let printer = progress.then(|| {
        let upload = Arc::clone(&upload);
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let handle = thread::spawn(move || {
            let mut last_percent = u64::MAX;
            while !flag.load(Ordering::Relaxed) {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let percent = (upload.progress() * 100.0) as u64;
                if percent != last_percent {
                    eprintln!("{percent}%");
                    last_percent = percent;
                }
                thread::sleep(Duration::from_millis(100));
            }
        });
        (done, handle)
    });

    let result = upload.wait();
    if let Some((done, handle)) = printer {
        done.store(true, Ordering::Relaxed);
        let _ = handle.join();
    }
    result.with_context(|| format!("could not push to {remote}"))
}

#[cfg(unix)]
fn local_file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn local_file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

fn forward(device: &Device) -> Result<()> {
    for (local, remote) in device.forward_list()? {
        println!("{} {local} {remote}", device.descriptor());
    }
    Ok(())
}
