//! blobfs -- command-line access to containers and blobs.
//!
//! Each invocation builds a [`BlobFs`] from the YAML config, runs one
//! subcommand, and exits.  Without a config file the in-memory store is
//! used, which is only useful for trying the commands out.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use blobfs::config::{Config, LoggingConfig, ObservabilityConfig};
use blobfs::file::Mode;
use blobfs::store::PublicAccess;
use blobfs::BlobFs;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for blobfs.
#[derive(Parser, Debug)]
#[command(
    name = "blobfs",
    version,
    about = "File-handle access to blob object storage"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print Prometheus metrics to stderr when the command finishes.
    /// Takes precedence over `observability.metrics_addr`.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List containers, optionally only those starting with a prefix.
    Ls { prefix: Option<String> },
    /// Create a container (no error if it exists).
    Mkdir {
        container: String,
        /// Public access level: public, blob, or private.
        #[arg(long, default_value = "private")]
        access: PublicAccess,
    },
    /// Delete a container and all its blobs.
    Rmdir { container: String },
    /// Upload a local file as a blob.
    Put {
        container: String,
        blob: String,
        file: PathBuf,
    },
    /// Write a blob to stdout.
    Cat { container: String, blob: String },
    /// Show container or blob properties.
    Stat {
        container: String,
        blob: Option<String>,
    },
    /// Print the first metadata value found among the given keys.
    MetaGet {
        container: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Set a container metadata entry.
    MetaSet {
        container: String,
        key: String,
        value: String,
    },
    /// Remove a container metadata entry.
    MetaRm { container: String, key: String },
}

/// Which metrics recorder to install.
#[derive(Debug, PartialEq, Eq)]
enum MetricsSetup {
    Off,
    /// Keep a handle so the text can be printed at exit.
    Render,
    /// Serve a scrape endpoint.
    Serve(String),
}

fn metrics_setup(observability: &ObservabilityConfig, print: bool) -> MetricsSetup {
    if print {
        return MetricsSetup::Render;
    }
    match &observability.metrics_addr {
        Some(addr) if observability.metrics => MetricsSetup::Serve(addr.clone()),
        _ => MetricsSetup::Off,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => blobfs::config::load_config(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    init_tracing(&config.logging);

    match metrics_setup(&config.observability, cli.metrics) {
        MetricsSetup::Off => {}
        MetricsSetup::Render => {
            blobfs::metrics::init_metrics()?;
            blobfs::metrics::describe_metrics();
        }
        MetricsSetup::Serve(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("bad observability.metrics_addr {addr}"))?;
            blobfs::metrics::serve_metrics(addr)?;
            blobfs::metrics::describe_metrics();
            info!("Prometheus metrics served on {}", addr);
        }
    }

    let fs = BlobFs::from_config(&config)?;
    run(&fs, cli.command).await?;

    if cli.metrics {
        if let Some(text) = blobfs::metrics::render() {
            eprint!("{text}");
        }
    }
    Ok(())
}

async fn run(fs: &BlobFs, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ls { prefix } => {
            for name in fs.containers().list().await? {
                if prefix.as_deref().map_or(true, |p| name.starts_with(p)) {
                    println!("{name}");
                }
            }
        }
        Command::Mkdir { container, access } => {
            fs.containers().create(&container, access).await?;
        }
        Command::Rmdir { container } => {
            fs.containers().delete(&container).await?;
        }
        Command::Put {
            container,
            blob,
            file,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let mut handle = fs.open_file(&container, &blob, Mode::Write).await?;
            let chunk = fs.options().write_block_bytes.max(1);
            let mut written = Ok(());
            for part in data.chunks(chunk) {
                written = fs.write_file(&mut handle, part).await;
                if written.is_err() {
                    break;
                }
            }
            // Close even after a failed write so the lease is released.
            let closed = fs.close_file(&mut handle).await;
            written?;
            closed?;
            info!(container = %container, blob = %blob, bytes = data.len(), "uploaded");
        }
        Command::Cat { container, blob } => {
            let mut handle = fs.open_file(&container, &blob, Mode::Read).await?;
            let mut stdout = tokio::io::stdout();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = fs.read_file(&mut handle, &mut buf).await?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n]).await?;
            }
            stdout.flush().await?;
            fs.close_file(&mut handle).await?;
        }
        Command::Stat { container, blob } => match blob {
            None => {
                let props = fs.container_properties(&container).await?;
                println!("name:          {}", props.name);
                println!("created:       {}", props.created.to_rfc3339());
                println!("last_modified: {}", props.last_modified.to_rfc3339());
            }
            Some(blob) => {
                let props = fs.blob_properties(&container, &blob).await?;
                println!("container:     {}", props.container);
                println!("blob:          {}", props.blob);
                println!("size:          {}", props.size);
                println!("etag:          {}", props.etag);
                println!("last_modified: {}", props.last_modified.to_rfc3339());
                println!("leased:        {}", props.leased);
                let mut keys: Vec<_> = props.metadata.keys().collect();
                keys.sort();
                for key in keys {
                    println!("meta.{key}: {}", props.metadata[key]);
                }
            }
        },
        Command::MetaGet { container, keys } => {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            match fs.container_metadata(&container, &keys).await? {
                Some(value) => println!("{value}"),
                None => anyhow::bail!("no metadata value for {}", keys.join(", ")),
            }
        }
        Command::MetaSet {
            container,
            key,
            value,
        } => {
            fs.set_container_metadata(&container, &key, &value).await?;
        }
        Command::MetaRm { container, key } => {
            if let Some(previous) = fs.remove_container_metadata(&container, &key).await? {
                println!("{previous}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observability(metrics: bool, addr: Option<&str>) -> ObservabilityConfig {
        ObservabilityConfig {
            metrics,
            metrics_addr: addr.map(str::to_string),
        }
    }

    #[test]
    fn test_metrics_flag_installs_recorder_regardless_of_config() {
        assert_eq!(
            metrics_setup(&observability(false, None), true),
            MetricsSetup::Render
        );
        assert_eq!(
            metrics_setup(&observability(true, Some("127.0.0.1:9100")), true),
            MetricsSetup::Render
        );
    }

    #[test]
    fn test_metrics_from_config() {
        assert_eq!(
            metrics_setup(&observability(true, Some("127.0.0.1:9100")), false),
            MetricsSetup::Serve("127.0.0.1:9100".to_string())
        );
        assert_eq!(
            metrics_setup(&observability(false, Some("127.0.0.1:9100")), false),
            MetricsSetup::Off
        );
        assert_eq!(metrics_setup(&observability(true, None), false), MetricsSetup::Off);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli =
            Cli::try_parse_from(["blobfs", "--metrics", "meta-get", "docs", "owner"]).unwrap();
        assert!(cli.metrics);
        match cli.command {
            Command::MetaGet { container, keys } => {
                assert_eq!(container, "docs");
                assert_eq!(keys, vec!["owner".to_string()]);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["blobfs", "meta-get", "docs"]).is_err());
    }
}
