//! `syncvol` CLI entry point (spec §6.1): `init`, `mount`, `serve`. Subcommand shape grounded on
//! `HimbeerserverDE-hbak/hbak/src/main.rs`'s `clap::Parser`/`Subcommand` derive split (the
//! teacher's own CLI surface lives behind the unpublishable `proxmox::api` router macros).

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::error;
use tokio_util::sync::CancellationToken;

use syncvol::controller::{BackupController, ControllerConfig};
use syncvol::metadata::ApiMetadataProvider;
use syncvol::size::{default_fs_size, parse_size};
use syncvol::volume::{CreateOptions, Volume};

#[derive(Parser)]
#[command(name = "syncvol", author, version, about = "Syncable, thin-provisioned container volumes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new backing image and format its filesystem.
    Init {
        #[arg(long)]
        image: String,
        #[arg(long = "image-size", value_parser = parse_size)]
        image_size: u64,
        #[arg(long = "fs-size", value_parser = parse_size)]
        fs_size: Option<u64>,
        #[arg(long = "fs-type", default_value = "ext4")]
        fs_type: String,
        #[arg(long = "vg-name")]
        vg_name: Option<String>,
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Open an existing image and mount its primary filesystem.
    Mount {
        #[arg(long)]
        image: String,
        #[arg(long = "mount-point")]
        mount_point: String,
    },
    /// Acquire the volume lock and run the periodic snapshot/backup cycle until interrupted.
    Serve {
        #[arg(long = "repo")]
        repo: String,
        #[arg(long = "volume")]
        volume: String,
        #[arg(long)]
        image: String,
        #[arg(long)]
        mount: String,
        #[arg(long = "snapshot-mount")]
        snapshot_mount: String,
        #[arg(long = "backup-interval", value_parser = humantime::parse_duration)]
        backup_interval: Duration,
        #[arg(long = "prev-lock-id")]
        prev_lock_id: Option<String>,
        #[arg(long = "webdav-proxy-listen", default_value = "127.0.0.1:0")]
        webdav_proxy_listen: SocketAddr,
        /// Base URL of the (out-of-scope, spec §1) volume/repository management API.
        #[arg(long = "api-url", env = "SYNCVOL_API_URL")]
        api_url: String,
        /// Bearer token for the management API, if required.
        #[arg(long = "api-token", env = "SYNCVOL_API_TOKEN")]
        api_token: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Init {
            image,
            image_size,
            fs_size,
            fs_type,
            vg_name,
            force,
        } => run_init(image, image_size, fs_size, fs_type, vg_name, force).await,
        Commands::Mount { image, mount_point } => run_mount(image, mount_point).await,
        Commands::Serve {
            repo,
            volume,
            image,
            mount,
            snapshot_mount,
            backup_interval,
            prev_lock_id,
            webdav_proxy_listen,
            api_url,
            api_token,
        } => {
            run_serve(
                repo,
                volume,
                image,
                mount,
                snapshot_mount,
                backup_interval,
                prev_lock_id,
                webdav_proxy_listen,
                api_url,
                api_token,
            )
            .await
        }
    };

    if let Err(err) = result {
        error!("{}", err);
        std::process::exit(1);
    }
}

async fn run_init(
    image: String,
    image_size: u64,
    fs_size: Option<u64>,
    fs_type: String,
    vg_name: Option<String>,
    force: bool,
) -> Result<(), syncvol::error::Error> {
    let fs_size = fs_size.unwrap_or_else(|| default_fs_size(image_size));
    Volume::create(CreateOptions {
        image_path: image,
        image_size,
        fs_size,
        fs_type,
        force,
        vg_name,
    })
    .await
}

async fn run_mount(image: String, mount_point: String) -> Result<(), syncvol::error::Error> {
    let volume = Volume::open(&image).await?;
    volume.mount(&mount_point).await
}

#[allow(clippy::too_many_arguments)]
async fn run_serve(
    repo: String,
    volume: String,
    image: String,
    mount: String,
    snapshot_mount: String,
    backup_interval: Duration,
    prev_lock_id: Option<String>,
    webdav_proxy_listen: SocketAddr,
    api_url: String,
    api_token: Option<String>,
) -> Result<(), syncvol::error::Error> {
    let metadata = ApiMetadataProvider::new(api_url.clone(), api_token.clone());
    let controller = BackupController::new(
        ControllerConfig {
            api_base_url: api_url,
            api_token,
            repository_uuid: repo,
            volume_uuid: volume,
            image_path: image,
            mount_path: mount,
            snapshot_mount,
            backup_interval,
            proxy_listen_addr: webdav_proxy_listen,
            prev_lock_uuid: prev_lock_id,
        },
        metadata,
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown.cancel();
    });

    controller.run(cancel).await
}
