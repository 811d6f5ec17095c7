use anyhow::Context;
use clap::Parser;
use log::info;

use efsfuse::config::Config;
use efsfuse::fuse::EfsFilesystem;
use efsfuse::session::Session;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::parse();

    let session = Session::open(&config.image)
        .with_context(|| format!("mount image {}", config.image.display()))?;

    info!("mounting on {}", config.mountpoint.display());
    fuser::mount2(
        EfsFilesystem::new(session),
        &config.mountpoint,
        &config.mount_options(),
    )
    .context("run filesystem session")?;

    info!("unmounted cleanly");
    Ok(())
}
