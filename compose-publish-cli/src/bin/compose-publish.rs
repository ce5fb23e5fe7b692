use anyhow::Result;
use clap::Parser;
use compose_publish::{
    cancel::CancelToken,
    distribution::Gateway,
    publish::{publish, PublishOptions},
};
use std::path::PathBuf;

/// Publish a Compose app to an OCI registry as a content-addressed artifact
#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// Target repository reference, TARGET[:TAG]
    target: String,

    /// Comma-separated list of architectures the app may carry
    arch_list: Option<String>,

    /// Load Compose file FILE
    #[arg(short = 'f', long = "file", default_value = "docker-compose.yml")]
    file: PathBuf,

    /// Save the digest of the published manifest to a file
    #[arg(short = 'd', long = "digest-file")]
    digest_file: Option<PathBuf>,

    /// Show what would be done, but don't actually publish
    #[arg(long = "dryrun")]
    dryrun: bool,

    /// Out-of-band pin, NAME@sha256:HASH; may be repeated
    #[arg(short = 'i', long = "pinned-images")]
    pinned_images: Vec<String>,

    /// Path to a JSON file embedded as the app layers metadata blob
    #[arg(short = 'l', long = "layers-meta")]
    layers_meta: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp(None)
        .format_target(false)
        .init();

    let opt = Opt::parse();
    let arch_list = opt
        .arch_list
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|arch| !arch.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let opts = PublishOptions {
        file: opt.file,
        target: opt.target,
        digest_file: opt.digest_file,
        dry_run: opt.dryrun,
        arch_list,
        pinned_images: opt.pinned_images,
        layers_meta: opt.layers_meta,
    };

    let gateway = Gateway::new();
    let digest = publish(&gateway, &opts, &CancelToken::new())?;
    println!("{}", digest);
    Ok(())
}
