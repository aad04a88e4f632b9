//! `imgflow pull` command.

use std::io::Write;

use clap::Args;
use imgflow_core::config::parse_duration;
use imgflow_core::error::ImageError;
use imgflow_core::platform::PlatformSpec;
use imgflow_core::policy::PullPolicy;
use imgflow_runtime::{ImageRuntime, PullOptions};
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct PullArgs {
    /// Image to pull (e.g., "alpine", "quay.io/org/image:tag", "oci-archive:/tmp/app.tar")
    pub image: String,

    /// Pull policy (always, missing, never, newer)
    #[arg(long, default_value = "always")]
    pub policy: PullPolicy,

    /// Target platform (e.g., "linux/amd64", "linux/arm/v7")
    #[arg(long)]
    pub platform: Option<String>,

    /// Override the architecture of the target platform
    #[arg(long)]
    pub arch: Option<String>,

    /// Override the OS of the target platform
    #[arg(long)]
    pub os: Option<String>,

    /// Override the variant of the target platform
    #[arg(long)]
    pub variant: Option<String>,

    /// Pull every tag of the repository
    #[arg(short, long)]
    pub all_tags: bool,

    /// Retries after a failed registry copy
    #[arg(long)]
    pub retry: Option<u32>,

    /// Delay between retries (e.g., "500ms", "2s")
    #[arg(long)]
    pub retry_delay: Option<String>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

impl PullArgs {
    /// Platform from `--platform`, with `--os`/`--arch`/`--variant` on top.
    fn platform(&self) -> Result<PlatformSpec, ImageError> {
        let mut platform = match &self.platform {
            Some(platform) => PlatformSpec::parse(platform)?,
            None => PlatformSpec::default(),
        };
        if let Some(os) = &self.os {
            platform.os = os.clone();
        }
        if let Some(arch) = &self.arch {
            platform.architecture = arch.clone();
        }
        if let Some(variant) = &self.variant {
            platform.variant = variant.clone();
        }
        Ok(platform)
    }
}

pub async fn execute(args: PullArgs, runtime: &ImageRuntime) -> Result<(), Box<dyn std::error::Error>> {
    let retry_delay = match &args.retry_delay {
        Some(delay) => Some(parse_duration(delay)?),
        None => None,
    };

    let cancel = CancellationToken::new();
    if args.all_tags {
        let token = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Cancelling after the current tag...");
                token.cancel();
            }
        });
    }

    let writer: Option<Box<dyn Write + Send>> = if args.quiet {
        None
    } else {
        Some(Box::new(std::io::stderr()))
    };
    let options = PullOptions {
        platform: args.platform()?,
        all_tags: args.all_tags,
        max_retries: args.retry,
        retry_delay,
        writer,
        cancel,
    };

    let images = runtime.pull(&args.image, args.policy, options).await?;
    for image in images {
        println!("{}", image.id);
    }
    Ok(())
}
