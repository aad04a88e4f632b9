//! `imgflow save` command - Save images to a directory or archive.

use clap::Args;
use imgflow_runtime::{ImageRuntime, SaveFormat, SaveOptions};

#[derive(Args)]
pub struct SaveArgs {
    /// Images to save (names or IDs)
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Output path (e.g., "nginx.tar")
    #[arg(short, long)]
    pub output: std::path::PathBuf,

    /// Output format (docker-archive, oci-archive, oci-dir, docker-dir)
    #[arg(long, default_value = "docker-archive")]
    pub format: SaveFormat,

    /// Extra tag to record for the image (single image only)
    #[arg(long = "additional-tag")]
    pub additional_tags: Vec<String>,

    /// Suppress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: SaveArgs, runtime: &ImageRuntime) -> Result<(), Box<dyn std::error::Error>> {
    let options = SaveOptions {
        additional_tags: args.additional_tags,
        ..Default::default()
    };
    runtime
        .save(&args.images, args.format, &args.output, options)
        .await?;

    if !args.quiet {
        println!("Saved {} to {} ({})", args.images.join(", "), args.output.display(), args.format);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Command};
    use clap::Parser;

    fn parse(argv: &[&str]) -> Result<SaveArgs, clap::Error> {
        let mut full = vec!["imgflow", "save"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full)?.command {
            Command::Save(args) => Ok(args),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_multiple_images() {
        let args = parse(&["app:v1", "app:v2", "-o", "app.tar", "--format", "oci-archive"]).unwrap();
        assert_eq!(args.images, vec!["app:v1", "app:v2"]);
        assert_eq!(args.format, SaveFormat::OciArchive);
        assert_eq!(args.output, std::path::PathBuf::from("app.tar"));
    }

    #[test]
    fn test_defaults_to_docker_archive() {
        let args = parse(&["app", "-o", "app.tar", "--additional-tag", "app:extra"]).unwrap();
        assert_eq!(args.format, SaveFormat::DockerArchive);
        assert_eq!(args.additional_tags, vec!["app:extra"]);
    }

    #[test]
    fn test_rejects_unknown_format_and_missing_input() {
        assert!(parse(&["app", "-o", "app.tar", "--format", "zip"]).is_err());
        assert!(parse(&["-o", "app.tar"]).is_err());
        assert!(parse(&["app"]).is_err());
    }
}
