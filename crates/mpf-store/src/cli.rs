//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use mpf_models::{ArtifactKey, OutputKind};
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Job property as KEY=VALUE. Overrides the environment.
    #[arg(short = 'p', long = "prop", value_parser = parse_property, global = true)]
    pub properties: Vec<(String, String)>,

    /// Ignore job properties set in the environment.
    #[arg(long, global = true)]
    pub no_env: bool,

    /// Root directory for local storage. Defaults to MPF_LOCAL_STORAGE_DIR.
    #[arg(long, global = true)]
    pub storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Store one output, remotely when configured, locally otherwise.
    Store {
        /// File to store.
        file: PathBuf,
        #[arg(short, long)]
        job: String,
        #[arg(short, long, value_enum, default_value_t = KindArg::OutputObject)]
        kind: KindArg,
        /// Media the output was derived from.
        #[arg(short, long)]
        media: Option<u64>,
        /// File name used when the output is stored locally.
        #[arg(long)]
        name: Option<String>,
    },
    /// Store already extracted artifact frames for one media.
    Artifacts {
        #[arg(short, long)]
        job: String,
        #[arg(short, long)]
        media: u64,
        #[arg(short, long, default_value_t = 0)]
        action: u32,
        /// Extracted frame as TRACK:FRAME=PATH.
        #[arg(long = "artifact", value_parser = parse_artifact, required = true)]
        artifacts: Vec<(ArtifactKey, PathBuf)>,
        /// Frame that should have been extracted, as TRACK:FRAME.
        #[arg(long = "expect", value_parser = parse_artifact_key)]
        expected: Vec<ArtifactKey>,
        /// Extension for locally stored artifacts.
        #[arg(long, default_value = "png")]
        extension: String,
    },
    /// Copy stored results into the bucket named by S3_RESULTS_BUCKET.
    Copy {
        #[arg(required = true)]
        uris: Vec<Url>,
    },
    /// Download media from S3.
    Download { uri: Url, destination: PathBuf },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    OutputObject,
    Markup,
    Artifact,
    DerivativeMedia,
}

impl From<KindArg> for OutputKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::OutputObject => OutputKind::OutputObject,
            KindArg::Markup => OutputKind::Markup,
            KindArg::Artifact => OutputKind::Artifact,
            KindArg::DerivativeMedia => OutputKind::DerivativeMedia,
        }
    }
}

pub fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

pub fn parse_artifact_key(raw: &str) -> Result<ArtifactKey, String> {
    let (track, frame) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected TRACK:FRAME, got '{}'", raw))?;
    let track = track
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid track index '{}': {}", track, e))?;
    let frame = frame
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid frame index '{}': {}", frame, e))?;
    Ok(ArtifactKey::new(track, frame))
}

pub fn parse_artifact(raw: &str) -> Result<(ArtifactKey, PathBuf), String> {
    let (key, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TRACK:FRAME=PATH, got '{}'", raw))?;
    if path.is_empty() {
        return Err(format!("missing path in '{}'", raw));
    }
    Ok((parse_artifact_key(key)?, PathBuf::from(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_property() {
        assert_eq!(
            parse_property("S3_RESULTS_BUCKET=http://minio:9000/b?x=1").unwrap(),
            ("S3_RESULTS_BUCKET".to_string(), "http://minio:9000/b?x=1".to_string())
        );
        assert_eq!(
            parse_property("S3_HOST=").unwrap(),
            ("S3_HOST".to_string(), String::new())
        );
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=x").is_err());
    }

    #[test]
    fn test_parse_artifact() {
        let (key, path) = parse_artifact("2:15=/tmp/frame-15.png").unwrap();
        assert_eq!(key, ArtifactKey::new(2, 15));
        assert_eq!(path, PathBuf::from("/tmp/frame-15.png"));

        assert!(parse_artifact("2:15").is_err());
        assert!(parse_artifact("2:15=").is_err());
        assert!(parse_artifact_key("x:1").is_err());
        assert!(parse_artifact_key("7").is_err());
    }

    #[test]
    fn test_store_command_parses() {
        let cli = Cli::try_parse_from([
            "mpf-store",
            "store",
            "out.json",
            "--job",
            "42",
            "--kind",
            "markup",
            "-p",
            "S3_ACCESS_KEY=a",
            "--no-env",
        ])
        .unwrap();

        assert!(cli.no_env);
        assert_eq!(cli.properties, vec![("S3_ACCESS_KEY".into(), "a".into())]);
        match cli.command {
            Command::Store { file, job, kind, media, .. } => {
                assert_eq!(file, PathBuf::from("out.json"));
                assert_eq!(job, "42");
                assert_eq!(kind, KindArg::Markup);
                assert_eq!(media, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_copy_requires_uris() {
        assert!(Cli::try_parse_from(["mpf-store", "copy"]).is_err());
        assert!(Cli::try_parse_from(["mpf-store", "copy", "not a uri"]).is_err());
    }
}
