use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "zipstream")]
#[command(version)]
#[command(about = "Stream files and directories into a ZIP archive", long_about = None)]
#[command(after_help = "Examples:\n  \
  zipstream photos ~/Pictures/2019          archive a directory into photos.zip\n  \
  zipstream -c 0 -D backup.zip src docs     store without compression, keep directory entries\n  \
  zipstream -t --transform invert secret a  archive with a transform, then verify the result")]
pub struct Cli {
    /// Archive to create; `.zip` is appended when missing
    #[arg(value_name = "FILE")]
    pub file: String,

    /// Files and directories to add
    #[arg(value_name = "PATHS", required = true)]
    pub paths: Vec<PathBuf>,

    /// Compression level, 0 (store) to 9
    #[arg(short = 'c', long = "level", default_value_t = 6, value_name = "LEVEL")]
    pub level: u32,

    /// Add directories as their own entries
    #[arg(short = 'D')]
    pub directories: bool,

    /// Pass file content through a named transform
    #[arg(long, value_name = "NAME")]
    pub transform: Option<String>,

    /// Directory the archive is written into
    #[arg(short = 'd', value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// List the archive contents when done
    #[arg(short = 'l')]
    pub list: bool,

    /// List verbosely/show sizes and ratios
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Test the archive when done: inflate every entry and check its CRC
    #[arg(short = 't')]
    pub test: bool,

    /// Seconds between throughput reports
    #[arg(long, default_value_t = 5, value_name = "SECS")]
    pub speed_interval: u64,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        if self.is_very_quiet() {
            "off"
        } else if self.is_quiet() {
            "error"
        } else {
            "warn"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from([
            "zipstream", "-c", "0", "-D", "-qq", "--transform", "invert", "out", "a", "b",
        ])
        .unwrap();
        assert_eq!(cli.file, "out");
        assert_eq!(cli.paths, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(cli.level, 0);
        assert!(cli.directories);
        assert_eq!(cli.transform.as_deref(), Some("invert"));
        assert_eq!(cli.log_filter(), "off");
    }

    #[test]
    fn requires_a_path() {
        assert!(Cli::try_parse_from(["zipstream", "out"]).is_err());
    }
}
