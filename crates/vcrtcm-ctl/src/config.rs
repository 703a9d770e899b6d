use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use vcrtcm_core::VcrtcmConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "vcrtcm-ctl", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// JSON file with manager tunables. Fields left out keep their defaults.
    ///
    /// Without a file the `VCRTCM_*` environment variables are applied on top of the defaults.
    ///
    /// Environment variable: `VCRTCM_CONFIG`.
    #[arg(long, global = true, env = "VCRTCM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Size of the pcon table.
    ///
    /// Environment variable: `VCRTCM_MAX_PCONS`.
    #[arg(long, global = true, env = "VCRTCM_MAX_PCONS")]
    pub max_pcons: Option<usize>,

    /// Push-buffer page size in bytes (power of two).
    ///
    /// Environment variable: `VCRTCM_PAGE_SIZE`.
    #[arg(long, global = true, env = "VCRTCM_PAGE_SIZE")]
    pub page_size: Option<usize>,

    /// Highest frame rate a pcon may be driven at.
    ///
    /// Environment variable: `VCRTCM_MAX_FPS`.
    #[arg(long, global = true, env = "VCRTCM_MAX_FPS")]
    pub max_fps: Option<u32>,

    /// Log filter (tracing-subscriber EnvFilter syntax). `RUST_LOG` wins when set.
    ///
    /// Environment variable: `VCRTCM_LOG_LEVEL`.
    #[arg(long, global = true, env = "VCRTCM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit structured JSON logs.
    ///
    /// Environment variable: `VCRTCM_LOG_JSON`.
    #[arg(long, global = true, env = "VCRTCM_LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Drive software pcons with the vblank driver and report what happened.
    Run(RunArgs),
    /// Print the effective manager configuration as JSON.
    Config,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Number of pcons to instantiate and attach.
    #[arg(long, env = "VCRTCM_CTL_PCONS", default_value_t = 1)]
    pub pcons: u32,

    /// Target frame rate of every pcon.
    #[arg(long, env = "VCRTCM_CTL_FPS", default_value_t = 60)]
    pub fps: u32,

    #[arg(long, default_value_t = 640)]
    pub width: u32,

    #[arg(long, default_value_t = 480)]
    pub height: u32,

    /// Stop after this many milliseconds. Runs until Ctrl+C when absent.
    #[arg(long, env = "VCRTCM_CTL_DURATION_MS")]
    pub duration_ms: Option<u64>,

    /// Redraw the render target and mark every framebuffer dirty at this interval.
    #[arg(long)]
    pub redraw_ms: Option<u64>,

    /// Format of the final report.
    #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
    pub report: ReportFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Json,
    Prometheus,
}

impl GlobalArgs {
    /// The manager config: file or environment first, then command-line overrides.
    pub fn resolve(&self) -> anyhow::Result<VcrtcmConfig> {
        let mut cfg = match &self.config {
            Some(path) => load_config_file(path)?,
            None => VcrtcmConfig::from_env().context("reading VCRTCM_* environment")?,
        };
        if let Some(v) = self.max_pcons {
            cfg.max_pcons = v;
        }
        if let Some(v) = self.page_size {
            cfg.page_size = v;
        }
        if let Some(v) = self.max_fps {
            cfg.max_fps = v;
        }
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }
}

pub fn load_config_file(path: &Path) -> anyhow::Result<VcrtcmConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let cfg: VcrtcmConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file = write_config(r#"{ "max_pcons": 8, "max_fps": 120 }"#);
        let cfg = load_config_file(file.path()).unwrap();
        assert_eq!(cfg.max_pcons, 8);
        assert_eq!(cfg.max_fps, 120);
        assert_eq!(cfg.page_size, VcrtcmConfig::default().page_size);
    }

    #[test]
    fn malformed_file_names_the_path() {
        let file = write_config("{ not json");
        let err = load_config_file(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains(&file.path().display().to_string()));
    }

    #[test]
    fn flags_override_the_file() {
        let file = write_config(r#"{ "max_pcons": 8 }"#);
        let path = file.path().to_str().unwrap();
        let cli = Cli::try_parse_from([
            "vcrtcm-ctl",
            "--config",
            path,
            "--max-pcons",
            "4",
            "run",
            "--pcons",
            "2",
            "--report",
            "prometheus",
        ])
        .unwrap();

        let cfg = cli.global.resolve().unwrap();
        assert_eq!(cfg.max_pcons, 4);
        let Command::Run(run) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(run.pcons, 2);
        assert_eq!(run.report, ReportFormat::Prometheus);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let file = write_config("{}");
        let path = file.path().to_str().unwrap();
        let cli =
            Cli::try_parse_from(["vcrtcm-ctl", "--config", path, "--page-size", "1000", "config"])
                .unwrap();
        assert!(cli.global.resolve().is_err());
    }
}
