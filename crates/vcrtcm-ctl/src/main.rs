#![forbid(unsafe_code)]

mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vcrtcm_core::backend::{MemoryPim, SoftwareGpu};
use vcrtcm_core::{
    spawn_vblank_driver, FbDescriptor, PconId, Vcrtcm, VblankDriverConfig, VcrtcmConfig,
};

use crate::config::{Cli, Command, ReportFormat, RunArgs};

const PIM_NAME: &str = "memory";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.global.log_level, cli.global.log_json);

    let cfg = match cli.global.resolve() {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!("invalid config: {err:#}");
            return Err(err);
        }
    };

    match cli.command {
        Command::Config => println!("{}", serde_json::to_string_pretty(&cfg)?),
        Command::Run(args) => run(cfg, args).await?,
    }
    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(cfg: VcrtcmConfig, args: RunArgs) -> anyhow::Result<()> {
    let vcrtcm = Arc::new(Vcrtcm::new(cfg)?);
    let pim = Arc::new(MemoryPim::new());
    vcrtcm.register_pim(PIM_NAME, pim)?;

    let fb = FbDescriptor::packed(args.width, args.height, 32);
    let gpu = Arc::new(SoftwareGpu::new());
    let mut frame_no = 0u8;
    gpu.render(&test_pattern(&fb, frame_no));

    let mut pconids = Vec::with_capacity(args.pcons as usize);
    for _ in 0..args.pcons {
        let pconid = vcrtcm.instantiate(PIM_NAME, 0)?;
        let mode = vcrtcm.attach(pconid, gpu.clone())?;
        vcrtcm.set_fb(pconid, &fb)?;
        vcrtcm.set_fps(pconid, args.fps)?;
        tracing::info!(pconid, ?mode, fps = args.fps, "pcon ready");
        pconids.push(pconid);
    }

    let driver = spawn_vblank_driver(vcrtcm.clone(), VblankDriverConfig::default());
    tracing::info!(
        pcons = pconids.len(),
        width = fb.width,
        height = fb.height,
        "vcrtcm-ctl running"
    );

    let deadline = async {
        match args.duration_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut redraw = args
        .redraw_ms
        .map(|ms| tokio::time::interval(Duration::from_millis(ms.max(1))));

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut signal => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = next_redraw(&mut redraw) => {
                frame_no = frame_no.wrapping_add(1);
                gpu.render(&test_pattern(&fb, frame_no));
                for &pconid in &pconids {
                    vcrtcm.dirty_fb(pconid)?;
                }
            }
        }
    }

    driver.shutdown().await;
    print_report(&vcrtcm, &pconids, args.report)?;
    vcrtcm.shutdown();
    Ok(())
}

async fn next_redraw(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Diagonal stripes that shift with every redraw, so consecutive frames differ.
fn test_pattern(fb: &FbDescriptor, frame_no: u8) -> Vec<u8> {
    let mut pixels = vec![0u8; fb.size_bytes().unwrap_or(0)];
    if fb.pitch == 0 {
        return pixels;
    }
    for (y, row) in pixels.chunks_exact_mut(fb.pitch as usize).enumerate() {
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            let shade = ((x + y) as u8).wrapping_add(frame_no);
            px.copy_from_slice(&[shade, shade.wrapping_mul(3), 0x40, 0xff]);
        }
    }
    pixels
}

fn print_report(vcrtcm: &Vcrtcm, pconids: &[PconId], format: ReportFormat) -> anyhow::Result<()> {
    match format {
        ReportFormat::Json => {
            let pcons = pconids
                .iter()
                .map(|&id| vcrtcm.pcon_info(id))
                .collect::<Result<Vec<_>, _>>()?;
            let report = serde_json::json!({
                "metrics": vcrtcm.metrics().snapshot(),
                "pcons": pcons,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ReportFormat::Prometheus => print!("{}", vcrtcm.metrics().render_prometheus()),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}
