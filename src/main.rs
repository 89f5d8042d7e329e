//! AgriScan entry point: loads config, restores/opens the database, seeds
//! the auto-calibration context from the last known calibration, and
//! spawns the acquisition, backup, and web server tasks.

mod autocal;
mod calibration;
mod config;
mod db;
mod dynamics;
mod error;
mod events;
mod hydraulics;
mod pipeline;
mod ringbuffer;
mod sample;
mod sensors;
mod state;
mod web;

use anyhow::{Context, Result};
use config::{Config, ReferenceData, UserPreferences};
use db::Db;
use hydraulics::VanGenuchtenParams;
use pipeline::Pipeline;
use sensors::DefaultBackend;
use state::{DiagnosticsState, SharedState};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// How often a full backup runs (seconds). Chosen to bound SD-card wear on
/// low-power field hardware while keeping restore windows small.
const BACKUP_INTERVAL_SEC: u64 = 6 * 3600;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "agriscan.toml".to_string());
    let cfg = config::load(&config_path).unwrap_or_else(|e| {
        warn!("{e:#} — using built-in defaults");
        Config::default()
    });

    // Restore from backup before connecting, for RAM-backed working dirs.
    if let (Some(working_path), Some(ref backup)) =
        (db::db_file_path(&cfg.db_path), &cfg.db_backup_path)
    {
        match db::restore_from_backup(&working_path, backup) {
            Ok(true) => info!(backup = %backup, "database restored from backup"),
            Ok(false) => {}
            Err(e) => warn!("backup restore failed (starting fresh): {e:#}"),
        }
    }

    let db_url = if cfg.db_path.contains(':') {
        cfg.db_path.clone()
    } else {
        format!("sqlite:{}?mode=rwc", cfg.db_path)
    };
    let db = Db::connect(&db_url).await.context("connect to database")?;
    db.migrate().await.context("run migrations")?;

    let reference = ReferenceData::load(&cfg.reference_path);
    let prefs = UserPreferences::load(&cfg.prefs_path);
    let soil = reference
        .soils
        .get(&prefs.soil)
        .copied()
        .unwrap_or_else(|| reference.soils.values().next().copied().unwrap());
    info!(
        crop = %prefs.crop,
        soil = %prefs.soil,
        theta_fc = soil.theta_fc,
        "loaded crop/soil reference"
    );

    let vg = VanGenuchtenParams::default();
    let mut pipeline = Pipeline::new(cfg.clone(), vg);

    // Seed theta_fc*/theta_refill* from the crop/soil reference table so the
    // device is actionable from the first reading instead of reporting
    // UNKNOWN until INIT collects n_init() samples.
    let days_after_planting = prefs
        .planting_ts
        .map(|planted| {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            (now - planted).max(0) / 86_400
        })
        .unwrap_or(0) as u32;
    let p = reference
        .stage_for(&prefs.crop, days_after_planting)
        .map(|stage| stage.p)
        .unwrap_or(0.5);
    let seeded_refill = ReferenceData::seed_theta_refill(soil.theta_fc, soil.theta_wp, p);
    pipeline.autocal.seed_from_reference(soil.theta_fc, seeded_refill);
    info!(theta_fc = soil.theta_fc, theta_refill = seeded_refill, p, "seeded calibration from crop/soil reference");

    // Seed auto-calibration from the last persisted calibration snapshot,
    // if one exists, so a restart doesn't forget weeks of learning.
    if let Some(cal) = db.latest_calibration().await.context("load latest calibration")? {
        pipeline.autocal.theta_fc = cal.theta_fc;
        pipeline.autocal.theta_refill = cal.theta_refill;
        pipeline.autocal.n_events = cal.n_events;
        if let Ok(params) = serde_json::from_str(&cal.params_json) {
            pipeline.autocal.params = params;
        }
        info!(version = cal.version, state = %cal.state, "resumed auto-calibration from last snapshot");
    }

    // Rebuild the trailing ring buffer from the tail of `samples` so the
    // event detector and QC checks don't start blind after a restart.
    let history = db
        .recent_samples(ringbuffer::DEFAULT_CAPACITY as i64)
        .await
        .context("load sample history")?;
    let n_history = history.len();
    pipeline.rehydrate(history);
    if n_history > 0 {
        info!(n = n_history, "rehydrated ring buffer from persisted history");
    }

    let pipeline = Arc::new(Mutex::new(pipeline));
    let shared: SharedState = Arc::new(RwLock::new(DiagnosticsState::new()));
    let prefs_shared = Arc::new(RwLock::new(prefs));

    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        db: db.clone(),
        pipeline: Arc::clone(&pipeline),
        prefs: Arc::clone(&prefs_shared),
        prefs_path: cfg.prefs_path.clone(),
        reference: Arc::new(reference),
        db_path: cfg.db_path.clone(),
    };
    let web_port = cfg.web_port;
    let mut web_handle = tokio::spawn(async move {
        web::serve(web_state, web_port).await;
    });

    let mut acquisition_handle = {
        let acq_pipeline = Arc::clone(&pipeline);
        let acq_db = db.clone();
        let acq_shared = Arc::clone(&shared);
        let cadence = Duration::from_secs(cfg.sample_cadence_s);
        tokio::spawn(async move {
            let mut backend = DefaultBackend::default();
            let mut ticker = tokio::time::interval(cadence);
            loop {
                ticker.tick().await;
                let now_ts = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64;
                let mut guard = acq_pipeline.lock().await;
                match guard.acquire(&mut backend, now_ts, &acq_db, &acq_shared).await {
                    Ok(_) => {
                        let mut st = acq_shared.write().await;
                        st.storage_ok = true;
                    }
                    Err(e) => {
                        error!("acquisition cycle failed: {e:#}");
                        let mut st = acq_shared.write().await;
                        st.storage_ok = false;
                        st.record_error(now_ts, format!("acquisition cycle failed: {e:#}"));
                    }
                }
            }
        })
    };

    let mut backup_handle = {
        let backup_db = db.clone();
        let backup_dest = cfg.db_backup_path.clone();
        tokio::spawn(async move {
            let Some(dest) = backup_dest else {
                std::future::pending::<()>().await;
                return;
            };
            let mut ticker = tokio::time::interval(Duration::from_secs(BACKUP_INTERVAL_SEC));
            loop {
                ticker.tick().await;
                match backup_db.backup(&dest).await {
                    Ok(()) => info!(path = %dest, "database backup complete"),
                    Err(e) => error!("database backup failed: {e:#}"),
                }
            }
        })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;
    loop {
        tokio::select! {
            result = &mut acquisition_handle => {
                error!("CRITICAL: acquisition task exited unexpectedly: {result:?}");
                exit_reason = "acquisition task died";
                break;
            }
            result = &mut web_handle => {
                error!("web server task exited unexpectedly: {result:?}");
            }
            result = &mut backup_handle => {
                error!("backup task exited unexpectedly: {result:?}");
            }
            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }
            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    warn!(signal = exit_reason, "shutting down — flushing pending samples");
    {
        let mut guard = pipeline.lock().await;
        let now_ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        if let Err(e) = guard.flush(&db, &shared, now_ts).await {
            error!("final flush failed: {e:#}");
        }
    }

    if let Some(ref dest) = cfg.db_backup_path {
        match db.backup(dest).await {
            Ok(()) => info!(path = %dest, "final database backup complete"),
            Err(e) => error!("final database backup failed: {e:#}"),
        }
    }

    info!("shutdown complete");
    Ok(())
}
