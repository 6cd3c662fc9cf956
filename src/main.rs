use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use flyio_manager::config::Config;
use flyio_manager::extractor::FakeExtractor;
use flyio_manager::gc;
use flyio_manager::logging::{self, BackgroundLog};
use flyio_manager::object_store::FakeObjectStore;
use flyio_manager::orchestrator::Orchestrator;
use flyio_manager::progress::{BackgroundLogSink, NullSink, ProgressSink};
use flyio_manager::status;
use pipeline_api::constants::exit_code;

#[derive(Parser, Debug)]
#[command(version, about = "Downloads, unpacks, and activates container images onto thin-provisioned block devices")]
struct Args {
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the full download/unpack/activate pipeline for one object.
    Run {
        #[arg(long)]
        object_key: String,
        #[arg(long, default_value = "default-bucket")]
        bucket: String,
        #[arg(long, default_value = "default-region")]
        region: String,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Reconciles block devices against the Durable Store and removes orphans.
    Gc {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        ignore_lock: bool,
    },
    /// Prints a read-only summary of pool health and stored rows.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            log::error!("failed to load configuration: {e}");
            return to_process_exit_code(exit_code::GENERIC_FAILURE);
        }
    };

    let result = match args.command {
        Command::Run { object_key, bucket, region, correlation_id } => {
            run_pipeline(config, object_key, bucket, region, correlation_id).await
        }
        Command::Gc { dry_run, force, ignore_lock } => run_gc(config, dry_run || !force, ignore_lock).await,
        Command::Status => run_status(config),
    };

    match result {
        Ok(code) => to_process_exit_code(code),
        Err(e) => {
            log::error!("{e}");
            to_process_exit_code(exit_code::GENERIC_FAILURE)
        }
    }
}

fn to_process_exit_code(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, 255) as u8)
}

async fn run_pipeline(
    config: Config,
    object_key: String,
    bucket: String,
    region: String,
    correlation_id: Option<String>,
) -> Result<i32, anyhow::Error> {
    let correlation_id = correlation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Production deployments inject a real object store / extractor here;
    // the transport and tar-parsing internals are out of this crate's scope.
    let object_store: Arc<dyn flyio_manager::object_store::ObjectStore> = Arc::new(FakeObjectStore::new());
    let extractor: Arc<dyn flyio_manager::extractor::Extractor> = Arc::new(FakeExtractor::new());

    let progress_log_path = config.fsm_dir.join("progress.jsonl");
    let progress: Arc<dyn ProgressSink> = match BackgroundLog::open(&progress_log_path) {
        Ok(log) => Arc::new(BackgroundLogSink::new(log)),
        Err(e) => {
            log::warn!("failed to open progress log at {}: {e}", progress_log_path.display());
            Arc::new(NullSink)
        }
    };

    let orchestrator = Orchestrator::setup(config, object_store, extractor)?;
    orchestrator.resume_all().await;

    match orchestrator.process_image(&object_key, &bucket, &region, &correlation_id, progress.as_ref()).await {
        Ok(result) => {
            println!(
                "activated image_id={} snapshot_id={} snapshot_name={} device_path={}",
                result.image_id, result.snapshot_id, result.snapshot_name, result.device_path
            );
            Ok(exit_code::SUCCESS)
        }
        Err(e) => {
            log::error!("pipeline failed: {e}");
            Ok(exit_code::GENERIC_FAILURE)
        }
    }
}

async fn run_gc(config: Config, dry_run: bool, ignore_lock: bool) -> Result<i32, anyhow::Error> {
    let pool = Arc::new(blockdev::PoolManager::new(
        config.pool_name.clone(),
        config.pool_dir.clone(),
        config.pool_metadata_size_bytes,
        config.pool_data_size_bytes,
    ));
    let block_device = Arc::new(blockdev::BlockDeviceManager::new());
    let store = Arc::new(durable_store::DurableStore::open(&config.datastore_path)?);
    let guard = Arc::new(safeguard::OperationGuard::new(
        pool.clone(),
        pipeline_api::constants::OPERATION_GUARD_DEFAULT_PERMITS,
    ));

    match gc::run(&config, pool, block_device, store, guard, dry_run, ignore_lock).await {
        Ok(report) => {
            println!(
                "gc: {} orphaned device(s), {} orphaned snapshot(s), {} deleted, {} error(s){}",
                report.orphaned_devices.len(),
                report.orphaned_snapshots.len(),
                report.deleted.len(),
                report.deletion_errors.len(),
                if report.dry_run { " (dry run)" } else { "" }
            );
            if report.deletion_errors.is_empty() {
                Ok(exit_code::SUCCESS)
            } else {
                Ok(exit_code::GENERIC_FAILURE)
            }
        }
        Err(e) => {
            log::error!("gc failed: {e}");
            if matches!(e.kind(), pipeline_api::error::ErrorKind::Safeguard(_)) {
                Ok(exit_code::HEALTH_CHECK_BLOCKED)
            } else {
                Ok(exit_code::GENERIC_FAILURE)
            }
        }
    }
}

fn run_status(config: Config) -> Result<i32, anyhow::Error> {
    let pool = Arc::new(blockdev::PoolManager::new(
        config.pool_name.clone(),
        config.pool_dir.clone(),
        config.pool_metadata_size_bytes,
        config.pool_data_size_bytes,
    ));
    let store = Arc::new(durable_store::DurableStore::open(&config.datastore_path)?);

    let report = status::run(&pool, &store)?;
    println!("pool: {:?}", report.pool);
    println!("pool health: {:?}", report.pool_health);
    println!("images: {}", report.image_count);
    println!("unpacked: {}", report.unpacked_count);
    println!("active snapshots: {}", report.active_snapshot_count);
    println!("held locks: {:?}", report.held_locks);
    Ok(exit_code::SUCCESS)
}
