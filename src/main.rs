//! OMERO bridge - lazy array access to images on a remote OMERO server.
//!
//! This binary opens images through the bridge and reports what a viewer
//! would see, or checks that a server and its credentials work.

use clap::Parser;
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use omero_bridge::{
    config::{CheckConfig, Cli, Command, ConnectionConfig, ViewConfig},
    Axis, AxisIndex, ArraySource, BridgeError, CacheStats, ChannelLayer, DatasetHandle,
    DatasetRegistry, HttpRemote, ImageMetadata, LazyArrayView, MetadataResolver, PyramidLevel,
    RemoteSession, SessionManager,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::View(config) => run_view(config).await,
        Command::Check(config) => run_check(config).await,
    }
}

// =============================================================================
// View Command
// =============================================================================

/// What a viewer would be handed for one opened image.
#[derive(Serialize)]
struct ViewSummary<'a> {
    metadata: &'a ImageMetadata,
    level: &'a PyramidLevel,
    shape: [usize; 5],
    dims_labels: Vec<Axis>,
    dims_defaults: Vec<usize>,
    channel_layers: Vec<ChannelLayer>,
    planes: Vec<PlaneSummary>,
    prefetched: Option<usize>,
    cache: CacheStats,
}

#[derive(Serialize)]
struct PlaneSummary {
    t: usize,
    c: usize,
    z: usize,
    shape: Vec<usize>,
    min: Option<f64>,
    max: Option<f64>,
}

async fn run_view(config: ViewConfig) -> ExitCode {
    init_logging(config.connection.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Configuration:");
    info!("  Server: {}", config.connection.server);
    info!("  User: {}", config.connection.username);
    info!(
        "  Pool: {} connections, {}ms call timeout",
        config.connection.pool_size, config.connection.call_timeout_ms
    );
    info!("  Cache: {}MB planes", config.cache_bytes / (1024 * 1024));

    let session = match connect(&config.connection) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to create client for {}: {}", config.connection.server, e);
            return ExitCode::FAILURE;
        }
    };

    let registry = DatasetRegistry::with_capacity(session, config.handle_config(), 1);

    let result = view_dataset(&registry, &config).await;
    registry.close().await;

    match result {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to view {}: {}", config.object, e);
            ExitCode::FAILURE
        }
    }
}

async fn view_dataset(registry: &DatasetRegistry, config: &ViewConfig) -> Result<String, BridgeError> {
    let handle = registry.get(config.object).await?;
    let view = choose_view(&handle, config)?;
    let level = view.level().index;

    let prefetched = if config.eager {
        let mut total = 0;
        for c in 0..handle.metadata().size_c {
            total += handle.prefetch_channel(level, c).await?;
        }
        info!("Loaded {} plane(s) of {} eagerly", total, handle.id());
        Some(total)
    } else {
        None
    };

    let metadata = handle.metadata();
    let mut planes = Vec::with_capacity(metadata.size_c);
    for c in 0..metadata.size_c {
        let (t, z) = (metadata.default_t, metadata.default_z);
        let chunk = view
            .get(&[
                AxisIndex::Scalar(t as i64),
                AxisIndex::Scalar(c as i64),
                AxisIndex::Scalar(z as i64),
            ])
            .await?;
        let range = chunk.min_max();
        planes.push(PlaneSummary {
            t,
            c,
            z,
            shape: chunk.shape().to_vec(),
            min: range.map(|(min, _)| min),
            max: range.map(|(_, max)| max),
        });
    }

    let summary = ViewSummary {
        metadata,
        level: view.level(),
        shape: view.shape(),
        dims_labels: handle.dims_labels(),
        dims_defaults: handle.dims_defaults(),
        channel_layers: handle.channel_layers(),
        planes,
        prefetched,
        cache: handle.cache().stats(),
    };

    serde_json::to_string_pretty(&summary)
        .map_err(|e| BridgeError::Metadata(format!("failed to render summary: {}", e)))
}

/// Pick the level view requested by `--level` or `--scale`, or the base level.
fn choose_view<'a>(
    handle: &'a DatasetHandle,
    config: &ViewConfig,
) -> Result<&'a LazyArrayView, BridgeError> {
    if let Some(scale) = config.scale {
        let view = handle.view_for_scale(scale);
        info!(
            "Scale {} selects level {} (downsample {})",
            scale,
            view.level().index,
            view.level().downsample
        );
        return Ok(view);
    }

    let level = config.level.unwrap_or(0);
    handle.level(level).ok_or_else(|| {
        BridgeError::UnsupportedIndex(format!(
            "pyramid level {} does not exist ({} levels)",
            level,
            handle.levels().len()
        ))
    })
}

/// Build the HTTP client and the session manager on top of it.
fn connect(
    config: &ConnectionConfig,
) -> Result<Arc<SessionManager<HttpRemote>>, omero_bridge::RemoteError> {
    let remote = HttpRemote::new(config.server.trim(), config.call_timeout())?;
    Ok(Arc::new(SessionManager::new(
        Arc::new(remote),
        config.session_config(),
    )))
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "omero_bridge=debug"
    } else {
        "omero_bridge=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// =============================================================================
// Check Command
// =============================================================================

async fn run_check(config: CheckConfig) -> ExitCode {
    // Initialize minimal logging for check command
    if config.connection.verbose {
        init_logging(true);
    }

    println!("OMERO Bridge Configuration Check");
    println!("═════════════════════════════════");
    println!();

    if let Err(e) = config.validate() {
        println!("✗ Configuration: {}", e);
        return ExitCode::FAILURE;
    }
    println!("✓ Server: {}", config.connection.server.trim());
    println!("✓ User: {}", config.connection.username);
    println!(
        "✓ Pool: {} connection(s), {}ms wait",
        config.connection.pool_size, config.connection.pool_wait_ms
    );
    println!();

    let session = match connect(&config.connection) {
        Ok(session) => session,
        Err(e) => {
            println!("✗ Client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    print!("Logging in... ");
    match session.acquire().await {
        Ok(guard) => {
            println!("✓ success");
            session.release(guard);
        }
        Err(e) => {
            println!("✗ failed");
            println!();
            println!("Error: {}", e);
            println!();
            println!("Please check:");
            println!("  - The server URL is correct and reachable");
            println!("  - The username and password are valid");
            session.logout().await;
            return ExitCode::FAILURE;
        }
    }

    if let Some(id) = config.object {
        println!();
        print!("Resolving {}... ", id);

        let resolver = MetadataResolver::new(session.clone());
        match resolver.resolve(id).await {
            Ok(metadata) => {
                println!("✓ found");
                println!("  Name: {}", metadata.name);
                println!("  Shape (T, C, Z, Y, X): {:?}", metadata.shape());
                println!("  Pixel type: {}", metadata.pixel_type.name());
                println!("  Pyramid levels: {}", metadata.level_count());
            }
            Err(e) => {
                println!("✗ failed");
                println!();
                println!("  {}", e);
                session.logout().await;
                return ExitCode::FAILURE;
            }
        }
    }

    session.logout().await;

    println!();
    println!("═════════════════════════════════");
    println!("✓ All checks passed!");

    ExitCode::SUCCESS
}
