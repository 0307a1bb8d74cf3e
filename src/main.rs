// Main entry point for the swapper-server application.
// Sets up the Tokio runtime, loads the face models into the inference
// engine, configures the Axum router, and starts the HTTP server.

mod engine;
mod web;

use clap::Parser;
use tokio::signal;
use tracing::Level;

/// Command line arguments for swapper-server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct AppConfig {
    /// Hostname/IP to bind the server to.
    /// If this option is specified without value, it will default to "*", meaning the server will listen on all interfaces.
    #[arg(long, env = "SWAPPER_SERVER_HOST", default_value = "0.0.0.0", num_args = 0..=1, default_missing_value = "*")]
    host: String,

    /// Port number to listen on.
    #[arg(short, long, env = "SWAPPER_SERVER_PORT", default_value_t = 5000)]
    port: u16,

    /// Path to the SCRFD face-detection ONNX model.
    #[arg(
        long,
        env = "SWAPPER_SERVER_DETECTOR_MODEL",
        default_value = "models/det_10g.onnx"
    )]
    detector_model: String,

    /// Path to the ArcFace recognition ONNX model.
    #[arg(
        long,
        env = "SWAPPER_SERVER_RECOGNIZER_MODEL",
        default_value = "models/w600k_r50.onnx"
    )]
    recognizer_model: String,

    /// Path to the INSwapper face-swap ONNX model.
    #[arg(
        long,
        env = "SWAPPER_SERVER_SWAPPER_MODEL",
        default_value = "models/inswapper_128.onnx"
    )]
    swapper_model: String,

    /// Path to the INSwapper identity projection matrix (512x512 f32,
    /// little-endian), exported from the model's 'emap' initializer.
    #[arg(
        long,
        env = "SWAPPER_SERVER_SWAPPER_EMAP",
        default_value = "models/inswapper_128.emap.bin"
    )]
    swapper_emap: String,

    /// Number of intra-op threads for each ONNX session.
    #[arg(long, env = "SWAPPER_SERVER_INTRA_THREADS", default_value_t = 2)]
    intra_threads: usize,
}

#[tokio::main]
async fn main() {
    // Parse command line args and environment variables
    let config = AppConfig::parse();

    // Initialize tracing subscriber for structured logging.
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(true)
        .init();

    tracing::info!("Starting swapper-server...");

    // --- Load the face models ---
    // The engine owns all three ONNX sessions; if any model fails to load the
    // server cannot do anything useful, so exit immediately.
    let engine_config = engine::EngineConfig {
        detector_model: config.detector_model,
        recognizer_model: config.recognizer_model,
        swapper_model: config.swapper_model,
        swapper_emap: config.swapper_emap,
        intra_threads: config.intra_threads,
    };

    let engine = engine::spawn_engine(&engine_config).unwrap_or_else(|err| {
        tracing::error!("FATAL: Failed to initialize face engine: {err}");
        eprintln!("FATAL: Face engine initialization failed. See logs for details. Exiting.");
        std::process::exit(1);
    });
    tracing::info!("Face engine initialized.");

    // --- Build Axum Application Router ---
    let app = web::create_app(engine);
    tracing::info!("Axum router configured.");

    // --- Start HTTP Server ---
    let listener = match web::create_listener(&config.host, config.port).await {
        Ok((addr, l)) => {
            tracing::info!("Server successfully bound. Listening on {}", addr);
            l
        }
        Err(e) => {
            tracing::error!("FATAL: Failed to bind server: {}", e);
            eprintln!("FATAL: Could not bind server. Error: {}. Exiting.", e);
            std::process::exit(1);
        }
    };

    // Run the server.
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server run error: {}", e);
        eprintln!("ERROR: Server shut down unexpectedly. Error: {}", e);
    }

    tracing::info!("swapper-server has shut down.");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
