use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use snafu::{ResultExt, Snafu};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mobystash::config::Config;
use mobystash::docker::{Client, DockerError};
use mobystash::router::Router;
use mobystash::sampler::Sampler;
use mobystash::sink;
use mobystash::watcher::DiscoveryMessage;

const METRICS_PORT: u16 = 9367;

#[derive(Debug, Snafu)]
enum RunError {
    #[snafu(display("cannot start metrics endpoint: {source}"))]
    Metrics {
        source: metrics_exporter_prometheus::BuildError,
    },

    #[snafu(display("cannot install metrics recorder: {message}"))]
    Recorder { message: String },

    #[snafu(display("{source}"))]
    Engine { source: DockerError },
}

fn main() {
    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(error) => {
            let _ = error.print();
            process::exit(exitcode::CONFIG);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let sampler = match config.sampler() {
        Ok(sampler) => sampler,
        Err(error) => {
            error!(message = "Invalid sampling configuration.", %error);
            process::exit(exitcode::CONFIG);
        }
    };

    let docker = match Client::connect(&config.docker_host) {
        Ok(docker) => docker,
        Err(error) => {
            error!(message = "Invalid engine configuration.", %error);
            process::exit(exitcode::CONFIG);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(message = "Cannot start the runtime.", %error);
            process::exit(exitcode::OSERR);
        }
    };

    if let Err(error) = runtime.block_on(run(config, docker, sampler)) {
        error!(message = "Fatal error.", %error);
        process::exit(exitcode::UNAVAILABLE);
    }

    info!(message = "Clean shutdown.");
}

async fn run(config: Config, docker: Client, sampler: Sampler) -> Result<(), RunError> {
    // The exporter future is spawned under its own token rather than
    // installed fire-and-forget, so the router can stop the listener
    // during teardown like every other task it owns.
    let metrics_token = CancellationToken::new();
    if config.enable_metrics {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], METRICS_PORT))
            .build()
            .context(MetricsSnafu)?;
        if let Err(error) = metrics::set_global_recorder(recorder) {
            return RecorderSnafu {
                message: error.to_string(),
            }
            .fail();
        }
        let token = metrics_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                result = exporter => {
                    if let Err(error) = result {
                        error!(message = "Metrics endpoint failed.", ?error);
                    }
                }
            }
        });
        info!(message = "Serving metrics.", port = METRICS_PORT);
    }

    let (sink_handle, sink_writer) = sink::channel(config.logstash_server.clone());
    let router = Router::new(
        docker,
        sink_handle,
        Arc::new(sampler),
        config.state_file.clone(),
        Duration::from_secs(config.state_checkpoint_interval),
        metrics_token,
    );

    spawn_signal_listener(router.queue());

    router.run(sink_writer).await.context(EngineSnafu)
}

/// SIGTERM and SIGINT both funnel a single `Terminate` through the router's
/// queue, so shutdown is serialized with ordinary dispatch. A second signal
/// stops waiting for graceful teardown.
fn spawn_signal_listener(queue: tokio::sync::mpsc::Sender<DiscoveryMessage>) {
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (term, int) => {
                error!(
                    message = "Cannot listen for shutdown signals.",
                    sigterm_ok = term.is_ok(),
                    sigint_ok = int.is_ok(),
                );
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        info!(message = "Shutdown signal received.");
        let _ = queue.send(DiscoveryMessage::Terminate).await;

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        warn!(message = "Second shutdown signal, exiting immediately.");
        process::exit(1);
    });
}
