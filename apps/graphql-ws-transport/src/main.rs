//! GraphQL Subscription CLI
//!
//! Subscribes to one GraphQL subscription and prints every result as a JSON
//! line on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! GRAPHQL_WS_URL=ws://localhost:4000/graphql \
//! GRAPHQL_SUBSCRIPTION='subscription { messageAdded { content } }' \
//! cargo run --bin gql-subscribe
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `GRAPHQL_WS_URL`: Endpoint (`ws`, `wss`, `http` or `https`)
//! - `GRAPHQL_SUBSCRIPTION`: Subscription document
//!
//! ## Optional
//! - `GRAPHQL_VARIABLES`: Variables as a JSON object
//! - `GRAPHQL_WS_*`: Transport tuning, see `ClientConfig::from_env`
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: graphql-ws-transport)
//! - `RUST_LOG`: Log level (default: info)

use std::io::Write;

use anyhow::{Context, bail};
use futures::StreamExt;
use graphql_ws_transport::infrastructure::telemetry;
use graphql_ws_transport::{
    ClientConfig, GraphQLRequest, GraphQLWsClient, SubscriptionError, init_metrics,
};
use serde_json::Value;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    let metrics = match init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics recorder unavailable");
            None
        }
    };

    let config = ClientConfig::from_env().context("invalid transport configuration")?;
    let request = request_from_env()?;
    log_config(&config, &request);

    let client = GraphQLWsClient::new(config);
    client.on_transport_error(|error| {
        tracing::error!(error = %error, "Transport error");
    });

    let stream = client.create_subscription_stream(request);
    let mut listener = stream.listen();
    let stdout = std::io::stdout();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            () = &mut shutdown => break Ok(()),
            item = listener.next() => match item {
                Some(Ok(response)) => {
                    let line = serde_json::to_string(&response)?;
                    let mut out = stdout.lock();
                    writeln!(out, "{line}")?;
                    out.flush()?;
                }
                Some(Err(SubscriptionError::Operation(payload))) => {
                    break Err(anyhow::anyhow!("subscription rejected: {payload}"));
                }
                Some(Err(error)) => break Err(error.into()),
                None => {
                    tracing::info!("Subscription completed");
                    break Ok(());
                }
            },
        }
    };

    listener.detach();
    client.dispose().await;

    if let Some(handle) = metrics {
        tracing::debug!(metrics = %handle.render(), "Final metrics");
    }

    tracing::info!("Stopped");
    outcome
}

/// Read the subscription document and variables.
fn request_from_env() -> anyhow::Result<GraphQLRequest> {
    let query = std::env::var("GRAPHQL_SUBSCRIPTION")
        .context("GRAPHQL_SUBSCRIPTION must be set")?;
    if query.trim().is_empty() {
        bail!("GRAPHQL_SUBSCRIPTION is empty");
    }

    let mut request = GraphQLRequest::new(query);

    if let Ok(raw) = std::env::var("GRAPHQL_VARIABLES")
        && !raw.trim().is_empty()
    {
        let variables: Value =
            serde_json::from_str(&raw).context("GRAPHQL_VARIABLES is not valid JSON")?;
        if !variables.is_object() {
            bail!("GRAPHQL_VARIABLES must be a JSON object");
        }
        request = request.with_variables(variables);
    }

    Ok(request)
}

/// Load `.env` from the working directory or its nearest ancestor.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

fn log_config(config: &ClientConfig, request: &GraphQLRequest) {
    tracing::info!(
        url = config.url(),
        connect_timeout_ms = u64::try_from(config.transport.connect_timeout.as_millis())
            .unwrap_or(u64::MAX),
        max_reconnect_attempts = config.transport.max_reconnect_attempts,
        "Configuration loaded"
    );
    tracing::debug!(
        query = %request.query,
        has_variables = request.variables.is_some(),
        has_connection_params = config.connection_params.is_some(),
        "Subscription request"
    );
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
