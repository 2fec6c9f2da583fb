//! Stateless Gateway Service
//!
//! Wires the orchestration engine to the HTTP ingress: builds the upstream
//! registry, cache, and dispatcher from configuration, spawns the beacon
//! event consumer, head poller, and cache sweeper, and serves the API with
//! a three-phase graceful shutdown. A restart request drains the same way
//! and re-initializes with the staged configuration.

mod api;
mod config;
mod state;

use anyhow::{Context, Result};
use clap::Parser;
use config::Args;
use gateway_engine::{
    BeaconEventConsumer, CoalescingCache, Dispatcher, Engine, HeadPoller, PeriodStore,
    ProofRunner, RunnerConfig, StructuralVerifier, SyncTransitionRunner, UpstreamKind,
};
use gateway_proofs::StructuralEnvelopeVerifier;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Outcome {
    Shutdown,
    Restart(Args),
}

#[tokio::main]
async fn main() {
    // Load environment from .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable");
            None
        }
    };

    let mut current = args;
    loop {
        match run_gateway(current.clone(), prometheus.clone()).await {
            Ok(Outcome::Shutdown) => {
                tracing::info!("gateway stopped");
                return;
            }
            Ok(Outcome::Restart(next)) => {
                tracing::info!("restarting with staged configuration");
                current = next;
            }
            Err(e) => {
                tracing::error!(error = %e, "initialization failed");
                std::process::exit(1);
            }
        }
    }
}

async fn run_gateway(args: Args, prometheus: Option<PrometheusHandle>) -> Result<Outcome> {
    tracing::info!(chain_id = args.chain_id, "starting stateless gateway");
    tracing::info!(rpc = args.rpc_nodes.len(), beacon = args.beacon_nodes.len(), prover = args.prover_nodes.len(), "upstream pools");

    let registry = Arc::new(args.build_registry());
    let cache = CoalescingCache::new(args.cache_config());
    let dispatcher = Dispatcher::new(Arc::clone(&registry), args.dispatch_config())
        .context("dispatcher init")?;

    let period_store = match args.period_store_config() {
        Some(store_config) => Some(
            PeriodStore::open(store_config)
                .await
                .context("period store init")?,
        ),
        None => None,
    };

    let engine = Engine::new(
        Arc::clone(&registry),
        Arc::clone(&cache),
        dispatcher,
        period_store.clone(),
    );
    let sync = period_store.map(|store| {
        Arc::new(SyncTransitionRunner::new(
            Arc::clone(&engine),
            store,
            Arc::new(StructuralVerifier),
        ))
    });
    let runner = ProofRunner::new(Arc::clone(&engine), sync.clone(), RunnerConfig::default());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    let has_beacon = !registry.pool(UpstreamKind::BeaconApi).is_empty();
    let (consumer_state, head_rx) = if args.beacon_events && has_beacon {
        let (consumer, state_rx, head_rx) =
            BeaconEventConsumer::new(Arc::clone(&engine), sync.clone(), args.events_config());
        background.push(tokio::spawn(consumer.run(shutdown_rx.clone())));
        (Some(state_rx), Some(head_rx))
    } else {
        (None, None)
    };

    if args.rpc_head_poll_enabled && !registry.pool(UpstreamKind::EthRpc).is_empty() {
        let poller = HeadPoller::new(
            Arc::clone(&registry),
            Duration::from_millis(args.rpc_head_poll_interval_ms),
        )
        .context("head poller init")?;
        background.push(tokio::spawn(poller.run(shutdown_rx.clone())));
    }

    {
        let cache = Arc::clone(&cache);
        let mut rx = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(cache.sweep_interval()) => cache.sweep(),
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    let app_state = AppState::new(
        engine,
        runner,
        Arc::new(StructuralEnvelopeVerifier),
        args.clone(),
        consumer_state,
        head_rx,
        prometheus,
        shutdown_tx.clone(),
    );
    let router = api::create_router(app_state.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("bind port {}", args.port))?;
    tracing::info!(port = args.port, "gateway listening");

    let mut serve_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        while !*serve_shutdown.borrow() {
            if serve_shutdown.changed().await.is_err() {
                break;
            }
        }
    });
    let mut server_task = tokio::spawn(async move { server.await });

    let signal_task = tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            shutdown_tx.send_replace(true);
        }
    });

    // phase 1: run until the server dies on its own or shutdown triggers
    let mut rx = shutdown_rx.clone();
    let early_exit = tokio::select! {
        result = &mut server_task => Some(result),
        _ = async {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        } => None,
    };

    match early_exit {
        Some(result) => {
            signal_task.abort();
            for task in background {
                task.abort();
            }
            result.context("server task")?.context("server failed")?;
            anyhow::bail!("server stopped unexpectedly");
        }
        None => {
            // phase 2: drain open requests within the grace window
            let drain = Duration::from_secs(args.shutdown_drain_sec);
            match tokio::time::timeout(drain, &mut server_task).await {
                Ok(result) => {
                    result.context("server task")?.context("server failed")?;
                }
                Err(_) => {
                    tracing::warn!("drain window elapsed, forcing connections closed");
                    server_task.abort();
                }
            }
            // phase 3: stop long-lived handles before leaving the loop
            signal_task.abort();
            for task in background {
                task.abort();
            }
        }
    }

    if app_state.restart_requested() {
        Ok(Outcome::Restart(app_state.current_args()))
    } else {
        Ok(Outcome::Shutdown)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
