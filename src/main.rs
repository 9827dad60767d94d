use std::sync::Arc;

use actix_web::web;
use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use codejudge::config::{CliArgs, Config};
use codejudge::judge::Engine;
use codejudge::reclaimer::Reclaimer;
use codejudge::sandbox::{ContainerRunner, SandboxRunner};
use codejudge::web_server::build_server;
use codejudge::workspace::WorkspaceManager;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        sandbox: sandbox_config,
        judge: judge_config,
        workspace: workspace_config,
        reclaimer: reclaimer_config,
    } = cli.to_config().context("Failed to load configuration")?;

    let time_limit = sandbox_config.time_limit();
    let container_runner = ContainerRunner::new(sandbox_config);
    // A missing engine or image is reported per request, the server still starts
    match container_runner.probe().await {
        Ok(_) => {
            if let Err(e) = container_runner.ensure_images().await {
                log::error!("{e}");
            }
        }
        Err(e) => log::error!("{e}"),
    }
    let runner: Arc<dyn SandboxRunner> = Arc::new(container_runner);

    let workspace_root = workspace_config.resolve_root()?;
    let workspaces = WorkspaceManager::new(workspace_root)?;

    let reclaimer = Arc::new(Reclaimer::new(
        &workspaces,
        runner.clone(),
        reclaimer_config,
    ));
    let engine = web::Data::new(
        Engine::new(runner, workspaces, judge_config, time_limit)
            .with_reclaim_trigger(reclaimer.trigger()),
    );
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut background = JoinSet::new();
    background.spawn(reclaimer.run(shutdown_token.clone()));

    let server = build_server(server_config, engine).context("Failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_reclaimer) = background.join_next() => {
            log::error!("Reclaimer terminated unexpectedly: {:?}", res_reclaimer);
        }
    }

    // 1. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    // 2. Stop the reclaimer
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to the reclaimer, waiting for it to finish...");

    // 3. Wait until it terminates
    while let Some(res) = background.join_next().await {
        match res {
            Ok(Err(e)) => log::error!("Reclaimer finished with error: {e:?}"),
            Err(e) if e.is_panic() => log::error!("Reclaimer handle panicked: {e:?}"),
            Err(e) => log::error!("Reclaimer handle finished with error: {e:?}"),
            Ok(Ok(())) => {}
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
