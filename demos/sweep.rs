//! A controller that sweeps batch size and model over every server in
//! `servers.yaml`.
//!
//! Start `distexp-agent` on every server first, then:
//!
//! ```text
//! cargo run --example sweep -- --servers-file servers.yaml -vv
//! ```

use std::time::Duration;

use clap::Parser;
use futures::future::try_join_all;

use distexp::{
    check, init_logging, load_servers, Action, ControllerConfig, DistexpError, FileSink,
    FnExperiment, ParameterGrid, Params, Registry, RunPolicy, Scheduler, ServerGroup,
    SubstrMatcher,
};

/// Starts the inference server everywhere, waits until each one is ready,
/// then runs the client against it.
async fn serve_and_query(servers: ServerGroup, params: Params) -> Result<Action, DistexpError> {
    let mut launched = Vec::new();
    for server in &servers {
        let (matcher, ready) = SubstrMatcher::new("Uvicorn running on");
        let command = server.render(
            "python serve.py --model {{model}} --port {{serve_port}} --gpus {{gpus}}",
            &params,
        )?;
        let process = server.command(command).echo().stderr(matcher).spawn().await?;
        launched.push((process, ready));
    }
    for (process, ready) in launched.iter_mut() {
        let became_ready = tokio::time::timeout(Duration::from_secs(300), ready.wait()).await;
        check!(
            matches!(became_ready, Ok(true)),
            "{} did not become ready",
            process.server()
        );
    }

    let clients = servers.iter().map(|server| {
        let params = &params;
        async move {
            let log = format!("results/{}.{}.log", server.id, params.suffix());
            let command = server.render(
                "python client.py --port {{serve_port}} --batch-size {{batch_size}}",
                params,
            )?;
            let client = server
                .command(command)
                .echo()
                .stdout(FileSink::truncate(log)?)
                .timeout(Duration::from_secs(1800))
                .spawn()
                .await?;
            client.wait_success().await
        }
    });
    try_join_all(clients).await?;

    for (process, _) in &launched {
        process.kill().await?;
    }
    Ok(Action::Continue)
}

#[tokio::main]
async fn main() -> Result<(), DistexpError> {
    let config = ControllerConfig::parse();
    init_logging(config.verbose, config.log_file.as_deref())?;
    std::fs::create_dir_all("results")?;

    let servers = load_servers(&config.servers_file)?.with_working_directory("/opt/llm-bench");
    let grid = ParameterGrid::new()
        .param("model", ["llama-7b", "llama-13b"])
        .computed("gpus", &["model"], |params: &Params| {
            match params.value::<String>("model").as_deref() {
                Ok("llama-13b") => 2,
                _ => 1,
            }
        })
        .param("batch_size", [8, 16, 32])
        .param("serve_port", [8000]);

    let mut registry = Registry::new();
    registry.register_grid(
        "serve_and_query",
        &servers,
        &grid,
        RunPolicy::default().max_restarts(3),
        FnExperiment(serve_and_query),
    )?;

    let summary = Scheduler::from_config(registry, &config)?.run().await?;
    println!(
        "Ran {} experiments ({} skipped) in {:.1} seconds",
        summary.experiments,
        summary.skipped,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}
