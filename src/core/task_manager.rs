use crate::{
    core::{
        bus::MasterRequest,
        master::Master,
        runtime::{run_master, RuntimeConfig},
    },
    protocol::transport::Transport,
};

/// Spawn a task that returns a Result, logging the error if it fails
pub fn spawn_result_task<F, T, E>(name: &'static str, future: F) -> tokio::task::JoinHandle<Result<T, E>>
where
    F: std::future::Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::task::spawn(async move {
        let result = future.await;
        if let Err(err) = &result {
            log::error!("Task {name} failed: {err}");
        }
        result
    })
}

/// Spawn the engine driver on the current tokio runtime
pub fn spawn_master<T: Transport + 'static>(
    master: Master<T>,
    requests: flume::Receiver<MasterRequest>,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    spawn_result_task(
        "hbus-master",
        run_master(master, requests, RuntimeConfig::default()),
    )
}
