use std::future::Future;

/// Drives `future` to completion on a dedicated thread with its own current-thread runtime.
pub fn spawn_thread<F>(name: String, future: F) -> std::io::Result<std::thread::JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread().build()?;
    std::thread::Builder::new()
        .name(name)
        .spawn(move || runtime.block_on(future))
}

/// Runs a blocking closure off the async executor.
#[inline]
pub async fn handle<T, F>(f: F) -> Result<T, tokio::task::JoinError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await
}
