mod setup;
mod state;
mod stats;

use pictor_core::Config;

// Use mimalloc as the global allocator; encoders allocate large short-lived
// buffers and the system allocator fragments under that load.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let state = crate::setup::initialize_app(config).await?;

    crate::setup::server::run_until_shutdown(state).await?;

    Ok(())
}
