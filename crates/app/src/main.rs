#[tokio::main]
async fn main() {
    if let Err(error) = pixelscale_app::run_from_env().await {
        tracing::error!("{error:#}");
        eprintln!("pixelscale: {error:#}");
        std::process::exit(1);
    }
}
