#[tokio::main]
async fn main() -> anyhow::Result<()> {
    harvest::run_cli().await
}
