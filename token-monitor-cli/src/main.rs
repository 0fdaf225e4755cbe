use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    token_monitor_cli::run().await?;
    Ok(())
}
