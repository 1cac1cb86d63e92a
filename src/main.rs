use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    uipilot_cli::run().await
}
