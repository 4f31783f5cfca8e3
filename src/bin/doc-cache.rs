use anyhow::Result;
use doc_cache::cli::run;

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}
