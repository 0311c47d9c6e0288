//! paygate server binary.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    paygate::server::run().await
}
