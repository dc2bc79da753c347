#![forbid(unsafe_code)]

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	pairlive_server::run().await
}
