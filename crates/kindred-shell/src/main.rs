#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kindred_shell::run().await
}
