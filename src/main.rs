#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hr_live_dashboard_lib::run().await
}
