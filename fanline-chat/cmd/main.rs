use anyhow::Result;
use fanline_chat::ApplicationBootstrap;
use fanline_core::load_config;
use fanline_core::tracing::init_tracing_from_config;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let app_config = load_config(Some("config"));
    init_tracing_from_config(Some(&app_config.logging));

    ApplicationBootstrap::run(app_config).await
}
