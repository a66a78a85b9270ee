mod access;
mod admin;
mod config;
mod storage;
mod tg;
mod tmdb;

use dotenvy::dotenv;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = config::Config::from_env()?;
    let bot = Bot::from_env();
    let storage = storage::Storage::open(&cfg.store_dir).await?;
    let tmdb = cfg.tmdb_api_key.clone().map(tmdb::TmdbClient::new);
    let engine = access::AccessEngine::new(cfg.daily_download_limit);

    tracing::info!(
        admins = cfg.admin_ids.len(),
        users = storage.users_count().await,
        movies = storage.movies_count().await,
        channels = storage.channels().await.len(),
        "bot starting"
    );

    let app = tg::App {
        cfg: Arc::new(cfg),
        storage,
        engine,
        tmdb,
        dialogs: admin::Dialogs::default(),
    };
    tg::run(bot, app).await;
    Ok(())
}
