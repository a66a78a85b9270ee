use anyhow::Context;
use std::path::PathBuf;

use crate::access::DEFAULT_DAILY_LIMIT;

/* ====== Конфигурация из окружения ======
   BOT_TOKEN читает сам teloxide (Bot::from_env), остальное — здесь. */

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_ids: Vec<u64>,
    pub tmdb_api_key: Option<String>,
    pub store_dir: PathBuf,
    pub daily_download_limit: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let admin_ids = parse_admin_ids(&std::env::var("ADMIN_IDS").unwrap_or_default());
        let tmdb_api_key = std::env::var("TMDB_API_KEY").ok().filter(|k| !k.is_empty());
        let store_dir = std::env::var("STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        let daily_download_limit = match std::env::var("DAILY_DOWNLOAD_LIMIT") {
            Ok(v) => v.parse().context("DAILY_DOWNLOAD_LIMIT must be a number")?,
            Err(_) => DEFAULT_DAILY_LIMIT,
        };
        Ok(Self { admin_ids, tmdb_api_key, store_dir, daily_download_limit })
    }

    pub fn is_admin(&self, user_id: u64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

// ADMIN_IDS="123,456"; мусорные элементы молча пропускаем
fn parse_admin_ids(raw: &str) -> Vec<u64> {
    raw.split(',')
        .filter_map(|s| s.trim().parse::<u64>().ok())
        .collect()
}
