use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

use crate::access::Mutation;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/* ====== Доменные типы ====== */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: u64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub watch_count: u64,
    pub search_count: u64,
    #[serde(default)]
    pub favorites: BTreeSet<String>,
    #[serde(default)]
    pub watchlist: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PremiumRecord {
    pub active: bool,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PremiumRecord {
    /// `active` в файле — лишь подсказка; истина всегда пересчитывается от часов.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadLink {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movie {
    pub code: String,
    pub title: String,
    pub year: Option<String>,
    pub genre: Option<String>,
    pub language: Option<String>,
    pub rating: Option<String>,
    pub description: Option<String>,
    // file_id видео в Telegram; фильм может жить и без него (только ссылки)
    pub file_id: Option<String>,
    #[serde(default)]
    pub links: Vec<DownloadLink>,
    pub views: u64,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelKind {
    Telegram { username: String, chat_id: i64 },
    Instagram,
    Youtube,
    Twitter,
    Tiktok,
}

impl ChannelKind {
    pub fn icon(&self) -> &'static str {
        match self {
            ChannelKind::Telegram { .. } => "📱",
            ChannelKind::Instagram => "📷",
            ChannelKind::Youtube => "📺",
            ChannelKind::Twitter => "🐦",
            ChannelKind::Tiktok => "🎵",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRequirement {
    #[serde(flatten)]
    pub kind: ChannelKind,
    pub name: String,
    pub url: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadLogEntry {
    pub user_id: u64,
    pub code: String,
    pub title: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayStats {
    pub views: u64,
    pub searches: u64,
    pub new_users: u64,
    #[serde(default)]
    pub active_users: BTreeSet<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Totals {
    pub views: u64,
    pub searches: u64,
    pub subscriptions: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analytics {
    pub daily: BTreeMap<NaiveDate, DayStats>,
    pub total: Totals,
}

/// Сводка для админ-панели.
#[derive(Debug, Clone)]
pub struct StatsSummary {
    pub users: usize,
    pub movies: usize,
    pub channels: usize,
    pub total_views: u64,
    pub total_searches: u64,
    pub today: DayStats,
    pub top: Vec<(String, String, u64)>,
    pub active_week: usize,
}

/* ====== Хранилище ======
   Один JSON-файл на сущность, атомарная запись через tmp+rename.
   Пишем только те файлы, которых коснулась мутация. */

#[derive(Debug, Default)]
struct State {
    movies: HashMap<String, Movie>,
    users: HashMap<u64, UserProfile>,
    channels: Vec<ChannelRequirement>,
    premium: HashMap<u64, PremiumRecord>,
    downloads: Vec<DownloadLogEntry>,
    analytics: Analytics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Entity {
    Movies,
    Users,
    Channels,
    Premium,
    Downloads,
    Analytics,
}

impl Entity {
    fn file_name(self) -> &'static str {
        match self {
            Entity::Movies => "movies.json",
            Entity::Users => "users.json",
            Entity::Channels => "channels.json",
            Entity::Premium => "premium.json",
            Entity::Downloads => "downloads.json",
            Entity::Analytics => "analytics.json",
        }
    }
}

#[derive(Clone)]
pub struct Storage {
    inner: Arc<RwLock<State>>,
    dir: PathBuf,
}

impl Storage {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let state = State {
            movies: load_file(&dir.join(Entity::Movies.file_name())).await,
            users: load_file(&dir.join(Entity::Users.file_name())).await,
            channels: load_file(&dir.join(Entity::Channels.file_name())).await,
            premium: load_file(&dir.join(Entity::Premium.file_name())).await,
            downloads: load_file(&dir.join(Entity::Downloads.file_name())).await,
            analytics: load_file(&dir.join(Entity::Analytics.file_name())).await,
        };
        Ok(Self { inner: Arc::new(RwLock::new(state)), dir })
    }

    /* ====== Пользователи ====== */

    /// Профиль создаётся лениво при первом обращении, счётчики нулевые.
    pub async fn ensure_user(
        &self,
        id: u64,
        username: Option<&str>,
        first_name: &str,
        last_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> UserProfile {
        {
            let guard = self.inner.read().await;
            if let Some(u) = guard.users.get(&id) {
                return u.clone();
            }
        }
        let profile = UserProfile {
            id,
            username: username.map(str::to_owned),
            first_name: first_name.to_owned(),
            last_name: last_name.map(str::to_owned),
            joined_at: now,
            last_active_at: now,
            watch_count: 0,
            search_count: 0,
            favorites: BTreeSet::new(),
            watchlist: BTreeSet::new(),
        };
        let created = {
            let mut guard = self.inner.write().await;
            if guard.users.contains_key(&id) {
                false
            } else {
                guard.users.insert(id, profile.clone());
                guard.analytics.daily.entry(now.date_naive()).or_default().new_users += 1;
                true
            }
        };
        if created {
            self.flush_or_log(Entity::Users).await;
            self.flush_or_log(Entity::Analytics).await;
        }
        profile
    }

    pub async fn user(&self, id: u64) -> Option<UserProfile> {
        self.inner.read().await.users.get(&id).cloned()
    }

    pub async fn users_count(&self) -> usize {
        self.inner.read().await.users.len()
    }

    pub async fn all_user_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.read().await.users.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Страница пользователей (по дате регистрации) и общее число.
    pub async fn users_page(&self, page: usize, per_page: usize) -> (Vec<UserProfile>, usize) {
        let guard = self.inner.read().await;
        let mut users: Vec<UserProfile> = guard.users.values().cloned().collect();
        users.sort_by_key(|u| (u.joined_at, u.id));
        let total = users.len();
        let page = users.into_iter().skip(page * per_page).take(per_page).collect();
        (page, total)
    }

    /// true — код добавлен в избранное, false — убран.
    pub async fn toggle_favorite(&self, user_id: u64, code: &str) -> bool {
        let added = {
            let mut guard = self.inner.write().await;
            match guard.users.get_mut(&user_id) {
                Some(u) => {
                    if u.favorites.remove(code) {
                        false
                    } else {
                        u.favorites.insert(code.to_owned());
                        true
                    }
                }
                None => false,
            }
        };
        self.flush_or_log(Entity::Users).await;
        added
    }

    pub async fn toggle_watchlist(&self, user_id: u64, code: &str) -> bool {
        let added = {
            let mut guard = self.inner.write().await;
            match guard.users.get_mut(&user_id) {
                Some(u) => {
                    if u.watchlist.remove(code) {
                        false
                    } else {
                        u.watchlist.insert(code.to_owned());
                        true
                    }
                }
                None => false,
            }
        };
        self.flush_or_log(Entity::Users).await;
        added
    }

    /* ====== Каталог ====== */

    pub async fn movie(&self, code: &str) -> Option<Movie> {
        self.inner.read().await.movies.get(code).cloned()
    }

    pub async fn movies_count(&self) -> usize {
        self.inner.read().await.movies.len()
    }

    /// false — код уже занят.
    pub async fn add_movie(&self, movie: Movie) -> bool {
        let added = {
            let mut guard = self.inner.write().await;
            if guard.movies.contains_key(&movie.code) {
                false
            } else {
                guard.movies.insert(movie.code.clone(), movie);
                true
            }
        };
        if added {
            self.flush_or_log(Entity::Movies).await;
        }
        added
    }

    pub async fn delete_movie(&self, code: &str) -> bool {
        let removed = self.inner.write().await.movies.remove(code).is_some();
        if removed {
            self.flush_or_log(Entity::Movies).await;
        }
        removed
    }

    /// Поиск по подстроке названия, без учёта регистра.
    pub async fn search_local(&self, query: &str, limit: usize) -> Vec<Movie> {
        let needle = query.to_lowercase();
        let guard = self.inner.read().await;
        let mut found: Vec<Movie> = guard
            .movies
            .values()
            .filter(|m| m.title.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.views.cmp(&a.views).then_with(|| a.title.cmp(&b.title)));
        found.truncate(limit);
        found
    }

    pub async fn top_movies(&self, limit: usize) -> Vec<Movie> {
        let guard = self.inner.read().await;
        let mut all: Vec<Movie> = guard.movies.values().cloned().collect();
        all.sort_by(|a, b| b.views.cmp(&a.views).then_with(|| a.title.cmp(&b.title)));
        all.truncate(limit);
        all
    }

    /// Все фильмы в порядке числового кода — для админ-списка.
    pub async fn movies_sorted(&self) -> Vec<Movie> {
        let guard = self.inner.read().await;
        let mut all: Vec<Movie> = guard.movies.values().cloned().collect();
        all.sort_by_key(|m| m.code.parse::<u64>().unwrap_or(u64::MAX));
        all
    }

    /* ====== Каналы ====== */

    pub async fn channels(&self) -> Vec<ChannelRequirement> {
        self.inner.read().await.channels.clone()
    }

    pub async fn add_channel(&self, channel: ChannelRequirement) {
        self.inner.write().await.channels.push(channel);
        self.flush_or_log(Entity::Channels).await;
    }

    pub async fn remove_channel(&self, index: usize) -> bool {
        let removed = {
            let mut guard = self.inner.write().await;
            if index < guard.channels.len() {
                guard.channels.remove(index);
                true
            } else {
                false
            }
        };
        if removed {
            self.flush_or_log(Entity::Channels).await;
        }
        removed
    }

    /* ====== Премиум ====== */

    pub async fn premium(&self, user_id: u64) -> Option<PremiumRecord> {
        self.inner.read().await.premium.get(&user_id).cloned()
    }

    pub async fn grant_premium(&self, user_id: u64, days: i64, now: DateTime<Utc>) -> PremiumRecord {
        let record = PremiumRecord {
            active: true,
            started_at: now,
            expires_at: now + Duration::days(days),
        };
        {
            let mut guard = self.inner.write().await;
            guard.premium.insert(user_id, record.clone());
            guard.analytics.total.subscriptions += 1;
        }
        self.flush_or_log(Entity::Premium).await;
        self.flush_or_log(Entity::Analytics).await;
        record
    }

    /* ====== Журнал скачиваний ====== */

    /// Квота считается по строкам журнала за календарный день, а не по
    /// сбрасываемому счётчику.
    pub async fn downloads_today(&self, user_id: u64, day: NaiveDate) -> u32 {
        let guard = self.inner.read().await;
        guard
            .downloads
            .iter()
            .filter(|e| e.user_id == user_id && e.at.date_naive() == day)
            .count() as u32
    }

    /* ====== Аналитика ====== */

    pub async fn record_search(&self, user_id: u64, now: DateTime<Utc>) {
        {
            let mut guard = self.inner.write().await;
            if let Some(u) = guard.users.get_mut(&user_id) {
                u.search_count += 1;
                u.last_active_at = now;
            }
            let day = guard.analytics.daily.entry(now.date_naive()).or_default();
            day.searches += 1;
            day.active_users.insert(user_id);
            guard.analytics.total.searches += 1;
        }
        self.flush_or_log(Entity::Users).await;
        self.flush_or_log(Entity::Analytics).await;
    }

    pub async fn stats_summary(&self, now: DateTime<Utc>) -> StatsSummary {
        let guard = self.inner.read().await;
        let today = guard.analytics.daily.get(&now.date_naive()).cloned().unwrap_or_default();
        let mut top: Vec<(String, String, u64)> = guard
            .movies
            .values()
            .map(|m| (m.code.clone(), m.title.clone(), m.views))
            .collect();
        top.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.1.cmp(&b.1)));
        top.truncate(5);
        let week_ago = now - Duration::days(7);
        let active_week = guard.users.values().filter(|u| u.last_active_at > week_ago).count();
        StatsSummary {
            users: guard.users.len(),
            movies: guard.movies.len(),
            channels: guard.channels.len(),
            total_views: guard.analytics.total.views,
            total_searches: guard.analytics.total.searches,
            today,
            top,
            active_week,
        }
    }

    /// Последние `days` дней (включая сегодня), пропуски заполнены нулями.
    pub async fn daily_stats(&self, days: i64, now: DateTime<Utc>) -> Vec<(NaiveDate, DayStats)> {
        let guard = self.inner.read().await;
        (0..days)
            .rev()
            .map(|back| {
                let day = now.date_naive() - Duration::days(back);
                (day, guard.analytics.daily.get(&day).cloned().unwrap_or_default())
            })
            .collect()
    }

    /* ====== Применение мутаций движка ====== */

    /// Мутации применяются в памяти одним батчем, затем сбрасываются только
    /// затронутые файлы. Неудачная запись не блокирует доставку: контент уже
    /// у пользователя, состояние доедет со следующим flush.
    pub async fn apply(&self, mutations: &[Mutation]) {
        if mutations.is_empty() {
            return;
        }
        let mut dirty = BTreeSet::new();
        {
            let mut guard = self.inner.write().await;
            for m in mutations {
                match m {
                    Mutation::PremiumLapsed { user_id } => {
                        if let Some(p) = guard.premium.get_mut(user_id) {
                            p.active = false;
                            dirty.insert(Entity::Premium);
                        }
                    }
                    Mutation::IncrementViews { code } => {
                        if let Some(movie) = guard.movies.get_mut(code) {
                            movie.views += 1;
                            dirty.insert(Entity::Movies);
                        }
                    }
                    Mutation::IncrementWatchCount { user_id } => {
                        if let Some(u) = guard.users.get_mut(user_id) {
                            u.watch_count += 1;
                            dirty.insert(Entity::Users);
                        }
                    }
                    Mutation::AppendDownloadLog { user_id, code, title, at } => {
                        guard.downloads.push(DownloadLogEntry {
                            user_id: *user_id,
                            code: code.clone(),
                            title: title.clone(),
                            at: *at,
                        });
                        dirty.insert(Entity::Downloads);
                    }
                    Mutation::TouchLastActive { user_id, at } => {
                        if let Some(u) = guard.users.get_mut(user_id) {
                            u.last_active_at = *at;
                            dirty.insert(Entity::Users);
                        }
                    }
                    Mutation::RecordDailyView { user_id, day } => {
                        let stats = guard.analytics.daily.entry(*day).or_default();
                        stats.views += 1;
                        stats.active_users.insert(*user_id);
                        guard.analytics.total.views += 1;
                        dirty.insert(Entity::Analytics);
                    }
                }
            }
        }
        for entity in dirty {
            self.flush_or_log(entity).await;
        }
    }

    /* ====== Запись на диск ====== */

    async fn flush(&self, entity: Entity) -> Result<(), StorageError> {
        // снапшот сериализуем под read-локом, пишем вне лока
        let bytes = {
            let guard = self.inner.read().await;
            match entity {
                Entity::Movies => serde_json::to_vec_pretty(&guard.movies)?,
                Entity::Users => serde_json::to_vec_pretty(&guard.users)?,
                Entity::Channels => serde_json::to_vec_pretty(&guard.channels)?,
                Entity::Premium => serde_json::to_vec_pretty(&guard.premium)?,
                Entity::Downloads => serde_json::to_vec_pretty(&guard.downloads)?,
                Entity::Analytics => serde_json::to_vec_pretty(&guard.analytics)?,
            }
        };
        let path = self.dir.join(entity.file_name());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    // одна повторная попытка; после неё состояние остаётся в памяти
    // и уедет на диск со следующей успешной записью этого файла
    async fn flush_or_log(&self, entity: Entity) {
        if let Err(first) = self.flush(entity).await {
            tracing::warn!(file = entity.file_name(), error = %first, "flush failed, retrying");
            if let Err(second) = self.flush(entity).await {
                tracing::error!(
                    file = entity.file_name(),
                    error = %second,
                    "flush failed twice, state kept in memory until next write"
                );
            }
        }
    }
}

async fn load_file<T>(path: &Path) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match fs::read(path).await {
        Ok(data) => match serde_json::from_slice(&data) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "corrupt store file, starting empty");
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessEngine, Decision, Flow, MembershipProbe};
    use chrono::TimeZone;

    struct AlwaysMember;

    impl MembershipProbe for AlwaysMember {
        async fn is_member(&self, _channel: &ChannelRequirement, _user_id: u64) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    struct NeverMember;

    impl MembershipProbe for NeverMember {
        async fn is_member(&self, _channel: &ChannelRequirement, _user_id: u64) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    fn movie(code: &str, title: &str) -> Movie {
        Movie {
            code: code.to_owned(),
            title: title.to_owned(),
            year: Some("2024".to_owned()),
            genre: None,
            language: None,
            rating: None,
            description: None,
            file_id: Some("file-1".to_owned()),
            links: vec![DownloadLink { label: "720p".to_owned(), url: "https://example.com/v".to_owned() }],
            views: 0,
            added_at: at(2026, 8, 1, 0),
        }
    }

    #[tokio::test]
    async fn user_created_lazily_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let now = at(2026, 8, 6, 10);
        {
            let storage = Storage::open(dir.path()).await.unwrap();
            let u = storage.ensure_user(42, Some("ann"), "Анна", None, now).await;
            assert_eq!(u.watch_count, 0);
            // повторный вызов не создаёт дубликат
            storage.ensure_user(42, Some("ann"), "Анна", None, now).await;
            assert_eq!(storage.users_count().await, 1);
        }
        let reopened = Storage::open(dir.path()).await.unwrap();
        let u = reopened.user(42).await.unwrap();
        assert_eq!(u.username.as_deref(), Some("ann"));
        let (_, stats) = reopened.daily_stats(1, now).await.pop().unwrap();
        assert_eq!(stats.new_users, 1);
    }

    #[tokio::test]
    async fn grant_mutations_advance_counters_by_one_per_application() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let now = at(2026, 8, 6, 12);
        storage.ensure_user(1, None, "u", None, now).await;
        storage.add_movie(movie("55", "Терминал")).await;

        let mutations = vec![
            Mutation::IncrementViews { code: "55".to_owned() },
            Mutation::IncrementWatchCount { user_id: 1 },
            Mutation::TouchLastActive { user_id: 1, at: now },
            Mutation::RecordDailyView { user_id: 1, day: now.date_naive() },
        ];
        storage.apply(&mutations).await;
        storage.apply(&mutations).await;

        assert_eq!(storage.movie("55").await.unwrap().views, 2);
        assert_eq!(storage.user(1).await.unwrap().watch_count, 2);
        let summary = storage.stats_summary(now).await;
        assert_eq!(summary.total_views, 2);
        assert_eq!(summary.today.views, 2);
    }

    #[tokio::test]
    async fn downloads_counted_per_calendar_day() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let yesterday = at(2026, 8, 5, 23);
        let today = at(2026, 8, 6, 0);
        for _ in 0..5 {
            storage
                .apply(&[Mutation::AppendDownloadLog {
                    user_id: 7,
                    code: "55".to_owned(),
                    title: "t".to_owned(),
                    at: yesterday,
                }])
                .await;
        }
        assert_eq!(storage.downloads_today(7, yesterday.date_naive()).await, 5);
        assert_eq!(storage.downloads_today(7, today.date_naive()).await, 0);
        // чужие записи не учитываются
        assert_eq!(storage.downloads_today(8, yesterday.date_naive()).await, 0);
    }

    #[tokio::test]
    async fn premium_lapse_mutation_clears_active_flag() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let now = at(2026, 8, 6, 12);
        let record = storage.grant_premium(9, 30, now).await;
        assert!(record.is_active_at(now));
        assert!(!record.is_active_at(now + Duration::days(31)));

        storage.apply(&[Mutation::PremiumLapsed { user_id: 9 }]).await;
        assert!(!storage.premium(9).await.unwrap().active);
    }

    #[tokio::test]
    async fn search_is_case_insensitive_and_ranked_by_views() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let mut a = movie("1", "Дюна");
        a.views = 3;
        let mut b = movie("2", "Дюна: Часть вторая");
        b.views = 10;
        storage.add_movie(a).await;
        storage.add_movie(b).await;
        storage.add_movie(movie("3", "Чужой")).await;

        let found = storage.search_local("дюна", 10).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].code, "2");
    }

    #[tokio::test]
    async fn add_movie_rejects_duplicate_code() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        assert!(storage.add_movie(movie("55", "a")).await);
        assert!(!storage.add_movie(movie("55", "b")).await);
        assert!(storage.delete_movie("55").await);
        assert!(!storage.delete_movie("55").await);
    }

    #[tokio::test]
    async fn record_search_bumps_user_and_daily_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let now = at(2026, 8, 6, 15);
        storage.ensure_user(3, None, "u", None, now).await;
        storage.record_search(3, now).await;
        storage.record_search(3, now).await;

        assert_eq!(storage.user(3).await.unwrap().search_count, 2);
        let summary = storage.stats_summary(now).await;
        assert_eq!(summary.total_searches, 2);
        assert_eq!(summary.today.searches, 2);
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("movies.json"), b"{not json")
            .await
            .unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        assert_eq!(storage.movies_count().await, 0);
    }

    #[tokio::test]
    async fn grant_flow_end_to_end_increments_view_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let now = at(2026, 8, 6, 12);
        storage.ensure_user(1, None, "u", None, now).await;
        storage.add_movie(movie("55", "Дюна")).await;
        let engine = AccessEngine::new(5);

        let m = storage.movie("55").await;
        let outcome = engine
            .evaluate(1, m.as_ref(), None, &[], 0, Flow::Watch, &AlwaysMember, now)
            .await;
        assert_eq!(outcome.decision, Decision::Grant);
        storage.apply(&outcome.mutations).await;

        assert_eq!(storage.movie("55").await.unwrap().views, 1);
        assert_eq!(storage.user(1).await.unwrap().watch_count, 1);
    }

    #[tokio::test]
    async fn subscription_denial_leaves_view_count_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let now = at(2026, 8, 6, 12);
        storage.ensure_user(1, None, "u", None, now).await;
        storage.add_movie(movie("55", "Дюна")).await;
        let channel = ChannelRequirement {
            kind: ChannelKind::Telegram { username: "@c".to_owned(), chat_id: -100 },
            name: "c".to_owned(),
            url: "https://t.me/c".to_owned(),
            added_at: now,
        };
        storage.add_channel(channel).await;
        let engine = AccessEngine::new(5);

        let m = storage.movie("55").await;
        let channels = storage.channels().await;
        let outcome = engine
            .evaluate(1, m.as_ref(), None, &channels, 0, Flow::Watch, &NeverMember, now)
            .await;
        match &outcome.decision {
            Decision::DenySubscription { missing } => assert_eq!(missing, &channels),
            other => panic!("unexpected decision: {other:?}"),
        }
        storage.apply(&outcome.mutations).await;
        assert_eq!(storage.movie("55").await.unwrap().views, 0);
    }

    #[tokio::test]
    async fn download_quota_exhausts_after_five_grants() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let now = at(2026, 8, 6, 12);
        storage.ensure_user(1, None, "u", None, now).await;
        storage.add_movie(movie("55", "Дюна")).await;
        let engine = AccessEngine::new(5);
        let m = storage.movie("55").await;

        for _ in 0..5 {
            let used = storage.downloads_today(1, now.date_naive()).await;
            let outcome = engine
                .evaluate(1, m.as_ref(), None, &[], used, Flow::Download, &AlwaysMember, now)
                .await;
            assert_eq!(outcome.decision, Decision::Grant);
            storage.apply(&outcome.mutations).await;
        }

        let used = storage.downloads_today(1, now.date_naive()).await;
        assert_eq!(used, 5);
        let outcome = engine
            .evaluate(1, m.as_ref(), None, &[], used, Flow::Download, &AlwaysMember, now)
            .await;
        assert_eq!(outcome.decision, Decision::DenyQuota);
    }

    #[tokio::test]
    async fn favorites_toggle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let now = at(2026, 8, 6, 9);
        storage.ensure_user(5, None, "u", None, now).await;
        assert!(storage.toggle_favorite(5, "55").await);
        assert!(!storage.toggle_favorite(5, "55").await);
        assert!(storage.toggle_watchlist(5, "55").await);
        assert!(storage.user(5).await.unwrap().watchlist.contains("55"));
    }
}
