use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode},
};
use tokio::sync::RwLock;

use crate::storage::{ChannelKind, ChannelRequirement, DownloadLink, Movie};
use crate::tg::{fmt_date, html_escape, App};
use crate::tmdb::TmdbClient;

/* ====== Диалоги админа ======
   Пошаговые сценарии (добавить фильм, канал, рассылка...) — явный
   тегированный автомат на пользователя, с отменой по /cancel и
   истечением по времени. */

const DIALOG_TTL_MINUTES: i64 = 10;
const BROADCAST_PAUSE_MS: u64 = 50;
const USERS_PER_PAGE: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum AdminState {
    AddMovieCode,
    AddMovieFile { code: String },
    AddMovieInfo { code: String, file_id: String },
    AddChannel { kind: ChannelTag },
    DeleteMovie,
    GivePremiumUser,
    GivePremiumDays { user_id: u64 },
    Broadcast,
}

#[derive(Debug, Clone)]
struct DialogEntry {
    state: AdminState,
    started_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct Dialogs {
    inner: Arc<RwLock<HashMap<u64, DialogEntry>>>,
}

impl Dialogs {
    pub async fn set(&self, user_id: u64, state: AdminState, now: DateTime<Utc>) {
        self.inner
            .write()
            .await
            .insert(user_id, DialogEntry { state, started_at: now });
    }

    /// Просроченный диалог удаляется при первом же чтении.
    pub async fn get(&self, user_id: u64, now: DateTime<Utc>) -> Option<AdminState> {
        let mut guard = self.inner.write().await;
        match guard.get(&user_id) {
            Some(entry) if entry.started_at + Duration::minutes(DIALOG_TTL_MINUTES) < now => {
                guard.remove(&user_id);
                None
            }
            Some(entry) => Some(entry.state.clone()),
            None => None,
        }
    }

    pub async fn clear(&self, user_id: u64) -> bool {
        self.inner.write().await.remove(&user_id).is_some()
    }
}

/* ====== Виды каналов ====== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTag {
    Telegram,
    Instagram,
    Youtube,
    Twitter,
    Tiktok,
}

impl ChannelTag {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(Self::Telegram),
            "instagram" => Some(Self::Instagram),
            "youtube" => Some(Self::Youtube),
            "twitter" => Some(Self::Twitter),
            "tiktok" => Some(Self::Tiktok),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Instagram => "instagram",
            Self::Youtube => "youtube",
            Self::Twitter => "twitter",
            Self::Tiktok => "tiktok",
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::Telegram => "📱 Telegram",
            Self::Instagram => "📷 Instagram",
            Self::Youtube => "📺 YouTube",
            Self::Twitter => "🐦 Twitter/X",
            Self::Tiktok => "🎵 TikTok",
        }
    }
}

/* ====== Callback-кнопки панели ====== */

pub async fn on_callback(bot: Bot, q: CallbackQuery, app: &App) -> ResponseResult<()> {
    let user_id = q.from.id.0;
    if !app.cfg.is_admin(user_id) {
        bot.answer_callback_query(q.id.clone())
            .text("❌ Нет прав администратора")
            .show_alert(true)
            .await?;
        return Ok(());
    }
    let Some(data) = q.data.clone() else { return Ok(()) };
    let Some(message) = q.message.as_ref() else { return Ok(()) };
    let chat_id = message.chat().id;
    let message_id = message.id();
    let now = Utc::now();

    match data.as_str() {
        "adm" => show_panel(&bot, chat_id, Some(message_id)).await?,
        "adm_stats" => show_stats(&bot, chat_id, message_id, app).await?,
        "adm_daily" => show_daily(&bot, chat_id, message_id, app).await?,
        "adm_movies" => show_movies(&bot, chat_id, message_id, app).await?,
        "adm_chs" => show_channels(&bot, chat_id, message_id, app).await?,
        "adm_add_movie" => {
            app.dialogs.set(user_id, AdminState::AddMovieCode, now).await;
            edit_html(
                &bot,
                chat_id,
                message_id,
                "🔢 <b>Введи код фильма:</b>\n\nНапример: 55\n\n❌ Отмена: /cancel".to_owned(),
                None,
            )
            .await?;
        }
        "adm_del_movie" => {
            app.dialogs.set(user_id, AdminState::DeleteMovie, now).await;
            edit_html(
                &bot,
                chat_id,
                message_id,
                "🗑 <b>Удаление фильма</b>\n\nВведи код фильма:\n\n❌ Отмена: /cancel".to_owned(),
                None,
            )
            .await?;
        }
        "adm_add_ch" => {
            let rows: Vec<Vec<InlineKeyboardButton>> = [
                ChannelTag::Telegram,
                ChannelTag::Instagram,
                ChannelTag::Youtube,
                ChannelTag::Twitter,
                ChannelTag::Tiktok,
            ]
            .iter()
            .map(|t| {
                vec![InlineKeyboardButton::callback(
                    t.title().to_owned(),
                    format!("adm_ch:{}", t.as_str()),
                )]
            })
            .chain(std::iter::once(vec![InlineKeyboardButton::callback(
                "🔙 Назад".to_owned(),
                "adm".to_owned(),
            )]))
            .collect();
            edit_html(
                &bot,
                chat_id,
                message_id,
                "📢 Выбери тип канала:".to_owned(),
                Some(InlineKeyboardMarkup::new(rows)),
            )
            .await?;
        }
        "adm_bc" => {
            app.dialogs.set(user_id, AdminState::Broadcast, now).await;
            edit_html(
                &bot,
                chat_id,
                message_id,
                "📣 <b>Рассылка</b>\n\nПришли сообщение, которое получат все пользователи:\n\n❌ Отмена: /cancel"
                    .to_owned(),
                None,
            )
            .await?;
        }
        "adm_prm" => {
            app.dialogs.set(user_id, AdminState::GivePremiumUser, now).await;
            edit_html(
                &bot,
                chat_id,
                message_id,
                "💎 <b>Выдача премиума</b>\n\nПришли ID пользователя:\n\n❌ Отмена: /cancel".to_owned(),
                None,
            )
            .await?;
        }
        _ => {
            if let Some(page) = data.strip_prefix("adm_users:").and_then(|p| p.parse::<usize>().ok()) {
                show_users(&bot, chat_id, message_id, app, page).await?;
            } else if let Some(tag) = data.strip_prefix("adm_ch:").and_then(ChannelTag::parse) {
                app.dialogs.set(user_id, AdminState::AddChannel { kind: tag }, now).await;
                edit_html(&bot, chat_id, message_id, channel_instructions(tag), None).await?;
            } else if let Some(idx) = data.strip_prefix("adm_rm_ch:").and_then(|p| p.parse::<usize>().ok()) {
                let removed = app.storage.remove_channel(idx).await;
                bot.answer_callback_query(q.id.clone())
                    .text(if removed { "Канал удалён" } else { "Канал не найден" })
                    .await?;
                show_channels(&bot, chat_id, message_id, app).await?;
                return Ok(());
            }
        }
    }

    bot.answer_callback_query(q.id).await?;
    Ok(())
}

fn channel_instructions(tag: ChannelTag) -> String {
    let body = match tag {
        ChannelTag::Telegram => {
            "📱 <b>Telegram-канал</b>\n\nПришли данные в четыре строки:\n\n\
             <code>Название канала\nhttps://t.me/kanal\n@kanal\n-1001234567890</code>"
        }
        _ => "Пришли данные в две строки:\n\n<code>Название страницы\nhttps://example.com</code>",
    };
    format!("{}\n\n❌ Отмена: /cancel", body)
}

/* ====== Шаги диалогов ====== */

pub async fn on_dialog_message(bot: Bot, msg: Message, app: &App, state: AdminState) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else { return Ok(()) };
    let user_id = user.id.0;
    let chat_id = msg.chat.id;
    let now = Utc::now();
    let text = msg.text().unwrap_or_default().trim().to_owned();

    // /cancel перехватывается веткой команд; остальные команды в диалоге не к месту
    if text.starts_with('/') {
        bot.send_message(chat_id, "Сейчас идёт диалог. ❌ Отмена: /cancel").await?;
        return Ok(());
    }

    match state {
        AdminState::AddMovieCode => {
            if !crate::tg::is_numeric_code(&text) {
                bot.send_message(chat_id, "❌ Код — только цифры!").await?;
                return Ok(());
            }
            if app.storage.movie(&text).await.is_some() {
                bot.send_message(chat_id, format!("❌ Фильм с кодом {text} уже есть!")).await?;
                return Ok(());
            }
            app.dialogs.set(user_id, AdminState::AddMovieFile { code: text.clone() }, now).await;
            bot.send_message(chat_id, format!("✅ Код: {text}\n\n📹 Пришли видеофайл:")).await?;
        }
        AdminState::AddMovieFile { code } => {
            let Some(video) = msg.video() else {
                bot.send_message(chat_id, "❌ Нужен видеофайл!").await?;
                return Ok(());
            };
            let file_id = video.file.id.0.clone();
            app.dialogs
                .set(user_id, AdminState::AddMovieInfo { code, file_id }, now)
                .await;
            bot.send_message(
                chat_id,
                "✅ Видео получено!\n\nТеперь пришли информацию о фильме:\n\n\
                 Название: Дюна\nГод: 2024\nЖанр: Фантастика\nЯзык: Русский\n\
                 Рейтинг: 8.5\nОписание: ...\n\
                 Ссылка: 720p https://example.com/dune-720.mp4\n\n\
                 Строк «Ссылка:» может быть несколько, они не обязательны.",
            )
            .await?;
        }
        AdminState::AddMovieInfo { code, file_id } => {
            let mut form = parse_movie_info(&text);
            let Some(title) = form.title.clone() else {
                bot.send_message(chat_id, "❌ Не хватает названия!").await?;
                return Ok(());
            };
            if let Some(tmdb) = &app.tmdb {
                enrich_from_tmdb(tmdb, &title, &mut form).await;
            }
            let movie = Movie {
                code: code.clone(),
                title: title.clone(),
                year: form.year,
                genre: form.genre,
                language: form.language,
                rating: form.rating,
                description: form.description,
                file_id: Some(file_id),
                links: form.links,
                views: 0,
                added_at: now,
            };
            if app.storage.add_movie(movie).await {
                bot.send_message(
                    chat_id,
                    format!(
                        "✅ Фильм добавлен!\n\n🔢 Код: <code>{}</code>\n🎬 {}",
                        code,
                        html_escape(&title)
                    ),
                )
                .parse_mode(ParseMode::Html)
                .await?;
            } else {
                bot.send_message(chat_id, format!("❌ Код {code} уже занят!")).await?;
            }
            app.dialogs.clear(user_id).await;
            show_panel(&bot, chat_id, None).await?;
        }
        AdminState::AddChannel { kind } => {
            match parse_channel_form(kind, &text, now) {
                Ok(channel) => {
                    app.storage.add_channel(channel).await;
                    bot.send_message(chat_id, "✅ Канал добавлен!").await?;
                    app.dialogs.clear(user_id).await;
                    show_panel(&bot, chat_id, None).await?;
                }
                Err(hint) => {
                    bot.send_message(chat_id, format!("❌ {hint}")).await?;
                }
            }
        }
        AdminState::DeleteMovie => {
            if app.storage.delete_movie(&text).await {
                bot.send_message(chat_id, format!("✅ Фильм {text} удалён.")).await?;
            } else {
                bot.send_message(chat_id, format!("❌ Фильм с кодом {text} не найден.")).await?;
            }
            app.dialogs.clear(user_id).await;
            show_panel(&bot, chat_id, None).await?;
        }
        AdminState::GivePremiumUser => {
            let Ok(target) = text.parse::<u64>() else {
                bot.send_message(chat_id, "❌ ID — это число. Попробуй ещё раз.").await?;
                return Ok(());
            };
            app.dialogs.set(user_id, AdminState::GivePremiumDays { user_id: target }, now).await;
            bot.send_message(chat_id, "📅 На сколько дней? Например: 30").await?;
        }
        AdminState::GivePremiumDays { user_id: target } => {
            let days = match text.parse::<i64>() {
                Ok(d) if (1..=3650).contains(&d) => d,
                _ => {
                    bot.send_message(chat_id, "❌ Число дней от 1 до 3650.").await?;
                    return Ok(());
                }
            };
            let record = app.storage.grant_premium(target, days, now).await;
            bot.send_message(
                chat_id,
                format!("✅ Премиум выдан до {}.", fmt_date(record.expires_at)),
            )
            .await?;
            // пользователя уведомляем по возможности
            if let Err(err) = bot
                .send_message(
                    ChatId(target as i64),
                    format!("💎 Тебе выдали премиум до {}!", fmt_date(record.expires_at)),
                )
                .await
            {
                tracing::warn!(user = target, error = %err, "failed to notify premium grant");
            }
            app.dialogs.clear(user_id).await;
            show_panel(&bot, chat_id, None).await?;
        }
        AdminState::Broadcast => {
            bot.send_message(chat_id, "📤 Рассылка пошла...").await?;
            let ids = app.storage.all_user_ids().await;
            let mut sent = 0u32;
            let mut failed = 0u32;
            for uid in ids {
                match bot.copy_message(ChatId(uid as i64), chat_id, msg.id).await {
                    Ok(_) => sent += 1,
                    Err(err) => {
                        failed += 1;
                        tracing::debug!(user = uid, error = %err, "broadcast delivery failed");
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(BROADCAST_PAUSE_MS)).await;
            }
            bot.send_message(
                chat_id,
                format!("✅ Рассылка закончена!\n\n├ ✅ Доставлено: {sent}\n└ ❌ Ошибок: {failed}"),
            )
            .await?;
            app.dialogs.clear(user_id).await;
            show_panel(&bot, chat_id, None).await?;
        }
    }
    Ok(())
}

fn parse_channel_form(
    kind: ChannelTag,
    text: &str,
    now: DateTime<Utc>,
) -> Result<ChannelRequirement, &'static str> {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    match kind {
        ChannelTag::Telegram => {
            if lines.len() < 4 {
                return Err("Нужно четыре строки: название, ссылка, @username, ID канала.");
            }
            let chat_id = lines[3]
                .parse::<i64>()
                .map_err(|_| "ID канала — это число вида -1001234567890.")?;
            Ok(ChannelRequirement {
                kind: ChannelKind::Telegram { username: lines[2].to_owned(), chat_id },
                name: lines[0].to_owned(),
                url: lines[1].to_owned(),
                added_at: now,
            })
        }
        other => {
            if lines.len() < 2 {
                return Err("Нужно две строки: название и ссылка.");
            }
            let kind = match other {
                ChannelTag::Instagram => ChannelKind::Instagram,
                ChannelTag::Youtube => ChannelKind::Youtube,
                ChannelTag::Twitter => ChannelKind::Twitter,
                ChannelTag::Tiktok => ChannelKind::Tiktok,
                ChannelTag::Telegram => unreachable!(),
            };
            Ok(ChannelRequirement {
                kind,
                name: lines[0].to_owned(),
                url: lines[1].to_owned(),
                added_at: now,
            })
        }
    }
}

/// Пропущенные админом поля добираем из TMDb; недоступность API просто
/// оставляет карточку как есть.
async fn enrich_from_tmdb(tmdb: &TmdbClient, title: &str, form: &mut MovieForm) {
    if form.description.is_some() && form.rating.is_some() && form.year.is_some() {
        return;
    }
    let hit = match tmdb.search_movies(title, 1).await {
        Ok(found) => match found.into_iter().next() {
            Some(hit) => hit,
            None => return,
        },
        Err(err) => {
            tracing::warn!(title, error = %err, "tmdb lookup failed");
            return;
        }
    };
    let details = match tmdb.movie_details(hit.id).await {
        Ok(Some(details)) => details,
        _ => hit,
    };
    if form.year.is_none() {
        form.year = details.year().map(str::to_owned);
    }
    if form.rating.is_none() {
        form.rating = details.vote_average.map(|v| format!("{v:.1}"));
    }
    if form.description.is_none() && !details.overview.trim().is_empty() {
        form.description = Some(details.overview.clone());
    }
}

/* ====== Разбор карточки фильма ====== */

#[derive(Debug, Default, PartialEq)]
pub struct MovieForm {
    pub title: Option<String>,
    pub year: Option<String>,
    pub genre: Option<String>,
    pub language: Option<String>,
    pub rating: Option<String>,
    pub description: Option<String>,
    pub links: Vec<DownloadLink>,
}

pub fn parse_movie_info(text: &str) -> MovieForm {
    let mut form = MovieForm::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_lowercase().as_str() {
            "название" | "имя" | "title" => form.title = Some(value.to_owned()),
            "год" | "year" => form.year = Some(value.to_owned()),
            "жанр" | "genre" => form.genre = Some(value.to_owned()),
            "язык" | "language" => form.language = Some(value.to_owned()),
            "рейтинг" | "rating" => form.rating = Some(value.to_owned()),
            "описание" | "description" => form.description = Some(value.to_owned()),
            "ссылка" | "link" => form.links.push(parse_link(value)),
            _ => {}
        }
    }
    form
}

// «720p https://...» либо просто URL; подпись по умолчанию — «Скачать»
fn parse_link(value: &str) -> DownloadLink {
    match value.rsplit_once(' ') {
        Some((label, url)) if url.starts_with("http") && !label.trim().is_empty() => DownloadLink {
            label: label.trim().to_owned(),
            url: url.to_owned(),
        },
        _ => DownloadLink { label: "Скачать".to_owned(), url: value.to_owned() },
    }
}

/* ====== Экраны панели ====== */

pub async fn show_panel(bot: &Bot, chat_id: ChatId, message_id: Option<MessageId>) -> ResponseResult<()> {
    let rows = vec![
        vec![
            InlineKeyboardButton::callback("➕ Добавить фильм", "adm_add_movie"),
            InlineKeyboardButton::callback("🗑 Удалить фильм", "adm_del_movie"),
        ],
        vec![
            InlineKeyboardButton::callback("📢 Добавить канал", "adm_add_ch"),
            InlineKeyboardButton::callback("📋 Каналы", "adm_chs"),
        ],
        vec![
            InlineKeyboardButton::callback("📊 Статистика", "adm_stats"),
            InlineKeyboardButton::callback("🎬 Фильмы", "adm_movies"),
        ],
        vec![
            InlineKeyboardButton::callback("📣 Рассылка", "adm_bc"),
            InlineKeyboardButton::callback("💎 Выдать премиум", "adm_prm"),
        ],
        vec![
            InlineKeyboardButton::callback("📈 Аналитика", "adm_daily"),
            InlineKeyboardButton::callback("👥 Пользователи", "adm_users:0"),
        ],
    ];
    let kb = InlineKeyboardMarkup::new(rows);
    let text = "⚙️ <b>АДМИН-ПАНЕЛЬ</b>\n\nВыбери раздел:";
    match message_id {
        Some(id) => {
            bot.edit_message_text(chat_id, id, text)
                .parse_mode(ParseMode::Html)
                .reply_markup(kb)
                .await?;
        }
        None => {
            bot.send_message(chat_id, text)
                .parse_mode(ParseMode::Html)
                .reply_markup(kb)
                .await?;
        }
    }
    Ok(())
}

async fn show_stats(bot: &Bot, chat_id: ChatId, message_id: MessageId, app: &App) -> ResponseResult<()> {
    let s = app.storage.stats_summary(Utc::now()).await;
    let top = if s.top.is_empty() {
        "пока пусто".to_owned()
    } else {
        s.top
            .iter()
            .enumerate()
            .map(|(i, (code, title, views))| {
                format!("{}. {} (<code>{}</code>) — {} 👁", i + 1, html_escape(title), code, views)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let text = format!(
        "📊 <b>СТАТИСТИКА БОТА</b>\n\n\
         📈 <b>Всего:</b>\n\
         ├ 👥 Пользователей: {}\n\
         ├ 🎬 Фильмов: {}\n\
         ├ 👁 Просмотров: {}\n\
         ├ 🔍 Поисков: {}\n\
         └ 📢 Каналов: {}\n\n\
         📅 <b>Сегодня:</b>\n\
         ├ 👁 Просмотров: {}\n\
         ├ 🔍 Поисков: {}\n\
         └ 👤 Новых пользователей: {}\n\n\
         🔥 <b>Популярные фильмы:</b>\n{}\n\n\
         👤 Активных за 7 дней: {}",
        s.users,
        s.movies,
        s.total_views,
        s.total_searches,
        s.channels,
        s.today.views,
        s.today.searches,
        s.today.new_users,
        top,
        s.active_week,
    );
    edit_html(bot, chat_id, message_id, text, Some(kb_back())).await
}

async fn show_daily(bot: &Bot, chat_id: ChatId, message_id: MessageId, app: &App) -> ResponseResult<()> {
    let days = app.storage.daily_stats(7, Utc::now()).await;
    let mut text = String::from("📈 <b>СТАТИСТИКА ЗА 7 ДНЕЙ</b>\n\n");
    for (day, stats) in days {
        text.push_str(&format!(
            "📅 <b>{}</b>\n├ 👁 Просмотров: {}\n├ 🔍 Поисков: {}\n└ 👤 Новых: {}\n\n",
            day.format("%d.%m"),
            stats.views,
            stats.searches,
            stats.new_users,
        ));
    }
    edit_html(bot, chat_id, message_id, text, Some(kb_back())).await
}

async fn show_users(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    app: &App,
    page: usize,
) -> ResponseResult<()> {
    let now = Utc::now();
    let (users, total) = app.storage.users_page(page, USERS_PER_PAGE).await;
    let mut text = format!("👥 <b>ПОЛЬЗОВАТЕЛИ</b> (всего {total})\n\n");
    for u in &users {
        let premium = app
            .storage
            .premium(u.id)
            .await
            .map(|p| p.is_active_at(now))
            .unwrap_or(false);
        let badge = if premium { "💎 " } else { "" };
        text.push_str(&format!(
            "{}<b>{}</b> (@{})\n├ ID: <code>{}</code>\n├ Просмотров: {}\n└ С нами с: {}\n\n",
            badge,
            html_escape(&u.first_name),
            u.username.as_deref().unwrap_or("—"),
            u.id,
            u.watch_count,
            fmt_date(u.joined_at),
        ));
    }
    let mut nav = Vec::new();
    if page > 0 {
        nav.push(InlineKeyboardButton::callback("⬅️ Назад", format!("adm_users:{}", page - 1)));
    }
    if (page + 1) * USERS_PER_PAGE < total {
        nav.push(InlineKeyboardButton::callback("Дальше ➡️", format!("adm_users:{}", page + 1)));
    }
    let mut rows = Vec::new();
    if !nav.is_empty() {
        rows.push(nav);
    }
    rows.push(vec![InlineKeyboardButton::callback("🔙 Назад", "adm")]);
    edit_html(bot, chat_id, message_id, text, Some(InlineKeyboardMarkup::new(rows))).await
}

async fn show_movies(bot: &Bot, chat_id: ChatId, message_id: MessageId, app: &App) -> ResponseResult<()> {
    let movies = app.storage.movies_sorted().await;
    let mut text = format!("🎬 <b>ФИЛЬМЫ</b> ({})\n\n", movies.len());
    for m in movies.iter().take(30) {
        text.push_str(&format!(
            "<code>{}</code> — {} — {} 👁\n",
            m.code,
            html_escape(&m.title),
            m.views
        ));
    }
    if movies.len() > 30 {
        text.push_str(&format!("\n…и ещё {}", movies.len() - 30));
    }
    edit_html(bot, chat_id, message_id, text, Some(kb_back())).await
}

async fn show_channels(bot: &Bot, chat_id: ChatId, message_id: MessageId, app: &App) -> ResponseResult<()> {
    let channels = app.storage.channels().await;
    if channels.is_empty() {
        return edit_html(
            bot,
            chat_id,
            message_id,
            "📢 Обязательных каналов нет — подписка не требуется.".to_owned(),
            Some(kb_back()),
        )
        .await;
    }
    let mut text = String::from("📢 <b>КАНАЛЫ</b>\n\n");
    let mut rows = Vec::new();
    for (i, ch) in channels.iter().enumerate() {
        text.push_str(&format!(
            "{}. {} {} — {}\n",
            i + 1,
            ch.kind.icon(),
            html_escape(&ch.name),
            html_escape(&ch.url)
        ));
        rows.push(vec![InlineKeyboardButton::callback(
            format!("🗑 {}", ch.name),
            format!("adm_rm_ch:{i}"),
        )]);
    }
    rows.push(vec![InlineKeyboardButton::callback("🔙 Назад", "adm")]);
    edit_html(bot, chat_id, message_id, text, Some(InlineKeyboardMarkup::new(rows))).await
}

fn kb_back() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback("🔙 Назад", "adm")]])
}

async fn edit_html(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    text: String,
    kb: Option<InlineKeyboardMarkup>,
) -> ResponseResult<()> {
    let req = bot
        .edit_message_text(chat_id, message_id, text)
        .parse_mode(ParseMode::Html);
    match kb {
        Some(kb) => req.reply_markup(kb).await?,
        None => req.await?,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap()
    }

    #[test]
    fn movie_info_parses_russian_keys() {
        let form = parse_movie_info(
            "Название: Дюна\nГод: 2024\nЖанр: Фантастика\nЯзык: Русский\nРейтинг: 8.5\nОписание: Пески Арракиса: начало",
        );
        assert_eq!(form.title.as_deref(), Some("Дюна"));
        assert_eq!(form.year.as_deref(), Some("2024"));
        assert_eq!(form.rating.as_deref(), Some("8.5"));
        // двоеточие внутри значения не ломает разбор
        assert_eq!(form.description.as_deref(), Some("Пески Арракиса: начало"));
    }

    #[test]
    fn movie_info_collects_links() {
        let form = parse_movie_info(
            "Название: Дюна\nСсылка: 720p https://example.com/d-720.mp4\nСсылка: https://example.com/d.mp4",
        );
        assert_eq!(
            form.links,
            vec![
                DownloadLink { label: "720p".to_owned(), url: "https://example.com/d-720.mp4".to_owned() },
                DownloadLink { label: "Скачать".to_owned(), url: "https://example.com/d.mp4".to_owned() },
            ]
        );
    }

    #[test]
    fn movie_info_without_title_is_incomplete() {
        let form = parse_movie_info("Год: 2024");
        assert!(form.title.is_none());
    }

    #[test]
    fn telegram_channel_form_requires_four_lines() {
        assert!(parse_channel_form(ChannelTag::Telegram, "Имя\nhttps://t.me/x", now()).is_err());
        let ch = parse_channel_form(
            ChannelTag::Telegram,
            "Кино-новинки\nhttps://t.me/kinonovinki\n@kinonovinki\n-1001234567890",
            now(),
        )
        .unwrap();
        assert_eq!(ch.name, "Кино-новинки");
        assert_eq!(
            ch.kind,
            ChannelKind::Telegram { username: "@kinonovinki".to_owned(), chat_id: -1001234567890 }
        );
    }

    #[test]
    fn social_channel_form_needs_two_lines() {
        assert!(parse_channel_form(ChannelTag::Youtube, "Только имя", now()).is_err());
        let ch = parse_channel_form(ChannelTag::Youtube, "Канал\nhttps://youtube.com/@x", now()).unwrap();
        assert_eq!(ch.kind, ChannelKind::Youtube);
    }

    #[tokio::test]
    async fn dialog_expires_lazily() {
        let dialogs = Dialogs::default();
        dialogs.set(1, AdminState::AddMovieCode, now()).await;
        assert_eq!(dialogs.get(1, now()).await, Some(AdminState::AddMovieCode));
        let later = now() + Duration::minutes(DIALOG_TTL_MINUTES + 1);
        assert_eq!(dialogs.get(1, later).await, None);
        // повторное чтение тоже пусто — запись удалена
        assert_eq!(dialogs.get(1, now()).await, None);
    }

    #[tokio::test]
    async fn cancel_clears_dialog() {
        let dialogs = Dialogs::default();
        dialogs.set(2, AdminState::Broadcast, now()).await;
        assert!(dialogs.clear(2).await);
        assert!(!dialogs.clear(2).await);
    }
}
