use crate::access::{AccessEngine, Decision, Flow, MembershipProbe};
use crate::admin::{self, Dialogs};
use crate::config::Config;
use crate::storage::{ChannelKind, ChannelRequirement, Movie, PremiumRecord, Storage};
use crate::tmdb::TmdbClient;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    prelude::*,
    types::{
        CallbackQuery, ChatId, ChatMemberStatus, FileId, InlineKeyboardButton,
        InlineKeyboardMarkup, InputFile, MessageId, ParseMode, UserId,
    },
    utils::command::BotCommands,
};

static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

// вероятность рекламной вставки для не-премиума
const AD_PROBABILITY: f64 = 0.3;

const PLANS: &[(&str, &str, i64, &str)] = &[
    ("1m", "1 месяц", 30, "10 000 ₽"),
    ("3m", "3 месяца", 90, "25 000 ₽"),
    ("1y", "1 год", 365, "80 000 ₽"),
];

/* ====== Общие зависимости обработчиков ====== */

#[derive(Clone)]
pub struct App {
    pub cfg: Arc<Config>,
    pub storage: Storage,
    pub engine: AccessEngine,
    pub tmdb: Option<TmdbClient>,
    pub dialogs: Dialogs,
}

/* ====== Команды ====== */

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Команды:")]
enum Command {
    #[command(description = "запустить бота")]
    Start,
    #[command(description = "личная статистика")]
    Stats,
    #[command(description = "премиум-подписка")]
    Premium,
    #[command(description = "помощь")]
    Help,
    #[command(description = "отменить текущее действие")]
    Cancel,
}

pub async fn run(bot: Bot, app: App) {
    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint({
                            let app = app.clone();
                            move |bot: Bot, msg: Message, cmd: Command| {
                                let app = app.clone();
                                async move { on_command(bot, msg, cmd, &app).await }
                            }
                        })
                )
                .branch({
                    let app = app.clone();
                    dptree::endpoint(move |bot: Bot, msg: Message| {
                        let app = app.clone();
                        async move { on_message(bot, msg, &app).await }
                    })
                })
        )
        .branch(
            Update::filter_callback_query().endpoint({
                let app = app.clone();
                move |bot: Bot, q: CallbackQuery| {
                    let app = app.clone();
                    async move { on_callback(bot, q, &app).await }
                }
            })
        );

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

/* ====== Проверка членства через Telegram ====== */

pub struct BotProbe<'a> {
    pub bot: &'a Bot,
}

impl MembershipProbe for BotProbe<'_> {
    async fn is_member(&self, channel: &ChannelRequirement, user_id: u64) -> anyhow::Result<bool> {
        // проверяемы только telegram-каналы; остальные — просто ссылки
        let ChannelKind::Telegram { chat_id, .. } = &channel.kind else {
            return Ok(true);
        };
        let member = self.bot.get_chat_member(ChatId(*chat_id), UserId(user_id)).await?;
        Ok(!matches!(member.status(), ChatMemberStatus::Left | ChatMemberStatus::Banned))
    }
}

/* ====== Команды ====== */

async fn on_command(bot: Bot, msg: Message, cmd: Command, app: &App) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else { return Ok(()) };
    let user_id = user.id.0;
    let chat_id = msg.chat.id;
    let now = Utc::now();
    app.storage
        .ensure_user(user_id, user.username.as_deref(), &user.first_name, user.last_name.as_deref(), now)
        .await;

    match cmd {
        Command::Start => send_welcome(&bot, chat_id, &user, app).await?,
        Command::Help => {
            let text = format!(
                "❓ <b>ПОМОЩЬ</b>\n\n\
                 1️⃣ Пришли код фильма (например: <code>55</code>)\n\
                 2️⃣ Подпишись на обязательные каналы\n\
                 3️⃣ Смотри или скачивай!\n\n\
                 Ещё я ищу по названию — просто напиши его.\n\n{}",
                html_escape(&Command::descriptions().to_string())
            );
            bot.send_message(chat_id, text).parse_mode(ParseMode::Html).await?;
        }
        Command::Stats => send_personal_stats(&bot, chat_id, user_id, app).await?,
        Command::Premium => show_plans(&bot, chat_id).await?,
        Command::Cancel => {
            if app.dialogs.clear(user_id).await {
                bot.send_message(chat_id, "❌ Действие отменено.").await?;
                if app.cfg.is_admin(user_id) {
                    admin::show_panel(&bot, chat_id, None).await?;
                }
            } else {
                bot.send_message(chat_id, "Нечего отменять.").await?;
            }
        }
    }
    Ok(())
}

async fn send_welcome(
    bot: &Bot,
    chat_id: ChatId,
    user: &teloxide::types::User,
    app: &App,
) -> ResponseResult<()> {
    let now = Utc::now();
    let is_premium = app
        .storage
        .premium(user.id.0)
        .await
        .is_some_and(|p| p.is_active_at(now));
    let badge = if is_premium { "💎 " } else { "" };
    let users = app.storage.users_count().await;
    let movies = app.storage.movies_count().await;
    let channels = app.storage.channels().await.len();

    let text = format!(
        "{badge}👋 Привет, <b>{}</b>!\n\n\
         🎬 Это кинобот: пришли код фильма — получишь видео.\n\
         Например: <code>55</code>\n\n\
         Можно искать и по названию — просто напиши его.\n\n\
         📊 <b>Сейчас в боте:</b>\n\
         ├ 👥 Пользователей: {users}\n\
         ├ 🎬 Фильмов: {movies}\n\
         └ 📢 Каналов: {channels}",
        html_escape(&user.first_name)
    );

    let mut rows = vec![vec![InlineKeyboardButton::callback("⭐ Топ фильмов", "top")]];
    rows.push(vec![if is_premium {
        InlineKeyboardButton::callback("💎 Мой премиум", "prm_st")
    } else {
        InlineKeyboardButton::callback("💎 Премиум", "prm")
    }]);
    if app.cfg.is_admin(user.id.0) {
        rows.push(vec![InlineKeyboardButton::callback("⚙️ Админ-панель", "adm")]);
    }
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(InlineKeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

async fn send_personal_stats(bot: &Bot, chat_id: ChatId, user_id: u64, app: &App) -> ResponseResult<()> {
    let Some(profile) = app.storage.user(user_id).await else {
        bot.send_message(chat_id, "❌ Статистика не найдена.").await?;
        return Ok(());
    };
    let now = Utc::now();
    let premium_line = match app.storage.premium(user_id).await {
        Some(p) if p.is_active_at(now) => format!("\n💎 Премиум: до {}", fmt_date(p.expires_at)),
        _ => String::new(),
    };
    let text = format!(
        "📊 <b>ТВОЯ СТАТИСТИКА</b>\n\n\
         👁 Просмотров: {}\n\
         🔍 Поисков: {}\n\
         ⭐ В избранном: {}\n\
         📋 Посмотреть позже: {}\n\
         📅 С нами с: {}\n\
         ⏰ Последняя активность: {}{}",
        profile.watch_count,
        profile.search_count,
        profile.favorites.len(),
        profile.watchlist.len(),
        fmt_date(profile.joined_at),
        fmt_date(profile.last_active_at),
        premium_line,
    );
    bot.send_message(chat_id, text).parse_mode(ParseMode::Html).await?;
    Ok(())
}

/* ====== Сообщения: код или поиск ====== */

async fn on_message(bot: Bot, msg: Message, app: &App) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else { return Ok(()) };
    let user_id = user.id.0;
    let now = Utc::now();
    app.storage
        .ensure_user(user_id, user.username.as_deref(), &user.first_name, user.last_name.as_deref(), now)
        .await;

    // активный диалог админа перехватывает любые сообщения
    if app.cfg.is_admin(user_id) {
        if let Some(state) = app.dialogs.get(user_id, now).await {
            return admin::on_dialog_message(bot, msg, app, state).await;
        }
    }

    let Some(text) = message_text_any(&msg) else { return Ok(()) };
    let text = text.trim().to_owned();
    if text.is_empty() {
        return Ok(());
    }

    if is_numeric_code(&text) {
        deliver_watch(&bot, msg.chat.id, user_id, &text, app).await
    } else {
        on_search_text(&bot, msg.chat.id, user_id, &text, app).await
    }
}

/// Поток «смотреть»: квота не действует, только подписка/премиум.
async fn deliver_watch(bot: &Bot, chat_id: ChatId, user_id: u64, code: &str, app: &App) -> ResponseResult<()> {
    let now = Utc::now();
    let movie = app.storage.movie(code).await;
    let premium = app.storage.premium(user_id).await;
    let channels = app.storage.channels().await;
    let downloads = app.storage.downloads_today(user_id, now.date_naive()).await;
    let probe = BotProbe { bot };
    let outcome = app
        .engine
        .evaluate(user_id, movie.as_ref(), premium.as_ref(), &channels, downloads, Flow::Watch, &probe, now)
        .await;

    // на отказах приезжает максимум коррекция истёкшего премиума
    if outcome.decision != Decision::Grant {
        app.storage.apply(&outcome.mutations).await;
    }

    match outcome.decision {
        Decision::DenyNotFound => {
            bot.send_message(
                chat_id,
                format!(
                    "❌ Фильм с кодом <code>{}</code> не найден.\n\nПроверь код и попробуй ещё раз.",
                    html_escape(code)
                ),
            )
            .parse_mode(ParseMode::Html)
            .await?;
        }
        Decision::DenySubscription { missing } => {
            send_subscription_required(bot, chat_id, &missing, None).await?;
        }
        Decision::DenyQuota => {
            send_quota_exceeded(bot, chat_id, code, app.engine.daily_limit()).await?;
        }
        Decision::Grant => {
            let Some(m) = movie else { return Ok(()) };
            let is_premium = premium.as_ref().is_some_and(|p| p.is_active_at(now));
            if !is_premium && rand::random::<f64>() < AD_PROBABILITY {
                bot.send_message(
                    chat_id,
                    "📢 <b>Реклама</b>\n\n💎 С премиумом — без рекламы и лимитов!\n/premium — подробности",
                )
                .parse_mode(ParseMode::Html)
                .await?;
            }
            let caption = movie_caption(&m, is_premium);
            let sent = match &m.file_id {
                Some(file_id) => bot
                    .send_video(chat_id, InputFile::file_id(FileId(file_id.clone())))
                    .caption(caption)
                    .parse_mode(ParseMode::Html)
                    .supports_streaming(true)
                    .reply_markup(movie_keyboard(&m))
                    .await
                    .map(|_| ()),
                None => bot
                    .send_message(chat_id, caption)
                    .parse_mode(ParseMode::Html)
                    .reply_markup(movie_keyboard(&m))
                    .await
                    .map(|_| ()),
            };
            match sent {
                // счётчики двигаем после успешной доставки
                Ok(()) => app.storage.apply(&outcome.mutations).await,
                Err(err) => {
                    tracing::error!(code, user = user_id, error = %err, "failed to deliver video");
                    bot.send_message(chat_id, "❌ Не получилось отправить фильм. Попробуй ещё раз.")
                        .await?;
                }
            }
        }
    }
    Ok(())
}

/// Поток «скачать»: пишется в журнал и ограничен дневной квотой.
async fn deliver_download(bot: &Bot, chat_id: ChatId, user_id: u64, code: &str, app: &App) -> ResponseResult<()> {
    let now = Utc::now();
    let movie = app.storage.movie(code).await;
    let premium = app.storage.premium(user_id).await;
    let channels = app.storage.channels().await;
    let downloads = app.storage.downloads_today(user_id, now.date_naive()).await;
    let probe = BotProbe { bot };
    let outcome = app
        .engine
        .evaluate(user_id, movie.as_ref(), premium.as_ref(), &channels, downloads, Flow::Download, &probe, now)
        .await;

    if outcome.decision != Decision::Grant {
        app.storage.apply(&outcome.mutations).await;
    }

    match outcome.decision {
        Decision::DenyNotFound => {
            bot.send_message(chat_id, "❌ Этот фильм уже удалён из каталога.").await?;
        }
        Decision::DenySubscription { missing } => {
            send_subscription_required(bot, chat_id, &missing, None).await?;
        }
        Decision::DenyQuota => {
            send_quota_exceeded(bot, chat_id, code, app.engine.daily_limit()).await?;
        }
        Decision::Grant => {
            let Some(m) = movie else { return Ok(()) };
            if m.links.is_empty() {
                bot.send_message(chat_id, "ℹ️ Для этого фильма пока нет ссылок на скачивание.")
                    .await?;
                return Ok(());
            }
            let mut text = format!("⬇️ <b>{}</b>\n\n", html_escape(&m.title));
            for (i, link) in m.links.iter().enumerate() {
                text.push_str(&format!(
                    "{}. <a href=\"{}\">{}</a>\n",
                    i + 1,
                    html_escape(&link.url),
                    html_escape(&link.label)
                ));
            }
            let is_premium = premium.as_ref().is_some_and(|p| p.is_active_at(now));
            if !is_premium {
                text.push_str(&format!(
                    "\nСегодня скачиваний: {}/{}",
                    downloads + 1,
                    app.engine.daily_limit()
                ));
            }
            match bot.send_message(chat_id, text).parse_mode(ParseMode::Html).await {
                Ok(_) => app.storage.apply(&outcome.mutations).await,
                Err(err) => {
                    tracing::error!(code, user = user_id, error = %err, "failed to deliver links");
                    bot.send_message(chat_id, "❌ Не получилось отправить ссылки. Попробуй ещё раз.")
                        .await?;
                }
            }
        }
    }
    Ok(())
}

async fn on_search_text(bot: &Bot, chat_id: ChatId, user_id: u64, query: &str, app: &App) -> ResponseResult<()> {
    let now = Utc::now();
    let results = app.storage.search_local(query, 10).await;
    app.storage.record_search(user_id, now).await;

    if !results.is_empty() {
        let mut blocks = Vec::new();
        for m in &results {
            blocks.push(search_line(m));
        }
        let kb = keyboard_search_results(&results);
        bot.send_message(chat_id, blocks.join("\n"))
            .parse_mode(ParseMode::Html)
            .reply_markup(kb)
            .await?;
        return Ok(());
    }

    // локально пусто — спросим TMDb, просто чтобы подсказать название
    if let Some(tmdb) = &app.tmdb {
        match tmdb.search_movies(query, 5).await {
            Ok(suggestions) if !suggestions.is_empty() => {
                let mut text = String::from("😕 В каталоге такого нет. Возможно, ты искал:\n\n");
                for s in &suggestions {
                    match s.year() {
                        Some(y) => text.push_str(&format!("• <b>{}</b> ({y})\n", html_escape(&s.title))),
                        None => text.push_str(&format!("• <b>{}</b>\n", html_escape(&s.title))),
                    }
                }
                text.push_str("\nПопроси администратора добавить фильм.");
                bot.send_message(chat_id, text).parse_mode(ParseMode::Html).await?;
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => {
                // поиск метаданных не критичен: пустой результат вместо ошибки
                tracing::warn!(query, error = %err, "tmdb search failed");
            }
        }
    }
    bot.send_message(chat_id, "Ничего не нашёл 😕").await?;
    Ok(())
}

/* ====== Callback-кнопки ======
   chk        — перепроверить подписку
   get:<код>  — выдать фильм из результатов поиска
   dl:<код>   — ссылки на скачивание (квота)
   fav:/wl:   — избранное и «посмотреть позже»
   prm*       — премиум
   adm*       — админ-панель (см. admin.rs) */

async fn on_callback(bot: Bot, q: CallbackQuery, app: &App) -> ResponseResult<()> {
    let Some(data) = q.data.clone() else { return Ok(()) };
    if data == "adm" || data.starts_with("adm_") {
        return admin::on_callback(bot, q, app).await;
    }

    let user_id = q.from.id.0;
    let now = Utc::now();
    app.storage
        .ensure_user(user_id, q.from.username.as_deref(), &q.from.first_name, q.from.last_name.as_deref(), now)
        .await;
    let chat_id = q
        .message
        .as_ref()
        .map(|m| m.chat().id)
        .unwrap_or(ChatId(user_id as i64));

    match data.as_str() {
        "chk" => {
            let missing = missing_channels(&bot, &app.storage, user_id).await;
            let message_id = q.message.as_ref().map(|m| m.id());
            if missing.is_empty() {
                let text = "✅ <b>Подписка подтверждена!</b>\n\nПришли код фильма. Например: <code>55</code>";
                match message_id {
                    Some(id) => {
                        bot.edit_message_text(chat_id, id, text).parse_mode(ParseMode::Html).await?;
                    }
                    None => {
                        bot.send_message(chat_id, text).parse_mode(ParseMode::Html).await?;
                    }
                }
                answer_cb(&bot, &q, "").await?;
            } else {
                bot.answer_callback_query(q.id.clone())
                    .text("❌ Ты подписался ещё не на все каналы!")
                    .show_alert(true)
                    .await?;
                send_subscription_required(&bot, chat_id, &missing, message_id).await?;
            }
        }
        "top" => {
            let top = app.storage.top_movies(5).await;
            if top.is_empty() {
                answer_cb(&bot, &q, "Каталог пока пуст").await?;
            } else {
                let mut text = String::from("⭐ <b>ТОП ФИЛЬМОВ</b>\n\n");
                for (i, m) in top.iter().enumerate() {
                    text.push_str(&format!(
                        "{}. {} — {} 👁 — код <code>{}</code>\n",
                        i + 1,
                        html_escape(&m.title),
                        m.views,
                        m.code
                    ));
                }
                bot.send_message(chat_id, text).parse_mode(ParseMode::Html).await?;
                answer_cb(&bot, &q, "").await?;
            }
        }
        "prm" => {
            show_plans(&bot, chat_id).await?;
            answer_cb(&bot, &q, "").await?;
        }
        "prm_st" => {
            let text = premium_status_text(app.storage.premium(user_id).await.as_ref(), now);
            bot.send_message(chat_id, text).parse_mode(ParseMode::Html).await?;
            answer_cb(&bot, &q, "").await?;
        }
        _ => {
            if let Some(code) = data.strip_prefix("get:") {
                answer_cb(&bot, &q, "").await?;
                deliver_watch(&bot, chat_id, user_id, code, app).await?;
            } else if let Some(code) = data.strip_prefix("dl:") {
                answer_cb(&bot, &q, "").await?;
                deliver_download(&bot, chat_id, user_id, code, app).await?;
            } else if let Some(code) = data.strip_prefix("fav:") {
                let added = app.storage.toggle_favorite(user_id, code).await;
                answer_cb(&bot, &q, if added { "⭐ В избранном" } else { "Убрано из избранного" }).await?;
            } else if let Some(code) = data.strip_prefix("wl:") {
                let added = app.storage.toggle_watchlist(user_id, code).await;
                answer_cb(&bot, &q, if added { "📋 Отложено на потом" } else { "Убрано из списка" }).await?;
            } else if data.strip_prefix("prm_buy:").is_some() {
                // платёжный контур ещё не подключён
                bot.answer_callback_query(q.id.clone())
                    .text("Оплата пока в разработке. Напиши администратору.")
                    .show_alert(true)
                    .await?;
            } else {
                answer_cb(&bot, &q, "Неизвестная команда").await?;
            }
        }
    }
    Ok(())
}

/// Живая перепроверка подписки: статус никогда не кешируется между запросами.
async fn missing_channels(bot: &Bot, storage: &Storage, user_id: u64) -> Vec<ChannelRequirement> {
    let probe = BotProbe { bot };
    let mut missing = Vec::new();
    for channel in storage.channels().await {
        match probe.is_member(&channel, user_id).await {
            Ok(true) => {}
            Ok(false) => missing.push(channel),
            Err(err) => {
                tracing::warn!(channel = %channel.name, error = %err, "membership check unavailable");
            }
        }
    }
    missing
}

/* ====== Сообщения про подписку и квоту ====== */

async fn send_subscription_required(
    bot: &Bot,
    chat_id: ChatId,
    missing: &[ChannelRequirement],
    edit: Option<MessageId>,
) -> ResponseResult<()> {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
    for ch in missing {
        match reqwest::Url::parse(&ch.url) {
            Ok(url) => rows.push(vec![InlineKeyboardButton::url(
                format!("{} {}", ch.kind.icon(), ch.name),
                url,
            )]),
            Err(err) => {
                tracing::warn!(channel = %ch.name, error = %err, "channel url is not valid");
            }
        }
    }
    rows.push(vec![InlineKeyboardButton::callback("✅ Проверить подписку", "chk")]);
    let kb = InlineKeyboardMarkup::new(rows);
    let text = "⚠️ <b>ВНИМАНИЕ!</b>\n\n\
                Чтобы смотреть фильмы, подпишись на каналы ниже 👇\n\n\
                После подписки нажми «✅ Проверить подписку».";
    match edit {
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

async fn send_quota_exceeded(bot: &Bot, chat_id: ChatId, code: &str, limit: u32) -> ResponseResult<()> {
    let kb = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "🔁 Попробовать завтра",
        format!("dl:{code}"),
    )]]);
    bot.send_message(
        chat_id,
        format!(
            "⏳ Лимит скачиваний исчерпан: {limit} в сутки.\n\n\
             Квота обнулится в полночь — возвращайся завтра.\n\
             💎 С премиумом лимита нет: /premium"
        ),
    )
    .reply_markup(kb)
    .await?;
    Ok(())
}

/* ====== Премиум ====== */

async fn show_plans(bot: &Bot, chat_id: ChatId) -> ResponseResult<()> {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = PLANS
        .iter()
        .map(|(key, name, _, price)| {
            vec![InlineKeyboardButton::callback(
                format!("{name} — {price}"),
                format!("prm_buy:{key}"),
            )]
        })
        .collect();
    rows.push(vec![InlineKeyboardButton::callback("💎 Мой статус", "prm_st")]);
    let text = "💎 <b>ПРЕМИУМ</b>\n\n\
                ✅ Без рекламы\n\
                ✅ Без дневного лимита скачиваний\n\
                ✅ Доступ без подписки на каналы\n\n\
                📦 Выбери тариф:";
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(InlineKeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

fn premium_status_text(premium: Option<&PremiumRecord>, now: DateTime<Utc>) -> String {
    match premium {
        Some(p) if p.is_active_at(now) => format!(
            "💎 <b>Премиум активен</b>\n\n📅 Действует до: {}\n⏰ Осталось дней: {}",
            fmt_date(p.expires_at),
            days_left(p.expires_at, now)
        ),
        _ => "❌ Премиума нет.\n\n/premium — подключить".to_owned(),
    }
}

/* ====== Карточка фильма ====== */

fn movie_caption(m: &Movie, is_premium: bool) -> String {
    let na = "—";
    let description = match &m.description {
        Some(d) if !d.trim().is_empty() => format!("\n📝 {}\n", clip(&html_escape(d), 600)),
        _ => String::new(),
    };
    format!(
        "🎬 <b>{}</b>\n\n\
         📅 Год: {}\n\
         📁 Жанр: {}\n\
         🌐 Язык: {}\n\
         ⭐️ Рейтинг: {}\n\
         🔢 Код: <code>{}</code>\n\
         {}\n\
         👁 Просмотров: {}{}",
        html_escape(&m.title),
        m.year.as_deref().unwrap_or(na),
        m.genre.as_deref().map(html_escape).unwrap_or_else(|| na.to_owned()),
        m.language.as_deref().map(html_escape).unwrap_or_else(|| na.to_owned()),
        m.rating.as_deref().unwrap_or(na),
        m.code,
        description,
        m.views,
        if is_premium { " | 💎 Премиум" } else { "" },
    )
}

fn movie_keyboard(m: &Movie) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    if !m.links.is_empty() {
        rows.push(vec![InlineKeyboardButton::callback("⬇️ Скачать", format!("dl:{}", m.code))]);
    }
    rows.push(vec![
        InlineKeyboardButton::callback("⭐ В избранное", format!("fav:{}", m.code)),
        InlineKeyboardButton::callback("📋 Посмотреть позже", format!("wl:{}", m.code)),
    ]);
    InlineKeyboardMarkup::new(rows)
}

fn search_line(m: &Movie) -> String {
    match &m.year {
        Some(y) => format!(
            "🎬 <b>{}</b> ({}) — код <code>{}</code>",
            html_escape(&m.title),
            y,
            m.code
        ),
        None => format!("🎬 <b>{}</b> — код <code>{}</code>", html_escape(&m.title), m.code),
    }
}

fn keyboard_search_results(results: &[Movie]) -> InlineKeyboardMarkup {
    // по 1 в строке
    let rows = results
        .iter()
        .map(|m| {
            vec![InlineKeyboardButton::callback(
                format!("🎬 {}", one_line_title(m)),
                format!("get:{}", m.code),
            )]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

/* ====== Вспомогательные ====== */

fn one_line_title(m: &Movie) -> String {
    match &m.year {
        Some(y) => format!("{} ({})", m.title, y),
        None => m.title.clone(),
    }
}

pub(crate) fn is_numeric_code(s: &str) -> bool {
    CODE_RE.is_match(s)
}

pub(crate) fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub(crate) fn fmt_date(dt: DateTime<Utc>) -> String {
    dt.format("%d.%m.%Y").to_string()
}

fn days_left(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (expires_at - now).num_seconds().max(0);
    (secs + 86_399) / 86_400
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect::<String>() + "…"
    }
}

async fn answer_cb(bot: &Bot, q: &CallbackQuery, text: &str) -> ResponseResult<()> {
    let req = bot.answer_callback_query(q.id.clone());
    if text.is_empty() {
        req.await?;
    } else {
        req.text(text).show_alert(false).await?;
    }
    Ok(())
}

fn message_text_any(msg: &Message) -> Option<String> {
    if let Some(t) = msg.text() {
        return Some(t.to_string());
    }
    if let Some(c) = msg.caption() {
        return Some(c.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn numeric_codes_only() {
        assert!(is_numeric_code("55"));
        assert!(is_numeric_code("0042"));
        assert!(!is_numeric_code("55a"));
        assert!(!is_numeric_code("дюна"));
        assert!(!is_numeric_code(""));
    }

    #[test]
    fn days_left_rounds_up() {
        let now = Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap();
        assert_eq!(days_left(now + chrono::Duration::days(1), now), 1);
        assert_eq!(days_left(now + chrono::Duration::days(1) + chrono::Duration::seconds(1), now), 2);
        assert_eq!(days_left(now - chrono::Duration::days(1), now), 0);
    }

    #[test]
    fn clip_keeps_short_strings() {
        assert_eq!(clip("абв", 5), "абв");
        assert_eq!(clip("абвгде", 3), "абв…");
    }

    #[test]
    fn escapes_html_in_titles() {
        assert_eq!(html_escape("<b> & Co"), "&lt;b&gt; &amp; Co");
    }
}
