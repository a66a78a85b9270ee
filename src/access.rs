use chrono::{DateTime, NaiveDate, Utc};

use crate::storage::{ChannelRequirement, Movie, PremiumRecord};

pub const DEFAULT_DAILY_LIMIT: u32 = 5;

/* ====== Решение о выдаче контента ======
   Движок не владеет состоянием: по профилю, записи каталога, списку
   обязательных каналов и часам он возвращает решение плюс список мутаций,
   которые хранилище применит после доставки. Порядок проверок строгий:
   каталог → премиум → подписка → квота. */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Отправка видео в чат; квота не действует.
    Watch,
    /// Выдача ссылок на скачивание; пишется в журнал и считается в квоту.
    Download,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    PremiumLapsed { user_id: u64 },
    IncrementViews { code: String },
    IncrementWatchCount { user_id: u64 },
    AppendDownloadLog { user_id: u64, code: String, title: String, at: DateTime<Utc> },
    TouchLastActive { user_id: u64, at: DateTime<Utc> },
    RecordDailyView { user_id: u64, day: NaiveDate },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Grant,
    DenyNotFound,
    DenySubscription { missing: Vec<ChannelRequirement> },
    DenyQuota,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub decision: Decision,
    pub mutations: Vec<Mutation>,
}

impl Outcome {
    fn deny(decision: Decision) -> Self {
        Self { decision, mutations: Vec::new() }
    }
}

/// Проверка членства в канале — внешний коллаборатор (Telegram API).
/// Ошибка трактуется как fail-open: бот никогда не блокирует всех
/// пользователей из-за недоступности проверки.
#[allow(async_fn_in_trait)]
pub trait MembershipProbe {
    async fn is_member(&self, channel: &ChannelRequirement, user_id: u64) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy)]
pub struct AccessEngine {
    daily_limit: u32,
}

impl AccessEngine {
    pub fn new(daily_limit: u32) -> Self {
        Self { daily_limit }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Профиль пользователя к этому моменту уже создан (лениво, при первом
    /// сообщении); сюда передаются только данные, влияющие на решение.
    pub async fn evaluate<P: MembershipProbe>(
        &self,
        user_id: u64,
        content: Option<&Movie>,
        premium: Option<&PremiumRecord>,
        channels: &[ChannelRequirement],
        downloads_today: u32,
        flow: Flow,
        probe: &P,
        now: DateTime<Utc>,
    ) -> Outcome {
        // неизвестный код — штатный исход, ни одного побочного эффекта
        let Some(movie) = content else {
            return Outcome::deny(Decision::DenyNotFound);
        };

        let mut mutations = Vec::new();

        // ленивое истечение: истина — сравнение с часами, флаг в файле
        // лишь догоняет её ровно одной мутацией
        let is_premium = premium.is_some_and(|p| p.is_active_at(now));
        if let Some(p) = premium {
            if p.active && !p.is_active_at(now) {
                mutations.push(Mutation::PremiumLapsed { user_id });
            }
        }

        if !is_premium {
            let mut missing = Vec::new();
            for channel in channels {
                match probe.is_member(channel, user_id).await {
                    Ok(true) => {}
                    Ok(false) => missing.push(channel.clone()),
                    Err(err) => {
                        tracing::warn!(
                            channel = %channel.name,
                            error = %err,
                            "membership check unavailable, letting the request through"
                        );
                    }
                }
            }
            if !missing.is_empty() {
                return Outcome { decision: Decision::DenySubscription { missing }, mutations };
            }
        }

        if flow == Flow::Download && !is_premium && downloads_today >= self.daily_limit {
            return Outcome { decision: Decision::DenyQuota, mutations };
        }

        mutations.push(Mutation::IncrementViews { code: movie.code.clone() });
        match flow {
            Flow::Watch => mutations.push(Mutation::IncrementWatchCount { user_id }),
            Flow::Download => mutations.push(Mutation::AppendDownloadLog {
                user_id,
                code: movie.code.clone(),
                title: movie.title.clone(),
                at: now,
            }),
        }
        mutations.push(Mutation::TouchLastActive { user_id, at: now });
        mutations.push(Mutation::RecordDailyView { user_id, day: now.date_naive() });

        Outcome { decision: Decision::Grant, mutations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChannelKind;
    use anyhow::bail;
    use chrono::{Duration, TimeZone};

    struct FakeProbe {
        non_members: Vec<&'static str>,
        fail_all: bool,
    }

    impl FakeProbe {
        fn members_everywhere() -> Self {
            Self { non_members: vec![], fail_all: false }
        }

        fn not_in(channels: Vec<&'static str>) -> Self {
            Self { non_members: channels, fail_all: false }
        }

        fn broken() -> Self {
            Self { non_members: vec![], fail_all: true }
        }
    }

    impl MembershipProbe for FakeProbe {
        async fn is_member(&self, channel: &ChannelRequirement, _user_id: u64) -> anyhow::Result<bool> {
            if self.fail_all {
                bail!("telegram api down");
            }
            Ok(!self.non_members.contains(&channel.name.as_str()))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap()
    }

    fn movie(code: &str) -> Movie {
        Movie {
            code: code.to_owned(),
            title: "Тестовый фильм".to_owned(),
            year: None,
            genre: None,
            language: None,
            rating: None,
            description: None,
            file_id: Some("f".to_owned()),
            links: vec![],
            views: 0,
            added_at: now(),
        }
    }

    fn channel(name: &str) -> ChannelRequirement {
        ChannelRequirement {
            kind: ChannelKind::Telegram { username: format!("@{name}"), chat_id: -100 },
            name: name.to_owned(),
            url: format!("https://t.me/{name}"),
            added_at: now(),
        }
    }

    fn premium(active: bool, expires_in_hours: i64) -> PremiumRecord {
        PremiumRecord {
            active,
            started_at: now() - Duration::days(30),
            expires_at: now() + Duration::hours(expires_in_hours),
        }
    }

    fn engine() -> AccessEngine {
        AccessEngine::new(DEFAULT_DAILY_LIMIT)
    }

    #[tokio::test]
    async fn unknown_code_denies_without_side_effects() {
        let out = engine()
            .evaluate(1, None, None, &[channel("c")], 0, Flow::Watch, &FakeProbe::members_everywhere(), now())
            .await;
        assert_eq!(out.decision, Decision::DenyNotFound);
        assert!(out.mutations.is_empty());
    }

    #[tokio::test]
    async fn expired_premium_lapses_exactly_once_per_evaluation() {
        let m = movie("55");
        let p = premium(true, -1);
        let out = engine()
            .evaluate(1, Some(&m), Some(&p), &[], 0, Flow::Watch, &FakeProbe::members_everywhere(), now())
            .await;
        assert_eq!(out.decision, Decision::Grant);
        let lapses = out
            .mutations
            .iter()
            .filter(|m| matches!(m, Mutation::PremiumLapsed { .. }))
            .count();
        assert_eq!(lapses, 1);
    }

    #[tokio::test]
    async fn lapse_accompanies_deny_outcomes_too() {
        let m = movie("55");
        let p = premium(true, -1);
        let out = engine()
            .evaluate(1, Some(&m), Some(&p), &[channel("c")], 0, Flow::Watch, &FakeProbe::not_in(vec!["c"]), now())
            .await;
        assert!(matches!(out.decision, Decision::DenySubscription { .. }));
        assert_eq!(out.mutations, vec![Mutation::PremiumLapsed { user_id: 1 }]);
    }

    #[tokio::test]
    async fn already_inactive_premium_does_not_lapse_again() {
        let m = movie("55");
        let p = premium(false, -1);
        let out = engine()
            .evaluate(1, Some(&m), Some(&p), &[], 0, Flow::Watch, &FakeProbe::members_everywhere(), now())
            .await;
        assert_eq!(out.decision, Decision::Grant);
        assert!(!out.mutations.iter().any(|m| matches!(m, Mutation::PremiumLapsed { .. })));
    }

    #[tokio::test]
    async fn missing_channels_listed_exactly() {
        let m = movie("55");
        let chans = [channel("a"), channel("b"), channel("c")];
        let out = engine()
            .evaluate(1, Some(&m), None, &chans, 0, Flow::Watch, &FakeProbe::not_in(vec!["b"]), now())
            .await;
        match out.decision {
            Decision::DenySubscription { missing } => {
                assert_eq!(missing.len(), 1);
                assert_eq!(missing[0].name, "b");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
        // до выдачи дело не дошло — счётчики не трогаем
        assert!(!out.mutations.iter().any(|m| matches!(m, Mutation::IncrementViews { .. })));
    }

    #[tokio::test]
    async fn member_of_all_channels_passes_the_gate() {
        let m = movie("55");
        let chans = [channel("a"), channel("b")];
        let out = engine()
            .evaluate(1, Some(&m), None, &chans, 0, Flow::Watch, &FakeProbe::members_everywhere(), now())
            .await;
        assert_eq!(out.decision, Decision::Grant);
    }

    #[tokio::test]
    async fn no_channels_means_gate_is_vacuously_satisfied() {
        let m = movie("55");
        let p = premium(false, -1); // неактивный премиум не мешает
        let out = engine()
            .evaluate(1, Some(&m), Some(&p), &[], 0, Flow::Watch, &FakeProbe::members_everywhere(), now())
            .await;
        assert_eq!(out.decision, Decision::Grant);
        let views = out
            .mutations
            .iter()
            .filter(|m| matches!(m, Mutation::IncrementViews { .. }))
            .count();
        assert_eq!(views, 1);
    }

    #[tokio::test]
    async fn probe_failure_is_fail_open() {
        let m = movie("55");
        let out = engine()
            .evaluate(1, Some(&m), None, &[channel("c")], 0, Flow::Watch, &FakeProbe::broken(), now())
            .await;
        assert_eq!(out.decision, Decision::Grant);
    }

    #[tokio::test]
    async fn premium_skips_subscription_gate() {
        let m = movie("55");
        let p = premium(true, 24);
        let out = engine()
            .evaluate(1, Some(&m), Some(&p), &[channel("c")], 0, Flow::Watch, &FakeProbe::not_in(vec!["c"]), now())
            .await;
        assert_eq!(out.decision, Decision::Grant);
    }

    #[tokio::test]
    async fn sixth_download_of_the_day_is_denied() {
        let m = movie("55");
        let out = engine()
            .evaluate(1, Some(&m), None, &[], 5, Flow::Download, &FakeProbe::members_everywhere(), now())
            .await;
        assert_eq!(out.decision, Decision::DenyQuota);
        assert!(out.mutations.is_empty());
    }

    #[tokio::test]
    async fn yesterdays_downloads_do_not_count() {
        // пять вчерашних записей дают downloads_today == 0
        let m = movie("55");
        let out = engine()
            .evaluate(1, Some(&m), None, &[], 0, Flow::Download, &FakeProbe::members_everywhere(), now())
            .await;
        assert_eq!(out.decision, Decision::Grant);
        assert!(out
            .mutations
            .iter()
            .any(|m| matches!(m, Mutation::AppendDownloadLog { .. })));
    }

    #[tokio::test]
    async fn watch_flow_ignores_quota() {
        let m = movie("55");
        let out = engine()
            .evaluate(1, Some(&m), None, &[], 100, Flow::Watch, &FakeProbe::members_everywhere(), now())
            .await;
        assert_eq!(out.decision, Decision::Grant);
    }

    #[tokio::test]
    async fn premium_download_quota_is_unlimited() {
        let m = movie("55");
        let p = premium(true, 24);
        let out = engine()
            .evaluate(1, Some(&m), Some(&p), &[], 100, Flow::Download, &FakeProbe::members_everywhere(), now())
            .await;
        assert_eq!(out.decision, Decision::Grant);
    }

    #[tokio::test]
    async fn grant_watch_emits_expected_mutation_set() {
        let m = movie("55");
        let out = engine()
            .evaluate(7, Some(&m), None, &[], 0, Flow::Watch, &FakeProbe::members_everywhere(), now())
            .await;
        assert_eq!(
            out.mutations,
            vec![
                Mutation::IncrementViews { code: "55".to_owned() },
                Mutation::IncrementWatchCount { user_id: 7 },
                Mutation::TouchLastActive { user_id: 7, at: now() },
                Mutation::RecordDailyView { user_id: 7, day: now().date_naive() },
            ]
        );
    }
}
