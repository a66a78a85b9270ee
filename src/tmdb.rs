use moka::future::Cache;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Клиент TMDb — подсказки, когда в локальном каталоге ничего не нашлось.
/// Недоступность API не фатальна: вызывающая сторона показывает пустой
/// результат.
#[derive(Clone)]
pub struct TmdbClient {
    api_key: String,
    base_url: String,
    http: Client,
    search_cache: Cache<String, Vec<TmdbMovie>>,
}

impl TmdbClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.themoviedb.org/3".to_owned())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url,
            http: Client::new(),
            // повторные запросы одного и того же названия — обычное дело
            search_cache: Cache::builder()
                .max_capacity(512)
                .time_to_live(Duration::from_secs(600))
                .build(),
        }
    }

    /// Поиск фильмов (RU), максимум `limit` (1..10).
    pub async fn search_movies(&self, query: &str, limit: usize) -> reqwest::Result<Vec<TmdbMovie>> {
        if let Some(mut hit) = self.search_cache.get(query).await {
            hit.truncate(limit.min(10));
            return Ok(hit);
        }
        let url = format!(
            "{}/search/movie?query={}&language=ru-RU&include_adult=false&page=1",
            self.base_url,
            urlencoding::encode(query)
        );
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(vec![]);
        }
        let mut data: SearchResp = resp.json().await?;
        data.results.truncate(10);
        self.search_cache.insert(query.to_owned(), data.results.clone()).await;
        data.results.truncate(limit.min(10));
        Ok(data.results)
    }

    /// Детали фильма (RU).
    pub async fn movie_details(&self, id: u64) -> reqwest::Result<Option<TmdbMovie>> {
        let url = format!("{}/movie/{}?language=ru-RU", self.base_url, id);
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let movie: TmdbMovie = resp.json().await?;
        Ok(Some(movie))
    }
}

/* ======= DTOs ======= */

#[derive(Deserialize, Debug)]
struct SearchResp {
    results: Vec<TmdbMovie>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TmdbMovie {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub overview: String,
    pub poster_path: Option<String>,
    pub release_date: Option<String>,
    pub vote_average: Option<f64>,
}

impl TmdbMovie {
    pub fn year(&self) -> Option<&str> {
        self.release_date.as_deref().and_then(|d| d.get(..4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn body() -> serde_json::Value {
        json!({
            "results": [
                {
                    "id": 157336,
                    "title": "Интерстеллар",
                    "overview": "Экипаж исследователей...",
                    "poster_path": "/poster.jpg",
                    "release_date": "2014-11-06",
                    "vote_average": 8.4
                },
                {
                    "id": 1,
                    "title": "Другой фильм",
                    "overview": "",
                    "poster_path": null,
                    "release_date": null,
                    "vote_average": null
                }
            ]
        })
    }

    #[tokio::test]
    async fn search_parses_results_and_extracts_year() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/movie"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body()))
            .mount(&server)
            .await;

        let client = TmdbClient::with_base_url("key".to_owned(), server.uri());
        let found = client.search_movies("интерстеллар", 5).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].year(), Some("2014"));
        assert_eq!(found[1].year(), None);
    }

    #[tokio::test]
    async fn server_error_yields_empty_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/movie"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = TmdbClient::with_base_url("key".to_owned(), server.uri());
        let found = client.search_movies("что-нибудь", 5).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn repeated_search_is_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/movie"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = TmdbClient::with_base_url("key".to_owned(), server.uri());
        client.search_movies("интерстеллар", 5).await.unwrap();
        let second = client.search_movies("интерстеллар", 1).await.unwrap();
        assert_eq!(second.len(), 1);
        server.verify().await;
    }

    #[tokio::test]
    async fn missing_details_yield_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/movie/42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = TmdbClient::with_base_url("key".to_owned(), server.uri());
        assert!(client.movie_details(42).await.unwrap().is_none());
    }
}
