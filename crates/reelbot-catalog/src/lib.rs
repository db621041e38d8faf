//! Reelbot Catalog
//!
//! Remote movie catalog contract plus a Radarr v3 implementation

use anyhow::{anyhow, Context, Result};
use reelbot_config::RadarrConfig;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MISSING_MOVIES_COMMAND: &str = "MissingMoviesSearch";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub title: String,
    pub year: Option<i32>,
    pub tmdb_id: i64,
    pub imdb_id: Option<String>,
    pub rating: Option<f64>,
    pub poster_url: Option<String>,
    /// Set when the catalog already tracks this movie.
    pub in_library: bool,
}

impl Movie {
    pub fn link(&self) -> String {
        match self.imdb_id.as_deref().filter(|id| !id.is_empty()) {
            Some(imdb) => format!("https://www.imdb.com/title/{}/", imdb),
            None => format!("https://www.themoviedb.org/movie/{}", self.tmdb_id),
        }
    }

    pub fn title_with_year(&self) -> String {
        match self.year.filter(|year| *year > 0) {
            Some(year) => format!("{} ({})", self.title, year),
            None => self.title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
}

#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    async fn search_movies(&self, query: &str) -> Result<Vec<Movie>>;
    async fn list_library(&self) -> Result<Vec<Movie>>;
    /// `Ok(false)` when the catalog rejected the movie.
    async fn add_movie(&self, tmdb_id: i64, title: &str, profile_id: i64) -> Result<bool>;
    async fn list_profiles(&self) -> Result<Vec<Profile>>;
    /// Asks the catalog to search for every monitored movie without a file.
    async fn trigger_full_search(&self) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMovie {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    tmdb_id: i64,
    #[serde(default)]
    imdb_id: Option<String>,
    #[serde(default)]
    ratings: Option<serde_json::Value>,
    #[serde(default)]
    images: Vec<RawImage>,
    #[serde(default)]
    remote_poster: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawImage {
    #[serde(default)]
    cover_type: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    remote_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRootFolder {
    path: String,
}

impl From<RawMovie> for Movie {
    fn from(raw: RawMovie) -> Self {
        let poster_url = raw
            .images
            .iter()
            .find(|image| image.cover_type.eq_ignore_ascii_case("poster"))
            .and_then(|image| image.remote_url.clone().or_else(|| image.url.clone()))
            .or(raw.remote_poster);
        Movie {
            rating: raw.ratings.as_ref().and_then(extract_rating),
            title: raw.title,
            year: raw.year,
            tmdb_id: raw.tmdb_id,
            imdb_id: raw.imdb_id.filter(|id| !id.trim().is_empty()),
            poster_url,
            in_library: raw.id.is_some_and(|id| id > 0),
        }
    }
}

/// Radarr v3 reports `{ "value": 7.5 }`; v4 nests per source
/// (`{ "imdb": { "value": .. }, "tmdb": { .. } }`).
fn extract_rating(ratings: &serde_json::Value) -> Option<f64> {
    if let Some(value) = ratings.get("value").and_then(|v| v.as_f64()) {
        return Some(value);
    }
    ["imdb", "tmdb", "metacritic", "rottenTomatoes"]
        .iter()
        .filter_map(|source| ratings.get(source))
        .filter_map(|entry| entry.get("value").and_then(|v| v.as_f64()))
        .find(|value| *value > 0.0)
}

pub fn parse_movies(value: serde_json::Value) -> Result<Vec<Movie>> {
    let raw: Vec<RawMovie> =
        serde_json::from_value(value).map_err(|e| anyhow!("unexpected movie list shape: {}", e))?;
    Ok(raw.into_iter().map(Movie::from).collect())
}

pub fn parse_profiles(value: serde_json::Value) -> Result<Vec<Profile>> {
    serde_json::from_value(value).map_err(|e| anyhow!("unexpected profile list shape: {}", e))
}

/// Fills the fields Radarr needs on top of a lookup record before `POST movie`.
pub fn build_add_payload(
    mut lookup: serde_json::Value,
    title: &str,
    profile_id: i64,
    root_folder: &str,
) -> Result<serde_json::Value> {
    let obj = lookup
        .as_object_mut()
        .ok_or_else(|| anyhow!("movie lookup did not return an object"))?;
    obj.insert("title".to_string(), serde_json::json!(title));
    obj.insert("qualityProfileId".to_string(), serde_json::json!(profile_id));
    obj.insert("rootFolderPath".to_string(), serde_json::json!(root_folder));
    obj.insert("monitored".to_string(), serde_json::json!(true));
    obj.insert(
        "addOptions".to_string(),
        serde_json::json!({ "searchForMovie": true }),
    );
    obj.remove("id");
    Ok(lookup)
}

pub struct RadarrClient {
    client: Client,
    base_url: Url,
    api_key: String,
    basic_auth: Option<(String, Option<String>)>,
    root_folder: Option<String>,
}

impl RadarrClient {
    pub fn new(config: &RadarrConfig) -> Result<Self> {
        let base_url = Url::parse(&config.api_base_url())
            .with_context(|| format!("invalid Radarr address {}", config.api_base_url()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(
                config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow!("failed to build Radarr HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            basic_auth: config.basic_auth(),
            root_folder: config
                .root_folder
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| anyhow!("invalid Radarr endpoint {}: {}", path, e))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("X-Api-Key", &self.api_key);
        match &self.basic_auth {
            Some((username, password)) => request.basic_auth(username, password.as_ref()),
            None => request,
        }
    }

    fn truncate_for_error(text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            text.to_string()
        } else {
            let truncated: String = text.chars().take(max_chars).collect();
            format!("{}...", truncated)
        }
    }

    async fn read_json(endpoint: &str, resp: Response) -> Result<serde_json::Value> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| anyhow!("radarr {} body read failed: {}", endpoint, e))?;
        if !status.is_success() {
            return Err(anyhow!(
                "radarr {} HTTP {}: {}",
                endpoint,
                status,
                Self::truncate_for_error(&body, 300)
            ));
        }
        serde_json::from_str(&body).map_err(|e| {
            anyhow!(
                "radarr {} decode failed: {} | body={}",
                endpoint,
                e,
                Self::truncate_for_error(&body, 300)
            )
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value> {
        let url = self.endpoint(path)?;
        debug!(endpoint = path, "Radarr GET");
        let resp = self
            .authorize(self.client.get(url).query(query))
            .send()
            .await
            .map_err(|e| anyhow!("radarr {} request failed: {}", path, e))?;
        Self::read_json(path, resp).await
    }

    async fn lookup_by_tmdb(&self, tmdb_id: i64) -> Result<serde_json::Value> {
        self.get_json("movie/lookup/tmdb", &[("tmdbId", tmdb_id.to_string())])
            .await
    }

    async fn resolve_root_folder(&self) -> Result<String> {
        if let Some(root) = &self.root_folder {
            return Ok(root.clone());
        }
        let folders: Vec<RawRootFolder> = serde_json::from_value(
            self.get_json("rootfolder", &[]).await?,
        )
        .map_err(|e| anyhow!("unexpected root folder shape: {}", e))?;
        folders
            .into_iter()
            .map(|folder| folder.path)
            .next()
            .ok_or_else(|| anyhow!("radarr has no root folder configured"))
    }
}

#[async_trait::async_trait]
impl Catalog for RadarrClient {
    async fn search_movies(&self, query: &str) -> Result<Vec<Movie>> {
        let value = self
            .get_json("movie/lookup", &[("term", query.trim().to_string())])
            .await?;
        parse_movies(value)
    }

    async fn list_library(&self) -> Result<Vec<Movie>> {
        parse_movies(self.get_json("movie", &[]).await?)
    }

    async fn add_movie(&self, tmdb_id: i64, title: &str, profile_id: i64) -> Result<bool> {
        let lookup = self.lookup_by_tmdb(tmdb_id).await?;
        let root_folder = self.resolve_root_folder().await?;
        let payload = build_add_payload(lookup, title, profile_id, &root_folder)?;

        let url = self.endpoint("movie")?;
        let resp = self
            .authorize(self.client.post(url).json(&payload))
            .send()
            .await
            .map_err(|e| anyhow!("radarr movie add request failed: {}", e))?;

        let status = resp.status();
        if status.is_success() {
            info!(tmdb_id, profile_id, "Movie added to Radarr");
            return Ok(true);
        }
        if status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            info!(
                tmdb_id,
                status = %status,
                "Radarr rejected movie: {}",
                Self::truncate_for_error(&body, 300)
            );
            return Ok(false);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!(
            "radarr movie add HTTP {}: {}",
            status,
            Self::truncate_for_error(&body, 300)
        ))
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        parse_profiles(self.get_json("qualityprofile", &[]).await?)
    }

    async fn trigger_full_search(&self) -> Result<()> {
        let url = self.endpoint("command")?;
        let resp = self
            .authorize(
                self.client
                    .post(url)
                    .json(&serde_json::json!({ "name": MISSING_MOVIES_COMMAND })),
            )
            .send()
            .await
            .map_err(|e| anyhow!("radarr command request failed: {}", e))?;
        Self::read_json("command", resp).await?;
        info!("Radarr missing movie search triggered");
        Ok(())
    }
}
