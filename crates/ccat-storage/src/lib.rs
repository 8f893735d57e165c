//! Catalog persistence + HTTP fetch utilities for ccat.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ccat_core::{
    CourseKey, CoursePatch, CourseRef, CourseSnapshot, CourseStats, Department, DiggerMapping,
    DiggerStats, NewDepartment,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub use reqwest::Url;

pub const CRATE_NAME: &str = "ccat-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// The remote answered, just not with a 200.
    pub fn is_http_status(&self) -> bool {
        matches!(self, FetchError::HttpStatus { .. })
    }
}

/// Plain GET client: one attempt per call, bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Anything other than exactly 200 is reported as [`FetchError::HttpStatus`].
    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &Url,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = %url);
        async {
            let resp = self.client.get(url.clone()).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            debug!(status = status.as_u16(), "response received");

            if status != StatusCode::OK {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse { final_url, body })
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        url: &Url,
    ) -> Result<T, FetchError> {
        let fetched = self.fetch_bytes(source_id, url).await?;
        serde_json::from_slice(&fetched.body).map_err(|source| FetchError::Decode {
            url: fetched.final_url,
            source,
        })
    }
}

/// Fixed sleep between outbound calls. The first call goes out immediately; every later
/// one waits the full delay, however long the previous call took.
#[derive(Debug)]
pub struct Pacer {
    delay: Duration,
    called: Mutex<bool>,
}

impl Pacer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            called: Mutex::new(false),
        }
    }

    pub async fn wait(&self) {
        let mut called = self.called.lock().await;
        if *called && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        *called = true;
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CourseFilter {
    All,
    MissingDescription,
}

/// Reads the snapshot a job needs and writes its deltas back.
///
/// Every write shape lives here: insert-or-ignore for departments, insert-or-merge for
/// courses and mappings, wholesale upsert for grade snapshots, insert-once for course stats.
#[async_trait]
pub trait CatalogStore: Send {
    async fn departments(&mut self) -> Result<Vec<Department>, StoreError>;

    /// Returns `false` when the department code already existed.
    async fn insert_department(&mut self, department: &NewDepartment) -> Result<bool, StoreError>;

    /// Matches on the normalized course number, so `"105w"` finds a stored `"105W "`.
    async fn find_course(
        &mut self,
        dept_id: i64,
        key: &CourseKey,
    ) -> Result<Option<CourseSnapshot>, StoreError>;

    async fn insert_course(
        &mut self,
        dept_id: i64,
        course_number: &str,
        title: Option<&str>,
    ) -> Result<i64, StoreError>;

    async fn course_snapshots(
        &mut self,
        filter: CourseFilter,
    ) -> Result<Vec<CourseSnapshot>, StoreError>;

    /// Overwrites only the populated slots and bumps `updated_at`. Empty patches are a no-op.
    async fn apply_course_patch(
        &mut self,
        course_id: i64,
        patch: &CoursePatch,
    ) -> Result<(), StoreError>;

    async fn upsert_digger_mapping(
        &mut self,
        course_id: i64,
        digger_course_id: i32,
    ) -> Result<(), StoreError>;

    async fn digger_mappings(&mut self) -> Result<Vec<DiggerMapping>, StoreError>;

    async fn upsert_digger_stats(&mut self, stats: &DiggerStats) -> Result<(), StoreError>;

    async fn course_stats_exists(&mut self, course_id: i64) -> Result<bool, StoreError>;

    async fn insert_course_stats(&mut self, stats: &CourseStats) -> Result<(), StoreError>;
}

pub async fn connect_pool(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Postgres-backed store. All writes of one run share a single transaction, so nothing
/// is visible until [`PgCatalogStore::commit`]; dropping the store rolls the run back.
pub struct PgCatalogStore {
    tx: Transaction<'static, Postgres>,
}

const SNAPSHOT_SELECT: &str = r#"
    SELECT c.course_id, d.dept_code, c.course_number,
           c.title, c.description, c.units, c.degree_level,
           c.prerequisites, c.corequisites, c.designation
      FROM courses c
      JOIN departments d ON c.dept_id = d.dept_id
"#;

impl PgCatalogStore {
    pub async fn begin(pool: &PgPool) -> Result<Self, StoreError> {
        Ok(Self {
            tx: pool.begin().await?,
        })
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<CourseSnapshot, sqlx::Error> {
    Ok(CourseSnapshot {
        course: CourseRef {
            course_id: row.try_get("course_id")?,
            dept_code: row.try_get("dept_code")?,
            course_number: row.try_get("course_number")?,
        },
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        units: row.try_get("units")?,
        degree_level: row.try_get("degree_level")?,
        prerequisites: row.try_get("prerequisites")?,
        corequisites: row.try_get("corequisites")?,
        designation: row.try_get("designation")?,
    })
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn departments(&mut self) -> Result<Vec<Department>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT dept_id, dept_code, name
              FROM departments
             ORDER BY dept_code
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Department {
                dept_id: row.try_get("dept_id")?,
                dept_code: row.try_get("dept_code")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }

    async fn insert_department(&mut self, department: &NewDepartment) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO departments (dept_code, name)
            VALUES ($1, $2)
            ON CONFLICT (dept_code) DO NOTHING
            "#,
        )
        .bind(&department.dept_code)
        .bind(&department.name)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_course(
        &mut self,
        dept_id: i64,
        key: &CourseKey,
    ) -> Result<Option<CourseSnapshot>, StoreError> {
        let sql = format!(
            r"{SNAPSHOT_SELECT}
             WHERE c.dept_id = $1
               AND UPPER(REGEXP_REPLACE(TRIM(c.course_number), '\s+', ' ', 'g')) = $2
             ORDER BY c.course_id
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(dept_id)
            .bind(key.course_number())
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.as_ref().map(snapshot_from_row).transpose()?)
    }

    async fn insert_course(
        &mut self,
        dept_id: i64,
        course_number: &str,
        title: Option<&str>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO courses (dept_id, course_number, title, updated_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING course_id
            "#,
        )
        .bind(dept_id)
        .bind(course_number)
        .bind(title)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.try_get("course_id")?)
    }

    async fn course_snapshots(
        &mut self,
        filter: CourseFilter,
    ) -> Result<Vec<CourseSnapshot>, StoreError> {
        let predicate = match filter {
            CourseFilter::All => "",
            CourseFilter::MissingDescription => "WHERE c.description IS NULL",
        };
        let sql = format!("{SNAPSHOT_SELECT} {predicate} ORDER BY d.dept_code, c.course_number");
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        let snapshots = rows
            .iter()
            .map(snapshot_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }

    async fn apply_course_patch(
        &mut self,
        course_id: i64,
        patch: &CoursePatch,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE courses
               SET title = COALESCE($2, title),
                   description = COALESCE($3, description),
                   units = COALESCE($4, units),
                   degree_level = COALESCE($5, degree_level),
                   prerequisites = COALESCE($6, prerequisites),
                   corequisites = COALESCE($7, corequisites),
                   designation = COALESCE($8, designation),
                   updated_at = NOW()
             WHERE course_id = $1
            "#,
        )
        .bind(course_id)
        .bind(&patch.title)
        .bind(&patch.description)
        .bind(patch.units)
        .bind(&patch.degree_level)
        .bind(&patch.prerequisites)
        .bind(&patch.corequisites)
        .bind(&patch.designation)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_digger_mapping(
        &mut self,
        course_id: i64,
        digger_course_id: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO course_digger_map (course_id, digger_course_id, last_verified_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (course_id) DO UPDATE
               SET digger_course_id = EXCLUDED.digger_course_id,
                   last_verified_at = NOW()
            "#,
        )
        .bind(course_id)
        .bind(digger_course_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn digger_mappings(&mut self) -> Result<Vec<DiggerMapping>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT course_digger_map_id, course_id, digger_course_id
              FROM course_digger_map
             ORDER BY digger_course_id
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DiggerMapping {
                map_id: row.try_get("course_digger_map_id")?,
                course_id: row.try_get("course_id")?,
                digger_course_id: row.try_get("digger_course_id")?,
            });
        }
        Ok(out)
    }

    async fn upsert_digger_stats(&mut self, stats: &DiggerStats) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO course_digger_stats (
                course_digger_map_id, median_grade, fail_rate, grade_distribution, last_fetched_at
            )
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (course_digger_map_id) DO UPDATE
               SET median_grade = EXCLUDED.median_grade,
                   fail_rate = EXCLUDED.fail_rate,
                   grade_distribution = EXCLUDED.grade_distribution,
                   last_fetched_at = NOW()
            "#,
        )
        .bind(stats.map_id)
        .bind(&stats.median_grade)
        .bind(stats.fail_rate)
        .bind(Json(&stats.grade_distribution))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn course_stats_exists(&mut self, course_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM course_stats WHERE course_id = $1")
            .bind(course_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_course_stats(&mut self, stats: &CourseStats) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO course_stats (
                course_id, total_enrollment, total_capacity, load_percent,
                offered_terms, last_calculated_at
            )
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(stats.course_id)
        .bind(stats.total_enrollment)
        .bind(stats.total_capacity)
        .bind(stats.load_percent)
        .bind(Json(&stats.offered_terms))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    /// Serves exactly one canned HTTP response on a loopback port.
    async fn serve_once(status_line: &'static str, body: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
        });
        Url::parse(&format!("http://{addr}/data")).expect("url")
    }

    #[tokio::test]
    async fn fetch_json_decodes_200_bodies() {
        let url = serve_once("200 OK", r#"[{"text":"CMPT","value":"cmpt"}]"#).await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let body: serde_json::Value = fetcher.fetch_json("outlines", &url).await.expect("json");
        assert_eq!(body[0]["value"], "cmpt");
    }

    #[tokio::test]
    async fn non_200_is_reported_as_http_status() {
        let url = serve_once("404 Not Found", "{}").await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let err = fetcher.fetch_bytes("outlines", &url).await.unwrap_err();
        assert!(err.is_http_status());
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn other_2xx_codes_are_not_success() {
        let url = serve_once("204 No Content", "").await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let err = fetcher.fetch_bytes("outlines", &url).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 204, .. }));
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let url = serve_once("200 OK", "not json").await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let err = fetcher
            .fetch_json::<serde_json::Value>("outlines", &url)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
        assert!(!err.is_http_status());
    }

    #[tokio::test]
    async fn pacer_spaces_consecutive_calls() {
        let pacer = Pacer::new(Duration::from_millis(40));
        let started = Instant::now();
        pacer.wait().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        pacer.wait().await;
        pacer.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn pacer_sleeps_the_full_delay_after_slow_calls() {
        let pacer = Pacer::new(Duration::from_millis(40));
        pacer.wait().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let resumed = Instant::now();
        pacer.wait().await;
        assert!(resumed.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn zero_delay_pacer_never_sleeps() {
        let pacer = Pacer::new(Duration::ZERO);
        let started = Instant::now();
        for _ in 0..5 {
            pacer.wait().await;
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
