//! External source contracts + HTTP adapter implementations.
//!
//! Each source decodes into its own intermediate shape; reconciliation against local rows
//! happens in `ccat-sync`. A non-200 answer or an empty result is "not found", never an error.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ccat_core::{meaningful, parse_enrollment, CourseKey, CourseRef, NewDepartment, TermSelector};
use ccat_storage::{FetchError, HttpFetcher, Url};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ccat-adapters";

pub const OUTLINES_BASE_URL: &str = "https://www.sfu.ca/bin/wcm/course-outlines";
pub const DIGGER_SEARCH_URL: &str = "https://www.coursediggers.com/pages/search_space";
pub const DIGGER_DATA_BASE_URL: &str = "https://www.coursediggers.com/data";
pub const COURSYS_BROWSE_URL: &str = "https://coursys.sfu.ca/browse/";

pub const MEDIAN_GRADE_LABEL: &str = "Median Grade";
pub const FAIL_RATE_LABEL: &str = "Fail Rate";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Renders a scalar JSON cell as text; `null` has no text.
pub fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(json_text))
}

fn not_found_on_status<T>(
    source_id: &str,
    result: Result<T, FetchError>,
) -> Result<Option<T>, AdapterError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_http_status() => {
            debug!(source_id, error = %err, "treating as not found");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn parse_url(raw: &str) -> Result<Url, AdapterError> {
    Url::parse(raw).map_err(|e| AdapterError::Message(format!("invalid url {raw}: {e}")))
}

/// One `{text, value, title}` row of an outline listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    #[serde(default, deserialize_with = "lenient_text")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub value: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedCourse {
    pub course_number: Option<String>,
    pub title: Option<String>,
}

/// Department listing rows carry the code in `value` and the display name in `text`.
pub fn parse_departments(entries: Vec<ListingEntry>) -> Vec<NewDepartment> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let dept_code = meaningful(entry.value)?;
            Some(NewDepartment {
                dept_code,
                name: entry.text,
            })
        })
        .collect()
}

pub fn parse_course_listing(entries: Vec<ListingEntry>) -> Vec<ListedCourse> {
    entries
        .into_iter()
        .map(|entry| ListedCourse {
            course_number: entry.value,
            title: entry.title,
        })
        .collect()
}

pub fn parse_sections(entries: Vec<ListingEntry>) -> Vec<String> {
    entries
        .into_iter()
        .filter_map(|entry| meaningful(entry.value))
        .collect()
}

/// The `info` block of a section outline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineInfo {
    #[serde(default, deserialize_with = "lenient_text")]
    pub dept: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub number: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub units: Option<String>,
    #[serde(rename = "degreeLevel", default, deserialize_with = "lenient_text")]
    pub degree_level: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub prerequisites: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub corequisites: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub designation: Option<String>,
}

impl OutlineInfo {
    /// The course identity the outline claims to describe.
    pub fn echoed_key(&self) -> CourseKey {
        CourseKey::new(
            self.dept.as_deref().unwrap_or_default(),
            self.number.as_deref().unwrap_or_default(),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutlineDocument {
    #[serde(default)]
    pub info: OutlineInfo,
}

/// Course-outline API: listings plus the two-step section probe.
#[async_trait]
pub trait OutlineSource: Send + Sync {
    fn source_id(&self) -> &'static str {
        "sfu-outlines"
    }

    async fn departments(&self, selector: TermSelector) -> Result<Vec<NewDepartment>, AdapterError>;

    async fn courses(
        &self,
        selector: TermSelector,
        dept_code: &str,
    ) -> Result<Vec<ListedCourse>, AdapterError>;

    async fn sections(
        &self,
        selector: TermSelector,
        course: &CourseRef,
    ) -> Result<Vec<String>, AdapterError>;

    async fn outline(
        &self,
        selector: TermSelector,
        course: &CourseRef,
        section: &str,
    ) -> Result<Option<OutlineInfo>, AdapterError>;

    /// Lists sections for `(selector, course)` and fetches the first one's outline.
    ///
    /// An outline whose echoed dept/number disagree with `course` is a miss: the remote
    /// sometimes answers with an unrelated course.
    async fn probe_outline(
        &self,
        selector: TermSelector,
        course: &CourseRef,
    ) -> Result<Option<OutlineInfo>, AdapterError> {
        let requested = course.key();
        let sections = self.sections(selector, course).await?;
        let Some(section) = sections.first() else {
            debug!(course = %requested, %selector, "no sections listed");
            return Ok(None);
        };

        let Some(info) = self.outline(selector, course, section).await? else {
            debug!(course = %requested, %selector, section = %section, "section outline not found");
            return Ok(None);
        };

        let echoed = info.echoed_key();
        if echoed != requested {
            warn!(course = %requested, %echoed, %selector, "outline identity mismatch, skipping");
            return Ok(None);
        }
        Ok(Some(info))
    }
}

#[derive(Debug, Clone)]
pub struct OutlineClient {
    http: HttpFetcher,
    base_url: String,
}

impl OutlineClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// `<base>?2025/spring/cmpt/213/d100`, every segment lowercased.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, AdapterError> {
        let path = segments
            .iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join("/");
        parse_url(&format!("{}?{}", self.base_url, path))
    }

    async fn listing(&self, segments: &[&str]) -> Result<Vec<ListingEntry>, AdapterError> {
        let url = self.endpoint(segments)?;
        let fetched = self.http.fetch_json(self.source_id(), &url).await;
        Ok(not_found_on_status(self.source_id(), fetched)?.unwrap_or_default())
    }
}

#[async_trait]
impl OutlineSource for OutlineClient {
    async fn departments(
        &self,
        selector: TermSelector,
    ) -> Result<Vec<NewDepartment>, AdapterError> {
        let year = selector.year.to_string();
        let entries = self.listing(&[&year, selector.term.as_str()]).await?;
        Ok(parse_departments(entries))
    }

    async fn courses(
        &self,
        selector: TermSelector,
        dept_code: &str,
    ) -> Result<Vec<ListedCourse>, AdapterError> {
        let year = selector.year.to_string();
        let entries = self
            .listing(&[&year, selector.term.as_str(), dept_code])
            .await?;
        Ok(parse_course_listing(entries))
    }

    async fn sections(
        &self,
        selector: TermSelector,
        course: &CourseRef,
    ) -> Result<Vec<String>, AdapterError> {
        let year = selector.year.to_string();
        let entries = self
            .listing(&[
                &year,
                selector.term.as_str(),
                &course.dept_code,
                &course.course_number,
            ])
            .await?;
        Ok(parse_sections(entries))
    }

    async fn outline(
        &self,
        selector: TermSelector,
        course: &CourseRef,
        section: &str,
    ) -> Result<Option<OutlineInfo>, AdapterError> {
        let year = selector.year.to_string();
        let url = self.endpoint(&[
            &year,
            selector.term.as_str(),
            &course.dept_code,
            &course.course_number,
            section,
        ])?;
        let fetched = self.http.fetch_json::<OutlineDocument>(self.source_id(), &url).await;
        Ok(not_found_on_status(self.source_id(), fetched)?.map(|doc| doc.info))
    }
}

/// One `(displayed name, remote id)` pair of the grade site's catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "value", default, deserialize_with = "lenient_text")]
    pub name: Option<String>,
    #[serde(rename = "data", default, deserialize_with = "lenient_text")]
    pub remote_id: Option<String>,
}

impl CatalogEntry {
    pub fn key(&self) -> Option<CourseKey> {
        let name = meaningful(self.name.as_deref())?;
        Some(CourseKey::from_display(name))
    }

    pub fn digger_course_id(&self) -> Option<i32> {
        meaningful(self.remote_id.as_deref()).and_then(|id| id.trim().parse().ok())
    }
}

/// Label/value grade table; only the first data row is used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradeTable {
    #[serde(default)]
    pub labels: Vec<JsonValue>,
    #[serde(default)]
    pub data: Vec<Vec<JsonValue>>,
}

impl GradeTable {
    /// Zips the labels with the first data row. `None` if either side is empty.
    pub fn labelled_row(&self) -> Option<BTreeMap<String, JsonValue>> {
        let row = self.data.first()?;
        if self.labels.is_empty() {
            return None;
        }
        Some(
            self.labels
                .iter()
                .zip(row.iter())
                .filter_map(|(label, value)| Some((json_text(label)?, value.clone())))
                .collect(),
        )
    }
}

#[async_trait]
pub trait GradeSource: Send + Sync {
    fn source_id(&self) -> &'static str {
        "coursediggers"
    }

    /// The full remote catalogue in one call.
    async fn catalog(&self) -> Result<Vec<CatalogEntry>, AdapterError>;

    async fn grade_table(&self, digger_course_id: i32) -> Result<Option<GradeTable>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct DiggerClient {
    http: HttpFetcher,
    search_url: String,
    data_base_url: String,
    school_id: u32,
}

impl DiggerClient {
    pub fn new(
        http: HttpFetcher,
        search_url: impl Into<String>,
        data_base_url: impl Into<String>,
        school_id: u32,
    ) -> Self {
        Self {
            http,
            search_url: search_url.into(),
            data_base_url: data_base_url.into(),
            school_id,
        }
    }

    pub fn catalog_url(&self) -> Result<Url, AdapterError> {
        let school_id = self.school_id.to_string();
        Url::parse_with_params(&self.search_url, &[("school_id", school_id.as_str())])
            .map_err(|e| AdapterError::Message(format!("invalid url {}: {e}", self.search_url)))
    }

    pub fn grade_table_url(&self, digger_course_id: i32) -> Result<Url, AdapterError> {
        parse_url(&format!(
            "{}/{}.json",
            self.data_base_url.trim_end_matches('/'),
            digger_course_id
        ))
    }
}

#[async_trait]
impl GradeSource for DiggerClient {
    async fn catalog(&self) -> Result<Vec<CatalogEntry>, AdapterError> {
        let url = self.catalog_url()?;
        let fetched = self.http.fetch_json(self.source_id(), &url).await;
        Ok(not_found_on_status(self.source_id(), fetched)?.unwrap_or_default())
    }

    async fn grade_table(&self, digger_course_id: i32) -> Result<Option<GradeTable>, AdapterError> {
        let url = self.grade_table_url(digger_course_id)?;
        let fetched = self.http.fetch_json(self.source_id(), &url).await;
        not_found_on_status(self.source_id(), fetched)
    }
}

/// One section row of the enrollment browser; column 3 holds `"enrolled/capacity"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrowseRow(pub JsonValue);

impl BrowseRow {
    pub const ENROLLMENT_COLUMN: usize = 3;

    pub fn enrollment(&self) -> (i32, i32) {
        parse_enrollment(self.0.get(Self::ENROLLMENT_COLUMN).and_then(JsonValue::as_str))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrowseDocument {
    #[serde(default)]
    pub data: Vec<BrowseRow>,
}

#[async_trait]
pub trait EnrollmentSource: Send + Sync {
    fn source_id(&self) -> &'static str {
        "coursys"
    }

    async fn browse(
        &self,
        course: &CourseRef,
        selector: TermSelector,
    ) -> Result<Vec<BrowseRow>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct CoursysClient {
    http: HttpFetcher,
    browse_url: String,
}

impl CoursysClient {
    pub fn new(http: HttpFetcher, browse_url: impl Into<String>) -> Self {
        Self {
            http,
            browse_url: browse_url.into(),
        }
    }

    pub fn browse_url(
        &self,
        course: &CourseRef,
        selector: TermSelector,
    ) -> Result<Url, AdapterError> {
        let subject = course.dept_code.trim().to_ascii_uppercase();
        let semester = selector.semester_code();
        Url::parse_with_params(
            &self.browse_url,
            &[
                ("subject[]", subject.as_str()),
                ("number[]", course.course_number.trim()),
                ("semester[]", semester.as_str()),
                ("tabledata", "yes"),
            ],
        )
        .map_err(|e| AdapterError::Message(format!("invalid url {}: {e}", self.browse_url)))
    }
}

#[async_trait]
impl EnrollmentSource for CoursysClient {
    async fn browse(
        &self,
        course: &CourseRef,
        selector: TermSelector,
    ) -> Result<Vec<BrowseRow>, AdapterError> {
        let url = self.browse_url(course, selector)?;
        let fetched = self.http.fetch_json::<BrowseDocument>(self.source_id(), &url).await;
        Ok(not_found_on_status(self.source_id(), fetched)?
            .map(|doc| doc.data)
            .unwrap_or_default())
    }
}
