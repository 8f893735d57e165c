//! Core domain model for the course catalog: natural keys, the meaningfulness gate,
//! and the row shapes exchanged between adapters, the reconciliation engine and the store.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "ccat-core";

/// Placeholder the base listing uses for "not yet known" course numbers and unit counts.
pub const ZERO_SENTINEL: &str = "0";

/// Canonical natural key: `"<DEPT> <NUMBER>"`, uppercased with whitespace collapsed.
///
/// Local rows and external payloads are both keyed through this type, so the two sides
/// can never disagree about case or spacing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CourseKey(String);

impl CourseKey {
    pub fn new(dept_code: &str, course_number: &str) -> Self {
        let dept = normalize_key_fragment(dept_code);
        let number = normalize_key_fragment(course_number);
        Self(format!("{dept} {number}").trim().to_string())
    }

    /// Keys a displayed course name such as `"cmpt 213"`: the first token is the
    /// department, everything after it the course number.
    pub fn from_display(name: &str) -> Self {
        let mut tokens = name.split_whitespace();
        let dept = tokens.next().unwrap_or_default();
        let number = tokens.collect::<Vec<_>>().join(" ");
        Self::new(dept, &number)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The normalized number half, what stored course numbers are compared against.
    pub fn course_number(&self) -> &str {
        self.0.split_once(' ').map_or("", |(_, number)| number)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_key_fragment(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Whether a value counts as present: eligible to be written, or blocking an overwrite.
pub trait Meaningful {
    fn is_meaningful(&self) -> bool;
}

impl Meaningful for str {
    fn is_meaningful(&self) -> bool {
        let trimmed = self.trim();
        !trimmed.is_empty() && trimmed != ZERO_SENTINEL
    }
}

impl Meaningful for String {
    fn is_meaningful(&self) -> bool {
        self.as_str().is_meaningful()
    }
}

impl Meaningful for i32 {
    fn is_meaningful(&self) -> bool {
        *self != 0
    }
}

impl Meaningful for i64 {
    fn is_meaningful(&self) -> bool {
        *self != 0
    }
}

impl Meaningful for JsonValue {
    fn is_meaningful(&self) -> bool {
        match self {
            JsonValue::Null => false,
            JsonValue::String(s) => s.is_meaningful(),
            other => other.to_string().is_meaningful(),
        }
    }
}

impl<T: Meaningful + ?Sized> Meaningful for &T {
    fn is_meaningful(&self) -> bool {
        (**self).is_meaningful()
    }
}

impl<T: Meaningful> Meaningful for Option<T> {
    fn is_meaningful(&self) -> bool {
        self.as_ref().is_some_and(Meaningful::is_meaningful)
    }
}

pub fn is_meaningful<T: Meaningful + ?Sized>(value: &T) -> bool {
    value.is_meaningful()
}

/// Keeps `value` only if it is meaningful.
pub fn meaningful<T: Meaningful>(value: Option<T>) -> Option<T> {
    value.filter(Meaningful::is_meaningful)
}

pub fn safe_int(text: &str) -> Option<i64> {
    text.trim().parse().ok()
}

pub fn safe_float(text: &str) -> Option<f64> {
    text.trim().parse().ok()
}

/// Parses an `"enrolled/capacity"` cell. Anything else degrades to `(0, 0)`.
pub fn parse_enrollment(text: Option<&str>) -> (i32, i32) {
    let Some(text) = text else {
        return (0, 0);
    };
    let mut parts = text.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(enrolled), Some(capacity), None) => {
            match (enrolled.trim().parse(), capacity.trim().parse()) {
                (Ok(enrolled), Ok(capacity)) => (enrolled, capacity),
                _ => (0, 0),
            }
        }
        _ => (0, 0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Term {
    Spring,
    Summer,
    Fall,
}

impl Term {
    pub const ALL: [Term; 3] = [Term::Spring, Term::Summer, Term::Fall];

    pub fn as_str(self) -> &'static str {
        match self {
            Term::Spring => "spring",
            Term::Summer => "summer",
            Term::Fall => "fall",
        }
    }

    fn semester_suffix(self) -> &'static str {
        match self {
            Term::Spring => "sp",
            Term::Summer => "su",
            Term::Fall => "fa",
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Term {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spring" => Ok(Term::Spring),
            "summer" => Ok(Term::Summer),
            "fall" => Ok(Term::Fall),
            other => Err(format!("unknown term: {other}")),
        }
    }
}

/// One (year, term) slot of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TermSelector {
    pub year: u16,
    pub term: Term,
}

impl TermSelector {
    pub fn new(year: u16, term: Term) -> Self {
        Self { year, term }
    }

    /// Enrollment-browse semester code, e.g. `2025sp`.
    pub fn semester_code(&self) -> String {
        format!("{}{}", self.year, self.term.semester_suffix())
    }
}

impl fmt::Display for TermSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.year, self.term)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub dept_id: i64,
    pub dept_code: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDepartment {
    pub dept_code: String,
    pub name: Option<String>,
}

/// Stored identity of a course, with the raw codes as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseRef {
    pub course_id: i64,
    pub dept_code: String,
    pub course_number: String,
}

impl CourseRef {
    pub fn key(&self) -> CourseKey {
        CourseKey::new(&self.dept_code, &self.course_number)
    }
}

/// Current values of every enrichable column of one course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseSnapshot {
    pub course: CourseRef,
    pub title: Option<String>,
    pub description: Option<String>,
    pub units: Option<i64>,
    pub degree_level: Option<String>,
    pub prerequisites: Option<String>,
    pub corequisites: Option<String>,
    pub designation: Option<String>,
}

impl CourseSnapshot {
    pub fn empty(course: CourseRef) -> Self {
        Self {
            course,
            title: None,
            description: None,
            units: None,
            degree_level: None,
            prerequisites: None,
            corequisites: None,
            designation: None,
        }
    }

    /// True once every outline-sourced column already holds a meaningful value.
    pub fn outline_fields_satisfied(&self) -> bool {
        self.description.is_meaningful()
            && self.units.is_meaningful()
            && self.degree_level.is_meaningful()
            && self.prerequisites.is_meaningful()
            && self.corequisites.is_meaningful()
            && self.designation.is_meaningful()
    }
}

/// Partial update of a course row. Only populated slots are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoursePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub units: Option<i64>,
    pub degree_level: Option<String>,
    pub prerequisites: Option<String>,
    pub corequisites: Option<String>,
    pub designation: Option<String>,
}

impl CoursePatch {
    pub fn is_empty(&self) -> bool {
        self.populated_columns().is_empty()
    }

    pub fn populated_columns(&self) -> Vec<&'static str> {
        let slots = [
            ("title", self.title.is_some()),
            ("description", self.description.is_some()),
            ("units", self.units.is_some()),
            ("degree_level", self.degree_level.is_some()),
            ("prerequisites", self.prerequisites.is_some()),
            ("corequisites", self.corequisites.is_some()),
            ("designation", self.designation.is_some()),
        ];
        slots
            .into_iter()
            .filter_map(|(name, set)| set.then_some(name))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiggerMapping {
    pub map_id: i64,
    pub course_id: i64,
    pub digger_course_id: i32,
}

/// Latest grade-statistics snapshot for one mapping; replaced wholesale on each fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiggerStats {
    pub map_id: i64,
    pub median_grade: Option<String>,
    pub fail_rate: Option<f64>,
    pub grade_distribution: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseStats {
    pub course_id: i64,
    pub total_enrollment: i32,
    pub total_capacity: i32,
    pub load_percent: Option<f64>,
    /// Year -> terms offered with nonzero capacity, in scan order.
    pub offered_terms: BTreeMap<String, Vec<Term>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn course_key_ignores_case_and_whitespace() {
        assert_eq!(CourseKey::new("cmpt", " 213 "), CourseKey::new("CMPT", "213"));
        assert_eq!(CourseKey::new("  Cmpt ", "213w").as_str(), "CMPT 213W");
        assert_eq!(CourseKey::from_display(" cmpt   213 "), CourseKey::new("CMPT", "213"));
    }

    #[test]
    fn course_key_exposes_normalized_number() {
        let key = CourseKey::new("macm", " 101w ");
        assert_eq!(key.course_number(), "101W");
        assert_eq!(key.to_string(), "MACM 101W");
    }

    #[test]
    fn empty_inputs_produce_an_unmatchable_key() {
        let key = CourseKey::new("", "  ");
        assert!(key.is_empty());
        assert_ne!(key, CourseKey::new("CMPT", ""));
        assert!(CourseKey::from_display("   ").is_empty());
    }

    #[test]
    fn meaningfulness_rejects_blank_and_zero_sentinels() {
        assert!(!is_meaningful(""));
        assert!(!is_meaningful("   "));
        assert!(!is_meaningful(" 0 "));
        assert!(!is_meaningful(&0i64));
        assert!(!is_meaningful(&None::<String>));
        assert!(!is_meaningful(&JsonValue::Null));
        assert!(!is_meaningful(&serde_json::json!(0)));

        assert!(is_meaningful("Intro"));
        assert!(is_meaningful(&3i64));
        assert!(is_meaningful(&Some("UGRD".to_string())));
        assert!(is_meaningful(&serde_json::json!(1234)));
    }

    #[test]
    fn meaningful_filter_drops_placeholders() {
        assert_eq!(meaningful(Some("0".to_string())), None);
        assert_eq!(meaningful(Some("B+")), Some("B+"));
        assert_eq!(meaningful::<i64>(None), None);
    }

    #[test]
    fn safe_parsers_yield_none_on_garbage() {
        assert_eq!(safe_int(" 3 "), Some(3));
        assert_eq!(safe_int("3.5"), None);
        assert_eq!(safe_int("three"), None);
        assert_eq!(safe_float("12.5"), Some(12.5));
        assert_eq!(safe_float(""), None);
    }

    #[test]
    fn enrollment_text_parses_or_degrades_to_zero() {
        assert_eq!(parse_enrollment(Some("96/100")), (96, 100));
        assert_eq!(parse_enrollment(Some(" 12 / 40 ")), (12, 40));
        assert_eq!(parse_enrollment(Some("bad")), (0, 0));
        assert_eq!(parse_enrollment(Some("1/2/3")), (0, 0));
        assert_eq!(parse_enrollment(Some("x/100")), (0, 0));
        assert_eq!(parse_enrollment(None), (0, 0));
    }

    #[test]
    fn semester_codes_follow_term_suffixes() {
        assert_eq!(TermSelector::new(2025, Term::Spring).semester_code(), "2025sp");
        assert_eq!(TermSelector::new(2024, Term::Summer).semester_code(), "2024su");
        assert_eq!(TermSelector::new(2023, Term::Fall).semester_code(), "2023fa");
        assert_eq!("FALL".parse::<Term>(), Ok(Term::Fall));
        assert!("winter".parse::<Term>().is_err());
    }

    #[test]
    fn snapshot_reports_satisfied_outline_fields() {
        let course = CourseRef {
            course_id: 1,
            dept_code: "cmpt".into(),
            course_number: "213".into(),
        };
        let mut snapshot = CourseSnapshot::empty(course);
        assert!(!snapshot.outline_fields_satisfied());

        snapshot.description = Some("Object-oriented design".into());
        snapshot.units = Some(3);
        snapshot.degree_level = Some("UGRD".into());
        snapshot.prerequisites = Some("CMPT 125".into());
        snapshot.corequisites = Some("None".into());
        snapshot.designation = Some("Q".into());
        assert!(snapshot.outline_fields_satisfied());

        snapshot.units = Some(0);
        assert!(!snapshot.outline_fields_satisfied());
    }

    #[test]
    fn patch_lists_only_populated_columns() {
        let patch = CoursePatch {
            description: Some("Intro to Data Structures".into()),
            units: Some(3),
            ..Default::default()
        };
        assert_eq!(patch.populated_columns(), vec!["description", "units"]);
        assert!(!patch.is_empty());
        assert!(CoursePatch::default().is_empty());
    }
}
