//! STAC API item search: validated parameters and a paging HTTP client.
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, TimeZone, Utc};
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use stac::Item;
use std::fmt;
use url::Url;

pub const EARTH_SEARCH_API: &str = "https://earth-search.aws.element84.com/v1/search";
pub const DEFAULT_LIMIT: u64 = 100;

const QUERY_OPERATORS: [&str; 10] = [
    "eq",
    "neq",
    "lt",
    "lte",
    "gt",
    "gte",
    "startsWith",
    "endsWith",
    "contains",
    "in",
];

fn canonical_operator(op: &str) -> Result<&'static str> {
    let op = match op {
        "==" => "eq",
        "!=" => "neq",
        "<" => "lt",
        "<=" => "lte",
        ">" => "gt",
        ">=" => "gte",
        other => other,
    };
    QUERY_OPERATORS
        .iter()
        .find(|known| **known == op)
        .copied()
        .ok_or(anyhow!(
            "Invalid query operator '{op}', expected one of {QUERY_OPERATORS:?}"
        ))
}

/// `{property: {op: value, ...}}` fragment of the query extension.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub property: String,
    pub operators: Vec<(&'static str, Value)>,
}

impl Query {
    pub fn new(property: &str, operators: Vec<(&str, Value)>) -> Result<Self> {
        let operators = operators
            .into_iter()
            .map(|(op, value)| Ok((canonical_operator(op)?, value)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            property: property.to_string(),
            operators,
        })
    }

    fn to_value(&self) -> Value {
        let ops = self
            .operators
            .iter()
            .map(|(op, value)| (op.to_string(), value.clone()))
            .collect::<Map<_, _>>();
        Value::Object(ops)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterLang {
    #[serde(rename = "cql2-text")]
    Cql2Text,
    #[serde(rename = "cql2-json")]
    Cql2Json,
}

impl fmt::Display for FilterLang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cql2Text => f.write_str("cql2-text"),
            Self::Cql2Json => f.write_str("cql2-json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Text(String),
    Json { op: String, args: Vec<Value> },
}

impl Filter {
    fn lang(&self) -> FilterLang {
        match self {
            Self::Text(_) => FilterLang::Cql2Text,
            Self::Json { .. } => FilterLang::Cql2Json,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Json { op, args } => json!({ "op": op, "args": args }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    pub direction: Direction,
}

impl SortBy {
    /// Parses `+datetime,-eo:cloud_cover`; fields without a sign sort
    /// ascending.
    pub fn parse_list(value: &str) -> Result<Vec<Self>> {
        if value.trim().is_empty() {
            bail!("Empty sortby provided");
        }
        value
            .split(',')
            .map(|part| {
                let part = part.trim();
                let (field, direction) = match part.strip_prefix('-') {
                    Some(field) => (field, Direction::Desc),
                    None => (part.strip_prefix('+').unwrap_or(part), Direction::Asc),
                };
                if field.is_empty() {
                    bail!("Empty field in sortby '{value}'");
                }
                Ok(Self {
                    field: field.to_string(),
                    direction,
                })
            })
            .collect()
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = match self.direction {
            Direction::Asc => '+',
            Direction::Desc => '-',
        };
        write!(f, "{sign}{}", self.field)
    }
}

/// Include/exclude lists of the fields extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fields {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub include: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub exclude: Vec<String>,
}

impl Fields {
    /// Parses `+id,-properties.datetime,geometry`; unsigned fields are
    /// included.
    pub fn parse(value: &str) -> Result<Self> {
        if value.trim().is_empty() {
            bail!("Empty fields provided");
        }
        let mut fields = Self::default();
        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.strip_prefix('-') {
                Some(field) => fields.exclude.push(field.to_string()),
                None => fields
                    .include
                    .push(part.strip_prefix('+').unwrap_or(part).to_string()),
            }
        }
        if fields.include.is_empty() && fields.exclude.is_empty() {
            bail!("No fields provided");
        }
        Ok(fields)
    }
}

impl fmt::Display for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .include
            .iter()
            .map(|field| format!("+{field}"))
            .chain(self.exclude.iter().map(|field| format!("-{field}")))
            .collect::<Vec<_>>();
        f.write_str(&parts.join(","))
    }
}

/// A single instant or an interval, possibly open on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datetime {
    Instant(DateTime<Utc>),
    Interval(Option<DateTime<Utc>>, Option<DateTime<Utc>>),
}

impl Datetime {
    /// Parses RFC 3339 timestamps, simple dates (`2017`, `2017-06`,
    /// `2017-06-10`) and `/`-separated ranges of them. Simple dates cover the
    /// whole year, month or day; `..` marks an open end.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if !value.contains('/') {
            return Ok(match expand_component(value)? {
                (start, Some(end)) => Self::Interval(Some(start), Some(end)),
                (instant, None) => Self::Instant(instant),
            });
        }

        let parts = value.split('/').collect::<Vec<_>>();
        if parts.len() != 2 {
            bail!("Datetime range must have 2 values, got {}", parts.len());
        }
        let first = open_or(parts[0], expand_component)?;
        let second = open_or(parts[1], expand_component)?;
        match (first, second) {
            (None, None) => bail!("Datetime range '{value}' is open on both ends"),
            (Some((start, _)), None) => Ok(Self::Interval(Some(start), None)),
            (None, Some((start, end))) => Ok(Self::Interval(None, Some(end.unwrap_or(start)))),
            // Periods are compared by their starts, so a day inside the
            // month that ends the range still counts as reversed.
            (Some((start, start_end)), Some((end_start, end))) => {
                if end_start < start {
                    warn!("Datetime range '{value}' ends before it starts, switching values");
                    return Ok(Self::Interval(
                        Some(end_start),
                        Some(start_end.unwrap_or(start)),
                    ));
                }
                Ok(Self::Interval(Some(start), Some(end.unwrap_or(end_start))))
            }
        }
    }

    pub fn range(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        match end {
            None => Self::Instant(start),
            Some(end) if end < start => {
                warn!("Datetime range ends before it starts, switching values");
                Self::Interval(Some(end), Some(start))
            }
            Some(end) => Self::Interval(Some(start), Some(end)),
        }
    }
}

impl fmt::Display for Datetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format = |dt: &Option<DateTime<Utc>>| match dt {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            None => "..".to_string(),
        };
        match self {
            Self::Instant(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Self::Interval(start, end) => write!(f, "{}/{}", format(start), format(end)),
        }
    }
}

type Expanded = (DateTime<Utc>, Option<DateTime<Utc>>);

fn open_or(part: &str, parse: fn(&str) -> Result<Expanded>) -> Result<Option<Expanded>> {
    let part = part.trim();
    if part.is_empty() || part == ".." {
        return Ok(None);
    }
    parse(part).map(Some)
}

/// Start and, for simple dates, the last second of the period.
fn expand_component(component: &str) -> Result<Expanded> {
    let re = Regex::new(
        r"^(?<year>\d{4})(-(?<month>\d{2})(-(?<day>\d{2})(?<remainder>[Tt]\d{2}:\d{2}:\d{2}(\.\d+)?(?<tz>[Zz]|[-+]\d{2}:\d{2})?)?)?)?$",
    )
    .expect("Regex pattern should always compile");
    let captures = re
        .captures(component)
        .ok_or(anyhow!("Invalid datetime component: {component}"))?;

    if captures.name("remainder").is_some() {
        let text = if captures.name("tz").is_some() {
            component.to_string()
        } else {
            format!("{component}Z")
        };
        let instant = DateTime::parse_from_rfc3339(&text)
            .with_context(|| format!("Invalid datetime component: {component}"))?
            .with_timezone(&Utc);
        return Ok((instant, None));
    }

    let number = |name: &str| captures.name(name).map(|m| m.as_str().parse::<u32>());
    let year = captures["year"].parse::<i32>()?;
    let month = number("month").transpose()?;
    let day = number("day").transpose()?;

    let invalid = || anyhow!("Invalid date: {component}");
    let (start, next) = match (month, day) {
        (Some(month), Some(day)) => {
            let start = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;
            (start, start.succ_opt().ok_or_else(invalid)?)
        }
        (Some(month), None) => {
            let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
            let next = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)
            };
            (start, next.ok_or_else(invalid)?)
        }
        _ => {
            let start = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(invalid)?;
            (start, NaiveDate::from_ymd_opt(year + 1, 1, 1).ok_or_else(invalid)?)
        }
    };
    let midnight = |date: NaiveDate| {
        date.and_hms_opt(0, 0, 0)
            .map(|dt| Utc.from_utc_datetime(&dt))
            .ok_or_else(invalid)
    };
    Ok((midnight(start)?, Some(midnight(next)? - Duration::seconds(1))))
}

/// Parameters of a STAC API item search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParameters {
    bbox: Option<Vec<f64>>,
    intersects: Option<Value>,
    datetime: Option<Datetime>,
    ids: Option<Vec<String>>,
    collections: Option<Vec<String>>,
    query: Vec<Query>,
    filter: Option<Filter>,
    filter_lang: Option<FilterLang>,
    sortby: Vec<SortBy>,
    fields: Option<Fields>,
    limit: Option<u64>,
}

impl Default for SearchParameters {
    fn default() -> Self {
        Self {
            bbox: None,
            intersects: None,
            datetime: None,
            ids: None,
            collections: None,
            query: vec![],
            filter: None,
            filter_lang: None,
            sortby: vec![],
            fields: None,
            limit: Some(DEFAULT_LIMIT),
        }
    }
}

impl SearchParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// 2D (`[w, s, e, n]`) or 3D bounding box.
    pub fn bbox(mut self, bbox: &[f64]) -> Result<Self> {
        if bbox.len() != 4 && bbox.len() != 6 {
            bail!("bbox must have 4 or 6 values, got {}", bbox.len());
        }
        if bbox.iter().any(|v| !v.is_finite()) {
            bail!("bbox values must be finite");
        }
        self.bbox = Some(bbox.to_vec());
        Ok(self)
    }

    /// GeoJSON geometry. Takes precedence over `bbox`.
    pub fn intersects(mut self, geometry: Value) -> Result<Self> {
        let kind = geometry
            .get("type")
            .and_then(Value::as_str)
            .ok_or(anyhow!("invalid intersects, GeoJSON has no type"))?;
        let has_body = match kind {
            "GeometryCollection" => geometry.get("geometries").is_some_and(Value::is_array),
            "Point" | "MultiPoint" | "LineString" | "MultiLineString" | "Polygon"
            | "MultiPolygon" => geometry.get("coordinates").is_some_and(Value::is_array),
            other => bail!("invalid intersects, unsupported geometry type '{other}'"),
        };
        if !has_body {
            bail!("invalid intersects, {kind} is missing its coordinates");
        }
        self.intersects = Some(geometry);
        Ok(self)
    }

    pub fn datetime(mut self, value: &str) -> Result<Self> {
        self.datetime = Some(Datetime::parse(value)?);
        Ok(self)
    }

    pub fn datetime_range(mut self, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        self.datetime = Some(Datetime::range(start, end));
        self
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    pub fn query(mut self, query: Query) -> Self {
        self.query.push(query);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Overrides the language inferred from the filter.
    pub fn filter_lang(mut self, lang: FilterLang) -> Self {
        self.filter_lang = Some(lang);
        self
    }

    pub fn sortby(mut self, value: &str) -> Result<Self> {
        self.sortby = SortBy::parse_list(value)?;
        Ok(self)
    }

    pub fn fields(mut self, value: &str) -> Result<Self> {
        self.fields = Some(Fields::parse(value)?);
        Ok(self)
    }

    pub fn limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    fn effective_bbox(&self) -> Option<&Vec<f64>> {
        if self.intersects.is_some() && self.bbox.is_some() {
            warn!("bbox and intersects are mutually exclusive, bbox ignored");
            return None;
        }
        self.bbox.as_ref()
    }

    fn effective_filter_lang(&self) -> Option<FilterLang> {
        self.filter_lang
            .or_else(|| self.filter.as_ref().map(Filter::lang))
    }

    fn merged_query(&self) -> Option<Value> {
        if self.query.is_empty() {
            return None;
        }
        let mut merged = Map::new();
        for q in &self.query {
            merged.insert(q.property.clone(), q.to_value());
        }
        Some(Value::Object(merged))
    }

    /// JSON body for `POST /search`.
    pub fn post_body(&self) -> Value {
        let mut out = Map::new();
        if let Some(bbox) = self.effective_bbox() {
            out.insert("bbox".to_string(), json!(bbox));
        }
        if let Some(intersects) = &self.intersects {
            out.insert("intersects".to_string(), intersects.clone());
        }
        if let Some(datetime) = &self.datetime {
            out.insert("datetime".to_string(), json!(datetime.to_string()));
        }
        if let Some(ids) = &self.ids {
            out.insert("ids".to_string(), json!(ids));
        }
        if let Some(collections) = &self.collections {
            out.insert("collections".to_string(), json!(collections));
        }
        if let Some(query) = self.merged_query() {
            out.insert("query".to_string(), query);
        }
        if let Some(filter) = &self.filter {
            out.insert("filter".to_string(), filter.to_value());
        }
        if let Some(lang) = self.effective_filter_lang() {
            out.insert("filter-lang".to_string(), json!(lang));
        }
        if !self.sortby.is_empty() {
            out.insert("sortby".to_string(), json!(self.sortby));
        }
        if let Some(fields) = &self.fields {
            out.insert("fields".to_string(), json!(fields));
        }
        if let Some(limit) = self.limit {
            out.insert("limit".to_string(), json!(limit));
        }
        Value::Object(out)
    }

    /// Query string pairs for `GET /search`.
    pub fn get_params(&self) -> Vec<(String, String)> {
        let mut out = vec![];
        let mut push = |key: &str, value: String| out.push((key.to_string(), value));
        if let Some(bbox) = self.effective_bbox() {
            let values = bbox.iter().map(|v| v.to_string()).collect::<Vec<_>>();
            push("bbox", values.join(","));
        }
        if let Some(intersects) = &self.intersects {
            push("intersects", intersects.to_string());
        }
        if let Some(datetime) = &self.datetime {
            push("datetime", datetime.to_string());
        }
        if let Some(ids) = &self.ids {
            push("ids", ids.join(","));
        }
        if let Some(collections) = &self.collections {
            push("collections", collections.join(","));
        }
        if let Some(query) = self.merged_query() {
            push("query", query.to_string());
        }
        if let Some(filter) = &self.filter {
            let value = match filter {
                Filter::Text(text) => text.clone(),
                json => json.to_value().to_string(),
            };
            push("filter", value);
        }
        if let Some(lang) = self.effective_filter_lang() {
            push("filter-lang", lang.to_string());
        }
        if !self.sortby.is_empty() {
            let values = self.sortby.iter().map(|s| s.to_string()).collect::<Vec<_>>();
            push("sortby", values.join(","));
        }
        if let Some(fields) = &self.fields {
            push("fields", fields.to_string());
        }
        if let Some(limit) = self.limit {
            push("limit", limit.to_string());
        }
        out
    }
}

/// Anything that answers item searches.
pub trait SearchProvider {
    async fn search(&self, params: &SearchParameters) -> Result<Vec<Item>>;
}

/// STAC API client that POSTs searches and follows `next` links.
#[derive(Debug, Clone)]
pub struct StacApiClient {
    client: reqwest::Client,
    endpoint: Url,
    max_items: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    features: Vec<Item>,
    #[serde(default)]
    links: Vec<PageLink>,
}

#[derive(Debug, Deserialize)]
struct PageLink {
    rel: String,
    href: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    merge: bool,
}

enum NextRequest {
    Get(Url),
    Post(Url, Value),
}

impl StacApiClient {
    pub fn new(client: reqwest::Client, endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint).with_context(|| format!("Invalid endpoint {endpoint}"))?;
        Ok(Self {
            client,
            endpoint,
            max_items: None,
        })
    }

    pub fn earth_search(client: reqwest::Client) -> Result<Self> {
        Self::new(client, EARTH_SEARCH_API)
    }

    /// Stops paging once this many items were collected.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    async fn fetch_page(&self, request: &NextRequest) -> Result<Page> {
        let builder = match request {
            NextRequest::Get(url) => self.client.get(url.clone()),
            NextRequest::Post(url, body) => self.client.post(url.clone()).json(body),
        };
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Search failed with HTTP {status}: {text}");
        }
        Ok(response.json::<Page>().await?)
    }

    fn next_request(&self, page: &Page, previous: &NextRequest) -> Result<Option<NextRequest>> {
        let Some(link) = page.links.iter().find(|l| l.rel == "next") else {
            return Ok(None);
        };
        let url = self
            .endpoint
            .join(&link.href)
            .with_context(|| format!("Invalid next link {}", link.href))?;
        let post = link
            .method
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("POST"));
        if !post {
            return Ok(Some(NextRequest::Get(url)));
        }
        let body = match (&link.body, previous) {
            (Some(Value::Object(next)), NextRequest::Post(_, Value::Object(prev))) if link.merge => {
                let mut merged = prev.clone();
                merged.extend(next.clone());
                Value::Object(merged)
            }
            (Some(body), _) => body.clone(),
            (None, NextRequest::Post(_, prev)) => prev.clone(),
            (None, NextRequest::Get(_)) => Value::Object(Map::new()),
        };
        Ok(Some(NextRequest::Post(url, body)))
    }
}

impl SearchProvider for StacApiClient {
    async fn search(&self, params: &SearchParameters) -> Result<Vec<Item>> {
        let mut items = vec![];
        let mut request = NextRequest::Post(self.endpoint.clone(), params.post_body());
        loop {
            let page = self.fetch_page(&request).await?;
            debug!("Search page returned {} item(s)", page.features.len());
            items.extend(page.features.iter().cloned());
            if let Some(max) = self.max_items {
                if items.len() >= max {
                    items.truncate(max);
                    break;
                }
            }
            if page.features.is_empty() {
                break;
            }
            match self.next_request(&page, &request)? {
                Some(next) => request = next,
                None => break,
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_simple_dates_expand() {
        assert_eq!(
            Datetime::parse("2017").unwrap().to_string(),
            "2017-01-01T00:00:00Z/2017-12-31T23:59:59Z"
        );
        assert_eq!(
            Datetime::parse("2020-02").unwrap().to_string(),
            "2020-02-01T00:00:00Z/2020-02-29T23:59:59Z"
        );
        assert_eq!(
            Datetime::parse("2017-06-10").unwrap().to_string(),
            "2017-06-10T00:00:00Z/2017-06-10T23:59:59Z"
        );
    }

    #[test]
    fn test_ranges_expand_to_period_end() {
        assert_eq!(
            Datetime::parse("2017/2018").unwrap().to_string(),
            "2017-01-01T00:00:00Z/2018-12-31T23:59:59Z"
        );
        assert_eq!(
            Datetime::parse("2017-06/2017-07").unwrap().to_string(),
            "2017-06-01T00:00:00Z/2017-07-31T23:59:59Z"
        );
        assert_eq!(
            Datetime::parse("2017-06-10/..").unwrap().to_string(),
            "2017-06-10T00:00:00Z/.."
        );
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(
            Datetime::parse("2024-05-04T19:59:29Z").unwrap(),
            Datetime::Instant(utc("2024-05-04T19:59:29Z"))
        );
        // No timezone means UTC
        assert_eq!(
            Datetime::parse("2024-05-04T19:59:29").unwrap(),
            Datetime::Instant(utc("2024-05-04T19:59:29Z"))
        );
        assert_eq!(
            Datetime::parse("2024-05-04T21:59:29+02:00").unwrap().to_string(),
            "2024-05-04T19:59:29Z"
        );
    }

    #[test]
    fn test_reversed_range_is_switched() {
        assert_eq!(
            Datetime::parse("2018/2017").unwrap().to_string(),
            "2017-01-01T00:00:00Z/2018-12-31T23:59:59Z"
        );
        // The month starts before the day, so the range is switched
        assert_eq!(
            Datetime::parse("2017-06-15/2017-06").unwrap().to_string(),
            "2017-06-01T00:00:00Z/2017-06-15T23:59:59Z"
        );
        assert_eq!(
            Datetime::parse("2017-06-01/2017-06").unwrap().to_string(),
            "2017-06-01T00:00:00Z/2017-06-30T23:59:59Z"
        );
        let start = utc("2020-01-02T00:00:00Z");
        let end = utc("2020-01-01T00:00:00Z");
        assert_eq!(
            Datetime::range(start, Some(end)),
            Datetime::Interval(Some(end), Some(start))
        );
    }

    #[test]
    fn test_invalid_datetimes() {
        assert!(Datetime::parse("20170").is_err());
        assert!(Datetime::parse("2017-13").is_err());
        assert!(Datetime::parse("2017-02-30").is_err());
        assert!(Datetime::parse("2017/2018/2019").is_err());
        assert!(Datetime::parse("../..").is_err());
    }

    #[test]
    fn test_query_operators() {
        let query = Query::new(
            "eo:cloud_cover",
            vec![(">=", json!(0)), ("<", json!(10))],
        )
        .unwrap();
        assert_eq!(query.to_value(), json!({"gte": 0, "lt": 10}));
        assert!(Query::new("eo:cloud_cover", vec![("~", json!(1))]).is_err());
    }

    #[test]
    fn test_sortby_and_fields() {
        let sortby = SortBy::parse_list("+datetime,-eo:cloud_cover,id").unwrap();
        assert_eq!(sortby[1].direction, Direction::Desc);
        assert_eq!(sortby[2].direction, Direction::Asc);
        assert_eq!(sortby[0].to_string(), "+datetime");
        assert!(SortBy::parse_list("").is_err());

        let fields = Fields::parse("datetime,-geometry,+id").unwrap();
        assert_eq!(fields.include, vec!["datetime", "id"]);
        assert_eq!(fields.exclude, vec!["geometry"]);
        assert_eq!(fields.to_string(), "+datetime,+id,-geometry");
        assert!(Fields::parse(",").is_err());
    }

    #[test]
    fn test_post_body() {
        let params = SearchParameters::new()
            .collections(["sentinel-2-c1-l2a"])
            .ids(["S2A_T08VPH_20240504T195929_L2A"])
            .bbox(&[-135.0, 58.0, -134.0, 59.0])
            .unwrap()
            .datetime("2024-05")
            .unwrap()
            .sortby("-datetime")
            .unwrap()
            .filter(Filter::Text("eo:cloud_cover < 10".to_string()));

        assert_eq!(
            params.post_body(),
            json!({
                "bbox": [-135.0, 58.0, -134.0, 59.0],
                "datetime": "2024-05-01T00:00:00Z/2024-05-31T23:59:59Z",
                "ids": ["S2A_T08VPH_20240504T195929_L2A"],
                "collections": ["sentinel-2-c1-l2a"],
                "filter": "eo:cloud_cover < 10",
                "filter-lang": "cql2-text",
                "sortby": [{"field": "datetime", "direction": "desc"}],
                "limit": 100
            })
        );
    }

    #[test]
    fn test_intersects_overrides_bbox() {
        let params = SearchParameters::new()
            .bbox(&[0.0, 0.0, 1.0, 1.0])
            .unwrap()
            .intersects(json!({"type": "Point", "coordinates": [0.5, 0.5]}))
            .unwrap()
            .limit(None);
        let body = params.post_body();
        assert!(body.get("bbox").is_none());
        assert_eq!(body["intersects"]["type"], "Point");
        assert!(body.get("limit").is_none());
    }

    #[test]
    fn test_invalid_geometry() {
        assert!(SearchParameters::new().intersects(json!({"coordinates": []})).is_err());
        assert!(SearchParameters::new()
            .intersects(json!({"type": "Polygon"}))
            .is_err());
        assert!(SearchParameters::new().bbox(&[0.0, 1.0]).is_err());
    }

    #[test]
    fn test_get_params() {
        let params = SearchParameters::new()
            .collections(["a", "b"])
            .bbox(&[1.0, 2.0, 3.5, 4.0])
            .unwrap()
            .fields("id,-assets")
            .unwrap()
            .query(Query::new("eo:cloud_cover", vec![("<=", json!(5))]).unwrap())
            .filter(Filter::Json {
                op: "=".to_string(),
                args: vec![json!({"property": "platform"}), json!("sentinel-2a")],
            });
        let get = params.get_params();
        let lookup = |key: &str| get.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        assert_eq!(lookup("collections"), Some("a,b"));
        assert_eq!(lookup("bbox"), Some("1,2,3.5,4"));
        assert_eq!(lookup("fields"), Some("+id,-assets"));
        assert_eq!(lookup("query"), Some(r#"{"eo:cloud_cover":{"lte":5}}"#));
        assert_eq!(lookup("filter-lang"), Some("cql2-json"));
        assert_eq!(lookup("limit"), Some("100"));
    }
}
