//! SQL-text artifacts in `pg_dump` plain format.
//!
//! The writer emits a `CREATE TABLE`, one `COPY ... FROM stdin;` block
//! terminated by `\.`, and a `setval` for the id sequence. The extractor
//! reads the `COPY` block for one table out of a possibly larger dump and
//! maps its columns to readings by name.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;

use crate::types::{AnomalyReason, Forecast, Measurements, Reading, ScoreResult};

/// Column order written by [`render_sql_dump`].
pub const COLUMNS: [&str; 16] = [
    "id",
    "timestamp",
    "ac_output_voltage",
    "dc_battery_voltage",
    "dc_battery_current",
    "load_power",
    "temperature",
    "is_anomaly",
    "anomaly_score",
    "anomaly_reasons",
    "predicted_dc_battery_current",
    "predicted_ac_output_voltage",
    "is_abnormal_prediction",
    "backup_triggered",
    "is_manual",
    "created_by",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("no COPY block for table '{0}'")]
    NoDataBlock(String),
    #[error("COPY block for table '{0}' is not terminated by \\.")]
    Unterminated(String),
    #[error("required column '{0}' missing from COPY header")]
    MissingColumn(&'static str),
    #[error("row {line}: {reason}")]
    MalformedRow { line: usize, reason: String },
}

/// Artifact file name for a backup taken at `at` (second resolution).
pub fn artifact_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{prefix}_{}.sql", at.format("%Y%m%d_%H%M%S"))
}

// ============================================================================
// Writer
// ============================================================================

fn quote_ident(name: &str) -> String {
    if name == "timestamp" {
        format!("\"{name}\"")
    } else {
        name.to_string()
    }
}

/// Escape one field for COPY text format.
fn copy_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

fn array_literal(items: &[String]) -> String {
    let encoded: Vec<String> = items
        .iter()
        .map(|item| {
            let needs_quotes = item.is_empty()
                || item.eq_ignore_ascii_case("null")
                || item
                    .chars()
                    .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
            if needs_quotes {
                format!("\"{}\"", item.replace('\\', "\\\\").replace('"', "\\\""))
            } else {
                item.clone()
            }
        })
        .collect();
    format!("{{{}}}", encoded.join(","))
}

const NULL: &str = "\\N";

fn bool_field(value: bool) -> String {
    if value { "t" } else { "f" }.to_string()
}

fn render_row(reading: &Reading) -> String {
    let m = &reading.measurements;
    let scoring = reading.scoring.as_ref();
    let fields: Vec<String> = vec![
        reading.id.to_string(),
        reading.timestamp.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string(),
        m.ac_output_voltage.to_string(),
        m.dc_battery_voltage.to_string(),
        m.dc_battery_current.to_string(),
        m.load_power.to_string(),
        m.temperature.to_string(),
        scoring.map_or(NULL.to_string(), |s| bool_field(s.is_anomaly)),
        scoring.map_or(NULL.to_string(), |s| s.anomaly_score.to_string()),
        scoring.map_or(NULL.to_string(), |s| {
            let codes: Vec<String> = s.reasons.iter().map(AnomalyReason::code).collect();
            copy_escape(&array_literal(&codes))
        }),
        scoring.map_or(NULL.to_string(), |s| s.forecast.dc_battery_current.to_string()),
        scoring.map_or(NULL.to_string(), |s| s.forecast.ac_output_voltage.to_string()),
        scoring.map_or(NULL.to_string(), |s| bool_field(s.is_abnormal_prediction)),
        bool_field(reading.backup_triggered),
        bool_field(reading.is_manual),
        reading
            .created_by
            .as_deref()
            .map_or(NULL.to_string(), copy_escape),
    ];
    fields.join("\t")
}

/// Full SQL text for `readings` as table `table`.
pub fn render_sql_dump(table: &str, readings: &[Reading], dumped_at: DateTime<Utc>) -> String {
    let max_id = readings.iter().map(|r| r.id).max().unwrap_or(0);
    let columns: Vec<String> = COLUMNS.iter().map(|c| quote_ident(c)).collect();

    let mut out = String::new();
    out.push_str("--\n-- gridwarden database dump\n");
    out.push_str(&format!("-- Dumped at {}\n--\n\n", dumped_at.to_rfc3339()));
    out.push_str("SET client_encoding = 'UTF8';\nSET standard_conforming_strings = on;\n\n");

    out.push_str(&format!(
        "CREATE TABLE public.{table} (\n\
         \x20   id bigint NOT NULL,\n\
         \x20   \"timestamp\" timestamp with time zone NOT NULL,\n\
         \x20   ac_output_voltage double precision NOT NULL,\n\
         \x20   dc_battery_voltage double precision NOT NULL,\n\
         \x20   dc_battery_current double precision NOT NULL,\n\
         \x20   load_power double precision NOT NULL,\n\
         \x20   temperature double precision NOT NULL,\n\
         \x20   is_anomaly boolean,\n\
         \x20   anomaly_score double precision,\n\
         \x20   anomaly_reasons text[],\n\
         \x20   predicted_dc_battery_current double precision,\n\
         \x20   predicted_ac_output_voltage double precision,\n\
         \x20   is_abnormal_prediction boolean,\n\
         \x20   backup_triggered boolean NOT NULL,\n\
         \x20   is_manual boolean NOT NULL,\n\
         \x20   created_by text\n\
         );\n\n"
    ));
    out.push_str(&format!(
        "CREATE SEQUENCE public.{table}_id_seq\n    START WITH 1\n    INCREMENT BY 1\n    NO MINVALUE\n    NO MAXVALUE\n    CACHE 1;\n\n"
    ));

    out.push_str(&format!(
        "COPY public.{table} ({}) FROM stdin;\n",
        columns.join(", ")
    ));
    for reading in readings {
        out.push_str(&render_row(reading));
        out.push('\n');
    }
    out.push_str("\\.\n\n");

    out.push_str(&format!(
        "SELECT pg_catalog.setval('public.{table}_id_seq', {}, {});\n",
        max_id.max(1),
        max_id > 0
    ));
    out
}

// ============================================================================
// Extractor
// ============================================================================

/// Rows recovered from one artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedTable {
    pub rows: Vec<Reading>,
    /// Whether a `CREATE TABLE` for the table was present.
    pub schema_found: bool,
}

/// Source column index for each reading field.
struct ColumnMap {
    id: usize,
    timestamp: usize,
    measurements: [usize; 5],
    is_anomaly: Option<usize>,
    anomaly_score: Option<usize>,
    reasons: Option<usize>,
    legacy_reason: Option<usize>,
    predicted_current: Option<usize>,
    predicted_voltage: Option<usize>,
    is_abnormal_prediction: Option<usize>,
    backup_triggered: Option<usize>,
    is_manual: Option<usize>,
    created_by: Option<usize>,
}

impl ColumnMap {
    fn resolve(header: &[String]) -> Result<Self, ArtifactError> {
        let find = |names: &[&str]| header.iter().position(|h| names.contains(&h.as_str()));
        let require = |name: &'static str| find(&[name]).ok_or(ArtifactError::MissingColumn(name));

        Ok(Self {
            id: require("id")?,
            timestamp: require("timestamp")?,
            measurements: [
                require("ac_output_voltage")?,
                require("dc_battery_voltage")?,
                require("dc_battery_current")?,
                require("load_power")?,
                require("temperature")?,
            ],
            is_anomaly: find(&["is_anomaly"]),
            anomaly_score: find(&["anomaly_score"]),
            reasons: find(&["anomaly_reasons"]),
            legacy_reason: find(&["anomaly_reason"]),
            predicted_current: find(&["predicted_dc_battery_current", "predicted_current"]),
            predicted_voltage: find(&["predicted_ac_output_voltage", "predicted_voltage"]),
            is_abnormal_prediction: find(&["is_abnormal_prediction"]),
            backup_triggered: find(&["backup_triggered"]),
            is_manual: find(&["is_manual"]),
            created_by: find(&["created_by", "created_by_id"]),
        })
    }
}

/// Undo COPY text escaping; `None` for the `\N` null marker.
fn copy_unescape(field: &str) -> Option<String> {
    if field == NULL {
        return None;
    }
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('v') => out.push('\u{b}'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Some(out)
}

/// Parse a one-dimensional text array literal; NULL elements are dropped.
fn parse_array(literal: &str) -> Option<Vec<String>> {
    let inner = literal.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut items = Vec::new();
    if inner.is_empty() {
        return Some(items);
    }

    let mut chars = inner.chars().peekable();
    loop {
        let mut item = String::new();
        let quoted = chars.peek() == Some(&'"');
        if quoted {
            chars.next();
            loop {
                match chars.next()? {
                    '\\' => item.push(chars.next()?),
                    '"' => break,
                    c => item.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                item.push(c);
                chars.next();
            }
        }
        if quoted || !item.eq_ignore_ascii_case("null") {
            items.push(item);
        }
        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(_) => return None,
        }
    }
    Some(items)
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|t| t.and_utc())
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "t" | "true" | "1" => Some(true),
        "f" | "false" | "0" => Some(false),
        _ => None,
    }
}

struct RowParser<'a> {
    fields: Vec<Option<String>>,
    line: usize,
    header: &'a [String],
}

impl RowParser<'_> {
    fn malformed(&self, reason: String) -> ArtifactError {
        ArtifactError::MalformedRow { line: self.line, reason }
    }

    fn text(&self, idx: Option<usize>) -> Option<&str> {
        idx.and_then(|i| self.fields[i].as_deref())
    }

    fn required_text(&self, idx: usize) -> Result<&str, ArtifactError> {
        self.fields[idx]
            .as_deref()
            .ok_or_else(|| self.malformed(format!("column '{}' is null", self.header[idx])))
    }

    fn float(&self, idx: usize) -> Result<f64, ArtifactError> {
        let text = self.required_text(idx)?;
        text.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| self.malformed(format!("column '{}': bad number '{text}'", self.header[idx])))
    }

    fn optional_float(&self, idx: Option<usize>) -> Result<Option<f64>, ArtifactError> {
        match idx {
            Some(i) if self.fields[i].is_some() => self.float(i).map(Some),
            _ => Ok(None),
        }
    }

    fn optional_bool(&self, idx: Option<usize>) -> Result<Option<bool>, ArtifactError> {
        match self.text(idx) {
            Some(text) => parse_bool(text)
                .map(Some)
                .ok_or_else(|| self.malformed(format!("bad boolean '{text}'"))),
            None => Ok(None),
        }
    }

    fn reasons(&self, map: &ColumnMap) -> Result<Vec<AnomalyReason>, ArtifactError> {
        if let Some(text) = self.text(map.reasons) {
            let items = parse_array(text)
                .ok_or_else(|| self.malformed(format!("bad reason array '{text}'")))?;
            return Ok(items.iter().map(|code| AnomalyReason::from_code(code)).collect());
        }
        match self.text(map.legacy_reason) {
            Some(text) if text.starts_with('{') => Ok(parse_array(text)
                .unwrap_or_default()
                .iter()
                .map(|code| AnomalyReason::from_code(code))
                .collect()),
            Some(text) if !text.trim().is_empty() => Ok(vec![AnomalyReason::from_code(text.trim())]),
            _ => Ok(Vec::new()),
        }
    }

    fn reading(&self, map: &ColumnMap) -> Result<Reading, ArtifactError> {
        let id_text = self.required_text(map.id)?;
        let id = id_text
            .parse::<u64>()
            .map_err(|_| self.malformed(format!("bad id '{id_text}'")))?;
        let ts_text = self.required_text(map.timestamp)?;
        let timestamp =
            parse_timestamp(ts_text).ok_or_else(|| self.malformed(format!("bad timestamp '{ts_text}'")))?;

        let [ac, batt_v, batt_i, load, temp] = map.measurements;
        let measurements = Measurements {
            ac_output_voltage: self.float(ac)?,
            dc_battery_voltage: self.float(batt_v)?,
            dc_battery_current: self.float(batt_i)?,
            load_power: self.float(load)?,
            temperature: self.float(temp)?,
        };

        let score = self.optional_float(map.anomaly_score)?;
        let predicted_current = self.optional_float(map.predicted_current)?;
        let predicted_voltage = self.optional_float(map.predicted_voltage)?;
        let scoring = match (score, predicted_current, predicted_voltage) {
            (Some(anomaly_score), Some(current), Some(voltage)) => Some(ScoreResult {
                is_anomaly: self.optional_bool(map.is_anomaly)?.unwrap_or(anomaly_score < 0.0),
                anomaly_score,
                reasons: self.reasons(map)?,
                forecast: Forecast {
                    dc_battery_current: current,
                    ac_output_voltage: voltage,
                },
                is_abnormal_prediction: self.optional_bool(map.is_abnormal_prediction)?.unwrap_or(false),
            }),
            _ => None,
        };

        Ok(Reading {
            id,
            timestamp,
            measurements,
            scoring,
            backup_triggered: self.optional_bool(map.backup_triggered)?.unwrap_or(false),
            is_manual: self.optional_bool(map.is_manual)?.unwrap_or(false),
            created_by: self.text(map.created_by).map(str::to_string),
        })
    }
}

/// Pull the rows for `table` out of a SQL dump.
pub fn extract_table(sql: &str, table: &str) -> Result<ExtractedTable, ArtifactError> {
    let table_pattern = format!(r#"(?:public\.)?"?{}"?"#, regex::escape(table));
    let copy_re = Regex::new(&format!(
        r"(?m)^COPY\s+{table_pattern}\s*\(([^)]*)\)\s+FROM\s+stdin;[ \t]*\r?$"
    ))
    .map_err(|e| ArtifactError::MalformedRow { line: 0, reason: e.to_string() })?;
    let schema_re = Regex::new(&format!(r"(?m)^CREATE TABLE\s+{table_pattern}\s*\("))
        .map_err(|e| ArtifactError::MalformedRow { line: 0, reason: e.to_string() })?;

    let captures = copy_re
        .captures(sql)
        .ok_or_else(|| ArtifactError::NoDataBlock(table.to_string()))?;
    let (Some(whole), Some(columns)) = (captures.get(0), captures.get(1)) else {
        return Err(ArtifactError::NoDataBlock(table.to_string()));
    };

    let header: Vec<String> = columns
        .as_str()
        .split(',')
        .map(|c| c.trim().trim_matches('"').to_string())
        .collect();
    let map = ColumnMap::resolve(&header)?;

    let header_line = sql[..whole.start()].lines().count() + 1;
    let body = sql[whole.end()..].strip_prefix('\n').unwrap_or(&sql[whole.end()..]);

    let mut rows = Vec::new();
    let mut terminated = false;
    for (offset, raw_line) in body.lines().enumerate() {
        let line = raw_line.trim_end_matches('\r');
        if line == "\\." {
            terminated = true;
            break;
        }
        let parser = RowParser {
            fields: line.split('\t').map(copy_unescape).collect(),
            line: header_line + offset + 1,
            header: &header,
        };
        if parser.fields.len() != header.len() {
            return Err(parser.malformed(format!(
                "expected {} fields, found {}",
                header.len(),
                parser.fields.len()
            )));
        }
        rows.push(parser.reading(&map)?);
    }
    if !terminated {
        return Err(ArtifactError::Unterminated(table.to_string()));
    }

    Ok(ExtractedTable {
        rows,
        schema_found: schema_re.is_match(sql),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Feature;
    use chrono::TimeZone;

    fn reading(id: u64, scored: bool) -> Reading {
        Reading {
            id,
            timestamp: Utc.with_ymd_and_hms(2025, 5, 3, 21, 0, id as u32).unwrap(),
            measurements: Measurements {
                ac_output_voltage: 229.5,
                dc_battery_voltage: 24.1,
                dc_battery_current: 9.75,
                load_power: 1012.0,
                temperature: 35.2,
            },
            scoring: scored.then(|| ScoreResult {
                is_anomaly: true,
                anomaly_score: -0.42,
                reasons: vec![
                    AnomalyReason::Overheating,
                    AnomalyReason::Deviation(Feature::LoadPower),
                    AnomalyReason::Other("operator note, with \"quotes\"".to_string()),
                ],
                forecast: Forecast { dc_battery_current: 10.5, ac_output_voltage: 230.25 },
                is_abnormal_prediction: false,
            }),
            backup_triggered: scored,
            is_manual: !scored,
            created_by: (!scored).then(|| "tab\there".to_string()),
        }
    }

    #[test]
    fn test_artifact_name() {
        let at = Utc.with_ymd_and_hms(2025, 5, 3, 21, 0, 56).unwrap();
        assert_eq!(artifact_name("energy_data", at), "energy_data_20250503_210056.sql");
    }

    #[test]
    fn test_dump_then_extract_preserves_rows() {
        let rows = vec![reading(1, true), reading(2, false), reading(7, true)];
        let sql = render_sql_dump("energy_readings", &rows, Utc::now());
        assert!(sql.contains("SELECT pg_catalog.setval('public.energy_readings_id_seq', 7, true);"));

        let extracted = extract_table(&sql, "energy_readings").unwrap();
        assert!(extracted.schema_found);
        assert_eq!(extracted.rows, rows);
    }

    #[test]
    fn test_extracts_only_the_requested_table() {
        let sql = "\
COPY public.auth_user (id, username) FROM stdin;
1\tadmin
\\.

COPY public.monitoring_energylog (id, \"timestamp\", ac_output_voltage, dc_battery_voltage, dc_battery_current, load_power, temperature, predicted_current, predicted_voltage, is_abnormal_prediction, anomaly_score, is_anomaly, anomaly_reason, backup_triggered, is_manual, created_by_id) FROM stdin;
3\t2025-05-03 21:00:56.123456+03\t228.1\t23.9\t10.2\t990.5\t\\N\t\\N\t\\N\tf\t\\N\tf\t\\N\tf\tf\t\\N
4\t2025-05-03 21:15:56+03\t150.2\t18.1\t14.0\t3500\t55.1\t17.2\t221.0\tt\t-0.61\tt\tLow voltage\tt\tt\t1
\\.
";
        // a null temperature cannot be restored
        let err = extract_table(sql, "monitoring_energylog").unwrap_err();
        assert!(matches!(err, ArtifactError::MalformedRow { line: 6, .. }));

        let sql = sql.replacen("990.5\t\\N", "990.5\t34.0", 1);
        let extracted = extract_table(&sql, "monitoring_energylog").unwrap();
        assert!(!extracted.schema_found);
        assert_eq!(extracted.rows.len(), 2);

        let unscored = &extracted.rows[0];
        assert!(unscored.scoring.is_none());
        assert_eq!(
            unscored.timestamp,
            Utc.with_ymd_and_hms(2025, 5, 3, 18, 0, 56).unwrap() + chrono::Duration::microseconds(123_456)
        );

        let scored = &extracted.rows[1];
        let scoring = scored.scoring.as_ref().unwrap();
        assert!(scoring.is_anomaly && scoring.is_abnormal_prediction);
        assert_eq!(scoring.reasons, vec![AnomalyReason::Other("Low voltage".to_string())]);
        assert_eq!(scored.created_by.as_deref(), Some("1"));
    }

    #[test]
    fn test_missing_block_is_an_error() {
        let sql = "CREATE TABLE public.energy_readings (id bigint);\n";
        assert_eq!(
            extract_table(sql, "energy_readings"),
            Err(ArtifactError::NoDataBlock("energy_readings".to_string()))
        );
    }

    #[test]
    fn test_unterminated_block_is_an_error() {
        let rows = vec![reading(1, false)];
        let sql = render_sql_dump("energy_readings", &rows, Utc::now());
        let truncated = &sql[..sql.find("\\.").unwrap()];
        assert_eq!(
            extract_table(truncated, "energy_readings"),
            Err(ArtifactError::Unterminated("energy_readings".to_string()))
        );
    }

    #[test]
    fn test_array_literal_parsing() {
        assert_eq!(parse_array("{}"), Some(vec![]));
        assert_eq!(
            parse_array(r#"{a,"b c",NULL,"NULL"}"#),
            Some(vec!["a".to_string(), "b c".to_string(), "NULL".to_string()])
        );
        assert_eq!(parse_array("not an array"), None);
    }
}
